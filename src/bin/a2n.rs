/// Interactive console for nested Apple II archives and disk images

use a2nest::*;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Command completer for the REPL
struct CommandCompleter {
    commands: Vec<&'static str>,
}

impl CommandCompleter {
    fn new() -> Self {
        Self {
            commands: vec![
                "add", "close", "depth", "exit", "export", "extract", "help", "import", "info",
                "ls", "open", "quit", "save", "select", "settings", "tree",
            ],
        }
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        // Only complete the command name
        let line_to_cursor = &line[..pos];
        if line_to_cursor.contains(' ') {
            return Ok((pos, vec![]));
        }

        let prefix = line_to_cursor.to_lowercase();
        let matches: Vec<Pair> = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(&prefix))
            .map(|cmd| Pair {
                display: cmd.to_string(),
                replacement: cmd.to_string(),
            })
            .collect();

        Ok((0, matches))
    }
}

impl Hinter for CommandCompleter {
    type Hint = String;
}

impl Highlighter for CommandCompleter {}
impl Validator for CommandCompleter {}
impl Helper for CommandCompleter {}

type Console = Editor<CommandCompleter, rustyline::history::DefaultHistory>;

/// Get the path to the history file
fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|mut p| {
        p.push(".a2nest_history");
        p
    })
}

struct Session {
    tree: ContainerTree,
    settings: Settings,
    current: Option<NodeId>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    println!("=== a2nest ===");
    println!("Interactive console for nested Apple II archives and disk images.");
    println!("Type 'help' for available commands\n");

    let settings = match Settings::default_path() {
        Some(path) => Settings::load(&path).unwrap_or_else(|e| {
            println!("Settings ignored: {}", e);
            Settings::default()
        }),
        None => Settings::default(),
    };

    let mut rl: Console = match Editor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Failed to create editor: {}", e);
            return;
        }
    };
    rl.set_helper(Some(CommandCompleter::new()));

    if let Some(history_path) = history_path() {
        let _ = rl.load_history(&history_path);
    }

    let mut session = Session {
        tree: ContainerTree::new(settings.scan_options()),
        settings,
        current: None,
    };

    loop {
        let input = match rl.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input);

        let parts = parse_command_line(input);
        if parts.is_empty() {
            continue;
        }
        let command = parts[0].to_lowercase();
        let args = &parts[1..];

        let result = match command.as_str() {
            "help" => {
                print_help();
                Ok(())
            }
            "quit" | "exit" => break,
            "open" => open(&mut session, args),
            "tree" => {
                print_tree(&session);
                Ok(())
            }
            "select" => select(&mut session, args),
            "info" => info(&session),
            "ls" | "dir" | "cat" => list(&session),
            "add" | "import" => add(&mut session, &mut rl, &command, args),
            "extract" | "export" => extract(&mut session, &mut rl, &command, args),
            "save" => save(&mut session),
            "close" => close(&mut session),
            "depth" => depth(&mut session, args),
            "settings" => show_settings(&session, args),
            _ => {
                println!("Unknown command: '{}'. Type 'help' for available commands.", command);
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("Error: {}", e);
        }
        report_events(&mut session.tree);
    }

    if let Some(history_path) = history_path() {
        let _ = rl.save_history(&history_path);
    }
    if let Err(e) = session.tree.close_all() {
        println!("Not everything was closed: {}", e);
    }
    println!("Goodbye!");
}

fn require_node(session: &Session) -> Option<NodeId> {
    if session.current.is_none() {
        println!("Nothing selected. Use 'open <path>' or 'select <n>' first.");
    }
    session.current
}

fn open(session: &mut Session, args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        println!("Usage: open <path>");
        return Ok(());
    };
    let root = session.tree.open_file(path)?;
    println!(
        "Opened: {} ({} nodes)",
        session.tree.name(root)?,
        session.tree.node_count()
    );
    session.current = Some(root);
    Ok(())
}

/// Nodes in display order, with their nesting level
fn listing(tree: &ContainerTree) -> Vec<(NodeId, usize)> {
    fn walk(tree: &ContainerTree, id: NodeId, level: usize, out: &mut Vec<(NodeId, usize)>) {
        out.push((id, level));
        if let Ok(children) = tree.children(id) {
            for &child in children {
                walk(tree, child, level + 1, out);
            }
        }
    }
    let mut out = Vec::new();
    for &root in tree.roots() {
        walk(tree, root, 0, &mut out);
    }
    out
}

fn print_tree(session: &Session) {
    let nodes = listing(&session.tree);
    if nodes.is_empty() {
        println!("Nothing open.");
        return;
    }
    for (index, (id, level)) in nodes.into_iter().enumerate() {
        let marker = if Some(id) == session.current { '*' } else { ' ' };
        match session.tree.info(id) {
            Ok(info) => println!(
                "{}{:>3} {}{} [{}] {}{}",
                marker,
                index,
                "  ".repeat(level),
                info.name,
                info.label,
                info.status,
                if info.read_only { " (read-only)" } else { "" }
            ),
            Err(e) => println!("{}{:>3} {}<{}>", marker, index, "  ".repeat(level), e),
        }
    }
}

fn select(session: &mut Session, args: &[String]) -> Result<()> {
    let Some(index) = args.first().and_then(|s| s.parse::<usize>().ok()) else {
        println!("Usage: select <n>  (numbers from 'tree')");
        return Ok(());
    };
    match listing(&session.tree).get(index) {
        Some(&(id, _)) => {
            session.current = Some(id);
            println!("Selected: {}", session.tree.name(id)?);
        }
        None => println!("No node {}", index),
    }
    Ok(())
}

fn info(session: &Session) -> Result<()> {
    let Some(node) = require_node(session) else {
        return Ok(());
    };
    let info = session.tree.info(node)?;
    println!("Name: {}", info.name);
    println!("Type: {}", info.label);
    println!("Status: {}", info.status);
    println!("Read-only: {}", if info.read_only { "Yes" } else { "No" });
    println!("State: {:?}", info.state);
    println!("Owns stream: {}", if info.owns_stream { "Yes" } else { "No" });
    println!("Children: {}", info.children.len());
    println!("Saves: {}", session.tree.save_count(node)?);
    for note in &info.notes {
        println!("  {}", note);
    }
    Ok(())
}

fn list(session: &Session) -> Result<()> {
    let Some(node) = require_node(session) else {
        return Ok(());
    };
    session.tree.inspect(node, |container| -> Result<()> {
        match container {
            Container::Archive(archive) => {
                println!("{:<40} {:>4} {:>6} {:>9} {:>9}", "Name", "Type", "Aux", "Data", "Rsrc");
                println!("{}", "-".repeat(72));
                for entry in archive.entries() {
                    println!(
                        "{:<40} ${:02X}  ${:04X} {:>9} {:>9}{}",
                        entry.name,
                        entry.file_type,
                        entry.aux_type,
                        entry.data_len,
                        entry.rsrc_len.map(|n| n.to_string()).unwrap_or_default(),
                        if entry.is_disk_image { " (disk)" } else { "" }
                    );
                }
            }
            Container::FileSystem(fs) => {
                let info = fs.info();
                println!(
                    "{} volume {}",
                    info.fs_type,
                    info.volume_name.unwrap_or_else(|| "(unknown)".to_string())
                );
                println!("{:<40} {:>4} {:>6} {:>9} {:>9}", "Name", "Type", "Aux", "Data", "Rsrc");
                println!("{}", "-".repeat(72));
                for entry in fs.read_dir()? {
                    let attrs = entry.attributes;
                    println!(
                        "{:<40} ${:02X}  ${:04X} {:>9} {:>9}{}",
                        entry.path,
                        attrs.file_type,
                        attrs.aux_type,
                        if entry.is_directory { String::from("<DIR>") } else { entry.data_len.to_string() },
                        entry.rsrc_len.map(|n| n.to_string()).unwrap_or_default(),
                        if attrs.locked { " L" } else { "" }
                    );
                }
                println!(
                    "{} of {} blocks free",
                    info.free_blocks, info.total_blocks
                );
            }
            Container::MultiPartitionMap(map) => {
                println!("{}; use 'tree' to see its partitions", map.kind().name());
            }
            other => println!("{} has no files; use 'tree' to see what it holds", other.type_label()),
        }
        Ok(())
    })?
}

fn add(session: &mut Session, rl: &mut Console, command: &str, args: &[String]) -> Result<()> {
    let Some(node) = require_node(session) else {
        return Ok(());
    };
    if args.is_empty() {
        println!("Usage: {} <host path>... [--to <dir>]", command);
        return Ok(());
    }
    let mut host_paths = Vec::new();
    let mut target_dir = String::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--to" {
            target_dir = iter.next().cloned().unwrap_or_default();
        } else {
            host_paths.push(PathBuf::from(arg));
        }
    }
    let kind = if command == "import" {
        TransferKind::Import { host_paths }
    } else {
        TransferKind::Add { host_paths }
    };
    let job = TransferJob::new(kind, session.settings.transfer_flags()).with_target_dir(target_dir);
    run_job(session, rl, node, job)
}

fn extract(session: &mut Session, rl: &mut Console, command: &str, args: &[String]) -> Result<()> {
    let Some(node) = require_node(session) else {
        return Ok(());
    };
    let Some((dest, entries)) = args.split_first() else {
        println!("Usage: {} <dest dir> [entry]...", command);
        return Ok(());
    };
    let dest_dir = PathBuf::from(dest);
    let entries = entries.to_vec();
    let kind = if command == "export" {
        TransferKind::Export { entries, dest_dir }
    } else {
        TransferKind::Extract { entries, dest_dir }
    };
    let job = TransferJob::new(kind, session.settings.transfer_flags());
    run_job(session, rl, node, job)
}

/// Run a job, answering its queries at the prompt
fn run_job(session: &mut Session, rl: &mut Console, node: NodeId, job: TransferJob) -> Result<()> {
    let handle = session.tree.submit(node, job)?;
    for event in handle.events() {
        match event {
            WorkerEvent::Progress(progress) => {
                println!("[{:>3}%] {}", progress.percent, progress.path);
            }
            WorkerEvent::Query(query) => {
                let decision = ask(rl, &query);
                query.answer(decision);
            }
        }
    }
    let outcome = session.tree.complete_job(handle)?;
    println!(
        "Completed: {}, skipped: {}, failed: {}{}{}",
        outcome.completed,
        outcome.skipped,
        outcome.failed,
        if outcome.cancelled { ", cancelled" } else { "" },
        if outcome.rolled_back { ", rolled back" } else { "" }
    );
    for error in &outcome.errors {
        println!("  {}", error);
    }
    Ok(())
}

fn ask(rl: &mut Console, query: &ConflictQuery) -> Decision {
    println!("{}: {}", query.path(), query.message());
    let proceed = query.kind().proceed_label();
    let prompt = format!("[{}/skip/cancel] ", proceed);
    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                let answer = line.trim().to_lowercase();
                if answer == proceed || answer == "o" || answer == "y" || answer == "yes" {
                    return Decision::Overwrite;
                }
                match answer.as_str() {
                    "s" | "skip" | "n" | "no" => return Decision::Skip,
                    "c" | "cancel" => return Decision::Cancel,
                    _ => println!("Please answer {}, skip or cancel", proceed),
                }
            }
            Err(_) => return Decision::Cancel,
        }
    }
}

fn save(session: &mut Session) -> Result<()> {
    let Some(node) = require_node(session) else {
        return Ok(());
    };
    session.tree.save_updates(node, session.settings.compress)?;
    println!("Saved {}", session.tree.name(node)?);
    Ok(())
}

fn close(session: &mut Session) -> Result<()> {
    let Some(node) = require_node(session) else {
        return Ok(());
    };
    let parent = session.tree.parent(node)?;
    session.tree.detach(node)?;
    session.current = parent.or_else(|| session.tree.roots().first().copied());
    Ok(())
}

fn depth(session: &mut Session, args: &[String]) -> Result<()> {
    match args.first() {
        None => println!("Depth: {:?}", session.settings.depth),
        Some(name) => match DepthPolicy::parse(name) {
            Some(policy) => {
                session.settings.depth = policy;
                session.tree.set_options(session.settings.scan_options());
                println!("Depth: {:?} (applies to files opened from now on)", policy);
            }
            None => println!("Usage: depth [shallow|sub-volume|max]"),
        },
    }
    Ok(())
}

fn show_settings(session: &Session, args: &[String]) -> Result<()> {
    if args.first().map(String::as_str) == Some("save") {
        let Some(path) = Settings::default_path() else {
            println!("No configuration directory");
            return Ok(());
        };
        match session.settings.save(&path) {
            Ok(()) => println!("Saved to {}", path.display()),
            Err(e) => println!("Error: {}", e),
        }
    } else {
        match session.settings.to_toml() {
            Ok(text) => print!("{}", text),
            Err(e) => println!("Error: {}", e),
        }
    }
    Ok(())
}

fn report_events(tree: &mut ContainerTree) {
    for event in tree.take_events() {
        match event {
            TreeEvent::NodeAdded { .. } => {}
            TreeEvent::NodeRemoved { node } => tracing::debug!(?node, "node removed"),
            TreeEvent::StatusChanged { node, status, read_only } => {
                if let Ok(name) = tree.name(node) {
                    println!(
                        "{} is now {}{}",
                        name,
                        status,
                        if read_only { " (read-only)" } else { "" }
                    );
                }
            }
        }
    }
}

fn parse_command_line(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => {
                current.push(ch);
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

fn print_help() {
    println!("Available commands:");
    println!("  open <path>                     - Open a file and expand what is nested inside");
    println!("  tree                            - Show open nodes, numbered (* marks the selection)");
    println!("  select <n>                      - Select a node by its number in 'tree'");
    println!("  info                            - Show the selected node");
    println!("  ls                              - List entries of the selected archive or volume");
    println!("  add <path>... [--to <dir>]      - Add host files to the selected node");
    println!("  import <path>... [--to <dir>]   - Add host files, converting text to Apple II form");
    println!("  extract <dir> [entry]...        - Copy entries to a host directory");
    println!("  export <dir> [entry]...         - Copy entries out, converting text to host form");
    println!("  save                            - Save changes through to the host file");
    println!("  close                           - Close the selected node and everything below it");
    println!("  depth [shallow|sub-volume|max]  - Show or set automatic expansion depth");
    println!("  settings [save]                 - Show settings, or save them");
    println!("  help                            - Show this help");
    println!("  quit, exit                      - Exit");
}

/// The transfer worker: runs one job against a locked update chain

use super::channel::{ConflictKind, Decision, WorkerChannel};
use super::host::{self, HostSource, PreserveMode, MAX_HOST_NAME_LEN};
use super::{TransferJob, TransferKind, TransferOutcome};
use crate::archive::appledouble::AppleDouble;
use crate::archive::{Archive, NewEntry, Part};
use crate::error::{ContainerError, Result};
use crate::filesystem::{FileAttributes, FileSystem};
use crate::format::FILE_TYPE_TXT;
use crate::tree::node::{Container, NodeCore, NodeState, SharedCore};
use crate::tree::update;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use tracing::{debug, info, warn};

/// What happened to one entry
enum Step {
    Done,
    /// Done, in place of an entry added earlier by the same job
    Replaced,
    Skipped,
    Cancel,
}

/// Run `job`; `chain` runs from the target node up to its root
///
/// Per-entry problems end up in the outcome. Only broken invariants are
/// returned as errors.
pub(crate) fn run(job: TransferJob, chain: Vec<SharedCore>, channel: WorkerChannel) -> Result<TransferOutcome> {
    let mut guards = Vec::with_capacity(chain.len());
    for core in &chain {
        guards.push(
            core.lock()
                .map_err(|_| ContainerError::invariant("node lock poisoned"))?,
        );
    }
    if guards.is_empty() {
        return Err(ContainerError::invariant("transfer without a target"));
    }

    let mut worker = Worker {
        job: &job,
        channel: &channel,
        outcome: TransferOutcome::default(),
        processed: 0,
        total: 0,
    };
    match &job.kind {
        TransferKind::Add { host_paths } => worker.add(host_paths, false, &mut guards)?,
        TransferKind::Import { host_paths } => worker.add(host_paths, true, &mut guards)?,
        TransferKind::Extract { entries, dest_dir } => {
            worker.extract(entries, dest_dir, false, &mut guards[0].container)?
        }
        TransferKind::Export { entries, dest_dir } => {
            worker.extract(entries, dest_dir, true, &mut guards[0].container)?
        }
    }
    Ok(worker.outcome)
}

fn save_chain(guards: &mut [MutexGuard<'_, NodeCore>], compress: bool) -> Result<()> {
    let mut refs: Vec<&mut NodeCore> = guards.iter_mut().map(|g| &mut **g).collect();
    update::propagate(&mut refs, compress)
}

/// An entry to copy out of a container
struct SourceEntry {
    index: usize,
    path: String,
    components: Vec<String>,
    part: Part,
    file_type: u8,
    aux_type: u16,
    has_rsrc: bool,
    locked: bool,
    is_disk_image: bool,
}

fn selected(filter: &[String], path: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let path = path.to_ascii_lowercase();
    filter.iter().any(|f| {
        let f = f.trim_matches('/').replace(':', "/").to_ascii_lowercase();
        path == f || path.starts_with(&format!("{}/", f))
    })
}

fn list_entries(container: &Container, filter: &[String]) -> Result<Vec<SourceEntry>> {
    let mut out = Vec::new();
    match container {
        Container::Archive(archive) => {
            let separator = archive.path_separator();
            for (index, entry) in archive.entries().iter().enumerate() {
                if entry.is_directory {
                    continue;
                }
                let components: Vec<String> = entry
                    .name
                    .split(separator)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                let path = components.join("/");
                if components.is_empty() || !selected(filter, &path) {
                    continue;
                }
                out.push(SourceEntry {
                    index,
                    path,
                    components,
                    part: entry.main_part(),
                    file_type: entry.file_type,
                    aux_type: entry.aux_type,
                    has_rsrc: entry.rsrc_len.is_some(),
                    locked: entry.locked,
                    is_disk_image: entry.is_disk_image,
                });
            }
        }
        Container::FileSystem(fs) => {
            for (index, entry) in fs.read_dir()?.into_iter().enumerate() {
                if entry.is_directory || !selected(filter, &entry.path) {
                    continue;
                }
                out.push(SourceEntry {
                    index,
                    components: entry.path.split('/').map(str::to_string).collect(),
                    path: entry.path,
                    part: Part::DataFork,
                    file_type: entry.attributes.file_type,
                    aux_type: entry.attributes.aux_type,
                    has_rsrc: entry.rsrc_len.is_some(),
                    locked: entry.attributes.locked,
                    is_disk_image: false,
                });
            }
        }
        other => {
            return Err(ContainerError::invariant(format!(
                "no entries to copy from a {}",
                other.type_label()
            )))
        }
    }
    Ok(out)
}

fn read_part(container: &mut Container, item: &SourceEntry, part: Part, raw: bool) -> Result<Vec<u8>> {
    match container {
        Container::Archive(archive) => archive.read_part(item.index, part),
        Container::FileSystem(fs) => fs.read_fork(&item.path, part, raw),
        other => Err(ContainerError::invariant(format!("cannot read from a {}", other.type_label()))),
    }
}

struct Worker<'a> {
    job: &'a TransferJob,
    channel: &'a WorkerChannel,
    outcome: TransferOutcome,
    processed: usize,
    total: usize,
}

impl Worker<'_> {
    fn ask(&self, kind: ConflictKind, path: &str, message: String) -> Decision {
        self.channel.progress(self.processed, self.total, path);
        self.channel.ask(kind, path, message)
    }

    fn finish_entry(&mut self, path: &str) {
        self.processed = self.job.advance();
        self.channel.progress(self.processed, self.total, path);
    }

    fn record(&mut self, path: &str, step: Result<Step>) -> bool {
        match step {
            Ok(Step::Done) => self.outcome.completed += 1,
            Ok(Step::Replaced) => debug!(path, "replaced an entry added earlier"),
            Ok(Step::Skipped) => {
                debug!(path, "skipped");
                self.outcome.skipped += 1;
            }
            Ok(Step::Cancel) => {
                self.outcome.cancelled = true;
                return false;
            }
            Err(e) => self.outcome.fail(path, e),
        }
        true
    }

    /// Names inside the container for a host source
    fn dest_components(&self, source: &HostSource) -> Vec<String> {
        let mut components: Vec<String> = self
            .job
            .target_dir
            .split(|c: char| c == '/' || c == ':')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if self.job.flags.strip_paths {
            components.extend(source.components.last().cloned());
        } else {
            components.extend(source.components.iter().cloned());
        }
        components
    }

    fn add(&mut self, paths: &[PathBuf], convert: bool, guards: &mut [MutexGuard<'_, NodeCore>]) -> Result<()> {
        let (sources, failures) = host::collect_sources(paths, self.job.flags.recurse, self.job.flags.preserve);
        for (path, e) in failures {
            self.outcome.fail(&path.display().to_string(), e);
        }
        self.total = sources.len();

        if guards[0].container.as_archive_mut().is_some() {
            self.add_to_archive(&sources, convert, guards)
        } else if guards[0].container.as_filesystem_mut().is_some() {
            self.add_to_filesystem(&sources, convert, guards)
        } else {
            Err(ContainerError::invariant(format!(
                "cannot add files to a {}",
                guards[0].container.type_label()
            )))
        }
    }

    fn add_to_archive(
        &mut self,
        sources: &[HostSource],
        convert: bool,
        guards: &mut [MutexGuard<'_, NodeCore>],
    ) -> Result<()> {
        {
            let archive = guards[0]
                .container
                .as_archive_mut()
                .ok_or_else(|| ContainerError::invariant("archive target changed"))?;
            if self.outcome.failed == 0 {
                if let Err(e) = archive.start_transaction() {
                    self.outcome.fail("(transaction)", e);
                }
            }
            if self.outcome.failed == 0 {
                let separator = archive.path_separator().to_string();
                for source in sources {
                    if self.channel.is_cancelled() {
                        self.outcome.cancelled = true;
                        break;
                    }
                    let name = self.dest_components(source).join(&separator);
                    let step = self.add_archive_entry(archive, source, &name, convert);
                    let failed = step.is_err();
                    if !self.record(&name, step) || failed {
                        break;
                    }
                    self.finish_entry(&name);
                }
            }

            if self.outcome.cancelled || self.outcome.failed > 0 {
                archive.cancel_transaction();
                info!(staged = self.outcome.completed, "archive transaction rolled back");
                self.outcome.completed = 0;
                self.outcome.rolled_back = true;
                return Ok(());
            }
        }

        match save_chain(guards, self.job.flags.compress) {
            Ok(()) => self.outcome.saved = true,
            Err(e) => {
                if let Some(archive) = guards[0].container.as_archive_mut() {
                    archive.cancel_transaction();
                }
                self.outcome.fail("(save)", e);
                self.outcome.completed = 0;
                self.outcome.rolled_back = true;
            }
        }
        Ok(())
    }

    fn add_archive_entry(
        &self,
        archive: &mut dyn Archive,
        source: &HostSource,
        name: &str,
        convert: bool,
    ) -> Result<Step> {
        let loaded = source.load()?;
        let (data, types) = if convert {
            (host::to_apple_text(&loaded.data), Some((FILE_TYPE_TXT, 0)))
        } else {
            (loaded.data, loaded.types)
        };

        let mut rsrc = loaded.rsrc;
        if rsrc.is_some() && !archive.supports_rsrc() {
            let message = format!("{} cannot store the resource fork of {}", archive.kind().name(), name);
            match self.ask(ConflictKind::ResourceForkIgnored, name, message) {
                Decision::Overwrite => rsrc = None,
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        }

        let mut step = Step::Done;
        if archive.is_staged(name) {
            let message = format!("{} was already added by this job", name);
            match self.ask(ConflictKind::NameCollision, name, message) {
                Decision::Overwrite => {
                    archive.unstage(name);
                    step = Step::Replaced;
                }
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        } else if let Some(index) = archive.find_entry(name) {
            match self.ask(ConflictKind::NameCollision, name, format!("{} already exists", name)) {
                Decision::Overwrite => archive.delete_entry(index)?,
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        }

        let mut entry = NewEntry::file(name, data);
        if let Some((file_type, aux_type)) = types {
            entry = entry.with_types(file_type, aux_type);
        }
        if let Some(rsrc) = rsrc {
            entry = entry.with_rsrc(rsrc);
        }
        archive.add_entry(entry)?;
        Ok(step)
    }

    fn add_to_filesystem(
        &mut self,
        sources: &[HostSource],
        convert: bool,
        guards: &mut [MutexGuard<'_, NodeCore>],
    ) -> Result<()> {
        let mut changed = false;
        {
            let fs = guards[0]
                .container
                .as_filesystem_mut()
                .ok_or_else(|| ContainerError::invariant("filesystem target changed"))?;
            for source in sources {
                if self.channel.is_cancelled() {
                    self.outcome.cancelled = true;
                    break;
                }
                let shown = self.dest_components(source).join("/");
                let step = self.add_file(fs, source, convert);
                changed |= matches!(step, Ok(Step::Done));
                if !self.record(&shown, step) {
                    break;
                }
                self.finish_entry(&shown);
            }
        }
        if changed {
            guards[0].state = NodeState::Dirty;
        }

        match save_chain(guards, self.job.flags.compress) {
            Ok(()) => self.outcome.saved = true,
            Err(e) => self.outcome.fail("(save)", e),
        }
        Ok(())
    }

    fn add_file(&self, fs: &mut dyn FileSystem, source: &HostSource, convert: bool) -> Result<Step> {
        let components = self.dest_components(source);
        let shown = components.join("/");
        if components.iter().any(|c| c.len() > fs.max_name_len()) {
            let message = format!(
                "{} allows names of at most {} characters",
                fs.fs_type(),
                fs.max_name_len()
            );
            match self.ask(ConflictKind::PathTooLong, &shown, message) {
                Decision::Overwrite => {}
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        }
        let components: Vec<String> = components.iter().map(|c| fs.adjust_name(c)).collect();
        let Some((name, dirs)) = components.split_last() else {
            return Err(ContainerError::InvalidFilename(shown));
        };
        let dir = dirs.join("/");
        let path = if dir.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", dir, name)
        };

        let loaded = source.load()?;
        let (data, types) = if convert {
            (host::to_apple_text(&loaded.data), Some((FILE_TYPE_TXT, 0)))
        } else {
            (loaded.data, loaded.types)
        };

        let existing = fs.find(&path)?;
        if let Some(existing) = &existing {
            if existing.is_directory {
                return Err(ContainerError::FileExists(path));
            }
            match self.ask(ConflictKind::NameCollision, &path, format!("{} already exists", path)) {
                Decision::Overwrite => {}
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        }

        let (file_type, aux_type) = types.unwrap_or((0, 0));
        let attributes = FileAttributes {
            file_type,
            aux_type,
            locked: false,
        };
        if existing.is_some() {
            fs.replace_file(&path, &attributes, &data, loaded.rsrc.as_deref())?;
            return Ok(Step::Done);
        }

        let mut first_missing = None;
        for depth in 1..=dirs.len() {
            if fs.find(&dirs[..depth].join("/"))?.is_none() {
                first_missing = Some(depth);
                break;
            }
        }
        if !dir.is_empty() {
            fs.create_directory(&dir)?;
        }
        if let Err(e) = fs.write_file(&dir, name, &attributes, &data, loaded.rsrc.as_deref()) {
            if let Some(first) = first_missing {
                for depth in (first..=dirs.len()).rev() {
                    let created = dirs[..depth].join("/");
                    if let Err(e) = fs.delete_file(&created) {
                        warn!(path = %created, error = %e, "unable to remove directory");
                    }
                }
            }
            return Err(e);
        }
        Ok(Step::Done)
    }

    fn extract(&mut self, filter: &[String], dest_dir: &Path, export: bool, container: &mut Container) -> Result<()> {
        let items = match list_entries(container, filter) {
            Ok(items) => items,
            Err(e @ ContainerError::Invariant(_)) => return Err(e),
            Err(e) => {
                self.outcome.fail("(directory)", e);
                return Ok(());
            }
        };
        self.total = items.len();

        for item in &items {
            if self.channel.is_cancelled() {
                self.outcome.cancelled = true;
                break;
            }
            let step = self.extract_one(container, item, dest_dir, export);
            if !self.record(&item.path, step) {
                break;
            }
            self.finish_entry(&item.path);
        }
        Ok(())
    }

    fn extract_one(&self, container: &mut Container, item: &SourceEntry, dest_dir: &Path, export: bool) -> Result<Step> {
        let flags = self.job.flags;
        let mut components = if flags.strip_paths {
            item.components.last().cloned().into_iter().collect()
        } else {
            item.components.clone()
        };
        let Some(base) = components.pop() else {
            return Err(ContainerError::InvalidFilename(item.path.clone()));
        };
        let base = if item.is_disk_image && !base.contains('.') {
            format!("{}.po", base)
        } else {
            base
        };
        let mut file_name = match flags.preserve {
            PreserveMode::Naps => host::naps_name(&base, item.file_type, item.aux_type, false),
            _ => base,
        };

        if components.iter().chain(std::iter::once(&file_name)).any(|c| c.len() > MAX_HOST_NAME_LEN) {
            let message = format!("host names are limited to {} bytes", MAX_HOST_NAME_LEN);
            match self.ask(ConflictKind::PathTooLong, &item.path, message) {
                Decision::Overwrite => {
                    components = components.iter().map(|c| host::truncate_host_name(c)).collect();
                    file_name = host::truncate_host_name(&file_name);
                }
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        }

        let dir = host::resolve_under(dest_dir, &components, &item.path)?;
        let dest = host::resolve_under(&dir, std::slice::from_ref(&file_name), &item.path)?;
        if dest.exists() {
            let message = format!("{} already exists", dest.display());
            match self.ask(ConflictKind::NameCollision, &item.path, message) {
                Decision::Overwrite => {}
                Decision::Skip => return Ok(Step::Skipped),
                Decision::Cancel => return Ok(Step::Cancel),
            }
        }

        let mut rsrc = None;
        if item.has_rsrc {
            if flags.preserve == PreserveMode::None {
                let message = format!("resource fork of {} will not be kept", item.path);
                match self.ask(ConflictKind::ResourceForkIgnored, &item.path, message) {
                    Decision::Overwrite => {}
                    Decision::Skip => return Ok(Step::Skipped),
                    Decision::Cancel => return Ok(Step::Cancel),
                }
            } else {
                rsrc = Some(read_part(container, item, Part::RsrcFork, flags.raw)?);
            }
        }

        let mut data = read_part(container, item, item.part, flags.raw)?;
        if export && item.file_type == FILE_TYPE_TXT {
            data = host::to_host_text(&data);
        }

        fs::create_dir_all(&dir)?;
        fs::write(&dest, &data)?;
        match flags.preserve {
            PreserveMode::Naps => {
                if let Some(rsrc) = &rsrc {
                    let rsrc_name = host::naps_name(
                        file_name.split('#').next().unwrap_or(&file_name),
                        item.file_type,
                        item.aux_type,
                        true,
                    );
                    fs::write(dir.join(rsrc_name), rsrc)?;
                }
            }
            PreserveMode::AppleDouble => {
                let companion = AppleDouble {
                    file_type: item.file_type,
                    aux_type: item.aux_type,
                    access: if item.locked { 0x21 } else { 0xE3 },
                    rsrc,
                };
                let name = format!("{}{}", host::APPLEDOUBLE_PREFIX, file_name);
                fs::write(dir.join(name), companion.to_bytes())?;
            }
            PreserveMode::None => {}
        }
        debug!(path = %item.path, dest = %dest.display(), "extracted");

        if item.locked {
            if let Err(e) = set_read_only(&dest) {
                warn!(path = %dest.display(), error = %e, "unable to set attributes");
                let message = format!("unable to mark {} read-only: {}", dest.display(), e);
                return Ok(match self.ask(ConflictKind::AttributeFailure, &item.path, message) {
                    Decision::Overwrite => Step::Done,
                    Decision::Skip => Step::Skipped,
                    Decision::Cancel => Step::Cancel,
                });
            }
        }
        Ok(Step::Done)
    }
}

fn set_read_only(path: &Path) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

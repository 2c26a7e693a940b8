/// Integration tests for background transfer jobs

mod common;

use a2nest::archive::appledouble::AppleDouble;
use a2nest::*;
use common::*;
use std::fs;
use tempfile::TempDir;

fn add_job(paths: Vec<std::path::PathBuf>) -> TransferJob {
    TransferJob::new(TransferKind::Add { host_paths: paths }, TransferFlags::default())
}

fn no_queries(query: &ConflictQuery) -> Decision {
    panic!("unexpected query for {}: {}", query.path(), query.message());
}

/// A ProDOS volume in a tree, holding C.TXT
fn volume_with_c() -> (SharedStream, ContainerTree, NodeId) {
    let stream = SharedStream::from_bytes(prodos_bytes("WORK"));
    let mut tree = ContainerTree::default();
    tree.open_stream(stream.clone(), "work.po").unwrap();
    let fs = tree.find_node_by_path(&["work.po", "WORK"]).unwrap();
    tree.edit(fs, |container| {
        let fs = container.as_filesystem_mut().unwrap();
        fs.write_file("", "C.TXT", &FileAttributes::default(), b"original c", None)
    })
    .unwrap();
    tree.save_updates(fs, true).unwrap();
    (stream, tree, fs)
}

#[test]
fn test_add_three_files_to_empty_nufx() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(
        dir.path(),
        &[("a.txt", b"first"), ("b.txt", b"second"), ("c.txt", b"third")],
    );
    let stream = nufx_with(Vec::new());
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "new.shk").unwrap();

    let (outcome, seen) = run_job(&mut tree, root, add_job(paths), no_queries);
    assert_eq!(outcome.completed, 3);
    assert!(outcome.is_success());
    assert!(outcome.saved);
    assert!(queries(&seen).is_empty());
    assert_eq!(tree.save_count(root).unwrap(), 1);
    assert_eq!(tree.state(root).unwrap(), NodeState::Saved);

    let mut reopened = NufxArchive::open(stream).unwrap();
    let names: Vec<_> = reopened.entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    let b = reopened.find_entry("B.TXT").unwrap();
    assert_eq!(reopened.read_part(b, Part::DataFork).unwrap(), b"second");
}

#[test]
fn test_collision_skip_leaves_archive_unchanged() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(dir.path(), &[("a.txt", b"replacement")]);
    let stream = nufx_with(vec![NewEntry::file("a.txt", b"original".to_vec())]);
    let before = stream.read_all().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "keep.shk").unwrap();

    let (outcome, seen) = run_job(&mut tree, root, add_job(paths), |_| Decision::Skip);
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "a.txt".to_string())]);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.completed, 0);
    assert!(outcome.is_success());
    assert_eq!(stream.read_all().unwrap(), before);
}

#[test]
fn test_cancel_rolls_back_archive() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(
        dir.path(),
        &[("a.txt", b"first"), ("b.txt", b"second"), ("c.txt", b"third")],
    );
    let stream = nufx_with(vec![NewEntry::file("c.txt", b"existing".to_vec())]);
    let before = stream.read_all().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "undo.shk").unwrap();

    let (outcome, seen) = run_job(&mut tree, root, add_job(paths), |_| Decision::Cancel);
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "c.txt".to_string())]);
    assert!(outcome.cancelled);
    assert!(outcome.rolled_back);
    assert!(!outcome.saved);
    assert_eq!(outcome.completed, 0);
    assert_eq!(stream.read_all().unwrap(), before);
    assert_eq!(tree.save_count(root).unwrap(), 0);

    // the archive is usable again once the job is gone
    let entries = tree
        .inspect(root, |c| match c {
            Container::Archive(a) => (a.entries().len(), a.in_transaction()),
            other => panic!("unexpected container {:?}", other),
        })
        .unwrap();
    assert_eq!(entries, (1, false));
}

#[test]
fn test_cancel_keeps_filesystem_progress() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(
        dir.path(),
        &[("a.txt", b"first"), ("b.txt", b"second"), ("c.txt", b"third")],
    );
    let (stream, mut tree, fs) = volume_with_c();

    let (outcome, seen) = run_job(&mut tree, fs, add_job(paths), |_| Decision::Cancel);
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "C.TXT".to_string())]);
    assert!(outcome.cancelled);
    assert!(!outcome.rolled_back);
    assert!(outcome.saved);
    assert_eq!(outcome.completed, 2);

    tree.close_all().unwrap();
    let mut reopened = ContainerTree::default();
    reopened.open_stream(stream, "work.po").unwrap();
    let fs = reopened.find_node_by_path(&["work.po", "WORK"]).unwrap();
    assert_eq!(fs_paths(&reopened, fs), vec!["A.TXT", "B.TXT", "C.TXT"]);
    assert_eq!(read_fs_file(&reopened, fs, "A.TXT"), b"first");
    assert_eq!(read_fs_file(&reopened, fs, "C.TXT"), b"original c");
}

#[test]
fn test_filesystem_add_into_directory() {
    let dir = TempDir::new().unwrap();
    host_files(
        dir.path(),
        &[("docs/readme", b"read me"), ("docs/sub/notes", b"notes")],
    );
    let stream = SharedStream::from_bytes(prodos_bytes("FILES"));
    let mut tree = ContainerTree::default();
    tree.open_stream(stream.clone(), "files.po").unwrap();
    let fs = tree.find_node_by_path(&["files.po", "FILES"]).unwrap();

    let job = add_job(vec![dir.path().join("docs")]).with_target_dir("TOP");
    let (outcome, _) = run_job(&mut tree, fs, job, no_queries);
    assert_eq!(outcome.completed, 2);
    assert!(outcome.saved);
    tree.close_all().unwrap();

    let mut reopened = ContainerTree::default();
    reopened.open_stream(stream, "files.po").unwrap();
    let fs = reopened.find_node_by_path(&["files.po", "FILES"]).unwrap();
    assert_eq!(
        fs_paths(&reopened, fs),
        vec![
            "TOP",
            "TOP/DOCS",
            "TOP/DOCS/README",
            "TOP/DOCS/SUB",
            "TOP/DOCS/SUB/NOTES"
        ]
    );
    assert_eq!(read_fs_file(&reopened, fs, "TOP/DOCS/SUB/NOTES"), b"notes");
}

#[test]
fn test_strip_paths_flattens_names() {
    let dir = TempDir::new().unwrap();
    host_files(dir.path(), &[("nested/deeper/file.bin", b"x")]);
    let stream = nufx_with(Vec::new());
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "flat.shk").unwrap();

    let flags = TransferFlags {
        strip_paths: true,
        ..TransferFlags::default()
    };
    let job = TransferJob::new(
        TransferKind::Add {
            host_paths: vec![dir.path().join("nested")],
        },
        flags,
    );
    let (outcome, _) = run_job(&mut tree, root, job, no_queries);
    assert_eq!(outcome.completed, 1);

    let archive = NufxArchive::open(stream).unwrap();
    assert_eq!(archive.entries()[0].name, "file.bin");
}

#[test]
fn test_queries_follow_progress_in_order() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(
        dir.path(),
        &[("a.txt", b"1"), ("b.txt", b"2"), ("c.txt", b"3")],
    );
    let stream = nufx_with(vec![
        NewEntry::file("a.txt", b"old".to_vec()),
        NewEntry::file("c.txt", b"old".to_vec()),
    ]);
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "order.shk").unwrap();

    let mut answered = Vec::new();
    let (outcome, seen) = run_job(&mut tree, root, add_job(paths), |q| {
        answered.push(q.path().to_string());
        Decision::Overwrite
    });
    assert_eq!(answered, vec!["a.txt", "c.txt"]);
    assert_eq!(outcome.completed, 3);

    let mut last_processed = 0;
    for (i, event) in seen.iter().enumerate() {
        match event {
            Seen::Progress { processed, .. } => {
                assert!(*processed >= last_processed);
                last_processed = *processed;
            }
            Seen::Query { path, .. } => {
                // each query is announced by a progress event for the same entry
                assert!(matches!(&seen[i - 1], Seen::Progress { path: p, .. } if p == path));
            }
        }
    }
    assert_eq!(last_processed, 3);

    let mut archive = NufxArchive::open(stream).unwrap();
    let c = archive.find_entry("c.txt").unwrap();
    assert_eq!(archive.read_part(c, Part::DataFork).unwrap(), b"3");
}

#[test]
fn test_second_job_is_rejected_while_busy() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(dir.path(), &[("a.txt", b"new")]);
    let stream = nufx_with(vec![NewEntry::file("a.txt", b"old".to_vec())]);
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream, "busy.shk").unwrap();

    let handle = tree.submit(root, add_job(paths.clone())).unwrap();
    // wait until the worker is blocked on the collision
    let query = loop {
        match handle.events().recv().unwrap() {
            WorkerEvent::Query(query) => break query,
            WorkerEvent::Progress(_) => {}
        }
    };

    assert!(matches!(tree.submit(root, add_job(paths)), Err(ContainerError::Busy(_))));
    assert!(matches!(tree.detach(root), Err(ContainerError::Busy(_))));
    assert!(matches!(tree.save_updates(root, true), Err(ContainerError::Busy(_))));

    query.answer(Decision::Skip);
    for _ in handle.events() {}
    let outcome = tree.complete_job(handle).unwrap();
    assert_eq!(outcome.skipped, 1);
    tree.detach(root).unwrap();
}

#[test]
fn test_dropped_query_cancels() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(dir.path(), &[("a.txt", b"new")]);
    let stream = nufx_with(vec![NewEntry::file("a.txt", b"old".to_vec())]);
    let before = stream.read_all().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "drop.shk").unwrap();

    let handle = tree.submit(root, add_job(paths)).unwrap();
    for event in handle.events() {
        drop(event);
    }
    let outcome = tree.complete_job(handle).unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.rolled_back);
    assert_eq!(stream.read_all().unwrap(), before);
}

#[test]
fn test_disk_image_node_rejects_jobs() {
    let mut tree = ContainerTree::default();
    let image = tree
        .open_stream(SharedStream::from_bytes(prodos_bytes("DISK")), "disk.po")
        .unwrap();
    let job = add_job(Vec::new());
    assert!(matches!(tree.submit(image, job), Err(ContainerError::Unsupported(_))));
}

#[test]
fn test_import_and_export_convert_text() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(dir.path(), &[("notes.txt", b"one\ntwo\r\nthree\n")]);
    let stream = nufx_with(Vec::new());
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "text.shk").unwrap();

    let import = TransferJob::new(TransferKind::Import { host_paths: paths }, TransferFlags::default());
    let (outcome, _) = run_job(&mut tree, root, import, no_queries);
    assert_eq!(outcome.completed, 1);
    let entry = tree
        .inspect(root, |c| match c {
            Container::Archive(a) => a.entries()[0].clone(),
            other => panic!("unexpected container {:?}", other),
        })
        .unwrap();
    assert_eq!(entry.file_type, 0x04);

    let exported = dir.path().join("exported");
    let export = TransferJob::new(
        TransferKind::Export {
            entries: Vec::new(),
            dest_dir: exported.clone(),
        },
        TransferFlags::default(),
    );
    let (outcome, _) = run_job(&mut tree, root, export, no_queries);
    assert_eq!(outcome.completed, 1);
    assert_eq!(fs::read(exported.join("notes.txt")).unwrap(), b"one\ntwo\nthree\n");

    let extracted = dir.path().join("extracted");
    let extract = TransferJob::new(
        TransferKind::Extract {
            entries: vec!["NOTES.TXT".to_string()],
            dest_dir: extracted.clone(),
        },
        TransferFlags::default(),
    );
    let (outcome, _) = run_job(&mut tree, root, extract, no_queries);
    assert_eq!(outcome.completed, 1);
    assert_eq!(fs::read(extracted.join("notes.txt")).unwrap(), b"one\rtwo\rthree\r");
}

fn tool_archive() -> SharedStream {
    nufx_with(vec![NewEntry::file("TOOL", vec![0xEA; 64])
        .with_types(0x06, 0x2000)
        .with_rsrc(vec![1, 2, 3])])
}

fn extract_job(dest: &std::path::Path, preserve: PreserveMode) -> TransferJob {
    let flags = TransferFlags {
        preserve,
        ..TransferFlags::default()
    };
    TransferJob::new(
        TransferKind::Extract {
            entries: Vec::new(),
            dest_dir: dest.to_path_buf(),
        },
        flags,
    )
}

#[test]
fn test_extract_with_naps_names() {
    let dir = TempDir::new().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(tool_archive(), "tool.shk").unwrap();

    let (outcome, _) = run_job(&mut tree, root, extract_job(dir.path(), PreserveMode::Naps), no_queries);
    assert_eq!(outcome.completed, 1);
    assert_eq!(fs::read(dir.path().join("TOOL#062000")).unwrap(), vec![0xEA; 64]);
    assert_eq!(fs::read(dir.path().join("TOOL#062000r")).unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_extract_with_appledouble_companion() {
    let dir = TempDir::new().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(tool_archive(), "tool.shk").unwrap();

    let (outcome, _) = run_job(
        &mut tree,
        root,
        extract_job(dir.path(), PreserveMode::AppleDouble),
        no_queries,
    );
    assert_eq!(outcome.completed, 1);
    assert_eq!(fs::read(dir.path().join("TOOL")).unwrap(), vec![0xEA; 64]);
    let companion = AppleDouble::parse(&fs::read(dir.path().join("._TOOL")).unwrap()).unwrap();
    assert_eq!(companion.file_type, 0x06);
    assert_eq!(companion.aux_type, 0x2000);
    assert_eq!(companion.rsrc, Some(vec![1, 2, 3]));
}

#[test]
fn test_extract_without_preservation_asks_about_rsrc() {
    let dir = TempDir::new().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(tool_archive(), "tool.shk").unwrap();

    let (outcome, seen) = run_job(
        &mut tree,
        root,
        extract_job(dir.path(), PreserveMode::None),
        |_| Decision::Overwrite,
    );
    assert_eq!(queries(&seen), vec![(ConflictKind::ResourceForkIgnored, "TOOL".to_string())]);
    assert_eq!(outcome.completed, 1);
    assert_eq!(fs::read(dir.path().join("TOOL")).unwrap(), vec![0xEA; 64]);
    assert!(!dir.path().join("._TOOL").exists());
}

#[test]
fn test_extract_collision_with_host_file() {
    let dir = TempDir::new().unwrap();
    host_files(dir.path(), &[("a.txt", b"host copy")]);
    let stream = nufx_with(vec![NewEntry::file("a.txt", b"archive copy".to_vec())]);
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream, "out.shk").unwrap();

    let (outcome, seen) = run_job(&mut tree, root, extract_job(dir.path(), PreserveMode::None), |_| {
        Decision::Skip
    });
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "a.txt".to_string())]);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"host copy");
}

#[test]
fn test_extract_from_nested_filesystem() {
    let dir = TempDir::new().unwrap();
    let (_stream, mut tree, fs) = volume_with_c();
    let job = TransferJob::new(
        TransferKind::Extract {
            entries: Vec::new(),
            dest_dir: dir.path().to_path_buf(),
        },
        TransferFlags::default(),
    );
    let (outcome, _) = run_job(&mut tree, fs, job, no_queries);
    assert_eq!(outcome.completed, 1);
    assert_eq!(fs::read(dir.path().join("C.TXT")).unwrap(), b"original c");
}

/// Run a job, cancelling it through its handle as the first query arrives
fn run_cancelled_at_query(
    tree: &mut ContainerTree,
    node: NodeId,
    job: TransferJob,
    answer: Decision,
) -> (TransferOutcome, Vec<Seen>) {
    let handle = tree.submit(node, job).unwrap();
    let mut seen = Vec::new();
    for event in handle.events() {
        match event {
            WorkerEvent::Progress(p) => seen.push(Seen::Progress {
                path: p.path,
                processed: p.processed,
            }),
            WorkerEvent::Query(query) => {
                seen.push(Seen::Query {
                    kind: query.kind(),
                    path: query.path().to_string(),
                });
                handle.cancel();
                query.answer(answer);
            }
        }
    }
    let outcome = tree.complete_job(handle).unwrap();
    (outcome, seen)
}

#[test]
fn test_handle_cancel_rolls_back_archive() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(
        dir.path(),
        &[("a.txt", b"first"), ("b.txt", b"second"), ("c.txt", b"third")],
    );
    let stream = nufx_with(vec![NewEntry::file("b.txt", b"existing".to_vec())]);
    let before = stream.read_all().unwrap();
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream.clone(), "stop.shk").unwrap();

    let (outcome, seen) = run_cancelled_at_query(&mut tree, root, add_job(paths), Decision::Overwrite);
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "b.txt".to_string())]);
    assert!(!seen.iter().any(|s| matches!(s, Seen::Progress { path, .. } if path == "c.txt")));
    assert!(outcome.cancelled);
    assert!(outcome.rolled_back);
    assert!(!outcome.saved);
    assert_eq!(outcome.completed, 0);
    assert_eq!(stream.read_all().unwrap(), before);
    assert_eq!(tree.save_count(root).unwrap(), 0);
}

#[test]
fn test_handle_cancel_keeps_filesystem_progress() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(
        dir.path(),
        &[("a.txt", b"first"), ("c.txt", b"third"), ("d.txt", b"fourth")],
    );
    let (stream, mut tree, fs) = volume_with_c();

    let (outcome, seen) = run_cancelled_at_query(&mut tree, fs, add_job(paths), Decision::Skip);
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "C.TXT".to_string())]);
    assert!(outcome.cancelled);
    assert!(!outcome.rolled_back);
    assert!(outcome.saved);
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.skipped, 1);

    tree.close_all().unwrap();
    let mut reopened = ContainerTree::default();
    reopened.open_stream(stream, "work.po").unwrap();
    let fs = reopened.find_node_by_path(&["work.po", "WORK"]).unwrap();
    assert_eq!(fs_paths(&reopened, fs), vec!["A.TXT", "C.TXT"]);
    assert_eq!(read_fs_file(&reopened, fs, "C.TXT"), b"original c");
}

#[test]
fn test_extract_refuses_names_leaving_destination() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let stream = zip_with(vec![
        NewEntry::file("../escaped.txt", b"outside".to_vec()),
        NewEntry::file("safe.txt", b"inside".to_vec()),
    ]);
    let mut tree = ContainerTree::default();
    let root = tree.open_stream(stream, "slip.zip").unwrap();

    let (outcome, _) = run_job(&mut tree, root, extract_job(&out, PreserveMode::None), no_queries);
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.errors[0].path, "../escaped.txt");
    assert!(!dir.path().join("escaped.txt").exists());
    assert_eq!(fs::read(out.join("safe.txt")).unwrap(), b"inside");
}

#[test]
fn test_failed_overwrite_keeps_original() {
    let dir = TempDir::new().unwrap();
    let replacement = vec![2u8; 200 * 1024];
    let paths = host_files(dir.path(), &[("BIG", replacement.as_slice())]);
    let stream = SharedStream::from_bytes(prodos_bytes("WORK"));
    let mut tree = ContainerTree::default();
    tree.open_stream(stream, "work.po").unwrap();
    let fs = tree.find_node_by_path(&["work.po", "WORK"]).unwrap();
    tree.edit(fs, |container| {
        let fs = container.as_filesystem_mut().unwrap();
        fs.write_file("", "BIG", &FileAttributes::default(), &vec![1u8; 40 * 1024], None)
    })
    .unwrap();
    tree.save_updates(fs, true).unwrap();

    let (outcome, seen) = run_job(&mut tree, fs, add_job(paths), |_| Decision::Overwrite);
    assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "BIG".to_string())]);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.completed, 0);
    assert!(outcome.errors[0].message.contains("Disk full"));
    assert_eq!(fs_paths(&tree, fs), vec!["BIG"]);
    assert_eq!(read_fs_file(&tree, fs, "BIG"), vec![1u8; 40 * 1024]);
}

#[test]
fn test_duplicate_names_in_one_archive_job() {
    let dir = TempDir::new().unwrap();
    let paths = host_files(dir.path(), &[("a/same.txt", b"from a"), ("b/same.txt", b"from b")]);
    let flags = TransferFlags {
        strip_paths: true,
        ..TransferFlags::default()
    };

    for (answer, expected) in [(Decision::Skip, b"from a"), (Decision::Overwrite, b"from b")] {
        let stream = nufx_with(Vec::new());
        let mut tree = ContainerTree::default();
        let root = tree.open_stream(stream.clone(), "dup.shk").unwrap();
        let job = TransferJob::new(
            TransferKind::Add {
                host_paths: paths.clone(),
            },
            flags,
        );

        let (outcome, seen) = run_job(&mut tree, root, job, |_| answer);
        assert_eq!(queries(&seen), vec![(ConflictKind::NameCollision, "same.txt".to_string())]);
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.skipped, usize::from(answer == Decision::Skip));

        let mut archive = NufxArchive::open(stream).unwrap();
        assert_eq!(archive.entries().len(), 1);
        assert_eq!(archive.read_part(0, Part::DataFork).unwrap(), expected);
    }
}

#[test]
fn test_unwritten_add_leaves_no_directories() {
    let dir = TempDir::new().unwrap();
    let (_stream, mut tree, fs) = volume_with_c();

    let long = host_files(dir.path(), &[("a-name-longer-than-fifteen", b"x")]);
    let job = add_job(long).with_target_dir("NEW/SUB");
    let (outcome, seen) = run_job(&mut tree, fs, job, |_| Decision::Skip);
    assert_eq!(queries(&seen)[0].0, ConflictKind::PathTooLong);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(fs_paths(&tree, fs), vec!["C.TXT"]);

    let data = vec![0u8; 200 * 1024];
    let huge = host_files(dir.path(), &[("HUGE", data.as_slice())]);
    let job = add_job(huge).with_target_dir("NEW/SUB");
    let (outcome, _) = run_job(&mut tree, fs, job, no_queries);
    assert_eq!(outcome.failed, 1);
    assert_eq!(fs_paths(&tree, fs), vec!["C.TXT"]);
}

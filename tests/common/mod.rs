#![allow(dead_code)]

/// Shared fixtures for the integration tests

use a2nest::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Bytes of a blank 140K ProDOS volume
pub fn prodos_bytes(volume: &str) -> Vec<u8> {
    DiskImageBuilder::new()
        .prodos(volume)
        .build()
        .expect("Failed to build image")
        .stream()
        .read_all()
        .expect("Failed to read image")
}

/// A ZIP archive holding the given entries
pub fn zip_with(entries: Vec<NewEntry>) -> SharedStream {
    let stream = SharedStream::from_bytes(Vec::new());
    let mut zip = ZipArchive::create(stream.clone()).expect("Failed to create ZIP");
    zip.start_transaction().unwrap();
    for entry in entries {
        zip.add_entry(entry).unwrap();
    }
    zip.commit_transaction(true).unwrap();
    stream
}

/// A NuFX archive holding the given entries (possibly none)
pub fn nufx_with(entries: Vec<NewEntry>) -> SharedStream {
    let stream = SharedStream::from_bytes(Vec::new());
    let mut archive = NufxArchive::create(stream.clone()).expect("Failed to create NuFX");
    archive.start_transaction().unwrap();
    for entry in entries {
        archive.add_entry(entry).unwrap();
    }
    archive.commit_transaction(true).unwrap();
    stream
}

/// Write host files into `dir` and return their paths, in order
pub fn host_files(dir: &Path, files: &[(&str, &[u8])]) -> Vec<PathBuf> {
    files
        .iter()
        .map(|(name, data)| {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, data).unwrap();
            path
        })
        .collect()
}

/// Worker event as seen by the test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Progress { path: String, processed: usize },
    Query { kind: ConflictKind, path: String },
}

/// Run a job to completion, answering every query with `answer`
pub fn run_job<F>(
    tree: &mut ContainerTree,
    node: NodeId,
    job: TransferJob,
    mut answer: F,
) -> (TransferOutcome, Vec<Seen>)
where
    F: FnMut(&ConflictQuery) -> Decision,
{
    let handle = tree.submit(node, job).expect("Failed to submit job");
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
                let decision = answer(&query);
                query.answer(decision);
            }
        }
    }
    let outcome = tree.complete_job(handle).expect("Job failed");
    (outcome, seen)
}

/// Queries raised during a job
pub fn queries(seen: &[Seen]) -> Vec<(ConflictKind, String)> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Query { kind, path } => Some((*kind, path.clone())),
            Seen::Progress { .. } => None,
        })
        .collect()
}

/// Read a file from a filesystem node
pub fn read_fs_file(tree: &ContainerTree, node: NodeId, path: &str) -> Vec<u8> {
    tree.inspect(node, |container| match container {
        Container::FileSystem(fs) => fs.read_file(path).expect("Failed to read file"),
        other => panic!("not a filesystem: {:?}", other),
    })
    .unwrap()
}

/// Sorted paths of every entry in a filesystem node
pub fn fs_paths(tree: &ContainerTree, node: NodeId) -> Vec<String> {
    let mut paths = tree
        .inspect(node, |container| match container {
            Container::FileSystem(fs) => fs.read_dir().expect("Failed to read directory"),
            other => panic!("not a filesystem: {:?}", other),
        })
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

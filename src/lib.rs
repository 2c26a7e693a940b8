/*!
# a2nest

A Rust library for opening Apple II file archives and disk images that are
nested inside one another, editing them, and moving files in and out on a
background thread.

## Features

- Identify ZIP, gzip and NuFX archives, unadorned and 2IMG disk images
- Expand nested containers automatically into a tree of nodes
- Apple Partition Maps and embedded volumes as multi-partition nodes
- ProDOS filesystem reading and writing
- Save changes from a nested node through every enclosing container
- Background add/import/extract/export jobs with conflict queries

## Quick Start

```rust,no_run
use a2nest::{ContainerTree, Decision, ScanOptions, TransferFlags, TransferJob, TransferKind, WorkerEvent};

let mut tree = ContainerTree::new(ScanOptions::default());
let root = tree.open_file("collection.zip")?;

// Walk the nodes that were found
for &child in tree.children(root)? {
    println!("{} ({})", tree.name(child)?, tree.info(child)?.label);
}

// Add host files to the first volume found inside the archive
let volume = tree.find_node_by_path(&["collection.zip", "GAMES.PO", "GAMES"]).unwrap();
let job = TransferJob::new(
    TransferKind::Add { host_paths: vec!["notes.txt".into()] },
    TransferFlags::default(),
);
let handle = tree.submit(volume, job)?;
for event in handle.events() {
    if let WorkerEvent::Query(query) = event {
        query.answer(Decision::Overwrite);
    }
}
let outcome = tree.complete_job(handle)?;
println!("{} files added", outcome.completed);
# Ok::<(), a2nest::ContainerError>(())
```

## Modules

- `format`: Format identification and constants
- `archive`: ZIP, gzip and NuFX archives
- `image`: Disk images and 2IMG headers
- `partition`: Partition maps
- `filesystem`: Filesystem implementations (ProDOS)
- `tree`: The container tree and its builder
- `transfer`: Background transfer jobs
- `error`: Error types and Result alias
*/

#![warn(missing_docs)]

/// Archive formats and transactions
pub mod archive;
/// Error types and Result alias
pub mod error;
/// Filesystem implementations (ProDOS)
pub mod filesystem;
/// Format identification and constants
pub mod format;
/// Disk images
pub mod image;
/// Streams and block access
pub mod io;
/// Diagnostic notes attached to containers
pub mod notes;
/// Partition maps
pub mod partition;
/// Persisted user settings
pub mod settings;
/// Background transfer jobs
pub mod transfer;
/// Container tree and automatic expansion
pub mod tree;

// Re-export common types
pub use archive::{Archive, ArchiveEntry, GzipArchive, NewEntry, NufxArchive, Part, ZipArchive};
pub use error::{ContainerError, IdentifyError, Result};
pub use filesystem::{DirEntry, FileAttributes, FileSystem, FileSystemInfo, ProDosFileSystem};
pub use format::{identify, FileKind, Opened, OpenedContainer, SectorOrder};
pub use image::{Contents, DiskImage, DiskImageBuilder};
pub use io::{temp_stream, SharedStream};
pub use notes::{Note, Notes, Severity};
pub use partition::{MapKind, Partition, PartitionMap};
pub use settings::{Settings, SettingsError};
pub use transfer::{
    CancelFlag, ConflictKind, ConflictQuery, Decision, EntryError, JobHandle, PreserveMode,
    ProgressEvent, TransferFlags, TransferJob, TransferKind, TransferOutcome, WorkerEvent,
};
pub use tree::{
    Container, ContainerTree, DepthPolicy, NodeId, NodeInfo, NodeState, NodeStatus, ScanOptions,
    TreeEvent,
};

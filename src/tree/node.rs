/// Node contents: the container itself, its ownership record and lifecycle state

use crate::archive::{Archive, Part};
use crate::error::Result;
use crate::filesystem::FileSystem;
use crate::image::DiskImage;
use crate::io::SharedStream;
use crate::notes::Notes;
use crate::partition::{Partition, PartitionMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// An opened container of any kind
pub enum Container {
    /// File archive
    Archive(Box<dyn Archive>),
    /// Disk image
    DiskImage(DiskImage),
    /// Filesystem found in a disk image or partition
    FileSystem(Box<dyn FileSystem>),
    /// Partition map found in a disk image or after a volume
    MultiPartitionMap(PartitionMap),
    /// One partition of a map
    Partition(Partition),
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Container({})", self.type_label())
    }
}

impl Container {
    /// Human-readable type label
    pub fn type_label(&self) -> String {
        match self {
            Container::Archive(archive) => archive.kind().name().to_string(),
            Container::DiskImage(image) => image.kind().name().to_string(),
            Container::FileSystem(fs) => fs.fs_type().to_string(),
            Container::MultiPartitionMap(map) => map.kind().name().to_string(),
            Container::Partition(_) => "Partition".to_string(),
        }
    }

    /// Validity notes recorded by the container
    pub fn notes(&self) -> &Notes {
        match self {
            Container::Archive(archive) => archive.notes(),
            Container::DiskImage(image) => image.notes(),
            Container::FileSystem(fs) => fs.notes(),
            Container::MultiPartitionMap(map) => map.notes(),
            Container::Partition(partition) => partition.notes(),
        }
    }

    /// Does the container refuse writes?
    pub fn is_read_only(&self) -> bool {
        match self {
            Container::Archive(archive) => archive.is_read_only(),
            Container::DiskImage(image) => image.is_read_only(),
            Container::FileSystem(fs) => fs.is_read_only(),
            Container::MultiPartitionMap(map) => map.notes().is_dubious(),
            Container::Partition(partition) => {
                partition.chunks().is_read_only() || partition.notes().is_dubious()
            }
        }
    }

    /// Push pending changes down to the backing stream
    ///
    /// An open archive transaction is committed.
    pub fn flush(&mut self, compress: bool) -> Result<()> {
        match self {
            Container::Archive(archive) => {
                if archive.in_transaction() {
                    archive.commit_transaction(compress)?;
                }
                Ok(())
            }
            Container::DiskImage(image) => image.flush(),
            Container::FileSystem(fs) => fs.flush(),
            Container::MultiPartitionMap(_) | Container::Partition(_) => Ok(()),
        }
    }

    /// The archive, if this is one
    pub fn as_archive_mut(&mut self) -> Option<&mut (dyn Archive + 'static)> {
        match self {
            Container::Archive(archive) => Some(archive.as_mut()),
            _ => None,
        }
    }

    /// The filesystem, if this is one
    pub fn as_filesystem_mut(&mut self) -> Option<&mut (dyn FileSystem + 'static)> {
        match self {
            Container::FileSystem(fs) => Some(fs.as_mut()),
            _ => None,
        }
    }
}

/// Node status, derived from validity notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeStatus {
    /// No problems
    Ok,
    /// Warnings were recorded
    Warning,
    /// Errors were recorded
    Error,
    /// Damage severe enough to forbid writes
    Dubious,
}

impl NodeStatus {
    /// Compute the status for a set of notes; dubious overrides everything
    pub fn from_notes(notes: &Notes) -> Self {
        if notes.is_dubious() {
            NodeStatus::Dubious
        } else if notes.error_count() > 0 {
            NodeStatus::Error
        } else if notes.warning_count() > 0 {
            NodeStatus::Warning
        } else {
            NodeStatus::Ok
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Ok => "OK",
            NodeStatus::Warning => "Warning",
            NodeStatus::Error => "Error",
            NodeStatus::Dubious => "Dubious",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Opened, no changes
    Open,
    /// Changed since the last save
    Dirty,
    /// Changes have been saved
    Saved,
    /// Removed from the tree
    Closed,
}

/// Where an owned stream came from, and so where saved bytes go back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A host file (or an in-memory stream, when there is no path)
    Host {
        /// Path of the host file
        path: Option<PathBuf>,
    },
    /// One part of an entry in the parent archive
    ArchiveEntry {
        /// Entry name in the parent archive
        name: String,
        /// Part holding the bytes
        part: Part,
    },
    /// A file in the parent filesystem
    FileSystemFile {
        /// Path of the file in the parent filesystem
        path: String,
    },
}

impl Origin {
    /// Is this the end of an update chain?
    pub fn is_host(&self) -> bool {
        matches!(self, Origin::Host { .. })
    }
}

/// The resources a node exclusively owns
#[derive(Debug)]
pub struct Ownership {
    /// Backing stream
    pub stream: SharedStream,
    /// Where the stream came from
    pub origin: Origin,
    /// Advisory lock held while a transfer job uses the container
    pub busy: Arc<AtomicBool>,
}

impl Ownership {
    /// Create an ownership record
    pub fn new(stream: SharedStream, origin: Origin) -> Self {
        Self {
            stream,
            origin,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Container plus ownership and state, shared with transfer workers
#[derive(Debug)]
pub struct NodeCore {
    /// The container
    pub container: Container,
    /// Present when this node owns its backing stream
    pub ownership: Option<Ownership>,
    /// Lifecycle state
    pub state: NodeState,
    /// Number of times updates were saved through this node
    pub save_count: u32,
}

impl NodeCore {
    /// Create a core in the `Open` state
    pub fn new(container: Container, ownership: Option<Ownership>) -> Self {
        Self {
            container,
            ownership,
            state: NodeState::Open,
            save_count: 0,
        }
    }

    /// Record a change
    pub fn mark_dirty(&mut self) {
        self.state = NodeState::Dirty;
    }
}

/// Handle to a node core that can move between threads
pub type SharedCore = Arc<Mutex<NodeCore>>;

/// A subtree that has been built but not yet attached
///
/// Building can run anywhere; attaching happens on the thread that owns the
/// tree.
#[derive(Debug)]
pub struct PendingNode {
    /// Type label
    pub label: String,
    /// Display name
    pub name: String,
    /// Container and resources
    pub core: NodeCore,
    /// Children in discovery order
    pub children: Vec<PendingNode>,
}

impl PendingNode {
    /// A node that owns `ownership`
    pub fn owner(container: Container, name: String, ownership: Ownership) -> Self {
        Self::new(container, name, Some(ownership))
    }

    /// A view into an ancestor's stream
    pub fn view(container: Container, name: String) -> Self {
        Self::new(container, name, None)
    }

    fn new(container: Container, name: String, ownership: Option<Ownership>) -> Self {
        Self {
            label: container.type_label(),
            name,
            core: NodeCore::new(container, ownership),
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(PendingNode::node_count).sum::<usize>()
    }

    /// Depth of this subtree (1 for a leaf)
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(PendingNode::depth).max().unwrap_or(0)
    }
}

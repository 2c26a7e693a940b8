/// Multi-partition maps and the partitions inside them

/// Apple Partition Map
pub mod apm;

use crate::filesystem::{self, FileSystem};
use crate::io::ChunkAccess;
use crate::notes::Notes;
use std::fmt;

/// Where a partition map came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Apple Partition Map
    Apm,
    /// Volumes stored back to back after a host volume
    Embedded,
}

impl MapKind {
    /// Get a human-readable name for this kind
    pub fn name(&self) -> &'static str {
        match self {
            MapKind::Apm => "Apple Partition Map",
            MapKind::Embedded => "Embedded Volumes",
        }
    }
}

/// One partition: a block range with its own filesystem
pub struct Partition {
    name: String,
    type_name: String,
    start_block: u32,
    chunks: ChunkAccess,
    notes: Notes,
    filesystem: Option<Box<dyn FileSystem>>,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("start_block", &self.start_block)
            .field("block_count", &self.chunks.block_count())
            .field("has_filesystem", &self.filesystem.is_some())
            .finish()
    }
}

impl Partition {
    /// Create a partition over `chunks`, which starts at `start_block` of the parent
    pub fn new<N: Into<String>, T: Into<String>>(name: N, type_name: T, start_block: u32, chunks: ChunkAccess) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            start_block,
            chunks,
            notes: Notes::new(),
            filesystem: None,
        }
    }

    /// Partition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition type, as recorded in the map
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// First block, relative to the parent
    pub fn start_block(&self) -> u32 {
        self.start_block
    }

    /// Length in blocks
    pub fn block_count(&self) -> u32 {
        self.chunks.block_count()
    }

    /// Block access to the partition
    pub fn chunks(&self) -> &ChunkAccess {
        &self.chunks
    }

    /// Validity notes
    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    /// Probe for a filesystem; returns true if one was found
    pub fn analyze(&mut self) -> bool {
        if self.filesystem.is_none() {
            self.filesystem = filesystem::probe(&self.chunks);
            if self.filesystem.is_none() {
                self.notes.info("no recognizable filesystem");
            }
        }
        self.filesystem.is_some()
    }

    /// Filesystem found by [`Partition::analyze`]
    pub fn filesystem(&self) -> Option<&dyn FileSystem> {
        self.filesystem.as_deref()
    }

    /// Move the filesystem out so it can be managed on its own
    pub fn take_filesystem(&mut self) -> Option<Box<dyn FileSystem>> {
        self.filesystem.take()
    }
}

/// A set of partitions
#[derive(Debug)]
pub struct PartitionMap {
    kind: MapKind,
    partitions: Vec<Partition>,
    notes: Notes,
}

impl PartitionMap {
    /// Create a map of the given kind
    pub fn new(kind: MapKind, partitions: Vec<Partition>, notes: Notes) -> Self {
        Self {
            kind,
            partitions,
            notes,
        }
    }

    /// Map of volumes embedded after a host volume
    pub fn embedded(partitions: Vec<Partition>) -> Self {
        Self::new(MapKind::Embedded, partitions, Notes::new())
    }

    /// Kind of map
    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// Partitions in map order
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Move the partitions out so each can become its own node
    pub fn take_partitions(&mut self) -> Vec<Partition> {
        std::mem::take(&mut self.partitions)
    }

    /// Validity notes
    pub fn notes(&self) -> &Notes {
        &self.notes
    }
}

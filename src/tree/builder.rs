/// Recursive discovery of nested containers

use super::filter::nested_candidate;
use super::node::{Container, Origin, Ownership, PendingNode};
use crate::archive::{Archive, Part};
use crate::error::IdentifyError;
use crate::filesystem::FileSystem;
use crate::format::{extension_of, identify, FileKind, Opened};
use crate::image::Contents;
use crate::io::{temp_stream, SharedStream};
use crate::partition::PartitionMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Nested streams deeper than this are left unexpanded
pub const MAX_NESTING_DEPTH: usize = 16;

/// Display name for a filesystem without a readable volume name
pub const UNKNOWN_VOLUME: &str = "(unknown)";

/// How far the builder expands containers automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepthPolicy {
    /// Top-level identification only
    Shallow,
    /// Also partition maps, embedded volumes and single-member archives
    SubVolume,
    /// Also every entry the heuristic filter accepts
    Max,
}

impl DepthPolicy {
    /// Parse a policy name, ignoring case and separators
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(|c: char| c == '-' || c == '_', "").as_str() {
            "shallow" => Some(DepthPolicy::Shallow),
            "subvolume" | "sub" => Some(DepthPolicy::SubVolume),
            "max" | "maximum" => Some(DepthPolicy::Max),
            _ => None,
        }
    }
}

/// Scan parameters, passed by value into the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Expansion depth
    pub depth: DepthPolicy,
    /// Look inside every file of every filesystem (only under `Max`)
    pub deep_scan_filesystems: bool,
    /// Number given to the first partition of a map
    pub partition_base: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            depth: DepthPolicy::Max,
            deep_scan_filesystems: false,
            partition_base: 1,
        }
    }
}

impl ScanOptions {
    /// Options with the given depth and otherwise default values
    pub fn with_depth(depth: DepthPolicy) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }
}

/// Builds detached container subtrees
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    options: ScanOptions,
}

fn file_name(path: &str) -> &str {
    path.rsplit(&['/', '\\', ':'][..])
        .find(|s| !s.is_empty())
        .unwrap_or(path)
}

fn strip_compression_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".gz") {
        &name[..name.len() - 3]
    } else {
        name
    }
}

impl TreeBuilder {
    /// Create a builder
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Scan options in use
    pub fn options(&self) -> ScanOptions {
        self.options
    }

    /// Identify `stream` and expand whatever is found inside it
    ///
    /// The root node takes ownership of `stream`, with `origin` recording
    /// where saved bytes must go. Unrecognized streams produce no node.
    pub fn build(
        &self,
        stream: SharedStream,
        path_hint: &str,
        ext_hint: &str,
        origin: Origin,
    ) -> Result<PendingNode, IdentifyError> {
        self.expand_stream(stream, path_hint, ext_hint, origin, 0)
    }

    fn expand_stream(
        &self,
        stream: SharedStream,
        path_hint: &str,
        ext_hint: &str,
        origin: Origin,
        level: usize,
    ) -> Result<PendingNode, IdentifyError> {
        let opened = identify(stream.clone(), ext_hint)?;
        debug!(path = path_hint, kind = opened.container.kind().name(), level, "identified");

        let name = file_name(path_hint).to_string();
        let ownership = Ownership::new(stream, origin);
        match opened.container {
            Opened::Archive(archive) => {
                let mut node = PendingNode::owner(Container::Archive(archive), name, ownership);
                self.expand_archive(&mut node, path_hint, level);
                Ok(node)
            }
            Opened::DiskImage(image) => {
                let mut node = PendingNode::owner(Container::DiskImage(image), name, ownership);
                self.expand_disk_image(&mut node, level);
                Ok(node)
            }
        }
    }

    fn expand_archive(&self, node: &mut PendingNode, path_hint: &str, level: usize) {
        let Container::Archive(archive) = &mut node.core.container else {
            return;
        };
        let entries = archive.entries().to_vec();
        let separator = archive.path_separator();

        if archive.kind() == FileKind::GZip {
            if let Some(entry) = entries.first() {
                let inner = strip_compression_suffix(file_name(path_hint)).to_string();
                let ext = extension_of(&inner);
                let child = self.expand_entry(archive.as_mut(), 0, Part::DataFork, &entry.name, &inner, &ext, level);
                node.children.extend(child);
            }
            return;
        }

        if let [entry] = entries.as_slice() {
            if entry.is_disk_image {
                let name = entry.file_name(separator).to_string();
                let child = self.expand_entry(archive.as_mut(), 0, Part::DiskImage, &entry.name, &name, "po", level);
                node.children.extend(child);
                return;
            }
        }

        if self.options.depth < DepthPolicy::Max {
            return;
        }
        for (index, entry) in entries.iter().enumerate() {
            if entry.is_directory {
                continue;
            }
            let shown_name = entry.file_name(separator);
            let Some(ext) = nested_candidate(shown_name, entry.file_type, entry.aux_type, entry.data_len) else {
                continue;
            };
            let part = entry.main_part();
            if let Some(child) = self.expand_entry(archive.as_mut(), index, part, &entry.name, shown_name, ext, level) {
                node.children.push(child);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_entry(
        &self,
        archive: &mut dyn Archive,
        index: usize,
        part: Part,
        entry_name: &str,
        shown_name: &str,
        ext: &str,
        level: usize,
    ) -> Option<PendingNode> {
        if level + 1 > MAX_NESTING_DEPTH {
            warn!(entry = entry_name, "nesting too deep, not expanding");
            return None;
        }
        let data = match archive.read_part(index, part) {
            Ok(data) => data,
            Err(e) => {
                warn!(entry = entry_name, error = %e, "unable to extract nested candidate");
                return None;
            }
        };
        let origin = Origin::ArchiveEntry {
            name: entry_name.to_string(),
            part,
        };
        self.expand_bytes(&data, shown_name, ext, origin, level + 1)
    }

    fn expand_bytes(&self, data: &[u8], shown_name: &str, ext: &str, origin: Origin, level: usize) -> Option<PendingNode> {
        let stream = match temp_stream(data) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(name = shown_name, error = %e, "unable to create temporary stream");
                return None;
            }
        };
        match self.expand_stream(stream, shown_name, ext, origin, level) {
            Ok(child) => Some(child),
            Err(e) => {
                info!(name = shown_name, error = %e, "nested candidate is not a container");
                None
            }
        }
    }

    fn expand_disk_image(&self, node: &mut PendingNode, level: usize) {
        if self.options.depth == DepthPolicy::Shallow {
            return;
        }
        let Container::DiskImage(image) = &mut node.core.container else {
            return;
        };
        match image.take_contents() {
            Some(Contents::FileSystem(fs)) => {
                let child = self.filesystem_node(fs, level);
                node.children.push(child);
            }
            Some(Contents::PartitionMap(map)) => {
                let child = self.partition_map_node(map, level);
                node.children.push(child);
            }
            None => {}
        }
    }

    fn filesystem_node(&self, fs: Box<dyn FileSystem>, level: usize) -> PendingNode {
        let name = fs
            .volume_name()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNKNOWN_VOLUME.to_string());

        let mut children = Vec::new();
        match fs.embedded_volumes() {
            Ok(Some(map)) => children.push(self.partition_map_node(map, level)),
            Ok(None) => {}
            Err(e) => warn!(volume = %name, error = %e, "unable to check for embedded volumes"),
        }
        if self.options.depth == DepthPolicy::Max && self.options.deep_scan_filesystems {
            children.extend(self.deep_scan(fs.as_ref(), level));
        }

        let mut node = PendingNode::view(Container::FileSystem(fs), name);
        node.children = children;
        node
    }

    fn deep_scan(&self, fs: &dyn FileSystem, level: usize) -> Vec<PendingNode> {
        let entries = match fs.read_dir() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "unable to scan filesystem");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for entry in entries.iter().filter(|e| !e.is_directory) {
            let attrs = &entry.attributes;
            let Some(ext) = nested_candidate(&entry.name, attrs.file_type, attrs.aux_type, entry.data_len) else {
                continue;
            };
            if level + 1 > MAX_NESTING_DEPTH {
                warn!(path = %entry.path, "nesting too deep, not expanding");
                continue;
            }
            let data = match fs.read_file(&entry.path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "unable to read nested candidate");
                    continue;
                }
            };
            let origin = Origin::FileSystemFile {
                path: entry.path.clone(),
            };
            found.extend(self.expand_bytes(&data, &entry.name, ext, origin, level + 1));
        }
        found
    }

    fn partition_map_node(&self, mut map: PartitionMap, level: usize) -> PendingNode {
        let partitions = map.take_partitions();
        let name = map.kind().name().to_string();
        let mut node = PendingNode::view(Container::MultiPartitionMap(map), name);

        for (i, mut partition) in partitions.into_iter().enumerate() {
            let number = self.options.partition_base as usize + i;
            let name = format!("#{} {}", number, partition.name());
            let filesystem = if partition.analyze() {
                partition.take_filesystem()
            } else {
                None
            };
            let mut child = PendingNode::view(Container::Partition(partition), name);
            if let Some(fs) = filesystem {
                child.children.push(self.filesystem_node(fs, level));
            }
            node.children.push(child);
        }
        node
    }
}

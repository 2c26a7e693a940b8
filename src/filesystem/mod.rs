/// Filesystem implementations

pub mod prodos;

pub use prodos::ProDosFileSystem;

use crate::archive::Part;
use crate::error::Result;
use crate::notes::Notes;
use crate::partition::PartitionMap;

/// File attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// ProDOS file type
    pub file_type: u8,
    /// ProDOS aux type
    pub aux_type: u16,
    /// Write-protected flag
    pub locked: bool,
}

impl Default for FileAttributes {
    fn default() -> Self {
        Self {
            file_type: 0,
            aux_type: 0,
            locked: false,
        }
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Full path from the volume root, components separated by '/'
    pub path: String,
    /// Filename
    pub name: String,
    /// Data fork length in bytes
    pub data_len: u64,
    /// Resource fork length, for forked files
    pub rsrc_len: Option<u64>,
    /// Entry is a directory
    pub is_directory: bool,
    /// File attributes
    pub attributes: FileAttributes,
}

impl DirEntry {
    /// Directory part of the path, empty at the volume root
    pub fn parent_path(&self) -> &str {
        match self.path.rfind('/') {
            Some(pos) => &self.path[..pos],
            None => "",
        }
    }
}

/// Filesystem information
#[derive(Debug)]
pub struct FileSystemInfo {
    /// Filesystem type name
    pub fs_type: String,
    /// Volume name, if readable
    pub volume_name: Option<String>,
    /// Total blocks on disk
    pub total_blocks: usize,
    /// Free blocks
    pub free_blocks: usize,
    /// Block size in bytes
    pub block_size: usize,
}

/// Filesystem trait for accessing files inside disk images and partitions
pub trait FileSystem: Send {
    /// Filesystem type name
    fn fs_type(&self) -> &'static str;

    /// Volume name, if it can be read
    fn volume_name(&self) -> Option<String>;

    /// Validity notes gathered when the filesystem was opened
    fn notes(&self) -> &Notes;

    /// Is the filesystem read-only?
    fn is_read_only(&self) -> bool;

    /// Separator used between path components
    fn path_separator(&self) -> char {
        '/'
    }

    /// Maximum length of a single filename
    fn max_name_len(&self) -> usize;

    /// Turn an arbitrary name into a legal filename for this filesystem
    fn adjust_name(&self, name: &str) -> String;

    /// List every entry, recursing into subdirectories
    fn read_dir(&self) -> Result<Vec<DirEntry>>;

    /// Look up an entry by path (case-insensitive)
    fn find(&self, path: &str) -> Result<Option<DirEntry>>;

    /// Read a file's data fork
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read_fork(path, Part::DataFork, false)
    }

    /// Read one fork of a file
    ///
    /// In raw mode the data is not trimmed to the file's length, so whole
    /// allocated blocks are returned.
    fn read_fork(&self, path: &str, part: Part, raw: bool) -> Result<Vec<u8>>;

    /// Create a file in directory `dir` (empty for the root)
    fn write_file(
        &mut self,
        dir: &str,
        name: &str,
        attributes: &FileAttributes,
        data: &[u8],
        rsrc: Option<&[u8]>,
    ) -> Result<DirEntry>;

    /// Replace an existing file with new contents
    ///
    /// Space is checked before the old file is removed, and the old file is
    /// put back if writing the new one fails.
    fn replace_file(
        &mut self,
        path: &str,
        attributes: &FileAttributes,
        data: &[u8],
        rsrc: Option<&[u8]>,
    ) -> Result<DirEntry>;

    /// Create a directory and any missing parents
    fn create_directory(&mut self, path: &str) -> Result<()>;

    /// Delete a file or an empty directory
    fn delete_file(&mut self, path: &str) -> Result<()>;

    /// Get filesystem information
    fn info(&self) -> FileSystemInfo;

    /// Volumes stored after the end of this one, if any
    fn embedded_volumes(&self) -> Result<Option<PartitionMap>>;

    /// Flush pending writes to the backing stream
    fn flush(&mut self) -> Result<()>;
}

/// Try each supported filesystem against a block range
pub fn probe(chunks: &crate::io::ChunkAccess) -> Option<Box<dyn FileSystem>> {
    match ProDosFileSystem::open(chunks.clone()) {
        Ok(fs) => Some(Box::new(fs)),
        Err(e) => {
            tracing::trace!(error = %e, "not a ProDOS volume");
            None
        }
    }
}

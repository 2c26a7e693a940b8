/// File archives: the common contract plus ZIP, gzip and NuFX implementations
///
/// Archives are modified through transactions. Additions, deletions and
/// replacements are staged in memory; nothing touches the backing stream until
/// [`Archive::commit_transaction`] rewrites the whole archive, so a cancelled
/// transaction leaves the stream byte-for-byte as it was.

/// AppleDouble companion encoding (used for MacZip pairing)
pub mod appledouble;
/// gzip single-member streams
pub mod gzip;
/// NuFX (ShrinkIt) archives
pub mod nufx;
/// ZIP archives
pub mod zip;

pub use gzip::GzipArchive;
pub use nufx::NufxArchive;
pub use zip::ZipArchive;

use crate::error::{ContainerError, Result};
use crate::format::FileKind;
use crate::notes::Notes;
use std::collections::BTreeSet;

/// Part of an entry that holds data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    /// Data fork
    DataFork,
    /// Resource fork
    RsrcFork,
    /// Disk image stored in an archive record
    DiskImage,
}

/// An entry in an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Full pathname, components joined by the archive's separator
    pub name: String,
    /// ProDOS file type
    pub file_type: u8,
    /// ProDOS aux type
    pub aux_type: u16,
    /// Length of the data fork (or disk image) in bytes
    pub data_len: u64,
    /// Length of the resource fork, if there is one
    pub rsrc_len: Option<u64>,
    /// Entry holds a disk image rather than a file
    pub is_disk_image: bool,
    /// Entry is a directory placeholder
    pub is_directory: bool,
    /// Entry is write-protected
    pub locked: bool,
}

impl ArchiveEntry {
    /// Create a plain data entry
    pub fn new<S: Into<String>>(name: S, data_len: u64) -> Self {
        Self {
            name: name.into(),
            file_type: 0,
            aux_type: 0,
            data_len,
            rsrc_len: None,
            is_disk_image: false,
            is_directory: false,
            locked: false,
        }
    }

    /// Last pathname component
    pub fn file_name(&self, separator: char) -> &str {
        self.name
            .trim_end_matches(separator)
            .rsplit(separator)
            .next()
            .unwrap_or(&self.name)
    }

    /// The part holding the entry's main contents
    pub fn main_part(&self) -> Part {
        if self.is_disk_image {
            Part::DiskImage
        } else {
            Part::DataFork
        }
    }
}

/// A new entry to add in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Full pathname using the archive's separator
    pub name: String,
    /// ProDOS file type
    pub file_type: u8,
    /// ProDOS aux type
    pub aux_type: u16,
    /// Data fork, or disk image when `is_disk_image` is set
    pub data: Vec<u8>,
    /// Resource fork
    pub rsrc: Option<Vec<u8>>,
    /// Store `data` as a disk image
    pub is_disk_image: bool,
}

impl NewEntry {
    /// Create a new data-only entry
    pub fn file<S: Into<String>>(name: S, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            file_type: 0,
            aux_type: 0,
            data,
            rsrc: None,
            is_disk_image: false,
        }
    }

    /// Set the ProDOS file and aux types
    pub fn with_types(mut self, file_type: u8, aux_type: u16) -> Self {
        self.file_type = file_type;
        self.aux_type = aux_type;
        self
    }

    /// Attach a resource fork
    pub fn with_rsrc(mut self, rsrc: Vec<u8>) -> Self {
        self.rsrc = Some(rsrc);
        self
    }
}

/// Contract every archive format implements
pub trait Archive: Send {
    /// Format of this archive
    fn kind(&self) -> FileKind;

    /// Committed entries
    fn entries(&self) -> &[ArchiveEntry];

    /// Validity notes gathered when the archive was opened
    fn notes(&self) -> &Notes;

    /// Is the archive read-only?
    fn is_read_only(&self) -> bool {
        self.notes().is_dubious()
    }

    /// Separator used between pathname components
    fn path_separator(&self) -> char;

    /// Can entries carry resource forks?
    fn supports_rsrc(&self) -> bool;

    /// Read one part of a committed entry
    fn read_part(&mut self, index: usize, part: Part) -> Result<Vec<u8>>;

    /// Is a transaction open?
    fn in_transaction(&self) -> bool;

    /// Begin staging changes
    fn start_transaction(&mut self) -> Result<()>;

    /// Stage an addition
    fn add_entry(&mut self, entry: NewEntry) -> Result<()>;

    /// Stage deletion of a committed entry
    fn delete_entry(&mut self, index: usize) -> Result<()>;

    /// Stage replacement of one part of a committed entry
    fn replace_part(&mut self, index: usize, part: Part, data: Vec<u8>) -> Result<()>;

    /// Write all staged changes to the backing stream
    fn commit_transaction(&mut self, compress: bool) -> Result<()>;

    /// Discard staged changes; does nothing when no transaction is open
    fn cancel_transaction(&mut self);

    /// Is an addition with this name staged in the open transaction?
    fn is_staged(&self, name: &str) -> bool;

    /// Drop a staged addition; false if none had the name
    fn unstage(&mut self, name: &str) -> bool;

    /// Find a committed entry by name (case-insensitive)
    fn find_entry(&self, name: &str) -> Option<usize> {
        self.entries()
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }
}

/// Staged changes for an open transaction
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    deleted: BTreeSet<usize>,
    replaced: Vec<(usize, Part, Vec<u8>)>,
    added: Vec<NewEntry>,
}

impl Transaction {
    /// Stage an addition
    ///
    /// Fails if a committed, undeleted entry or a staged addition already
    /// has the name.
    pub(crate) fn add(&mut self, entries: &[ArchiveEntry], entry: NewEntry) -> Result<()> {
        if entry.name.is_empty() {
            return Err(ContainerError::InvalidFilename("empty name".to_string()));
        }
        let clash = entries
            .iter()
            .enumerate()
            .any(|(i, e)| !self.deleted.contains(&i) && e.name.eq_ignore_ascii_case(&entry.name));
        if clash || self.is_staged(&entry.name) {
            return Err(ContainerError::FileExists(entry.name));
        }
        self.added.push(entry);
        Ok(())
    }

    pub(crate) fn is_staged(&self, name: &str) -> bool {
        self.added.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub(crate) fn unstage(&mut self, name: &str) -> bool {
        let before = self.added.len();
        self.added.retain(|a| !a.name.eq_ignore_ascii_case(name));
        self.added.len() != before
    }

    pub(crate) fn delete(&mut self, entries: &[ArchiveEntry], index: usize) -> Result<()> {
        if index >= entries.len() {
            return Err(ContainerError::FileNotFound(format!("entry #{}", index)));
        }
        self.deleted.insert(index);
        self.replaced.retain(|(i, _, _)| *i != index);
        Ok(())
    }

    pub(crate) fn replace(&mut self, entries: &[ArchiveEntry], index: usize, part: Part, data: Vec<u8>) -> Result<()> {
        if index >= entries.len() || self.deleted.contains(&index) {
            return Err(ContainerError::FileNotFound(format!("entry #{}", index)));
        }
        self.replaced.retain(|(i, p, _)| !(*i == index && *p == part));
        self.replaced.push((index, part, data));
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.replaced.is_empty() && self.added.is_empty()
    }

    fn replacement(&self, index: usize, part: Part) -> Option<&Vec<u8>> {
        self.replaced
            .iter()
            .find(|(i, p, _)| *i == index && *p == part)
            .map(|(_, _, data)| data)
    }
}

/// Fully materialized entry, ready to be serialized by a format writer
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub name: String,
    pub file_type: u8,
    pub aux_type: u16,
    pub data: Vec<u8>,
    pub rsrc: Option<Vec<u8>>,
    pub is_disk_image: bool,
    pub is_directory: bool,
    pub locked: bool,
}

/// Apply a transaction to the committed entries, reading kept data as needed
pub(crate) fn materialize<A: Archive + ?Sized>(archive: &mut A, txn: &Transaction) -> Result<Vec<Record>> {
    let entries = archive.entries().to_vec();
    let mut records = Vec::with_capacity(entries.len() + txn.added.len());

    for (index, entry) in entries.iter().enumerate() {
        if txn.deleted.contains(&index) {
            continue;
        }
        let main = entry.main_part();
        let data = match txn.replacement(index, main) {
            Some(data) => data.clone(),
            None if entry.is_directory => Vec::new(),
            None => archive.read_part(index, main)?,
        };
        let rsrc = match (txn.replacement(index, Part::RsrcFork), entry.rsrc_len) {
            (Some(data), _) => Some(data.clone()),
            (None, Some(_)) => Some(archive.read_part(index, Part::RsrcFork)?),
            (None, None) => None,
        };
        records.push(Record {
            name: entry.name.clone(),
            file_type: entry.file_type,
            aux_type: entry.aux_type,
            data,
            rsrc,
            is_disk_image: entry.is_disk_image,
            is_directory: entry.is_directory,
            locked: entry.locked,
        });
    }

    for added in &txn.added {
        records.push(Record {
            name: added.name.clone(),
            file_type: added.file_type,
            aux_type: added.aux_type,
            data: added.data.clone(),
            rsrc: added.rsrc.clone(),
            is_disk_image: added.is_disk_image,
            is_directory: false,
            locked: false,
        });
    }

    Ok(records)
}

/// Standard transaction plumbing shared by the formats
///
/// Expects `self.txn: Option<Transaction>` and `self.entries: Vec<ArchiveEntry>`.
macro_rules! transaction_methods {
    () => {
        fn in_transaction(&self) -> bool {
            self.txn.is_some()
        }

        fn start_transaction(&mut self) -> $crate::error::Result<()> {
            if self.is_read_only() {
                return Err($crate::error::ContainerError::ReadOnly(self.kind().name().to_string()));
            }
            if self.txn.is_some() {
                return Err($crate::error::ContainerError::archive("transaction already open"));
            }
            self.txn = Some($crate::archive::Transaction::default());
            Ok(())
        }

        fn cancel_transaction(&mut self) {
            if self.txn.take().is_some() {
                tracing::debug!(kind = self.kind().name(), "transaction cancelled");
            }
        }

        fn is_staged(&self, name: &str) -> bool {
            self.txn.as_ref().map_or(false, |txn| txn.is_staged(name))
        }

        fn unstage(&mut self, name: &str) -> bool {
            self.txn.as_mut().map_or(false, |txn| txn.unstage(name))
        }
    };
}

pub(crate) use transaction_methods;

pub(crate) fn txn_mut(txn: &mut Option<Transaction>) -> Result<&mut Transaction> {
    txn.as_mut()
        .ok_or_else(|| ContainerError::archive("no transaction open"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<ArchiveEntry> {
        vec![ArchiveEntry::new("HELLO", 5), ArchiveEntry::new("DIR/WORLD", 5)]
    }

    #[test]
    fn test_add_rejects_committed_name() {
        let entries = sample_entries();
        let mut txn = Transaction::default();
        let err = txn.add(&entries, NewEntry::file("hello", vec![1])).unwrap_err();
        assert!(matches!(err, ContainerError::FileExists(_)));
    }

    #[test]
    fn test_add_after_delete() {
        let entries = sample_entries();
        let mut txn = Transaction::default();
        txn.delete(&entries, 0).unwrap();
        txn.add(&entries, NewEntry::file("HELLO", vec![1])).unwrap();
        assert!(!txn.is_empty());
    }

    #[test]
    fn test_add_rejects_staged_name() {
        let mut txn = Transaction::default();
        txn.add(&[], NewEntry::file("A", vec![1])).unwrap();
        let err = txn.add(&[], NewEntry::file("a", vec![2])).unwrap_err();
        assert!(matches!(err, ContainerError::FileExists(_)));
        assert_eq!(txn.added.len(), 1);
        assert_eq!(txn.added[0].data, vec![1]);

        assert!(txn.is_staged("a"));
        assert!(txn.unstage("a"));
        assert!(!txn.unstage("a"));
        txn.add(&[], NewEntry::file("a", vec![2])).unwrap();
        assert_eq!(txn.added[0].data, vec![2]);
    }

    #[test]
    fn test_file_name() {
        let entry = ArchiveEntry::new("GAMES:ARCADE:PACMAN", 0);
        assert_eq!(entry.file_name(':'), "PACMAN");
        assert_eq!(ArchiveEntry::new("dir/", 0).file_name('/'), "dir");
    }
}

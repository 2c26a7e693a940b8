/// gzip streams, presented as an archive with exactly one entry
///
/// The single entry can be replaced but not added to or deleted.

use super::{transaction_methods, txn_mut, Archive, ArchiveEntry, NewEntry, Part, Transaction};
use crate::error::{ContainerError, Result};
use crate::format::FileKind;
use crate::io::{SharedReader, SharedStream};
use crate::notes::Notes;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::io::{Read, Write};
use tracing::debug;

/// Name used when the gzip header does not carry one
pub const DEFAULT_ENTRY_NAME: &str = "data";

/// A gzip-compressed stream
pub struct GzipArchive {
    stream: SharedStream,
    data: Vec<u8>,
    stored_name: Option<String>,
    entries: Vec<ArchiveEntry>,
    notes: Notes,
    txn: Option<Transaction>,
}

impl GzipArchive {
    /// Open a gzip stream, decompressing it to validate the contents
    pub fn open(stream: SharedStream) -> Result<Self> {
        let mut decoder = GzDecoder::new(SharedReader::new(stream.clone())?);
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .map_err(|e| ContainerError::invalid_format(format!("gzip: {}", e)))?;

        let stored_name = decoder
            .header()
            .and_then(|h| h.filename())
            .map(|raw| String::from_utf8_lossy(raw).into_owned());
        let name = stored_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ENTRY_NAME.to_string());

        debug!(name = %name, len = data.len(), "opened gzip stream");
        Ok(Self {
            stream,
            entries: vec![ArchiveEntry::new(name, data.len() as u64)],
            data,
            stored_name,
            notes: Notes::new(),
            txn: None,
        })
    }

    /// Name recorded in the gzip header, if any
    pub fn stored_name(&self) -> Option<&str> {
        self.stored_name.as_deref()
    }
}

impl Archive for GzipArchive {
    fn kind(&self) -> FileKind {
        FileKind::GZip
    }

    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn notes(&self) -> &Notes {
        &self.notes
    }

    fn path_separator(&self) -> char {
        '/'
    }

    fn supports_rsrc(&self) -> bool {
        false
    }

    fn read_part(&mut self, index: usize, part: Part) -> Result<Vec<u8>> {
        if index != 0 || part != Part::DataFork {
            return Err(ContainerError::FileNotFound(format!("entry #{} {:?}", index, part)));
        }
        Ok(self.data.clone())
    }

    transaction_methods!();

    fn add_entry(&mut self, _entry: NewEntry) -> Result<()> {
        Err(ContainerError::unsupported("gzip holds exactly one entry"))
    }

    fn delete_entry(&mut self, _index: usize) -> Result<()> {
        Err(ContainerError::unsupported("gzip holds exactly one entry"))
    }

    fn replace_part(&mut self, index: usize, part: Part, data: Vec<u8>) -> Result<()> {
        if part != Part::DataFork {
            return Err(ContainerError::unsupported("gzip has only a data fork"));
        }
        let entries = &self.entries;
        txn_mut(&mut self.txn)?.replace(entries, index, part, data)
    }

    fn commit_transaction(&mut self, compress: bool) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| ContainerError::archive("no transaction open"))?;
        let Some(data) = txn.replacement(0, Part::DataFork) else {
            return Ok(());
        };

        let level = if compress {
            Compression::new(6)
        } else {
            Compression::none()
        };
        let mut builder = GzBuilder::new();
        if let Some(name) = &self.stored_name {
            builder = builder.filename(name.as_bytes());
        }
        let mut encoder = builder.write(Vec::new(), level);
        encoder.write_all(data)?;
        let bytes = encoder.finish()?;

        self.stream.replace_contents(&bytes)?;
        self.data = data.clone();
        self.entries[0].data_len = self.data.len() as u64;
        debug!(len = self.data.len(), "rewrote gzip stream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip(name: Option<&str>, data: &[u8]) -> Vec<u8> {
        let mut builder = GzBuilder::new();
        if let Some(name) = name {
            builder = builder.filename(name);
        }
        let mut encoder = builder.write(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_open_uses_stored_name() {
        let stream = SharedStream::from_bytes(gzip(Some("disk.po"), b"contents"));
        let mut archive = GzipArchive::open(stream).unwrap();
        assert_eq!(archive.entries()[0].name, "disk.po");
        assert_eq!(archive.read_part(0, Part::DataFork).unwrap(), b"contents");
    }

    #[test]
    fn test_open_without_name() {
        let archive = GzipArchive::open(SharedStream::from_bytes(gzip(None, b"x"))).unwrap();
        assert_eq!(archive.entries()[0].name, DEFAULT_ENTRY_NAME);
        assert_eq!(archive.stored_name(), None);
    }

    #[test]
    fn test_replace_and_reopen() {
        let stream = SharedStream::from_bytes(gzip(Some("disk.po"), b"old"));
        let mut archive = GzipArchive::open(stream.clone()).unwrap();
        archive.start_transaction().unwrap();
        archive.replace_part(0, Part::DataFork, b"new contents".to_vec()).unwrap();
        archive.commit_transaction(true).unwrap();

        let mut reopened = GzipArchive::open(stream).unwrap();
        assert_eq!(reopened.entries()[0].name, "disk.po");
        assert_eq!(reopened.read_part(0, Part::DataFork).unwrap(), b"new contents");
    }

    #[test]
    fn test_add_unsupported() {
        let mut archive = GzipArchive::open(SharedStream::from_bytes(gzip(None, b"x"))).unwrap();
        archive.start_transaction().unwrap();
        assert!(matches!(
            archive.add_entry(NewEntry::file("y", Vec::new())),
            Err(ContainerError::Unsupported(_))
        ));
    }

    #[test]
    fn test_corrupt_stream() {
        let mut data = gzip(None, b"some longer contents here");
        let mid = data.len() / 2;
        data.truncate(mid);
        assert!(GzipArchive::open(SharedStream::from_bytes(data)).is_err());
    }
}

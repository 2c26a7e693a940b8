/// ZIP archives, with MacZip `__MACOSX` companions for ProDOS attributes

use super::appledouble::{companion_name, companion_target, AppleDouble};
use super::{materialize, transaction_methods, txn_mut, Archive, ArchiveEntry, NewEntry, Part, Record, Transaction};
use crate::error::{ContainerError, Result};
use crate::format::FileKind;
use crate::io::{SharedReader, SharedStream};
use crate::notes::Notes;
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive as ZipReader, ZipWriter};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use tracing::{debug, warn};

/// Where an entry's data lives in the underlying ZIP
#[derive(Debug, Clone, Copy)]
struct Slot {
    data: usize,
    companion: Option<usize>,
}

/// A ZIP archive
pub struct ZipArchive {
    stream: SharedStream,
    reader: Option<ZipReader<SharedReader>>,
    entries: Vec<ArchiveEntry>,
    slots: Vec<Slot>,
    notes: Notes,
    txn: Option<Transaction>,
}

impl ZipArchive {
    /// Open an existing ZIP archive
    pub fn open(stream: SharedStream) -> Result<Self> {
        let mut archive = Self {
            stream,
            reader: None,
            entries: Vec::new(),
            slots: Vec::new(),
            notes: Notes::new(),
            txn: None,
        };
        archive.load()?;
        Ok(archive)
    }

    /// Start a new, empty archive on `stream`
    ///
    /// Nothing is written until the first commit.
    pub fn create(stream: SharedStream) -> Result<Self> {
        Ok(Self {
            stream,
            reader: None,
            entries: Vec::new(),
            slots: Vec::new(),
            notes: Notes::new(),
            txn: None,
        })
    }

    fn load(&mut self) -> Result<()> {
        self.entries.clear();
        self.slots.clear();
        self.notes.clear();
        self.reader = None;

        if self.stream.len()? == 0 {
            return Ok(());
        }
        let mut reader = ZipReader::new(SharedReader::new(self.stream.clone())?)?;

        let mut names = Vec::with_capacity(reader.len());
        for i in 0..reader.len() {
            let file = reader.by_index_raw(i)?;
            names.push((file.name().to_string(), file.size(), file.is_dir(), file.unix_mode()));
        }

        let mut companions: HashMap<String, usize> = HashMap::new();
        for (i, (name, _, is_dir, _)) in names.iter().enumerate() {
            if *is_dir && name.starts_with("__MACOSX/") {
                continue;
            }
            if let Some(target) = companion_target(name) {
                companions.insert(target, i);
            }
        }

        for (i, (name, size, is_dir, mode)) in names.iter().enumerate() {
            if name.starts_with("__MACOSX/") {
                continue;
            }
            let clean = name.trim_end_matches('/').to_string();
            let mut entry = ArchiveEntry::new(clean.clone(), *size);
            entry.is_directory = *is_dir;
            entry.locked = mode.map_or(false, |m| m & 0o200 == 0);

            let companion = companions.remove(&clean);
            if let Some(ci) = companion {
                let mut raw = Vec::new();
                reader.by_index(ci)?.read_to_end(&mut raw)?;
                match AppleDouble::parse(&raw) {
                    Ok(info) => {
                        entry.file_type = info.file_type;
                        entry.aux_type = info.aux_type;
                        entry.rsrc_len = info.rsrc.as_ref().map(|r| r.len() as u64);
                    }
                    Err(e) => {
                        self.notes.warning(format!("bad MacZip companion for '{}': {}", clean, e));
                    }
                }
            }

            self.entries.push(entry);
            self.slots.push(Slot { data: i, companion });
        }

        for (target, _) in companions {
            self.notes.warning(format!("MacZip companion without a file: '{}'", target));
        }

        debug!(entries = self.entries.len(), "opened ZIP archive");
        self.reader = Some(reader);
        Ok(())
    }

    fn read_raw(&mut self, index: usize) -> Result<Vec<u8>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ContainerError::FileNotFound(format!("entry #{}", index)))?;
        let mut file = reader.by_index(index)?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn serialize(records: &[Record], compress: bool) -> Result<Vec<u8>> {
        let method = if compress {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for record in records {
            let mut options = SimpleFileOptions::default().compression_method(method);
            if record.locked {
                options = options.unix_permissions(0o444);
            }
            if record.is_directory {
                writer.add_directory(format!("{}/", record.name), options)?;
                continue;
            }
            writer.start_file(record.name.clone(), options.clone())?;
            writer.write_all(&record.data)?;

            if record.file_type != 0 || record.aux_type != 0 || record.rsrc.is_some() {
                let companion = AppleDouble {
                    file_type: record.file_type,
                    aux_type: record.aux_type,
                    access: if record.locked { 0x01 } else { 0xC3 },
                    rsrc: record.rsrc.clone(),
                };
                writer.start_file(companion_name(&record.name), options)?;
                writer.write_all(&companion.to_bytes())?;
            }
        }

        Ok(writer.finish()?.into_inner())
    }
}

impl Archive for ZipArchive {
    fn kind(&self) -> FileKind {
        FileKind::Zip
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
        true
    }

    fn read_part(&mut self, index: usize, part: Part) -> Result<Vec<u8>> {
        let slot = *self
            .slots
            .get(index)
            .ok_or_else(|| ContainerError::FileNotFound(format!("entry #{}", index)))?;
        match part {
            Part::DataFork => self.read_raw(slot.data),
            Part::RsrcFork => {
                let companion = slot
                    .companion
                    .ok_or_else(|| ContainerError::FileNotFound("resource fork".to_string()))?;
                let raw = self.read_raw(companion)?;
                AppleDouble::parse(&raw)?
                    .rsrc
                    .ok_or_else(|| ContainerError::FileNotFound("resource fork".to_string()))
            }
            Part::DiskImage => Err(ContainerError::unsupported("ZIP entries do not hold disk images")),
        }
    }

    transaction_methods!();

    fn add_entry(&mut self, entry: NewEntry) -> Result<()> {
        if entry.is_disk_image {
            return Err(ContainerError::unsupported("ZIP entries do not hold disk images"));
        }
        let entries = &self.entries;
        txn_mut(&mut self.txn)?.add(entries, entry)
    }

    fn delete_entry(&mut self, index: usize) -> Result<()> {
        let entries = &self.entries;
        txn_mut(&mut self.txn)?.delete(entries, index)
    }

    fn replace_part(&mut self, index: usize, part: Part, data: Vec<u8>) -> Result<()> {
        let entries = &self.entries;
        txn_mut(&mut self.txn)?.replace(entries, index, part, data)
    }

    fn commit_transaction(&mut self, compress: bool) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| ContainerError::archive("no transaction open"))?;
        if txn.is_empty() && self.stream.len()? > 0 {
            return Ok(());
        }

        let result = materialize(self, &txn).and_then(|records| Self::serialize(&records, compress));
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "ZIP commit failed, archive unchanged");
                return Err(e);
            }
        };

        self.reader = None;
        self.stream.replace_contents(&bytes)?;
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: Vec<NewEntry>) -> (SharedStream, ZipArchive) {
        let stream = SharedStream::from_bytes(Vec::new());
        let mut archive = ZipArchive::create(stream.clone()).unwrap();
        archive.start_transaction().unwrap();
        for entry in entries {
            archive.add_entry(entry).unwrap();
        }
        archive.commit_transaction(true).unwrap();
        (stream, archive)
    }

    #[test]
    fn test_create_and_reopen() {
        let (stream, _) = build(vec![
            NewEntry::file("HELLO.TXT", b"hello".to_vec()),
            NewEntry::file("DIR/WORLD", b"world".to_vec()),
        ]);

        let mut reopened = ZipArchive::open(stream).unwrap();
        assert_eq!(reopened.entries().len(), 2);
        let index = reopened.find_entry("dir/world").unwrap();
        assert_eq!(reopened.read_part(index, Part::DataFork).unwrap(), b"world");
    }

    #[test]
    fn test_maczip_companion_pairing() {
        let (stream, _) = build(vec![NewEntry::file("GAME", vec![0x60; 10])
            .with_types(0xFF, 0x2000)
            .with_rsrc(vec![9, 9, 9])]);

        let mut reopened = ZipArchive::open(stream).unwrap();
        assert_eq!(reopened.entries().len(), 1);
        let entry = reopened.entries()[0].clone();
        assert_eq!(entry.file_type, 0xFF);
        assert_eq!(entry.aux_type, 0x2000);
        assert_eq!(entry.rsrc_len, Some(3));
        assert_eq!(reopened.read_part(0, Part::RsrcFork).unwrap(), vec![9, 9, 9]);
    }

    #[test]
    fn test_cancel_leaves_stream_untouched() {
        let (stream, mut archive) = build(vec![NewEntry::file("A", b"a".to_vec())]);
        let before = stream.read_all().unwrap();

        archive.start_transaction().unwrap();
        archive.add_entry(NewEntry::file("B", b"b".to_vec())).unwrap();
        archive.delete_entry(0).unwrap();
        archive.cancel_transaction();

        assert_eq!(stream.read_all().unwrap(), before);
        assert_eq!(archive.entries().len(), 1);
    }

    #[test]
    fn test_replace_part() {
        let (stream, mut archive) = build(vec![NewEntry::file("A", b"old".to_vec())]);
        archive.start_transaction().unwrap();
        archive.replace_part(0, Part::DataFork, b"new data".to_vec()).unwrap();
        archive.commit_transaction(false).unwrap();

        let mut reopened = ZipArchive::open(stream).unwrap();
        assert_eq!(reopened.read_part(0, Part::DataFork).unwrap(), b"new data");
    }

    #[test]
    fn test_add_requires_transaction() {
        let (_, mut archive) = build(Vec::new());
        assert!(archive.add_entry(NewEntry::file("X", Vec::new())).is_err());
    }
}

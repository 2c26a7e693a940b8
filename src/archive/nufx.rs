/// NuFX (ShrinkIt) archives
///
/// Reads and writes version 3 records. Threads may be stored uncompressed
/// (format 0) or deflated (format 6); the older LZW formats are recognized
/// but cannot be extracted.

use super::{materialize, transaction_methods, txn_mut, Archive, ArchiveEntry, NewEntry, Part, Record, Transaction};
use crate::error::{ContainerError, Result};
use crate::format::{FileKind, NUFX_MASTER_SIGNATURE, NUFX_RECORD_SIGNATURE};
use crate::io::{SharedStream, BLOCK_SIZE};
use crate::notes::Notes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::{debug, warn};

const MASTER_HEADER_LEN: usize = 48;
const MASTER_VERSION: u16 = 2;
const RECORD_VERSION: u16 = 3;
const ATTRIB_COUNT: u16 = 60;
const THREAD_HEADER_LEN: usize = 16;
const MIN_ATTRIB_COUNT: usize = 58;

const CLASS_DATA: u16 = 0x0002;
const CLASS_FILENAME: u16 = 0x0003;
const KIND_DATA_FORK: u16 = 0x0000;
const KIND_DISK_IMAGE: u16 = 0x0001;
const KIND_RSRC_FORK: u16 = 0x0002;

const FORMAT_UNCOMPRESSED: u16 = 0x0000;
const FORMAT_DEFLATE: u16 = 0x0006;

const FILE_SYS_PRODOS: u16 = 0x0001;
const SEPARATOR: char = ':';

const ACCESS_UNLOCKED: u32 = 0xE3;
const ACCESS_LOCKED: u32 = 0x21;

/// CRC-16 with the XMODEM polynomial, continuing from `seed`
pub fn crc16(seed: u16, data: &[u8]) -> u16 {
    let mut crc = seed;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[derive(Debug, Clone, Copy)]
struct Thread {
    class: u16,
    format: u16,
    kind: u16,
    crc: u16,
    eof: u32,
    comp_eof: u32,
    offset: u64,
}

/// A NuFX archive
pub struct NufxArchive {
    stream: SharedStream,
    entries: Vec<ArchiveEntry>,
    threads: Vec<Vec<Thread>>,
    notes: Notes,
    txn: Option<Transaction>,
}

impl NufxArchive {
    /// Open an existing archive
    pub fn open(stream: SharedStream) -> Result<Self> {
        let mut archive = Self {
            stream,
            entries: Vec::new(),
            threads: Vec::new(),
            notes: Notes::new(),
            txn: None,
        };
        archive.load()?;
        Ok(archive)
    }

    /// Start a new, empty archive on `stream`
    pub fn create(stream: SharedStream) -> Result<Self> {
        Ok(Self {
            stream,
            entries: Vec::new(),
            threads: Vec::new(),
            notes: Notes::new(),
            txn: None,
        })
    }

    fn load(&mut self) -> Result<()> {
        self.entries.clear();
        self.threads.clear();
        self.notes.clear();

        let len = self.stream.len()?;
        if len == 0 {
            return Ok(());
        }
        if len < MASTER_HEADER_LEN as u64 {
            return Err(ContainerError::parse(0, "NuFX master header truncated"));
        }

        let mut master = [0u8; MASTER_HEADER_LEN];
        self.stream.read_at(0, &mut master)?;
        if !master.starts_with(NUFX_MASTER_SIGNATURE) {
            return Err(ContainerError::parse(0, "bad NuFX master signature"));
        }
        if crc16(0, &master[8..]) != le_u16(&master, 6) {
            self.notes.warning("master header CRC mismatch");
        }
        let total_records = le_u32(&master, 8);
        let master_eof = le_u32(&master, 38) as u64;
        if master_eof != 0 && master_eof != len {
            self.notes
                .warning(format!("master EOF {} does not match stream length {}", master_eof, len));
        }

        let mut offset = MASTER_HEADER_LEN as u64;
        for _ in 0..total_records {
            let (entry, threads, next) = self.read_record(offset, len)?;
            self.entries.push(entry);
            self.threads.push(threads);
            offset = next;
        }
        if offset < len && master_eof == 0 {
            self.notes.info(format!("{} bytes of trailing data", len - offset));
        }

        debug!(records = self.entries.len(), "opened NuFX archive");
        Ok(())
    }

    fn read_record(&mut self, start: u64, len: u64) -> Result<(ArchiveEntry, Vec<Thread>, u64)> {
        let mut fixed = [0u8; MIN_ATTRIB_COUNT];
        if start + MIN_ATTRIB_COUNT as u64 > len {
            return Err(ContainerError::parse(start, "NuFX record header truncated"));
        }
        self.stream.read_at(start, &mut fixed)?;
        if !fixed.starts_with(NUFX_RECORD_SIGNATURE) {
            return Err(ContainerError::parse(start, "bad NuFX record signature"));
        }

        let attrib_count = le_u16(&fixed, 6) as usize;
        let total_threads = le_u32(&fixed, 10) as usize;
        if attrib_count < MIN_ATTRIB_COUNT || total_threads > 16 {
            return Err(ContainerError::parse(start, "implausible NuFX record header"));
        }
        let mut attribs = vec![0u8; attrib_count];
        if start + attrib_count as u64 > len {
            return Err(ContainerError::parse(start, "NuFX record header truncated"));
        }
        self.stream.read_at(start, &mut attribs)?;

        let old_name_len = le_u16(&attribs, attrib_count - 2) as usize;
        let headers_start = start + (attrib_count + old_name_len) as u64;
        let headers_len = total_threads * THREAD_HEADER_LEN;
        if headers_start + headers_len as u64 > len {
            return Err(ContainerError::parse(headers_start, "NuFX thread headers truncated"));
        }
        let mut header_bytes = vec![0u8; (headers_start - start) as usize + headers_len];
        self.stream.read_at(start, &mut header_bytes)?;
        let old_name = header_bytes[attrib_count..attrib_count + old_name_len].to_vec();

        if crc16(0, &header_bytes[6..]) != le_u16(&attribs, 4) {
            self.notes
                .warning(format!("record header CRC mismatch at offset {}", start));
        }

        let mut threads = Vec::with_capacity(total_threads);
        let mut data_offset = headers_start + headers_len as u64;
        for t in 0..total_threads {
            let h = &header_bytes[(headers_start - start) as usize + t * THREAD_HEADER_LEN..];
            let thread = Thread {
                class: le_u16(h, 0),
                format: le_u16(h, 2),
                kind: le_u16(h, 4),
                crc: le_u16(h, 6),
                eof: le_u32(h, 8),
                comp_eof: le_u32(h, 12),
                offset: data_offset,
            };
            data_offset += thread.comp_eof as u64;
            threads.push(thread);
        }
        if data_offset > len {
            return Err(ContainerError::parse(start, "NuFX thread data truncated"));
        }

        let name = match threads.iter().find(|t| t.class == CLASS_FILENAME) {
            Some(t) => {
                let mut raw = vec![0u8; t.eof.min(t.comp_eof) as usize];
                self.stream.read_at(t.offset, &mut raw)?;
                String::from_utf8_lossy(&raw).into_owned()
            }
            None => String::from_utf8_lossy(&old_name).into_owned(),
        };
        let name = name.trim_end_matches('\0').to_string();
        if name.is_empty() {
            self.notes.warning(format!("record at offset {} has no name", start));
        }

        let sep = (le_u16(&attribs, 16) & 0xFF) as u8 as char;
        let name = if sep != SEPARATOR && sep != '\0' {
            name.replace(sep, &SEPARATOR.to_string())
        } else {
            name
        };

        let mut entry = ArchiveEntry::new(name, 0);
        entry.file_type = le_u32(&attribs, 22) as u8;
        entry.aux_type = le_u32(&attribs, 26) as u16;
        entry.locked = le_u32(&attribs, 18) & 0x02 == 0;

        for thread in threads.iter().filter(|t| t.class == CLASS_DATA) {
            match thread.kind {
                KIND_DATA_FORK => entry.data_len = thread.eof as u64,
                KIND_DISK_IMAGE => {
                    entry.is_disk_image = true;
                    entry.data_len = thread.eof as u64;
                    if thread.eof == 0 {
                        // some writers leave the EOF zero and rely on the block count
                        let blocks = le_u32(&attribs, 26) as u64;
                        entry.data_len = blocks * le_u16(&attribs, 30) as u64;
                    }
                }
                KIND_RSRC_FORK => entry.rsrc_len = Some(thread.eof as u64),
                _ => {}
            }
            if thread.format != FORMAT_UNCOMPRESSED && thread.format != FORMAT_DEFLATE {
                self.notes.warning(format!(
                    "'{}' uses unsupported compression format {}",
                    entry.name, thread.format
                ));
            }
        }
        if entry.is_disk_image {
            entry.file_type = 0;
            entry.aux_type = 0;
        }

        Ok((entry, threads, data_offset))
    }

    fn thread_for(&self, index: usize, part: Part) -> Result<Thread> {
        let kind = match part {
            Part::DataFork => KIND_DATA_FORK,
            Part::DiskImage => KIND_DISK_IMAGE,
            Part::RsrcFork => KIND_RSRC_FORK,
        };
        self.threads
            .get(index)
            .and_then(|threads| {
                threads
                    .iter()
                    .find(|t| t.class == CLASS_DATA && t.kind == kind)
                    .copied()
            })
            .ok_or_else(|| ContainerError::FileNotFound(format!("entry #{} {:?}", index, part)))
    }

    fn serialize(records: &[Record], compress: bool) -> Result<Vec<u8>> {
        let mut out = vec![0u8; MASTER_HEADER_LEN];
        for record in records {
            write_record(&mut out, record, compress)?;
        }

        out[..NUFX_MASTER_SIGNATURE.len()].copy_from_slice(NUFX_MASTER_SIGNATURE);
        out[8..12].copy_from_slice(&(records.len() as u32).to_le_bytes());
        out[28..30].copy_from_slice(&MASTER_VERSION.to_le_bytes());
        let total = out.len() as u32;
        out[38..42].copy_from_slice(&total.to_le_bytes());
        let crc = crc16(0, &out[8..MASTER_HEADER_LEN]);
        out[6..8].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }
}

fn encode_thread(data: &[u8], compress: bool) -> Result<(u16, Vec<u8>)> {
    if compress && !data.is_empty() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
        encoder.write_all(data)?;
        let packed = encoder.finish()?;
        if packed.len() < data.len() {
            return Ok((FORMAT_DEFLATE, packed));
        }
    }
    Ok((FORMAT_UNCOMPRESSED, data.to_vec()))
}

fn write_record(out: &mut Vec<u8>, record: &Record, compress: bool) -> Result<()> {
    let name = record.name.as_bytes();
    let mut threads: Vec<(u16, u16, u16, u16, u32, Vec<u8>)> = Vec::with_capacity(3);
    threads.push((
        CLASS_FILENAME,
        FORMAT_UNCOMPRESSED,
        0,
        0,
        name.len() as u32,
        name.to_vec(),
    ));

    let main_kind = if record.is_disk_image {
        KIND_DISK_IMAGE
    } else {
        KIND_DATA_FORK
    };
    let (format, packed) = encode_thread(&record.data, compress)?;
    threads.push((
        CLASS_DATA,
        format,
        main_kind,
        crc16(0xFFFF, &record.data),
        record.data.len() as u32,
        packed,
    ));
    if let Some(rsrc) = &record.rsrc {
        let (format, packed) = encode_thread(rsrc, compress)?;
        threads.push((
            CLASS_DATA,
            format,
            KIND_RSRC_FORK,
            crc16(0xFFFF, rsrc),
            rsrc.len() as u32,
            packed,
        ));
    }

    let (file_type, extra_type, storage_type) = if record.is_disk_image {
        (0u32, (record.data.len() / BLOCK_SIZE) as u32, BLOCK_SIZE as u16)
    } else {
        let storage = if record.rsrc.is_some() { 5 } else { 1 };
        (record.file_type as u32, record.aux_type as u32, storage)
    };
    let access = if record.locked {
        ACCESS_LOCKED
    } else {
        ACCESS_UNLOCKED
    };

    let mut header = vec![0u8; ATTRIB_COUNT as usize];
    header[..4].copy_from_slice(NUFX_RECORD_SIGNATURE);
    header[6..8].copy_from_slice(&ATTRIB_COUNT.to_le_bytes());
    header[8..10].copy_from_slice(&RECORD_VERSION.to_le_bytes());
    header[10..14].copy_from_slice(&(threads.len() as u32).to_le_bytes());
    header[14..16].copy_from_slice(&FILE_SYS_PRODOS.to_le_bytes());
    header[16..18].copy_from_slice(&(SEPARATOR as u16).to_le_bytes());
    header[18..22].copy_from_slice(&access.to_le_bytes());
    header[22..26].copy_from_slice(&file_type.to_le_bytes());
    header[26..30].copy_from_slice(&extra_type.to_le_bytes());
    header[30..32].copy_from_slice(&storage_type.to_le_bytes());
    // dates stay zero; option_size (56) and old filename length (58) are zero

    for (class, format, kind, crc, eof, packed) in &threads {
        header.extend_from_slice(&class.to_le_bytes());
        header.extend_from_slice(&format.to_le_bytes());
        header.extend_from_slice(&kind.to_le_bytes());
        header.extend_from_slice(&crc.to_le_bytes());
        header.extend_from_slice(&eof.to_le_bytes());
        header.extend_from_slice(&(packed.len() as u32).to_le_bytes());
    }
    let crc = crc16(0, &header[6..]);
    header[4..6].copy_from_slice(&crc.to_le_bytes());

    out.extend_from_slice(&header);
    for (_, _, _, _, _, packed) in &threads {
        out.extend_from_slice(packed);
    }
    Ok(())
}

impl Archive for NufxArchive {
    fn kind(&self) -> FileKind {
        FileKind::Nufx
    }

    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn notes(&self) -> &Notes {
        &self.notes
    }

    fn path_separator(&self) -> char {
        SEPARATOR
    }

    fn supports_rsrc(&self) -> bool {
        true
    }

    fn read_part(&mut self, index: usize, part: Part) -> Result<Vec<u8>> {
        let thread = self.thread_for(index, part)?;
        let mut raw = vec![0u8; thread.comp_eof as usize];
        self.stream.read_at(thread.offset, &mut raw)?;

        let data = match thread.format {
            FORMAT_UNCOMPRESSED => {
                raw.truncate(thread.eof as usize);
                raw
            }
            FORMAT_DEFLATE => {
                let mut data = Vec::with_capacity(thread.eof as usize);
                ZlibDecoder::new(&raw[..])
                    .read_to_end(&mut data)
                    .map_err(|e| ContainerError::archive(format!("inflate failed: {}", e)))?;
                data
            }
            other => {
                return Err(ContainerError::unsupported(format!(
                    "NuFX compression format {}",
                    other
                )))
            }
        };

        if data.len() != thread.eof as usize {
            return Err(ContainerError::archive(format!(
                "thread expanded to {} bytes, expected {}",
                data.len(),
                thread.eof
            )));
        }
        if thread.crc != 0 && crc16(0xFFFF, &data) != thread.crc {
            warn!(entry = %self.entries[index].name, "thread CRC mismatch");
        }
        Ok(data)
    }

    transaction_methods!();

    fn add_entry(&mut self, entry: NewEntry) -> Result<()> {
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

        let records = materialize(self, &txn)?;
        let bytes = Self::serialize(&records, compress)?;
        self.stream.replace_contents(&bytes)?;
        debug!(records = records.len(), len = bytes.len(), "rewrote NuFX archive");
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_archive() -> (SharedStream, NufxArchive) {
        let stream = SharedStream::from_bytes(Vec::new());
        let archive = NufxArchive::create(stream.clone()).unwrap();
        (stream, archive)
    }

    #[test]
    fn test_crc16_xmodem() {
        assert_eq!(crc16(0, b"123456789"), 0x31C3);
    }

    #[test]
    fn test_write_and_reopen() {
        let (stream, mut archive) = new_archive();
        archive.start_transaction().unwrap();
        archive
            .add_entry(NewEntry::file("GAMES:HELLO", b"hello hello hello hello".to_vec()).with_types(0x04, 0))
            .unwrap();
        archive
            .add_entry(NewEntry::file("TOOL", vec![0xEA; 300]).with_types(0x06, 0x2000).with_rsrc(vec![1, 2]))
            .unwrap();
        archive.commit_transaction(true).unwrap();

        let mut reopened = NufxArchive::open(stream).unwrap();
        assert_eq!(reopened.notes().warning_count(), 0);
        assert_eq!(reopened.entries().len(), 2);

        let hello = reopened.find_entry("games:hello").unwrap();
        assert_eq!(reopened.entries()[hello].file_type, 0x04);
        assert_eq!(
            reopened.read_part(hello, Part::DataFork).unwrap(),
            b"hello hello hello hello"
        );

        let tool = reopened.find_entry("TOOL").unwrap();
        assert_eq!(reopened.entries()[tool].aux_type, 0x2000);
        assert_eq!(reopened.entries()[tool].rsrc_len, Some(2));
        assert_eq!(reopened.read_part(tool, Part::RsrcFork).unwrap(), vec![1, 2]);
        assert_eq!(reopened.read_part(tool, Part::DataFork).unwrap(), vec![0xEA; 300]);
    }

    #[test]
    fn test_disk_image_record() {
        let (stream, mut archive) = new_archive();
        let mut image = NewEntry::file("DISK", vec![0u8; 143_360]);
        image.is_disk_image = true;
        archive.start_transaction().unwrap();
        archive.add_entry(image).unwrap();
        archive.commit_transaction(true).unwrap();

        let mut reopened = NufxArchive::open(stream).unwrap();
        let entry = reopened.entries()[0].clone();
        assert!(entry.is_disk_image);
        assert_eq!(entry.data_len, 143_360);
        assert_eq!(entry.main_part(), Part::DiskImage);
        assert_eq!(reopened.read_part(0, Part::DiskImage).unwrap().len(), 143_360);
    }

    #[test]
    fn test_empty_commit_writes_master_header() {
        let (stream, mut archive) = new_archive();
        archive.start_transaction().unwrap();
        archive.commit_transaction(false).unwrap();

        let data = stream.read_all().unwrap();
        assert_eq!(data.len(), MASTER_HEADER_LEN);
        assert!(data.starts_with(NUFX_MASTER_SIGNATURE));
        assert!(NufxArchive::open(stream).unwrap().entries().is_empty());
    }

    #[test]
    fn test_header_crc_mismatch_is_a_warning() {
        let (stream, mut archive) = new_archive();
        archive.start_transaction().unwrap();
        archive.add_entry(NewEntry::file("A", b"abc".to_vec())).unwrap();
        archive.commit_transaction(false).unwrap();

        // damage the record's access field
        stream.write_at(MASTER_HEADER_LEN as u64 + 19, &[0x55]).unwrap();
        let reopened = NufxArchive::open(stream).unwrap();
        assert_eq!(reopened.notes().warning_count(), 1);
        assert_eq!(reopened.entries().len(), 1);
    }

    #[test]
    fn test_truncated_record() {
        let (stream, mut archive) = new_archive();
        archive.start_transaction().unwrap();
        archive.add_entry(NewEntry::file("A", vec![7u8; 100])).unwrap();
        archive.commit_transaction(false).unwrap();

        let mut data = stream.read_all().unwrap();
        data.truncate(data.len() - 10);
        assert!(NufxArchive::open(SharedStream::from_bytes(data)).is_err());
    }

    #[test]
    fn test_delete_entry() {
        let (stream, mut archive) = new_archive();
        archive.start_transaction().unwrap();
        archive.add_entry(NewEntry::file("A", b"a".to_vec())).unwrap();
        archive.add_entry(NewEntry::file("B", b"b".to_vec())).unwrap();
        archive.commit_transaction(false).unwrap();

        archive.start_transaction().unwrap();
        archive.delete_entry(0).unwrap();
        archive.commit_transaction(false).unwrap();

        let reopened = NufxArchive::open(stream).unwrap();
        assert_eq!(reopened.entries().len(), 1);
        assert_eq!(reopened.entries()[0].name, "B");
    }
}

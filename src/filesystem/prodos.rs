/// ProDOS filesystem implementation

use crate::archive::Part;
use crate::error::{ContainerError, Result};
use crate::filesystem::{DirEntry, FileAttributes, FileSystem, FileSystemInfo};
use crate::io::{ChunkAccess, BLOCK_SIZE};
use crate::notes::Notes;
use crate::partition::{Partition, PartitionMap};
use std::collections::HashSet;
use tracing::{debug, warn};

const VOLUME_DIR_BLOCK: u32 = 2;
const VOLUME_DIR_LAST: u32 = 5;
const ENTRY_LEN: usize = 0x27;
const ENTRIES_PER_BLOCK: usize = 0x0D;
const MAX_NAME_LEN: usize = 15;
const MAX_EOF: usize = 0xFF_FFFF;
const MAX_DIR_DEPTH: usize = 64;
const BITS_PER_BITMAP_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

const STORAGE_SEEDLING: u8 = 0x1;
const STORAGE_SAPLING: u8 = 0x2;
const STORAGE_TREE: u8 = 0x3;
const STORAGE_EXTENDED: u8 = 0x5;
const STORAGE_SUBDIR: u8 = 0xD;
const STORAGE_SUBDIR_HEADER: u8 = 0xE;
const STORAGE_VOLUME_HEADER: u8 = 0xF;

const ACCESS_UNLOCKED: u8 = 0xC3;
const ACCESS_LOCKED: u8 = 0x21;

const FILE_TYPE_DIR: u8 = 0x0F;

/// Is `name` a legal ProDOS filename?
pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_NAME_LEN
        && bytes[0].is_ascii_alphabetic()
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'.')
}

/// Turn an arbitrary name into a legal ProDOS filename
pub fn legalize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c.to_ascii_uppercase()
            } else {
                '.'
            }
        })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic()) {
        out.insert(0, 'A');
    }
    out.truncate(MAX_NAME_LEN);
    out
}

fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le_u24(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], 0])
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u24(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 3].copy_from_slice(&value.to_le_bytes()[..3]);
}

fn index_pointer(index: &[u8], i: usize) -> u32 {
    u16::from_le_bytes([index[i], index[256 + i]]) as u32
}

fn set_index_pointer(index: &mut [u8], i: usize, block: u32) {
    index[i] = block as u8;
    index[256 + i] = (block >> 8) as u8;
}

fn entry_offset(index: usize) -> usize {
    4 + index * ENTRY_LEN
}

fn read_name(entry: &[u8]) -> String {
    let len = (entry[0] & 0x0F) as usize;
    String::from_utf8_lossy(&entry[1..1 + len]).into_owned()
}

/// Number of blocks needed to store `len` bytes, index blocks included
/// Blocks needed for a new file with these forks
fn blocks_needed(data_len: usize, rsrc_len: Option<usize>) -> u32 {
    match rsrc_len {
        None => blocks_for(data_len),
        Some(rsrc_len) => blocks_for(data_len) + blocks_for(rsrc_len) + 1,
    }
}

fn blocks_for(len: usize) -> u32 {
    let n = len.div_ceil(BLOCK_SIZE).max(1) as u32;
    match n {
        1 => 1,
        2..=256 => n + 1,
        _ => n + n.div_ceil(256) + 1,
    }
}

/// Where a directory entry lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    block: u32,
    index: usize,
}

#[derive(Debug, Clone)]
struct RawEntry {
    storage_type: u8,
    name: String,
    file_type: u8,
    key_block: u32,
    blocks_used: u32,
    eof: u32,
    access: u8,
    aux_type: u16,
    location: Location,
    dir_key: u32,
}

impl RawEntry {
    fn parse(data: &[u8], location: Location, dir_key: u32) -> Option<Self> {
        let storage_type = data[0] >> 4;
        if storage_type == 0 {
            return None;
        }
        Some(Self {
            storage_type,
            name: read_name(data),
            file_type: data[0x10],
            key_block: le_u16(data, 0x11) as u32,
            blocks_used: le_u16(data, 0x13) as u32,
            eof: le_u24(data, 0x15),
            access: data[0x1E],
            aux_type: le_u16(data, 0x1F),
            location,
            dir_key,
        })
    }

    fn encode(&self, out: &mut [u8]) {
        out[..ENTRY_LEN].fill(0);
        out[0] = (self.storage_type << 4) | self.name.len() as u8;
        out[1..1 + self.name.len()].copy_from_slice(self.name.as_bytes());
        out[0x10] = self.file_type;
        put_u16(out, 0x11, self.key_block as u16);
        put_u16(out, 0x13, self.blocks_used as u16);
        put_u24(out, 0x15, self.eof);
        out[0x1E] = self.access;
        put_u16(out, 0x1F, self.aux_type);
        put_u16(out, 0x25, self.dir_key as u16);
    }

    fn is_directory(&self) -> bool {
        self.storage_type == STORAGE_SUBDIR
    }

    fn locked(&self) -> bool {
        self.access & 0x02 == 0
    }
}

/// Volume header fields needed to recognize a ProDOS volume
#[derive(Debug, Clone)]
struct VolumeHeader {
    name: String,
    file_count: u16,
    bitmap_block: u32,
    total_blocks: u32,
}

fn read_volume_header(chunks: &ChunkAccess) -> Result<VolumeHeader> {
    if chunks.block_count() <= VOLUME_DIR_LAST {
        return Err(ContainerError::invalid_format("too small for ProDOS"));
    }
    let block = chunks.read_block_vec(VOLUME_DIR_BLOCK)?;
    let header = &block[4..4 + ENTRY_LEN];
    let name = read_name(header);

    if le_u16(&block, 0) != 0
        || header[0] >> 4 != STORAGE_VOLUME_HEADER
        || !is_valid_name(&name)
        || header[0x1F] as usize != ENTRY_LEN
        || header[0x20] as usize != ENTRIES_PER_BLOCK
    {
        return Err(ContainerError::invalid_format("no ProDOS volume directory"));
    }

    let total_blocks = le_u16(header, 0x25) as u32;
    let bitmap_block = le_u16(header, 0x23) as u32;
    if total_blocks <= VOLUME_DIR_LAST || bitmap_block <= VOLUME_DIR_BLOCK || bitmap_block >= total_blocks {
        return Err(ContainerError::invalid_format("implausible ProDOS volume header"));
    }

    Ok(VolumeHeader {
        name,
        file_count: le_u16(header, 0x21),
        bitmap_block,
        total_blocks,
    })
}

/// A ProDOS volume
pub struct ProDosFileSystem {
    chunks: ChunkAccess,
    volume_name: String,
    total_blocks: u32,
    bitmap_block: u32,
    bitmap: Vec<u8>,
    notes: Notes,
}

impl ProDosFileSystem {
    /// Open the ProDOS volume at the start of `chunks`
    pub fn open(chunks: ChunkAccess) -> Result<Self> {
        let header = read_volume_header(&chunks)?;
        let mut notes = Notes::new();

        let mut total_blocks = header.total_blocks;
        if total_blocks > chunks.block_count() {
            notes.error(format!(
                "volume claims {} blocks but only {} are present",
                total_blocks,
                chunks.block_count()
            ));
            notes.mark_dubious();
            total_blocks = chunks.block_count();
        }

        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BITMAP_BLOCK);
        let mut bitmap = Vec::with_capacity(bitmap_blocks as usize * BLOCK_SIZE);
        for i in 0..bitmap_blocks {
            let block = header.bitmap_block + i;
            if block >= total_blocks {
                notes.error("volume bitmap runs past the end of the volume");
                notes.mark_dubious();
                bitmap.resize(bitmap_blocks as usize * BLOCK_SIZE, 0);
                break;
            }
            bitmap.extend_from_slice(&chunks.read_block_vec(block)?);
        }

        let mut fs = Self {
            chunks,
            volume_name: header.name,
            total_blocks,
            bitmap_block: header.bitmap_block,
            bitmap,
            notes,
        };
        fs.check(header.file_count)?;
        debug!(volume = %fs.volume_name, blocks = fs.total_blocks, "opened ProDOS volume");
        Ok(fs)
    }

    /// Write an empty ProDOS volume over `chunks` and open it
    pub fn format(chunks: ChunkAccess, volume_name: &str) -> Result<Self> {
        let name = legalize_name(volume_name);
        let total_blocks = chunks.block_count().min(u16::MAX as u32);
        let bitmap_block = VOLUME_DIR_LAST + 1;
        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BITMAP_BLOCK);
        let first_free = bitmap_block + bitmap_blocks;
        if total_blocks < first_free + 1 {
            return Err(ContainerError::filesystem("too few blocks for a ProDOS volume"));
        }

        for block in 0..first_free {
            chunks.zero_block(block)?;
        }

        for block in VOLUME_DIR_BLOCK..=VOLUME_DIR_LAST {
            let mut data = vec![0u8; BLOCK_SIZE];
            if block > VOLUME_DIR_BLOCK {
                put_u16(&mut data, 0, (block - 1) as u16);
            }
            if block < VOLUME_DIR_LAST {
                put_u16(&mut data, 2, (block + 1) as u16);
            }
            if block == VOLUME_DIR_BLOCK {
                let header = &mut data[4..4 + ENTRY_LEN];
                header[0] = (STORAGE_VOLUME_HEADER << 4) | name.len() as u8;
                header[1..1 + name.len()].copy_from_slice(name.as_bytes());
                header[0x1E] = ACCESS_UNLOCKED;
                header[0x1F] = ENTRY_LEN as u8;
                header[0x20] = ENTRIES_PER_BLOCK as u8;
                put_u16(header, 0x23, bitmap_block as u16);
                put_u16(header, 0x25, total_blocks as u16);
            }
            chunks.write_block(block, &data)?;
        }

        let mut bitmap = vec![0u8; bitmap_blocks as usize * BLOCK_SIZE];
        for block in first_free..total_blocks {
            bitmap[(block / 8) as usize] |= 0x80 >> (block % 8);
        }
        for (i, data) in bitmap.chunks(BLOCK_SIZE).enumerate() {
            chunks.write_block(bitmap_block + i as u32, data)?;
        }

        debug!(volume = %name, blocks = total_blocks, "formatted ProDOS volume");
        Self::open(chunks)
    }

    /// Number of blocks the volume occupies
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Walk every directory, recording damage in the notes
    fn check(&mut self, volume_file_count: u16) -> Result<()> {
        let mut visited = HashSet::new();
        let mut pending = vec![(VOLUME_DIR_BLOCK, volume_file_count, 0usize)];

        while let Some((key, expected, depth)) = pending.pop() {
            if depth > MAX_DIR_DEPTH || !visited.insert(key) {
                self.notes.error(format!("directory loop at block {}", key));
                self.notes.mark_dubious();
                continue;
            }
            let entries = match self.dir_entries(key) {
                Ok(entries) => entries,
                Err(e) => {
                    self.notes.error(format!("unreadable directory at block {}: {}", key, e));
                    self.notes.mark_dubious();
                    continue;
                }
            };
            if entries.len() != expected as usize {
                self.notes.warning(format!(
                    "directory at block {} lists {} files, header says {}",
                    key,
                    entries.len(),
                    expected
                ));
            }
            for entry in entries {
                if entry.key_block == 0 || entry.key_block >= self.total_blocks {
                    self.notes.error(format!(
                        "'{}' points to block {} outside the volume",
                        entry.name, entry.key_block
                    ));
                    self.notes.mark_dubious();
                    continue;
                }
                if entry.is_directory() {
                    let header = self.chunks.read_block_vec(entry.key_block)?;
                    if header[4] >> 4 != STORAGE_SUBDIR_HEADER {
                        self.notes
                            .error(format!("'{}' has a damaged directory header", entry.name));
                        self.notes.mark_dubious();
                        continue;
                    }
                    pending.push((entry.key_block, le_u16(&header, 4 + 0x21), depth + 1));
                }
            }
        }
        Ok(())
    }

    fn check_block(&self, block: u32) -> Result<u32> {
        if block >= self.total_blocks {
            return Err(ContainerError::filesystem(format!(
                "block {} outside the volume",
                block
            )));
        }
        Ok(block)
    }

    fn read_block(&self, block: u32) -> Result<Vec<u8>> {
        self.chunks.read_block_vec(self.check_block(block)?)
    }

    fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
        self.chunks.write_block(self.check_block(block)?, data)
    }

    /// Live entries of the directory whose key block is `key`
    fn dir_entries(&self, key: u32) -> Result<Vec<RawEntry>> {
        let mut entries = Vec::new();
        let mut block = key;
        let mut seen = HashSet::new();
        while block != 0 {
            if !seen.insert(block) {
                return Err(ContainerError::filesystem("directory block chain loops"));
            }
            let data = self.read_block(block)?;
            let first = if block == key { 1 } else { 0 };
            for index in first..ENTRIES_PER_BLOCK {
                let offset = entry_offset(index);
                let location = Location { block, index };
                if let Some(entry) = RawEntry::parse(&data[offset..offset + ENTRY_LEN], location, key) {
                    entries.push(entry);
                }
            }
            block = le_u16(&data, 2) as u32;
        }
        Ok(entries)
    }

    fn lookup(&self, path: &str) -> Result<Option<RawEntry>> {
        let mut dir = VOLUME_DIR_BLOCK;
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            let last = components.peek().is_none();
            let found = self
                .dir_entries(dir)?
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component));
            match found {
                None => return Ok(None),
                Some(entry) if last => return Ok(Some(entry)),
                Some(entry) if entry.is_directory() => dir = entry.key_block,
                Some(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    fn dir_key_block(&self, dir: &str) -> Result<u32> {
        if dir.split('/').all(|c| c.is_empty()) {
            return Ok(VOLUME_DIR_BLOCK);
        }
        match self.lookup(dir)? {
            Some(entry) if entry.is_directory() => Ok(entry.key_block),
            _ => Err(ContainerError::FileNotFound(dir.to_string())),
        }
    }

    /// Storage type, key block and EOF of one fork
    fn fork_of(&self, entry: &RawEntry, part: Part) -> Result<(u8, u32, u32)> {
        match (entry.storage_type, part) {
            (STORAGE_EXTENDED, Part::DataFork) | (STORAGE_EXTENDED, Part::RsrcFork) => {
                let key = self.read_block(entry.key_block)?;
                let base = if part == Part::RsrcFork { 0x100 } else { 0 };
                Ok((key[base], le_u16(&key, base + 1) as u32, le_u24(&key, base + 5)))
            }
            (STORAGE_SEEDLING..=STORAGE_TREE, Part::DataFork) => {
                Ok((entry.storage_type, entry.key_block, entry.eof))
            }
            _ => Err(ContainerError::FileNotFound(format!("{} ({:?})", entry.name, part))),
        }
    }

    /// Data block pointers of a fork; zero marks a sparse block
    fn data_blocks(&self, storage_type: u8, key: u32, count: usize) -> Result<Vec<u32>> {
        match storage_type {
            STORAGE_SEEDLING => Ok(vec![key; count.min(1)]),
            STORAGE_SAPLING => {
                let index = self.read_block(key)?;
                Ok((0..count.min(256)).map(|i| index_pointer(&index, i)).collect())
            }
            STORAGE_TREE => {
                let master = self.read_block(key)?;
                let mut blocks = Vec::with_capacity(count);
                for group in 0..count.div_ceil(256).min(128) {
                    let index_block = index_pointer(&master, group);
                    let in_group = (count - group * 256).min(256);
                    if index_block == 0 {
                        blocks.extend(std::iter::repeat(0).take(in_group));
                        continue;
                    }
                    let index = self.read_block(index_block)?;
                    blocks.extend((0..in_group).map(|i| index_pointer(&index, i)));
                }
                Ok(blocks)
            }
            other => Err(ContainerError::filesystem(format!(
                "unsupported storage type {}",
                other
            ))),
        }
    }

    /// Every block a file occupies, both forks and the extended key block included
    fn file_blocks(&self, entry: &RawEntry) -> Result<Vec<u32>> {
        let mut blocks = Vec::new();
        if entry.storage_type == STORAGE_EXTENDED {
            blocks.push(entry.key_block);
            for part in [Part::DataFork, Part::RsrcFork] {
                let (storage, key, _) = self.fork_of(entry, part)?;
                blocks.extend(self.fork_allocation(storage, key)?);
            }
        } else {
            blocks.extend(self.fork_allocation(entry.storage_type, entry.key_block)?);
        }
        Ok(blocks)
    }

    /// Every block a fork occupies, index blocks included
    fn fork_allocation(&self, storage_type: u8, key: u32) -> Result<Vec<u32>> {
        let mut blocks = vec![key];
        match storage_type {
            STORAGE_SAPLING => {
                let index = self.read_block(key)?;
                blocks.extend((0..256).map(|i| index_pointer(&index, i)).filter(|&b| b != 0));
            }
            STORAGE_TREE => {
                let master = self.read_block(key)?;
                for group in 0..128 {
                    let index_block = index_pointer(&master, group);
                    if index_block == 0 {
                        continue;
                    }
                    blocks.push(index_block);
                    let index = self.read_block(index_block)?;
                    blocks.extend((0..256).map(|i| index_pointer(&index, i)).filter(|&b| b != 0));
                }
            }
            _ => {}
        }
        Ok(blocks)
    }

    fn read_fork_data(&self, storage_type: u8, key: u32, eof: u32, raw: bool) -> Result<Vec<u8>> {
        let count = (eof as usize).div_ceil(BLOCK_SIZE);
        let mut data = Vec::with_capacity(count * BLOCK_SIZE);
        for block in self.data_blocks(storage_type, key, count)? {
            if block == 0 {
                data.extend_from_slice(&[0u8; BLOCK_SIZE]);
            } else {
                data.extend_from_slice(&self.read_block(block)?);
            }
        }
        if !raw {
            data.truncate(eof as usize);
        }
        Ok(data)
    }

    fn to_dir_entry(&self, raw: &RawEntry, path: String) -> Result<DirEntry> {
        let (data_len, rsrc_len) = if raw.storage_type == STORAGE_EXTENDED {
            let (_, _, data_eof) = self.fork_of(raw, Part::DataFork)?;
            let (_, _, rsrc_eof) = self.fork_of(raw, Part::RsrcFork)?;
            (data_eof as u64, Some(rsrc_eof as u64))
        } else {
            (raw.eof as u64, None)
        };
        Ok(DirEntry {
            path,
            name: raw.name.clone(),
            data_len,
            rsrc_len,
            is_directory: raw.is_directory(),
            attributes: FileAttributes {
                file_type: raw.file_type,
                aux_type: raw.aux_type,
                locked: raw.locked(),
            },
        })
    }

    fn walk(&self, key: u32, prefix: &str, depth: usize, out: &mut Vec<DirEntry>) -> Result<()> {
        if depth > MAX_DIR_DEPTH {
            return Err(ContainerError::filesystem("directories nested too deeply"));
        }
        for raw in self.dir_entries(key)? {
            let path = if prefix.is_empty() {
                raw.name.clone()
            } else {
                format!("{}/{}", prefix, raw.name)
            };
            out.push(self.to_dir_entry(&raw, path.clone())?);
            if raw.is_directory() {
                self.walk(raw.key_block, &path, depth + 1, out)?;
            }
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(ContainerError::ReadOnly(format!("ProDOS volume {}", self.volume_name)));
        }
        Ok(())
    }

    fn is_free(&self, block: u32) -> bool {
        self.bitmap[(block / 8) as usize] & (0x80 >> (block % 8)) != 0
    }

    fn free_count(&self) -> u32 {
        (0..self.total_blocks).filter(|&b| self.is_free(b)).count() as u32
    }

    fn allocate(&mut self) -> Result<u32> {
        let block = (0..self.total_blocks)
            .find(|&b| self.is_free(b))
            .ok_or(ContainerError::DiskFull)?;
        self.bitmap[(block / 8) as usize] &= !(0x80 >> (block % 8));
        Ok(block)
    }

    fn release(&mut self, block: u32) {
        if block < self.total_blocks {
            self.bitmap[(block / 8) as usize] |= 0x80 >> (block % 8);
        }
    }

    fn write_bitmap(&self) -> Result<()> {
        for (i, data) in self.bitmap.chunks(BLOCK_SIZE).enumerate() {
            self.write_block(self.bitmap_block + i as u32, data)?;
        }
        Ok(())
    }

    /// Allocate and write one fork, returning (storage type, key block, blocks used)
    fn write_fork(&mut self, data: &[u8]) -> Result<(u8, u32, u32)> {
        let count = data.len().div_ceil(BLOCK_SIZE).max(1);
        let mut data_blocks = Vec::with_capacity(count);
        for i in 0..count {
            let block = self.allocate()?;
            let mut buf = vec![0u8; BLOCK_SIZE];
            let start = i * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(data.len());
            if start < end {
                buf[..end - start].copy_from_slice(&data[start..end]);
            }
            self.write_block(block, &buf)?;
            data_blocks.push(block);
        }

        if count == 1 {
            return Ok((STORAGE_SEEDLING, data_blocks[0], 1));
        }

        let mut index_blocks = Vec::new();
        for group in data_blocks.chunks(256) {
            let block = self.allocate()?;
            let mut index = vec![0u8; BLOCK_SIZE];
            for (i, &b) in group.iter().enumerate() {
                set_index_pointer(&mut index, i, b);
            }
            self.write_block(block, &index)?;
            index_blocks.push(block);
        }

        if index_blocks.len() == 1 {
            return Ok((STORAGE_SAPLING, index_blocks[0], count as u32 + 1));
        }

        let master = self.allocate()?;
        let mut index = vec![0u8; BLOCK_SIZE];
        for (i, &b) in index_blocks.iter().enumerate() {
            set_index_pointer(&mut index, i, b);
        }
        self.write_block(master, &index)?;
        Ok((
            STORAGE_TREE,
            master,
            (count + index_blocks.len() + 1) as u32,
        ))
    }

    fn write_entry(&self, entry: &RawEntry) -> Result<()> {
        let mut block = self.read_block(entry.location.block)?;
        let offset = entry_offset(entry.location.index);
        entry.encode(&mut block[offset..offset + ENTRY_LEN]);
        self.write_block(entry.location.block, &block)
    }

    fn adjust_file_count(&self, dir_key: u32, delta: i32) -> Result<()> {
        let mut block = self.read_block(dir_key)?;
        let count = le_u16(&block, 4 + 0x21) as i32 + delta;
        put_u16(&mut block, 4 + 0x21, count.max(0) as u16);
        self.write_block(dir_key, &block)
    }

    /// Find an unused entry slot in a directory, growing subdirectories as needed
    fn free_slot(&mut self, dir_key: u32) -> Result<Location> {
        let mut block = dir_key;
        let mut last = dir_key;
        let mut seen = HashSet::new();
        while block != 0 && seen.insert(block) {
            let data = self.read_block(block)?;
            let first = if block == dir_key { 1 } else { 0 };
            for index in first..ENTRIES_PER_BLOCK {
                if data[entry_offset(index)] >> 4 == 0 {
                    return Ok(Location { block, index });
                }
            }
            last = block;
            block = le_u16(&data, 2) as u32;
        }

        if dir_key == VOLUME_DIR_BLOCK {
            return Err(ContainerError::filesystem("volume directory is full"));
        }

        let new_block = self.allocate()?;
        let mut data = vec![0u8; BLOCK_SIZE];
        put_u16(&mut data, 0, last as u16);
        self.write_block(new_block, &data)?;

        let mut prev = self.read_block(last)?;
        put_u16(&mut prev, 2, new_block as u16);
        self.write_block(last, &prev)?;

        // the parent's entry for this directory grows by one block
        let header = self.read_block(dir_key)?;
        let parent_block = le_u16(&header, 4 + 0x23) as u32;
        let parent_index = header[4 + 0x25] as usize;
        if parent_index >= 1 && parent_index <= ENTRIES_PER_BLOCK {
            let mut parent = self.read_block(parent_block)?;
            let offset = entry_offset(parent_index - 1);
            let used = le_u16(&parent, offset + 0x13) + 1;
            put_u16(&mut parent, offset + 0x13, used);
            put_u24(&mut parent, offset + 0x15, used as u32 * BLOCK_SIZE as u32);
            self.write_block(parent_block, &parent)?;
        }

        Ok(Location {
            block: new_block,
            index: 0,
        })
    }

    fn check_new_name(&self, dir_key: u32, name: &str) -> Result<()> {
        if !is_valid_name(name) {
            return Err(ContainerError::InvalidFilename(name.to_string()));
        }
        if self
            .dir_entries(dir_key)?
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(name))
        {
            return Err(ContainerError::FileExists(name.to_string()));
        }
        Ok(())
    }

    fn create_file(
        &mut self,
        dir_key: u32,
        name: &str,
        attributes: &FileAttributes,
        data: &[u8],
        rsrc: Option<&[u8]>,
    ) -> Result<RawEntry> {
        if blocks_needed(data.len(), rsrc.map(<[u8]>::len)) > self.free_count() {
            return Err(ContainerError::DiskFull);
        }

        let location = self.free_slot(dir_key)?;
        let (storage_type, key_block, blocks_used, eof) = match rsrc {
            None => {
                let (storage, key, used) = self.write_fork(data)?;
                (storage, key, used, data.len() as u32)
            }
            Some(rsrc) => {
                let key = self.allocate()?;
                let (d_storage, d_key, d_used) = self.write_fork(data)?;
                let (r_storage, r_key, r_used) = self.write_fork(rsrc)?;
                let mut block = vec![0u8; BLOCK_SIZE];
                for (base, storage, fork_key, used, len) in [
                    (0usize, d_storage, d_key, d_used, data.len()),
                    (0x100, r_storage, r_key, r_used, rsrc.len()),
                ] {
                    block[base] = storage;
                    put_u16(&mut block, base + 1, fork_key as u16);
                    put_u16(&mut block, base + 3, used as u16);
                    put_u24(&mut block, base + 5, len as u32);
                }
                self.write_block(key, &block)?;
                (STORAGE_EXTENDED, key, d_used + r_used + 1, BLOCK_SIZE as u32)
            }
        };

        let entry = RawEntry {
            storage_type,
            name: name.to_ascii_uppercase(),
            file_type: attributes.file_type,
            key_block,
            blocks_used,
            eof,
            access: if attributes.locked {
                ACCESS_LOCKED
            } else {
                ACCESS_UNLOCKED
            },
            aux_type: attributes.aux_type,
            location,
            dir_key,
        };
        self.write_entry(&entry)?;
        self.adjust_file_count(dir_key, 1)?;
        Ok(entry)
    }

    fn make_directory(&mut self, parent_key: u32, name: &str) -> Result<RawEntry> {
        if self.free_count() < 1 {
            return Err(ContainerError::DiskFull);
        }
        let location = self.free_slot(parent_key)?;
        let key = self.allocate()?;

        let mut block = vec![0u8; BLOCK_SIZE];
        {
            let header = &mut block[4..4 + ENTRY_LEN];
            header[0] = (STORAGE_SUBDIR_HEADER << 4) | name.len() as u8;
            header[1..1 + name.len()].copy_from_slice(name.as_bytes());
            header[0x10] = 0x75;
            header[0x1E] = ACCESS_UNLOCKED;
            header[0x1F] = ENTRY_LEN as u8;
            header[0x20] = ENTRIES_PER_BLOCK as u8;
            put_u16(header, 0x23, location.block as u16);
            header[0x25] = (location.index + 1) as u8;
            header[0x26] = ENTRY_LEN as u8;
        }
        self.write_block(key, &block)?;

        let entry = RawEntry {
            storage_type: STORAGE_SUBDIR,
            name: name.to_string(),
            file_type: FILE_TYPE_DIR,
            key_block: key,
            blocks_used: 1,
            eof: BLOCK_SIZE as u32,
            access: ACCESS_UNLOCKED,
            aux_type: 0,
            location,
            dir_key: parent_key,
        };
        self.write_entry(&entry)?;
        self.adjust_file_count(parent_key, 1)?;
        Ok(entry)
    }

    /// Run a modifying operation, restoring the bitmap if it fails
    fn modify<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_writable()?;
        let snapshot = self.bitmap.clone();
        match op(self) {
            Ok(value) => {
                self.write_bitmap()?;
                Ok(value)
            }
            Err(e) => {
                self.bitmap = snapshot;
                Err(e)
            }
        }
    }
}

fn split_path(path: &str) -> (&str, &str) {
    let path = path.trim_matches('/');
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

impl FileSystem for ProDosFileSystem {
    fn fs_type(&self) -> &'static str {
        "ProDOS"
    }

    fn volume_name(&self) -> Option<String> {
        Some(self.volume_name.clone())
    }

    fn notes(&self) -> &Notes {
        &self.notes
    }

    fn is_read_only(&self) -> bool {
        self.chunks.is_read_only() || self.notes.is_dubious()
    }

    fn max_name_len(&self) -> usize {
        MAX_NAME_LEN
    }

    fn adjust_name(&self, name: &str) -> String {
        legalize_name(name)
    }

    fn read_dir(&self) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        self.walk(VOLUME_DIR_BLOCK, "", 0, &mut out)?;
        Ok(out)
    }

    fn find(&self, path: &str) -> Result<Option<DirEntry>> {
        match self.lookup(path)? {
            Some(raw) => {
                let (dir, _) = split_path(path);
                let full = if dir.is_empty() {
                    raw.name.clone()
                } else {
                    format!("{}/{}", dir, raw.name)
                };
                Ok(Some(self.to_dir_entry(&raw, full)?))
            }
            None => Ok(None),
        }
    }

    fn read_fork(&self, path: &str, part: Part, raw: bool) -> Result<Vec<u8>> {
        let entry = self
            .lookup(path)?
            .ok_or_else(|| ContainerError::FileNotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(ContainerError::filesystem(format!("{} is a directory", path)));
        }
        let (storage, key, eof) = self.fork_of(&entry, part)?;
        self.read_fork_data(storage, key, eof, raw)
    }

    fn write_file(
        &mut self,
        dir: &str,
        name: &str,
        attributes: &FileAttributes,
        data: &[u8],
        rsrc: Option<&[u8]>,
    ) -> Result<DirEntry> {
        if data.len() > MAX_EOF || rsrc.map_or(false, |r| r.len() > MAX_EOF) {
            return Err(ContainerError::filesystem(format!("{} is too large for ProDOS", name)));
        }
        let dir_key = self.dir_key_block(dir)?;
        self.check_new_name(dir_key, name)?;
        let raw = self.modify(|fs| fs.create_file(dir_key, name, attributes, data, rsrc))?;

        let dir = dir.trim_matches('/');
        let path = if dir.is_empty() {
            raw.name.clone()
        } else {
            format!("{}/{}", dir, raw.name)
        };
        debug!(path = %path, len = data.len(), "wrote ProDOS file");
        self.to_dir_entry(&raw, path)
    }

    fn replace_file(
        &mut self,
        path: &str,
        attributes: &FileAttributes,
        data: &[u8],
        rsrc: Option<&[u8]>,
    ) -> Result<DirEntry> {
        self.ensure_writable()?;
        if data.len() > MAX_EOF || rsrc.map_or(false, |r| r.len() > MAX_EOF) {
            return Err(ContainerError::filesystem(format!("{} is too large for ProDOS", path)));
        }
        let entry = self
            .lookup(path)?
            .ok_or_else(|| ContainerError::FileNotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(ContainerError::FileExists(path.to_string()));
        }
        let freed = self.file_blocks(&entry)?.len() as u32;
        if blocks_needed(data.len(), rsrc.map(<[u8]>::len)) > self.free_count() + freed {
            return Err(ContainerError::DiskFull);
        }

        let old = self.to_dir_entry(&entry, path.to_string())?;
        let old_data = self.read_fork(path, Part::DataFork, false)?;
        let old_rsrc = match old.rsrc_len {
            Some(_) => Some(self.read_fork(path, Part::RsrcFork, false)?),
            None => None,
        };
        let (dir, _) = split_path(path);
        self.delete_file(path)?;
        match self.write_file(dir, &entry.name, attributes, data, rsrc) {
            Ok(written) => Ok(written),
            Err(e) => {
                warn!(path = %path, error = %e, "replacement failed, restoring the original");
                self.write_file(dir, &entry.name, &old.attributes, &old_data, old_rsrc.as_deref())?;
                Err(e)
            }
        }
    }

    fn create_directory(&mut self, path: &str) -> Result<()> {
        let mut key = VOLUME_DIR_BLOCK;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let existing = self
                .dir_entries(key)?
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component));
            key = match existing {
                Some(entry) if entry.is_directory() => entry.key_block,
                Some(entry) => return Err(ContainerError::FileExists(entry.name)),
                None => {
                    if !is_valid_name(component) {
                        return Err(ContainerError::InvalidFilename(component.to_string()));
                    }
                    let name = component.to_ascii_uppercase();
                    self.modify(|fs| fs.make_directory(key, &name))?.key_block
                }
            };
        }
        Ok(())
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        let entry = self
            .lookup(path)?
            .ok_or_else(|| ContainerError::FileNotFound(path.to_string()))?;

        let mut blocks = Vec::new();
        match entry.storage_type {
            STORAGE_SUBDIR => {
                if !self.dir_entries(entry.key_block)?.is_empty() {
                    return Err(ContainerError::filesystem(format!("{} is not empty", path)));
                }
                let mut block = entry.key_block;
                while block != 0 && !blocks.contains(&block) {
                    blocks.push(block);
                    block = le_u16(&self.read_block(block)?, 2) as u32;
                }
            }
            _ => blocks.extend(self.file_blocks(&entry)?),
        }

        self.modify(|fs| {
            for block in blocks {
                fs.release(block);
            }
            let mut data = fs.read_block(entry.location.block)?;
            let offset = entry_offset(entry.location.index);
            data[offset..offset + ENTRY_LEN].fill(0);
            fs.write_block(entry.location.block, &data)?;
            fs.adjust_file_count(entry.dir_key, -1)
        })?;
        debug!(path = %path, "deleted ProDOS file");
        Ok(())
    }

    fn info(&self) -> FileSystemInfo {
        FileSystemInfo {
            fs_type: "ProDOS".to_string(),
            volume_name: Some(self.volume_name.clone()),
            total_blocks: self.total_blocks as usize,
            free_blocks: self.free_count() as usize,
            block_size: BLOCK_SIZE,
        }
    }

    fn embedded_volumes(&self) -> Result<Option<PartitionMap>> {
        let available = self.chunks.block_count();
        let mut start = self.total_blocks;
        let mut partitions = Vec::new();

        while start < available {
            let rest = self.chunks.sub_range(start, available - start)?;
            let header = match read_volume_header(&rest) {
                Ok(header) if header.total_blocks <= available - start => header,
                _ => break,
            };
            let chunks = self.chunks.sub_range(start, header.total_blocks)?;
            partitions.push(Partition::new(header.name, "ProDOS", start, chunks));
            start += header.total_blocks;
        }

        if partitions.is_empty() {
            Ok(None)
        } else {
            debug!(count = partitions.len(), "found embedded volumes");
            Ok(Some(PartitionMap::embedded(partitions)))
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.is_read_only() {
            self.write_bitmap()?;
        }
        self.chunks.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SectorOrder;
    use crate::io::SharedStream;

    fn blank(blocks: u32) -> (SharedStream, ProDosFileSystem) {
        let stream = SharedStream::from_bytes(vec![0u8; blocks as usize * BLOCK_SIZE]);
        let chunks = ChunkAccess::new(stream.clone(), 0, blocks, SectorOrder::ProDos);
        let fs = ProDosFileSystem::format(chunks, "Test.Vol").unwrap();
        (stream, fs)
    }

    fn reopen(stream: &SharedStream, blocks: u32) -> ProDosFileSystem {
        ProDosFileSystem::open(ChunkAccess::new(stream.clone(), 0, blocks, SectorOrder::ProDos)).unwrap()
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("HELLO.WORLD"));
        assert!(!is_valid_name("1HELLO"));
        assert!(!is_valid_name("SIXTEEN.CHARS.XX"));
        assert!(!is_valid_name("HAS SPACE"));
        assert_eq!(legalize_name("my file.txt"), "MY.FILE.TXT");
        assert_eq!(legalize_name("1st"), "A1ST");
        assert_eq!(legalize_name("a_very_long_filename"), "A.VERY.LONG.FIL");
    }

    #[test]
    fn test_format_empty_volume() {
        let (_, fs) = blank(280);
        assert_eq!(fs.volume_name(), Some("TEST.VOL".to_string()));
        assert!(fs.read_dir().unwrap().is_empty());
        assert_eq!(fs.notes().warning_count(), 0);
        // boot, directory and bitmap blocks are in use
        assert_eq!(fs.info().free_blocks, 280 - 7);
    }

    #[test]
    fn test_write_read_sizes() {
        let (stream, mut fs) = blank(1600);
        let seedling = vec![0x11u8; 100];
        let sapling = (0..5000).map(|i| i as u8).collect::<Vec<_>>();
        let tree = (0..140_000).map(|i| (i * 7) as u8).collect::<Vec<_>>();

        fs.write_file("", "SEED", &FileAttributes::default(), &seedling, None).unwrap();
        fs.write_file("", "SAP", &FileAttributes::default(), &sapling, None).unwrap();
        fs.write_file("", "TREE", &FileAttributes::default(), &tree, None).unwrap();
        fs.flush().unwrap();

        let fs = reopen(&stream, 1600);
        assert_eq!(fs.notes().warning_count(), 0);
        assert_eq!(fs.read_file("seed").unwrap(), seedling);
        assert_eq!(fs.read_file("SAP").unwrap(), sapling);
        assert_eq!(fs.read_file("TREE").unwrap(), tree);
        assert_eq!(fs.read_fork("SEED", Part::DataFork, true).unwrap().len(), BLOCK_SIZE);
    }

    #[test]
    fn test_subdirectories_and_growth() {
        let (stream, mut fs) = blank(280);
        fs.create_directory("GAMES/ARCADE").unwrap();
        for i in 0..20 {
            let attrs = FileAttributes {
                file_type: 0x06,
                aux_type: 0x2000,
                locked: false,
            };
            fs.write_file("games/arcade", &format!("F{}", i), &attrs, &[i as u8; 10], None)
                .unwrap();
        }

        let fs = reopen(&stream, 280);
        assert_eq!(fs.notes().warning_count(), 0);
        let entries = fs.read_dir().unwrap();
        assert_eq!(entries.len(), 22);
        let f19 = fs.find("GAMES/ARCADE/F19").unwrap().unwrap();
        assert_eq!(f19.attributes.file_type, 0x06);
        assert_eq!(f19.parent_path(), "GAMES/ARCADE");
        assert_eq!(fs.read_file("GAMES/ARCADE/F19").unwrap(), vec![19u8; 10]);
    }

    #[test]
    fn test_extended_file() {
        let (stream, mut fs) = blank(280);
        fs.write_file("", "FORKED", &FileAttributes::default(), b"data", Some(&b"resource"[..]))
            .unwrap();

        let fs = reopen(&stream, 280);
        let entry = fs.find("FORKED").unwrap().unwrap();
        assert_eq!(entry.data_len, 4);
        assert_eq!(entry.rsrc_len, Some(8));
        assert_eq!(fs.read_fork("FORKED", Part::RsrcFork, false).unwrap(), b"resource");
        assert_eq!(fs.read_file("FORKED").unwrap(), b"data");
    }

    #[test]
    fn test_delete_frees_blocks() {
        let (_, mut fs) = blank(280);
        let before = fs.info().free_blocks;
        fs.write_file("", "BIG", &FileAttributes::default(), &[0u8; 20_000], None).unwrap();
        assert!(fs.info().free_blocks < before);
        fs.delete_file("BIG").unwrap();
        assert_eq!(fs.info().free_blocks, before);
        assert!(fs.find("BIG").unwrap().is_none());
    }

    #[test]
    fn test_replace_checks_space_first() {
        let (_, mut fs) = blank(280);
        fs.write_file("", "BIG", &FileAttributes::default(), &[7u8; 40_000], None).unwrap();
        let free = fs.info().free_blocks;

        let result = fs.replace_file("BIG", &FileAttributes::default(), &vec![1u8; 200_000], None);
        assert!(matches!(result, Err(ContainerError::DiskFull)));
        assert_eq!(fs.read_file("BIG").unwrap(), vec![7u8; 40_000]);
        assert_eq!(fs.info().free_blocks, free);

        // only fits once the old file's blocks are counted
        let len = (free + 40) * BLOCK_SIZE;
        let attributes = FileAttributes {
            file_type: 0x06,
            aux_type: 0x2000,
            locked: false,
        };
        let replaced = fs.replace_file("big", &attributes, &vec![2u8; len], None).unwrap();
        assert_eq!(replaced.name, "BIG");
        assert_eq!(replaced.attributes.file_type, 0x06);
        assert_eq!(fs.read_file("BIG").unwrap().len(), len);
    }

    #[test]
    fn test_collisions_and_bad_names() {
        let (_, mut fs) = blank(280);
        fs.write_file("", "A", &FileAttributes::default(), b"1", None).unwrap();
        assert!(matches!(
            fs.write_file("", "a", &FileAttributes::default(), b"2", None),
            Err(ContainerError::FileExists(_))
        ));
        assert!(matches!(
            fs.write_file("", "BAD NAME", &FileAttributes::default(), b"2", None),
            Err(ContainerError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_disk_full() {
        let (_, mut fs) = blank(280);
        let free = fs.info().free_blocks;
        let result = fs.write_file("", "HUGE", &FileAttributes::default(), &vec![1u8; free * BLOCK_SIZE], None);
        assert!(matches!(result, Err(ContainerError::DiskFull)));
        assert_eq!(fs.info().free_blocks, free);
    }

    #[test]
    fn test_file_count_mismatch_is_warning() {
        let (stream, mut fs) = blank(280);
        fs.write_file("", "A", &FileAttributes::default(), b"1", None).unwrap();
        // bump the volume header's file count
        let offset = 2 * BLOCK_SIZE + 4 + 0x21;
        stream.write_at(offset as u64, &[5]).unwrap();

        let fs = reopen(&stream, 280);
        assert_eq!(fs.notes().warning_count(), 1);
        assert!(!fs.notes().is_dubious());
    }

    #[test]
    fn test_bad_pointer_is_dubious() {
        let (stream, mut fs) = blank(280);
        fs.write_file("", "A", &FileAttributes::default(), b"1", None).unwrap();
        // key pointer of the first file entry
        let offset = 2 * BLOCK_SIZE + entry_offset(1) + 0x11;
        stream.write_at(offset as u64, &[0xFF, 0x7F]).unwrap();

        let fs = reopen(&stream, 280);
        assert!(fs.notes().is_dubious());
        assert!(fs.is_read_only());
    }

    #[test]
    fn test_embedded_volumes() {
        let stream = SharedStream::from_bytes(vec![0u8; 600 * BLOCK_SIZE]);
        let all = ChunkAccess::new(stream.clone(), 0, 600, SectorOrder::ProDos);
        ProDosFileSystem::format(all.sub_range(200, 200).unwrap(), "SECOND").unwrap();
        ProDosFileSystem::format(all.sub_range(400, 200).unwrap(), "THIRD").unwrap();
        let host = ProDosFileSystem::format(all.sub_range(0, 200).unwrap(), "HOST").unwrap();

        // reopen the host over the whole image so the trailing blocks are visible
        let host_all = ProDosFileSystem::open(all).unwrap();
        assert_eq!(host_all.total_blocks(), 200);
        assert!(host.embedded_volumes().unwrap().is_none());

        let map = host_all.embedded_volumes().unwrap().unwrap();
        let names: Vec<_> = map.partitions().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["SECOND", "THIRD"]);
        assert_eq!(map.partitions()[1].start_block(), 400);
    }

    #[test]
    fn test_not_prodos() {
        let stream = SharedStream::from_bytes(vec![0u8; 280 * BLOCK_SIZE]);
        let chunks = ChunkAccess::new(stream, 0, 280, SectorOrder::ProDos);
        assert!(ProDosFileSystem::open(chunks).is_err());
    }
}

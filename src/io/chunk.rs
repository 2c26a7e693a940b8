/// Block-level access to disk image data

use crate::error::{ContainerError, Result};
use crate::format::SectorOrder;
use crate::io::SharedStream;

/// Size of a ProDOS block in bytes
pub const BLOCK_SIZE: usize = 512;

/// Size of a 5.25" sector in bytes
pub const SECTOR_SIZE: usize = 256;

/// Number of blocks on a 140K 5.25" disk
pub const FLOPPY_525_BLOCKS: u32 = 280;

/// DOS 3.3 sector pairs that hold each ProDOS block within a track
const DOS_BLOCK_SECTORS: [(u64, u64); 8] = [
    (0, 14),
    (13, 12),
    (11, 10),
    (9, 8),
    (7, 6),
    (5, 4),
    (3, 2),
    (1, 15),
];

/// Block access to a region of a shared stream
///
/// The region starts `byte_start` bytes into the stream. Block numbers passed
/// to [`ChunkAccess::read_block`] are relative to `first_block`, which lets a
/// partition or embedded volume present its own block 0 while the sector
/// ordering is still applied to the absolute block number.
#[derive(Debug, Clone)]
pub struct ChunkAccess {
    stream: SharedStream,
    byte_start: u64,
    first_block: u32,
    block_count: u32,
    order: SectorOrder,
    read_only: bool,
}

impl ChunkAccess {
    /// Create block access over `block_count` blocks at `byte_start`
    pub fn new(stream: SharedStream, byte_start: u64, block_count: u32, order: SectorOrder) -> Self {
        Self {
            stream,
            byte_start,
            first_block: 0,
            block_count,
            order,
            read_only: false,
        }
    }

    /// Return a copy restricted to `count` blocks starting at `start`
    pub fn sub_range(&self, start: u32, count: u32) -> Result<ChunkAccess> {
        if start.checked_add(count).map_or(true, |end| end > self.block_count) {
            return Err(ContainerError::invalid_format(format!(
                "block range {}+{} exceeds {} blocks",
                start, count, self.block_count
            )));
        }
        Ok(Self {
            stream: self.stream.clone(),
            byte_start: self.byte_start,
            first_block: self.first_block + start,
            block_count: count,
            order: self.order,
            read_only: self.read_only,
        })
    }

    /// Return a copy using a different sector order
    pub fn with_order(&self, order: SectorOrder) -> ChunkAccess {
        let mut copy = self.clone();
        copy.order = order;
        copy
    }

    /// Return a copy with the read-only flag set
    pub fn read_only(mut self, read_only: bool) -> ChunkAccess {
        self.read_only = read_only;
        self
    }

    /// Number of blocks
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Sector order applied to block numbers
    pub fn order(&self) -> SectorOrder {
        self.order
    }

    /// Is writing disallowed?
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The underlying stream
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    fn check_block(&self, block: u32) -> Result<u32> {
        if block >= self.block_count {
            return Err(ContainerError::invalid_format(format!(
                "block {} out of range (max {})",
                block,
                self.block_count.saturating_sub(1)
            )));
        }
        Ok(self.first_block + block)
    }

    /// Byte offsets of the two 256-byte halves of an absolute block
    fn block_offsets(&self, abs_block: u32) -> (u64, u64) {
        match self.order {
            SectorOrder::Dos => {
                let track = (abs_block / 8) as u64;
                let (s1, s2) = DOS_BLOCK_SECTORS[(abs_block % 8) as usize];
                let track_start = self.byte_start + track * 16 * SECTOR_SIZE as u64;
                (
                    track_start + s1 * SECTOR_SIZE as u64,
                    track_start + s2 * SECTOR_SIZE as u64,
                )
            }
            _ => {
                let offset = self.byte_start + abs_block as u64 * BLOCK_SIZE as u64;
                (offset, offset + SECTOR_SIZE as u64)
            }
        }
    }

    /// Read one block into `buf`
    pub fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(ContainerError::invariant("block buffer must be 512 bytes"));
        }
        let abs = self.check_block(block)?;
        let (first, second) = self.block_offsets(abs);
        self.stream.read_at(first, &mut buf[..SECTOR_SIZE])?;
        self.stream.read_at(second, &mut buf[SECTOR_SIZE..])?;
        Ok(())
    }

    /// Read one block into a new buffer
    pub fn read_block_vec(&self, block: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block(block, &mut buf)?;
        Ok(buf)
    }

    /// Write one block
    pub fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(ContainerError::ReadOnly("disk image".to_string()));
        }
        if data.len() != BLOCK_SIZE {
            return Err(ContainerError::invariant("block data must be 512 bytes"));
        }
        let abs = self.check_block(block)?;
        let (first, second) = self.block_offsets(abs);
        self.stream.write_at(first, &data[..SECTOR_SIZE])?;
        self.stream.write_at(second, &data[SECTOR_SIZE..])?;
        Ok(())
    }

    /// Fill a block with zeroes
    pub fn zero_block(&self, block: u32) -> Result<()> {
        self.write_block(block, &[0u8; BLOCK_SIZE])
    }

    /// Flush the underlying stream
    pub fn flush(&self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }
}

/// 2IMG header parsing and writing

use crate::error::{ContainerError, Result};
use crate::format::{SectorOrder, TWOIMG_SIGNATURE};
use crate::io::BLOCK_SIZE;

/// Length of the 2IMG header
pub const HEADER_LEN: usize = 64;

const VERSION: u16 = 1;
const CREATOR: &[u8] = b"A2NS";
const FLAG_LOCKED: u32 = 0x8000_0000;
const FLAG_VOLUME_VALID: u32 = 0x0000_0100;

/// Image data format recorded in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// 5.25" sectors in DOS 3.3 order
    DosOrder,
    /// Blocks in ProDOS order
    ProDosOrder,
    /// Nibblized 5.25" data
    Nibble,
}

impl ImageFormat {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ImageFormat::DosOrder),
            1 => Some(ImageFormat::ProDosOrder),
            2 => Some(ImageFormat::Nibble),
            _ => None,
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            ImageFormat::DosOrder => 0,
            ImageFormat::ProDosOrder => 1,
            ImageFormat::Nibble => 2,
        }
    }

    /// Sector order implied by the format
    pub fn sector_order(self) -> SectorOrder {
        match self {
            ImageFormat::DosOrder => SectorOrder::Dos,
            ImageFormat::ProDosOrder => SectorOrder::ProDos,
            ImageFormat::Nibble => SectorOrder::Unknown,
        }
    }
}

/// Parsed 2IMG header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoImgHeader {
    /// Four-character creator code
    pub creator: String,
    /// Data format
    pub format: ImageFormat,
    /// Image is write-protected
    pub locked: bool,
    /// DOS volume number, when recorded
    pub volume: Option<u8>,
    /// Block count (ProDOS-order images)
    pub blocks: u32,
    /// Offset of the disk data
    pub data_offset: u32,
    /// Length of the disk data
    pub data_len: u32,
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

impl TwoImgHeader {
    /// Header for a new image of `blocks` blocks
    pub fn new(format: ImageFormat, blocks: u32) -> Self {
        Self {
            creator: String::from_utf8_lossy(CREATOR).into_owned(),
            format,
            locked: false,
            volume: None,
            blocks: if format == ImageFormat::ProDosOrder { blocks } else { 0 },
            data_offset: HEADER_LEN as u32,
            data_len: blocks * BLOCK_SIZE as u32,
        }
    }

    /// Parse a header, checking it against the stream length
    pub fn parse(data: &[u8], stream_len: u64) -> Result<Self> {
        if data.len() < HEADER_LEN || !data.starts_with(TWOIMG_SIGNATURE) {
            return Err(ContainerError::invalid_format("not a 2IMG file"));
        }
        let header_len = le_u16(data, 8) as u32;
        let format = ImageFormat::from_u32(le_u32(data, 12))
            .ok_or_else(|| ContainerError::parse(12, "unknown 2IMG image format"))?;
        let flags = le_u32(data, 16);
        let blocks = le_u32(data, 20);
        let mut data_offset = le_u32(data, 24);
        let mut data_len = le_u32(data, 28);

        if data_offset == 0 {
            data_offset = header_len.max(HEADER_LEN as u32);
        }
        if data_len == 0 && format == ImageFormat::ProDosOrder {
            data_len = blocks * BLOCK_SIZE as u32;
        }
        if data_offset as u64 + data_len as u64 > stream_len {
            return Err(ContainerError::parse(24, "2IMG data runs past the end of the file"));
        }

        Ok(Self {
            creator: String::from_utf8_lossy(&data[4..8]).into_owned(),
            format,
            locked: flags & FLAG_LOCKED != 0,
            volume: (flags & FLAG_VOLUME_VALID != 0).then_some(flags as u8),
            blocks,
            data_offset,
            data_len,
        })
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        out[..4].copy_from_slice(TWOIMG_SIGNATURE);
        let creator = self.creator.as_bytes();
        let n = creator.len().min(4);
        out[4..4 + n].copy_from_slice(&creator[..n]);
        out[8..10].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        out[10..12].copy_from_slice(&VERSION.to_le_bytes());
        out[12..16].copy_from_slice(&self.format.to_u32().to_le_bytes());
        let mut flags = 0u32;
        if self.locked {
            flags |= FLAG_LOCKED;
        }
        if let Some(volume) = self.volume {
            flags |= FLAG_VOLUME_VALID | volume as u32;
        }
        out[16..20].copy_from_slice(&flags.to_le_bytes());
        out[20..24].copy_from_slice(&self.blocks.to_le_bytes());
        out[24..28].copy_from_slice(&self.data_offset.to_le_bytes());
        out[28..32].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let mut header = TwoImgHeader::new(ImageFormat::ProDosOrder, 1600);
        header.locked = true;
        header.volume = Some(254);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], b"2IMG");

        let parsed = TwoImgHeader::parse(&bytes, 64 + 1600 * 512).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.format.sector_order(), SectorOrder::ProDos);
    }

    #[test]
    fn test_truncated_data() {
        let bytes = TwoImgHeader::new(ImageFormat::ProDosOrder, 280).to_bytes();
        assert!(TwoImgHeader::parse(&bytes, 64 + 1000).is_err());
    }

    #[test]
    fn test_unknown_format() {
        let mut bytes = TwoImgHeader::new(ImageFormat::DosOrder, 280).to_bytes();
        bytes[12] = 9;
        assert!(TwoImgHeader::parse(&bytes, 64 + 280 * 512).is_err());
    }
}

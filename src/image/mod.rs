/// Disk images: unadorned block/sector images and 2IMG

/// Builder for creating blank disk images
pub mod builder;
/// 2IMG header
pub mod twoimg;

pub use builder::DiskImageBuilder;
pub use twoimg::{ImageFormat, TwoImgHeader};

use crate::error::{ContainerError, Result};
use crate::filesystem::{self, FileSystem};
use crate::format::{FileKind, SectorOrder};
use crate::io::{ChunkAccess, SharedStream, BLOCK_SIZE};
use crate::notes::Notes;
use crate::partition::{apm, PartitionMap};
use std::fmt;
use tracing::debug;

/// What analysis found inside a disk image
pub enum Contents {
    /// A single filesystem
    FileSystem(Box<dyn FileSystem>),
    /// A partition map
    PartitionMap(PartitionMap),
}

impl fmt::Debug for Contents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contents::FileSystem(fs) => write!(f, "FileSystem({})", fs.fs_type()),
            Contents::PartitionMap(map) => write!(f, "PartitionMap({:?})", map.kind()),
        }
    }
}

/// An opened disk image
pub struct DiskImage {
    kind: FileKind,
    stream: SharedStream,
    header: Option<TwoImgHeader>,
    chunks: ChunkAccess,
    notes: Notes,
    contents: Option<Contents>,
}

impl fmt::Debug for DiskImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskImage")
            .field("kind", &self.kind)
            .field("order", &self.chunks.order())
            .field("blocks", &self.chunks.block_count())
            .field("contents", &self.contents)
            .finish()
    }
}

impl DiskImage {
    /// Open a disk image of the given kind on `stream`
    ///
    /// Only the container is validated here; call [`DiskImage::analyze`] to
    /// look for a filesystem or partition map.
    pub fn open(stream: SharedStream, kind: FileKind, order: SectorOrder) -> Result<Self> {
        let len = stream.len()?;
        let mut notes = Notes::new();

        let (header, start, data_len, order) = match kind {
            FileKind::TwoImg => {
                let mut raw = [0u8; twoimg::HEADER_LEN];
                stream.read_at(0, &mut raw)?;
                let header = TwoImgHeader::parse(&raw, len)?;
                if header.format == ImageFormat::Nibble {
                    return Err(ContainerError::unsupported("nibble 2IMG images"));
                }
                if header.locked {
                    notes.info("image is write-protected");
                }
                let (start, data_len, order) = (
                    header.data_offset as u64,
                    header.data_len as u64,
                    header.format.sector_order(),
                );
                (Some(header), start, data_len, order)
            }
            FileKind::UnadornedSector => (None, 0, len, order),
            other => {
                return Err(ContainerError::invalid_format(format!(
                    "{} is not a disk image",
                    other.name()
                )))
            }
        };

        if data_len == 0 || data_len % BLOCK_SIZE as u64 != 0 {
            return Err(ContainerError::invalid_format(format!(
                "disk data length {} is not a whole number of blocks",
                data_len
            )));
        }
        let blocks = u32::try_from(data_len / BLOCK_SIZE as u64)
            .map_err(|_| ContainerError::invalid_format("disk image too large"))?;
        let read_only = header.as_ref().map_or(false, |h| h.locked);
        let chunks = ChunkAccess::new(stream.clone(), start, blocks, order).read_only(read_only);

        debug!(kind = kind.name(), blocks, order = ?order, "opened disk image");
        Ok(Self {
            kind,
            stream,
            header,
            chunks,
            notes,
            contents: None,
        })
    }

    /// Look for a partition map or filesystem, probing sector orders as needed
    ///
    /// Returns true if something recognizable was found.
    pub fn analyze(&mut self) -> bool {
        if self.contents.is_some() {
            return true;
        }
        let len = self.chunks.block_count() as u64 * BLOCK_SIZE as u64;

        for order in self.chunks.order().candidates(len) {
            let chunks = self.chunks.with_order(order);
            if order != SectorOrder::Dos && apm::probe(&chunks) {
                match apm::read(&chunks) {
                    Ok(map) => {
                        self.chunks = chunks;
                        self.contents = Some(Contents::PartitionMap(map));
                        return true;
                    }
                    Err(e) => self.notes.warning(format!("damaged partition map: {}", e)),
                }
            }
            if let Some(fs) = filesystem::probe(&chunks) {
                debug!(fs = fs.fs_type(), order = ?order, "found filesystem");
                self.chunks = chunks;
                self.contents = Some(Contents::FileSystem(fs));
                return true;
            }
        }

        if self.chunks.order() == SectorOrder::Unknown {
            self.chunks = self.chunks.with_order(SectorOrder::ProDos);
        }
        self.notes.info("no recognizable filesystem");
        false
    }

    /// Kind of image
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Sector order in use
    pub fn order(&self) -> SectorOrder {
        self.chunks.order()
    }

    /// 2IMG header, for 2IMG images
    pub fn header(&self) -> Option<&TwoImgHeader> {
        self.header.as_ref()
    }

    /// Block access to the disk data
    pub fn chunks(&self) -> &ChunkAccess {
        &self.chunks
    }

    /// The backing stream
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    /// Number of blocks
    pub fn block_count(&self) -> u32 {
        self.chunks.block_count()
    }

    /// Validity notes
    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    /// Is the image read-only?
    pub fn is_read_only(&self) -> bool {
        self.chunks.is_read_only() || self.notes.is_dubious()
    }

    /// Contents found by analysis, unless already taken
    pub fn contents(&self) -> Option<&Contents> {
        self.contents.as_ref()
    }

    /// Move the analyzed contents out so they can be managed on their own
    pub fn take_contents(&mut self) -> Option<Contents> {
        self.contents.take()
    }

    /// Flush any contents still held and the backing stream
    pub fn flush(&mut self) -> Result<()> {
        if let Some(Contents::FileSystem(fs)) = self.contents.as_mut() {
            fs.flush()?;
        }
        self.chunks.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::ProDosFileSystem;

    #[test]
    fn test_unadorned_prodos() {
        let image = DiskImageBuilder::new().blocks(280).prodos("BLANK").build().unwrap();
        let stream = image.stream().clone();

        let mut reopened = DiskImage::open(stream, FileKind::UnadornedSector, SectorOrder::Unknown).unwrap();
        assert!(reopened.analyze());
        assert_eq!(reopened.order(), SectorOrder::ProDos);
        match reopened.take_contents() {
            Some(Contents::FileSystem(fs)) => assert_eq!(fs.volume_name().as_deref(), Some("BLANK")),
            other => panic!("unexpected contents {:?}", other),
        }
        assert!(reopened.contents().is_none());
    }

    #[test]
    fn test_dos_order_probe() {
        let stream = SharedStream::from_bytes(vec![0u8; 143_360]);
        let chunks = ChunkAccess::new(stream.clone(), 0, 280, SectorOrder::Dos);
        ProDosFileSystem::format(chunks, "SKEWED").unwrap();

        let mut image = DiskImage::open(stream, FileKind::UnadornedSector, SectorOrder::Unknown).unwrap();
        assert!(image.analyze());
        assert_eq!(image.order(), SectorOrder::Dos);
    }

    #[test]
    fn test_twoimg_locked_is_read_only() {
        let image = DiskImageBuilder::new()
            .kind(FileKind::TwoImg)
            .blocks(280)
            .locked(true)
            .build()
            .unwrap();
        assert_eq!(image.kind(), FileKind::TwoImg);
        assert!(image.is_read_only());
        assert!(image.header().unwrap().locked);
    }

    #[test]
    fn test_blank_has_no_contents() {
        let stream = SharedStream::from_bytes(vec![0u8; 1024 * 512]);
        let mut image = DiskImage::open(stream, FileKind::UnadornedSector, SectorOrder::ProDos).unwrap();
        assert!(!image.analyze());
        assert_eq!(image.notes().iter().count(), 1);
    }

    #[test]
    fn test_partial_block_rejected() {
        let stream = SharedStream::from_bytes(vec![0u8; 1000]);
        assert!(DiskImage::open(stream, FileKind::UnadornedSector, SectorOrder::ProDos).is_err());
    }
}

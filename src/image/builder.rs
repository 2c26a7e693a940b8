/// Builder for creating blank disk images

use crate::error::{ContainerError, Result};
use crate::filesystem::ProDosFileSystem;
use crate::format::{FileKind, SectorOrder};
use crate::image::{twoimg, DiskImage, ImageFormat, TwoImgHeader};
use crate::io::{ChunkAccess, SharedStream, BLOCK_SIZE};
use crate::partition::apm::{self, PartitionSpec};

/// Builder for constructing disk images
pub struct DiskImageBuilder {
    kind: FileKind,
    blocks: u32,
    order: SectorOrder,
    volume_name: Option<String>,
    locked: bool,
    partitions: Vec<PartitionSpec>,
}

impl DiskImageBuilder {
    /// Create a new builder with default values (blank 140K unadorned image)
    pub fn new() -> Self {
        Self {
            kind: FileKind::UnadornedSector,
            blocks: 280,
            order: SectorOrder::ProDos,
            volume_name: None,
            locked: false,
            partitions: Vec::new(),
        }
    }

    /// Set the image kind (unadorned or 2IMG)
    pub fn kind(mut self, kind: FileKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the number of 512-byte blocks
    pub fn blocks(mut self, blocks: u32) -> Self {
        self.blocks = blocks;
        self
    }

    /// Set the sector order
    pub fn order(mut self, order: SectorOrder) -> Self {
        self.order = order;
        self
    }

    /// Format the image as a ProDOS volume
    pub fn prodos(mut self, volume_name: &str) -> Self {
        self.volume_name = Some(volume_name.to_string());
        self
    }

    /// Set the 2IMG write-protect flag
    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Add an Apple Partition Map entry; `Apple_PRODOS` partitions are formatted
    pub fn partition(mut self, name: &str, type_name: &str, blocks: u32) -> Self {
        self.partitions.push(PartitionSpec {
            name: name.to_string(),
            type_name: type_name.to_string(),
            block_count: blocks,
        });
        self
    }

    /// Build the image in memory
    pub fn build(self) -> Result<DiskImage> {
        self.write_to(SharedStream::from_bytes(Vec::new()))
    }

    /// Build the image into `stream`, replacing its contents
    pub fn write_to(self, stream: SharedStream) -> Result<DiskImage> {
        if self.blocks == 0 {
            return Err(ContainerError::invalid_format("disk image needs at least one block"));
        }
        if self.order == SectorOrder::Dos && self.blocks != crate::io::chunk::FLOPPY_525_BLOCKS {
            return Err(ContainerError::unsupported("DOS order is only used for 140K images"));
        }

        let data_len = self.blocks as usize * BLOCK_SIZE;
        let (mut bytes, offset) = match self.kind {
            FileKind::TwoImg => {
                let format = if self.order == SectorOrder::Dos {
                    ImageFormat::DosOrder
                } else {
                    ImageFormat::ProDosOrder
                };
                let mut header = TwoImgHeader::new(format, self.blocks);
                header.locked = self.locked;
                (header.to_bytes(), twoimg::HEADER_LEN as u64)
            }
            FileKind::UnadornedSector => (Vec::new(), 0),
            other => {
                return Err(ContainerError::unsupported(format!(
                    "cannot build a {}",
                    other.name()
                )))
            }
        };
        bytes.resize(bytes.len() + data_len, 0);
        stream.replace_contents(&bytes)?;

        let chunks = ChunkAccess::new(stream.clone(), offset, self.blocks, self.order);
        if !self.partitions.is_empty() {
            let starts = apm::write(&chunks, &self.partitions)?;
            for (spec, start) in self.partitions.iter().zip(starts) {
                if spec.type_name == "Apple_PRODOS" {
                    ProDosFileSystem::format(chunks.sub_range(start, spec.block_count)?, &spec.name)?;
                }
            }
        } else if let Some(name) = &self.volume_name {
            ProDosFileSystem::format(chunks, name)?;
        }
        stream.flush()?;

        let mut image = DiskImage::open(stream, self.kind, self.order)?;
        image.analyze();
        Ok(image)
    }
}

impl Default for DiskImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Contents;

    #[test]
    fn test_builder_default() {
        let image = DiskImageBuilder::new().build().unwrap();

        assert_eq!(image.kind(), FileKind::UnadornedSector);
        assert_eq!(image.block_count(), 280);
        assert_eq!(image.stream().len().unwrap(), 143_360);
        assert!(image.contents().is_none());
    }

    #[test]
    fn test_builder_twoimg_prodos() {
        let image = DiskImageBuilder::new()
            .kind(FileKind::TwoImg)
            .blocks(1600)
            .prodos("BIG.DISK")
            .build()
            .unwrap();

        assert_eq!(image.stream().len().unwrap(), 64 + 1600 * 512);
        assert!(matches!(image.contents(), Some(Contents::FileSystem(_))));
    }

    #[test]
    fn test_builder_with_partitions() {
        let image = DiskImageBuilder::new()
            .blocks(2000)
            .partition("ONE", "Apple_PRODOS", 800)
            .partition("SPARE", "Apple_Free", 100)
            .partition("TWO", "Apple_PRODOS", 800)
            .build()
            .unwrap();

        match image.contents() {
            Some(Contents::PartitionMap(map)) => assert_eq!(map.partitions().len(), 2),
            other => panic!("unexpected contents {:?}", other),
        }
    }

    #[test]
    fn test_builder_rejects_dos_order_hard_disk() {
        let result = DiskImageBuilder::new().blocks(1600).order(SectorOrder::Dos).build();
        assert!(result.is_err());
    }
}

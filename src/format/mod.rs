/// Format identification: signatures, structural analysis and opening

/// Format constants
pub mod constants;
/// Turning a stream into an opened archive or disk image
pub mod identify;

pub use constants::*;
pub use identify::{identify, Opened, OpenedContainer};

use crate::io::SharedStream;
use std::io;
use tracing::debug;

/// Kind of container found in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// ZIP archive
    Zip,
    /// gzip single-member compressed stream
    GZip,
    /// NuFX (ShrinkIt) archive
    Nufx,
    /// 2IMG disk image
    TwoImg,
    /// Unadorned block or sector image (.po, .do, .hdv, ...)
    UnadornedSector,
    /// Not a supported container
    Unknown,
}

impl FileKind {
    /// Get a human-readable name for this kind
    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Zip => "ZIP Archive",
            FileKind::GZip => "gzip",
            FileKind::Nufx => "NuFX Archive",
            FileKind::TwoImg => "2IMG Disk Image",
            FileKind::UnadornedSector => "Unadorned Disk Image",
            FileKind::Unknown => "Unknown",
        }
    }

    /// Does this kind denote a disk image?
    pub fn is_disk_image(&self) -> bool {
        matches!(self, FileKind::TwoImg | FileKind::UnadornedSector)
    }

    /// Does this kind denote a file archive?
    pub fn is_archive(&self) -> bool {
        matches!(self, FileKind::Zip | FileKind::GZip | FileKind::Nufx)
    }
}

/// Sector ordering of a disk image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectorOrder {
    /// Blocks stored in ProDOS order (linear)
    ProDos,
    /// 5.25" sectors stored in DOS 3.3 order
    Dos,
    /// Not known yet; analysis probes the candidates
    Unknown,
}

impl SectorOrder {
    /// Orders worth probing for an image of `len` bytes
    pub fn candidates(self, len: u64) -> Vec<SectorOrder> {
        match self {
            SectorOrder::Unknown if len == FLOPPY_525_LEN => {
                vec![SectorOrder::ProDos, SectorOrder::Dos]
            }
            SectorOrder::Unknown => vec![SectorOrder::ProDos],
            other => vec![other],
        }
    }
}

/// Determine what kind of container a stream holds
///
/// Magic numbers are checked first. Unadorned images have no signature, so
/// they are recognized from the extension hint and the stream length.
pub fn analyze(stream: &SharedStream, ext_hint: &str) -> io::Result<(FileKind, SectorOrder)> {
    let len = stream.len()?;
    let mut header = [0u8; 64];
    let got = stream.read_some_at(0, &mut header)?;
    let header = &header[..got];

    let ext = ext_hint.trim_start_matches('.').to_ascii_lowercase();

    let result = if header.starts_with(ZIP_LOCAL_SIGNATURE) || header.starts_with(ZIP_EMPTY_SIGNATURE) {
        (FileKind::Zip, SectorOrder::Unknown)
    } else if header.starts_with(NUFX_MASTER_SIGNATURE) {
        (FileKind::Nufx, SectorOrder::Unknown)
    } else if header.starts_with(GZIP_SIGNATURE) && len >= 18 {
        (FileKind::GZip, SectorOrder::Unknown)
    } else if header.starts_with(TWOIMG_SIGNATURE) && len >= 64 {
        (FileKind::TwoImg, SectorOrder::Unknown)
    } else if len > 0 && len % 512 == 0 {
        match lookup_extension(UNADORNED_EXTENSIONS, &ext) {
            Some("do") => (FileKind::UnadornedSector, SectorOrder::Dos),
            Some("dsk") => (FileKind::UnadornedSector, SectorOrder::Unknown),
            Some(_) => (FileKind::UnadornedSector, SectorOrder::ProDos),
            None if ext.is_empty() && (len == FLOPPY_525_LEN || len == FLOPPY_35_LEN) => {
                (FileKind::UnadornedSector, SectorOrder::Unknown)
            }
            None => (FileKind::Unknown, SectorOrder::Unknown),
        }
    } else {
        (FileKind::Unknown, SectorOrder::Unknown)
    };

    debug!(kind = ?result.0, order = ?result.1, len, ext = %ext, "analyzed stream");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze_bytes(data: Vec<u8>, ext: &str) -> FileKind {
        analyze(&SharedStream::from_bytes(data), ext).unwrap().0
    }

    #[test]
    fn test_detect_by_signature() {
        let mut zip = ZIP_EMPTY_SIGNATURE.to_vec();
        zip.resize(22, 0);
        assert_eq!(analyze_bytes(zip, ""), FileKind::Zip);

        let mut nufx = NUFX_MASTER_SIGNATURE.to_vec();
        nufx.resize(48, 0);
        assert_eq!(analyze_bytes(nufx, "txt"), FileKind::Nufx);

        let mut twoimg = TWOIMG_SIGNATURE.to_vec();
        twoimg.resize(64 + 512, 0);
        assert_eq!(analyze_bytes(twoimg, ""), FileKind::TwoImg);
    }

    #[test]
    fn test_detect_unadorned_by_extension() {
        let (kind, order) = analyze(&SharedStream::from_bytes(vec![0; 143_360]), "do").unwrap();
        assert_eq!(kind, FileKind::UnadornedSector);
        assert_eq!(order, SectorOrder::Dos);

        let (kind, order) = analyze(&SharedStream::from_bytes(vec![0; 1024]), ".PO").unwrap();
        assert_eq!(kind, FileKind::UnadornedSector);
        assert_eq!(order, SectorOrder::ProDos);
    }

    #[test]
    fn test_odd_length_is_unknown() {
        assert_eq!(analyze_bytes(vec![0; 1000], "po"), FileKind::Unknown);
        assert_eq!(analyze_bytes(vec![0; 4096], "txt"), FileKind::Unknown);
    }

    #[test]
    fn test_order_candidates() {
        assert_eq!(
            SectorOrder::Unknown.candidates(FLOPPY_525_LEN),
            vec![SectorOrder::ProDos, SectorOrder::Dos]
        );
        assert_eq!(SectorOrder::Dos.candidates(FLOPPY_525_LEN), vec![SectorOrder::Dos]);
    }
}

/// Turning a raw stream into an opened archive or disk image

use crate::archive::{Archive, GzipArchive, NufxArchive, ZipArchive};
use crate::error::{ContainerError, IdentifyError};
use crate::format::{analyze, lookup_extension, FileKind, EMPTY_OK_EXTENSIONS};
use crate::image::DiskImage;
use crate::io::SharedStream;
use tracing::{debug, info};

/// The container produced by identification
pub enum Opened {
    /// A file archive
    Archive(Box<dyn Archive>),
    /// A disk image, already analyzed
    DiskImage(DiskImage),
}

impl Opened {
    /// Kind of the opened container
    pub fn kind(&self) -> FileKind {
        match self {
            Opened::Archive(archive) => archive.kind(),
            Opened::DiskImage(image) => image.kind(),
        }
    }
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opened({:?})", self.kind())
    }
}

/// Result of a successful identification
#[derive(Debug)]
pub struct OpenedContainer {
    /// The opened container
    pub container: Opened,
    /// False for disk images whose contents were not recognized
    ///
    /// Archives always report true: their contents are reached by iterating
    /// entries, not by format analysis.
    pub has_files: bool,
}

fn open_failed(kind: FileKind, err: ContainerError) -> IdentifyError {
    debug!(kind = kind.name(), error = %err, "recognized but failed to open");
    IdentifyError::OpenFailed {
        kind: kind.name().to_string(),
        reason: err.to_string(),
    }
}

fn archive<A: Archive + 'static>(
    kind: FileKind,
    result: crate::error::Result<A>,
) -> Result<OpenedContainer, IdentifyError> {
    let archive = result.map_err(|e| open_failed(kind, e))?;
    Ok(OpenedContainer {
        container: Opened::Archive(Box::new(archive)),
        has_files: true,
    })
}

/// Identify the contents of `stream` and open it
///
/// `ext_hint` is the filename extension (with or without the leading dot)
/// of whatever the stream came from. The stream is kept by the opened
/// container; callers that want to retain ownership pass a clone.
pub fn identify(stream: SharedStream, ext_hint: &str) -> Result<OpenedContainer, IdentifyError> {
    let ext = ext_hint.trim_start_matches('.').to_ascii_lowercase();
    let len = stream.len().map_err(|e| {
        debug!(error = %e, "unable to size stream");
        IdentifyError::Unrecognized
    })?;

    if len == 0 {
        return match lookup_extension(EMPTY_OK_EXTENSIONS, &ext) {
            Some("zip") => archive(FileKind::Zip, ZipArchive::create(stream)),
            Some(_) => archive(FileKind::Nufx, NufxArchive::create(stream)),
            None => Err(IdentifyError::Empty),
        };
    }

    let (kind, order) = analyze(&stream, &ext).map_err(|e| {
        debug!(error = %e, "unable to read stream header");
        IdentifyError::Unrecognized
    })?;

    match kind {
        FileKind::TwoImg | FileKind::UnadornedSector => {
            let mut image = DiskImage::open(stream, kind, order).map_err(|e| open_failed(kind, e))?;
            let has_files = image.analyze();
            if !has_files {
                info!(kind = kind.name(), "disk image contents not recognized");
            }
            Ok(OpenedContainer {
                container: Opened::DiskImage(image),
                has_files,
            })
        }
        FileKind::Zip => archive(kind, ZipArchive::open(stream)),
        FileKind::GZip => archive(kind, GzipArchive::open(stream)),
        FileKind::Nufx => archive(kind, NufxArchive::open(stream)),
        FileKind::Unknown => Err(IdentifyError::Unrecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stream_rejected() {
        let result = identify(SharedStream::from_bytes(Vec::new()), "po");
        assert_eq!(result.unwrap_err(), IdentifyError::Empty);
    }

    #[test]
    fn test_empty_stream_allowed_for_archives() {
        let opened = identify(SharedStream::from_bytes(Vec::new()), ".shk").unwrap();
        assert_eq!(opened.container.kind(), FileKind::Nufx);
        assert!(opened.has_files);

        let opened = identify(SharedStream::from_bytes(Vec::new()), "zip").unwrap();
        assert_eq!(opened.container.kind(), FileKind::Zip);
    }

    #[test]
    fn test_unrecognized() {
        let result = identify(SharedStream::from_bytes(b"hello, world".to_vec()), "txt");
        assert_eq!(result.unwrap_err(), IdentifyError::Unrecognized);
    }

    #[test]
    fn test_blank_image_has_no_files() {
        let opened = identify(SharedStream::from_bytes(vec![0u8; 143_360]), "po").unwrap();
        assert_eq!(opened.container.kind(), FileKind::UnadornedSector);
        assert!(!opened.has_files);
    }

    #[test]
    fn test_truncated_nufx_fails_to_open() {
        let mut data = crate::format::NUFX_MASTER_SIGNATURE.to_vec();
        data.extend_from_slice(&[0u8; 10]);
        let result = identify(SharedStream::from_bytes(data), "shk");
        assert!(matches!(result, Err(IdentifyError::OpenFailed { .. })));
    }
}

/// Heuristic filter deciding which files might be nested containers

use crate::format::{
    extension_of, lookup_extension, ARCHIVE_EXTENSIONS, AUX_TYPE_BINARY2, AUX_TYPE_DISKCOPY,
    AUX_TYPE_NUFX, FILE_TYPE_LBR, FLOPPY_35_LEN, FLOPPY_525_LEN, TWOIMG_EXTENSIONS,
    UNADORNED_EXTENSIONS,
};
use tracing::trace;

/// Suggest an extension for a file that looks like a disk image or archive
///
/// Returns `None` for ordinary files. ProDOS type attributes are checked
/// first, then the filename extension, then the two standard floppy sizes.
pub fn nested_candidate(name: &str, file_type: u8, aux_type: u16, len: u64) -> Option<&'static str> {
    if len == 0 {
        return None;
    }

    if file_type == FILE_TYPE_LBR {
        match aux_type {
            AUX_TYPE_NUFX => return Some("shk"),
            AUX_TYPE_BINARY2 | AUX_TYPE_DISKCOPY => {
                trace!(name, aux_type, "ignoring unsupported LBR file");
                return None;
            }
            _ => {}
        }
    }

    let ext = extension_of(name);
    if !ext.is_empty() {
        let found = lookup_extension(UNADORNED_EXTENSIONS, &ext)
            .or_else(|| lookup_extension(TWOIMG_EXTENSIONS, &ext))
            .or_else(|| lookup_extension(ARCHIVE_EXTENSIONS, &ext));
        if found.is_some() {
            return found;
        }
    }

    match len {
        FLOPPY_525_LEN => Some("dsk"),
        FLOPPY_35_LEN => Some("po"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_type() {
        assert_eq!(nested_candidate("STUFF", FILE_TYPE_LBR, AUX_TYPE_NUFX, 100), Some("shk"));
        assert_eq!(nested_candidate("STUFF", FILE_TYPE_LBR, AUX_TYPE_BINARY2, 100), None);
        assert_eq!(nested_candidate("STUFF.PO", FILE_TYPE_LBR, AUX_TYPE_DISKCOPY, 819_284), None);
    }

    #[test]
    fn test_by_extension() {
        assert_eq!(nested_candidate("games/disk.PO", 0, 0, 1024), Some("po"));
        assert_eq!(nested_candidate("a.2mg", 0, 0, 1024), Some("2mg"));
        assert_eq!(nested_candidate("b.zip", 0, 0, 22), Some("zip"));
        assert_eq!(nested_candidate("readme.txt", 0x04, 0, 1024), None);
    }

    #[test]
    fn test_by_length() {
        assert_eq!(nested_candidate("NOEXT", 0x06, 0, FLOPPY_525_LEN), Some("dsk"));
        assert_eq!(nested_candidate("NOEXT", 0x06, 0, FLOPPY_35_LEN), Some("po"));
        assert_eq!(nested_candidate("NOEXT", 0x06, 0, 1000), None);
    }

    #[test]
    fn test_empty_never_candidate() {
        assert_eq!(nested_candidate("empty.po", 0, 0, 0), None);
    }
}

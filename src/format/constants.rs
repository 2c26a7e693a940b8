/// Format signatures and well-known sizes

/// ZIP local file header signature
pub const ZIP_LOCAL_SIGNATURE: &[u8] = b"PK\x03\x04";

/// ZIP end-of-central-directory signature (empty archive)
pub const ZIP_EMPTY_SIGNATURE: &[u8] = b"PK\x05\x06";

/// gzip member signature
pub const GZIP_SIGNATURE: &[u8] = &[0x1F, 0x8B];

/// NuFX master header signature ("NuFile" with alternating high bits)
pub const NUFX_MASTER_SIGNATURE: &[u8] = &[0x4E, 0xF5, 0x46, 0xE9, 0x6C, 0xE5];

/// NuFX record header signature ("NuFX" with alternating high bits)
pub const NUFX_RECORD_SIGNATURE: &[u8] = &[0x4E, 0xF5, 0x46, 0xD8];

/// 2IMG header signature
pub const TWOIMG_SIGNATURE: &[u8] = b"2IMG";

/// Length of a 140K 5.25" disk image
pub const FLOPPY_525_LEN: u64 = 143_360;

/// Length of an 800K 3.5" disk image
pub const FLOPPY_35_LEN: u64 = 819_200;

/// Extensions of unadorned block/sector images
pub const UNADORNED_EXTENSIONS: &[&str] = &["po", "do", "dsk", "hdv", "iso", "img", "raw"];

/// Extensions of 2IMG images
pub const TWOIMG_EXTENSIONS: &[&str] = &["2mg", "2img"];

/// Extensions of NuFX archives
pub const NUFX_EXTENSIONS: &[&str] = &["shk", "sdk", "sea"];

/// Extensions of supported file archives
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "gz", "shk", "sdk", "sea"];

/// Extensions whose zero-length streams open as new, empty archives
pub const EMPTY_OK_EXTENSIONS: &[&str] = &["shk", "sdk", "zip"];

/// ProDOS file type for the "LBR" archive family
pub const FILE_TYPE_LBR: u8 = 0xE0;

/// LBR aux type used for NuFX archives
pub const AUX_TYPE_NUFX: u16 = 0x8002;

/// LBR aux type used for Binary II archives (not supported)
pub const AUX_TYPE_BINARY2: u16 = 0x8000;

/// LBR aux type used for DiskCopy images (not supported)
pub const AUX_TYPE_DISKCOPY: u16 = 0x0005;

/// ProDOS file type for text files
pub const FILE_TYPE_TXT: u8 = 0x04;

/// ProDOS file type for binary files
pub const FILE_TYPE_BIN: u8 = 0x06;

/// ProDOS file type for directories
pub const FILE_TYPE_DIR: u8 = 0x0F;

/// Find `ext` (lowercase, no dot) in a table, returning the table's copy
pub fn lookup_extension(table: &[&'static str], ext: &str) -> Option<&'static str> {
    table.iter().copied().find(|e| e.eq_ignore_ascii_case(ext))
}

/// Get the lowercase extension of a file name, without the dot
pub fn extension_of(name: &str) -> String {
    let base = name.rsplit(&['/', '\\', ':'][..]).next().unwrap_or(name);
    match base.rfind('.') {
        Some(pos) if pos + 1 < base.len() => base[pos + 1..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

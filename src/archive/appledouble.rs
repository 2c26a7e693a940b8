/// AppleDouble header files, as stored by MacZip in `__MACOSX/` companions
///
/// Only the entries needed to carry ProDOS attributes are understood:
/// the resource fork (2), Finder info (9) and ProDOS file info (11).

use crate::error::{ContainerError, Result};

const MAGIC: u32 = 0x0005_1607;
const VERSION: u32 = 0x0002_0000;
const HEADER_LEN: usize = 26;
const DESCRIPTOR_LEN: usize = 12;

const ENTRY_RSRC: u32 = 2;
const ENTRY_FINDER_INFO: u32 = 9;
const ENTRY_PRODOS_INFO: u32 = 11;

const FINDER_INFO_LEN: usize = 32;
const PRODOS_INFO_LEN: usize = 8;

/// Attributes carried by an AppleDouble companion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppleDouble {
    /// ProDOS file type
    pub file_type: u8,
    /// ProDOS aux type
    pub aux_type: u16,
    /// ProDOS access byte
    pub access: u8,
    /// Resource fork
    pub rsrc: Option<Vec<u8>>,
}

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

impl AppleDouble {
    /// Parse an AppleDouble header file
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || be_u32(data, 0) != MAGIC {
            return Err(ContainerError::invalid_format("not an AppleDouble file"));
        }
        let count = be_u16(data, 24) as usize;
        if HEADER_LEN + count * DESCRIPTOR_LEN > data.len() {
            return Err(ContainerError::parse(24, "AppleDouble entry table truncated"));
        }

        let mut result = AppleDouble {
            access: 0xC3,
            ..Default::default()
        };
        let mut have_prodos = false;

        for i in 0..count {
            let desc = HEADER_LEN + i * DESCRIPTOR_LEN;
            let id = be_u32(data, desc);
            let offset = be_u32(data, desc + 4) as usize;
            let len = be_u32(data, desc + 8) as usize;
            let body = offset
                .checked_add(len)
                .and_then(|end| data.get(offset..end))
                .ok_or_else(|| ContainerError::parse(desc as u64, "AppleDouble entry out of range"))?;

            match id {
                ENTRY_RSRC => result.rsrc = Some(body.to_vec()),
                ENTRY_PRODOS_INFO if body.len() >= PRODOS_INFO_LEN => {
                    result.access = be_u16(body, 0) as u8;
                    result.file_type = be_u16(body, 2) as u8;
                    result.aux_type = be_u32(body, 4) as u16;
                    have_prodos = true;
                }
                ENTRY_FINDER_INFO if body.len() >= 8 && !have_prodos => {
                    // ProDOS types in HFS form: 'p' type aux_hi aux_lo / 'pdos'
                    if body[0] == b'p' && &body[4..8] == b"pdos" {
                        result.file_type = body[1];
                        result.aux_type = be_u16(body, 2);
                    }
                }
                _ => {}
            }
        }

        Ok(result)
    }

    /// Serialize as an AppleDouble header file
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries: Vec<(u32, Vec<u8>)> = Vec::with_capacity(3);

        let mut finder = vec![0u8; FINDER_INFO_LEN];
        finder[0] = b'p';
        finder[1] = self.file_type;
        finder[2..4].copy_from_slice(&self.aux_type.to_be_bytes());
        finder[4..8].copy_from_slice(b"pdos");
        entries.push((ENTRY_FINDER_INFO, finder));

        let mut prodos = Vec::with_capacity(PRODOS_INFO_LEN);
        prodos.extend_from_slice(&(self.access as u16).to_be_bytes());
        prodos.extend_from_slice(&(self.file_type as u16).to_be_bytes());
        prodos.extend_from_slice(&(self.aux_type as u32).to_be_bytes());
        entries.push((ENTRY_PRODOS_INFO, prodos));

        if let Some(rsrc) = &self.rsrc {
            entries.push((ENTRY_RSRC, rsrc.clone()));
        }

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&(entries.len() as u16).to_be_bytes());

        let mut offset = HEADER_LEN + entries.len() * DESCRIPTOR_LEN;
        for (id, body) in &entries {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            offset += body.len();
        }
        for (_, body) in entries {
            out.extend_from_slice(&body);
        }
        out
    }
}

/// Name of the MacZip companion for `name` (`dir/file` becomes `__MACOSX/dir/._file`)
pub fn companion_name(name: &str) -> String {
    match name.rfind('/') {
        Some(pos) => format!("__MACOSX/{}/._{}", &name[..pos], &name[pos + 1..]),
        None => format!("__MACOSX/._{}", name),
    }
}

/// Name of the file a MacZip companion describes, if `name` is one
pub fn companion_target(name: &str) -> Option<String> {
    let rest = name.strip_prefix("__MACOSX/")?;
    match rest.rfind('/') {
        Some(pos) => {
            let file = rest[pos + 1..].strip_prefix("._")?;
            Some(format!("{}/{}", &rest[..pos], file))
        }
        None => rest.strip_prefix("._").map(str::to_string),
    }
}

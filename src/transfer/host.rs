/// Host-side naming and conversions: NAPS file names, AppleDouble companions, text

use crate::archive::appledouble::AppleDouble;
use crate::error::{ContainerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Longest file name most host filesystems accept
pub const MAX_HOST_NAME_LEN: usize = 255;

/// Prefix of AppleDouble companion files
pub const APPLEDOUBLE_PREFIX: &str = "._";

/// How ProDOS attributes are kept on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreserveMode {
    /// Data fork only, no attributes
    #[default]
    None,
    /// `NAME#TTAAAA` file names, resource forks in `NAME#TTAAAAr`
    Naps,
    /// `._NAME` AppleDouble companion files
    AppleDouble,
}

impl PreserveMode {
    /// Parse a mode name
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(PreserveMode::None),
            "naps" => Some(PreserveMode::Naps),
            "appledouble" | "ad" => Some(PreserveMode::AppleDouble),
            _ => None,
        }
    }
}

/// Append a NAPS type suffix to a file name
pub fn naps_name(name: &str, file_type: u8, aux_type: u16, rsrc: bool) -> String {
    format!(
        "{}#{:02x}{:04x}{}",
        name,
        file_type,
        aux_type,
        if rsrc { "r" } else { "" }
    )
}

/// A host file name with its NAPS suffix decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NapsName {
    /// Name without the suffix
    pub name: String,
    /// ProDOS file type
    pub file_type: u8,
    /// ProDOS aux type
    pub aux_type: u16,
    /// This file holds a resource fork
    pub rsrc: bool,
}

/// Decode a `NAME#TTAAAA[r]` host file name
pub fn parse_naps(host_name: &str) -> Option<NapsName> {
    let pos = host_name.rfind('#')?;
    let (name, suffix) = (&host_name[..pos], &host_name[pos + 1..]);
    let (hex, rsrc) = match suffix.strip_suffix(|c: char| c == 'r' || c == 'R') {
        Some(hex) => (hex, true),
        None => (suffix, false),
    };
    if name.is_empty() || hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(NapsName {
        name: name.to_string(),
        file_type: u8::from_str_radix(&hex[..2], 16).ok()?,
        aux_type: u16::from_str_radix(&hex[2..], 16).ok()?,
        rsrc,
    })
}

/// Convert host text (LF or CRLF line ends) to Apple II text (CR)
pub fn to_apple_text(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        match b {
            b'\r' => {
                if iter.peek() == Some(&&b'\n') {
                    iter.next();
                }
                out.push(b'\r');
            }
            b'\n' => out.push(b'\r'),
            _ => out.push(b),
        }
    }
    out
}

/// Convert Apple II text (CR line ends) to host text (LF)
pub fn to_host_text(data: &[u8]) -> Vec<u8> {
    data.iter().map(|&b| if b == b'\r' { b'\n' } else { b }).collect()
}

/// Cut a host file name down to `MAX_HOST_NAME_LEN` bytes on a char boundary
pub fn truncate_host_name(name: &str) -> String {
    if name.len() <= MAX_HOST_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_HOST_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Join container path components onto `base` without leaving it
///
/// Each component must be a single plain name: `.`, `..`, empty names,
/// separators and rooted or prefixed parts are refused.
pub fn resolve_under(base: &Path, components: &[String], entry: &str) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in components {
        if component.contains(|c: char| matches!(c, '/' | '\\' | '\0')) {
            return Err(ContainerError::InvalidFilename(entry.to_string()));
        }
        let mut parts = Path::new(component).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(part)), None) => resolved.push(part),
            _ => return Err(ContainerError::InvalidFilename(entry.to_string())),
        }
    }
    if !resolved.starts_with(base) {
        return Err(ContainerError::InvalidFilename(entry.to_string()));
    }
    Ok(resolved)
}

/// A host file to add, with whatever attributes came with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSource {
    /// File holding the data fork
    pub data_path: Option<PathBuf>,
    /// File holding the resource fork (NAPS `r` file)
    pub rsrc_path: Option<PathBuf>,
    /// AppleDouble companion
    pub companion: Option<PathBuf>,
    /// Path components relative to the added root
    pub components: Vec<String>,
    /// ProDOS type and aux type from the host name
    pub types: Option<(u8, u16)>,
}

impl HostSource {
    /// Components joined with `/`, for messages
    pub fn display_path(&self) -> String {
        self.components.join("/")
    }

    /// Read the data fork, attributes and resource fork
    pub fn load(&self) -> io::Result<LoadedSource> {
        let data = match &self.data_path {
            Some(path) => fs::read(path)?,
            None => Vec::new(),
        };
        let mut rsrc = match &self.rsrc_path {
            Some(path) => Some(fs::read(path)?),
            None => None,
        };
        let mut types = self.types;
        if let Some(companion) = &self.companion {
            match AppleDouble::parse(&fs::read(companion)?) {
                Ok(ad) => {
                    types = Some((ad.file_type, ad.aux_type));
                    if ad.rsrc.is_some() {
                        rsrc = ad.rsrc;
                    }
                }
                Err(e) => warn!(path = %companion.display(), error = %e, "ignoring damaged AppleDouble file"),
            }
        }
        Ok(LoadedSource { data, rsrc, types })
    }
}

/// Contents of a [`HostSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    /// Data fork
    pub data: Vec<u8>,
    /// Resource fork
    pub rsrc: Option<Vec<u8>>,
    /// ProDOS type and aux type
    pub types: Option<(u8, u16)>,
}

fn sorted_dir(path: &Path) -> io::Result<Vec<(String, PathBuf, bool)>> {
    let mut items = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        items.push((name, entry.path(), entry.file_type()?.is_dir()));
    }
    items.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(items)
}

/// Gather host files for an add job
///
/// Directories are entered only with `recurse`. Files that carry metadata
/// for another file (NAPS resource forks, AppleDouble companions) are
/// folded into that file's source. Paths that cannot be read are returned
/// separately.
pub fn collect_sources(
    paths: &[PathBuf],
    recurse: bool,
    preserve: PreserveMode,
) -> (Vec<HostSource>, Vec<(PathBuf, io::Error)>) {
    let mut sources = Vec::new();
    let mut failures = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let Some(parent) = path.parent() else {
            continue;
        };
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                if recurse {
                    walk(path, vec![name], preserve, &mut sources, &mut failures);
                } else {
                    debug!(path = %path.display(), "skipping directory without recursion");
                }
            }
            Ok(_) => {
                let siblings = vec![(name, path.clone(), false)];
                let companions = companion_candidates(parent, &siblings, preserve);
                group(siblings, companions, Vec::new(), preserve, &mut sources);
            }
            Err(e) => failures.push((path.clone(), e)),
        }
    }
    (sources, failures)
}

fn walk(
    dir: &Path,
    prefix: Vec<String>,
    preserve: PreserveMode,
    sources: &mut Vec<HostSource>,
    failures: &mut Vec<(PathBuf, io::Error)>,
) {
    let items = match sorted_dir(dir) {
        Ok(items) => items,
        Err(e) => {
            failures.push((dir.to_path_buf(), e));
            return;
        }
    };
    let (dirs, files): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| item.2);
    group(files, Vec::new(), prefix.clone(), preserve, sources);
    for (name, path, _) in dirs {
        let mut next = prefix.clone();
        next.push(name);
        walk(&path, next, preserve, sources, failures);
    }
}

/// AppleDouble companions next to files that were named one by one
fn companion_candidates(
    parent: &Path,
    files: &[(String, PathBuf, bool)],
    preserve: PreserveMode,
) -> Vec<(String, PathBuf, bool)> {
    if preserve != PreserveMode::AppleDouble {
        return Vec::new();
    }
    files
        .iter()
        .map(|(name, _, _)| format!("{}{}", APPLEDOUBLE_PREFIX, name))
        .map(|companion| (companion.clone(), parent.join(&companion), false))
        .filter(|(_, path, _)| path.is_file())
        .collect()
}

fn group(
    files: Vec<(String, PathBuf, bool)>,
    extra: Vec<(String, PathBuf, bool)>,
    prefix: Vec<String>,
    preserve: PreserveMode,
    sources: &mut Vec<HostSource>,
) {
    let components = |name: &str| {
        let mut c = prefix.clone();
        c.push(name.to_string());
        c
    };

    match preserve {
        PreserveMode::None => {
            for (name, path, _) in files {
                sources.push(HostSource {
                    data_path: Some(path),
                    rsrc_path: None,
                    companion: None,
                    components: components(&name),
                    types: None,
                });
            }
        }
        PreserveMode::AppleDouble => {
            let all: Vec<_> = files.into_iter().chain(extra).collect();
            for (name, path, _) in &all {
                if name.starts_with(APPLEDOUBLE_PREFIX) {
                    continue;
                }
                let companion_name = format!("{}{}", APPLEDOUBLE_PREFIX, name);
                let companion = all
                    .iter()
                    .find(|(n, _, _)| *n == companion_name)
                    .map(|(_, p, _)| p.clone());
                sources.push(HostSource {
                    data_path: Some(path.clone()),
                    rsrc_path: None,
                    companion,
                    components: components(name),
                    types: None,
                });
            }
        }
        PreserveMode::Naps => {
            let mut pending: Vec<HostSource> = Vec::new();
            for (name, path, _) in files {
                match parse_naps(&name) {
                    Some(naps) => {
                        let slot = pending.iter().position(|s| {
                            s.components.last().map(String::as_str) == Some(naps.name.as_str())
                                && s.types == Some((naps.file_type, naps.aux_type))
                        });
                        let index = match slot {
                            Some(index) => index,
                            None => {
                                pending.push(HostSource {
                                    data_path: None,
                                    rsrc_path: None,
                                    companion: None,
                                    components: components(&naps.name),
                                    types: Some((naps.file_type, naps.aux_type)),
                                });
                                pending.len() - 1
                            }
                        };
                        if naps.rsrc {
                            pending[index].rsrc_path = Some(path);
                        } else {
                            pending[index].data_path = Some(path);
                        }
                    }
                    None => pending.push(HostSource {
                        data_path: Some(path),
                        rsrc_path: None,
                        companion: None,
                        components: components(&name),
                        types: None,
                    }),
                }
            }
            sources.extend(pending);
        }
    }
}

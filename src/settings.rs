/// Persisted user settings
///
/// The library never reads settings on its own; the binary loads them and
/// hands [`ScanOptions`] and [`TransferFlags`] to the tree and jobs by value.

use crate::transfer::{PreserveMode, TransferFlags};
use crate::tree::{DepthPolicy, ScanOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reading or writing the settings file
#[derive(Debug, Error)]
pub enum SettingsError {
    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File is not valid settings TOML
    #[error("Invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be serialized
    #[error("Unable to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// User settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Automatic expansion depth when opening files
    pub depth: DepthPolicy,
    /// Look inside every file of every filesystem
    pub deep_scan_filesystems: bool,
    /// Number given to the first partition of a map
    pub partition_base: u32,
    /// Compress entries added to archives
    pub compress: bool,
    /// How ProDOS attributes are kept on the host
    pub preserve: PreserveMode,
    /// Descend into host directories when adding
    pub recurse: bool,
    /// Drop directory names when copying
    pub strip_paths: bool,
    /// Read filesystem files without translation
    pub raw: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let scan = ScanOptions::default();
        let flags = TransferFlags::default();
        Self {
            depth: scan.depth,
            deep_scan_filesystems: scan.deep_scan_filesystems,
            partition_base: scan.partition_base,
            compress: flags.compress,
            preserve: flags.preserve,
            recurse: flags.recurse,
            strip_paths: flags.strip_paths,
            raw: flags.raw,
        }
    }
}

impl Settings {
    /// Default location: `<config dir>/a2nest/settings.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("a2nest").join("settings.toml"))
    }

    /// Parse settings from TOML; missing keys take default values
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Serialize settings to TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save settings, creating the parent directory if needed
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Scan options for opening files
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            depth: self.depth,
            deep_scan_filesystems: self.deep_scan_filesystems,
            partition_base: self.partition_base,
        }
    }

    /// Flags for a new transfer job
    pub fn transfer_flags(&self) -> TransferFlags {
        TransferFlags {
            recurse: self.recurse,
            compress: self.compress,
            strip_paths: self.strip_paths,
            preserve: self.preserve,
            raw: self.raw,
        }
    }
}

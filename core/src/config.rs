use crate::FirmctlError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Symlink hops allowed during one path resolution (Linux MAXSYMLINKS).
pub const DEFAULT_MAX_SYMLINK_HOPS: u32 = 40;
pub const DEFAULT_MAX_WALK_DEPTH: usize = 64;
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_EMBEDDED_KEY_PATH: &str = "/usr/share/update_engine/update-payload-key.pub";

/// Runtime options for opening and inspecting update containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub max_symlink_hops: u32,
    pub max_walk_depth: usize,
    pub copy_chunk_size: usize,
    /// 1-based partition number; overrides root selection when set.
    pub partition: Option<usize>,
    /// Hex-encoded Ed25519 public key for signed containers.
    pub public_key: Option<String>,
    /// Where to look inside the image for a key when none is configured.
    pub embedded_key_path: Option<String>,
    pub allow_missing_key: bool,
    pub release: ReleaseFiles,
}

/// Files inside the image that describe the firmware release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReleaseFiles {
    pub version_file: String,
    pub release_conf_file: String,
    pub release_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_symlink_hops: DEFAULT_MAX_SYMLINK_HOPS,
            max_walk_depth: DEFAULT_MAX_WALK_DEPTH,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            partition: None,
            public_key: None,
            embedded_key_path: Some(DEFAULT_EMBEDDED_KEY_PATH.to_string()),
            allow_missing_key: false,
            release: ReleaseFiles::default(),
        }
    }
}

impl Default for ReleaseFiles {
    fn default() -> Self {
        Self {
            version_file: "/etc/version".to_string(),
            release_conf_file: "/usr/share/remarkable/update.conf".to_string(),
            release_key: "REMARKABLE_RELEASE_VERSION".to_string(),
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, FirmctlError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FirmctlError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            FirmctlError::Configuration(format!("invalid {}: {}", path.display(), e))
        })?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load the per-user config file if there is one, defaults otherwise.
    pub fn load_default() -> Result<Self, FirmctlError> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("firmctl").join("config.json"))
    }

    pub fn validate(&self) -> Result<(), FirmctlError> {
        if self.max_symlink_hops == 0 {
            return Err(FirmctlError::Configuration(
                "max_symlink_hops must be at least 1".to_string(),
            ));
        }
        if self.max_walk_depth == 0 {
            return Err(FirmctlError::Configuration(
                "max_walk_depth must be at least 1".to_string(),
            ));
        }
        if self.copy_chunk_size == 0 || self.copy_chunk_size > 64 * 1024 * 1024 {
            return Err(FirmctlError::Configuration(format!(
                "copy_chunk_size must be between 1 byte and 64 MiB, got {}",
                self.copy_chunk_size
            )));
        }
        if self.partition == Some(0) {
            return Err(FirmctlError::Configuration(
                "partition numbers start at 1".to_string(),
            ));
        }
        if let Some(key) = &self.public_key {
            let bytes = hex::decode(key.trim()).map_err(|e| {
                FirmctlError::Configuration(format!("public_key is not hex: {}", e))
            })?;
            if bytes.len() != 32 {
                return Err(FirmctlError::Configuration(format!(
                    "public_key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        Ok(())
    }
}

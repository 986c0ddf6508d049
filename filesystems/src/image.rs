// High-level access to an update image: open, verify, locate the root
// filesystem and answer ls/cat/extract requests.

use crate::families::DirectoryEntry;
use crate::ops::{BackendChoice, ImageOps};
use crate::partitioner::{PartitionLocator, RegionSource, RootRegion};
use crate::reader::{FileContents, FilesystemReader};
use firmctl_core::{
    extract_to_path, ByteRange, Config, ContainerParser, Ed25519Signature, ExtractReport,
    FirmctlError, IntegrityKind, SignedContainer, UnverifiedContainer, VerifierRegistry,
};
use log::{info, warn};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Release identifiers found inside the root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseInfo {
    /// Build timestamp from the version file, e.g. `20221026104022`.
    pub build_id: Option<String>,
    /// Marketing version from the release configuration, e.g. `2.15.1.1189`.
    pub release_version: Option<String>,
}

/// Open and verify a container, falling back to a key shipped inside the
/// image when the container is signed and no key was configured.
pub fn open_container(path: &Path, config: &Config) -> Result<SignedContainer, FirmctlError> {
    config.validate()?;
    let unverified = ContainerParser::parse_file(path)?;
    let registry = VerifierRegistry::from_config(config)?;
    let kind = unverified.header().integrity_kind;

    if registry.supports(kind) || kind != IntegrityKind::Ed25519 {
        return unverified.verify(&registry);
    }

    match embedded_key(&unverified, config)? {
        Some(verifier) => {
            info!("Verifying with the public key embedded in the image");
            unverified.verify_with(&verifier)
        }
        None if config.allow_missing_key => {
            warn!("No public key available; continuing with an unverified image");
            Ok(unverified.into_unverified())
        }
        None => Err(FirmctlError::Signature(
            "container is signed but no public key is configured or embedded in the image"
                .to_string(),
        )),
    }
}

/// Look for a hex-encoded key at `embedded_key_path` in the unverified payload.
fn embedded_key(
    unverified: &UnverifiedContainer,
    config: &Config,
) -> Result<Option<Ed25519Signature>, FirmctlError> {
    let Some(key_path) = config.embedded_key_path.as_deref() else {
        return Ok(None);
    };

    let payload = unverified.unverified_payload();
    let text = match read_small_file(payload, key_path, config) {
        Ok(bytes) => bytes,
        Err(FirmctlError::PathNotFound(_)) | Err(FirmctlError::NotAFile(_)) => {
            warn!("No embedded public key at {}", key_path);
            return Ok(None);
        }
        Err(e) => {
            warn!("Could not search the image for a public key: {}", e);
            return Ok(None);
        }
    };

    let text = String::from_utf8_lossy(&text);
    Ed25519Signature::from_hex(text.trim()).map(Some)
}

fn read_small_file(payload: &ByteRange, path: &str, config: &Config) -> Result<Vec<u8>, FirmctlError> {
    let root = PartitionLocator::from_config(config).locate_root(payload)?;
    let reader = FilesystemReader::mount(root.region, config)?;
    reader.read_to_vec(path)
}

/// A verified container with its root filesystem mounted.
pub struct Image {
    container: SignedContainer,
    root: RootRegion,
    reader: FilesystemReader,
    config: Config,
}

impl Image {
    pub fn open(path: &Path, config: &Config) -> Result<Self, FirmctlError> {
        let container = open_container(path, config)?;
        Self::from_container(container, config)
    }

    pub fn from_container(container: SignedContainer, config: &Config) -> Result<Self, FirmctlError> {
        let root = PartitionLocator::from_config(config).locate_root(container.payload_view())?;
        info!("Root filesystem found in {}", root.source);
        let reader = FilesystemReader::mount(root.region.clone(), config)?;
        Ok(Self {
            container,
            root,
            reader,
            config: config.clone(),
        })
    }

    pub fn container(&self) -> &SignedContainer {
        &self.container
    }

    pub fn root_source(&self) -> &RegionSource {
        &self.root.source
    }

    pub fn reader(&self) -> &FilesystemReader {
        &self.reader
    }

    pub fn ops(&self, backend: &BackendChoice) -> Result<Box<dyn ImageOps>, FirmctlError> {
        backend.open(&self.reader)
    }

    pub fn ls(&self, path: &str) -> Result<Vec<DirectoryEntry>, FirmctlError> {
        self.reader.list_directory(path)
    }

    pub fn cat(&self, path: &str) -> Result<FileContents, FirmctlError> {
        self.reader.read_file(path)
    }

    pub fn release_info(&self) -> Result<ReleaseInfo, FirmctlError> {
        let files = &self.config.release;
        let build_id = self
            .optional_text(&files.version_file)?
            .map(|text| text.trim().to_string())
            .filter(|id| !id.is_empty());
        let release_version = self
            .optional_text(&files.release_conf_file)?
            .and_then(|conf| parse_release_value(&conf, &files.release_key));
        Ok(ReleaseInfo {
            build_id,
            release_version,
        })
    }

    fn optional_text(&self, path: &str) -> Result<Option<String>, FirmctlError> {
        match self.reader.read_to_vec(path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(FirmctlError::PathNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Value of `key=value` in a shell-style configuration file.
fn parse_release_value(conf: &str, key: &str) -> Option<String> {
    conf.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
}

pub fn mount(path: &Path, config: &Config) -> Result<Image, FirmctlError> {
    Image::open(path, config)
}

pub fn ls(path: &Path, inner_path: &str, config: &Config) -> Result<Vec<DirectoryEntry>, FirmctlError> {
    Image::open(path, config)?.ls(inner_path)
}

/// Stream one file from the image into `out`. Returns the bytes written.
pub fn cat<W: Write + ?Sized>(
    path: &Path,
    inner_path: &str,
    config: &Config,
    out: &mut W,
) -> Result<u64, FirmctlError> {
    let image = Image::open(path, config)?;
    let mut contents = image.cat(inner_path)?;
    let mut written = 0u64;
    for chunk in contents.chunks() {
        let chunk = chunk?;
        out.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    out.flush()?;
    Ok(written)
}

/// Verify the container and write its raw payload to `destination`.
pub fn extract(path: &Path, destination: &Path, config: &Config) -> Result<ExtractReport, FirmctlError> {
    let container = open_container(path, config)?;
    extract_to_path(&container, destination, config.copy_chunk_size)
}

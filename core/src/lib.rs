pub mod config;
pub mod container;
pub mod error;
pub mod extract;
pub mod integrity;
pub mod source;

pub use config::{Config, ReleaseFiles};
pub use container::{
    ContainerHeader, ContainerParser, SignedContainer, UnverifiedContainer, Verification,
};
pub use error::FirmctlError;
pub use extract::{extract, extract_to_path, ExtractReport};
pub use integrity::{
    Crc32Checksum, Ed25519Signature, IntegrityKind, IntegrityVerifier, Sha256Digest,
    VerifierRegistry,
};
pub use source::{ByteRange, ReadAt};

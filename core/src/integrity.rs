// Integrity strategies for update containers
// The header names a kind; the registry maps each kind to a verifier.

use crate::{ByteRange, FirmctlError};
use log::debug;
use ring::signature::{UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Buffer size used when hashing payloads.
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityKind {
    Sha256,
    Crc32,
    Ed25519,
}

impl IntegrityKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(IntegrityKind::Sha256),
            2 => Some(IntegrityKind::Crc32),
            3 => Some(IntegrityKind::Ed25519),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            IntegrityKind::Sha256 => 1,
            IntegrityKind::Crc32 => 2,
            IntegrityKind::Ed25519 => 3,
        }
    }

    /// Required length of the integrity block for this kind.
    pub fn block_len(self) -> u32 {
        match self {
            IntegrityKind::Sha256 => 32,
            IntegrityKind::Crc32 => 4,
            IntegrityKind::Ed25519 => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IntegrityKind::Sha256 => "sha256",
            IntegrityKind::Crc32 => "crc32",
            IntegrityKind::Ed25519 => "ed25519",
        }
    }
}

/// Checks an integrity block against payload bytes.
pub trait IntegrityVerifier: Send + Sync {
    fn kind(&self) -> IntegrityKind;

    fn verify(&self, block: &[u8], payload: &ByteRange) -> Result<(), FirmctlError>;
}

/// Stream the payload through SHA-256.
pub fn sha256_of(payload: &ByteRange) -> Result<[u8; 32], FirmctlError> {
    let mut hasher = Sha256::new();
    payload.for_each_chunk(HASH_CHUNK_SIZE, |chunk| {
        hasher.update(chunk);
        Ok(())
    })?;
    Ok(hasher.finalize().into())
}

/// Integrity block is the SHA-256 of the payload.
pub struct Sha256Digest;

impl IntegrityVerifier for Sha256Digest {
    fn kind(&self) -> IntegrityKind {
        IntegrityKind::Sha256
    }

    fn verify(&self, block: &[u8], payload: &ByteRange) -> Result<(), FirmctlError> {
        let actual = sha256_of(payload)?;
        if actual.as_slice() != block {
            return Err(FirmctlError::Signature(format!(
                "payload sha256 {} does not match {}",
                hex::encode(actual),
                hex::encode(block)
            )));
        }
        Ok(())
    }
}

/// Integrity block is the little-endian CRC32 of the payload.
pub struct Crc32Checksum;

impl IntegrityVerifier for Crc32Checksum {
    fn kind(&self) -> IntegrityKind {
        IntegrityKind::Crc32
    }

    fn verify(&self, block: &[u8], payload: &ByteRange) -> Result<(), FirmctlError> {
        let expected: [u8; 4] = block
            .try_into()
            .map_err(|_| FirmctlError::Signature("crc32 block must be 4 bytes".to_string()))?;
        let expected = u32::from_le_bytes(expected);

        let mut hasher = crc32fast::Hasher::new();
        payload.for_each_chunk(HASH_CHUNK_SIZE, |chunk| {
            hasher.update(chunk);
            Ok(())
        })?;
        let actual = hasher.finalize();
        if actual != expected {
            return Err(FirmctlError::Signature(format!(
                "payload crc32 0x{:08X} does not match 0x{:08X}",
                actual, expected
            )));
        }
        Ok(())
    }
}

/// Integrity block is an Ed25519 signature over the payload's SHA-256.
pub struct Ed25519Signature {
    public_key: [u8; 32],
}

impl Ed25519Signature {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self { public_key }
    }

    /// Parse a hex-encoded key, tolerating surrounding whitespace.
    pub fn from_hex(text: &str) -> Result<Self, FirmctlError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| FirmctlError::Signature(format!("public key is not hex: {}", e)))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            FirmctlError::Signature(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(key))
    }
}

impl IntegrityVerifier for Ed25519Signature {
    fn kind(&self) -> IntegrityKind {
        IntegrityKind::Ed25519
    }

    fn verify(&self, block: &[u8], payload: &ByteRange) -> Result<(), FirmctlError> {
        let digest = sha256_of(payload)?;
        UnparsedPublicKey::new(&ED25519, &self.public_key)
            .verify(&digest, block)
            .map_err(|_| FirmctlError::Signature("ed25519 signature does not match payload".to_string()))
    }
}

/// Maps integrity kinds to the strategies able to check them.
pub struct VerifierRegistry {
    verifiers: HashMap<IntegrityKind, Box<dyn IntegrityVerifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self {
            verifiers: HashMap::new(),
        }
    }

    /// Digest and checksum verifiers; signatures need a key and are added separately.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(Sha256Digest));
        registry.register(Box::new(Crc32Checksum));
        registry
    }

    /// Built-ins plus an Ed25519 verifier when the config carries a key.
    pub fn from_config(config: &crate::Config) -> Result<Self, FirmctlError> {
        let mut registry = Self::with_builtin();
        if let Some(key) = &config.public_key {
            registry.register(Box::new(Ed25519Signature::from_hex(key)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, verifier: Box<dyn IntegrityVerifier>) {
        debug!("Registered {} integrity verifier", verifier.kind().name());
        self.verifiers.insert(verifier.kind(), verifier);
    }

    pub fn get(&self, kind: IntegrityKind) -> Option<&dyn IntegrityVerifier> {
        self.verifiers.get(&kind).map(|v| v.as_ref())
    }

    pub fn supports(&self, kind: IntegrityKind) -> bool {
        self.verifiers.contains_key(&kind)
    }
}

impl Default for VerifierRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

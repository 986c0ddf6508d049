// Signed update container parsing
//
// Layout: [64-byte header][integrity block][payload = raw disk image]
// All header integers are little-endian.

use crate::integrity::{IntegrityKind, IntegrityVerifier, VerifierRegistry};
use crate::{ByteRange, FirmctlError};
use log::{debug, info, warn};
use std::path::Path;

pub const CONTAINER_MAGIC: [u8; 4] = *b"FWUP";
pub const CONTAINER_FORMAT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 64;
pub const VERSION_FIELD_LEN: usize = 32;

const OFF_FORMAT_VERSION: usize = 4;
const OFF_DEVICE_ID: usize = 6;
const OFF_VERSION: usize = 8;
const OFF_PAYLOAD_LEN: usize = 40;
const OFF_INTEGRITY_KIND: usize = 48;
const OFF_INTEGRITY_LEN: usize = 52;
const OFF_HEADER_CRC: usize = 56;

/// Decoded container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub format_version: u16,
    pub device_id: u16,
    pub version: String,
    pub payload_len: u64,
    pub integrity_kind: IntegrityKind,
    pub integrity_len: u32,
}

impl ContainerHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, FirmctlError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FirmctlError::format(
                0,
                format!("header needs {} bytes, file has {}", HEADER_SIZE, bytes.len()),
            ));
        }
        if bytes[..4] != CONTAINER_MAGIC {
            return Err(FirmctlError::format(
                0,
                format!("unrecognized container magic {:02X?}", &bytes[..4]),
            ));
        }

        let stored_crc = read_u32(bytes, OFF_HEADER_CRC);
        let actual_crc = crc32fast::hash(&bytes[..OFF_HEADER_CRC]);
        if stored_crc != actual_crc {
            return Err(FirmctlError::format(
                OFF_HEADER_CRC as u64,
                format!(
                    "header checksum 0x{:08X} does not match computed 0x{:08X}",
                    stored_crc, actual_crc
                ),
            ));
        }

        let format_version = read_u16(bytes, OFF_FORMAT_VERSION);
        if format_version != CONTAINER_FORMAT_VERSION {
            return Err(FirmctlError::format(
                OFF_FORMAT_VERSION as u64,
                format!("unsupported container format version {}", format_version),
            ));
        }

        let version_field = &bytes[OFF_VERSION..OFF_VERSION + VERSION_FIELD_LEN];
        let version_len = version_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_FIELD_LEN);
        let version_bytes = &version_field[..version_len];
        if !version_bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(FirmctlError::format(
                OFF_VERSION as u64,
                "version string is not printable ASCII",
            ));
        }
        let version = String::from_utf8_lossy(version_bytes).into_owned();

        let raw_kind = bytes[OFF_INTEGRITY_KIND];
        let integrity_kind = IntegrityKind::from_raw(raw_kind).ok_or_else(|| {
            FirmctlError::format(
                OFF_INTEGRITY_KIND as u64,
                format!("unknown integrity kind {}", raw_kind),
            )
        })?;
        let integrity_len = read_u32(bytes, OFF_INTEGRITY_LEN);
        if integrity_len != integrity_kind.block_len() {
            return Err(FirmctlError::format(
                OFF_INTEGRITY_LEN as u64,
                format!(
                    "{} integrity block must be {} bytes, header declares {}",
                    integrity_kind.name(),
                    integrity_kind.block_len(),
                    integrity_len
                ),
            ));
        }

        Ok(Self {
            format_version,
            device_id: read_u16(bytes, OFF_DEVICE_ID),
            version,
            payload_len: read_u64(bytes, OFF_PAYLOAD_LEN),
            integrity_kind,
            integrity_len,
        })
    }

    /// Serialize, computing the header checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&CONTAINER_MAGIC);
        out[OFF_FORMAT_VERSION..OFF_FORMAT_VERSION + 2]
            .copy_from_slice(&self.format_version.to_le_bytes());
        out[OFF_DEVICE_ID..OFF_DEVICE_ID + 2].copy_from_slice(&self.device_id.to_le_bytes());
        let version = self.version.as_bytes();
        let n = version.len().min(VERSION_FIELD_LEN);
        out[OFF_VERSION..OFF_VERSION + n].copy_from_slice(&version[..n]);
        out[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 8].copy_from_slice(&self.payload_len.to_le_bytes());
        out[OFF_INTEGRITY_KIND] = self.integrity_kind.to_raw();
        out[OFF_INTEGRITY_LEN..OFF_INTEGRITY_LEN + 4]
            .copy_from_slice(&self.integrity_len.to_le_bytes());
        let crc = crc32fast::hash(&out[..OFF_HEADER_CRC]);
        out[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Byte offset of the payload within the container file.
    pub fn payload_offset(&self) -> u64 {
        HEADER_SIZE as u64 + self.integrity_len as u64
    }
}

/// Whether the payload has been checked against its integrity block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified(IntegrityKind),
    Unverified,
}

/// A container whose header and bounds are valid but whose integrity block
/// has not been checked yet.
#[derive(Debug, Clone)]
pub struct UnverifiedContainer {
    header: ContainerHeader,
    integrity_block: Vec<u8>,
    payload: ByteRange,
}

impl UnverifiedContainer {
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Payload bytes before verification. Only for locating a verification key.
    pub fn unverified_payload(&self) -> &ByteRange {
        &self.payload
    }

    /// Check the integrity block with whichever registered strategy matches the header.
    pub fn verify(self, registry: &VerifierRegistry) -> Result<SignedContainer, FirmctlError> {
        let kind = self.header.integrity_kind;
        let verifier = registry.get(kind).ok_or_else(|| {
            FirmctlError::Signature(format!(
                "no verifier available for {} containers",
                kind.name()
            ))
        })?;
        self.verify_with(verifier)
    }

    pub fn verify_with(
        self,
        verifier: &dyn IntegrityVerifier,
    ) -> Result<SignedContainer, FirmctlError> {
        let kind = self.header.integrity_kind;
        if verifier.kind() != kind {
            return Err(FirmctlError::Signature(format!(
                "container uses {} integrity, verifier checks {}",
                kind.name(),
                verifier.kind().name()
            )));
        }
        verifier.verify(&self.integrity_block, &self.payload)?;
        info!("Container payload verified ({})", kind.name());
        Ok(SignedContainer {
            header: self.header,
            payload: self.payload,
            verification: Verification::Verified(kind),
        })
    }

    /// Accept the payload without checking it. The result reports `Unverified`.
    pub fn into_unverified(self) -> SignedContainer {
        warn!(
            "Using container payload without {} verification",
            self.header.integrity_kind.name()
        );
        SignedContainer {
            header: self.header,
            payload: self.payload,
            verification: Verification::Unverified,
        }
    }
}

/// A validated update container exposing its payload as a byte range.
#[derive(Debug, Clone)]
pub struct SignedContainer {
    header: ContainerHeader,
    payload: ByteRange,
    verification: Verification,
}

impl SignedContainer {
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn payload_view(&self) -> &ByteRange {
        &self.payload
    }

    pub fn verification(&self) -> Verification {
        self.verification
    }
}

/// Opens containers and checks them with a set of integrity strategies.
pub struct ContainerParser {
    registry: VerifierRegistry,
}

impl ContainerParser {
    pub fn new(registry: VerifierRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &VerifierRegistry {
        &self.registry
    }

    /// Open, bounds-check, and verify a container file.
    pub fn open(&self, path: &Path) -> Result<SignedContainer, FirmctlError> {
        info!("Opening update container: {}", path.display());
        Self::parse_file(path)?.verify(&self.registry)
    }

    pub fn open_source(&self, source: ByteRange) -> Result<SignedContainer, FirmctlError> {
        Self::parse(source)?.verify(&self.registry)
    }

    pub fn parse_file(path: &Path) -> Result<UnverifiedContainer, FirmctlError> {
        Self::parse(ByteRange::open_file(path)?)
    }

    /// Validate header and declared lengths without touching the payload.
    pub fn parse(source: ByteRange) -> Result<UnverifiedContainer, FirmctlError> {
        let available = source.len();
        let header_len = (HEADER_SIZE as u64).min(available) as usize;
        let header_bytes = source.read_vec(0, header_len)?;
        let header = ContainerHeader::parse(&header_bytes)?;
        debug!(
            "Container header: version {} device {} payload {} bytes ({})",
            header.version,
            header.device_id,
            header.payload_len,
            header.integrity_kind.name()
        );

        let payload_offset = header.payload_offset();
        let end = payload_offset.checked_add(header.payload_len).ok_or_else(|| {
            FirmctlError::out_of_bounds("payload", payload_offset, header.payload_len, available)
        })?;
        if end > available {
            return Err(FirmctlError::out_of_bounds(
                "payload",
                payload_offset,
                header.payload_len,
                available,
            ));
        }
        if end < available {
            warn!(
                "Container has {} trailing bytes after the payload",
                available - end
            );
        }

        let integrity_block = source.read_vec(HEADER_SIZE as u64, header.integrity_len as usize)?;
        let payload = source.slice(payload_offset, header.payload_len)?;

        Ok(UnverifiedContainer {
            header,
            integrity_block,
            payload,
        })
    }
}

impl Default for ContainerParser {
    fn default() -> Self {
        Self::new(VerifierRegistry::with_builtin())
    }
}

/// Assemble container bytes around a payload. Used by tooling and tests.
pub fn build_container(
    version: &str,
    device_id: u16,
    integrity_kind: IntegrityKind,
    integrity_block: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let header = ContainerHeader {
        format_version: CONTAINER_FORMAT_VERSION,
        device_id,
        version: version.to_string(),
        payload_len: payload.len() as u64,
        integrity_kind,
        integrity_len: integrity_block.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + integrity_block.len() + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(integrity_block);
    out.extend_from_slice(payload);
    out
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

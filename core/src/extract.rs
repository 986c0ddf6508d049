// Raw payload extraction
// Copies the payload out in bounded chunks and reports a SHA-256 of what was written.

use crate::{FirmctlError, SignedContainer};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// Outcome of an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractReport {
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of the bytes written.
    pub digest: String,
}

impl ExtractReport {
    /// Compare against an externally sourced digest (hex, any case).
    pub fn verify(&self, expected: &str) -> Result<(), FirmctlError> {
        let expected = expected.trim().to_ascii_lowercase();
        if expected != self.digest {
            return Err(FirmctlError::Verification {
                expected,
                actual: self.digest.clone(),
            });
        }
        Ok(())
    }
}

/// Stream the container payload into `destination`.
pub fn extract<W: Write + ?Sized>(
    container: &SignedContainer,
    destination: &mut W,
    chunk_size: usize,
) -> Result<ExtractReport, FirmctlError> {
    let payload = container.payload_view();
    let mut hasher = Sha256::new();
    let mut bytes_written = 0u64;

    payload.for_each_chunk(chunk_size, |chunk| {
        destination.write_all(chunk).map_err(|source| FirmctlError::Io {
            offset: bytes_written,
            source,
        })?;
        hasher.update(chunk);
        bytes_written += chunk.len() as u64;
        Ok(())
    })?;
    destination.flush()?;

    Ok(ExtractReport {
        bytes_written,
        digest: hex::encode(hasher.finalize()),
    })
}

/// Extract to a file path. The output only appears once the copy has completed.
pub fn extract_to_path(
    container: &SignedContainer,
    output: &Path,
    chunk_size: usize,
) -> Result<ExtractReport, FirmctlError> {
    let parent = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut staging = tempfile::NamedTempFile::new_in(parent)?;
    let report = extract(container, staging.as_file_mut(), chunk_size)?;
    staging.as_file().sync_all()?;
    staging
        .persist(output)
        .map_err(|e| FirmctlError::IoError(e.error))?;

    info!(
        "Extracted {} bytes to {} (sha256 {})",
        report.bytes_written,
        output.display(),
        report.digest
    );
    Ok(report)
}

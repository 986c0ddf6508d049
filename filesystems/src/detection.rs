// Filesystem signature probing

use firmctl_core::{ByteRange, FirmctlError};

/// Magic bytes at a fixed offset that identify a filesystem family.
#[derive(Debug, Clone)]
pub struct FamilySignature {
    /// Offset from the start of the region where the signature appears
    pub offset: u64,
    pub signature: Vec<u8>,
}

impl FamilySignature {
    /// True when the region is long enough and carries the signature.
    pub fn matches(&self, region: &ByteRange) -> Result<bool, FirmctlError> {
        let len = self.signature.len() as u64;
        if !region.contains(self.offset, len) {
            return Ok(false);
        }
        let found = region.read_vec(self.offset, self.signature.len())?;
        Ok(found == self.signature)
    }
}

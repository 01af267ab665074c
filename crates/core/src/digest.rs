use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

/// Length of a SHA-256 digest rendered as hex.
pub const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("ELF file SHA256 mismatch: computed {expected}, reported by the app {reported}")]
    DigestMismatch { expected: String, reported: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// SHA-256 of a firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareDigest([u8; 32]);

impl FirmwareDigest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Reads the whole file and hashes it. The handle is closed before return.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let buffer = fs::read(path)?;
        Ok(Self::of_bytes(&buffer))
    }

    /// Lowercase hex, always `DIGEST_HEX_LEN` characters.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Literal, case-sensitive prefix check against `hex()`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.hex().starts_with(prefix)
    }
}

impl fmt::Display for FirmwareDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Checks that the digest prefix a running image reports about itself
/// matches the binary at `binary_path`.
///
/// The app prints only the first several hex characters of its SHA-256, so
/// any prefix of the computed digest is accepted, the empty string included.
pub fn verify_firmware_digest(binary_path: &Path, reported_prefix: &str) -> Result<(), VerifyError> {
    let digest = FirmwareDigest::of_file(binary_path)?;

    info!("ELF file SHA256: {}", digest);
    info!("ELF file SHA256 (reported by the app): {}", reported_prefix);

    if !digest.has_prefix(reported_prefix) {
        return Err(VerifyError::DigestMismatch {
            expected: digest.hex(),
            reported: reported_prefix.to_string(),
        });
    }

    Ok(())
}

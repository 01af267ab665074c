//! The hello-world boot checks, run against any `DeviceSession`.

use crate::digest::{verify_firmware_digest, VerifyError};
use crate::session::{DeviceSession, SessionError};
use regex::Regex;
use std::path::Path;
use tracing::info;

pub const DEFAULT_GREETING: &str = "Hello world!";

/// Line the app prints with the first hex characters of its own ELF SHA-256.
pub const ELF_SHA256_PATTERN: &str = r"ELF file SHA256:\s+([a-f0-9]+)";

/// Line the app prints with the heap low-water mark.
pub const MIN_FREE_HEAP_PATTERN: &str = r"Minimum free heap size: (\d+) bytes";

#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Digest(#[from] VerifyError),
    #[error("Minimum free heap size {free_bytes} bytes is below the required {required_bytes} bytes")]
    HeapBelowMinimum { free_bytes: u64, required_bytes: u64 },
    #[error("Malformed device report '{0}'")]
    MalformedReport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapReport {
    pub free_bytes: u64,
}

/// Reads the `Minimum free heap size` report and logs it.
pub fn log_minimum_free_heap_size(session: &mut dyn DeviceSession) -> Result<HeapReport, CaseError> {
    let pattern = Regex::new(MIN_FREE_HEAP_PATTERN).map_err(SessionError::from)?;
    let caps = session.expect_pattern(&pattern)?;
    let raw = caps.get(1).unwrap_or_default();
    let free_bytes = raw
        .parse::<u64>()
        .map_err(|_| CaseError::MalformedReport(caps.whole().to_string()))?;

    info!("Minimum free heap size: {} bytes", free_bytes);
    Ok(HeapReport { free_bytes })
}

/// Greeting check for hardware and emulator targets alike.
pub fn hello_world(
    session: &mut dyn DeviceSession,
    greeting: &str,
    min_free_heap: Option<u64>,
) -> Result<HeapReport, CaseError> {
    session.expect_exact(greeting)?;
    let report = log_minimum_free_heap_size(session)?;

    if let Some(required_bytes) = min_free_heap {
        if report.free_bytes < required_bytes {
            return Err(CaseError::HeapBelowMinimum {
                free_bytes: report.free_bytes,
                required_bytes,
            });
        }
    }

    Ok(report)
}

/// Emulator check: the app's self-reported ELF digest must match the image
/// it was built from. Returns the reported prefix.
pub fn hello_world_host(
    session: &mut dyn DeviceSession,
    firmware: &Path,
    greeting: &str,
) -> Result<String, CaseError> {
    let pattern = Regex::new(ELF_SHA256_PATTERN).map_err(SessionError::from)?;
    let caps = session.expect_pattern(&pattern)?;
    let reported = caps
        .get(1)
        .ok_or_else(|| CaseError::MalformedReport(caps.whole().to_string()))?
        .to_string();

    verify_firmware_digest(firmware, &reported)?;

    session.expect_exact(greeting)?;
    Ok(reported)
}

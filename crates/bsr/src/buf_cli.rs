//! Wrapper around the external `buf` tool.
//!
//! The resolver never interprets buf's stdout beyond documented fields; it
//! exports modules to a directory and reads the version string, nothing
//! else.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use protodist_core::{Error, Result};

/// Deadline for one `buf export`.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(120);
/// Deadline for `buf --version`.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Export a module reference into a directory.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when buf itself or the module is missing,
/// [`Error::Timeout`] past the deadline, and [`Error::Internal`] for other
/// buf failures.
pub async fn export(buf_program: &Path, reference: &str, output: &Path) -> Result<()> {
    debug!(%reference, ?output, "Exporting BSR module via buf");
    let result = tokio::time::timeout(
        EXPORT_TIMEOUT,
        Command::new(buf_program)
            .arg("export")
            .arg(reference)
            .arg("--output")
            .arg(output)
            .output(),
    )
    .await
    .map_err(|_| Error::timeout(format!("buf export {reference}"), EXPORT_TIMEOUT.as_secs()))?
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found("the buf tool is not installed")
        } else {
            Error::internal(format!("failed to spawn buf: {e}"))
        }
    })?;

    if result.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&result.stderr);
    if stderr.to_lowercase().contains("not found") || stderr.contains("NotFound") {
        return Err(Error::not_found(format!("BSR module {reference}")));
    }
    Err(Error::internal(format!(
        "buf export {reference} failed: {}",
        stderr.trim()
    )))
}

/// The installed buf version string.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when buf is missing.
pub async fn version(buf_program: &Path) -> Result<String> {
    let result = tokio::time::timeout(
        VERSION_TIMEOUT,
        Command::new(buf_program).arg("--version").output(),
    )
    .await
    .map_err(|_| Error::timeout("buf --version", VERSION_TIMEOUT.as_secs()))?
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found("the buf tool is not installed")
        } else {
            Error::internal(format!("failed to spawn buf: {e}"))
        }
    })?;
    if !result.status.success() {
        return Err(Error::internal("buf --version exited non-zero"));
    }
    Ok(String::from_utf8_lossy(&result.stdout).trim().to_string())
}

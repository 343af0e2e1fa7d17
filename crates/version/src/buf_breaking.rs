//! `buf breaking` wrapper.
//!
//! Breaking-change detection is delegated to the external buf tool; this
//! module only shapes its invocation and output. A missing buf binary means
//! "no detector available", not a failure: modified files then keep their
//! default classification.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use protodist_core::{Error, Result};

const BREAKING_TIMEOUT: Duration = Duration::from_secs(60);

/// Violations reported by the detector, one message per finding.
#[derive(Debug, Clone, Default)]
pub struct BreakingReport {
    /// Human-readable violation messages.
    pub violations: Vec<String>,
    /// Whether a detector actually ran.
    pub detector_ran: bool,
}

/// Run `buf breaking` on a current tree against a baseline tree.
///
/// # Errors
///
/// Returns [`Error::Timeout`] past the deadline. A missing buf binary
/// yields an empty report with `detector_ran == false`.
pub async fn check(buf_program: &Path, current: &Path, against: &Path) -> Result<BreakingReport> {
    debug!(?current, ?against, "Running buf breaking");
    let spawn = tokio::time::timeout(
        BREAKING_TIMEOUT,
        Command::new(buf_program)
            .arg("breaking")
            .arg(current)
            .arg("--against")
            .arg(against)
            .output(),
    )
    .await
    .map_err(|_| Error::timeout("buf breaking", BREAKING_TIMEOUT.as_secs()))?;

    let output = match spawn {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("buf not installed; skipping breaking-change detection");
            return Ok(BreakingReport::default());
        }
        Err(e) => return Err(Error::internal(format!("failed to spawn buf: {e}"))),
    };

    if output.status.success() {
        return Ok(BreakingReport {
            violations: Vec::new(),
            detector_ran: true,
        });
    }

    // buf prints one violation per line on stdout.
    let violations = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    Ok(BreakingReport {
        violations,
        detector_ran: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_buf_is_not_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let report = check(Path::new("definitely-not-buf"), tmp.path(), tmp.path())
            .await
            .unwrap();
        assert!(!report.detector_ran);
        assert!(report.violations.is_empty());
    }
}

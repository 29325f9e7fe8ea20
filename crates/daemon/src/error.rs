//! Typed errors for the platform and signaling seams.
//!
//! Everything above these seams uses `anyhow`; the enums below exist so that
//! callers can tell "not supported" and "already done" apart from real
//! failures and degrade accordingly.

use thiserror::Error;

/// Failure of a kernel / firewall / WireGuard mutation.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("operation not supported on this platform")]
    NotSupported,
    #[error("object already exists")]
    Exists,
    #[error("object not found")]
    NotFound,
    #[error("`{cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Classify a failed command by its stderr.
    pub fn from_command(cmd: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("file exists") {
            PlatformError::Exists
        } else if lower.contains("no such process")
            || lower.contains("cannot find device")
            || lower.contains("does not exist")
            || lower.contains("no such file or directory")
        {
            PlatformError::NotFound
        } else if lower.contains("not supported") || lower.contains("unknown device type") {
            PlatformError::NotSupported
        } else {
            PlatformError::Command {
                cmd: cmd.to_string(),
                stderr: stderr.trim().to_string(),
            }
        }
    }
}

/// Returns true if `err` wraps a [`PlatformError::NotSupported`].
pub fn is_not_supported(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PlatformError>(),
        Some(PlatformError::NotSupported)
    )
}

/// Returns true if `err` is a benign "already exists" / "already gone".
pub fn is_already_done(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PlatformError>(),
        Some(PlatformError::Exists) | Some(PlatformError::NotFound)
    )
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("no signaling backends configured")]
    NoBackends,
    #[error("all signaling backends failed: {0}")]
    AllFailed(String),
    #[error("signaling backend closed")]
    Closed,
    #[error("unsupported backend scheme: {0}")]
    Unsupported(String),
    #[error("invalid backend uri: {0}")]
    InvalidUri(String),
    #[error("envelope crypto failure: {0}")]
    Crypto(String),
    #[error("envelope is not addressed to this key pair")]
    KeyMismatch,
    #[error("publish timed out")]
    Timeout,
    #[error("signaling transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_command_errors() {
        assert!(matches!(
            PlatformError::from_command("ip", "RTNETLINK answers: File exists"),
            PlatformError::Exists
        ));
        assert!(matches!(
            PlatformError::from_command("ip", "RTNETLINK answers: No such process"),
            PlatformError::NotFound
        ));
        assert!(matches!(
            PlatformError::from_command("ip", "Error: Unknown device type."),
            PlatformError::NotSupported
        ));
        assert!(matches!(
            PlatformError::from_command("ip", "Permission denied"),
            PlatformError::Command { .. }
        ));
    }

    #[test]
    fn test_downcast_helpers() {
        let err = anyhow::Error::new(PlatformError::NotSupported);
        assert!(is_not_supported(&err));
        assert!(!is_already_done(&err));

        let err = anyhow::Error::new(PlatformError::Exists).context("adding route");
        assert!(is_already_done(&err));
    }
}

//! Error types for yunflash.

use std::io;
use thiserror::Error;

/// Result type for yunflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for yunflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, sockets, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid console pattern.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// No matching serial endpoint was located.
    #[error("No serial port suitable for upload")]
    DeviceNotFound,

    /// The device did not reappear after a reset within the deadline.
    #[error("Device {original} did not reappear after reset")]
    DeviceTimeout {
        /// Port name used before the reset.
        original: String,
    },

    /// An expect step never matched before its deadline.
    #[error("Timeout waiting for /{pattern}/")]
    ProtocolTimeout {
        /// Pattern that never matched.
        pattern: String,
        /// Unmatched console output at the time of the timeout.
        transcript: String,
    },

    /// The byte count reported by the target differs from the artifact size.
    #[error("Transfer size mismatch for {artifact}: expected {expected} bytes, got {actual}")]
    TransferSizeMismatch {
        /// Artifact name.
        artifact: String,
        /// Size of the local file.
        expected: u64,
        /// Size reported by the bootloader.
        actual: u64,
    },

    /// No usable local network address.
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// External flashing tool exited with a non-zero status.
    #[error("{program} failed with {status}")]
    SubprocessFailure {
        /// Program that was run.
        program: String,
        /// Exit status description.
        status: String,
    },

    /// The file-transfer service could not be started.
    #[error("File server error: {0}")]
    FileServer(String),

    /// Unexpected console or wire protocol response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application requested the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Whether the failure only invalidates the current provisioning attempt.
    ///
    /// Retryable errors are answered with a fresh attempt using renegotiated
    /// addresses; everything else ends the run.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProtocolTimeout { .. }
                | Self::TransferSizeMismatch { .. }
                | Self::SubprocessFailure { .. }
                | Self::DeviceTimeout { .. }
        )
    }

    /// Whether this is an expect step that ran out of time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ProtocolTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = Error::ProtocolTimeout {
            pattern: "root@".into(),
            transcript: String::new(),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let mismatch = Error::TransferSizeMismatch {
            artifact: "u-boot.bin".into(),
            expected: 10,
            actual: 9,
        };
        assert!(mismatch.is_retryable());
        assert!(!mismatch.is_timeout());

        assert!(!Error::NetworkUnreachable("no address".into()).is_retryable());
        assert!(!Error::Interrupted.is_retryable());
        assert!(!Error::Io(io::Error::other("closed")).is_retryable());
    }

    #[test]
    fn test_display_mentions_sizes() {
        let err = Error::TransferSizeMismatch {
            artifact: "image.bin".into(),
            expected: 1024,
            actual: 1023,
        };
        let text = err.to_string();
        assert!(text.contains("image.bin"));
        assert!(text.contains("1024"));
        assert!(text.contains("1023"));
    }
}

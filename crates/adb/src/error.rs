//! ADB client error types

use thiserror::Error;

/// Errors raised by the ADB client.
#[derive(Debug, Error)]
pub enum AdbError {
    /// The ADB server could not be reached (socket refused, transport
    /// refusal, or server autostart failure).
    #[error("ADB connection error: {0}")]
    Connect(String),

    /// The server replied outside the protocol: a FAIL status, an
    /// unexpected message id, or an oversize length field.
    #[error("ADB protocol error: {0}")]
    Protocol(String),

    /// A sync-subprotocol failure, optionally carrying an errno-style
    /// code reported by the device.
    #[error("ADB sync error: {message}")]
    Sync {
        message: String,
        code: Option<i32>,
    },

    /// A command did not complete within its deadline.
    #[error("ADB command timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdbError {
    pub(crate) fn sync(message: impl Into<String>) -> Self {
        AdbError::Sync {
            message: message.into(),
            code: None,
        }
    }

    pub(crate) fn sync_code(message: impl Into<String>, code: i32) -> Self {
        AdbError::Sync {
            message: message.into(),
            code: Some(code),
        }
    }

    /// The remote path does not exist (errno 2).
    pub fn is_not_found(&self) -> bool {
        matches!(self, AdbError::Sync { code: Some(2), .. })
    }

    /// The remote path is not accessible (errno 13).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AdbError::Sync { code: Some(13), .. })
    }
}

pub type Result<T> = std::result::Result<T, AdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_codes_are_distinguishable() {
        let missing = AdbError::sync_code("stat failed", 2);
        let denied = AdbError::sync_code("stat failed", 13);
        let plain = AdbError::sync("bad message id");

        assert!(missing.is_not_found());
        assert!(!missing.is_permission_denied());
        assert!(denied.is_permission_denied());
        assert!(!plain.is_not_found() && !plain.is_permission_denied());
    }
}

//! Error types shared by the channel, dispatcher and device surface.

use thiserror::Error;

use crate::channel::ConnectionState;
use crate::parser::ParseError;

/// Outcome of a failed modem operation.
///
/// Every variant is a value handed back to the caller; nothing in the
/// command path panics or tears down the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModemError {
    /// Channel not connected, or the byte stream failed mid-conversation.
    #[error("transport error: {0}")]
    Transport(String),

    /// No final result code arrived before the deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The modem answered `ERROR`, `+CME ERROR: <n>` or `+CMS ERROR: <n>`.
    #[error("{command} rejected: {reason}")]
    CommandRejected { command: String, reason: String },

    /// The response did not have the expected shape.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The dispatcher refused the request because the channel is not usable.
    #[error("device unavailable (channel {0})")]
    DeviceUnavailable(ConnectionState),

    /// A queued request was cancelled before it reached the wire.
    #[error("request cancelled before dispatch")]
    Cancelled,

    /// Caller supplied an argument the modem could never accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ModemError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        ModemError::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ModemError::Timeout(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModemError::InvalidArgument(msg.into())
    }

    /// Timeouts and transport failures count towards reconnect escalation;
    /// a rejection proves the link is alive.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, ModemError::Timeout(_) | ModemError::Transport(_))
    }

    /// Numeric code of a `+CME ERROR: <n>` / `+CMS ERROR: <n>` rejection.
    pub fn cme_code(&self) -> Option<u32> {
        let ModemError::CommandRejected { reason, .. } = self else {
            return None;
        };
        reason
            .split_once(':')
            .and_then(|(_, code)| code.trim().parse().ok())
    }
}

impl From<std::io::Error> for ModemError {
    fn from(e: std::io::Error) -> Self {
        ModemError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cme_code() {
        let err = ModemError::CommandRejected {
            command: "AT+COPS=2".into(),
            reason: "+CME ERROR: 30".into(),
        };
        assert_eq!(err.cme_code(), Some(30));
        assert_eq!(err.to_string(), "AT+COPS=2 rejected: +CME ERROR: 30");
    }

    #[test]
    fn test_cme_code_plain_error() {
        let err = ModemError::CommandRejected {
            command: "AT+FOO".into(),
            reason: "ERROR".into(),
        };
        assert_eq!(err.cme_code(), None);
        assert_eq!(ModemError::timeout("x").cme_code(), None);
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(ModemError::timeout("AT").is_link_failure());
        assert!(ModemError::transport("eof").is_link_failure());
        assert!(!ModemError::Cancelled.is_link_failure());
        assert!(!ModemError::CommandRejected {
            command: "AT".into(),
            reason: "ERROR".into()
        }
        .is_link_failure());
    }

    #[test]
    fn test_device_unavailable_display() {
        let err = ModemError::DeviceUnavailable(ConnectionState::Faulted);
        assert_eq!(err.to_string(), "device unavailable (channel faulted)");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ModemError = io_err.into();
        assert!(matches!(err, ModemError::Transport(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}

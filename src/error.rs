//! Error taxonomy for the USB2SNES client.
//!
//! Four categories, matching the ways an exchange can go wrong:
//!
//! - [`ClientError::Connection`] - transport failed or a bounded wait on a
//!   control reply expired. The connection has been torn down.
//! - [`ClientError::Protocol`] - the binary stream returned the wrong byte
//!   count or an unexpected frame. Fatal for the connection: a partial or
//!   garbled binary reply cannot be resynchronized.
//! - [`ClientError::Validation`] - synchronous pre-I/O rejection. No bytes
//!   were sent; the connection is untouched.
//! - [`ClientError::Timeout`] - a blocking wrapper or one-shot watch helper
//!   hit its deadline. The underlying exchange may still be in flight, so
//!   the client drops the connection rather than trust the queue.

/// Error type for all client operations.
#[derive(Debug)]
pub enum ClientError {
    /// Transport closed, connect failed, or a control reply never arrived.
    Connection(String),
    /// Wrong byte count or unexpected frame; the stream cannot be trusted.
    Protocol(String),
    /// Rejected before any network activity.
    Validation(String),
    /// A deadline expired on a blocking wrapper or watch helper.
    Timeout(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Connection and protocol errors tear the link down; validation errors
    /// happen before any I/O. Timeouts are handled by the blocking wrappers
    /// themselves (they drop the connection explicitly).
    pub(crate) fn tears_down(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Protocol(_))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("bad JSON frame: {err}"))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_protocol_tear_down() {
        assert!(ClientError::Connection("gone".into()).tears_down());
        assert!(ClientError::Protocol("short read".into()).tears_down());
    }

    #[test]
    fn validation_and_timeout_keep_connection() {
        assert!(!ClientError::Validation("out of range".into()).tears_down());
        assert!(!ClientError::Timeout("deadline".into()).tears_down());
    }

    #[test]
    fn display_prefixes_category() {
        let err = ClientError::Validation("blob size".into());
        assert_eq!(err.to_string(), "validation error: blob size");
    }
}

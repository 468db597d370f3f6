//! Client configuration.
//!
//! All tunables live in an explicit [`ClientConfig`] passed to the client
//! constructor. There is no hidden global or environment-variable state;
//! callers that want environment overrides apply them before constructing
//! the client.

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT_PER_MB};

/// Configuration for a [`crate::SnesClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Upload chunk size in bytes.
    pub chunk_size: usize,
    /// Whether `put_file` creates the destination directory before
    /// streaming (list it, create it only when missing).
    pub preemptive_dir_create: bool,
    /// Whether `put_file` re-lists the destination after streaming to
    /// confirm the file exists.
    pub verify_after_upload: bool,
    /// Seconds-per-megabyte used to derive the blocking upload deadline.
    pub timeout_per_mb: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            preemptive_dir_create: true,
            verify_after_upload: true,
            timeout_per_mb: DEFAULT_TIMEOUT_PER_MB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_recommendations() {
        let config = ClientConfig::default();
        assert_eq!(config.chunk_size, 1024);
        assert!(config.preemptive_dir_create);
        assert!(config.verify_after_upload);
        assert_eq!(config.timeout_per_mb, 10);
    }
}

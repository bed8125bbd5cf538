use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default arena size in bytes.
pub const JOURNAL_BUFFER_SIZE_DEFAULT: usize = 32 * 1024;

/// Default number of slots in the NOCAT ring buffer.
pub const NOCAT_RING_ENTRIES: usize = 100;

/// Default number of slots in the RC diagnostic ring buffer.
pub const RC_DIAG_RING_ENTRIES: usize = 32;

/// Slots given to ring buffers created on first use.
pub const DEFAULT_RING_ENTRIES: usize = 32;

/// Configuration of a [`Journal`](crate::Journal).
///
/// Missing fields deserialize to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Arena size in bytes
    pub arena_size: usize,
    /// Fold repeated assertions into one record
    pub compress: bool,
    /// Slots in the NOCAT ring buffer
    pub nocat_entries: usize,
    /// Slots in the RC diagnostic ring buffer
    pub rc_diag_entries: usize,
    /// Slots given to ring buffers created on first use
    pub default_ring_entries: usize,
    /// How long a blocking caller retries a busy gate before giving up
    pub dump_wait: Duration,
    /// Tag attached to NOCAT notifications
    pub nocat_tag: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            arena_size: JOURNAL_BUFFER_SIZE_DEFAULT,
            compress: true,
            nocat_entries: NOCAT_RING_ENTRIES,
            rc_diag_entries: RC_DIAG_RING_ENTRIES,
            default_ring_entries: DEFAULT_RING_ENTRIES,
            dump_wait: Duration::from_secs(2),
            nocat_tag: String::from("rcdb"),
        }
    }
}

impl JournalConfig {
    /// Specifies the arena size in bytes.
    pub fn with_arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Enables or disables assertion folding.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_nocat_entries(mut self, nocat_entries: usize) -> Self {
        self.nocat_entries = nocat_entries;
        self
    }

    pub fn with_rc_diag_entries(mut self, rc_diag_entries: usize) -> Self {
        self.rc_diag_entries = rc_diag_entries;
        self
    }

    pub fn with_default_ring_entries(mut self, default_ring_entries: usize) -> Self {
        self.default_ring_entries = default_ring_entries;
        self
    }

    /// Specifies the retry budget for busy gates.
    pub fn with_dump_wait(mut self, dump_wait: Duration) -> Self {
        self.dump_wait = dump_wait;
        self
    }

    pub fn with_nocat_tag(mut self, nocat_tag: impl Into<String>) -> Self {
        self.nocat_tag = nocat_tag.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = JournalConfig::default();
        assert_eq!(config.arena_size, 32 * 1024);
        assert!(config.compress);
        assert_eq!(config.nocat_entries, 100);
        assert_eq!(config.rc_diag_entries, 32);
        assert_eq!(config.dump_wait, Duration::from_secs(2));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: JournalConfig =
            serde_json::from_str(r#"{ "arena_size": 4096, "compress": false }"#).unwrap();
        assert_eq!(config.arena_size, 4096);
        assert!(!config.compress);
        assert_eq!(config.nocat_entries, NOCAT_RING_ENTRIES);
        assert_eq!(config.nocat_tag, "rcdb");
    }

    #[test]
    fn builder() {
        let config = JournalConfig::default()
            .with_nocat_entries(8)
            .with_dump_wait(Duration::from_millis(5))
            .with_nocat_tag("gpu0");
        assert_eq!(config.nocat_entries, 8);
        assert_eq!(config.dump_wait, Duration::from_millis(5));
        assert_eq!(config.nocat_tag, "gpu0");
    }
}

//! Store configuration.

/// Store version written into new manifests when the caller does not pick one.
pub const DEFAULT_STORE_VERSION: u32 = 1;

/// Whether a store mirrors its mutations into an operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Every mutation is appended to `oplog/` before it is applied.
    #[default]
    Enabled,
    /// No log is kept. Used for throwaway stores that are only diffed.
    Disabled,
}

/// Configuration for connecting to a record store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Version the store must carry. `None` accepts whatever is on disk.
    pub version: Option<u32>,

    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Open without write access; mutators fail with `ReadOnly`.
    pub read_only: bool,

    /// Whether mutations are logged.
    pub log_mode: LogMode,

    /// Whether to sync the operation log after every append.
    pub sync_on_write: bool,

    /// Size at which an entry or payload chunk is rotated.
    pub max_chunk_size: u64,

    /// Whether compaction deletes chunks and snapshots it no longer needs.
    pub reclaim_on_compaction: bool,

    /// How many compaction snapshots to keep once reclaimed.
    pub retained_snapshots: usize,

    /// Number of log entries recovery applies per read action.
    pub recovery_batch_size: usize,

    /// Default element cap for the diff oracle.
    pub max_diff_elements: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: Some(DEFAULT_STORE_VERSION),
            create_if_missing: true,
            read_only: false,
            log_mode: LogMode::Enabled,
            sync_on_write: false,
            max_chunk_size: 16 * 1024 * 1024, // 16 MB
            reclaim_on_compaction: true,
            retained_snapshots: 2,
            recovery_batch_size: 1024,
            max_diff_elements: 1000,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for opening an existing store for inspection.
    ///
    /// Read-only, no version check, never creates anything.
    #[must_use]
    pub fn inspection() -> Self {
        Self::default()
            .version(None)
            .create_if_missing(false)
            .read_only(true)
    }

    /// Sets the required store version.
    #[must_use]
    pub const fn version(mut self, version: Option<u32>) -> Self {
        self.version = version;
        self
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the log mode.
    #[must_use]
    pub const fn log_mode(mut self, mode: LogMode) -> Self {
        self.log_mode = mode;
        self
    }

    /// Sets whether to sync the log on every append.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the chunk rotation size.
    #[must_use]
    pub const fn max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Sets whether compaction reclaims space.
    #[must_use]
    pub const fn reclaim_on_compaction(mut self, value: bool) -> Self {
        self.reclaim_on_compaction = value;
        self
    }

    /// Sets how many snapshots survive reclamation.
    #[must_use]
    pub const fn retained_snapshots(mut self, count: usize) -> Self {
        self.retained_snapshots = count;
        self
    }

    /// Sets the recovery batch size.
    #[must_use]
    pub const fn recovery_batch_size(mut self, size: usize) -> Self {
        self.recovery_batch_size = size;
        self
    }

    /// Sets the diff element cap.
    #[must_use]
    pub const fn max_diff_elements(mut self, count: usize) -> Self {
        self.max_diff_elements = count;
        self
    }

    /// The version new stores are created with.
    #[must_use]
    pub fn effective_version(&self) -> u32 {
        self.version.unwrap_or(DEFAULT_STORE_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.version, Some(DEFAULT_STORE_VERSION));
        assert!(config.create_if_missing);
        assert!(!config.read_only);
        assert_eq!(config.log_mode, LogMode::Enabled);
        assert!(config.retained_snapshots >= 1);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .version(Some(7))
            .log_mode(LogMode::Disabled)
            .max_chunk_size(512)
            .recovery_batch_size(3);

        assert_eq!(config.effective_version(), 7);
        assert_eq!(config.log_mode, LogMode::Disabled);
        assert_eq!(config.max_chunk_size, 512);
        assert_eq!(config.recovery_batch_size, 3);
    }

    #[test]
    fn inspection_never_writes() {
        let config = Config::inspection();
        assert!(config.read_only);
        assert!(!config.create_if_missing);
        assert_eq!(config.version, None);
        assert_eq!(config.effective_version(), DEFAULT_STORE_VERSION);
    }
}

//! Engine configuration.
//!
//! `Options` is an immutable value threaded by reference through every
//! engine call. Operations that need to adjust settings mid-run (the
//! recreate engine, when a remote manifest declares different parameters)
//! produce a new value instead of mutating shared state.

use crate::prune::retention::RetentionRule;

/// Default block size: 100 KiB, matching the remote volume manifests.
pub const DEFAULT_BLOCKSIZE: i64 = 100 * 1024;

/// Default target size for a remote volume.
pub const DEFAULT_VOLSIZE: i64 = 50 * 1024 * 1024;

/// SHA-256 digests, as stored in blocks and blocklists.
pub const BLOCK_HASH_BYTES: usize = 32;

/// How symlinks found in the source tree are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymlinkPolicy {
    /// Record the link itself (target path in metadata).
    Store,
    /// Drop the entry entirely.
    Ignore,
    /// Treat the target as if it were at the link's path.
    Follow,
}

/// How much work change detection does per file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeDetectionMode {
    /// Full lookup: previous id, timestamps, sizes, and metadata hashes.
    Full,
    /// Only compare the recorded last-modified timestamp.
    CheckFiletimeOnly,
    /// Skip the timestamp check; every file is re-examined.
    DisableFiletimeCheck,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Filename prefix shared by every volume on the remote.
    pub prefix: String,
    pub blocksize: i64,
    pub volsize: i64,
    /// Waste threshold in percent for the compact decision.
    pub waste_threshold: i64,
    pub small_file_size: i64,
    pub max_small_file_count: i64,
    pub dry_run: bool,
    pub passphrase: Option<String>,
    /// Compression module name, doubling as the volume file extension.
    pub compression_module: String,
    /// Encryption module name; `None` produces unencrypted volumes.
    pub encryption_module: Option<String>,
    pub retention_rules: Vec<RetentionRule>,
    pub allow_full_removal: bool,
    pub symlink_policy: SymlinkPolicy,
    pub skip_metadata: bool,
    pub change_detection: ChangeDetectionMode,
    /// Switches the recreate reconciliation to the experimental
    /// temp-table path.
    pub experimental_recreate: bool,
    /// Concurrent downloads for overlapped volume fetches.
    pub download_parallelism: usize,
    /// Seconds a volume lingers in `Deleting` before the remote file is
    /// actually removed. Zero deletes immediately.
    pub delete_grace_seconds: i64,
}

impl Options {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            blocksize: DEFAULT_BLOCKSIZE,
            volsize: DEFAULT_VOLSIZE,
            waste_threshold: 25,
            small_file_size: DEFAULT_VOLSIZE / 20,
            max_small_file_count: 20,
            dry_run: false,
            passphrase: None,
            compression_module: "zip".to_string(),
            encryption_module: None,
            retention_rules: Vec::new(),
            allow_full_removal: false,
            symlink_policy: SymlinkPolicy::Store,
            skip_metadata: false,
            change_detection: ChangeDetectionMode::Full,
            experimental_recreate: false,
            download_parallelism: 4,
            delete_grace_seconds: 0,
        }
    }

    pub fn with_blocksize(mut self, blocksize: i64) -> Self {
        self.blocksize = blocksize;
        self
    }

    pub fn with_volsize(mut self, volsize: i64) -> Self {
        self.volsize = volsize;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_retention_rules(mut self, rules: Vec<RetentionRule>) -> Self {
        self.retention_rules = rules;
        self
    }

    pub fn with_symlink_policy(mut self, policy: SymlinkPolicy) -> Self {
        self.symlink_policy = policy;
        self
    }

    /// Number of block hashes that fit in one full blocklist block.
    pub fn hashes_per_block(&self) -> i64 {
        self.blocksize / BLOCK_HASH_BYTES as i64
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new("coffer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.prefix, "coffer");
        assert_eq!(opts.blocksize, 100 * 1024);
        assert_eq!(opts.hashes_per_block(), 3200);
        assert!(!opts.dry_run);
    }

    #[test]
    fn test_builders() {
        let opts = Options::new("backup")
            .with_blocksize(1024)
            .with_dry_run(true)
            .with_passphrase("secret");
        assert_eq!(opts.blocksize, 1024);
        assert!(opts.dry_run);
        assert_eq!(opts.passphrase.as_deref(), Some("secret"));
        assert_eq!(opts.hashes_per_block(), 32);
    }
}

//! Constants for the run engine.
//!
//! All limits, defaults, and well-known names are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

// =============================================================================
// Workspace
// =============================================================================

/// Environment variable naming the workspace root.
pub const WORKSPACE_ENV: &str = "REPRORUN_WORKSPACE";

/// Subdirectory of the platform temp dir used when the env var is unset.
pub const WORKSPACE_DEFAULT_DIR: &str = "reprorun";

/// Per-executor subdirectory holding job directories.
pub const JOB_DIR: &str = "job";

/// Name of the stream spool file inside a job directory.
pub const STREAM_SPOOL_FILE: &str = "log";

/// Name of the rootfs directory inside a job directory.
pub const ROOTFS_DIR: &str = "rootfs";

// =============================================================================
// Filter Defaults
// =============================================================================

/// Default uid forced onto outputs when no filter is specified.
pub const FILTER_DEFAULT_UID: u32 = 1000;

/// Default gid forced onto outputs when no filter is specified.
pub const FILTER_DEFAULT_GID: u32 = 1000;

/// Default mtime forced onto outputs, as seconds since the epoch.
///
/// 2010-01-01T00:00:00Z. Deliberately not zero/epoch: some software
/// treats epoch timestamps as errors or empty values.
pub const FILTER_DEFAULT_MTIME_SECS: i64 = 1_262_304_000;

// =============================================================================
// Action Defaults
// =============================================================================

/// PATH injected when a formula does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Entrypoint assumed when a formula does not set one.
pub const DEFAULT_ENTRYPOINT: &str = "/bin/true";

/// Working directory assumed when a formula does not set one.
pub const DEFAULT_CWD: &str = "/";

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum size of a single ware blob (512 MiB).
/// Prevents disk exhaustion from a hostile warehouse.
pub const MAX_WARE_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total unpacked tree size (4 GiB).
/// Prevents decompression bombs.
pub const MAX_TREE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of entries unpacked from a single ware.
pub const MAX_ENTRIES_PER_WARE: usize = 1_000_000;

// =============================================================================
// Hash Format
// =============================================================================

/// Digest algorithm prefix for content hashes produced by this engine.
pub const HASH_ALGO_PREFIX: &str = "sha256:";

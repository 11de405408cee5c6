//! Compile-time constants. There is deliberately no runtime configuration:
//! the file modes and suffixes are part of the on-disk contract.

/// Database files are created in this mode (Unix).
pub const FILE_MODE: u32 = 0o666;

/// Parent directories are created in this mode (Unix).
pub const DIR_MODE: u32 = 0o777;

/// Suffix of the keys log, appended to the database path.
pub const IDX_SUFFIX: &str = ".idx";

/// Suffix of the advisory lock file, appended to the database path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Bound of the per-database request queue. Producers block when it fills.
pub const REQUEST_QUEUE_CAPACITY: usize = 128;

//! Default constants for upsertree configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Flush Defaults
// =============================================================================

/// Maximum bound values in a single insert statement.
/// Matches the 16-bit placeholder counter of common SQL wire protocols.
pub const DEFAULT_MAX_PLACEHOLDERS: usize = 65535;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default directory for the RocksDB-backed store
pub const DEFAULT_DATA_DIR: &str = "./upsertree-data";

/// On-disk layout version recorded in the storage manifest
pub const STORAGE_FORMAT_VERSION: u32 = 1;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "UPSERTREE_";

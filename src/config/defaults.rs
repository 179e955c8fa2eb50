//! Default constants for smartfire configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Job Queue Defaults
// =============================================================================

/// Worker thread count; 0 sizes the pool from host parallelism
pub const DEFAULT_WORKERS: usize = 0;

/// Upper bound on waiting for workers to stop during disposal (milliseconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// Reconciliation method used when a stream does not name one
pub const DEFAULT_RECONCILIATION_METHOD: &str = "default";

/// Above this many polygon parts a fire shape is queried without buffering
/// Buffering very complex multipolygons costs far more than it gains.
pub const DEFAULT_COMPLEXITY_THRESHOLD: usize = 200;

/// Fire type code that marks an event as a wildfire
pub const DEFAULT_WILDFIRE_TYPE: &str = "WF";

/// Chain each new reconciliation job behind earlier jobs for the same stream
pub const DEFAULT_AUTO_CHAIN: bool = true;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default tracing filter level
pub const DEFAULT_LOG_LEVEL: &str = "info";

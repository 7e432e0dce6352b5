//! The small set of typed, non-fatal errors the core surfaces. Contract
//! violations (level inversion, double free) assert in debug and are
//! undefined behavior we don't try to catch in release.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A timer was disposed, or a scheduler was shut down, before the
    /// associated request finished.
    #[error("operation was cancelled")]
    Cancelled,
}

/// Monitor policy violations are logged, never fatal. This type exists
/// so callers who *do* want to assert on
/// them in tests can match on a concrete value instead of scraping logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    /// A `Strict`-policy monitor was entered by a thread marked real-time.
    RealTimeUnderStrict,
    /// An `AllowRt`-policy monitor was entered by a non-real-time thread
    /// after having previously been entered by a real-time one.
    PossibleInversion,
}

// crates/envelope-core/src/core/time.rs
// ============================================================================
// Module: Envelope Time Model
// Description: Canonical timestamp representation for envelope records.
// Purpose: Provide a stable wire form for created/updated/computed-at times.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Envelope records carry explicit timestamps (creation, last update, gates
//! computed-at). Values are unix epoch milliseconds; hosts that need
//! deterministic replay can supply timestamps explicitly instead of calling
//! [`Timestamp::now`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

// ============================================================================
// SECTION: Time Values
// ============================================================================

/// Canonical timestamp in unix epoch milliseconds.
///
/// # Invariants
/// - No validation is performed; monotonicity is a caller responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix epoch milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        Self(i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX))
    }

    /// Returns the timestamp as unix epoch milliseconds.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }
}

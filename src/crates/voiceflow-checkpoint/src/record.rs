//! Persisted checkpoint record and TTL arithmetic
//!
//! A [`CheckpointRecord`] is the unit every [`CheckpointStore`](crate::CheckpointStore)
//! reads and writes. The layout mirrors a partitioned key-value table:
//!
//! ```text
//! partition key : session_id
//! sort key      : checkpoint_id
//! attributes    : state (nested map), metadata (map),
//!                 timestamp (ISO-8601), ttl (epoch seconds)
//! ```
//!
//! Expiry is lazy: nothing sweeps old records, readers treat a record whose
//! `ttl` has passed as absent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default retention for durable checkpoints
pub const DEFAULT_TTL_DAYS: u32 = 1;

/// Hard upper bound on retention regardless of deployment config
pub const MAX_TTL_DAYS: u32 = 10;

/// Clamp a configured retention into `1..=MAX_TTL_DAYS`
pub fn clamp_ttl_days(days: u32) -> u32 {
    days.clamp(1, MAX_TTL_DAYS)
}

/// One durable checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Partition key
    pub session_id: String,

    /// Sort key
    pub checkpoint_id: String,

    /// Session state snapshot
    pub state: Value,

    /// Free-form metadata supplied by the caller
    #[serde(default)]
    pub metadata: Value,

    /// Creation time, ISO-8601
    pub timestamp: String,

    /// Expiry in epoch seconds
    pub ttl: i64,
}

impl CheckpointRecord {
    /// Build a record stamped with the current time and a TTL of `ttl_days`
    pub fn new(
        session_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        state: Value,
        metadata: Value,
        ttl_days: u32,
    ) -> Self {
        Self::at(session_id, checkpoint_id, state, metadata, ttl_days, Utc::now())
    }

    /// Build a record as of `now`
    pub fn at(
        session_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        state: Value,
        metadata: Value,
        ttl_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl = now + Duration::days(i64::from(clamp_ttl_days(ttl_days)));
        Self {
            session_id: session_id.into(),
            checkpoint_id: checkpoint_id.into(),
            state,
            metadata,
            timestamp: now.to_rfc3339(),
            ttl: ttl.timestamp(),
        }
    }

    /// Whether the record has outlived its TTL as of `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl <= now.timestamp()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Parsed creation time, if the stored timestamp is well formed
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

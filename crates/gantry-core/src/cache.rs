//! Cache types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A content-addressed cache entry produced or consumed by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CacheEntry {
    pub key: String,
    pub scope: String,
    /// Store-specific locator of the payload.
    pub payload_ref: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}


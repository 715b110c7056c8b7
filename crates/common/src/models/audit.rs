use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A Merkle root over a contiguous range of segment hashes.
///
/// Rows are append-only: the application role holds INSERT-only privileges
/// on `audit_anchors` and never issues UPDATE or DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAnchor {
    /// Monotonic BIGSERIAL identifier.
    pub anchor_id: i64,
    /// Lowercase 64-char SHA-256 hex root.
    pub merkle_root: String,
    pub segment_count: i32,
    pub first_segment_id: Uuid,
    pub last_segment_id: Uuid,
    pub anchored_at: DateTime<Utc>,
}

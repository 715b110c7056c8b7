//! Merkle-root audit anchoring.
//!
//! Segment hashes fold into a Merkle root over their hex-digest strings;
//! pair hashes concatenate the two 64-char strings and the hex result
//! becomes the layer-above element. Odd layers duplicate their last
//! element. Anchors land in the append-only `audit_anchors` table.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use voxsentinel_common::metrics;
use voxsentinel_common::models::AuditAnchor;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("cannot build a Merkle root over an empty hash list")]
    Empty,
}

fn pair_hash(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Merkle root of an ordered hash list.
pub fn build_merkle_root(hashes: &[String]) -> Result<String, AuditError> {
    if hashes.is_empty() {
        return Err(AuditError::Empty);
    }

    let mut layer: Vec<String> = hashes.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1].clone();
            layer.push(last);
        }
        layer = layer
            .chunks(2)
            .map(|pair| pair_hash(&pair[0], &pair[1]))
            .collect();
    }
    Ok(layer.remove(0))
}

/// Which side a proof sibling sits on relative to the running hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidePosition {
    Left,
    Right,
}

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub position: SidePosition,
    pub hash: String,
}

/// Sibling path for the leaf at `index`. Empty for a single-leaf tree.
pub fn build_proof(hashes: &[String], index: usize) -> Vec<ProofStep> {
    let mut proof = Vec::new();
    if hashes.len() <= 1 || index >= hashes.len() {
        return proof;
    }

    let mut layer: Vec<String> = hashes.to_vec();
    let mut position = index;
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1].clone();
            layer.push(last);
        }
        let sibling = position ^ 1;
        proof.push(ProofStep {
            position: if sibling > position {
                SidePosition::Right
            } else {
                SidePosition::Left
            },
            hash: layer[sibling].clone(),
        });
        layer = layer
            .chunks(2)
            .map(|pair| pair_hash(&pair[0], &pair[1]))
            .collect();
        position /= 2;
    }
    proof
}

/// Recomputes the root from a leaf hash and its sibling path.
pub fn verify_proof(leaf: &str, proof: &[ProofStep]) -> String {
    let mut current = leaf.to_string();
    for step in proof {
        current = match step.position {
            SidePosition::Right => pair_hash(&current, &step.hash),
            SidePosition::Left => pair_hash(&step.hash, &current),
        };
    }
    current
}

/// Result of verifying one segment against its covering anchor.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub segment_id: Uuid,
    pub anchor_id: i64,
    pub merkle_root: String,
    pub recomputed_root: String,
    pub proof: Vec<ProofStep>,
    pub verified: bool,
}

/// Periodic anchoring task plus segment verification.
pub struct AuditAnchorJob {
    pool: PgPool,
    interval: Duration,
}

impl AuditAnchorJob {
    pub fn new(pool: PgPool, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// One anchoring cycle: folds every hashed segment newer than the last
    /// anchor into a new root. Returns `None` when there is nothing new.
    pub async fn anchor_once(&self) -> anyhow::Result<Option<AuditAnchor>> {
        let last_anchor_time: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT anchored_at FROM audit_anchors ORDER BY anchor_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let since = last_anchor_time
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now));

        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT segment_id, segment_hash FROM transcript_segments \
             WHERE segment_hash IS NOT NULL AND created_at > $1 \
             ORDER BY created_at ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let hashes: Vec<String> = rows.iter().map(|(_, h)| h.clone()).collect();
        let merkle_root = build_merkle_root(&hashes)?;
        let first_segment_id = rows[0].0;
        let last_segment_id = rows[rows.len() - 1].0;
        let anchored_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let anchor_id: i64 = match sqlx::query_scalar(
            "INSERT INTO audit_anchors \
             (merkle_root, segment_count, first_segment_id, last_segment_id, anchored_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING anchor_id",
        )
        .bind(&merkle_root)
        .bind(rows.len() as i32)
        .bind(first_segment_id)
        .bind(last_segment_id)
        .bind(anchored_at)
        .fetch_one(&mut *tx)
        .await
        {
            Ok(anchor_id) => anchor_id,
            Err(err) => {
                tx.rollback().await.ok();
                metrics::ANCHORS_WRITTEN.with_label_values(&["error"]).inc();
                return Err(err.into());
            }
        };
        tx.commit().await?;

        metrics::ANCHORS_WRITTEN.with_label_values(&["ok"]).inc();
        info!(
            anchor_id,
            segments = rows.len(),
            root = %merkle_root,
            "audit anchor written"
        );

        Ok(Some(AuditAnchor {
            anchor_id,
            merkle_root,
            segment_count: rows.len() as i32,
            first_segment_id,
            last_segment_id,
            anchored_at,
        }))
    }

    /// Rebuilds the covering anchor's hash range and checks the segment's
    /// Merkle proof against the stored root.
    pub async fn verify_segment(&self, segment_id: Uuid) -> anyhow::Result<VerificationReport> {
        // Earliest anchor whose [first, last] range covers this segment's
        // position in the created_at order.
        let anchor: Option<(i64, String, Uuid, Uuid)> = sqlx::query_as(
            "SELECT a.anchor_id, a.merkle_root, a.first_segment_id, a.last_segment_id \
             FROM audit_anchors a \
             JOIN transcript_segments f ON f.segment_id = a.first_segment_id \
             JOIN transcript_segments l ON l.segment_id = a.last_segment_id \
             JOIN transcript_segments s ON s.segment_id = $1 \
             WHERE s.created_at >= f.created_at AND s.created_at <= l.created_at \
             ORDER BY a.anchor_id ASC LIMIT 1",
        )
        .bind(segment_id)
        .fetch_optional(&self.pool)
        .await?;

        let (anchor_id, merkle_root, first_segment_id, last_segment_id) = anchor
            .ok_or_else(|| anyhow::anyhow!("no anchor covers segment {segment_id}"))?;

        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT segment_id, segment_hash FROM transcript_segments \
             WHERE segment_hash IS NOT NULL \
               AND created_at >= (SELECT created_at FROM transcript_segments WHERE segment_id = $1) \
               AND created_at <= (SELECT created_at FROM transcript_segments WHERE segment_id = $2) \
             ORDER BY created_at ASC",
        )
        .bind(first_segment_id)
        .bind(last_segment_id)
        .fetch_all(&self.pool)
        .await?;

        let index = rows
            .iter()
            .position(|(id, _)| *id == segment_id)
            .ok_or_else(|| anyhow::anyhow!("segment {segment_id} missing from anchor range"))?;

        let hashes: Vec<String> = rows.iter().map(|(_, h)| h.clone()).collect();
        let proof = build_proof(&hashes, index);
        let recomputed_root = verify_proof(&hashes[index], &proof);
        let verified = recomputed_root == merkle_root;

        Ok(VerificationReport {
            segment_id,
            anchor_id,
            merkle_root,
            recomputed_root,
            proof,
            verified,
        })
    }

    /// Anchors on a fixed interval until the stop event fires.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        info!(interval_s = self.interval.as_secs(), "audit anchor task started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = self.anchor_once().await {
                        warn!(error = %err, "anchoring cycle failed");
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("audit anchor task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn single_hash_is_its_own_root() {
        let h = sha(b"test");
        assert_eq!(build_merkle_root(&[h.clone()]).unwrap(), h);
    }

    #[test]
    fn two_hashes_concatenate() {
        let h1 = sha(b"a");
        let h2 = sha(b"b");
        let expected = sha(format!("{h1}{h2}").as_bytes());
        assert_eq!(build_merkle_root(&[h1, h2]).unwrap(), expected);
    }

    #[test]
    fn three_hashes_duplicate_the_last() {
        let h1 = sha(b"a");
        let h2 = sha(b"b");
        let h3 = sha(b"c");
        let left = sha(format!("{h1}{h2}").as_bytes());
        let right = sha(format!("{h3}{h3}").as_bytes());
        let expected = sha(format!("{left}{right}").as_bytes());
        assert_eq!(build_merkle_root(&[h1, h2, h3]).unwrap(), expected);
    }

    #[test]
    fn four_hashes_build_two_layers() {
        let hashes: Vec<String> = (0..4).map(|i| sha(format!("seg{i}").as_bytes())).collect();
        let left = sha(format!("{}{}", hashes[0], hashes[1]).as_bytes());
        let right = sha(format!("{}{}", hashes[2], hashes[3]).as_bytes());
        let expected = sha(format!("{left}{right}").as_bytes());
        assert_eq!(build_merkle_root(&hashes).unwrap(), expected);
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(build_merkle_root(&[]), Err(AuditError::Empty)));
    }

    #[test]
    fn root_is_deterministic_and_order_sensitive() {
        let hashes: Vec<String> = (0..5).map(|i| sha(format!("h{i}").as_bytes())).collect();
        assert_eq!(
            build_merkle_root(&hashes).unwrap(),
            build_merkle_root(&hashes).unwrap()
        );

        let mut reversed = hashes.clone();
        reversed.reverse();
        assert_ne!(
            build_merkle_root(&hashes).unwrap(),
            build_merkle_root(&reversed).unwrap()
        );
    }

    #[test]
    fn large_batch_root_is_64_hex_chars() {
        let hashes: Vec<String> = (0..100).map(|i| sha(format!("seg{i}").as_bytes())).collect();
        let root = build_merkle_root(&hashes).unwrap();
        assert_eq!(root.len(), 64);
    }

    #[test]
    fn single_leaf_proof_is_empty() {
        let h = sha(b"only");
        let proof = build_proof(&[h.clone()], 0);
        assert!(proof.is_empty());
        assert_eq!(verify_proof(&h, &proof), h);
    }

    #[test]
    fn two_leaf_proof_is_the_right_sibling() {
        let h1 = sha(b"a");
        let h2 = sha(b"b");
        let hashes = vec![h1.clone(), h2.clone()];
        let proof = build_proof(&hashes, 0);
        assert_eq!(
            proof,
            vec![ProofStep {
                position: SidePosition::Right,
                hash: h2,
            }]
        );
        assert_eq!(
            verify_proof(&h1, &proof),
            build_merkle_root(&hashes).unwrap()
        );
    }

    #[test]
    fn every_leaf_proof_reconstructs_the_root() {
        let hashes: Vec<String> = (0..7).map(|i| sha(format!("seg{i}").as_bytes())).collect();
        let root = build_merkle_root(&hashes).unwrap();
        for (index, leaf) in hashes.iter().enumerate() {
            let proof = build_proof(&hashes, index);
            assert_eq!(verify_proof(leaf, &proof), root, "leaf {index}");
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let hashes: Vec<String> = (0..4).map(|i| sha(format!("seg{i}").as_bytes())).collect();
        let root = build_merkle_root(&hashes).unwrap();
        let proof = build_proof(&hashes, 1);

        // Flip one nibble of the leaf hash.
        let mut tampered = hashes[1].clone();
        let flipped = if tampered.starts_with('0') { "1" } else { "0" };
        tampered.replace_range(0..1, flipped);

        assert_ne!(verify_proof(&tampered, &proof), root);
    }
}

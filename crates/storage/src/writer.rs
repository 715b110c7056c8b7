//! Transcript segment persistence: hash, transactional insert, then
//! search indexing outside the transaction.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use voxsentinel_common::metrics;
use voxsentinel_common::models::TranscriptSegment;

use crate::search::SearchIndexer;

pub struct TranscriptWriter {
    pool: PgPool,
    indexer: Option<Arc<SearchIndexer>>,
}

impl TranscriptWriter {
    pub fn new(pool: PgPool, indexer: Option<Arc<SearchIndexer>>) -> Self {
        Self { pool, indexer }
    }

    /// Persists one segment in a single transaction, then indexes the
    /// redacted document. Index failures log but never roll back the
    /// database write.
    pub async fn write_segment(&self, segment: &mut TranscriptSegment) -> anyhow::Result<()> {
        let hash = segment.compute_hash();
        segment.segment_hash = Some(hash);

        let word_timestamps = serde_json::to_value(&segment.word_timestamps)?;
        let pii_entities = serde_json::to_value(&segment.pii_entities_found)?;

        let mut tx = self.pool.begin().await?;

        // The session row may not exist yet when the management API is the
        // system of record; keep the FK satisfied.
        let ensure_session = sqlx::query(
            "INSERT INTO sessions (session_id, stream_id, asr_backend_used) \
             VALUES ($1, $2, $3) ON CONFLICT (session_id) DO NOTHING",
        )
        .bind(segment.session_id)
        .bind(segment.stream_id)
        .bind(&segment.asr_backend)
        .execute(&mut *tx)
        .await;
        if let Err(err) = ensure_session {
            tx.rollback().await.ok();
            return Err(err.into());
        }

        let insert = sqlx::query(
            "INSERT INTO transcript_segments \
             (segment_id, session_id, stream_id, speaker_id, start_time, end_time, \
              start_offset_ms, end_offset_ms, text_redacted, text_original, word_timestamps, \
              language, asr_backend, asr_confidence, sentiment_label, sentiment_score, \
              pii_entities_found, segment_hash, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19)",
        )
        .bind(segment.segment_id)
        .bind(segment.session_id)
        .bind(segment.stream_id)
        .bind(&segment.speaker_id)
        .bind(segment.start_time)
        .bind(segment.end_time)
        .bind(segment.start_offset_ms)
        .bind(segment.end_offset_ms)
        .bind(&segment.text_redacted)
        .bind(&segment.text_original)
        .bind(&word_timestamps)
        .bind(&segment.language)
        .bind(&segment.asr_backend)
        .bind(segment.asr_confidence)
        .bind(&segment.sentiment_label)
        .bind(segment.sentiment_score)
        .bind(&pii_entities)
        .bind(&segment.segment_hash)
        .bind(segment.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            tx.rollback().await.ok();
            warn!(segment_id = %segment.segment_id, error = %err, "segment write failed");
            return Err(err.into());
        }

        let bump = sqlx::query(
            "UPDATE sessions SET total_segments = total_segments + 1 WHERE session_id = $1",
        )
        .bind(segment.session_id)
        .execute(&mut *tx)
        .await;
        if let Err(err) = bump {
            tx.rollback().await.ok();
            return Err(err.into());
        }

        tx.commit().await?;

        metrics::SEGMENTS_WRITTEN
            .with_label_values(&[&segment.stream_id.to_string()])
            .inc();
        info!(
            segment_id = %segment.segment_id,
            stream_id = %segment.stream_id,
            "segment written"
        );

        // Index after the commit; the queue's at-least-once semantics make
        // a missed index entry recoverable on reprocessing.
        if let Some(indexer) = &self.indexer {
            if let Err(err) = indexer.index_segment(segment).await {
                warn!(segment_id = %segment.segment_id, error = %err, "search index failed");
            }
        }

        Ok(())
    }
}

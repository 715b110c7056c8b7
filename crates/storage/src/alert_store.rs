//! Alert persistence with delivery snapshots.

use sqlx::PgPool;
use tracing::{info, warn};

use voxsentinel_common::models::Alert;

pub struct AlertStore {
    pool: PgPool,
}

impl AlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persists one alert with its `delivered_to` / `delivery_status`
    /// snapshots in a single transaction.
    pub async fn write_alert(&self, alert: &Alert) -> anyhow::Result<()> {
        let delivered_to = serde_json::to_value(&alert.delivered_to)?;
        let delivery_status = serde_json::to_value(&alert.delivery_status)?;
        let sentiment_scores = alert
            .sentiment_scores
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let alert_type = serde_json::to_string(&alert.alert_type)?
            .trim_matches('"')
            .to_string();

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            "INSERT INTO alerts \
             (alert_id, session_id, stream_id, segment_id, alert_type, severity, matched_rule, \
              match_type, similarity_score, matched_text, surrounding_context, speaker_id, \
              sentiment_scores, asr_backend_used, delivered_to, delivery_status, deduplicated, \
              created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18)",
        )
        .bind(alert.alert_id)
        .bind(alert.session_id)
        .bind(alert.stream_id)
        .bind(alert.segment_id)
        .bind(&alert_type)
        .bind(alert.severity.as_str())
        .bind(&alert.matched_rule)
        .bind(alert.match_type.as_str())
        .bind(alert.similarity_score)
        .bind(&alert.matched_text)
        .bind(&alert.surrounding_context)
        .bind(&alert.speaker_id)
        .bind(&sentiment_scores)
        .bind(&alert.asr_backend_used)
        .bind(&delivered_to)
        .bind(&delivery_status)
        .bind(alert.deduplicated)
        .bind(alert.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            tx.rollback().await.ok();
            warn!(alert_id = %alert.alert_id, error = %err, "alert write failed");
            return Err(err.into());
        }

        let bump = sqlx::query(
            "UPDATE sessions SET total_alerts = total_alerts + 1 WHERE session_id = $1",
        )
        .bind(alert.session_id)
        .execute(&mut *tx)
        .await;
        if let Err(err) = bump {
            tx.rollback().await.ok();
            return Err(err.into());
        }

        tx.commit().await?;
        info!(
            alert_id = %alert.alert_id,
            severity = alert.severity.as_str(),
            "alert written"
        );
        Ok(())
    }
}

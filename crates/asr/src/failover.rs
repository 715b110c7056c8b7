//! Primary/fallback engine selection behind a circuit breaker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use voxsentinel_common::models::TranscriptToken;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::engine::AsrEngine;

#[derive(Debug, Error)]
pub enum AsrError {
    /// The breaker is open and no fallback engine is configured.
    #[error("ASR engine '{engine}' circuit open and no fallback configured")]
    CircuitOpen { engine: String },
    /// The active engine failed.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Routes audio to the primary engine; when the primary's circuit opens,
/// traffic transparently redirects to the fallback with a single
/// `asr_failover_activated` warning per transition.
pub struct FailoverManager {
    primary: Arc<dyn AsrEngine>,
    fallback: Option<Arc<dyn AsrEngine>>,
    breaker: Mutex<CircuitBreaker>,
    using_fallback: AtomicBool,
}

impl FailoverManager {
    pub fn new(
        primary: Arc<dyn AsrEngine>,
        fallback: Option<Arc<dyn AsrEngine>>,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker: Mutex::new(CircuitBreaker::new(failure_threshold, recovery_timeout)),
            using_fallback: AtomicBool::new(false),
        }
    }

    pub fn with_defaults(
        primary: Arc<dyn AsrEngine>,
        fallback: Option<Arc<dyn AsrEngine>>,
    ) -> Self {
        Self::new(
            primary,
            fallback,
            CircuitBreaker::DEFAULT_FAILURE_THRESHOLD,
            CircuitBreaker::DEFAULT_RECOVERY_TIMEOUT,
        )
    }

    /// Current breaker state (may transition open → half-open on read).
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.lock().state()
    }

    /// Name of the engine that would handle the next chunk.
    pub fn active_engine_name(&self) -> String {
        let available = self.breaker.lock().is_available();
        if !available {
            if let Some(fallback) = &self.fallback {
                return fallback.name().to_string();
            }
        }
        self.primary.name().to_string()
    }

    /// Routes one chunk through the circuit breaker.
    pub async fn stream_audio(&self, chunk: &[u8]) -> Result<Vec<TranscriptToken>, AsrError> {
        let available = self.breaker.lock().is_available();

        if available {
            match self.primary.stream_audio(chunk).await {
                Ok(tokens) => {
                    self.breaker.lock().record_success();
                    self.using_fallback.store(false, Ordering::SeqCst);
                    return Ok(tokens);
                }
                Err(err) => {
                    let failure_count = {
                        let mut breaker = self.breaker.lock();
                        breaker.record_failure();
                        breaker.failure_count()
                    };
                    warn!(
                        engine = self.primary.name(),
                        failure_count,
                        error = %err,
                        "asr_primary_failure"
                    );
                }
            }
        }

        // Primary unavailable, fall back.
        match &self.fallback {
            Some(fallback) => {
                if !self.using_fallback.swap(true, Ordering::SeqCst) {
                    warn!(
                        primary = self.primary.name(),
                        fallback = fallback.name(),
                        breaker_state = self.breaker.lock().state().as_str(),
                        "asr_failover_activated"
                    );
                }
                fallback.stream_audio(chunk).await.map_err(AsrError::Engine)
            }
            None => Err(AsrError::CircuitOpen {
                engine: self.primary.name().to_string(),
            }),
        }
    }
}

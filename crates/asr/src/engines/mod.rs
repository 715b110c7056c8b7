//! Built-in ASR engine implementations.

pub mod deepgram;
pub mod whisper;

pub use deepgram::DeepgramEngine;
pub use whisper::{WhisperEngine, WhisperModel, WhisperSegment, WhisperWord};

use std::sync::Arc;

use crate::engine::{AsrEngine, EngineConfig};

/// Builds the Whisper-style batch engine from registry config.
///
/// With the `local-whisper` feature the engine runs whisper-rs against the
/// configured model path; without it construction fails so misconfiguration
/// surfaces at startup rather than mid-stream.
pub fn whisper_engine_from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn AsrEngine>> {
    #[cfg(feature = "local-whisper")]
    {
        let path = config
            .model_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("whisper_v3_turbo requires a model path"))?;
        let model = Arc::new(whisper::LocalWhisperModel::load(&path)?);
        Ok(Arc::new(WhisperEngine::new(
            model,
            config.accumulation_seconds,
        )))
    }
    #[cfg(not(feature = "local-whisper"))]
    {
        let _ = config;
        anyhow::bail!("whisper_v3_turbo requires the 'local-whisper' feature")
    }
}

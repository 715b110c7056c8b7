//! The ASR engine contract and the string-keyed engine registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use voxsentinel_common::models::TranscriptToken;

/// Settings handed to engine constructors. Carries everything any built-in
/// engine needs; each constructor picks what it uses.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub model_path: Option<String>,
    pub language: String,
    pub accumulation_seconds: f32,
}

/// Contract every ASR backend implements.
///
/// `stream_audio` accepts one PCM chunk and returns whatever tokens the
/// engine has ready: streaming backends drain their callback buffer, batch
/// backends return nothing until their accumulation window fills.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    /// Unique engine identifier (e.g. `"deepgram_nova2"`).
    fn name(&self) -> &str;

    /// Opens the connection or loads the model. May be long-running.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Tears down the connection, flushing any buffered audio.
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Feeds one 16 kHz mono s16le PCM chunk; returns ready tokens.
    async fn stream_audio(&self, chunk: &[u8]) -> anyhow::Result<Vec<TranscriptToken>>;

    /// Whether the engine is ready to process audio.
    async fn health_check(&self) -> bool;
}

type EngineBuilder =
    Box<dyn Fn(&EngineConfig) -> anyhow::Result<Arc<dyn AsrEngine>> + Send + Sync>;

/// Registry of engine constructors keyed by identifier.
///
/// Populated once at startup, read-only afterwards.
#[derive(Default)]
pub struct EngineRegistry {
    builders: HashMap<String, EngineBuilder>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in engines.
    pub fn with_builtin_engines() -> Self {
        let mut registry = Self::new();
        registry.register("deepgram_nova2", |config| {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| anyhow::anyhow!("deepgram_nova2 requires an API key"))?;
            Ok(Arc::new(crate::engines::DeepgramEngine::new(
                api_key,
                &config.language,
            )) as Arc<dyn AsrEngine>)
        });
        registry.register("whisper_v3_turbo", |config| {
            crate::engines::whisper_engine_from_config(config)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&EngineConfig) -> anyhow::Result<Arc<dyn AsrEngine>> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Box::new(builder));
    }

    /// Instantiates the engine registered under `name`.
    pub fn build(&self, name: &str, config: &EngineConfig) -> anyhow::Result<Arc<dyn AsrEngine>> {
        match self.builders.get(name) {
            Some(builder) => builder(config),
            None => anyhow::bail!(
                "unknown ASR engine '{}'; available: {:?}",
                name,
                self.names()
            ),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEngine;

    #[async_trait]
    impl AsrEngine for NullEngine {
        fn name(&self) -> &str {
            "null"
        }
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stream_audio(&self, _chunk: &[u8]) -> anyhow::Result<Vec<TranscriptToken>> {
            Ok(vec![])
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    #[test]
    fn register_and_build() {
        let mut registry = EngineRegistry::new();
        registry.register("null", |_| Ok(Arc::new(NullEngine) as Arc<dyn AsrEngine>));
        let engine = registry.build("null", &EngineConfig::default()).unwrap();
        assert_eq!(engine.name(), "null");
    }

    #[test]
    fn unknown_engine_errors_with_available_names() {
        let registry = EngineRegistry::with_builtin_engines();
        let err = match registry.build("nonexistent", &EngineConfig::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected build to fail for an unregistered engine"),
        };
        let msg = err.to_string();
        assert!(msg.contains("unknown ASR engine"));
        assert!(msg.contains("deepgram_nova2"));
    }

    #[test]
    fn builtin_registry_lists_engines() {
        let registry = EngineRegistry::with_builtin_engines();
        assert!(registry.contains("deepgram_nova2"));
        assert!(registry.contains("whisper_v3_turbo"));
    }

    #[test]
    fn deepgram_requires_api_key() {
        let registry = EngineRegistry::with_builtin_engines();
        let config = EngineConfig {
            api_key: None,
            language: "en".into(),
            ..Default::default()
        };
        assert!(registry.build("deepgram_nova2", &config).is_err());
    }
}

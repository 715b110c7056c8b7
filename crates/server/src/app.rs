//! Wires configuration, transports, engines, and per-stream pipeline
//! tasks into the running service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use voxsentinel_alerts::{
    AlertChannel, AlertDispatcher, AlertSink, ConfiguredChannel, RedisSuppression, RetryWorker,
    SlackChannel, WebSocketChannel, WebhookChannel,
};
use voxsentinel_asr::{AsrRouter, EngineConfig, EngineRegistry, FailoverManager};
use voxsentinel_common::models::{Alert, ChannelType, Stream};
use voxsentinel_common::{db, RedisBus, Settings};
use voxsentinel_diarization::{
    ClusteringDiarizer, DiarizationAccumulator, DiarizerModel, SpeakerMergeWorker,
};
use voxsentinel_ingestion::source::DefaultSourceFactory;
use voxsentinel_ingestion::supervisor::RedisChunkSink;
use voxsentinel_ingestion::{Reconnector, StreamSupervisor, SupervisorEvent};
use voxsentinel_nlp::{
    KeywordEngine, LexiconSentiment, NlpPipeline, PatternPiiDetector, PiiRedactor,
    RuleHotReloader, SentimentEngine, TokenProcessor,
};
use voxsentinel_storage::{
    AlertStore, AuditAnchorJob, SearchIndexer, StorageConsumer, TranscriptWriter,
};
use voxsentinel_vad::{EnergyVad, VadGate, VadModel};

use crate::api_client::ManagementApi;
use crate::health::{HealthRegistry, HealthState};

/// Adapts the alert store to the dispatcher's sink contract.
struct StoreSink(Arc<AlertStore>);

#[async_trait]
impl AlertSink for StoreSink {
    async fn write(&self, alert: &Alert) -> anyhow::Result<()> {
        self.0.write_alert(alert).await
    }
}

fn build_vad_model(settings: &Settings, health: &HealthRegistry) -> Arc<dyn VadModel> {
    #[cfg(feature = "silero")]
    if let Some(path) = &settings.vad_model_path {
        match voxsentinel_vad::SileroVad::load(path) {
            Ok(model) => {
                health.set("vad_model", HealthState::Ok);
                return Arc::new(model);
            }
            Err(err) => {
                // VAD gates everything downstream; losing the configured
                // model leaves the deployment degraded, not silently fine.
                error!(error = %err, "silero model load failed");
                health.set("vad_model", HealthState::Degraded);
                return Arc::new(EnergyVad::new());
            }
        }
    }
    #[cfg(not(feature = "silero"))]
    if settings.vad_model_path.is_some() {
        warn!("vad_model_path set but the 'silero' feature is not enabled");
    }
    health.set("vad_model", HealthState::Ok);
    Arc::new(EnergyVad::new())
}

fn build_channels(
    api_channels: Vec<voxsentinel_common::models::AlertChannelConfig>,
) -> (Vec<ConfiguredChannel>, HashMap<String, Arc<dyn AlertChannel>>) {
    let mut configured = Vec::new();
    let mut by_name: HashMap<String, Arc<dyn AlertChannel>> = HashMap::new();

    for config in api_channels {
        let short_id = config.channel_id.simple().to_string();
        let name = format!(
            "{}:{}",
            match config.channel_type {
                ChannelType::Websocket => "websocket",
                ChannelType::Webhook => "webhook",
                ChannelType::Slack => "slack",
                ChannelType::Teams => "teams",
                ChannelType::Email => "email",
                ChannelType::Sms => "sms",
                ChannelType::Signal => "signal",
            },
            &short_id[..8]
        );

        let transport: Option<Arc<dyn AlertChannel>> = match config.channel_type {
            ChannelType::Webhook => {
                let url = config.config.get("url").and_then(|v| v.as_str());
                let headers: Vec<(String, String)> = config
                    .config
                    .get("headers")
                    .and_then(|v| v.as_object())
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|value| (k.clone(), value.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                url.map(|url| {
                    Arc::new(WebhookChannel::new(&name, url, headers)) as Arc<dyn AlertChannel>
                })
            }
            ChannelType::Slack => config
                .config
                .get("webhook_url")
                .and_then(|v| v.as_str())
                .map(|url| Arc::new(SlackChannel::new(&name, url)) as Arc<dyn AlertChannel>),
            ChannelType::Websocket => {
                Some(Arc::new(WebSocketChannel::new(&name)) as Arc<dyn AlertChannel>)
            }
            // Delivered through external provider SDKs; out of scope here.
            ChannelType::Teams | ChannelType::Email | ChannelType::Sms | ChannelType::Signal => {
                warn!(channel = %name, "channel type has no built-in transport, skipping");
                None
            }
        };

        match transport {
            Some(transport) => {
                by_name.insert(name.clone(), Arc::clone(&transport));
                configured.push(ConfiguredChannel { config, transport });
            }
            None => {
                warn!(channel_id = %config.channel_id, "channel misconfigured, skipping");
            }
        }
    }

    (configured, by_name)
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let health = Arc::new(HealthRegistry::new());

    // Shared infrastructure; failures here are fatal.
    let bus = RedisBus::connect(&settings.redis_url).await?;
    health.set("redis", HealthState::Ok);

    let pool = db::connect(&settings.db_uri).await?;
    db::ensure_schema(&pool).await?;
    health.set("postgres", HealthState::Ok);

    let indexer = Arc::new(SearchIndexer::new(&settings.search_url));
    if let Err(err) = indexer.ensure_index().await {
        warn!(error = %err, "search index unavailable, indexing degraded");
        health.set("search", HealthState::Degraded);
    } else {
        health.set("search", HealthState::Ok);
    }

    let api = Arc::new(ManagementApi::new(&settings.api_base_url));

    // ASR engines.
    let registry = EngineRegistry::with_builtin_engines();
    let engine_config = EngineConfig {
        api_key: settings.deepgram_api_key.clone(),
        model_path: settings.whisper_model_path.clone(),
        language: "en".to_string(),
        accumulation_seconds: settings.accumulation_seconds,
    };

    let primary = registry.build(&settings.asr_backend, &engine_config)?;
    primary.connect().await?;
    health.set("asr_primary", HealthState::Ok);

    let fallback = match &settings.asr_fallback_backend {
        Some(name) => match registry.build(name, &engine_config) {
            Ok(engine) => match engine.connect().await {
                Ok(()) => {
                    health.set("asr_fallback", HealthState::Ok);
                    Some(engine)
                }
                Err(err) => {
                    warn!(engine = %name, error = %err, "fallback engine connect failed");
                    health.set("asr_fallback", HealthState::Down);
                    None
                }
            },
            Err(err) => {
                warn!(engine = %name, error = %err, "fallback engine unavailable");
                None
            }
        },
        None => None,
    };
    let failover = Arc::new(FailoverManager::with_defaults(primary, fallback));

    // Models.
    let vad_model = build_vad_model(&settings, &health);
    let diarizer: Arc<dyn DiarizerModel> = Arc::new(ClusteringDiarizer::new());

    // NLP engines.
    let keywords = Arc::new(KeywordEngine::new(settings.nlp_window_s));
    let sentiment = Arc::new(SentimentEngine::new(
        Some(Arc::new(LexiconSentiment::new())),
        settings.sentiment_consecutive,
        settings.sentiment_score_threshold,
        settings.sentiment_window_s,
    ));
    let pii = Arc::new(PiiRedactor::new(Some(Arc::new(PatternPiiDetector))));
    let processor = Arc::new(TokenProcessor::new(
        Arc::clone(&keywords),
        sentiment,
        pii,
    ));

    // Storage.
    let writer = Arc::new(TranscriptWriter::new(pool.clone(), Some(indexer)));
    let alert_store = Arc::new(AlertStore::new(pool.clone()));

    // Alert channels + dispatcher + retries.
    let api_channels = match api.alert_channels().await {
        Ok(channels) => channels,
        Err(err) => {
            warn!(error = %err, "channel config fetch failed, no channels active");
            Vec::new()
        }
    };
    let (configured_channels, channels_by_name) = build_channels(api_channels);
    info!(channels = configured_channels.len(), "alert channels ready");

    let (retry_tx, retry_rx) = mpsc::unbounded_channel();
    let suppression = Arc::new(RedisSuppression::new(
        bus.clone(),
        settings.dedup_ttl_s,
        settings.throttle_per_minute,
    ));
    let dispatcher = Arc::new(AlertDispatcher::new(
        suppression,
        configured_channels,
        Some(retry_tx),
        Some(Arc::new(StoreSink(Arc::clone(&alert_store)))),
    ));
    let retry_worker = Arc::new(RetryWorker::new(
        channels_by_name,
        settings.max_retries,
        RetryWorker::DEFAULT_BASE_DELAY,
    ));

    // Global stop signal for every long-running task.
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Shared services.
    {
        let dispatcher = Arc::clone(&dispatcher);
        let bus = bus.clone();
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.run(bus, stop).await;
        }));
    }
    {
        let worker = Arc::clone(&retry_worker);
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            worker.run(retry_rx, stop).await;
        }));
    }
    {
        let audit = AuditAnchorJob::new(
            pool.clone(),
            Duration::from_secs(settings.anchor_interval_s),
        );
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            audit.run(stop).await;
        }));
    }
    {
        let reloader = RuleHotReloader::new(
            &settings.api_base_url,
            Arc::clone(&keywords),
            Duration::from_secs(settings.rule_poll_interval_s),
        );
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            reloader.run(stop).await;
        }));
    }

    // Ingestion supervisor.
    let (supervisor, mut supervisor_events) = StreamSupervisor::new(
        Arc::new(DefaultSourceFactory),
        Arc::new(RedisChunkSink::new(bus.clone())),
        Reconnector::default(),
    );
    {
        // Reconnection exhaustion marks the stream errored upstream.
        let api = Arc::clone(&api);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = supervisor_events.recv().await {
                match event {
                    SupervisorEvent::Failed { stream_id, error } => {
                        error!(stream_id = %stream_id, error = %error, "stream pipeline failed");
                        if let Err(err) = api.mark_stream_error(stream_id).await {
                            warn!(stream_id = %stream_id, error = %err, "status update failed");
                        }
                    }
                    SupervisorEvent::Started { stream_id, session_id } => {
                        info!(stream_id = %stream_id, session_id = %session_id, "stream started");
                    }
                    SupervisorEvent::Stopped { stream_id } => {
                        info!(stream_id = %stream_id, "stream stopped");
                    }
                }
            }
        }));
    }

    // Per-stream pipelines for every active stream.
    let streams = api.active_streams().await.unwrap_or_else(|err| {
        warn!(error = %err, "active stream fetch failed, starting idle");
        Vec::new()
    });
    info!(count = streams.len(), "active streams loaded");

    for mut stream in streams {
        let session_id = stream.session_id.unwrap_or_else(uuid::Uuid::new_v4);
        stream.session_id = Some(session_id);
        spawn_stream_pipelines(
            &stream,
            session_id,
            &bus,
            &supervisor,
            Arc::clone(&vad_model),
            Arc::clone(&failover),
            Arc::clone(&diarizer),
            Arc::clone(&processor),
            Arc::clone(&writer),
            &settings,
            &stop_rx,
            &mut tasks,
        );
    }

    info!(status = health.overall().as_str(), "voxsentinel running");

    // Graceful shutdown on ctrl-c.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    supervisor.stop_all().await;
    let _ = stop_tx.send(true);
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("task did not stop within the grace period");
        }
    }

    info!("shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_stream_pipelines(
    stream: &Stream,
    session_id: uuid::Uuid,
    bus: &RedisBus,
    supervisor: &Arc<StreamSupervisor>,
    vad_model: Arc<dyn VadModel>,
    failover: Arc<FailoverManager>,
    diarizer: Arc<dyn DiarizerModel>,
    processor: Arc<TokenProcessor>,
    writer: Arc<TranscriptWriter>,
    settings: &Settings,
    stop_rx: &watch::Receiver<bool>,
    tasks: &mut Vec<JoinHandle<()>>,
) {
    let stream_id = stream.stream_id;

    supervisor.start(stream.clone());

    {
        let gate = VadGate::new(bus.clone(), vad_model, stream.vad_threshold);
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            gate.run(stream_id, stop).await;
        }));
    }
    {
        let router = AsrRouter::new(bus.clone(), failover);
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            router.run(stream_id, stop).await;
        }));
    }
    {
        let accumulator =
            DiarizationAccumulator::new(bus.clone(), diarizer, settings.diarization_window_s);
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            accumulator.run(stream_id, stop).await;
        }));
    }
    {
        let merger = SpeakerMergeWorker::new(bus.clone(), stream_id, session_id);
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            merger.run(stop).await;
        }));
    }
    {
        let pipeline = NlpPipeline::new(bus.clone(), processor);
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            pipeline.run(stream_id, stop).await;
        }));
    }
    {
        let consumer = StorageConsumer::new(
            bus.clone(),
            writer,
            &stream.asr_backend,
            settings.retain_original_text,
        );
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            consumer.run(stream_id, stop).await;
        }));
    }
}

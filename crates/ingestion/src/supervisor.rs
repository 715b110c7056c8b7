//! Per-stream pipeline supervision: extract → chunk → publish loops with
//! reconnection, stop events, and lifecycle bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxsentinel_common::models::{AudioChunk, Stream};
use voxsentinel_common::{keys, metrics, RedisBus, QUEUE_MAXLEN};

use crate::reconnect::Reconnector;
use crate::source::SourceFactory;
use crate::ChunkProducer;

/// Destination for produced chunks. Seam between the ingestion loop and
/// the queue transport.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn publish(&self, chunk: &AudioChunk) -> anyhow::Result<()>;
}

/// Publishes chunks to `audio_chunks:{stream_id}` with MAXLEN trimming.
pub struct RedisChunkSink {
    bus: RedisBus,
}

impl RedisChunkSink {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ChunkSink for RedisChunkSink {
    async fn publish(&self, chunk: &AudioChunk) -> anyhow::Result<()> {
        self.bus
            .xadd(
                &keys::audio_chunks(chunk.stream_id),
                &chunk.to_fields(),
                QUEUE_MAXLEN,
            )
            .await?;
        Ok(())
    }
}

/// Lifecycle notifications emitted by the supervisor.
#[derive(Debug)]
pub enum SupervisorEvent {
    Started { stream_id: Uuid, session_id: Uuid },
    Stopped { stream_id: Uuid },
    Failed { stream_id: Uuid, error: String },
}

struct PipelineHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the mapping `stream_id -> running pipeline task`.
pub struct StreamSupervisor {
    factory: Arc<dyn SourceFactory>,
    sink: Arc<dyn ChunkSink>,
    reconnector: Reconnector,
    tasks: DashMap<Uuid, PipelineHandle>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl StreamSupervisor {
    /// Returns the supervisor plus the receiver for lifecycle events.
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        sink: Arc<dyn ChunkSink>,
        reconnector: Reconnector,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                factory,
                sink,
                reconnector,
                tasks: DashMap::new(),
                events,
            }),
            events_rx,
        )
    }

    /// Starts the ingestion pipeline for `stream`. No-op when a pipeline
    /// for this stream is already running.
    pub fn start(&self, stream: Stream) {
        let stream_id = stream.stream_id;
        if self.tasks.contains_key(&stream_id) {
            debug!(stream_id = %stream_id, "pipeline already running");
            return;
        }

        let session_id = stream.session_id.unwrap_or_else(Uuid::new_v4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let factory = Arc::clone(&self.factory);
        let sink = Arc::clone(&self.sink);
        let reconnector = self.reconnector;
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            run_pipeline(stream, session_id, factory, sink, reconnector, events, stop_rx).await;
        });

        self.tasks.insert(
            stream_id,
            PipelineHandle {
                stop: stop_tx,
                handle,
            },
        );
        let _ = self.events.send(SupervisorEvent::Started {
            stream_id,
            session_id,
        });
        info!(stream_id = %stream_id, session_id = %session_id, "ingestion pipeline started");
    }

    /// Signals the pipeline's stop event and awaits completion.
    pub async fn stop(&self, stream_id: Uuid) {
        if let Some((_, entry)) = self.tasks.remove(&stream_id) {
            let _ = entry.stop.send(true);
            if let Err(err) = entry.handle.await {
                if !err.is_cancelled() {
                    warn!(stream_id = %stream_id, error = %err, "pipeline task join failed");
                }
            }
            info!(stream_id = %stream_id, "ingestion pipeline stopped");
        }
    }

    /// Stops every running pipeline.
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.tasks.iter().map(|e| *e.key()).collect();
        for stream_id in ids {
            self.stop(stream_id).await;
        }
    }

    /// Snapshot of the currently running stream IDs.
    pub fn active(&self) -> Vec<Uuid> {
        self.tasks.iter().map(|e| *e.key()).collect()
    }
}

async fn run_pipeline(
    stream: Stream,
    session_id: Uuid,
    factory: Arc<dyn SourceFactory>,
    sink: Arc<dyn ChunkSink>,
    reconnector: Reconnector,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let stream_id = stream.stream_id;
    let stream_label = stream_id.to_string();

    'outer: loop {
        if *stop_rx.borrow() {
            break;
        }

        let mut source = match reconnector
            .run(stream_id, || factory.open(&stream))
            .await
        {
            Ok(source) => source,
            Err(err) => {
                error!(stream_id = %stream_id, error = %err, "source unreachable, giving up");
                let _ = events.send(SupervisorEvent::Failed {
                    stream_id,
                    error: err.to_string(),
                });
                return;
            }
        };

        let mut producer = ChunkProducer::new(stream_id, session_id, stream.chunk_size_ms);

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        source.close().await;
                        break 'outer;
                    }
                }
                block = source.next_block() => match block {
                    Ok(Some(bytes)) => {
                        for chunk in producer.push(&bytes) {
                            if let Err(err) = sink.publish(&chunk).await {
                                warn!(
                                    stream_id = %stream_id,
                                    chunk_id = %chunk.chunk_id,
                                    error = %err,
                                    "chunk publish failed"
                                );
                                continue;
                            }
                            metrics::CHUNKS_PUBLISHED
                                .with_label_values(&[&stream_label])
                                .inc();
                        }
                    }
                    Ok(None) => {
                        // Finite source exhausted; trailing sub-chunk bytes
                        // are dropped with the producer.
                        info!(
                            stream_id = %stream_id,
                            leftover = producer.pending_bytes(),
                            "source reached end of stream"
                        );
                        break 'outer;
                    }
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "source read failed, reconnecting");
                        source.close().await;
                        continue 'outer;
                    }
                }
            }
        }
    }

    let _ = events.send(SupervisorEvent::Stopped { stream_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AudioSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;
    use voxsentinel_common::models::{SourceType, StreamStatus};

    const CHUNK_SIZE: usize = 8960;

    fn test_stream() -> Stream {
        Stream {
            stream_id: Uuid::new_v4(),
            name: "test".into(),
            source_type: SourceType::File,
            source_url: "file:///test.wav".into(),
            asr_backend: "deepgram_nova2".into(),
            asr_fallback_backend: None,
            language_override: None,
            vad_threshold: 0.5,
            chunk_size_ms: 280,
            status: StreamStatus::Active,
            session_id: Some(Uuid::new_v4()),
        }
    }

    /// Source that serves scripted blocks, then ends or hangs.
    struct ScriptedSource {
        blocks: Vec<Vec<u8>>,
        hang_at_end: bool,
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        async fn next_block(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            if let Some(block) = if self.blocks.is_empty() {
                None
            } else {
                Some(self.blocks.remove(0))
            } {
                return Ok(Some(block));
            }
            if self.hang_at_end {
                // Simulate a live source with no data: wait forever.
                std::future::pending::<()>().await;
            }
            Ok(None)
        }
    }

    struct ScriptedFactory {
        blocks: Vec<Vec<u8>>,
        hang_at_end: bool,
        fail: bool,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl SourceFactory for ScriptedFactory {
        async fn open(&self, _stream: &Stream) -> anyhow::Result<Box<dyn AudioSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(Box::new(ScriptedSource {
                blocks: self.blocks.clone(),
                hang_at_end: self.hang_at_end,
            }))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<AudioChunk>>,
    }

    #[async_trait]
    impl ChunkSink for CollectingSink {
        async fn publish(&self, chunk: &AudioChunk) -> anyhow::Result<()> {
            self.chunks.lock().await.push(chunk.clone());
            Ok(())
        }
    }

    fn fast_reconnector() -> Reconnector {
        Reconnector {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn publishes_complete_chunks() {
        let factory = Arc::new(ScriptedFactory {
            blocks: vec![vec![7u8; CHUNK_SIZE * 2 + 100]],
            hang_at_end: false,
            fail: false,
            opens: AtomicUsize::new(0),
        });
        let sink = Arc::new(CollectingSink::default());
        let (supervisor, mut events) =
            StreamSupervisor::new(factory, sink.clone(), fast_reconnector());

        let stream = test_stream();
        let stream_id = stream.stream_id;
        supervisor.start(stream);

        // Wait for the pipeline to run to completion (finite source).
        let mut stopped = false;
        for _ in 0..50 {
            if let Ok(event) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await
            {
                if matches!(event, Some(SupervisorEvent::Stopped { .. })) {
                    stopped = true;
                    break;
                }
            }
        }
        assert!(stopped);

        let chunks = sink.chunks.lock().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.pcm.len() == CHUNK_SIZE));
        assert!(chunks.iter().all(|c| c.stream_id == stream_id));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let factory = Arc::new(ScriptedFactory {
            blocks: vec![],
            hang_at_end: true,
            fail: false,
            opens: AtomicUsize::new(0),
        });
        let sink = Arc::new(CollectingSink::default());
        let (supervisor, _events) =
            StreamSupervisor::new(factory, sink, fast_reconnector());

        let stream = test_stream();
        supervisor.start(stream.clone());
        supervisor.start(stream.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(supervisor.active().len(), 1);
        supervisor.stop_all().await;
        assert!(supervisor.active().is_empty());
    }

    #[tokio::test]
    async fn stop_cancels_running_pipeline() {
        let factory = Arc::new(ScriptedFactory {
            blocks: vec![],
            hang_at_end: true,
            fail: false,
            opens: AtomicUsize::new(0),
        });
        let sink = Arc::new(CollectingSink::default());
        let (supervisor, _events) =
            StreamSupervisor::new(factory, sink, fast_reconnector());

        let stream = test_stream();
        let stream_id = stream.stream_id;
        supervisor.start(stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.active(), vec![stream_id]);

        supervisor.stop(stream_id).await;
        assert!(supervisor.active().is_empty());
    }

    #[tokio::test]
    async fn exhausted_reconnection_emits_failed() {
        let factory = Arc::new(ScriptedFactory {
            blocks: vec![],
            hang_at_end: false,
            fail: true,
            opens: AtomicUsize::new(0),
        });
        let opens = Arc::clone(&factory);
        let sink = Arc::new(CollectingSink::default());
        let (supervisor, mut events) =
            StreamSupervisor::new(factory, sink, fast_reconnector());

        supervisor.start(test_stream());

        let mut failed = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Some(SupervisorEvent::Failed { error, .. })) => {
                    assert!(error.contains("reconnection attempts failed"));
                    failed = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(failed);
        assert_eq!(opens.opens.load(Ordering::SeqCst), 2);
    }
}

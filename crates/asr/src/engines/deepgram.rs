//! Deepgram-style streaming engine.
//!
//! Opens a WebSocket to the Nova-2 live API, forwards PCM frames, and
//! collects transcript callbacks into an internal buffer drained on each
//! `stream_audio` call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use voxsentinel_common::models::{TranscriptToken, WordTimestamp};

use crate::engine::AsrEngine;

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Live transcript payload subset we consume.
#[derive(Debug, Deserialize)]
struct LiveResponse {
    #[serde(default)]
    channel: Option<LiveChannel>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct LiveChannel {
    alternatives: Vec<LiveAlternative>,
}

#[derive(Debug, Deserialize)]
struct LiveAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<LiveWord>,
}

#[derive(Debug, Deserialize)]
struct LiveWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    confidence: f32,
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

struct Connection {
    sink: WsSink,
    tokens: mpsc::UnboundedReceiver<TranscriptToken>,
    reader: JoinHandle<()>,
}

/// Streaming ASR engine speaking the Deepgram live protocol.
pub struct DeepgramEngine {
    api_key: String,
    language: String,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl DeepgramEngine {
    pub fn new(api_key: String, language: &str) -> Self {
        Self {
            api_key,
            language: language.to_string(),
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn listen_url(&self) -> String {
        format!(
            "{LISTEN_URL}?model=nova-2&language={}&encoding=linear16&sample_rate=16000\
             &channels=1&interim_results=true&smart_format=true&endpointing=300",
            self.language
        )
    }

    fn parse_response(
        payload: &str,
        language: &str,
        session_start: DateTime<Utc>,
    ) -> Option<TranscriptToken> {
        let response: LiveResponse = serde_json::from_str(payload).ok()?;
        let channel = response.channel?;
        let alternative = channel.alternatives.into_iter().next()?;
        if alternative.transcript.is_empty() {
            return None;
        }

        let words: Vec<WordTimestamp> = alternative
            .words
            .iter()
            .map(|w| WordTimestamp {
                word: w.word.clone(),
                start_ms: (w.start * 1000.0) as u64,
                end_ms: (w.end * 1000.0) as u64,
                confidence: w.confidence,
            })
            .collect();

        let start_ms = (response.start * 1000.0) as u64;
        let end_ms = ((response.start + response.duration) * 1000.0) as u64;

        Some(TranscriptToken {
            text: alternative.transcript,
            is_final: response.is_final,
            start_time: session_start + ChronoDuration::milliseconds(start_ms as i64),
            end_time: session_start + ChronoDuration::milliseconds(end_ms as i64),
            start_ms,
            end_ms,
            confidence: alternative.confidence,
            language: language.to_string(),
            word_timestamps: words,
        })
    }
}

#[async_trait]
impl AsrEngine for DeepgramEngine {
    fn name(&self) -> &str {
        "deepgram_nova2"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let mut request = self.listen_url().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key).parse()?,
        );

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (sink, mut ws_rx) = ws.split();

        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let connected = Arc::clone(&self.connected);
        let language = self.language.clone();
        let session_start = Utc::now();

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(payload)) => {
                        if let Some(token) =
                            Self::parse_response(payload.as_str(), &language, session_start)
                        {
                            if token_tx.send(token).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        warn!(?frame, "deepgram connection closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "deepgram socket error");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!("deepgram reader task finished");
        });

        *self.connection.lock().await = Some(Connection {
            sink,
            tokens: token_rx,
            reader,
        });
        self.connected.store(true, Ordering::SeqCst);
        info!(language = %self.language, "deepgram connected");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(mut connection) = self.connection.lock().await.take() {
            let _ = connection.sink.send(Message::Close(None)).await;
            connection.reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("deepgram disconnected");
        Ok(())
    }

    async fn stream_audio(&self, chunk: &[u8]) -> anyhow::Result<Vec<TranscriptToken>> {
        if !self.connected.load(Ordering::SeqCst) {
            anyhow::bail!("deepgram engine is not connected");
        }

        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("deepgram engine is not connected"))?;

        connection
            .sink
            .send(Message::Binary(chunk.to_vec().into()))
            .await
            .map_err(|e| anyhow::anyhow!("deepgram send failed: {}", e))?;

        // Give the reader a moment to deliver transcripts for this frame,
        // then drain everything available.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut tokens = Vec::new();
        while let Ok(token) = connection.tokens.try_recv() {
            tokens.push(token);
        }
        Ok(tokens)
    }

    async fn health_check(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT_JSON: &str = r#"{
        "channel": {
            "alternatives": [{
                "transcript": "he has a gun",
                "confidence": 0.97,
                "words": [
                    {"word": "he", "start": 1.0, "end": 1.2, "confidence": 0.99},
                    {"word": "has", "start": 1.2, "end": 1.4, "confidence": 0.98},
                    {"word": "a", "start": 1.4, "end": 1.5, "confidence": 0.95},
                    {"word": "gun", "start": 1.5, "end": 1.9, "confidence": 0.96}
                ]
            }]
        },
        "is_final": true,
        "start": 1.0,
        "duration": 0.9
    }"#;

    #[test]
    fn parses_final_transcript() {
        let session_start = Utc::now();
        let token =
            DeepgramEngine::parse_response(TRANSCRIPT_JSON, "en", session_start).unwrap();
        assert_eq!(token.text, "he has a gun");
        assert!(token.is_final);
        assert_eq!(token.start_ms, 1000);
        assert_eq!(token.end_ms, 1900);
        assert_eq!(token.word_timestamps.len(), 4);
        assert_eq!(token.word_timestamps[3].word, "gun");
        assert_eq!(token.word_timestamps[3].start_ms, 1500);
    }

    #[test]
    fn empty_transcript_yields_no_token() {
        let payload = r#"{"channel": {"alternatives": [{"transcript": ""}]}}"#;
        assert!(DeepgramEngine::parse_response(payload, "en", Utc::now()).is_none());
    }

    #[test]
    fn metadata_messages_are_ignored() {
        let payload = r#"{"type": "Metadata", "request_id": "abc"}"#;
        assert!(DeepgramEngine::parse_response(payload, "en", Utc::now()).is_none());
    }

    #[test]
    fn malformed_json_is_ignored() {
        assert!(DeepgramEngine::parse_response("not json", "en", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn disconnected_engine_rejects_audio() {
        let engine = DeepgramEngine::new("key".into(), "en");
        assert!(engine.stream_audio(&[0u8; 10]).await.is_err());
        assert!(!engine.health_check().await);
    }
}

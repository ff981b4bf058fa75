//! # Speech Synthesis Adapter
//!
//! Turns one text fragment into an incremental PCM byte stream for a voice.
//! Each chunk is handed to the caller the moment the remote encoder produces
//! it, so the first audio reaches the client long before the utterance is
//! fully synthesized.
//!
//! Cancellation is checked before the request and at every chunk boundary.
//! An aborted stream is a normal outcome ([`SynthesisOutcome::Aborted`]),
//! never an error.

use crate::config::SynthesisConfig;
use crate::error::{AppError, AppResult};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a synthesis call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisOutcome {
    /// Empty or whitespace-only text; nothing was requested
    Skipped,
    /// Stream ended normally
    Completed { chunks: usize, bytes: usize },
    /// Cancellation fired before or during the stream
    Aborted,
}

/// Adapter seam for the external text-to-speech service.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` with `voice_id`, calling `on_chunk` for each audio
    /// chunk as it arrives.
    ///
    /// Returns [`AppError::InvalidArgument`] when `voice_id` is absent.
    /// Remote and network failures are hard errors, distinct from abort.
    async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(Bytes) + Send),
    ) -> AppResult<SynthesisOutcome>;
}

/// Streaming HTTP text-to-speech client.
pub struct StreamingSynthesisClient {
    http: reqwest::Client,
    config: SynthesisConfig,
}

impl StreamingSynthesisClient {
    pub fn new(config: SynthesisConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    fn stream_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format={}",
            self.config.base_url.trim_end_matches('/'),
            voice_id,
            self.config.output_format
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for StreamingSynthesisClient {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(Bytes) + Send),
    ) -> AppResult<SynthesisOutcome> {
        if text.trim().is_empty() {
            return Ok(SynthesisOutcome::Skipped);
        }

        let voice_id = voice_id
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::InvalidArgument("voice identity is required".to_string()))?;

        if cancel.is_cancelled() {
            return Ok(SynthesisOutcome::Aborted);
        }

        let request = self
            .http
            .post(self.stream_url(voice_id))
            .header("xi-api-key", &self.config.api_key)
            .header("Accept", "audio/pcm")
            .json(&json!({
                "text": text,
                "model_id": self.config.model_id,
            }));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SynthesisOutcome::Aborted),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let mut stream = response.bytes_stream();
        let mut chunks = 0usize;
        let mut bytes = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(chunks, bytes, "Synthesis stream aborted");
                    return Ok(SynthesisOutcome::Aborted);
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        chunks += 1;
                        bytes += chunk.len();
                        on_chunk(chunk);
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                },
            }
        }

        Ok(SynthesisOutcome::Completed { chunks, bytes })
    }
}

//! # Conversation Model Adapter
//!
//! Maintains one duplex websocket session per connection against a realtime
//! conversational model: audio goes in, incremental text comes out.
//!
//! ## Design:
//! - `RealtimeModelClient` is a process-wide singleton with no per-connection
//!   state. Every call to [`ConversationModel::open_session`] returns a fresh
//!   [`ModelSession`]: a command handle plus that session's own event receiver,
//!   so events from different connections can never cross.
//! - The websocket is split into a writer task (drains the handle's command
//!   queue) and a reader task (parses server events and re-emits them).
//!   The event receiver yields `None` once the upstream socket is gone.
//! - The adapter performs no business logic; it only translates.
//!
//! ## Wire Protocol (client → server):
//! `session.update`, `input_audio_buffer.append`, `input_audio_buffer.commit`,
//! `response.create`, `response.cancel`
//!
//! ## Wire Protocol (server → client):
//! `session.created`/`session.updated` (readiness), `response.text.delta`,
//! `response.text.done`, `response.done` (status `cancelled` = interrupted),
//! `conversation.item.input_audio_transcription.completed`, `error`

use crate::config::ModelConfig;
use crate::error::{AppError, AppResult};

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Behavioral configuration applied when a session opens.
#[derive(Debug, Clone)]
pub struct ModelSessionConfig {
    /// Persona instructions for the counterpart
    pub instructions: String,
    /// Spoken language hint (ISO 639-1, e.g. "en")
    pub language: String,
    /// Response randomness: 0 = deterministic, higher = more varied
    pub temperature: f32,
}

/// Events re-emitted from the model, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Incremental piece of agent text
    TextFragment(String),
    /// Full text of the current response part
    TextComplete(String),
    ResponseComplete,
    /// Response terminated by a cancel request
    ResponseInterrupted,
    /// Transcript of the user's committed audio
    UserTranscript(String),
    Error(String),
}

/// Commands queued for the session's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelCommand {
    AppendAudio(Bytes),
    CommitInput,
    CreateResponse,
    UpdateInstructions(String),
    CancelResponse,
    Close,
}

/// Handle to one open model session.
///
/// Cloning shares the same underlying session; it is still owned by exactly
/// one connection. All operations are non-blocking enqueues and become
/// logged no-ops once the session is no longer open.
#[derive(Debug, Clone)]
pub struct ModelSessionHandle {
    commands: mpsc::UnboundedSender<ModelCommand>,
    open: Arc<AtomicBool>,
}

impl ModelSessionHandle {
    pub fn new(commands: mpsc::UnboundedSender<ModelCommand>, open: Arc<AtomicBool>) -> Self {
        Self { commands, open }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    /// Forward one frame of user audio.
    pub fn send_audio(&self, frame: &Bytes) {
        self.enqueue(ModelCommand::AppendAudio(frame.clone()));
    }

    /// End the user's utterance and ask the model to respond.
    pub fn commit_audio_input(&self) {
        if self.enqueue(ModelCommand::CommitInput) {
            self.enqueue(ModelCommand::CreateResponse);
        }
    }

    /// Trigger a response using the currently configured instructions.
    pub fn request_response(&self) {
        self.enqueue(ModelCommand::CreateResponse);
    }

    /// Replace the live session's instructions without reopening it.
    pub fn update_instructions(&self, text: &str) {
        self.enqueue(ModelCommand::UpdateInstructions(text.to_string()));
    }

    /// Ask the model to stop the in-progress response.
    pub fn cancel_response(&self) {
        self.enqueue(ModelCommand::CancelResponse);
    }

    /// Best-effort graceful close. Never fails from the caller's perspective.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            debug!("Model session already closed");
            return;
        }
        if self.commands.send(ModelCommand::Close).is_err() {
            debug!("Model session writer already gone during close");
        }
    }

    fn enqueue(&self, command: ModelCommand) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            debug!(?command, "Model session not open, dropping command");
            return false;
        }
        match self.commands.send(command) {
            Ok(()) => true,
            Err(err) => {
                debug!(command = ?err.0, "Model session writer gone, dropping command");
                false
            }
        }
    }
}

/// A freshly opened session: the command handle and its private event stream.
#[derive(Debug)]
pub struct ModelSession {
    pub handle: ModelSessionHandle,
    pub events: mpsc::UnboundedReceiver<ModelEvent>,
}

/// Adapter seam for the external conversational model.
#[async_trait]
pub trait ConversationModel: Send + Sync {
    /// Open a session and wait for the remote end to acknowledge readiness.
    ///
    /// Fails with [`AppError::ConnectionTimeout`] when readiness is not
    /// acknowledged within the configured open timeout.
    async fn open_session(&self, config: ModelSessionConfig) -> AppResult<ModelSession>;
}

/// Realtime websocket implementation of [`ConversationModel`].
pub struct RealtimeModelClient {
    config: ModelConfig,
    open_timeout: Duration,
}

impl RealtimeModelClient {
    pub fn new(config: ModelConfig, open_timeout: Duration) -> Self {
        Self {
            config,
            open_timeout,
        }
    }

    fn endpoint(&self) -> String {
        if self.config.model.is_empty() {
            self.config.url.clone()
        } else {
            format!("{}?model={}", self.config.url, self.config.model)
        }
    }

    async fn establish(&self, session_config: ModelSessionConfig) -> AppResult<ModelSession> {
        let mut request = self.endpoint().into_client_request()?;
        if !self.config.api_key.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| AppError::Config(format!("Invalid model API key: {}", e)))?;
            request.headers_mut().insert("Authorization", bearer);
            request
                .headers_mut()
                .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }

        info!("Connecting to conversation model at {}", self.config.url);
        let (ws_stream, _response) = connect_async(request).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let setup = session_update_payload(&session_config, &self.config.transcription_model);
        sink.send(Message::Text(setup.to_string())).await?;
        wait_until_ready(&mut stream).await?;
        debug!("Conversation model session ready");

        let open = Arc::new(AtomicBool::new(true));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // The reader owns the only event sender, so the event stream ends
        // exactly when the upstream socket does.
        tokio::spawn(run_writer(sink, command_rx, open.clone()));
        tokio::spawn(run_reader(stream, event_tx, open.clone()));

        Ok(ModelSession {
            handle: ModelSessionHandle::new(command_tx, open),
            events: event_rx,
        })
    }
}

#[async_trait]
impl ConversationModel for RealtimeModelClient {
    async fn open_session(&self, config: ModelSessionConfig) -> AppResult<ModelSession> {
        match tokio::time::timeout(self.open_timeout, self.establish(config)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ConnectionTimeout(format!(
                "conversation model not ready after {:?}",
                self.open_timeout
            ))),
        }
    }
}

/// Read server events until the session acknowledges our configuration.
async fn wait_until_ready(stream: &mut SplitStream<WsStream>) -> AppResult<()> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text)?;
                match value["type"].as_str() {
                    Some("session.updated") => return Ok(()),
                    Some("error") => {
                        return Err(AppError::Upstream {
                            status: 400,
                            message: error_message(&value),
                        })
                    }
                    other => debug!(event = ?other, "Ignoring event during model handshake"),
                }
            }
            Message::Close(frame) => {
                return Err(AppError::Transport(format!(
                    "model closed the connection during handshake: {:?}",
                    frame
                )))
            }
            _ => {}
        }
    }
    Err(AppError::Transport(
        "model stream ended during handshake".to_string(),
    ))
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<ModelCommand>,
    open: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        let Some(payload) = command_payload(&command) else {
            break;
        };
        if let Err(err) = sink.send(Message::Text(payload.to_string())).await {
            // The reader sees the same broken socket and ends the event stream
            warn!("Failed to send command to conversation model: {}", err);
            break;
        }
    }

    open.store(false, Ordering::SeqCst);
    if let Err(err) = sink.close().await {
        debug!("Model websocket close failed: {}", err);
    }
    debug!("Model writer task finished");
}

async fn run_reader(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<ModelEvent>,
    open: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(event) = parse_server_event(&text) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                if open.load(Ordering::SeqCst) {
                    info!("Conversation model closed the session: {:?}", frame);
                }
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if open.load(Ordering::SeqCst) {
                    let _ = events.send(ModelEvent::Error(format!("model transport error: {}", err)));
                }
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    debug!("Model reader task finished");
}

/// Persona instructions as applied to the live session, language hint included.
pub fn compose_instructions(instructions: &str, language: &str) -> String {
    format!(
        "{}\n\nAlways respond in the user's preferred language ({}).",
        instructions, language
    )
}

fn session_update_payload(config: &ModelSessionConfig, transcription_model: &str) -> Value {
    let instructions = compose_instructions(&config.instructions, &config.language);
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text"],
            "instructions": instructions,
            "temperature": config.temperature,
            "input_audio_format": "pcm16",
            "input_audio_transcription": {
                "model": transcription_model,
                "language": config.language
            },
            "turn_detection": null
        }
    })
}

/// JSON payload for a command, `None` for [`ModelCommand::Close`].
fn command_payload(command: &ModelCommand) -> Option<Value> {
    let payload = match command {
        ModelCommand::AppendAudio(frame) => json!({
            "type": "input_audio_buffer.append",
            "audio": general_purpose::STANDARD.encode(frame)
        }),
        ModelCommand::CommitInput => json!({ "type": "input_audio_buffer.commit" }),
        ModelCommand::CreateResponse => json!({ "type": "response.create" }),
        ModelCommand::UpdateInstructions(text) => json!({
            "type": "session.update",
            "session": { "instructions": text }
        }),
        ModelCommand::CancelResponse => json!({ "type": "response.cancel" }),
        ModelCommand::Close => return None,
    };
    Some(payload)
}

/// Translate one server message into a [`ModelEvent`], if it maps to one.
fn parse_server_event(text: &str) -> Option<ModelEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            return Some(ModelEvent::Error(format!("unparseable model event: {}", err)));
        }
    };

    let string_field = |key: &str| value[key].as_str().unwrap_or_default().to_string();

    match value["type"].as_str()? {
        "response.text.delta" | "response.audio_transcript.delta" => {
            Some(ModelEvent::TextFragment(string_field("delta")))
        }
        "response.text.done" => Some(ModelEvent::TextComplete(string_field("text"))),
        "response.audio_transcript.done" => {
            Some(ModelEvent::TextComplete(string_field("transcript")))
        }
        "response.done" => match value["response"]["status"].as_str() {
            Some("cancelled") => Some(ModelEvent::ResponseInterrupted),
            Some("failed") => Some(ModelEvent::Error(format!(
                "model response failed: {}",
                value["response"]["status_details"]
            ))),
            _ => Some(ModelEvent::ResponseComplete),
        },
        "conversation.item.input_audio_transcription.completed" => {
            Some(ModelEvent::UserTranscript(string_field("transcript")))
        }
        "error" => {
            // Cancel raced with natural completion
            if value["error"]["code"].as_str() == Some("response_cancel_not_active") {
                debug!("Model had no active response to cancel");
                return None;
            }
            Some(ModelEvent::Error(error_message(&value)))
        }
        _ => None,
    }
}

fn error_message(value: &Value) -> String {
    value["error"]["message"]
        .as_str()
        .unwrap_or("unknown model error")
        .to_string()
}

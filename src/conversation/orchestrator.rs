//! # Conversation Orchestrator
//!
//! Drives one live voice conversation per client connection: authenticates
//! the caller, opens the model session, routes microphone audio to the model,
//! streams synthesized agent speech back, and arbitrates barge-in.
//!
//! ## Lifecycle:
//! `Idle → Authenticating → SessionEstablishing → Active → Closing → Closed`
//!
//! Setup failures (authentication, unknown counterpart, missing voice, model
//! open timeout) end the connection with an `error` event and a close, and
//! leave nothing in the [`StateStore`].
//!
//! ## Scheduling Model:
//! Each connection is served by exactly one task running a `select!` loop over
//! client input, model events, synthesis reports, the greeting timer and a
//! periodic silence/idle tick. Frames and model events for a connection are
//! therefore handled strictly in arrival order, one at a time.
//!
//! Synthesis runs on a second per-connection worker so the loop keeps
//! reading frames (and can detect barge-in) while audio is being streamed.
//! The worker processes fragments in submission order and stops at the next
//! chunk boundary once the response's cancellation token fires.
//!
//! ## Barge-in:
//! Whenever a frame leaves both speaking flags raised, agent output is
//! cancelled inside that same frame's processing: both cancellation tokens
//! fire, the model is asked to cancel its response, the client is told, and
//! late text fragments of the cancelled response are dropped until the
//! response's terminal event arrives.

use crate::audio::classify;
use crate::config::ConversationConfig;
use crate::conversation::model::{compose_instructions, ConversationModel, ModelEvent, ModelSessionConfig};
use crate::conversation::protocol::{ClientEvent, ClientInbound, ClientOutbound, ServerEvent};
use crate::conversation::session::{connection_id_for, ConnectionSession, StateStore};
use crate::conversation::synthesis::{SpeechSynthesizer, SynthesisOutcome};
use crate::error::{AppError, AppResult};
use crate::services::{chat_id_for, ChatStore, ChatTurn, Counterpart, CounterpartDirectory, IdentityProvider, Speaker};

use bytes::Bytes;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Authenticating,
    SessionEstablishing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::SessionEstablishing => "session-establishing",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the client asked for when it connected.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Bearer credential, with or without the `Bearer ` prefix
    pub credential: Option<String>,
    pub counterpart_id: String,
}

/// Why an active connection is closing.
#[derive(Debug)]
enum CloseReason {
    ClientDisconnected,
    IdleTimeout,
    ModelSessionEnded,
}

/// One fragment queued for speech synthesis.
struct SynthesisJob {
    text: String,
    cancel: CancellationToken,
}

/// Hard synthesis failure reported back to the connection loop.
struct SynthesisFailure {
    error: AppError,
    cancel: CancellationToken,
}

/// Driver-local state for one connection. Shared state lives in the store.
struct Connection {
    id: String,
    user_id: String,
    chat_id: String,
    language: String,
    counterpart: Counterpart,
    phase: ConnectionPhase,
    outbound: mpsc::UnboundedSender<ClientOutbound>,
    synthesis_jobs: Option<mpsc::UnboundedSender<SynthesisJob>>,
    /// Set by barge-in; drops fragments of the cancelled response
    discard_until_response_end: bool,
    last_activity: Instant,
}

impl Connection {
    fn transition(&mut self, next: ConnectionPhase) {
        debug!(connection_id = %self.id, "Connection phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    fn send_event(&self, event: ServerEvent) {
        if self.outbound.send(ClientOutbound::Event(event)).is_err() {
            debug!(connection_id = %self.id, "Client channel closed, dropping event");
        }
    }
}

/// Per-connection conversation driver. One instance serves every connection;
/// it holds only process-wide collaborators, never connection state.
pub struct ConversationOrchestrator {
    config: ConversationConfig,
    store: Arc<StateStore>,
    model: Arc<dyn ConversationModel>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    identity: Arc<dyn IdentityProvider>,
    directory: Arc<dyn CounterpartDirectory>,
    chats: Arc<dyn ChatStore>,
}

impl ConversationOrchestrator {
    pub fn new(
        config: ConversationConfig,
        store: Arc<StateStore>,
        model: Arc<dyn ConversationModel>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn CounterpartDirectory>,
        chats: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            config,
            store,
            model,
            synthesizer,
            identity,
            directory,
            chats,
        }
    }

    /// Serve one client connection from handshake to close.
    ///
    /// Returns the connection id once an established conversation has ended,
    /// or the setup error when the connection never became active. Either
    /// way the client has received a terminal [`ClientOutbound::Close`].
    pub async fn run(
        &self,
        request: ConnectRequest,
        mut inbound: mpsc::UnboundedReceiver<ClientInbound>,
        outbound: mpsc::UnboundedSender<ClientOutbound>,
    ) -> AppResult<String> {
        let (mut conn, mut model_events) = match self.establish(request, outbound.clone()).await {
            Ok(established) => established,
            Err(err) => {
                info!("Connection setup failed: {}", err);
                let _ = outbound.send(ClientOutbound::Event(ServerEvent::error(err.to_string())));
                let _ = outbound.send(ClientOutbound::Close);
                return Err(err);
            }
        };

        conn.transition(ConnectionPhase::Active);
        conn.send_event(ServerEvent::ConnectionReady {
            connection_id: conn.id.clone(),
        });
        info!(connection_id = %conn.id, counterpart = %conn.counterpart.id, "Conversation active");

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (failure_tx, mut failures) = mpsc::unbounded_channel();
        conn.synthesis_jobs = Some(job_tx);
        tokio::spawn(run_synthesis_worker(
            self.synthesizer.clone(),
            conn.counterpart.voice_id.clone(),
            conn.id.clone(),
            job_rx,
            outbound,
            failure_tx,
        ));

        let greeting = tokio::time::sleep(self.config.greeting_delay());
        tokio::pin!(greeting);
        let mut greeting_pending = true;

        let mut tick = tokio::time::interval(self.config.silence_poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        conn.last_activity = Instant::now();
                        self.handle_inbound(&mut conn, message);
                    }
                    None => break CloseReason::ClientDisconnected,
                },
                event = model_events.recv() => match event {
                    Some(event) => self.handle_model_event(&mut conn, event),
                    None => break CloseReason::ModelSessionEnded,
                },
                Some(failure) = failures.recv() => self.handle_synthesis_failure(&mut conn, failure),
                _ = &mut greeting, if greeting_pending => {
                    greeting_pending = false;
                    self.start_greeting(&mut conn);
                }
                _ = tick.tick() => {
                    self.commit_if_silent(&mut conn);
                    if conn.last_activity.elapsed() >= self.config.idle_timeout() {
                        break CloseReason::IdleTimeout;
                    }
                }
            }
        };

        self.teardown(&mut conn, reason);
        Ok(conn.id)
    }

    async fn establish(
        &self,
        request: ConnectRequest,
        outbound: mpsc::UnboundedSender<ClientOutbound>,
    ) -> AppResult<(Connection, mpsc::UnboundedReceiver<ModelEvent>)> {
        debug!(
            counterpart = %request.counterpart_id,
            "Connection phase {} -> {}",
            ConnectionPhase::Idle,
            ConnectionPhase::Authenticating
        );

        let credential = request
            .credential
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::Unauthenticated("missing bearer credential".to_string()))?;
        let user_id = self.identity.validate(&credential).await?;
        let profile = self.identity.profile(&user_id).await?;
        let counterpart = self.directory.get(&request.counterpart_id).await?;
        if counterpart.voice_id.as_deref().map_or(true, |v| v.trim().is_empty()) {
            return Err(AppError::InvalidArgument(format!(
                "counterpart {} has no voice identity",
                counterpart.id
            )));
        }

        let id = connection_id_for(&user_id, &counterpart.id, Utc::now());
        let mut conn = Connection {
            chat_id: chat_id_for(&user_id, &counterpart.id),
            id,
            user_id,
            language: profile.language,
            counterpart,
            phase: ConnectionPhase::Authenticating,
            outbound,
            synthesis_jobs: None,
            discard_until_response_end: false,
            last_activity: Instant::now(),
        };
        conn.transition(ConnectionPhase::SessionEstablishing);

        self.store.create(&conn.id, &conn.user_id, &conn.counterpart.id)?;

        let session_config = ModelSessionConfig {
            instructions: conn.counterpart.instructions.clone(),
            language: conn.language.clone(),
            temperature: self.config.temperature,
        };
        match self.model.open_session(session_config).await {
            Ok(session) => {
                self.store.set_model_session(&conn.id, session.handle);
                Ok((conn, session.events))
            }
            Err(err) => {
                warn!(connection_id = %conn.id, "Failed to open model session: {}", err);
                self.store.remove(&conn.id);
                Err(err)
            }
        }
    }

    fn handle_inbound(&self, conn: &mut Connection, message: ClientInbound) {
        match message {
            ClientInbound::Audio(frame) => self.handle_audio_frame(conn, frame),
            ClientInbound::Event(ClientEvent::Heartbeat) => {
                debug!(connection_id = %conn.id, "Heartbeat");
            }
            ClientInbound::Event(ClientEvent::StartAudioTurn) => {
                match self.store.read(&conn.id, ConnectionSession::user_turn_in_progress) {
                    Some(true) => {
                        debug!(connection_id = %conn.id, "User turn already in progress, merging start request");
                    }
                    Some(false) => {
                        self.store.clear_frames(&conn.id);
                        debug!(connection_id = %conn.id, "User turn started");
                    }
                    None => {}
                }
            }
        }
    }

    fn handle_audio_frame(&self, conn: &mut Connection, frame: Bytes) {
        let id = conn.id.as_str();
        self.store.push_frame(id, frame.clone());

        let analysis = classify(&frame, self.config.silence_threshold);
        let speaking = !analysis.silent;
        if self.store.mark_user_speaking(id, speaking) {
            debug!(connection_id = %id, speaking, volume = analysis.volume, "User speaking state changed");
        }

        if self.store.should_barge_in(id) {
            self.barge_in(conn);
        }

        if speaking {
            if let Some(handle) = self.store.model_session(&conn.id) {
                handle.send_audio(&frame);
            }
        }

        self.commit_if_silent(conn);
    }

    /// End the user's turn once silence has lasted long enough.
    fn commit_if_silent(&self, conn: &mut Connection) {
        if !self
            .store
            .silence_elapsed(&conn.id, self.config.end_of_turn_silence())
        {
            return;
        }

        let frames = self.store.end_user_turn(&conn.id);
        if let Some(handle) = self.store.model_session(&conn.id) {
            handle.commit_audio_input();
        }
        // A new response is on its way; anything older is already settled
        conn.discard_until_response_end = false;
        info!(connection_id = %conn.id, frames, "User turn committed");
    }

    fn barge_in(&self, conn: &mut Connection) {
        info!(connection_id = %conn.id, "Barge-in detected, cancelling agent output");
        self.abandon_agent_turn(conn);
        conn.send_event(ServerEvent::BargeInDetected);
    }

    /// Cancel everything the agent is producing right now.
    fn abandon_agent_turn(&self, conn: &mut Connection) {
        let in_flight = self.store.has_live_model_response(&conn.id);
        self.store.cancel_agent_output(&conn.id);
        if let Some(handle) = self.store.model_session(&conn.id) {
            handle.cancel_response();
        }
        if in_flight {
            conn.discard_until_response_end = true;
        }
    }

    fn start_greeting(&self, conn: &mut Connection) {
        let Some((under_way, handle)) = self.store.read(&conn.id, |s| {
            (
                s.is_agent_speaking || s.user_turn_in_progress(),
                s.model_session.clone(),
            )
        }) else {
            return;
        };
        if under_way {
            debug!(connection_id = %conn.id, "Conversation already under way, skipping greeting");
            return;
        }
        let Some(handle) = handle else {
            return;
        };

        let persona = compose_instructions(&conn.counterpart.instructions, &conn.language);
        self.store.set_greeting_restore(&conn.id, persona);
        handle.update_instructions(
            &self
                .config
                .greeting_prompt(&conn.counterpart.display_name, &conn.language),
        );

        conn.discard_until_response_end = false;
        self.store.begin_model_response(&conn.id);
        if self.store.mark_agent_speaking(&conn.id, true) {
            conn.send_event(ServerEvent::AgentSpeakingStarted);
        }
        handle.request_response();
        info!(connection_id = %conn.id, "Greeting requested");
    }

    fn restore_after_greeting(&self, conn: &Connection) {
        if let Some(persona) = self.store.take_greeting_restore(&conn.id) {
            if let Some(handle) = self.store.model_session(&conn.id) {
                handle.update_instructions(&persona);
                debug!(connection_id = %conn.id, "Persona instructions restored after greeting");
            }
        }
    }

    fn handle_model_event(&self, conn: &mut Connection, event: ModelEvent) {
        match event {
            ModelEvent::TextFragment(fragment) => self.handle_text_fragment(conn, fragment),
            ModelEvent::TextComplete(text) => {
                debug!(connection_id = %conn.id, chars = text.len(), "Model text complete");
            }
            ModelEvent::ResponseComplete => self.handle_response_complete(conn),
            ModelEvent::ResponseInterrupted => {
                conn.discard_until_response_end = false;
                self.store.cancel_agent_output(&conn.id);
                conn.send_event(ServerEvent::AgentTurnInterrupted);
                self.restore_after_greeting(conn);
                info!(connection_id = %conn.id, "Agent turn interrupted");
            }
            ModelEvent::UserTranscript(text) => {
                debug!(connection_id = %conn.id, chars = text.len(), "User transcript received");
                self.persist_turn(conn, Speaker::User, text);
            }
            ModelEvent::Error(message) => {
                warn!(connection_id = %conn.id, "Conversation model error: {}", message);
                conn.send_event(ServerEvent::error(message));
                let agent_speaking = self
                    .store
                    .read(&conn.id, |s| s.is_agent_speaking)
                    .unwrap_or(false);
                if agent_speaking {
                    self.abandon_agent_turn(conn);
                }
            }
        }
    }

    fn handle_text_fragment(&self, conn: &mut Connection, fragment: String) {
        if conn.discard_until_response_end {
            debug!(connection_id = %conn.id, "Dropping fragment of cancelled response");
            return;
        }
        if fragment.is_empty() {
            return;
        }

        let id = conn.id.as_str();
        if self.store.mark_agent_speaking(id, true) {
            conn.send_event(ServerEvent::AgentSpeakingStarted);
        }
        if !self.store.has_live_model_response(id) {
            self.store.begin_model_response(id);
        }
        // User already talking: the overlap is a barge-in and the fragment is never voiced
        if self.store.should_barge_in(id) {
            self.barge_in(conn);
            return;
        }
        let Some(cancel) = self.store.current_synthesis(id) else {
            return;
        };
        self.store.append_text(id, &fragment);

        if let Some(jobs) = &conn.synthesis_jobs {
            if jobs.send(SynthesisJob { text: fragment, cancel }).is_err() {
                debug!(connection_id = %conn.id, "Synthesis worker gone, dropping fragment");
            }
        }
    }

    fn handle_response_complete(&self, conn: &mut Connection) {
        if std::mem::take(&mut conn.discard_until_response_end) {
            // cancelled response finished on its own before the cancel landed
            self.store.finish_model_response(&conn.id);
            self.restore_after_greeting(conn);
            debug!(connection_id = %conn.id, "Cancelled response completed");
            return;
        }

        let text = self.store.take_text(&conn.id);
        self.store.mark_agent_speaking(&conn.id, false);
        self.store.finish_model_response(&conn.id);
        conn.send_event(ServerEvent::AgentTurnComplete);
        self.restore_after_greeting(conn);
        info!(connection_id = %conn.id, chars = text.len(), "Agent turn complete");
        self.persist_turn(conn, Speaker::Agent, text);
    }

    fn handle_synthesis_failure(&self, conn: &mut Connection, failure: SynthesisFailure) {
        if failure.cancel.is_cancelled() {
            debug!(connection_id = %conn.id, "Ignoring failure from cancelled synthesis");
            return;
        }

        warn!(connection_id = %conn.id, "Speech synthesis failed: {}", failure.error);
        conn.send_event(ServerEvent::error(format!(
            "speech synthesis failed: {}",
            failure.error
        )));

        let agent_speaking = self
            .store
            .read(&conn.id, |s| s.is_agent_speaking)
            .unwrap_or(false);
        if agent_speaking {
            self.abandon_agent_turn(conn);
        } else {
            // drop the rest of the already-completed response's audio
            failure.cancel.cancel();
        }
    }

    /// Write a completed turn without blocking the connection loop.
    fn persist_turn(&self, conn: &Connection, speaker: Speaker, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let chats = self.chats.clone();
        let turn = ChatTurn::new(conn.chat_id.clone(), speaker, text);
        let connection_id = conn.id.clone();
        tokio::spawn(async move {
            if let Err(err) = chats.append_turn(turn).await {
                warn!(connection_id = %connection_id, "Failed to persist chat turn: {}", err);
            }
        });
    }

    fn teardown(&self, conn: &mut Connection, reason: CloseReason) {
        conn.transition(ConnectionPhase::Closing);
        info!(connection_id = %conn.id, ?reason, "Closing conversation");

        self.store.cancel_agent_output(&conn.id);
        debug!(connection_id = %conn.id, "Agent output cancelled");

        match self.store.take_model_session(&conn.id) {
            Some(handle) => {
                let was_open = handle.is_open();
                handle.close();
                debug!(connection_id = %conn.id, was_open, "Model session closed");
            }
            None => debug!(connection_id = %conn.id, "No model session to close"),
        }

        if !self.store.remove(&conn.id) {
            debug!(connection_id = %conn.id, "Session entry already removed");
        }

        // worker drains its queue (all cancelled) and exits
        conn.synthesis_jobs.take();

        if let CloseReason::ModelSessionEnded = reason {
            conn.send_event(ServerEvent::error("conversation model session ended"));
        }
        if conn.outbound.send(ClientOutbound::Close).is_err() {
            debug!(connection_id = %conn.id, "Client already gone at close");
        }

        conn.transition(ConnectionPhase::Closed);
    }
}

async fn run_synthesis_worker(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice_id: Option<String>,
    connection_id: String,
    mut jobs: mpsc::UnboundedReceiver<SynthesisJob>,
    outbound: mpsc::UnboundedSender<ClientOutbound>,
    failures: mpsc::UnboundedSender<SynthesisFailure>,
) {
    while let Some(job) = jobs.recv().await {
        if job.cancel.is_cancelled() {
            debug!(connection_id = %connection_id, "Skipping fragment of cancelled response");
            continue;
        }

        let mut forward = |chunk: Bytes| {
            let _ = outbound.send(ClientOutbound::Audio(chunk));
        };
        let result = synthesizer
            .synthesize(&job.text, voice_id.as_deref(), &job.cancel, &mut forward)
            .await;

        match result {
            Ok(SynthesisOutcome::Completed { chunks, bytes }) => {
                debug!(connection_id = %connection_id, chunks, bytes, "Fragment synthesized");
            }
            Ok(SynthesisOutcome::Skipped) => {
                debug!(connection_id = %connection_id, "Blank fragment skipped");
            }
            Ok(SynthesisOutcome::Aborted) => {
                debug!(connection_id = %connection_id, "Fragment synthesis aborted");
            }
            Err(_) if job.cancel.is_cancelled() => {
                debug!(connection_id = %connection_id, "Synthesis ended after cancellation");
            }
            Err(error) => {
                let _ = failures.send(SynthesisFailure {
                    error,
                    cancel: job.cancel,
                });
            }
        }
    }
    debug!(connection_id = %connection_id, "Synthesis worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::tests::pcm_frame;
    use crate::conversation::model::{ModelCommand, ModelSession, ModelSessionHandle};
    use crate::services::FileCounterpartDirectory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const TOKEN: &str = "good-token";
    const PERSONA: &str = "You are Asha, a patient listener.";

    struct FakeIdentity;

    #[async_trait]
    impl IdentityProvider for FakeIdentity {
        async fn validate(&self, credential: &str) -> AppResult<String> {
            if credential == TOKEN {
                Ok("user-1".to_string())
            } else {
                Err(AppError::Unauthenticated("bad token".to_string()))
            }
        }

        async fn profile(&self, user_id: &str) -> AppResult<crate::services::UserProfile> {
            Ok(crate::services::UserProfile {
                user_id: user_id.to_string(),
                language: "en".to_string(),
            })
        }
    }

    /// Hands out one pre-built session, optionally after a delay.
    struct ScriptedModel {
        session: Mutex<Option<ModelSession>>,
        open_delay: Option<Duration>,
        opened: Mutex<Vec<ModelSessionConfig>>,
    }

    #[async_trait]
    impl ConversationModel for ScriptedModel {
        async fn open_session(&self, config: ModelSessionConfig) -> AppResult<ModelSession> {
            self.opened.lock().unwrap().push(config);
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
                return Err(AppError::ConnectionTimeout("model not ready".to_string()));
            }
            self.session
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AppError::Internal("session already taken".to_string()))
        }
    }

    #[derive(Default)]
    struct FakeSynthesizer {
        texts: Mutex<Vec<String>>,
        /// Emit one chunk, then wait for cancellation
        hold: bool,
        fail: bool,
        aborted: AtomicUsize,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynthesizer {
        async fn synthesize(
            &self,
            text: &str,
            _voice_id: Option<&str>,
            cancel: &CancellationToken,
            on_chunk: &mut (dyn FnMut(Bytes) + Send),
        ) -> AppResult<SynthesisOutcome> {
            self.texts.lock().unwrap().push(text.to_string());
            if self.fail {
                return Err(AppError::Upstream {
                    status: 500,
                    message: "tts down".to_string(),
                });
            }
            on_chunk(Bytes::from(text.as_bytes().to_vec()));
            if self.hold {
                cancel.cancelled().await;
                self.aborted.fetch_add(1, Ordering::SeqCst);
                return Ok(SynthesisOutcome::Aborted);
            }
            Ok(SynthesisOutcome::Completed {
                chunks: 1,
                bytes: text.len(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingChats {
        turns: Mutex<Vec<ChatTurn>>,
    }

    #[async_trait]
    impl ChatStore for RecordingChats {
        async fn append_turn(&self, turn: ChatTurn) -> AppResult<()> {
            self.turns.lock().unwrap().push(turn);
            Ok(())
        }
    }

    fn directory() -> FileCounterpartDirectory {
        FileCounterpartDirectory::from_counterparts(vec![
            Counterpart {
                id: "counsellor-1".to_string(),
                display_name: "Asha".to_string(),
                voice_id: Some("voice-asha".to_string()),
                instructions: PERSONA.to_string(),
            },
            Counterpart {
                id: "mute-1".to_string(),
                display_name: "Mute".to_string(),
                voice_id: None,
                instructions: "...".to_string(),
            },
        ])
    }

    fn quiet_config() -> ConversationConfig {
        ConversationConfig {
            greeting_delay_ms: 3_600_000,
            idle_timeout_secs: 7_200,
            ..ConversationConfig::default()
        }
    }

    struct Harness {
        store: Arc<StateStore>,
        inbound: Option<mpsc::UnboundedSender<ClientInbound>>,
        outbound: mpsc::UnboundedReceiver<ClientOutbound>,
        commands: mpsc::UnboundedReceiver<ModelCommand>,
        events: Option<mpsc::UnboundedSender<ModelEvent>>,
        model: Arc<ScriptedModel>,
        synthesizer: Arc<FakeSynthesizer>,
        chats: Arc<RecordingChats>,
        task: JoinHandle<AppResult<String>>,
        connection_id: String,
    }

    struct Setup {
        config: ConversationConfig,
        synthesizer: FakeSynthesizer,
        credential: Option<String>,
        counterpart_id: String,
        open_delay: Option<Duration>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                config: quiet_config(),
                synthesizer: FakeSynthesizer::default(),
                credential: Some(TOKEN.to_string()),
                counterpart_id: "counsellor-1".to_string(),
                open_delay: None,
            }
        }
    }

    fn spawn(setup: Setup) -> Harness {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = ModelSession {
            handle: ModelSessionHandle::new(command_tx, Arc::new(AtomicBool::new(true))),
            events: event_rx,
        };

        let store = Arc::new(StateStore::new(setup.config.frame_buffer_capacity));
        let model = Arc::new(ScriptedModel {
            session: Mutex::new(Some(session)),
            open_delay: setup.open_delay,
            opened: Mutex::new(Vec::new()),
        });
        let synthesizer = Arc::new(setup.synthesizer);
        let chats = Arc::new(RecordingChats::default());

        let orchestrator = ConversationOrchestrator::new(
            setup.config,
            store.clone(),
            model.clone(),
            synthesizer.clone(),
            Arc::new(FakeIdentity),
            Arc::new(directory()),
            chats.clone(),
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let request = ConnectRequest {
            credential: setup.credential,
            counterpart_id: setup.counterpart_id,
        };
        let task = tokio::spawn(async move { orchestrator.run(request, inbound_rx, outbound_tx).await });

        Harness {
            store,
            inbound: Some(inbound_tx),
            outbound,
            commands,
            events: Some(event_tx),
            model,
            synthesizer,
            chats,
            task,
            connection_id: String::new(),
        }
    }

    async fn connect(setup: Setup) -> Harness {
        let mut harness = spawn(setup);
        match harness.next_event().await {
            ServerEvent::ConnectionReady { connection_id } => harness.connection_id = connection_id,
            other => panic!("expected connection-ready, got {:?}", other),
        }
        harness
    }

    impl Harness {
        fn send_frame(&self, frame: Vec<u8>) {
            self.send(ClientInbound::Audio(Bytes::from(frame)));
        }

        fn send(&self, message: ClientInbound) {
            self.inbound.as_ref().unwrap().send(message).unwrap();
        }

        fn emit(&self, event: ModelEvent) {
            self.events.as_ref().unwrap().send(event).unwrap();
        }

        async fn next_outbound(&mut self) -> ClientOutbound {
            self.outbound.recv().await.expect("outbound channel closed")
        }

        /// Next structured event, skipping audio.
        async fn next_event(&mut self) -> ServerEvent {
            loop {
                match self.next_outbound().await {
                    ClientOutbound::Event(event) => return event,
                    ClientOutbound::Audio(_) => continue,
                    ClientOutbound::Close => panic!("connection closed"),
                }
            }
        }

        /// Next model command other than audio forwarding.
        async fn next_control_command(&mut self) -> ModelCommand {
            loop {
                match self.commands.recv().await.expect("command channel closed") {
                    ModelCommand::AppendAudio(_) => continue,
                    command => return command,
                }
            }
        }

        fn session(&self) -> ConnectionSession {
            self.store.get(&self.connection_id).expect("session missing")
        }

        /// Let the connection task drain everything already queued.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn loud() -> Vec<u8> {
        pcm_frame(16384, 160)
    }

    fn silent() -> Vec<u8> {
        pcm_frame(0, 160)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_ready_and_model_opened_with_persona() {
        let mut h = connect(Setup::default()).await;
        assert!(h.connection_id.starts_with("user-1_counsellor-1_"));
        assert_eq!(h.store.len(), 1);

        let opened = h.model.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].instructions, PERSONA);
        assert_eq!(opened[0].language, "en");
        assert!((opened[0].temperature - 0.8).abs() < f32::EPSILON);

        h.inbound.take();
        assert_eq!(h.next_control_command().await, ModelCommand::Close);
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loud_frame_marks_user_speaking() {
        let mut h = connect(Setup::default()).await;

        h.send_frame(loud());
        match h.commands.recv().await.unwrap() {
            ModelCommand::AppendAudio(frame) => assert_eq!(frame.len(), 320),
            other => panic!("expected audio, got {:?}", other),
        }

        let session = h.session();
        assert!(session.is_user_speaking);
        assert!(session.silence_started_at.is_none());
        assert_eq!(session.pending_frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_commits_turn_exactly_once() {
        let mut h = connect(Setup::default()).await;

        h.send_frame(loud());
        h.send_frame(silent());
        h.settle().await;
        assert!(h.session().silence_started_at.is_some());
        assert_eq!(h.session().pending_frames.len(), 2);

        // periodic tick commits without further frames
        assert_eq!(h.next_control_command().await, ModelCommand::CommitInput);
        assert_eq!(h.next_control_command().await, ModelCommand::CreateResponse);
        let session = h.session();
        assert!(session.pending_frames.is_empty());
        assert!(session.silence_started_at.is_none());

        h.send_frame(silent());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_response_streams_and_persists() {
        let mut h = connect(Setup::default()).await;

        h.emit(ModelEvent::TextFragment("Hi ".to_string()));
        h.emit(ModelEvent::TextFragment("there.".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);

        let mut audio = Vec::new();
        while audio.len() < 2 {
            if let ClientOutbound::Audio(chunk) = h.next_outbound().await {
                audio.push(chunk);
            }
        }
        assert_eq!(audio, vec![Bytes::from_static(b"Hi "), Bytes::from_static(b"there.")]);
        assert_eq!(*h.synthesizer.texts.lock().unwrap(), vec!["Hi ", "there."]);
        assert_eq!(h.session().pending_text, "Hi there.");
        assert!(h.session().is_agent_speaking);

        h.emit(ModelEvent::ResponseComplete);
        assert_eq!(h.next_event().await, ServerEvent::AgentTurnComplete);
        h.settle().await;

        let session = h.session();
        assert!(!session.is_agent_speaking);
        assert!(session.pending_text.is_empty());
        assert!(session.model_cancel.is_none());

        let turns = h.chats.turns.lock().unwrap().clone();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, Speaker::Agent);
        assert_eq!(turns[0].text, "Hi there.");
        assert_eq!(turns[0].chat_id, "chat_user-1_counsellor-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_cancels_agent_output() {
        let mut h = connect(Setup {
            synthesizer: FakeSynthesizer {
                hold: true,
                ..FakeSynthesizer::default()
            },
            ..Setup::default()
        })
        .await;

        h.emit(ModelEvent::TextFragment("Let me tell you".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        assert!(matches!(h.next_outbound().await, ClientOutbound::Audio(_)));
        let synthesis = h.session().synthesis_cancel.unwrap();
        let model = h.session().model_cancel.unwrap();

        h.send_frame(loud());
        assert_eq!(h.next_event().await, ServerEvent::BargeInDetected);
        assert_eq!(h.next_control_command().await, ModelCommand::CancelResponse);

        let session = h.session();
        assert!(!session.is_agent_speaking);
        assert!(session.is_user_speaking);
        assert!(session.pending_text.is_empty());
        assert!(synthesis.is_cancelled());
        assert!(model.is_cancelled());
        h.settle().await;
        assert_eq!(h.synthesizer.aborted.load(Ordering::SeqCst), 1);

        // late fragment of the cancelled response is dropped
        h.emit(ModelEvent::TextFragment(" a story".to_string()));
        h.emit(ModelEvent::ResponseInterrupted);
        assert_eq!(h.next_event().await, ServerEvent::AgentTurnInterrupted);
        assert_eq!(h.synthesizer.texts.lock().unwrap().len(), 1);
        assert!(!h.session().is_agent_speaking);

        // the next response speaks normally
        h.emit(ModelEvent::TextFragment("Go on.".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        assert!(h.chats.turns.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flags_never_both_raised_after_a_frame() {
        let mut h = connect(Setup::default()).await;

        for round in 0..3 {
            h.emit(ModelEvent::TextFragment(format!("reply {}", round)));
            assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
            h.send_frame(loud());
            assert_eq!(h.next_event().await, ServerEvent::BargeInDetected);
            let session = h.session();
            assert!(!(session.is_user_speaking && session.is_agent_speaking));
            h.emit(ModelEvent::ResponseInterrupted);
            assert_eq!(h.next_event().await, ServerEvent::AgentTurnInterrupted);

            // the user finishes, so the next reply starts unopposed
            h.send_frame(silent());
            assert_eq!(h.next_control_command().await, ModelCommand::CancelResponse);
            assert_eq!(h.next_control_command().await, ModelCommand::CommitInput);
            assert_eq!(h.next_control_command().await, ModelCommand::CreateResponse);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_while_user_speaks_is_a_barge_in() {
        let mut h = connect(Setup::default()).await;

        h.send_frame(loud());
        h.settle().await;
        assert!(h.session().is_user_speaking);

        h.emit(ModelEvent::TextFragment("Earlier reply".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        assert_eq!(h.next_event().await, ServerEvent::BargeInDetected);
        assert_eq!(h.next_control_command().await, ModelCommand::CancelResponse);

        let session = h.session();
        assert!(session.is_user_speaking);
        assert!(!session.is_agent_speaking);
        assert!(session.pending_text.is_empty());
        assert!(!h.store.should_barge_in(&h.connection_id));
        h.settle().await;
        assert!(h.synthesizer.texts.lock().unwrap().is_empty());

        // the rest of that response stays silent until it terminates
        h.emit(ModelEvent::TextFragment(" and more".to_string()));
        h.emit(ModelEvent::ResponseInterrupted);
        assert_eq!(h.next_event().await, ServerEvent::AgentTurnInterrupted);
        assert!(h.synthesizer.texts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_overrides_then_restores_persona() {
        let mut config = quiet_config();
        config.greeting_delay_ms = 1000;
        let mut h = connect(Setup {
            config,
            ..Setup::default()
        })
        .await;

        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        match h.next_control_command().await {
            ModelCommand::UpdateInstructions(prompt) => {
                assert!(prompt.contains("Asha"));
                assert!(prompt.contains("en"));
            }
            other => panic!("expected greeting prompt, got {:?}", other),
        }
        assert_eq!(h.next_control_command().await, ModelCommand::CreateResponse);
        assert!(h.session().greeting_restore_instructions.is_some());

        h.emit(ModelEvent::TextFragment("Hello, I'm Asha.".to_string()));
        h.emit(ModelEvent::ResponseComplete);
        assert_eq!(h.next_event().await, ServerEvent::AgentTurnComplete);

        assert_eq!(
            h.next_control_command().await,
            ModelCommand::UpdateInstructions(compose_instructions(PERSONA, "en"))
        );
        assert!(h.session().greeting_restore_instructions.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_greeting_still_restores_persona() {
        let mut config = quiet_config();
        config.greeting_delay_ms = 500;
        let mut h = connect(Setup {
            config,
            ..Setup::default()
        })
        .await;

        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        h.send_frame(loud());
        assert_eq!(h.next_event().await, ServerEvent::BargeInDetected);
        h.emit(ModelEvent::ResponseInterrupted);
        assert_eq!(h.next_event().await, ServerEvent::AgentTurnInterrupted);

        let mut commands = Vec::new();
        h.settle().await;
        while let Ok(command) = h.commands.try_recv() {
            commands.push(command);
        }
        assert_eq!(
            commands.last(),
            Some(&ModelCommand::UpdateInstructions(compose_instructions(PERSONA, "en")))
        );
        assert!(commands.contains(&ModelCommand::CancelResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_audio_turn_merges_into_open_turn() {
        let h = connect(Setup::default()).await;

        // no turn open: start clears stale frames
        h.send_frame(silent());
        h.settle().await;
        assert_eq!(h.session().pending_frames.len(), 1);
        h.send(ClientInbound::Event(ClientEvent::StartAudioTurn));
        h.settle().await;
        assert!(h.session().pending_frames.is_empty());

        // turn open: start is merged, buffer untouched
        h.send_frame(loud());
        h.send(ClientInbound::Event(ClientEvent::StartAudioTurn));
        h.settle().await;
        let session = h.session();
        assert_eq!(session.pending_frames.len(), 1);
        assert!(session.is_user_speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_error_abandons_turn_but_keeps_connection() {
        let mut h = connect(Setup {
            synthesizer: FakeSynthesizer {
                fail: true,
                ..FakeSynthesizer::default()
            },
            ..Setup::default()
        })
        .await;

        h.emit(ModelEvent::TextFragment("Hello".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        match h.next_event().await {
            ServerEvent::Error { message } => assert!(message.contains("speech synthesis failed")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(h.next_control_command().await, ModelCommand::CancelResponse);
        assert!(!h.session().is_agent_speaking);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_error_is_reported_and_connection_stays_open() {
        let mut h = connect(Setup::default()).await;
        h.emit(ModelEvent::Error("rate limited".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::error("rate limited"));
        h.settle().await;
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_transcript_is_persisted() {
        let h = connect(Setup::default()).await;
        h.emit(ModelEvent::UserTranscript("I couldn't sleep".to_string()));
        h.settle().await;

        let turns = h.chats.turns.lock().unwrap().clone();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, Speaker::User);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_connection() {
        let mut config = quiet_config();
        config.idle_timeout_secs = 5;
        let mut h = connect(Setup {
            config,
            ..Setup::default()
        })
        .await;

        assert_eq!(h.next_outbound().await, ClientOutbound::Close);
        assert_eq!(h.next_control_command().await, ModelCommand::Close);
        assert!(h.store.is_empty());
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_disconnect_tears_down_everything() {
        let mut h = connect(Setup {
            synthesizer: FakeSynthesizer {
                hold: true,
                ..FakeSynthesizer::default()
            },
            ..Setup::default()
        })
        .await;

        h.emit(ModelEvent::TextFragment("Still talking".to_string()));
        assert_eq!(h.next_event().await, ServerEvent::AgentSpeakingStarted);
        let synthesis = h.session().synthesis_cancel.unwrap();

        h.inbound.take();
        assert_eq!(h.next_control_command().await, ModelCommand::Close);
        let id = h.task.await.unwrap().unwrap();
        assert_eq!(id, h.connection_id);
        assert!(synthesis.is_cancelled());
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_stream_end_sends_error_then_close() {
        let mut h = connect(Setup::default()).await;
        h.events.take();

        assert!(matches!(h.next_event().await, ServerEvent::Error { .. }));
        assert_eq!(h.next_outbound().await, ClientOutbound::Close);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_credential_fails_fast() {
        let mut h = spawn(Setup {
            credential: Some("forged".to_string()),
            ..Setup::default()
        });

        assert!(matches!(h.next_outbound().await, ClientOutbound::Event(ServerEvent::Error { .. })));
        assert_eq!(h.next_outbound().await, ClientOutbound::Close);
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
        assert!(h.store.is_empty());
        assert!(h.model.opened.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_and_voice_fail_fast() {
        let h = spawn(Setup {
            credential: None,
            ..Setup::default()
        });
        assert!(matches!(h.task.await.unwrap(), Err(AppError::Unauthenticated(_))));

        let h = spawn(Setup {
            counterpart_id: "mute-1".to_string(),
            ..Setup::default()
        });
        assert!(matches!(h.task.await.unwrap(), Err(AppError::InvalidArgument(_))));

        let h = spawn(Setup {
            counterpart_id: "nobody".to_string(),
            ..Setup::default()
        });
        assert!(matches!(h.task.await.unwrap(), Err(AppError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_open_timeout_leaves_no_state() {
        let mut h = spawn(Setup {
            open_delay: Some(Duration::from_secs(11)),
            ..Setup::default()
        });

        h.settle().await;
        assert_eq!(h.store.len(), 1);

        match h.next_outbound().await {
            ClientOutbound::Event(ServerEvent::Error { message }) => {
                assert!(message.contains("Connection timeout"))
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert_eq!(h.next_outbound().await, ClientOutbound::Close);
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::ConnectionTimeout(_)));
        assert!(h.store.is_empty());
    }
}

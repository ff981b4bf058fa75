//! # Connection Session State
//!
//! Per-connection conversation state and the process-wide store that owns it.
//!
//! ## Ownership Model:
//! - One [`ConnectionSession`] per live client connection, keyed by its
//!   connection id.
//! - Only the orchestrator task serving that connection mutates the entry.
//!   Different connections never touch each other's entries, so the session
//!   fields need no locks of their own; the map itself is a `DashMap`, which
//!   lets connections insert/remove concurrently without blocking each other.
//! - Every accessor treats a missing entry as a no-op. Late events after
//!   teardown are expected, not errors.

use crate::audio::FrameBuffer;
use crate::conversation::model::ModelSessionHandle;
use crate::error::{AppError, AppResult};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mutable record for one live duplex connection.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub connection_id: String,
    pub user_id: String,
    pub counterpart_id: String,
    pub created_at: DateTime<Utc>,

    pub is_user_speaking: bool,
    pub is_agent_speaking: bool,
    pub last_user_audio_at: Option<Instant>,
    /// Set when speech stops, cleared the moment it resumes
    pub silence_started_at: Option<Instant>,

    pub pending_frames: FrameBuffer,
    /// Agent text of the current response not yet flushed to persistence
    pub pending_text: String,

    pub model_session: Option<ModelSessionHandle>,
    pub synthesis_cancel: Option<CancellationToken>,
    pub model_cancel: Option<CancellationToken>,

    /// Persona instructions to restore once the greeting response ends
    pub greeting_restore_instructions: Option<String>,
}

impl ConnectionSession {
    fn new(connection_id: String, user_id: String, counterpart_id: String, frame_capacity: usize) -> Self {
        Self {
            connection_id,
            user_id,
            counterpart_id,
            created_at: Utc::now(),
            is_user_speaking: false,
            is_agent_speaking: false,
            last_user_audio_at: None,
            silence_started_at: None,
            pending_frames: FrameBuffer::new(frame_capacity),
            pending_text: String::new(),
            model_session: None,
            synthesis_cancel: None,
            model_cancel: None,
            greeting_restore_instructions: None,
        }
    }

    /// Whether a user turn is open: speaking now, or silent but not yet committed.
    pub fn user_turn_in_progress(&self) -> bool {
        self.is_user_speaking || self.silence_started_at.is_some()
    }

    fn cancel_agent_output(&mut self) {
        if let Some(token) = self.synthesis_cancel.take() {
            token.cancel();
        }
        if let Some(token) = self.model_cancel.take() {
            token.cancel();
        }
        self.pending_text.clear();
        self.is_agent_speaking = false;
    }
}

/// Build the connection id from the participants and the creation instant.
pub fn connection_id_for(user_id: &str, counterpart_id: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        user_id,
        counterpart_id,
        created_at.timestamp_nanos_opt().unwrap_or_else(|| created_at.timestamp_millis())
    )
}

/// Process-wide map of live connections.
pub struct StateStore {
    sessions: DashMap<String, ConnectionSession>,
    frame_capacity: usize,
}

impl StateStore {
    pub fn new(frame_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            frame_capacity,
        }
    }

    /// Register a new connection. Fails if the id is already present.
    pub fn create(&self, connection_id: &str, user_id: &str, counterpart_id: &str) -> AppResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(connection_id.to_string()) {
            Entry::Occupied(_) => Err(AppError::AlreadyExists(format!(
                "connection {} is already registered",
                connection_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionSession::new(
                    connection_id.to_string(),
                    user_id.to_string(),
                    counterpart_id.to_string(),
                    self.frame_capacity,
                ));
                Ok(())
            }
        }
    }

    /// Full copy of a session, frames included, for assertions.
    #[cfg(test)]
    pub fn get(&self, connection_id: &str) -> Option<ConnectionSession> {
        self.sessions.get(connection_id).map(|s| s.clone())
    }

    /// Read from the entry without copying it, `None` after teardown.
    pub fn read<R>(&self, connection_id: &str, f: impl FnOnce(&ConnectionSession) -> R) -> Option<R> {
        self.sessions.get(connection_id).map(|s| f(&s))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run `f` against the entry, if present. The shard lock is held only
    /// for the duration of `f`; never await inside it.
    pub fn update<R>(&self, connection_id: &str, f: impl FnOnce(&mut ConnectionSession) -> R) -> Option<R> {
        self.sessions.get_mut(connection_id).map(|mut s| f(&mut s))
    }

    /// Update the user-speaking flag. Returns `true` when the flag flipped.
    ///
    /// Speech clears the silence clock and stamps the last-audio instant;
    /// a speaking → silent transition starts the silence clock.
    pub fn mark_user_speaking(&self, connection_id: &str, speaking: bool) -> bool {
        self.update(connection_id, |s| {
            let changed = s.is_user_speaking != speaking;
            if speaking {
                s.last_user_audio_at = Some(Instant::now());
                s.silence_started_at = None;
            } else if changed {
                s.silence_started_at = Some(Instant::now());
            }
            s.is_user_speaking = speaking;
            changed
        })
        .unwrap_or(false)
    }

    /// Update the agent-speaking flag. Returns `true` when the flag flipped.
    pub fn mark_agent_speaking(&self, connection_id: &str, speaking: bool) -> bool {
        self.update(connection_id, |s| {
            let changed = s.is_agent_speaking != speaking;
            s.is_agent_speaking = speaking;
            changed
        })
        .unwrap_or(false)
    }

    pub fn should_barge_in(&self, connection_id: &str) -> bool {
        self.sessions
            .get(connection_id)
            .map(|s| s.is_user_speaking && s.is_agent_speaking)
            .unwrap_or(false)
    }

    /// True once the user has been silent, after speaking, for at least `threshold`.
    pub fn silence_elapsed(&self, connection_id: &str, threshold: Duration) -> bool {
        self.sessions
            .get(connection_id)
            .and_then(|s| {
                if s.is_user_speaking {
                    return None;
                }
                s.silence_started_at
            })
            .map(|started| started.elapsed() >= threshold)
            .unwrap_or(false)
    }

    /// Invalidate both cancellation handles, drop pending agent text and
    /// lower the agent-speaking flag. Idempotent.
    pub fn cancel_agent_output(&self, connection_id: &str) {
        self.update(connection_id, ConnectionSession::cancel_agent_output);
    }

    /// Cancel agent output and delete the entry. Returns whether it existed.
    pub fn remove(&self, connection_id: &str) -> bool {
        self.cancel_agent_output(connection_id);
        let removed = self.sessions.remove(connection_id).is_some();
        if !removed {
            debug!(connection_id, "Remove requested for unknown connection");
        }
        removed
    }

    /// Append an inbound frame to the bounded buffer.
    pub fn push_frame(&self, connection_id: &str, frame: Bytes) {
        self.update(connection_id, |s| {
            s.pending_frames.push(frame);
        });
    }

    /// Close the user's turn: clear buffered frames and the silence clock.
    /// Returns the number of frames that were buffered.
    pub fn end_user_turn(&self, connection_id: &str) -> usize {
        self.update(connection_id, |s| {
            let frames = s.pending_frames.len();
            debug!(
                connection_id,
                frames,
                bytes = s.pending_frames.byte_len(),
                dropped = s.pending_frames.dropped(),
                "Clearing buffered user audio"
            );
            s.pending_frames.clear();
            s.silence_started_at = None;
            frames
        })
        .unwrap_or(0)
    }

    pub fn clear_frames(&self, connection_id: &str) {
        self.update(connection_id, |s| s.pending_frames.clear());
    }

    pub fn set_model_session(&self, connection_id: &str, handle: ModelSessionHandle) {
        self.update(connection_id, |s| s.model_session = Some(handle));
    }

    pub fn model_session(&self, connection_id: &str) -> Option<ModelSessionHandle> {
        self.sessions
            .get(connection_id)
            .and_then(|s| s.model_session.clone())
    }

    pub fn take_model_session(&self, connection_id: &str) -> Option<ModelSessionHandle> {
        self.update(connection_id, |s| s.model_session.take()).flatten()
    }

    /// Install a fresh synthesis cancellation handle, cancelling any live one.
    pub fn begin_synthesis(&self, connection_id: &str) -> Option<CancellationToken> {
        self.update(connection_id, |s| {
            let token = CancellationToken::new();
            if let Some(previous) = s.synthesis_cancel.replace(token.clone()) {
                previous.cancel();
            }
            token
        })
    }

    /// The live synthesis handle, creating one if none is live.
    pub fn current_synthesis(&self, connection_id: &str) -> Option<CancellationToken> {
        let existing = self
            .sessions
            .get(connection_id)
            .and_then(|s| s.synthesis_cancel.clone().filter(|t| !t.is_cancelled()));
        existing.or_else(|| self.begin_synthesis(connection_id))
    }

    /// Install a fresh model-response cancellation handle, cancelling any live one.
    pub fn begin_model_response(&self, connection_id: &str) -> Option<CancellationToken> {
        self.update(connection_id, |s| {
            let token = CancellationToken::new();
            if let Some(previous) = s.model_cancel.replace(token.clone()) {
                previous.cancel();
            }
            token
        })
    }

    /// Drop the model-response handle after the response ended on its own.
    pub fn finish_model_response(&self, connection_id: &str) {
        self.update(connection_id, |s| s.model_cancel = None);
    }

    pub fn has_live_model_response(&self, connection_id: &str) -> bool {
        self.sessions
            .get(connection_id)
            .and_then(|s| s.model_cancel.as_ref().map(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    pub fn append_text(&self, connection_id: &str, fragment: &str) {
        self.update(connection_id, |s| s.pending_text.push_str(fragment));
    }

    pub fn take_text(&self, connection_id: &str) -> String {
        self.update(connection_id, |s| std::mem::take(&mut s.pending_text))
            .unwrap_or_default()
    }

    pub fn set_greeting_restore(&self, connection_id: &str, instructions: String) {
        self.update(connection_id, |s| s.greeting_restore_instructions = Some(instructions));
    }

    pub fn take_greeting_restore(&self, connection_id: &str) -> Option<String> {
        self.update(connection_id, |s| s.greeting_restore_instructions.take())
            .flatten()
    }
}

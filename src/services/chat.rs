//! Chat turn persistence: one JSON object per line, appended.

use crate::error::{AppError, AppResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// A completed turn by either party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: Uuid,
    pub chat_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(chat_id: impl Into<String>, speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Chat identifier shared by every turn between one user and one counterpart.
pub fn chat_id_for(user_id: &str, counterpart_id: &str) -> String {
    format!("chat_{}_{}", user_id, counterpart_id)
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append_turn(&self, turn: ChatTurn) -> AppResult<()>;
}

pub struct JsonlChatStore {
    path: PathBuf,
    /// Serializes appends so concurrent lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlChatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ChatStore for JsonlChatStore {
    async fn append_turn(&self, turn: ChatTurn) -> AppResult<()> {
        let mut line = serde_json::to_string(&turn)
            .map_err(|e| AppError::Internal(format!("Failed to encode chat turn: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::Internal(format!("Failed to append chat turn: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush chat log: {}", e)))?;
        Ok(())
    }
}

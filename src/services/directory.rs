//! Counterpart (consultant persona) directory backed by a TOML file.
//!
//! ```toml
//! [[counterparts]]
//! id = "counsellor-1"
//! display_name = "Asha"
//! voice_id = "EXAVITQu4vr4xnSDxMaL"
//! instructions = "You are Asha, a warm and patient listener..."
//! ```

use crate::error::{AppError, AppResult};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Counterpart {
    pub id: String,
    pub display_name: String,
    /// Synthesis voice; a counterpart without one cannot hold a voice session
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Persona instructions for the conversation model
    pub instructions: String,
}

#[async_trait]
pub trait CounterpartDirectory: Send + Sync {
    /// Look up a counterpart. Unknown ids fail with [`AppError::NotFound`].
    async fn get(&self, counterpart_id: &str) -> AppResult<Counterpart>;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    counterparts: Vec<Counterpart>,
}

pub struct FileCounterpartDirectory {
    counterparts: HashMap<String, Counterpart>,
}

impl FileCounterpartDirectory {
    /// Load the directory. A missing file yields an empty directory.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Counterpart directory {} not found, starting empty", path.display());
            return Ok(Self::from_counterparts(Vec::new()));
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let directory = Self::from_toml(&contents)?;
        info!("Loaded {} counterparts from {}", directory.len(), path.display());
        Ok(directory)
    }

    pub fn from_toml(contents: &str) -> AppResult<Self> {
        let file: DirectoryFile = toml::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid counterpart directory: {}", e)))?;
        Ok(Self::from_counterparts(file.counterparts))
    }

    pub fn from_counterparts(counterparts: Vec<Counterpart>) -> Self {
        Self {
            counterparts: counterparts.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.counterparts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counterparts.is_empty()
    }
}

#[async_trait]
impl CounterpartDirectory for FileCounterpartDirectory {
    async fn get(&self, counterpart_id: &str) -> AppResult<Counterpart> {
        self.counterparts
            .get(counterpart_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("counterpart {}", counterpart_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DIRECTORY: &str = r#"
[[counterparts]]
id = "counsellor-1"
display_name = "Asha"
voice_id = "voice-asha"
instructions = "You are Asha."

[[counterparts]]
id = "counsellor-2"
display_name = "Ravi"
instructions = "You are Ravi."
"#;

    #[tokio::test]
    async fn test_lookup_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DIRECTORY.as_bytes()).unwrap();

        let directory = FileCounterpartDirectory::load(file.path()).unwrap();
        assert_eq!(directory.len(), 2);

        let asha = directory.get("counsellor-1").await.unwrap();
        assert_eq!(asha.display_name, "Asha");
        assert_eq!(asha.voice_id.as_deref(), Some("voice-asha"));

        let ravi = directory.get("counsellor-2").await.unwrap();
        assert!(ravi.voice_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_counterpart_is_not_found() {
        let directory = FileCounterpartDirectory::from_toml(DIRECTORY).unwrap();
        let err = directory.get("nobody").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_missing_file_is_empty_and_bad_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let directory = FileCounterpartDirectory::load(dir.path().join("absent.toml")).unwrap();
        assert!(directory.is_empty());

        let err = FileCounterpartDirectory::from_toml("counterparts = 3").err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}

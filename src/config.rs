//! # Configuration Management
//!
//! Loads the service configuration from multiple sources:
//! - TOML configuration file (`config.toml`)
//! - Environment variables (`APP__SECTION__KEY`)
//! - Well-known deployment variables (`HOST`, `PORT`, provider API keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known variables (`HOST`, `PORT`, `OPENAI_API_KEY`, `ELEVENLABS_API_KEY`, `JWT_SECRET`)
//! 2. Prefixed environment variables (`APP__CONVERSATION__SILENCE_THRESHOLD=0.01`)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (the `Default` impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub conversation: ConversationConfig,
    pub model: ModelConfig,
    pub synthesis: SynthesisConfig,
    pub auth: AuthConfig,
    pub directory: DirectoryConfig,
    pub persistence: PersistenceConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tuning for the realtime conversation loop.
///
/// ## Fields:
/// - `silence_threshold`: normalized RMS below which a frame counts as silence
/// - `end_of_turn_silence_ms`: silence after speech that ends the user's turn
/// - `session_open_timeout_secs`: hard limit for the model session handshake
/// - `temperature`: response randomness passed to the model (0 = deterministic)
/// - `frame_buffer_capacity`: most-recent inbound frames kept per connection
/// - `greeting_delay_ms`: settling delay before the agent introduces itself
/// - `silence_poll_interval_ms`: how often silence is re-checked between frames
/// - `idle_timeout_secs`: close the connection after this long without input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub silence_threshold: f32,
    pub end_of_turn_silence_ms: u64,
    pub session_open_timeout_secs: u64,
    pub temperature: f32,
    pub frame_buffer_capacity: usize,
    pub greeting_delay_ms: u64,
    pub silence_poll_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub default_language: String,
    /// Template with `{name}` and `{language}` placeholders
    pub greeting_instructions: String,
}

/// Realtime conversational model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub transcription_model: String,
}

/// Streaming text-to-speech endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_id: String,
    pub output_format: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub counterparts_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub chat_log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upgrades beyond this many live connections are refused with 503
    pub max_concurrent_sessions: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.005,
            end_of_turn_silence_ms: 1000,
            session_open_timeout_secs: 10,
            temperature: 0.8,
            frame_buffer_capacity: 100,
            greeting_delay_ms: 1000,
            silence_poll_interval_ms: 100,
            idle_timeout_secs: 120,
            default_language: "en".to_string(),
            greeting_instructions: "Greet the user warmly and introduce yourself as {name} in one or two short \
                sentences, then ask how they are feeling today. Speak in {language}."
                .to_string(),
        }
    }
}

impl ConversationConfig {
    pub fn end_of_turn_silence(&self) -> Duration {
        Duration::from_millis(self.end_of_turn_silence_ms)
    }

    pub fn session_open_timeout(&self) -> Duration {
        Duration::from_secs(self.session_open_timeout_secs)
    }

    pub fn greeting_delay(&self) -> Duration {
        Duration::from_millis(self.greeting_delay_ms)
    }

    pub fn silence_poll_interval(&self) -> Duration {
        Duration::from_millis(self.silence_poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Render the one-off greeting prompt for a counterpart.
    pub fn greeting_prompt(&self, display_name: &str, language: &str) -> String {
        self.greeting_instructions
            .replace("{name}", display_name)
            .replace("{language}", language)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            conversation: ConversationConfig::default(),
            model: ModelConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                api_key: String::new(),
                model: "gpt-4o-realtime-preview".to_string(),
                transcription_model: "whisper-1".to_string(),
            },
            synthesis: SynthesisConfig {
                base_url: "https://api.elevenlabs.io".to_string(),
                api_key: String::new(),
                model_id: "eleven_turbo_v2_5".to_string(),
                output_format: "pcm_16000".to_string(),
                request_timeout_secs: 30,
            },
            auth: AuthConfig {
                jwt_secret: String::new(),
            },
            directory: DirectoryConfig {
                counterparts_path: "counterparts.toml".to_string(),
            },
            persistence: PersistenceConfig {
                chat_log_path: "data/chat_turns.jsonl".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`
    /// - `APP__CONVERSATION__END_OF_TURN_SILENCE_MS=800`
    /// - `PORT=3000` (deployment platforms)
    /// - `OPENAI_API_KEY=...`, `ELEVENLABS_API_KEY=...`, `JWT_SECRET=...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore keeps snake_case keys intact: APP__MODEL__API_KEY -> model.api_key
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("OPENAI_API_KEY", "model.api_key"),
            ("ELEVENLABS_API_KEY", "synthesis.api_key"),
            ("JWT_SECRET", "auth.jwt_secret"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let conversation = &self.conversation;
        if !(conversation.silence_threshold > 0.0 && conversation.silence_threshold < 1.0) {
            return Err(anyhow::anyhow!("Silence threshold must be within (0, 1)"));
        }
        if conversation.end_of_turn_silence_ms == 0 {
            return Err(anyhow::anyhow!("End-of-turn silence must be greater than 0"));
        }
        if conversation.session_open_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Session open timeout must be greater than 0"));
        }
        if !(0.0..=2.0).contains(&conversation.temperature) {
            return Err(anyhow::anyhow!("Temperature must be within [0, 2]"));
        }
        if conversation.frame_buffer_capacity == 0 {
            return Err(anyhow::anyhow!("Frame buffer capacity must be greater than 0"));
        }
        if conversation.silence_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Silence poll interval must be greater than 0"));
        }
        if conversation.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.synthesis.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Synthesis request timeout must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }
}

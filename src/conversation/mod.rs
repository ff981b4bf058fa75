//! # Conversation Core
//!
//! Realtime voice conversation between a user and an AI counterpart.
//!
//! ## Components (leaves first):
//! - `session`: per-connection state and the process-wide [`StateStore`]
//! - `model`: duplex adapter to the conversational model
//! - `synthesis`: streaming text-to-speech adapter
//! - `protocol`: client-facing events
//! - `orchestrator`: per-connection lifecycle and barge-in state machine

pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod synthesis;

pub use model::RealtimeModelClient;
pub use orchestrator::{ConnectRequest, ConversationOrchestrator};
pub use protocol::{ClientEvent, ClientInbound, ClientOutbound, ServerEvent};
pub use session::StateStore;
pub use synthesis::StreamingSynthesisClient;

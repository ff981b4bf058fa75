//! # External Collaborators
//!
//! Contracts the conversation core consumes but does not own, each with one
//! concrete implementation suitable for a single-node deployment.
//!
//! - [`IdentityProvider`]: bearer credential → user id, user id → profile
//! - [`CounterpartDirectory`]: counterpart id → persona, voice, display name
//! - [`ChatStore`]: fire-and-forget persistence of completed turns

pub mod chat;
pub mod directory;
pub mod identity;

pub use chat::{chat_id_for, ChatStore, ChatTurn, JsonlChatStore, Speaker};
pub use directory::{Counterpart, CounterpartDirectory, FileCounterpartDirectory};
pub use identity::{IdentityProvider, JwtIdentityProvider, UserProfile};

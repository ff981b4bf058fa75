//! # Audio Module
//!
//! Signal analysis and buffering for inbound microphone audio.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;       // Bounded drop-oldest frame queue
pub mod processor;    // Volume, silence classification, concatenation

pub use buffer::FrameBuffer;
pub use processor::classify;

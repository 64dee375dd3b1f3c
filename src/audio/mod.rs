//! # Audio Processing Module
//!
//! Real-time audio handling for the duplex voice stream.
//!
//! ## Key Components:
//! - **Processor**: amplitude validation/normalization of untrusted client
//!   audio and the float32 PCM byte conversions
//! - **Frame Buffer**: adapts network chunk boundaries to the fixed frame
//!   size the model consumes
//! - **Session**: per-connection controller owning the buffer and engine,
//!   plus the registry that bounds concurrent sessions
//!
//! ## Audio Format:
//! - **Sample Rate**: 24 kHz
//! - **Encoding**: little-endian IEEE-754 float32, values in [-1.0, 1.0]
//! - **Channels**: mono, both directions

// The WebSocket handler lives in src/websocket.rs at the root level
pub mod buffer; // Frame-size accumulation
pub mod processor; // Validation, normalization, PCM byte codecs
pub mod session; // Session state and registry

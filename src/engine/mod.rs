//! # Speech Engine Module
//!
//! Streaming speech inference behind a mode-agnostic facade.
//!
//! ## Key Components:
//! - **Speech Model**: candle-based codec-LM checkpoint (encode -> step ->
//!   decode) with per-session streaming state over shared weights
//! - **Inference Facade**: the `FrameEngine` trait with real and mock
//!   implementations, selected once at startup
//! - **Engine Runtime**: process-wide capability check and per-session
//!   engine factory
//!
//! ## Degraded Operation:
//! When the checkpoint cannot be loaded (missing weights, incompatible
//! tensors, no usable device) the service stays up and answers with
//! low-amplitude placeholder audio so the transport and client pipeline can
//! still be exercised end to end.

pub mod facade;
pub mod model;

pub use facade::{EngineMode, EngineRuntime, FrameEngine};

//! # Inference Facade
//!
//! Hides the speech model behind a uniform streaming contract and keeps the
//! service answering when the model cannot be loaded.
//!
//! ## Mode Selection:
//! [`EngineRuntime::initialize`] performs one capability check at process
//! start: it attempts to load the checkpoint and warms it up. On success every
//! new session gets a [`RealEngine`] sharing the immutable weights; on any
//! failure the error is logged once and the process runs [`MockEngine`]
//! sessions for its lifetime. Both sit behind the [`FrameEngine`] trait so no
//! call site branches on the mode.

use crate::audio::processor::samples_to_bytes;
use crate::config::AppConfig;
use crate::device;
use crate::engine::model::{SpeechModel, StreamState};
use anyhow::Result;
use candle_core::Tensor;
use rand::Rng;
use std::sync::Arc;

/// Operating mode, fixed at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// The speech model loaded and serves real inference
    Real,
    /// Degraded mode producing synthetic placeholder audio
    Mock,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Real => "real",
            EngineMode::Mock => "mock",
        }
    }
}

/// Streaming contract every session engine implements.
///
/// One instance exists per session; calls arrive strictly sequentially from
/// that session's worker.
pub trait FrameEngine: Send {
    /// Which mode this engine runs in.
    fn mode(&self) -> EngineMode;

    /// Update session-level conditioning. Only the latest call is kept;
    /// frames already buffered are processed under the context that was
    /// active when they arrived.
    fn configure(&mut self, persona: &str, voice: &str) -> Result<()>;

    /// Feed one complete frame through the pipeline.
    ///
    /// The returned bytes may be empty (the model is allowed to emit nothing
    /// for a given input frame); whatever it does produce for this call is
    /// returned here in full and never attributed to another invocation.
    fn process_frame(&mut self, frame: &[f32]) -> Result<Vec<u8>>;

    /// Clear streaming state, starting a new utterance. Safe at any time,
    /// including immediately after construction.
    fn reset(&mut self) -> Result<()>;

    /// Absorb one-time initialization latency before real traffic arrives.
    /// Must not alter observable output afterwards.
    fn warmup(&mut self) -> Result<()>;

    /// Release resources. Idempotent.
    fn shutdown(&mut self);
}

/// Real inference over the shared, read-only model weights. Streaming caches
/// and conditioning are private to this session.
pub struct RealEngine {
    model: Arc<SpeechModel>,
    stream: StreamState,
    conditioning: Option<Tensor>,
    warmup_frames: usize,
}

impl RealEngine {
    pub fn new(model: Arc<SpeechModel>, warmup_frames: usize) -> Result<Self> {
        let stream = model.open_stream()?;
        Ok(Self {
            model,
            stream,
            conditioning: None,
            warmup_frames,
        })
    }
}

impl FrameEngine for RealEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Real
    }

    fn configure(&mut self, persona: &str, voice: &str) -> Result<()> {
        let prompt = self.model.encode_text_prompt(persona)?;
        let voice_embedding = self.model.load_voice_embedding(voice)?;

        let conditioning = match (prompt, voice_embedding) {
            (Some(p), Some(v)) => Some(p.add(&v)?),
            (Some(p), None) => Some(p),
            (None, Some(v)) => Some(v),
            (None, None) => None,
        };

        tracing::info!(
            "Configured persona: {:.50}..., voice: {}",
            persona,
            voice
        );
        self.conditioning = conditioning.clone();
        self.stream.conditioning = conditioning;
        Ok(())
    }

    fn process_frame(&mut self, frame: &[f32]) -> Result<Vec<u8>> {
        let mut output = Vec::new();

        for codes in self.model.encode(frame)? {
            if let Some(tokens) = self.model.step(&mut self.stream, &codes)? {
                // Channels 1..=num_codebooks are the audio stream; everything
                // else (text, input echo) is excluded before decoding
                let audio = &tokens[1..1 + self.model.num_codebooks()];
                output.extend(self.model.decode(audio)?);
            }
        }

        Ok(samples_to_bytes(&output))
    }

    fn reset(&mut self) -> Result<()> {
        self.model.reset_stream(&mut self.stream)?;
        // Conditioning is session-level, not utterance-level
        self.stream.conditioning = self.conditioning.clone();
        Ok(())
    }

    fn warmup(&mut self) -> Result<()> {
        self.model.warmup(self.warmup_frames)
    }

    fn shutdown(&mut self) {
        // The weights are shared; dropping our stream state is all there is
        self.conditioning = None;
    }
}

/// Placeholder engine that answers with low-amplitude noise, letting the full
/// pipeline (buffering, transport, client playback) run without the model.
pub struct MockEngine;

impl FrameEngine for MockEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Mock
    }

    fn configure(&mut self, persona: &str, voice: &str) -> Result<()> {
        tracing::debug!(
            "Mock engine ignoring configuration (persona: {:.50}, voice: {})",
            persona,
            voice
        );
        Ok(())
    }

    fn process_frame(&mut self, frame: &[f32]) -> Result<Vec<u8>> {
        // Same sample count as the input frame, reinterpreted as a response
        let mut rng = rand::thread_rng();
        let noise: Vec<f32> = (0..frame.len())
            .map(|_| rng.gen_range(-0.1f32..0.1f32))
            .collect();
        Ok(samples_to_bytes(&noise))
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn warmup(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Process-wide engine runtime: the one-time capability check plus the
/// factory handing each session its own engine over the shared weights.
pub struct EngineRuntime {
    mode: EngineMode,
    model: Option<Arc<SpeechModel>>,
    frame_size: usize,
    warmup_frames: usize,
    device_label: &'static str,
}

impl EngineRuntime {
    /// Run the startup capability check. Never fails: a model that cannot be
    /// loaded is logged (once, at error level) and the process serves mock
    /// audio instead.
    pub async fn initialize(config: &AppConfig) -> Self {
        let device = device::create_device_from_string(&config.model.device);
        let device_label = device::device_label(&device);

        match SpeechModel::load(&config.model, device).await {
            Ok(model) => {
                if let Err(e) = model.warmup(config.model.warmup_frames) {
                    tracing::error!("Speech model warmup failed: {}", e);
                    tracing::warn!("Falling back to mock engine");
                    return Self::mock(config.audio.frame_size);
                }

                let frame_size = model.frame_size();
                if frame_size != config.audio.frame_size {
                    tracing::info!(
                        "Codec frame size {} overrides configured {}",
                        frame_size,
                        config.audio.frame_size
                    );
                }

                tracing::info!("Speech engine ready (real mode, {})", device_label);
                Self {
                    mode: EngineMode::Real,
                    model: Some(Arc::new(model)),
                    frame_size,
                    warmup_frames: config.model.warmup_frames,
                    device_label,
                }
            }
            Err(e) => {
                tracing::error!("Failed to load speech model: {:#}", e);
                tracing::warn!("Falling back to mock engine for the process lifetime");
                Self::mock(config.audio.frame_size)
            }
        }
    }

    /// A runtime that only ever produces mock engines.
    pub fn mock(frame_size: usize) -> Self {
        Self {
            mode: EngineMode::Mock,
            model: None,
            frame_size,
            warmup_frames: 0,
            device_label: "none",
        }
    }

    /// Create the engine instance for a new session.
    pub fn create_engine(&self) -> Result<Box<dyn FrameEngine>> {
        match &self.model {
            Some(model) => Ok(Box::new(RealEngine::new(
                Arc::clone(model),
                self.warmup_frames,
            )?)),
            None => Ok(Box::new(MockEngine)),
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Samples per frame every session buffers toward.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Compute device the model runs on ("none" in mock mode).
    pub fn device_label(&self) -> &'static str {
        self.device_label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::samples_from_bytes;

    #[test]
    fn test_mock_engine_matches_input_sample_count() {
        let mut engine = MockEngine;
        let frame = vec![0.0f32; 1920];

        let bytes = engine.process_frame(&frame).unwrap();
        assert_eq!(bytes.len(), 1920 * 4);

        let samples = samples_from_bytes(&bytes).unwrap();
        for s in samples {
            assert!(s.abs() <= 0.1, "mock noise should stay low-amplitude");
        }
    }

    #[test]
    fn test_mock_engine_configure_and_reset_never_fail() {
        let mut engine = MockEngine;
        assert!(engine.configure("a helpful assistant", "NATF0").is_ok());
        assert!(engine.reset().is_ok());
        assert!(engine.warmup().is_ok());
        engine.shutdown();
        engine.shutdown();
    }

    #[test]
    fn test_mock_runtime_serves_engines() {
        let runtime = EngineRuntime::mock(1920);
        assert_eq!(runtime.mode(), EngineMode::Mock);
        assert_eq!(runtime.frame_size(), 1920);

        let mut engine = runtime.create_engine().unwrap();
        assert_eq!(engine.mode(), EngineMode::Mock);

        // Fallback availability: every call still answers
        let bytes = engine.process_frame(&vec![0.25f32; 512]).unwrap();
        assert_eq!(bytes.len(), 512 * 4);
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(EngineMode::Real.as_str(), "real");
        assert_eq!(EngineMode::Mock.as_str(), "mock");
    }
}

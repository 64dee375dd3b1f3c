//! # Session Management
//!
//! One session exists per WebSocket connection and owns everything that
//! connection streams through: the frame buffer, the inference engine
//! instance and the latest persona/voice configuration. Nothing here is
//! shared across connections; cross-talk between concurrent clients is
//! structurally impossible.
//!
//! ## Session Lifecycle:
//! 1. **Created**: connection accepted, waiting for the first message
//! 2. **Configuring / Streaming**: interleaved config and audio handling
//! 3. **Closed**: connection gone, engine resources released
//!
//! The [`SessionRegistry`] tracks lightweight per-session handles for the
//! health endpoints and enforces the concurrent session limit.

use crate::audio::buffer::FrameBuffer;
use crate::audio::processor::{samples_from_bytes, validate_and_normalize};
use crate::engine::FrameEngine;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Current position in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no message handled yet
    Created,
    /// Last message handled was a control message
    Configuring,
    /// Last message handled was audio
    Streaming,
    /// Connection ended, resources released
    Closed,
}

/// Shared, lock-free view of one session's activity, kept in the registry so
/// the health endpoints can report on live sessions without touching the
/// session itself.
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    audio_bytes_in: AtomicU64,
    audio_bytes_out: AtomicU64,
    frames_processed: AtomicU64,
    error_count: AtomicU32,
}

impl SessionInfo {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            audio_bytes_in: AtomicU64::new(0),
            audio_bytes_out: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
        }
    }

    pub fn audio_bytes_in(&self) -> u64 {
        self.audio_bytes_in.load(Ordering::Relaxed)
    }

    pub fn audio_bytes_out(&self) -> u64 {
        self.audio_bytes_out.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }
}

/// Per-connection session controller.
///
/// Owned exclusively by the connection's worker task; all methods take
/// `&mut self` and no locking is involved on the hot path.
pub struct Session {
    info: Arc<SessionInfo>,
    state: SessionState,
    buffer: FrameBuffer,
    engine: Box<dyn FrameEngine>,
    persona: Option<String>,
    voice: Option<String>,
}

impl Session {
    pub fn new(info: Arc<SessionInfo>, frame_size: usize, engine: Box<dyn FrameEngine>) -> Self {
        Self {
            info,
            state: SessionState::Created,
            buffer: FrameBuffer::new(frame_size),
            engine,
            persona: None,
            voice: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a validated config message to the engine.
    ///
    /// A failing configure is logged and swallowed: the configuration simply
    /// does not take effect, and the connection stays open.
    pub fn on_config(&mut self, persona: &str, voice: &str) {
        if self.state == SessionState::Closed {
            tracing::warn!("Ignoring config for closed session {}", self.session_id());
            return;
        }
        self.state = SessionState::Configuring;

        match self.engine.configure(persona, voice) {
            Ok(()) => {
                self.persona = Some(persona.to_string());
                self.voice = Some(voice.to_string());
            }
            Err(e) => {
                self.info.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Session {} configuration failed: {:#}",
                    self.session_id(),
                    e
                );
            }
        }
    }

    /// The hot path: decode, guard, frame and infer one audio message.
    ///
    /// Always returns a byte response (possibly empty). Every failure mode
    /// is contained here: the error is logged, the counter bumped, and the
    /// caller gets empty bytes rather than a dead connection.
    pub fn on_audio(&mut self, data: &[u8]) -> Vec<u8> {
        if self.state == SessionState::Closed {
            tracing::warn!("Ignoring audio for closed session {}", self.session_id());
            return Vec::new();
        }
        self.state = SessionState::Streaming;
        self.info
            .audio_bytes_in
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        match self.process_audio(data) {
            Ok(response) => {
                self.info
                    .audio_bytes_out
                    .fetch_add(response.len() as u64, Ordering::Relaxed);
                response
            }
            Err(e) => {
                self.info.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Session {} audio message degraded to empty response: {}",
                    self.session_id(),
                    e
                );
                Vec::new()
            }
        }
    }

    fn process_audio(&mut self, data: &[u8]) -> Result<Vec<u8>, AppError> {
        let samples = samples_from_bytes(data)?;
        let samples = validate_and_normalize(&samples);

        let mut response = Vec::new();
        for frame in self.buffer.push_and_drain(&samples) {
            let bytes = self
                .engine
                .process_frame(&frame)
                .map_err(|e| AppError::Inference(format!("{:#}", e)))?;
            self.info.frames_processed.fetch_add(1, Ordering::Relaxed);
            response.extend(bytes);
        }

        Ok(response)
    }

    /// Restart the utterance: drop buffered residue and clear engine
    /// streaming state. Frames already processed are not retracted.
    pub fn reset(&mut self) {
        self.buffer.clear();
        if let Err(e) = self.engine.reset() {
            self.info.error_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Session {} engine reset failed: {:#}", self.session_id(), e);
        }
    }

    /// Number of samples awaiting a complete frame.
    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    /// End the session and release engine resources. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.engine.shutdown();
            self.state = SessionState::Closed;
            tracing::info!(
                "Session {} closed (configured: {}, voice: {:?}, {} bytes in, {} bytes out, {} frames)",
                self.session_id(),
                self.persona.is_some(),
                self.voice,
                self.info.audio_bytes_in(),
                self.info.audio_bytes_out(),
                self.info.frames_processed()
            );
        }
    }
}

/// Registry of live sessions, keyed by session id.
///
/// Holds only the shared [`SessionInfo`] handles; the sessions themselves
/// stay exclusively owned by their connection workers.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionInfo>>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    /// Register a new session, enforcing the concurrency limit.
    pub fn register(&self) -> Result<Arc<SessionInfo>, AppError> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(AppError::ValidationError(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let info = Arc::new(SessionInfo::new(session_id.clone()));
        sessions.insert(session_id, Arc::clone(&info));
        Ok(info)
    }

    /// Remove a session when its connection ends.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().unwrap().remove(session_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Handles of all live sessions, for the metrics endpoint.
    pub fn session_infos(&self) -> Vec<Arc<SessionInfo>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Aggregate view for the health endpoints.
    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap();

        let mut total_bytes_in = 0;
        let mut total_bytes_out = 0;
        let mut total_frames = 0;
        for info in sessions.values() {
            total_bytes_in += info.audio_bytes_in();
            total_bytes_out += info.audio_bytes_out();
            total_frames += info.frames_processed();
        }

        RegistrySummary {
            active_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions,
            total_bytes_in,
            total_bytes_out,
            total_frames,
        }
    }
}

/// Aggregate registry statistics.
#[derive(Debug)]
pub struct RegistrySummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::samples_to_bytes;
    use crate::engine::EngineRuntime;

    fn mock_session(frame_size: usize) -> Session {
        let runtime = EngineRuntime::mock(frame_size);
        let info = Arc::new(SessionInfo::new("test-session".to_string()));
        Session::new(info, frame_size, runtime.create_engine().unwrap())
    }

    #[test]
    fn test_partial_frame_produces_no_output() {
        let mut session = mock_session(1920);

        // 960 samples = 3840 bytes, half a frame
        let chunk = samples_to_bytes(&vec![0.1f32; 960]);
        let response = session.on_audio(&chunk);

        assert!(response.is_empty());
        assert_eq!(session.buffered_samples(), 960);
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_config_then_two_half_frames_completes_one_frame() {
        let mut session = mock_session(1920);

        session.on_config("p", "v");
        assert_eq!(session.state(), SessionState::Configuring);

        let chunk = samples_to_bytes(&vec![0.1f32; 960]);

        let first = session.on_audio(&chunk);
        assert!(first.is_empty());
        assert_eq!(session.buffered_samples(), 960);

        // Second 960-sample message completes exactly one 1920-sample frame
        let second = session.on_audio(&chunk);
        assert_eq!(second.len(), 1920 * 4);
        assert_eq!(session.buffered_samples(), 0);
    }

    #[test]
    fn test_misaligned_audio_degrades_to_empty_response() {
        let mut session = mock_session(1920);

        let response = session.on_audio(&[1, 2, 3]);
        assert!(response.is_empty());
        assert_eq!(session.info.error_count(), 1);

        // Session still alive and processing
        let chunk = samples_to_bytes(&vec![0.1f32; 1920]);
        assert_eq!(session.on_audio(&chunk).len(), 1920 * 4);
    }

    #[test]
    fn test_nan_block_is_silenced_but_still_framed() {
        let mut session = mock_session(4);

        let mut samples = vec![0.5f32; 4];
        samples[2] = f32::NAN;
        let response = session.on_audio(&samples_to_bytes(&samples));

        // The guard turned the block into silence; the frame still went
        // through the engine and produced a response
        assert_eq!(response.len(), 4 * 4);
    }

    #[test]
    fn test_reset_clears_buffered_residue() {
        let mut session = mock_session(1920);

        session.on_audio(&samples_to_bytes(&vec![0.1f32; 960]));
        assert_eq!(session.buffered_samples(), 960);

        session.reset();
        assert_eq!(session.buffered_samples(), 0);

        // Exactly one frame of fresh samples yields exactly one frame out
        let response = session.on_audio(&samples_to_bytes(&vec![0.1f32; 1920]));
        assert_eq!(response.len(), 1920 * 4);
        assert_eq!(session.buffered_samples(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let mut session = mock_session(1920);
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        let response = session.on_audio(&samples_to_bytes(&vec![0.1f32; 1920]));
        assert!(response.is_empty());
    }

    #[test]
    fn test_registry_enforces_session_limit() {
        let registry = SessionRegistry::new(2);

        let a = registry.register().unwrap();
        let _b = registry.register().unwrap();
        assert!(registry.register().is_err());
        assert_eq!(registry.active_count(), 2);

        registry.remove(&a.session_id);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.register().is_ok());
    }

    #[test]
    fn test_registry_summary_aggregates_counters() {
        let registry = SessionRegistry::new(4);
        let info = registry.register().unwrap();

        let runtime = EngineRuntime::mock(4);
        let mut session = Session::new(Arc::clone(&info), 4, runtime.create_engine().unwrap());
        session.on_audio(&samples_to_bytes(&vec![0.1f32; 4]));

        let summary = registry.summary();
        assert_eq!(summary.active_sessions, 1);
        assert_eq!(summary.total_bytes_in, 16);
        assert_eq!(summary.total_bytes_out, 16);
        assert_eq!(summary.total_frames, 1);
    }
}

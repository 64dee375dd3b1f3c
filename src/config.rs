//! # Configuration Management
//!
//! Loads and manages application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! All tunables live in one explicit struct that is constructed once at
//! startup and handed to the components that need it (sample rate, frame
//! size, device selection) instead of being scattered across module-level
//! globals.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub model: ModelConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio stream format settings.
///
/// ## Fields:
/// - `sample_rate`: Fixed sample rate of both directions of the stream (Hz)
/// - `frame_size`: Samples per inference frame; the codec operates at 12.5
///   frames per second, so 24000 Hz / 12.5 = 1920 samples
/// - `channels`: Stream is mono end to end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub channels: u8,
}

/// Speech model configuration.
///
/// ## Fields:
/// - `repo_id`: HuggingFace repository holding the streaming checkpoint
/// - `weights_file` / `tokenizer_file`: File names inside that repository
/// - `device`: Compute device selector ("auto", "cpu", "cuda", "metal")
/// - `voice_dir`: Optional local directory of per-voice embedding files
/// - `warmup_frames`: Dummy frames run at startup to absorb first-call latency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub repo_id: String,
    pub weights_file: String,
    pub tokenizer_file: String,
    pub device: String,
    pub voice_dir: Option<String>,
    pub warmup_frames: usize,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// Each session holds its own streaming caches; raising the session limit
/// raises steady-state memory linearly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            audio: AudioConfig {
                sample_rate: 24000,
                frame_size: 1920,
                channels: 1,
            },
            model: ModelConfig {
                repo_id: "nvidia/personaplex-7b-v1".to_string(),
                weights_file: "model.safetensors".to_string(),
                tokenizer_file: "tokenizer.json".to_string(),
                device: "auto".to_string(),
                voice_dir: None,
                warmup_frames: 4,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 8,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_MODEL_DEVICE=cpu`: Force CPU inference
    /// - `HOST`/`PORT`: Deployment-platform overrides without the APP_ prefix
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these two without a prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching bad values here produces one clear startup error instead of a
    /// confusing failure deep inside the audio pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!(
                "Only mono audio is supported, got {} channels",
                self.audio.channels
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        if self.model.warmup_frames > 64 {
            return Err(anyhow::anyhow!(
                "Warmup frames should be a small bounded number, got {}",
                self.model.warmup_frames
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config endpoint).
    ///
    /// Only the fields present in the JSON are touched, so a client can send
    /// just `{"model": {"device": "cpu"}}`. Audio format fields are
    /// intentionally not updatable at runtime: live sessions size their
    /// buffers from them at accept time.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(model) = partial_config.get("model") {
            if let Some(repo) = model.get("repo_id").and_then(|v| v.as_str()) {
                self.model.repo_id = repo.to_string();
            }
            if let Some(device) = model.get("device").and_then(|v| v.as_str()) {
                self.model.device = device.to_string();
            }
            if let Some(dir) = model.get("voice_dir").and_then(|v| v.as_str()) {
                self.model.voice_dir = Some(dir.to_string());
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.audio.sample_rate, 24000);
        assert_eq!(config.audio.frame_size, 1920);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.channels = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "model": {"device": "cpu"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.model.device, "cpu");
        // Untouched fields keep their values
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.frame_size, 1920);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}

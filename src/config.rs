//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_ENGINE__MODEL, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Live vs. Restart-Only Settings:
//! Engine defaults (model, language, prompt, output format and directory),
//! storage settings and the job timeout are read per request and can be
//! changed at runtime through `PUT /api/v1/config`. Everything that shapes
//! the server or the pipeline itself is fixed at startup; see
//! [`AppConfig::restart_required`].

use crate::transcription::OutputFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each group maps to one table in `config.toml` and one concern in the
/// service: the HTTP listener, the engine invocation, the job gate, the
/// optional converter and upload storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
    pub converter: ConverterConfig,
    pub storage: StorageConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-to-text engine invocation.
///
/// ## Fields:
/// - `executable`: Engine binary, looked up on `PATH` when not absolute
/// - `model`: Whisper model name ("tiny", "base", "small", "medium", "large")
/// - `output_dir`: Directory the engine writes its output files into
/// - `output_format`: One of txt, vtt, srt, tsv, json, all
/// - `language`: Forced language code; empty lets the engine auto-detect
/// - `initial_prompt`: Vocabulary hint; empty disables it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub executable: String,
    pub model: String,
    pub output_dir: String,
    pub output_format: OutputFormat,
    pub language: String,
    pub initial_prompt: String,
}

/// Job pipeline tuning.
///
/// ## Fields:
/// - `max_concurrent_jobs`: Engine processes allowed to run at once
/// - `job_timeout_secs`: Cancel a job after this many seconds (0 = never)
///
/// ## Tuning guidelines:
/// Each whisper process loads its own copy of the model. `small` needs
/// about 2 GB of RAM per process, so keep the limit low on small hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrent_jobs: usize,
    pub job_timeout_secs: u64,
}

/// Optional conversion of uploads to 16 kHz mono WAV before transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    pub enabled: bool,
    pub executable: String,
}

/// Where uploaded audio is stored while its job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub audio_dir: String,
    pub max_upload_bytes: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            engine: EngineConfig {
                executable: "whisper".to_string(),
                model: "small".to_string(),
                output_dir: "./whisper".to_string(),
                output_format: OutputFormat::Txt,
                language: String::new(),       // Auto-detect
                initial_prompt: String::new(),
            },
            pipeline: PipelineConfig {
                max_concurrent_jobs: 1,   // One whisper process at a time
                job_timeout_secs: 0,      // No timeout
            },
            converter: ConverterConfig {
                enabled: false,
                executable: "ffmpeg".to_string(),
            },
            storage: StorageConfig {
                audio_dir: "./audio".to_string(),
                max_upload_bytes: 20 * 1024 * 1024,  // Telegram's bot download limit
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// Nested keys are separated by a double underscore so that field names
    /// may contain single underscores.
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_ENGINE__MODEL=medium`: Override whisper model
    /// - `APP_PIPELINE__MAX_CONCURRENT_JOBS=2`: Allow two engine processes
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

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
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one job may run at a time
    /// - Engine executable and model are set
    /// - Converter executable is set when conversion is enabled
    /// - Uploads may have a non-zero size
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.pipeline.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("Max concurrent jobs must be greater than 0"));
        }

        if self.engine.executable.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine executable must be set"));
        }

        if self.engine.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine model must be set"));
        }

        if self.engine.output_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine output directory must be set"));
        }

        if self.converter.enabled && self.converter.executable.trim().is_empty() {
            return Err(anyhow::anyhow!("Converter executable must be set when conversion is enabled"));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        Ok(())
    }

    /// Job timeout, if one is configured.
    pub fn job_timeout(&self) -> Option<Duration> {
        match self.pipeline.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example,
    /// `{"engine": {"language": "ru"}}` forces Russian for every later job
    /// and leaves everything else alone. Unknown keys are ignored.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(engine) = partial_config.get("engine") {
            if let Some(executable) = engine.get("executable").and_then(|v| v.as_str()) {
                self.engine.executable = executable.to_string();
            }
            if let Some(model) = engine.get("model").and_then(|v| v.as_str()) {
                self.engine.model = model.to_string();
            }
            if let Some(dir) = engine.get("output_dir").and_then(|v| v.as_str()) {
                self.engine.output_dir = dir.to_string();
            }
            if let Some(format) = engine.get("output_format").and_then(|v| v.as_str()) {
                self.engine.output_format = format.parse().map_err(anyhow::Error::msg)?;
            }
            if let Some(language) = engine.get("language").and_then(|v| v.as_str()) {
                self.engine.language = language.to_string();
            }
            if let Some(prompt) = engine.get("initial_prompt").and_then(|v| v.as_str()) {
                self.engine.initial_prompt = prompt.to_string();
            }
        }

        if let Some(pipeline) = partial_config.get("pipeline") {
            if let Some(jobs) = pipeline.get("max_concurrent_jobs").and_then(|v| v.as_u64()) {
                self.pipeline.max_concurrent_jobs = jobs as usize;
            }
            if let Some(timeout) = pipeline.get("job_timeout_secs").and_then(|v| v.as_u64()) {
                self.pipeline.job_timeout_secs = timeout;
            }
        }

        if let Some(converter) = partial_config.get("converter") {
            if let Some(enabled) = converter.get("enabled").and_then(|v| v.as_bool()) {
                self.converter.enabled = enabled;
            }
            if let Some(executable) = converter.get("executable").and_then(|v| v.as_str()) {
                self.converter.executable = executable.to_string();
            }
        }

        if let Some(storage) = partial_config.get("storage") {
            if let Some(dir) = storage.get("audio_dir").and_then(|v| v.as_str()) {
                self.storage.audio_dir = dir.to_string();
            }
            if let Some(limit) = storage.get("max_upload_bytes").and_then(|v| v.as_u64()) {
                self.storage.max_upload_bytes = limit as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Settings that differ from `running` but only take effect after a restart.
    pub fn restart_required(&self, running: &AppConfig) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.server != running.server {
            keys.push("server");
        }
        if self.engine.executable != running.engine.executable {
            keys.push("engine.executable");
        }
        if self.pipeline.max_concurrent_jobs != running.pipeline.max_concurrent_jobs {
            keys.push("pipeline.max_concurrent_jobs");
        }
        if self.converter != running.converter {
            keys.push("converter");
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.executable, "whisper");
        assert_eq!(config.engine.model, "small");
        assert_eq!(config.engine.output_format, OutputFormat::Txt);
        assert_eq!(config.pipeline.max_concurrent_jobs, 1);
        assert_eq!(config.job_timeout(), None);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.executable = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.converter.enabled = true;
        config.converter.executable = String::new();
        assert!(config.validate().is_err());
    }

    /// Test that runtime configuration updates work correctly.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"engine": {"language": "ru", "output_format": "JSON"}, "pipeline": {"job_timeout_secs": 90}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.engine.language, "ru");
        assert_eq!(config.engine.output_format, OutputFormat::Json);
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(90)));
        // Other fields should remain unchanged
        assert_eq!(config.engine.model, "small");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_bad_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"engine": {"output_format": "mp3"}}"#).is_err());
        assert!(config.update_from_json(r#"{"pipeline": {"max_concurrent_jobs": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    #[test]
    fn test_output_format_from_layered_sources_ignores_case() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .set_override("engine.output_format", "SRT")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.engine.output_format, OutputFormat::Srt);
    }

    #[test]
    fn test_restart_required() {
        let running = AppConfig::default();
        let mut updated = running.clone();
        updated.engine.model = "medium".to_string();
        assert!(updated.restart_required(&running).is_empty());

        updated.pipeline.max_concurrent_jobs = 3;
        updated.converter.enabled = true;
        assert_eq!(
            updated.restart_required(&running),
            vec!["pipeline.max_concurrent_jobs", "converter"]
        );
    }
}

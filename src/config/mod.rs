//! Runtime settings
//!
//! Settings are read from a JSON file; a missing or unreadable file falls back
//! to defaults so the runtime always starts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::inference::backend::SamplerParams;
use crate::inference::engine::EngineOptions;
use crate::inference::session::SessionConfig;
use crate::system::ThreadBudget;
use crate::types::PromptFormat;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config directory: {0}")]
    ConfigDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Settings for one runtime instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Context capacity in positions
    pub context_size: u32,
    /// Positions reserved at the end of the context
    pub overflow_headroom: u32,
    /// Tokens per decode call
    pub batch_size: u32,
    pub threads_min: u32,
    pub threads_max: u32,
    /// Cores left to the rest of the system
    pub threads_headroom: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0]
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: i32,
    /// Sampler seed; 0xFFFFFFFF lets llama.cpp pick one
    pub seed: u32,
    /// Tokens generated per reply at most
    pub max_new_tokens: u32,
    /// Directory holding dynamic ggml backends
    pub backend_path: Option<PathBuf>,
    pub format: PromptFormat,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            context_size: 256,
            overflow_headroom: 4,
            batch_size: 1,
            threads_min: 2,
            threads_max: 4,
            threads_headroom: 2,
            gpu_layers: 0,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            seed: 0xFFFF_FFFF,
            max_new_tokens: 512,
            backend_path: None,
            format: PromptFormat::default(),
        }
    }
}

impl RuntimeSettings {
    /// Validate settings values
    ///
    /// Clamps every parameter into the range the runtime accepts
    pub fn validate(&mut self) {
        if self.context_size < 8 {
            self.context_size = 256;
        }
        if self.overflow_headroom >= self.context_size {
            self.overflow_headroom = 4;
        }
        self.batch_size = self.batch_size.clamp(1, self.context_size);

        if self.threads_min == 0 {
            self.threads_min = 1;
        }
        if self.threads_max < self.threads_min {
            self.threads_max = self.threads_min;
        }

        self.temperature = self.temperature.clamp(0.0, 2.0);
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            self.top_p = 0.95;
        }
        if self.top_k <= 0 {
            self.top_k = 40;
        }
        if self.max_new_tokens == 0 {
            self.max_new_tokens = 512;
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            context_size: self.context_size,
            overflow_headroom: self.overflow_headroom,
            batch_size: self.batch_size,
            threads: ThreadBudget {
                min: self.threads_min,
                max: self.threads_max,
                headroom: self.threads_headroom,
            },
            sampler: SamplerParams {
                top_k: self.top_k,
                top_p: self.top_p,
                temperature: self.temperature,
                seed: self.seed,
            },
            format: self.format.clone(),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            backend_path: self.backend_path.clone(),
            gpu_layers: self.gpu_layers,
            session: self.session_config(),
        }
    }
}

/// Default settings file location
///
/// - Linux: `/home/{user}/.config/aichat/settings.json`
/// - macOS: `/Users/{user}/Library/Application Support/com.aichat.aichat/settings.json`
/// - Windows: `C:\Users\{user}\AppData\Roaming\aichat\aichat\config\settings.json`
pub fn default_settings_path() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "aichat", "aichat")
        .map(|dirs| dirs.config_dir().join("settings.json"))
        .ok_or_else(|| {
            ConfigError::ConfigDirError("Could not determine config directory".to_string())
        })
}

/// Resolves an explicit settings file, falling back to the default location
pub fn settings_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => default_settings_path(),
    }
}

/// Load settings from `path`, or from the default location when `None`
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: Option<&Path>) -> RuntimeSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            RuntimeSettings::default()
        }
    }
}

fn load_settings_internal(path: Option<&Path>) -> Result<RuntimeSettings, ConfigError> {
    let path = settings_path(path)?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(RuntimeSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: RuntimeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings as pretty JSON, creating parent directories as needed
pub fn save_settings(settings: &RuntimeSettings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

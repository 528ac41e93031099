use std::path::Path;

use serde::Deserialize;

use talkwire_audio::SUPPORTED_TARGET_RATES;
use talkwire_foundation::AppError;
use talkwire_transport::Endpoint;

pub const DEFAULT_TARGET_SAMPLE_RATE: u32 = 16_000;

/// Application configuration: optional TOML file, every field defaulted,
/// CLI flags layered on top by the caller. Immutable once a session
/// starts; the session snapshots it on Start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Rate the receiver will be handed, chosen from the supported set.
    pub target_sample_rate: u32,
    pub endpoint: Endpoint,
    /// Preferred input device name; host default when absent.
    pub device: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: DEFAULT_TARGET_SAMPLE_RATE,
            endpoint: Endpoint::default(),
            device: None,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file when one is given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let loaded: AppConfig = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !SUPPORTED_TARGET_RATES.contains(&self.target_sample_rate) {
            return Err(AppError::Config(format!(
                "unsupported target sample rate {} (supported: {:?})",
                self.target_sample_rate, SUPPORTED_TARGET_RATES
            )));
        }
        if self.endpoint.host.is_empty() {
            return Err(AppError::Config("endpoint host must not be empty".to_string()));
        }
        if !self.endpoint.path.starts_with('/') {
            return Err(AppError::Config(format!(
                "endpoint path must start with '/': {:?}",
                self.endpoint.path
            )));
        }
        Ok(())
    }
}

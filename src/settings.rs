use crate::camera_toolkit::{CameraFacing, DEFAULT_JPEG_QUALITY};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

// Environment variable overrides, read fresh on every load
const BASE_URL_ENV: &str = "MATHGRADE_BASE_URL";
const MODEL_ENV: &str = "MATHGRADE_MODEL";
const BACKEND_POLICY_ENV: &str = "MATHGRADE_BACKEND_POLICY";

/// How the session picks an analysis backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPolicy {
    /// Remote when a credential is stored, otherwise the local simulation.
    RemoteOrLocal,
    /// Remote only; analysis waits until a credential is provided.
    RequireCredential,
    LocalOnly,
}

impl Default for BackendPolicy {
    fn default() -> Self {
        BackendPolicy::RemoteOrLocal
    }
}

impl BackendPolicy {
    pub fn parse(value: &str) -> Option<BackendPolicy> {
        serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).ok()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    #[serde(default)]
    pub backend_policy: BackendPolicy,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub camera_facing: CameraFacing,
    #[serde(default)]
    pub camera_index: Option<u32>,
    #[serde(default)]
    pub simulation_seed: Option<u64>,
    #[serde(default = "default_simulated_latency_ms")]
    pub simulated_latency_ms: u64,
}

impl AppSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }

    /// Base URL without a trailing slash.
    pub fn effective_base_url(&self) -> String {
        self.base_url.trim().trim_end_matches('/').to_string()
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env(BASE_URL_ENV) {
            debug!("Using base URL from environment variable {}: {}", BASE_URL_ENV, url);
            self.base_url = url;
        }

        if let Some(model) = non_empty_env(MODEL_ENV) {
            debug!("Using model from environment variable {}: {}", MODEL_ENV, model);
            self.model = model;
        }

        if let Some(policy) = non_empty_env(BACKEND_POLICY_ENV) {
            match BackendPolicy::parse(&policy) {
                Some(parsed) => self.backend_policy = parsed,
                None => warn!(
                    "Ignoring invalid {} value '{}'; expected remote-or-local, require-credential or local-only",
                    BACKEND_POLICY_ENV, policy
                ),
            }
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f32 {
    0.1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

fn default_simulated_latency_ms() -> u64 {
    1500
}

pub fn get_default_settings() -> AppSettings {
    AppSettings {
        backend_policy: BackendPolicy::default(),
        base_url: default_base_url(),
        model: default_model(),
        max_tokens: default_max_tokens(),
        temperature: default_temperature(),
        connect_timeout_secs: default_connect_timeout_secs(),
        request_timeout_secs: default_request_timeout_secs(),
        jpeg_quality: default_jpeg_quality(),
        camera_facing: CameraFacing::default(),
        camera_index: None,
        simulation_seed: None,
        simulated_latency_ms: default_simulated_latency_ms(),
    }
}

/// Defaults plus environment overrides. Nothing is persisted.
pub fn load_settings() -> AppSettings {
    let mut settings = get_default_settings();
    settings.apply_env_overrides();
    settings
}

use crate::settings::{AppSettings, BackendPolicy};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "mathgrade", about = "MathGrade - photograph a math worksheet and get it graded")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Never contact the remote service; use the offline simulation
    #[arg(long, global = true, conflicts_with = "require_key")]
    pub local: bool,

    /// Ask for an API key instead of falling back to the simulation
    #[arg(long, global = true)]
    pub require_key: bool,

    /// Use this API key for this run only (not stored)
    #[arg(long, global = true, env = "MATHGRADE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Print the result as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug mode with verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// OpenAI-compatible API base URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Vision model name
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Camera index, overriding facing-based selection
    #[arg(long, global = true)]
    pub camera: Option<u32>,

    /// Seed for the offline simulation
    #[arg(long, global = true)]
    pub seed: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Grade an image file
    Grade {
        /// Path to a photo or scan of the worksheet
        path: PathBuf,
    },
    /// Grade a photo taken with the camera
    Capture,
    /// Manage the stored API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum KeyAction {
    /// Store a key (read from stdin when omitted)
    Set { value: Option<String> },
    /// Show whether a key is stored
    Status,
    /// Remove the stored key
    Clear,
    /// Verify the stored key against the service
    Check,
}

impl CliArgs {
    /// Flags win over environment and defaults.
    pub fn apply_to(&self, settings: &mut AppSettings) {
        if self.local {
            settings.backend_policy = BackendPolicy::LocalOnly;
        } else if self.require_key {
            settings.backend_policy = BackendPolicy::RequireCredential;
        }
        if let Some(url) = &self.base_url {
            settings.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if self.camera.is_some() {
            settings.camera_index = self.camera;
        }
        if self.seed.is_some() {
            settings.simulation_seed = self.seed;
        }
    }
}

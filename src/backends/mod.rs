//! Analysis backends.
//!
//! A backend turns an [`EncodedImage`] into a raw, untyped response string. The
//! set of backends is closed: [`AnalysisBackend`] is either the remote scoring
//! service or the local simulation, and which one runs is decided by
//! [`select_backend`] from credential presence and the configured policy.

pub mod local;
pub mod remote;

use crate::camera_toolkit::EncodedImage;
use crate::settings::{AppSettings, BackendPolicy};
use serde::Serialize;

pub use local::LocalSimulatedBackend;
pub use remote::RemoteScoringBackend;

/// Backend output before normalization. May be prose wrapping a JSON object.
pub type RawResponse = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisErrorKind {
    Unauthenticated,
    NetworkFailure,
    BackendRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("No API key configured for the remote analysis service")]
    Unauthenticated,
    #[error("Network error while contacting the analysis service: {0}")]
    NetworkFailure(String),
    #[error("Analysis service rejected the request: {0}")]
    BackendRejected(String),
}

impl AnalysisError {
    pub fn kind(&self) -> AnalysisErrorKind {
        match self {
            AnalysisError::Unauthenticated => AnalysisErrorKind::Unauthenticated,
            AnalysisError::NetworkFailure(_) => AnalysisErrorKind::NetworkFailure,
            AnalysisError::BackendRejected(_) => AnalysisErrorKind::BackendRejected,
        }
    }
}

/// Which variant the selection policy picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Remote,
    Local,
    /// Policy requires a credential that is not there yet.
    CredentialRequired,
}

/// Pure selection rule; no I/O.
pub fn select_backend(credential_present: bool, policy: BackendPolicy) -> BackendChoice {
    match (policy, credential_present) {
        (BackendPolicy::LocalOnly, _) => BackendChoice::Local,
        (_, true) => BackendChoice::Remote,
        (BackendPolicy::RemoteOrLocal, false) => BackendChoice::Local,
        (BackendPolicy::RequireCredential, false) => BackendChoice::CredentialRequired,
    }
}

pub enum AnalysisBackend {
    Remote(RemoteScoringBackend),
    Local(LocalSimulatedBackend),
}

impl AnalysisBackend {
    /// Build the backend for `choice`. `CredentialRequired` yields `None`.
    pub fn build(
        choice: BackendChoice,
        credential: Option<String>,
        settings: &AppSettings,
    ) -> Option<AnalysisBackend> {
        match choice {
            BackendChoice::Remote => Some(AnalysisBackend::Remote(
                RemoteScoringBackend::from_settings(credential, settings),
            )),
            BackendChoice::Local => Some(AnalysisBackend::Local(
                LocalSimulatedBackend::from_settings(settings),
            )),
            BackendChoice::CredentialRequired => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnalysisBackend::Remote(_) => "remote",
            AnalysisBackend::Local(_) => "local",
        }
    }

    pub async fn analyze(&self, image: &EncodedImage) -> Result<RawResponse, AnalysisError> {
        match self {
            AnalysisBackend::Remote(backend) => backend.analyze(image).await,
            AnalysisBackend::Local(backend) => backend.analyze(image).await,
        }
    }
}

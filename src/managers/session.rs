//! Session controller.
//!
//! Owns the single [`Session`] and runs the commands the state machine emits
//! against the capture device manager, the credential store and a backend.
//!
//! # Dependency Injection for Testing
//!
//! The camera device and credential store are generic so tests can use mocks.

use super::camera::{CaptureDeviceManager, CaptureOptions};
use crate::analysis_types::AnalysisResult;
use crate::backends::remote::store_verified_key;
use crate::backends::{select_backend, AnalysisBackend, AnalysisError, BackendChoice};
use crate::camera_toolkit::{CameraDevice, DeviceError, EncodedImage};
use crate::keyring::{CredentialError, CredentialStore};
use crate::normalizer::normalize;
use crate::session_state::{
    transition, Session, SessionCommand, SessionEvent, SessionPhase, SessionSnapshot,
    TransitionError,
};
use crate::settings::AppSettings;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl SessionError {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionError::Transition(TransitionError::Busy))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzeOutcome {
    Presented(AnalysisResult),
    /// Policy needs a credential first. The image is still held.
    CredentialRequired,
    /// The session moved on (closed) before the backend answered.
    Discarded,
}

/// Work left over after the device commands have run.
#[derive(Default)]
struct Pending {
    analysis: Option<(u64, EncodedImage)>,
    credential_prompt: bool,
    device_error: Option<DeviceError>,
}

pub struct SessionController<D: CameraDevice, S: CredentialStore> {
    session: Mutex<Session>,
    camera: CaptureDeviceManager<D>,
    credentials: S,
    settings: AppSettings,
}

impl<D: CameraDevice, S: CredentialStore> SessionController<D, S> {
    pub fn new(device: D, credentials: S, settings: AppSettings) -> Self {
        let options = CaptureOptions {
            facing: settings.camera_facing,
            jpeg_quality: settings.jpeg_quality,
        };
        Self {
            session: Mutex::new(Session::default()),
            camera: CaptureDeviceManager::new(device, options),
            credentials,
            settings,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock_session().snapshot()
    }

    /// Verifies `value` against the remote service before storing it.
    pub async fn set_credential(&self, value: &str) -> Result<(), CredentialError> {
        store_verified_key(&self.credentials, value, &self.settings).await
    }

    /* ---------- capture ----------------------------------------------------- */

    pub fn start_live_capture(&self) -> Result<(), SessionError> {
        self.drive(SessionEvent::StartCapture).map(|_| ())
    }

    /// Snapshot the live stream and return the still now held by the session.
    pub fn capture_frame(&self) -> Result<EncodedImage, SessionError> {
        self.drive(SessionEvent::TakeFrame)?;
        self.lock_session()
            .image
            .clone()
            .ok_or(SessionError::Device(DeviceError::InvalidHandle))
    }

    pub fn import_file(&self, bytes: Vec<u8>, mime_type: &str) -> Result<(), SessionError> {
        let image = self.camera.import_from_file(bytes, mime_type)?;
        self.drive(SessionEvent::ImageImported(image)).map(|_| ())
    }

    pub async fn import_from_path(&self, path: &Path) -> Result<(), SessionError> {
        let image = self.camera.import_from_path(path).await?;
        self.drive(SessionEvent::ImageImported(image)).map(|_| ())
    }

    pub fn retake(&self) -> Result<(), SessionError> {
        self.drive(SessionEvent::Retake).map(|_| ())
    }

    /// Reopen the camera from wherever the session stands, clearing a
    /// retryable failure first.
    pub fn restart_capture(&self) -> Result<(), SessionError> {
        if self.snapshot().phase == SessionPhase::Failed {
            self.retry()?;
        }
        match self.snapshot().phase {
            SessionPhase::Idle => self.start_live_capture(),
            SessionPhase::Capturing => Ok(()),
            _ => self.retake(),
        }
    }

    /* ---------- analysis ---------------------------------------------------- */

    pub async fn analyze(&self) -> Result<AnalyzeOutcome, SessionError> {
        let credential = self.credentials.get();
        let choice = select_backend(credential.is_some(), self.settings.backend_policy);

        let pending = self.drive(SessionEvent::Analyze {
            credential_required: choice == BackendChoice::CredentialRequired,
        })?;
        if pending.credential_prompt {
            info!("Analysis deferred until a credential is stored");
            return Ok(AnalyzeOutcome::CredentialRequired);
        }
        let Some((operation_id, image)) = pending.analysis else {
            return Ok(AnalyzeOutcome::Discarded);
        };
        let Some(backend) = AnalysisBackend::build(choice, credential, &self.settings) else {
            return Ok(AnalyzeOutcome::CredentialRequired);
        };

        info!(
            "Starting analysis {} with {} backend ({} bytes)",
            operation_id,
            backend.name(),
            image.len()
        );

        // No lock is held while the backend runs.
        let outcome = backend.analyze(&image).await;

        if !self.is_current(operation_id) {
            debug!(
                "Discarding result of analysis {}: session moved on",
                operation_id
            );
            return Ok(AnalyzeOutcome::Discarded);
        }

        match outcome {
            Ok(raw) => {
                let result = normalize(&raw);
                self.drive(SessionEvent::AnalysisSucceeded {
                    operation_id,
                    result: result.clone(),
                })?;
                info!(
                    "Analysis {} finished: {}/{} correct, grade {}",
                    operation_id, result.correct_answers, result.total_questions, result.grade
                );
                Ok(AnalyzeOutcome::Presented(result))
            }
            Err(error) => {
                warn!("Analysis {} failed: {}", operation_id, error);
                self.drive(SessionEvent::AnalysisFailed {
                    operation_id,
                    error: error.clone(),
                })?;
                Err(SessionError::Analysis(error))
            }
        }
    }

    pub fn retry(&self) -> Result<(), SessionError> {
        self.drive(SessionEvent::Retry).map(|_| ())
    }

    /// Always succeeds. Releases any open stream and invalidates a running analysis.
    pub fn close(&self) {
        if let Err(e) = self.drive(SessionEvent::Close) {
            warn!("Error while closing session: {}", e);
        }
        info!("Session closed");
    }

    /* ---------- internals --------------------------------------------------- */

    fn is_current(&self, operation_id: u64) -> bool {
        self.lock_session().operation_id == operation_id
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, event: SessionEvent) -> Result<Vec<SessionCommand>, TransitionError> {
        let mut session = self.lock_session();
        let event_name = event.name();
        let from = session.phase;
        let (next, commands) = transition(&session, event)?;
        if next.phase != from {
            debug!("Session {} -> {} on {}", from, next.phase, event_name);
        }
        *session = next;
        Ok(commands)
    }

    /// Apply `event` and run the device commands it produces until the queue
    /// drains. Analysis and credential prompts are handed back to the caller.
    fn drive(&self, event: SessionEvent) -> Result<Pending, SessionError> {
        let mut pending = Pending::default();
        let mut events = VecDeque::from([event]);

        while let Some(event) = events.pop_front() {
            for command in self.apply(event)? {
                match command {
                    SessionCommand::OpenDevice => match self.camera.start_live_capture() {
                        Ok(handle) => events.push_back(SessionEvent::DeviceOpened(handle)),
                        Err(e) => {
                            warn!("Failed to open camera: {}", e);
                            events.push_back(SessionEvent::DeviceFailed(e.clone()));
                            pending.device_error = Some(e);
                        }
                    },
                    SessionCommand::CaptureFrame(handle) => {
                        match self.camera.capture_frame(handle) {
                            Ok(image) => events.push_back(SessionEvent::FrameCaptured(image)),
                            Err(e) => {
                                warn!("Failed to capture frame: {}", e);
                                events.push_back(SessionEvent::CaptureFailed(e.clone()));
                                pending.device_error = Some(e);
                            }
                        }
                    }
                    SessionCommand::ReleaseStream(handle) => self.camera.release_stream(handle),
                    SessionCommand::RunAnalysis {
                        operation_id,
                        image,
                    } => pending.analysis = Some((operation_id, image)),
                    SessionCommand::PromptCredential => pending.credential_prompt = true,
                }
            }
        }

        match pending.device_error.take() {
            Some(e) => Err(SessionError::Device(e)),
            None => Ok(pending),
        }
    }
}

//! Grading session lifecycle.
//!
//! [`transition`] is pure: it takes the current [`Session`] and an event and
//! returns the next session plus the side effects to run. The controller in
//! `managers::session` owns the session and executes the commands.

use crate::analysis_types::AnalysisResult;
use crate::backends::AnalysisError;
use crate::camera_toolkit::{DeviceError, EncodedImage};
use crate::managers::camera::StreamHandle;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Capturing,
    Captured,
    Analyzing,
    Presenting,
    Failed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Capturing => "capturing",
            SessionPhase::Captured => "captured",
            SessionPhase::Analyzing => "analyzing",
            SessionPhase::Presenting => "presenting",
            SessionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DeviceUnavailable,
    InvalidHandle,
    UnsupportedFormat,
    Unauthenticated,
    NetworkFailure,
    BackendRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDescriptor {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl FailureDescriptor {
    pub fn from_device(error: &DeviceError) -> Self {
        let kind = match error {
            DeviceError::DeviceUnavailable(_) => FailureKind::DeviceUnavailable,
            DeviceError::InvalidHandle => FailureKind::InvalidHandle,
            DeviceError::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
        };
        Self {
            kind,
            message: error.to_string(),
            retryable: kind != FailureKind::InvalidHandle,
        }
    }

    pub fn from_analysis(error: &AnalysisError) -> Self {
        let kind = match error {
            AnalysisError::Unauthenticated => FailureKind::Unauthenticated,
            AnalysisError::NetworkFailure(_) => FailureKind::NetworkFailure,
            AnalysisError::BackendRejected(_) => FailureKind::BackendRejected,
        };
        Self {
            kind,
            message: error.to_string(),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub phase: SessionPhase,
    pub image: Option<EncodedImage>,
    pub result: Option<AnalysisResult>,
    pub stream: Option<StreamHandle>,
    pub failure: Option<FailureDescriptor>,
    /// Bumped on every analysis start and on close. Results carrying an older
    /// id are stale.
    pub operation_id: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            image: None,
            result: None,
            stream: None,
            failure: None,
            operation_id: 0,
        }
    }
}

/// Read-only view for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub has_image: bool,
    pub streaming: bool,
    pub result: Option<AnalysisResult>,
    pub failure: Option<FailureDescriptor>,
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            has_image: self.image.is_some(),
            streaming: self.stream.is_some(),
            result: self.result.clone(),
            failure: self.failure.clone(),
        }
    }

    fn idle_after(&self) -> Session {
        Session {
            operation_id: self.operation_id + 1,
            ..Session::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StartCapture,
    DeviceOpened(StreamHandle),
    DeviceFailed(DeviceError),
    TakeFrame,
    FrameCaptured(EncodedImage),
    CaptureFailed(DeviceError),
    ImageImported(EncodedImage),
    Retake,
    /// `credential_required` is set when the backend policy wants a credential
    /// that is not stored yet.
    Analyze { credential_required: bool },
    AnalysisSucceeded {
        operation_id: u64,
        result: AnalysisResult,
    },
    AnalysisFailed {
        operation_id: u64,
        error: AnalysisError,
    },
    Retry,
    Close,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StartCapture => "start-capture",
            SessionEvent::DeviceOpened(_) => "device-opened",
            SessionEvent::DeviceFailed(_) => "device-failed",
            SessionEvent::TakeFrame => "take-frame",
            SessionEvent::FrameCaptured(_) => "frame-captured",
            SessionEvent::CaptureFailed(_) => "capture-failed",
            SessionEvent::ImageImported(_) => "image-imported",
            SessionEvent::Retake => "retake",
            SessionEvent::Analyze { .. } => "analyze",
            SessionEvent::AnalysisSucceeded { .. } => "analysis-succeeded",
            SessionEvent::AnalysisFailed { .. } => "analysis-failed",
            SessionEvent::Retry => "retry",
            SessionEvent::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    OpenDevice,
    CaptureFrame(StreamHandle),
    ReleaseStream(StreamHandle),
    RunAnalysis {
        operation_id: u64,
        image: EncodedImage,
    },
    PromptCredential,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Cannot {event} while {phase}")]
    InvalidTransition {
        phase: SessionPhase,
        event: &'static str,
    },
    #[error("An analysis is already running")]
    Busy,
}

pub type Transition = (Session, Vec<SessionCommand>);

pub fn transition(session: &Session, event: SessionEvent) -> Result<Transition, TransitionError> {
    use SessionPhase::*;

    let invalid = |event: &SessionEvent| TransitionError::InvalidTransition {
        phase: session.phase,
        event: event.name(),
    };

    match event {
        SessionEvent::Close => {
            let commands = session
                .stream
                .map(SessionCommand::ReleaseStream)
                .into_iter()
                .collect();
            Ok((session.idle_after(), commands))
        }

        SessionEvent::StartCapture if session.phase == Idle => Ok((
            Session {
                phase: Capturing,
                failure: None,
                ..session.clone()
            },
            vec![SessionCommand::OpenDevice],
        )),

        SessionEvent::DeviceOpened(handle) => {
            if session.phase == Capturing && session.stream.is_none() {
                Ok((
                    Session {
                        stream: Some(handle),
                        ..session.clone()
                    },
                    Vec::new(),
                ))
            } else {
                // Nobody is waiting for this stream any more.
                Ok((session.clone(), vec![SessionCommand::ReleaseStream(handle)]))
            }
        }

        SessionEvent::DeviceFailed(error) if session.phase == Capturing => Ok((
            Session {
                phase: Idle,
                image: None,
                stream: None,
                failure: Some(FailureDescriptor::from_device(&error)),
                ..session.clone()
            },
            Vec::new(),
        )),

        SessionEvent::TakeFrame if session.phase == Capturing => match session.stream {
            Some(handle) => Ok((session.clone(), vec![SessionCommand::CaptureFrame(handle)])),
            None => Err(TransitionError::InvalidTransition {
                phase: session.phase,
                event: "take-frame without a stream",
            }),
        },

        SessionEvent::FrameCaptured(image) if session.phase == Capturing => {
            Ok(captured_with(session, image))
        }

        SessionEvent::CaptureFailed(error) if session.phase == Capturing => Ok((
            Session {
                phase: Failed,
                stream: None,
                failure: Some(FailureDescriptor::from_device(&error)),
                ..session.clone()
            },
            session
                .stream
                .map(SessionCommand::ReleaseStream)
                .into_iter()
                .collect(),
        )),

        SessionEvent::ImageImported(image) => match session.phase {
            Idle | Capturing | Captured => Ok(captured_with(session, image)),
            Failed if session.failure.as_ref().map_or(true, |f| f.retryable) => {
                Ok(captured_with(session, image))
            }
            _ => Err(invalid(&SessionEvent::ImageImported(image))),
        },

        SessionEvent::Retake if matches!(session.phase, Captured | Presenting) => Ok((
            Session {
                phase: Capturing,
                image: None,
                result: None,
                failure: None,
                ..session.clone()
            },
            vec![SessionCommand::OpenDevice],
        )),

        SessionEvent::Analyze { .. } if session.phase == Analyzing => Err(TransitionError::Busy),

        SessionEvent::Analyze {
            credential_required,
        } if session.phase == Captured => {
            let Some(image) = session.image.clone() else {
                return Err(TransitionError::InvalidTransition {
                    phase: session.phase,
                    event: "analyze without an image",
                });
            };
            if credential_required {
                return Ok((session.clone(), vec![SessionCommand::PromptCredential]));
            }
            let operation_id = session.operation_id + 1;
            Ok((
                Session {
                    phase: Analyzing,
                    result: None,
                    failure: None,
                    operation_id,
                    ..session.clone()
                },
                vec![SessionCommand::RunAnalysis {
                    operation_id,
                    image,
                }],
            ))
        }

        SessionEvent::AnalysisSucceeded {
            operation_id,
            result,
        } => {
            if !is_current(session, operation_id) {
                return Ok((session.clone(), Vec::new()));
            }
            Ok((
                Session {
                    phase: Presenting,
                    result: Some(result),
                    ..session.clone()
                },
                Vec::new(),
            ))
        }

        SessionEvent::AnalysisFailed {
            operation_id,
            error,
        } => {
            if !is_current(session, operation_id) {
                return Ok((session.clone(), Vec::new()));
            }
            Ok((
                Session {
                    phase: Failed,
                    failure: Some(FailureDescriptor::from_analysis(&error)),
                    ..session.clone()
                },
                Vec::new(),
            ))
        }

        SessionEvent::Retry if session.phase == Failed => {
            let retryable = session.failure.as_ref().map_or(false, |f| f.retryable);
            if !retryable {
                return Err(invalid(&SessionEvent::Retry));
            }
            // Without a held image there is nothing to re-analyze; start over.
            let phase = if session.image.is_some() { Captured } else { Idle };
            Ok((
                Session {
                    phase,
                    failure: None,
                    ..session.clone()
                },
                Vec::new(),
            ))
        }

        other => Err(invalid(&other)),
    }
}

fn is_current(session: &Session, operation_id: u64) -> bool {
    session.phase == SessionPhase::Analyzing && session.operation_id == operation_id
}

fn captured_with(session: &Session, image: EncodedImage) -> Transition {
    let commands = session
        .stream
        .map(SessionCommand::ReleaseStream)
        .into_iter()
        .collect();
    (
        Session {
            phase: SessionPhase::Captured,
            image: Some(image),
            result: None,
            stream: None,
            failure: None,
            ..session.clone()
        },
        commands,
    )
}

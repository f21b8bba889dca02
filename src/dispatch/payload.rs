//! Typed notification payloads.
//!
//! Inbound params are validated exactly once, here.  Everything downstream
//! works with [`Event`] and never pokes at raw JSON.  Optional fields are
//! `Option`s; nothing is assumed present.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rpc::ErrorKind;
use crate::session::{AppState, ModelStatus, Progress, SidecarStatus};

// ---------------------------------------------------------------------------
// Canonical notification names
// ---------------------------------------------------------------------------

pub const STATE_CHANGED: &str = "state:changed";
pub const AUDIO_LEVEL: &str = "audio:level";
pub const TRANSCRIPT_COMPLETE: &str = "transcript:complete";
pub const TRANSCRIPT_ERROR: &str = "transcript:error";
pub const MODEL_PROGRESS: &str = "model:progress";
pub const RECORDING_STATUS: &str = "recording:status";
pub const SIDECAR_STATUS: &str = "sidecar:status";

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Model information attached to a status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub status: Option<ModelStatus>,
}

/// `state:changed`: The worker's own view of what it is doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub state: AppState,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub model: Option<ModelInfo>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    Meter,
    Recording,
}

/// `audio:level`: Input meter reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioLevel {
    pub source: AudioSource,
    pub rms: f32,
    pub peak: f32,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `transcript:complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptComplete {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default, alias = "duration")]
    pub duration_ms: Option<u64>,
}

/// `transcript:error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFailure {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(alias = "error_kind")]
    pub kind: ErrorKind,
    pub message: String,
}

/// `model:progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProgress {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(flatten)]
    pub status: ModelStatus,
}

/// `recording:status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStatus {
    #[serde(default)]
    pub session_id: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A validated notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(StatusChanged),
    AudioLevel(AudioLevel),
    TranscriptComplete(TranscriptComplete),
    TranscriptError(TranscriptFailure),
    ModelProgress(ModelProgress),
    RecordingStatus(RecordingStatus),
    /// Host-originated: worker supervisor status.
    SidecarStatus(SidecarStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("unknown notification {0}")]
    UnknownMethod(String),
    #[error("invalid {method} payload: {reason}")]
    Invalid { method: String, reason: String },
}

fn decode<T: DeserializeOwned>(method: &str, params: Option<&Value>) -> Result<T, PayloadError> {
    let value = params.cloned().unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| PayloadError::Invalid {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

impl Event {
    /// Validate `params` for the canonical `method`.
    pub fn parse(method: &str, params: Option<&Value>) -> Result<Self, PayloadError> {
        let event = match method {
            STATE_CHANGED => Event::StateChanged(decode(method, params)?),
            AUDIO_LEVEL => Event::AudioLevel(decode(method, params)?),
            TRANSCRIPT_COMPLETE => Event::TranscriptComplete(decode(method, params)?),
            TRANSCRIPT_ERROR => Event::TranscriptError(decode(method, params)?),
            MODEL_PROGRESS => Event::ModelProgress(decode(method, params)?),
            RECORDING_STATUS => Event::RecordingStatus(decode(method, params)?),
            SIDECAR_STATUS => Event::SidecarStatus(decode(method, params)?),
            other => return Err(PayloadError::UnknownMethod(other.to_string())),
        };
        Ok(event)
    }

    /// Canonical method name of this event.
    pub fn method(&self) -> &'static str {
        match self {
            Event::StateChanged(_) => STATE_CHANGED,
            Event::AudioLevel(_) => AUDIO_LEVEL,
            Event::TranscriptComplete(_) => TRANSCRIPT_COMPLETE,
            Event::TranscriptError(_) => TRANSCRIPT_ERROR,
            Event::ModelProgress(_) => MODEL_PROGRESS,
            Event::RecordingStatus(_) => RECORDING_STATUS,
            Event::SidecarStatus(_) => SIDECAR_STATUS,
        }
    }

    /// Session the event is tagged with, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::StateChanged(e) => e.session_id.as_deref(),
            Event::AudioLevel(e) => e.session_id.as_deref(),
            Event::TranscriptComplete(e) => Some(e.session_id.as_str()),
            Event::TranscriptError(e) => e.session_id.as_deref(),
            Event::RecordingStatus(e) => e.session_id.as_deref(),
            Event::ModelProgress(_) | Event::SidecarStatus(_) => None,
        }
    }
}

/// The optional per-stream `seq` in `params`.
pub fn extract_seq(params: Option<&Value>) -> Option<i64> {
    params.and_then(|p| p.get("seq")).and_then(Value::as_i64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

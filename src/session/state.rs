//! Application, worker and model status types.
//!
//! [`AppState`] drives the session state machine.  [`SidecarStatus`] and
//! [`ModelStatus`] are reported alongside it as parallel pieces of status;
//! they never override a recording in progress.
//!
//! [`StatusSnapshot`] is everything a UI needs to render one frame.

use serde::{Deserialize, Serialize};

use super::id::SessionId;

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// States of the record → transcribe cycle.
///
/// ```text
/// Idle ──start_recording (acked)──▶ Recording
///      ──stop_recording (acked)──▶ Transcribing
///                                   ──transcript:complete──▶ Idle
/// Recording ──cancel_recording──▶ Idle
/// Idle ◀──▶ LoadingModel          (model readiness gating)
/// any state ──fatal failure──▶ Error ──acknowledge──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    Idle,
    Recording,
    Transcribing,
    LoadingModel,
    Error,
}

impl AppState {
    /// `true` while a record → transcribe cycle owns the state machine.
    ///
    /// ```
    /// use voice_sidecar::session::AppState;
    ///
    /// assert!(AppState::Recording.is_busy());
    /// assert!(AppState::Transcribing.is_busy());
    /// assert!(!AppState::LoadingModel.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        matches!(self, AppState::Recording | AppState::Transcribing)
    }

    /// A short human-readable label suitable for a status bar.
    pub fn label(&self) -> &'static str {
        match self {
            AppState::Idle => "Idle",
            AppState::Recording => "Recording",
            AppState::Transcribing => "Transcribing",
            AppState::LoadingModel => "Loading model",
            AppState::Error => "Error",
        }
    }
}

// ---------------------------------------------------------------------------
// SidecarStatus
// ---------------------------------------------------------------------------

/// Lifecycle of the worker process as seen by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarState {
    Starting,
    Ready,
    Restarting,
    /// Circuit breaker tripped; only a manual restart leaves this state.
    Failed,
    /// Deliberate shutdown.
    Stopped,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarStatus {
    pub state: SidecarState,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub message: Option<String>,
}

impl SidecarStatus {
    pub fn new(state: SidecarState, restart_count: u32) -> Self {
        Self {
            state,
            restart_count,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ModelStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Missing,
    Downloading,
    Verifying,
    Ready,
    Error,
}

fn default_unit() -> String {
    "bytes".into()
}

/// Progress of a long-running step.  `total` is unknown for some sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

impl Progress {
    /// Completion in `0.0..=1.0`, `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.current as f64 / total as f64).min(1.0)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    #[serde(alias = "state")]
    pub status: ModelState,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ModelStatus {
    pub fn ready() -> Self {
        Self {
            status: ModelState::Ready,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ModelState::Error,
            progress: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// One consistent view of everything the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: AppState,
    /// `false` = paused.  The underlying state keeps tracking the truth.
    pub enabled: bool,
    pub detail: Option<String>,
    pub session_id: Option<SessionId>,
    pub model: ModelStatus,
    pub sidecar: SidecarStatus,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: AppState::Idle,
            enabled: true,
            detail: None,
            session_id: None,
            model: ModelStatus::default(),
            sidecar: SidecarStatus::default(),
        }
    }
}

impl StatusSnapshot {
    /// What to show: "Paused" whenever disabled, otherwise the state label.
    pub fn display_label(&self) -> &'static str {
        if self.enabled {
            self.state.label()
        } else {
            "Paused"
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

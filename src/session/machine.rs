//! Session state machine.
//!
//! [`SessionMachine`] owns the canonical [`StatusSnapshot`], the active
//! session slot and the transcript history.  It is driven from two sides:
//!
//! ```text
//! local commands ──▶ start / stop / cancel / initialize ──▶ RpcCaller
//! dispatcher     ──▶ handle(&Delivery)                    (already deduped
//!                                                          and session-filtered)
//!                         │
//!                         ▼
//!                 broadcast<HostEvent>  ──▶ UI
//! ```
//!
//! Commands transition only after the worker acks (never optimistically),
//! except `cancel_recording`, which retires the session before the call so
//! late results become no-ops.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::dispatch::{
    AudioLevel, Delivery, Dispatcher, Event, HandlerId, ModelProgress, RecordingStatus,
    StatusChanged, StreamKey, TranscriptComplete, TranscriptFailure,
};
use crate::rpc::methods::{ASR_INITIALIZE, RECORDING_CANCEL, RECORDING_START, RECORDING_STOP};
use crate::rpc::{ErrorKind, RpcCaller, RpcError};

use super::id::{ActiveSession, Session, SessionId};
use super::state::{
    AppState, ModelState, ModelStatus, SidecarState, SidecarStatus, StatusSnapshot,
};

/// Default number of transcripts kept in memory.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("cannot {op} while {}", from.label())]
    InvalidTransition { op: &'static str, from: AppState },

    #[error("paused")]
    Paused,

    #[error("{0} already in progress")]
    Busy(&'static str),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Rpc(e) => e.kind,
            _ => ErrorKind::NotReady,
        }
    }
}

// ---------------------------------------------------------------------------
// HostEvent / TranscriptEntry
// ---------------------------------------------------------------------------

/// One finished transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub session_id: SessionId,
    pub text: String,
    pub confidence: Option<f32>,
    pub duration_ms: Option<u64>,
    pub received_at: SystemTime,
}

/// What the UI subscribes to.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Status(StatusSnapshot),
    Transcript(TranscriptEntry),
    AudioLevel(AudioLevel),
    Recording(RecordingStatus),
}

// ---------------------------------------------------------------------------
// SessionMachine
// ---------------------------------------------------------------------------

struct Inner {
    snapshot: StatusSnapshot,
    history: VecDeque<TranscriptEntry>,
    /// Command currently awaiting its ack.
    in_flight: Option<&'static str>,
    /// Params and result of the last successful engine initialize.
    initialized: Option<(Value, Value)>,
}

pub struct SessionMachine {
    rpc: Arc<dyn RpcCaller>,
    active: ActiveSession,
    inner: Mutex<Inner>,
    events: broadcast::Sender<HostEvent>,
    history_limit: usize,
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("snapshot", &self.snapshot())
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

/// Clears `in_flight` when the command finishes or its future is dropped.
struct CommandGuard<'a> {
    machine: &'a SessionMachine,
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.machine.lock().in_flight = None;
    }
}

impl SessionMachine {
    /// `active` must be the same handle the dispatcher filters with.
    pub fn new(rpc: Arc<dyn RpcCaller>, active: ActiveSession, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            rpc,
            active,
            inner: Mutex::new(Inner {
                snapshot: StatusSnapshot::default(),
                history: VecDeque::new(),
                in_flight: None,
                initialized: None,
            }),
            events,
            history_limit: history_limit.max(1),
        }
    }

    /// Subscribe to every stream on `dispatcher`.
    pub fn register(self: &Arc<Self>, dispatcher: &Dispatcher) -> Vec<HandlerId> {
        StreamKey::ALL
            .iter()
            .map(|stream| {
                let machine = Arc::clone(self);
                dispatcher.on(*stream, move |delivery| {
                    machine.handle(delivery);
                    Ok(())
                })
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn state(&self) -> AppState {
        self.lock().snapshot.state
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<TranscriptEntry> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn active_session(&self) -> &ActiveSession {
        &self.active
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        let _ = self.events.send(HostEvent::Status(inner.snapshot.clone()));
    }

    fn set_state(&self, inner: &mut Inner, state: AppState, detail: Option<String>) {
        if inner.snapshot.state != state {
            log::info!(
                "session: {} → {}",
                inner.snapshot.state.label(),
                state.label()
            );
        }
        inner.snapshot.state = state;
        inner.snapshot.detail = detail;
        self.publish(inner);
    }

    /// Move to `error`, retiring whatever session was active.
    fn enter_error(&self, inner: &mut Inner, detail: String) {
        log::warn!("session: error: {detail}");
        self.active.clear();
        inner.snapshot.session_id = None;
        self.set_state(inner, AppState::Error, Some(detail));
    }

    fn begin_command(
        &self,
        op: &'static str,
        required: AppState,
        needs_enabled: bool,
    ) -> Result<CommandGuard<'_>, SessionError> {
        let mut inner = self.lock();
        if needs_enabled && !inner.snapshot.enabled {
            return Err(SessionError::Paused);
        }
        if inner.snapshot.state != required {
            return Err(SessionError::InvalidTransition {
                op,
                from: inner.snapshot.state,
            });
        }
        if let Some(other) = inner.in_flight {
            return Err(SessionError::Busy(other));
        }
        inner.in_flight = Some(op);
        Ok(CommandGuard { machine: self })
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Idle → Recording, once the worker acks `recording.start`.
    pub async fn start_recording(&self) -> Result<SessionId, SessionError> {
        let _guard = self.begin_command("start_recording", AppState::Idle, true)?;

        let session = Session::new();
        let id = session.id.clone();
        // Active before the call so the worker's first tagged events pass.
        self.active.begin(session);

        let result = self
            .rpc
            .call(RECORDING_START, Some(json!({ "session_id": id })))
            .await;

        let from = {
            let mut inner = self.lock();
            match result {
                Ok(_)
                    if inner.snapshot.state == AppState::Idle
                        && self.active.is_active(id.as_str()) =>
                {
                    inner.snapshot.session_id = Some(id.clone());
                    self.set_state(&mut inner, AppState::Recording, None);
                    return Ok(id);
                }
                Ok(_) => {
                    // Something else (worker restart, model load) won the race.
                    self.active.retire(&id);
                    inner.snapshot.state
                }
                Err(e) => {
                    self.active.retire(&id);
                    self.enter_error(&mut inner, format!("could not start recording: {e}"));
                    return Err(e.into());
                }
            }
        };

        // The worker acked, so it may be capturing for a session we dropped.
        if let Err(e) = self
            .rpc
            .call(RECORDING_CANCEL, Some(json!({ "session_id": id })))
            .await
        {
            log::warn!("session: could not cancel abandoned recording {id}: {e}");
        }
        Err(SessionError::InvalidTransition {
            op: "start_recording",
            from,
        })
    }

    /// Recording → Transcribing on the quick ack of `recording.stop`.
    pub async fn stop_recording(&self) -> Result<(), SessionError> {
        let _guard = self.begin_command("stop_recording", AppState::Recording, false)?;
        let Some(id) = self.active.current_id() else {
            return Err(SessionError::InvalidTransition {
                op: "stop_recording",
                from: AppState::Recording,
            });
        };

        let result = self
            .rpc
            .call(RECORDING_STOP, Some(json!({ "session_id": id })))
            .await;

        let mut inner = self.lock();
        match result {
            Ok(_) => {
                // A cancel or an early completion may have landed meanwhile.
                if inner.snapshot.state == AppState::Recording && self.active.is_active(id.as_str())
                {
                    self.set_state(&mut inner, AppState::Transcribing, None);
                }
                Ok(())
            }
            Err(e) => {
                if self.active.is_active(id.as_str()) {
                    self.enter_error(&mut inner, format!("could not stop recording: {e}"));
                }
                Err(e.into())
            }
        }
    }

    /// Recording → Idle.  The session is retired before the call goes out.
    pub async fn cancel_recording(&self) -> Result<(), SessionError> {
        let id = {
            let mut inner = self.lock();
            if inner.snapshot.state != AppState::Recording {
                return Err(SessionError::InvalidTransition {
                    op: "cancel_recording",
                    from: inner.snapshot.state,
                });
            }
            let id = self.active.clear().map(|s| s.id);
            inner.snapshot.session_id = None;
            self.set_state(&mut inner, AppState::Idle, None);
            id
        };

        let params = id.map(|id| json!({ "session_id": id }));
        if let Err(e) = self.rpc.call(RECORDING_CANCEL, params).await {
            log::warn!("session: cancel not acknowledged: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    /// Error → Idle.
    pub fn acknowledge_error(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.snapshot.state != AppState::Error {
            return Err(SessionError::InvalidTransition {
                op: "acknowledge_error",
                from: inner.snapshot.state,
            });
        }
        self.set_state(&mut inner, AppState::Idle, None);
        Ok(())
    }

    /// Pause or resume.  The underlying state is left alone.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        if inner.snapshot.enabled != enabled {
            inner.snapshot.enabled = enabled;
            log::info!("session: {}", if enabled { "resumed" } else { "paused" });
            self.publish(&inner);
        }
    }

    /// Drive the machine to `error` from outside (fatal timeout, breaker).
    pub fn fail(&self, detail: impl Into<String>) {
        let mut inner = self.lock();
        self.enter_error(&mut inner, detail.into());
    }

    /// Initialise the recognition engine.
    ///
    /// Repeats with params identical to the last successful call return the
    /// remembered result without touching the worker.
    pub async fn initialize_model(&self, params: Value) -> Result<Value, SessionError> {
        let cached = self
            .lock()
            .initialized
            .as_ref()
            .filter(|(last, _)| *last == params)
            .map(|(_, result)| result.clone());
        if let Some(result) = cached {
            log::debug!("session: engine already initialised with these params");
            return Ok(result);
        }

        let _guard = self.begin_command("initialize_model", AppState::Idle, false)?;
        {
            let mut inner = self.lock();
            inner.snapshot.model = ModelStatus {
                status: ModelState::Verifying,
                ..ModelStatus::default()
            };
            self.set_state(&mut inner, AppState::LoadingModel, None);
        }

        let result = self.rpc.call(ASR_INITIALIZE, Some(params.clone())).await;

        let mut inner = self.lock();
        match result {
            Ok(value) => {
                inner.snapshot.model = ModelStatus::ready();
                inner.initialized = Some((params, value.clone()));
                if inner.snapshot.state == AppState::LoadingModel {
                    self.set_state(&mut inner, AppState::Idle, None);
                } else {
                    self.publish(&inner);
                }
                Ok(value)
            }
            Err(e) => {
                inner.snapshot.model = ModelStatus::failed(e.message.clone());
                inner.initialized = None;
                let detail = if e.is_fatal_timeout() {
                    "engine initialisation timed out; restart required".to_string()
                } else {
                    format!("engine initialisation failed: {e}")
                };
                self.enter_error(&mut inner, detail);
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Apply one dispatched notification.
    pub fn handle(&self, delivery: &Delivery) {
        match &delivery.event {
            Event::TranscriptComplete(t) => self.on_transcript(t),
            Event::TranscriptError(e) => self.on_transcript_error(e),
            Event::StateChanged(s) => self.on_state_changed(s),
            Event::ModelProgress(m) => self.on_model_progress(m),
            Event::SidecarStatus(s) => self.on_sidecar(s),
            Event::AudioLevel(level) => {
                let _ = self.events.send(HostEvent::AudioLevel(level.clone()));
            }
            Event::RecordingStatus(status) => {
                let _ = self.events.send(HostEvent::Recording(status.clone()));
            }
        }
    }

    fn on_transcript(&self, t: &TranscriptComplete) {
        let mut inner = self.lock();
        if !inner.snapshot.state.is_busy() || !self.active.is_active(&t.session_id) {
            log::debug!("session: ignoring transcript for {}", t.session_id);
            return;
        }

        let entry = TranscriptEntry {
            session_id: SessionId::from(t.session_id.as_str()),
            text: t.text.clone(),
            confidence: t.confidence,
            duration_ms: t.duration_ms,
            received_at: SystemTime::now(),
        };
        inner.history.push_back(entry.clone());
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }

        self.active.retire(&entry.session_id);
        inner.snapshot.session_id = None;
        self.set_state(&mut inner, AppState::Idle, None);
        let _ = self.events.send(HostEvent::Transcript(entry));
    }

    fn on_transcript_error(&self, e: &TranscriptFailure) {
        let mut inner = self.lock();
        let ours = match &e.session_id {
            Some(id) => self.active.is_active(id),
            None => inner.snapshot.state.is_busy(),
        };
        if !ours {
            log::debug!("session: ignoring transcript error {}", e.kind);
            return;
        }
        self.enter_error(&mut inner, format!("{}: {}", e.kind, e.message));
    }

    fn on_state_changed(&self, s: &StatusChanged) {
        let mut inner = self.lock();
        if let Some(status) = s.model.as_ref().and_then(|m| m.status.clone()) {
            inner.snapshot.model = status;
        }
        let current = inner.snapshot.state;
        match (current, s.state) {
            (AppState::Idle, AppState::LoadingModel) | (AppState::LoadingModel, AppState::Idle) => {
                self.set_state(&mut inner, s.state, s.detail.clone());
            }
            (_, AppState::Error) if current != AppState::Error => {
                let detail = s
                    .detail
                    .clone()
                    .unwrap_or_else(|| "worker reported an error".into());
                self.enter_error(&mut inner, detail);
            }
            // Recording/transcribing are host-driven; everything else is
            // reported as parallel status only.
            _ => self.publish(&inner),
        }
    }

    fn on_model_progress(&self, m: &ModelProgress) {
        let mut inner = self.lock();
        inner.snapshot.model = m.status.clone();
        match (inner.snapshot.state, m.status.status) {
            (AppState::Idle, ModelState::Downloading | ModelState::Verifying) => {
                self.set_state(&mut inner, AppState::LoadingModel, None);
            }
            (AppState::LoadingModel, ModelState::Ready | ModelState::Missing) => {
                self.set_state(&mut inner, AppState::Idle, None);
            }
            (AppState::LoadingModel, ModelState::Error) => {
                let detail = m
                    .status
                    .error
                    .clone()
                    .unwrap_or_else(|| "model failed to load".into());
                self.enter_error(&mut inner, detail);
            }
            _ => self.publish(&inner),
        }
    }

    fn on_sidecar(&self, s: &SidecarStatus) {
        let mut inner = self.lock();
        inner.snapshot.sidecar = s.clone();
        if matches!(
            s.state,
            SidecarState::Restarting | SidecarState::Failed | SidecarState::Stopped
        ) {
            // A new worker has no engine loaded.
            inner.initialized = None;
            if inner.snapshot.model.status == ModelState::Ready {
                inner.snapshot.model = ModelStatus::default();
            }
        }
        let state = inner.snapshot.state;
        match s.state {
            SidecarState::Failed if state != AppState::Error => {
                let detail = s
                    .message
                    .clone()
                    .unwrap_or_else(|| "worker failed; restart required".into());
                self.enter_error(&mut inner, detail);
            }
            SidecarState::Restarting if state.is_busy() || state == AppState::LoadingModel => {
                self.enter_error(&mut inner, format!("worker restarted during {}", state.label()));
            }
            _ => self.publish(&inner),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

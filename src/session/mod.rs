//! Session lifecycle: application state, session identity and the state
//! machine tying commands and notifications together.

pub mod id;
pub mod machine;
pub mod state;

pub use id::{ActiveSession, Session, SessionId};
pub use machine::{HostEvent, SessionError, SessionMachine, TranscriptEntry, DEFAULT_HISTORY_LIMIT};
pub use state::{
    AppState, ModelState, ModelStatus, Progress, SidecarState, SidecarStatus, StatusSnapshot,
};

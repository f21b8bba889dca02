//! JSON-RPC substrate between the host and the worker process.
//!
//! # Layers
//!
//! ```text
//! RpcCaller (trait) ◀── SessionMachine, Supervisor health probe
//!      │
//! Correlator ── pending table, ids, timeouts, retries, flush
//!      │
//! FrameWriter / FrameReader ── NDJSON over the worker's stdio (1 MiB lines)
//! ```
//!
//! * [`error`]: `ErrorKind` taxonomy and `RpcError`.
//! * [`message`]: request/response/notification envelopes.
//! * [`methods`]: static per-method timeout/retry/fatal policy.
//! * [`transport`]: line framing.
//! * [`correlator`]: request/response matching.

pub mod correlator;
pub mod error;
pub mod message;
pub mod methods;
pub mod transport;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use correlator::{Correlator, PendingInfo, RpcCaller, RpcEvent};
pub use error::{ErrorKind, RpcError};
pub use message::{InvalidMessage, Message, Notification, Request, RequestId, Response};
pub use methods::{CallPolicy, MethodSpec, MethodTable, CATALOG};
pub use transport::{
    framed, FrameReader, FrameWriter, TransportError, TransportEvent, MAX_LINE_BYTES,
};

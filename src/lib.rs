//! Host side of a local speech-to-text worker.
//!
//! The host launches the worker as a child process, talks JSON-RPC 2.0 to it
//! over NDJSON on stdio, keeps it alive, and turns its notifications into a
//! single session state machine a UI can render.
//!
//! * [`config`]: settings file, paths, per-method overrides.
//! * [`rpc`]: framing, envelopes, request correlation.
//! * [`dispatch`]: notification validation, dedup and session filtering.
//! * [`session`]: the record → transcribe state machine.
//! * [`supervisor`]: worker lifecycle, health probes, restarts.
//! * [`artifact`]: verified model downloads.
//! * [`host`]: wires everything together.

pub mod artifact;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod rpc;
pub mod session;
pub mod supervisor;

//! Error taxonomy shared by both sides of the pipe.
//!
//! Every error that crosses the RPC boundary carries an [`ErrorKind`].  The
//! numeric JSON-RPC `code` is kept for wire compatibility, but callers should
//! branch on `kind`.
//!
//! | Code            | Kind                   |
//! |-----------------|------------------------|
//! | -32700          | `E_INTERNAL` (parse)   |
//! | -32600 / -32602 | `E_INVALID_PARAMS`     |
//! | -32601          | `E_METHOD_NOT_FOUND`   |
//! | -32603          | `E_INTERNAL`           |
//! | -32001 … -32009 | one application kind each |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Standard JSON-RPC codes
// ---------------------------------------------------------------------------

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Inclusive bounds of the code range either side may legally send.
const CODE_MIN: i64 = -32700;
const CODE_MAX: i64 = -32000;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable error classification carried by every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "E_METHOD_NOT_FOUND")]
    MethodNotFound,
    #[serde(rename = "E_INVALID_PARAMS")]
    InvalidParams,
    #[serde(rename = "E_NOT_READY")]
    NotReady,
    #[serde(rename = "E_MIC_PERMISSION")]
    MicPermission,
    #[serde(rename = "E_DEVICE_NOT_FOUND")]
    DeviceNotFound,
    #[serde(rename = "E_AUDIO_IO")]
    AudioIo,
    #[serde(rename = "E_NETWORK")]
    Network,
    #[serde(rename = "E_DISK_FULL")]
    DiskFull,
    #[serde(rename = "E_CACHE_CORRUPT")]
    CacheCorrupt,
    #[serde(rename = "E_MODEL_LOAD")]
    ModelLoad,
    #[serde(rename = "E_TRANSCRIBE")]
    Transcribe,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorKind {
    /// The wire name, e.g. `"E_NOT_READY"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MethodNotFound => "E_METHOD_NOT_FOUND",
            ErrorKind::InvalidParams => "E_INVALID_PARAMS",
            ErrorKind::NotReady => "E_NOT_READY",
            ErrorKind::MicPermission => "E_MIC_PERMISSION",
            ErrorKind::DeviceNotFound => "E_DEVICE_NOT_FOUND",
            ErrorKind::AudioIo => "E_AUDIO_IO",
            ErrorKind::Network => "E_NETWORK",
            ErrorKind::DiskFull => "E_DISK_FULL",
            ErrorKind::CacheCorrupt => "E_CACHE_CORRUPT",
            ErrorKind::ModelLoad => "E_MODEL_LOAD",
            ErrorKind::Transcribe => "E_TRANSCRIBE",
            ErrorKind::Internal => "E_INTERNAL",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_wire(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    /// The code this kind is sent with.
    pub fn code(&self) -> i64 {
        match self {
            ErrorKind::MethodNotFound => METHOD_NOT_FOUND,
            ErrorKind::InvalidParams => INVALID_PARAMS,
            ErrorKind::Internal => INTERNAL_ERROR,
            ErrorKind::NotReady => -32001,
            ErrorKind::MicPermission => -32002,
            ErrorKind::DeviceNotFound => -32003,
            ErrorKind::AudioIo => -32004,
            ErrorKind::Network => -32005,
            ErrorKind::DiskFull => -32006,
            ErrorKind::CacheCorrupt => -32007,
            ErrorKind::ModelLoad => -32008,
            ErrorKind::Transcribe => -32009,
        }
    }

    /// Map a received code onto a kind.  `None` for codes in the legal range
    /// that have no binding (e.g. -32010).
    pub fn from_code(code: i64) -> Option<Self> {
        let kind = match code {
            PARSE_ERROR | INTERNAL_ERROR => ErrorKind::Internal,
            INVALID_REQUEST | INVALID_PARAMS => ErrorKind::InvalidParams,
            METHOD_NOT_FOUND => ErrorKind::MethodNotFound,
            -32001 => ErrorKind::NotReady,
            -32002 => ErrorKind::MicPermission,
            -32003 => ErrorKind::DeviceNotFound,
            -32004 => ErrorKind::AudioIo,
            -32005 => ErrorKind::Network,
            -32006 => ErrorKind::DiskFull,
            -32007 => ErrorKind::CacheCorrupt,
            -32008 => ErrorKind::ModelLoad,
            -32009 => ErrorKind::Transcribe,
            _ => return None,
        };
        Some(kind)
    }

    /// Errors the user has to act on (permissions, hardware, disk).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            ErrorKind::MicPermission | ErrorKind::DeviceNotFound | ErrorKind::DiskFull
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

/// An error returned by an RPC call, either received from the worker or
/// synthesised locally (timeout, connection reset).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub kind: ErrorKind,
    pub details: Option<Value>,
}

impl RpcError {
    /// Build an error of the given kind with its canonical code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            kind,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Pending request abandoned because the worker went away.
    pub fn connection_reset() -> Self {
        Self::new(ErrorKind::Internal, "connection reset")
    }

    /// The call did not complete after `attempts` sends.
    pub fn timeout(method: &str, attempts: u32, fatal: bool) -> Self {
        Self::new(
            ErrorKind::NotReady,
            format!("{method} timed out after {attempts} attempt(s)"),
        )
        .with_details(json!({
            "reason": "timeout",
            "method": method,
            "attempts": attempts,
            "fatal": fatal,
        }))
    }

    /// No worker is attached right now.
    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotReady, "worker not connected")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("method not found: {method}"))
    }

    fn detail_flag(&self, key: &str) -> Option<&Value> {
        self.details.as_ref().and_then(|d| d.get(key))
    }

    /// `true` for locally synthesised timeout errors.
    pub fn is_timeout(&self) -> bool {
        self.detail_flag("reason").and_then(Value::as_str) == Some("timeout")
    }

    /// `true` for a timeout of a fatal-on-timeout method.
    pub fn is_fatal_timeout(&self) -> bool {
        self.is_timeout() && self.detail_flag("fatal").and_then(Value::as_bool) == Some(true)
    }

    /// Parse the `error` member of a response.
    ///
    /// An explicit `kind` (top-level or under `data`) wins over the code
    /// mapping.  A code outside -32700..-32000 is a protocol violation and
    /// comes back as `E_INTERNAL` with the offending code in `details`.
    pub fn from_wire(value: &Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let data = value.get("data").cloned();
        let explicit_kind = value
            .get("kind")
            .or_else(|| data.as_ref().and_then(|d| d.get("kind")))
            .and_then(Value::as_str)
            .and_then(ErrorKind::from_wire);

        let Some(code) = code.filter(|c| (CODE_MIN..=CODE_MAX).contains(c)) else {
            log::warn!("rpc: error code {code:?} outside the JSON-RPC range ({message})");
            return Self::new(ErrorKind::Internal, format!("protocol violation: {message}"))
                .with_details(json!({ "code": code, "data": data }));
        };

        let kind = explicit_kind
            .or_else(|| ErrorKind::from_code(code))
            .unwrap_or(ErrorKind::Internal);
        let details = data.and_then(|d| match d.get("details") {
            Some(inner) => Some(inner.clone()),
            None if d.get("kind").is_some() => None,
            None => Some(d),
        });

        Self {
            code,
            message,
            kind,
            details,
        }
    }

    /// Serialise as the `error` member of a response.
    pub fn to_wire(&self) -> Value {
        let mut data = json!({ "kind": self.kind });
        if let Some(details) = &self.details {
            data["details"] = details.clone();
        }
        json!({
            "code": self.code,
            "message": self.message,
            "kind": self.kind,
            "data": data,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorKind; 12] = [
        ErrorKind::MethodNotFound,
        ErrorKind::InvalidParams,
        ErrorKind::NotReady,
        ErrorKind::MicPermission,
        ErrorKind::DeviceNotFound,
        ErrorKind::AudioIo,
        ErrorKind::Network,
        ErrorKind::DiskFull,
        ErrorKind::CacheCorrupt,
        ErrorKind::ModelLoad,
        ErrorKind::Transcribe,
        ErrorKind::Internal,
    ];

    #[test]
    fn every_kind_has_a_code_in_range() {
        for kind in ALL {
            let code = kind.code();
            assert!((CODE_MIN..=CODE_MAX).contains(&code), "{kind} -> {code}");
            assert_eq!(ErrorKind::from_code(code), Some(kind));
        }
    }

    #[test]
    fn wire_names_match_serde() {
        for kind in ALL {
            assert_eq!(ErrorKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_wire("E_BOGUS"), None);
    }

    #[test]
    fn from_wire_uses_code_when_kind_absent() {
        let err = RpcError::from_wire(&json!({ "code": -32006, "message": "disk" }));
        assert_eq!(err.kind, ErrorKind::DiskFull);
        assert_eq!(err.message, "disk");
        assert!(err.details.is_none());
    }

    #[test]
    fn explicit_kind_wins_over_code() {
        let err = RpcError::from_wire(&json!({
            "code": -32603,
            "message": "no mic",
            "data": { "kind": "E_MIC_PERMISSION", "details": { "device": "default" } }
        }));
        assert_eq!(err.kind, ErrorKind::MicPermission);
        assert_eq!(err.details, Some(json!({ "device": "default" })));
    }

    #[test]
    fn out_of_range_code_is_protocol_violation() {
        let err = RpcError::from_wire(&json!({ "code": 42, "message": "huh" }));
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("protocol violation"));
        assert_eq!(err.details.unwrap()["code"], json!(42));
    }

    #[test]
    fn wire_round_trip_keeps_kind_and_details() {
        let original = RpcError::new(ErrorKind::ModelLoad, "bad weights")
            .with_details(json!({ "model": "base" }));
        let parsed = RpcError::from_wire(&original.to_wire());
        assert_eq!(parsed, original);
    }

    #[test]
    fn timeout_flags() {
        let normal = RpcError::timeout("system.ping", 2, false);
        assert!(normal.is_timeout());
        assert!(!normal.is_fatal_timeout());
        assert_eq!(normal.kind, ErrorKind::NotReady);

        let fatal = RpcError::timeout("asr.initialize", 1, true);
        assert!(fatal.is_fatal_timeout());
        assert!(!RpcError::connection_reset().is_timeout());
    }
}

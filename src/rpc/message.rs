//! JSON-RPC 2.0 envelopes.
//!
//! Inbound lines arrive as untyped [`serde_json::Value`]s; [`Message::classify`]
//! is the single place where they are sorted into requests, responses and
//! notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::RpcError;

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// A request id: string or integer, unique among currently pending requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::Text(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => json!(n),
            RequestId::Text(s) => json!(s),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// The `params` object, or an empty map when absent or not an object.
    pub fn params_object(&self) -> Map<String, Value> {
        match &self.params {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// A classified inbound or outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Why a line could not be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidMessage {
    NotAnObject,
    BadId,
    MissingResult,
    NoMethodOrId,
}

impl fmt::Display for InvalidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidMessage::NotAnObject => "message is not a JSON object",
            InvalidMessage::BadId => "id must be a string or integer",
            InvalidMessage::MissingResult => "response has neither result nor error",
            InvalidMessage::NoMethodOrId => "message has neither method nor id",
        };
        f.write_str(text)
    }
}

impl Message {
    /// Sort a parsed JSON value into a message shape.
    pub fn classify(value: Value) -> Result<Self, InvalidMessage> {
        let Value::Object(mut obj) = value else {
            return Err(InvalidMessage::NotAnObject);
        };

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(RequestId::from_value(raw).ok_or(InvalidMessage::BadId)?),
        };
        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = obj.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Message::Request(Request { id, method, params })),
            (None, Some(method)) => Ok(Message::Notification(Notification { method, params })),
            (Some(id), None) => {
                let error = obj.remove("error").filter(|e| !e.is_null());
                let outcome = if let Some(error) = error {
                    Err(RpcError::from_wire(&error))
                } else if let Some(result) = obj.remove("result") {
                    Ok(result)
                } else {
                    return Err(InvalidMessage::MissingResult);
                };
                Ok(Message::Response(Response { id, outcome }))
            }
            (None, None) => Err(InvalidMessage::NoMethodOrId),
        }
    }

    /// Serialise as a JSON-RPC 2.0 object.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(req) => {
                let mut v = json!({ "jsonrpc": "2.0", "id": req.id.to_value(), "method": req.method });
                if let Some(params) = &req.params {
                    v["params"] = params.clone();
                }
                v
            }
            Message::Response(resp) => {
                let mut v = json!({ "jsonrpc": "2.0", "id": resp.id.to_value() });
                match &resp.outcome {
                    Ok(result) => v["result"] = result.clone(),
                    Err(err) => v["error"] = err.to_wire(),
                }
                v
            }
            Message::Notification(note) => {
                let mut v = json!({ "jsonrpc": "2.0", "method": note.method });
                if let Some(params) = &note.params {
                    v["params"] = params.clone();
                }
                v
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error::ErrorKind;

    #[test]
    fn classifies_request() {
        let msg = Message::classify(json!({"jsonrpc":"2.0","id":7,"method":"system.ping"})).unwrap();
        assert_eq!(
            msg,
            Message::Request(Request {
                id: RequestId::Number(7),
                method: "system.ping".into(),
                params: None,
            })
        );
    }

    #[test]
    fn classifies_notification_without_id() {
        let msg = Message::classify(json!({"method":"state:changed","params":{"state":"idle"}})).unwrap();
        let Message::Notification(note) = msg else {
            panic!("expected notification");
        };
        assert_eq!(note.method, "state:changed");
        assert_eq!(note.params_object()["state"], json!("idle"));
    }

    #[test]
    fn null_id_is_a_notification() {
        let msg = Message::classify(json!({"id":null,"method":"audio:level"})).unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn classifies_success_and_error_responses() {
        let ok = Message::classify(json!({"id":"a","result":{"ok":true}})).unwrap();
        let Message::Response(resp) = ok else { panic!() };
        assert_eq!(resp.id, RequestId::Text("a".into()));
        assert_eq!(resp.outcome, Ok(json!({"ok":true})));

        let err = Message::classify(json!({"id":3,"error":{"code":-32003,"message":"gone"}})).unwrap();
        let Message::Response(resp) = err else { panic!() };
        assert_eq!(resp.outcome.unwrap_err().kind, ErrorKind::DeviceNotFound);
    }

    #[test]
    fn null_result_is_still_a_result() {
        let msg = Message::classify(json!({"id":1,"result":null})).unwrap();
        let Message::Response(resp) = msg else { panic!() };
        assert_eq!(resp.outcome, Ok(Value::Null));
    }

    #[test]
    fn rejects_invalid_shapes() {
        assert_eq!(Message::classify(json!([1, 2])), Err(InvalidMessage::NotAnObject));
        assert_eq!(Message::classify(json!({"id":1.5,"result":1})), Err(InvalidMessage::BadId));
        assert_eq!(Message::classify(json!({"id":1})), Err(InvalidMessage::MissingResult));
        assert_eq!(Message::classify(json!({"foo":1})), Err(InvalidMessage::NoMethodOrId));
    }

    #[test]
    fn request_serialises_with_version_tag() {
        let v = Message::Request(Request {
            id: RequestId::Number(1),
            method: "recording.start".into(),
            params: Some(json!({"session_id":"s"})),
        })
        .to_value();
        assert_eq!(v["jsonrpc"], json!("2.0"));
        assert_eq!(v["id"], json!(1));
        assert_eq!(v["params"]["session_id"], json!("s"));
    }
}

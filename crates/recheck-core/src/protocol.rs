//! Request/response envelopes and their line encoding.
//!
//! Requests travel from a client (agent or pool) to the executing side;
//! responses travel back. A response is exactly one of a terminal result,
//! a non-terminal push (log line), or an error.

use crate::diagnostics::{Diagnostics, Parameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Version tag written into every request envelope.
pub const PROTOCOL_VERSION: &str = "2.0+push";

/// Identifier correlating a response with the request that caused it.
pub type RequestId = u64;

/// Errors raised while encoding or decoding protocol documents.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line could not be decoded as a protocol document.
    #[error("Malformed message {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// A line is not valid UTF-8.
    #[error("Message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A document could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The request kinds understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Check,
    Cancel,
    Ping,
}

impl Method {
    /// Whether a request of this kind expects a reply (and therefore carries an id).
    pub fn expects_reply(self) -> bool {
        !matches!(self, Method::Cancel)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Check => f.write_str("check"),
            Method::Cancel => f.write_str("cancel"),
            Method::Ping => f.write_str("ping"),
        }
    }
}

/// Parameters of a `check` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckParams {
    pub source: String,
    pub flags: String,
    #[serde(default)]
    pub params: Parameters,
}

/// Parameters of a `cancel` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: Method,
    pub params: Value,
}

impl Request {
    /// Build an envelope from raw parts. `id` should be `None` exactly for notifications.
    pub fn new(id: Option<RequestId>, method: Method, params: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id,
            method,
            params,
        }
    }

    /// Decode the `check` parameters of this request.
    pub fn check_params(&self) -> Result<CheckParams, serde_json::Error> {
        CheckParams::deserialize(&self.params)
    }

    /// Decode the `cancel` parameters of this request.
    pub fn cancel_params(&self) -> Result<CancelParams, serde_json::Error> {
        CancelParams::deserialize(&self.params)
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        decode_line(line)
    }
}

/// Terminal response carrying the task's diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub id: RequestId,
    pub result: Diagnostics,
}

/// Non-terminal response carrying one log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub id: RequestId,
    pub message: String,
}

/// Error payload of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Error response, optionally tied to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub error: RpcError,
}

/// Any response. Fields outside the chosen shape (such as `jsonrpc`) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Result(ResultResponse),
    Push(PushResponse),
    Error(ErrorResponse),
}

impl Response {
    pub fn result(id: RequestId, result: Diagnostics) -> Self {
        Response::Result(ResultResponse { id, result })
    }

    pub fn push(id: RequestId, message: impl Into<String>) -> Self {
        Response::Push(PushResponse {
            id,
            message: message.into(),
        })
    }

    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            id,
            error: RpcError {
                code,
                message: message.into(),
            },
        })
    }

    /// The request id this response refers to, if any.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Response::Result(r) => Some(r.id),
            Response::Push(p) => Some(p.id),
            Response::Error(e) => e.id,
        }
    }

    /// Whether this response closes its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Push(_))
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        decode_line(line)
    }
}

/// Task message sent to a pool worker.
///
/// Workers reply with `Response::Push` and `Response::Result` documents
/// carrying the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: RequestId,
    pub source: String,
    pub flags: String,
    #[serde(default)]
    pub params: Parameters,
}

impl TaskMessage {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        decode_line(line)
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    Ok(json)
}

fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
    let line = line.trim();
    serde_json::from_str(line).map_err(|source| ProtocolError::Malformed {
        line: line.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cancel_is_a_notification() {
        let params = serde_json::to_value(CancelParams { id: 7 }).unwrap();
        let line = Request::new(None, Method::Cancel, params).to_line().unwrap();
        assert!(line.ends_with('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "cancel");
        assert_eq!(value["params"]["id"], 7);
        assert_eq!(value["jsonrpc"], PROTOCOL_VERSION);
    }

    #[test]
    fn test_check_request_params() {
        let params = CheckParams {
            source: "^(a+)+$".to_string(),
            flags: "i".to_string(),
            params: Parameters::default(),
        };
        let request = Request::new(Some(3), Method::Check, serde_json::to_value(&params).unwrap());
        assert_eq!(request.id, Some(3));
        assert!(request.method.expects_reply());

        let parsed = Request::from_line(&request.to_line().unwrap()).unwrap();
        assert_eq!(parsed.method, Method::Check);
        assert_eq!(parsed.check_params().unwrap(), params);
    }

    #[test]
    fn test_response_shapes() {
        let result = Response::from_line(r#"{"jsonrpc":"2.0+push","id":1,"result":{"status":"safe"}}"#)
            .unwrap();
        assert!(matches!(result, Response::Result(ref r) if r.id == 1));
        assert!(result.is_terminal());

        let push = Response::from_line(r#"{"id":1,"message":"step"}"#).unwrap();
        assert_eq!(push, Response::push(1, "step"));
        assert!(!push.is_terminal());

        let error =
            Response::from_line(r#"{"jsonrpc":"2.0+push","error":{"code":-32600,"message":"bad"}}"#)
                .unwrap();
        assert_eq!(error.id(), None);
        assert!(error.is_terminal());
    }

    #[test]
    fn test_null_result_is_a_result() {
        let ping = Response::from_line(r#"{"id":0,"result":null}"#).unwrap();
        match ping {
            Response::Result(r) => assert_eq!(r.result.as_value(), &Value::Null),
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_line() {
        let err = Response::from_line(r#"{"id":1,"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));

        // Valid JSON that matches no response shape is malformed too.
        let err = Response::from_line(r#"{"id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_worker_reply_has_no_version_tag() {
        let line = Response::result(4, Diagnostics::from(json!({"status": "safe"})))
            .to_line()
            .unwrap();
        assert_eq!(line, "{\"id\":4,\"result\":{\"status\":\"safe\"}}\n");
    }
}

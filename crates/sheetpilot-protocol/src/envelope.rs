//! Message envelope for every call, response, and notification crossing the
//! core's boundary.
//!
//! The shapes follow JSON-RPC 2.0:
//!
//! - Request: `{jsonrpc, id, method, params}`
//! - Response: `{jsonrpc, id, result}` or `{jsonrpc, id, error}`, never both
//! - Notification: `{jsonrpc, method, params?}`, no id, no response

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and core-specific error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidArguments,
    InternalError,
    NotInitialized,
    CapabilityNotFound,
    BackendUnavailable,
    NotApproved,
    LedgerError,
}

impl ErrorCode {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidArguments => -32602,
            Self::InternalError => -32603,
            Self::NotInitialized => -32002,
            Self::CapabilityNotFound => -32004,
            Self::BackendUnavailable => -32005,
            Self::NotApproved => -32006,
            Self::LedgerError => -32010,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        let code = match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidArguments,
            -32603 => Self::InternalError,
            -32002 => Self::NotInitialized,
            -32004 => Self::CapabilityNotFound,
            -32005 => Self::BackendUnavailable,
            -32006 => Self::NotApproved,
            -32010 => Self::LedgerError,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i64(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i64(self.code)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: Map<String, Value>,
}

impl RequestMessage {
    pub fn new(id: RequestId, method: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMessage {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl ResponseMessage {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            payload: ResponsePayload::Error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Option<Map<String, Value>>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(RequestMessage),
    Response(ResponseMessage),
    Notification(NotificationMessage),
}

impl Envelope {
    /// Parse raw text; malformed JSON is a parse error.
    pub fn parse_str(raw: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|error| RpcError::new(ErrorCode::ParseError, error.to_string()))?;
        Self::from_value(value)
    }

    /// Classify and validate a JSON value.
    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        let Value::Object(mut object) = value else {
            return Err(invalid_request("envelope must be a JSON object"));
        };

        match object.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(invalid_request(format!(
                    "unsupported protocol version marker: {other}"
                )));
            }
            None => return Err(invalid_request("missing protocol version marker")),
        }

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(parse_request_id(raw)?),
        };

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(invalid_request("method must be a string"));
            };
            let params = match object.remove("params") {
                None | Some(Value::Null) => None,
                Some(Value::Object(params)) => Some(params),
                Some(_) => {
                    return Err(RpcError::new(
                        ErrorCode::InvalidArguments,
                        "params must be an object",
                    ));
                }
            };
            return Ok(match id {
                Some(id) => Self::Request(RequestMessage::new(id, method, params.unwrap_or_default())),
                None => Self::Notification(NotificationMessage::new(method, params)),
            });
        }

        let Some(id) = id else {
            return Err(invalid_request("envelope has neither method nor id"));
        };
        let result = object.remove("result");
        let error = object.remove("error");
        match (result, error) {
            (Some(_), Some(_)) => Err(invalid_request("response carries both result and error")),
            (Some(result), None) => Ok(Self::Response(ResponseMessage::result(id, result))),
            (None, Some(error)) => {
                let error: RpcError = serde_json::from_value(error)
                    .map_err(|e| invalid_request(format!("malformed error object: {e}")))?;
                Ok(Self::Response(ResponseMessage::error(id, error)))
            }
            (None, None) => Err(invalid_request("response carries neither result nor error")),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn invalid_request(message: impl Into<String>) -> RpcError {
    RpcError::new(ErrorCode::InvalidRequest, message)
}

fn parse_request_id(raw: Value) -> Result<RequestId, RpcError> {
    match raw {
        Value::String(s) => Ok(RequestId::String(s)),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| invalid_request("numeric id must be an integer")),
        _ => Err(invalid_request("id must be a string or integer")),
    }
}

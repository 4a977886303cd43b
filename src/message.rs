//! Defines the JSON frames exchanged with the server.
//!
//! Outbound calls are `{action, params, echo}`. Inbound frames are either responses
//! `{status, retcode, data, echo}` correlated by `echo`, or event notifications carrying a
//! `post_type`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::*;

/// Status values that mean the call succeeded.
const SUCCESS_STATUSES: &[&str] = &["ok", "async"];

/// An API call sent to the server.
#[derive(PartialEq, Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    pub params: Value,
    pub echo: String,
}

/// The server's answer to a [`Request`].
#[derive(PartialEq, Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    pub retcode: i64,
    #[serde(default)]
    pub data: Value,
    pub echo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wording: Option<String>,
}

/// A decoded inbound frame.
#[derive(PartialEq, Clone, Debug)]
pub enum Frame {
    Response(Response),
    Event(Value),
}

impl Request {
    /// Encodes the request as JSON text.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Response {
    pub fn is_success(&self) -> bool {
        SUCCESS_STATUSES.contains(&self.status.as_str())
    }

    /// Converts the response into the outcome of the call: `data` on success, an [`ApiError`]
    /// otherwise.
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(RpcError::Api(ApiError {
                status: self.status,
                retcode: self.retcode,
                message: self.wording.or(self.msg),
                data: self.data,
            }))
        }
    }

    /// Reads a response out of a JSON object. Returns `None` if the object is not
    /// response-shaped: it needs an `echo` and at least one of `status` or `retcode`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let echo = match object.get("echo")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let status = object.get("status").and_then(Value::as_str);
        let retcode = object.get("retcode").and_then(Value::as_i64);
        if status.is_none() && retcode.is_none() {
            return None;
        }
        let retcode = retcode.unwrap_or(0);
        let status = match status {
            Some(status) => status.to_string(),
            None if retcode == 0 => "ok".to_string(),
            None => "failed".to_string(),
        };
        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Response {
            status,
            retcode,
            data: object.get("data").cloned().unwrap_or(Value::Null),
            echo,
            msg: text("msg"),
            wording: text("wording"),
        })
    }
}

impl Frame {
    /// Decodes one text frame.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Splits a JSON value into a response or an event.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(RpcError::Protocol("frame is not a JSON object".into()));
        }
        match Response::from_value(&value) {
            Some(response) => Ok(Frame::Response(response)),
            None => Ok(Frame::Event(value)),
        }
    }
}

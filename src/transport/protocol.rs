//! Request/response envelopes for the client protocol.
//!
//! Every record is a single JSON object `{"type": .., "body": ..}`.
//! Requests carry a command kind (0-3), responses a result kind (0-1).
//! The numeric kinds are fixed by the protocol and are not versioned.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

/// Message used when a record lacks `type` or `body`.
pub const MISSING_FIELDS_MESSAGE: &str = "Bad message: no type and or body";

/// Prefix of the error message for an unrecognized command kind.
pub const UNKNOWN_TYPE_PREFIX: &str = "Bad message type:";

/// Why a record could not be turned into a [`RequestEnvelope`].
///
/// These are protocol errors: they are reported to the client but never
/// touch the execution context.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The record is not valid UTF-8.
    #[error("record is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The record is not well-formed JSON.
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The record decoded but lacks `type` and/or `body`.
    #[error("Bad message: no type and or body")]
    MissingFields,

    /// The record exceeded the configured size limit and was discarded.
    #[error("record of {0} bytes exceeds the size limit")]
    Oversized(usize),
}

impl DecodeError {
    /// Convert into the error response sent back to the client.
    pub fn into_response(self) -> ResponseEnvelope {
        match self {
            Self::MissingFields => ResponseEnvelope::error(MISSING_FIELDS_MESSAGE, ""),
            Self::InvalidUtf8(e) => {
                ResponseEnvelope::error("Bad message: invalid UTF-8", e.to_string())
            }
            Self::Malformed(e) => {
                ResponseEnvelope::error("Bad message: malformed JSON", e.to_string())
            }
            Self::Oversized(len) => ResponseEnvelope::error(
                "Bad message: record too large",
                format!("{len} bytes"),
            ),
        }
    }
}

/// A decoded request, before its kind has been interpreted.
///
/// `kind` stays a raw JSON value so that an unknown type can be echoed back
/// exactly as the client sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub kind: Value,
    pub body: Value,
}

impl RequestEnvelope {
    /// Decode one framed record.
    ///
    /// A field explicitly set to `null` counts as present. Valid JSON that is
    /// not an object is treated as missing both fields.
    pub fn decode(record: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(record)?;
        let value: Value = serde_json::from_str(text)?;

        let Value::Object(mut map) = value else {
            return Err(DecodeError::MissingFields);
        };

        match (map.remove("type"), map.remove("body")) {
            (Some(kind), Some(body)) => Ok(Self { kind, body }),
            _ => Err(DecodeError::MissingFields),
        }
    }
}

/// The four command kinds a request can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Statement = 0,
    Expression = 1,
    Assignment = 2,
    StringifiedExpression = 3,
}

impl CommandKind {
    /// Match a raw `type` value against the protocol constants.
    ///
    /// Any JSON number numerically equal to a kind selects it, so `1` and
    /// `1.0` are the same command. Strings never match.
    pub fn from_value(value: &Value) -> Option<Self> {
        let n = value.as_f64()?;
        [
            Self::Statement,
            Self::Expression,
            Self::Assignment,
            Self::StringifiedExpression,
        ]
        .into_iter()
        .find(|kind| f64::from(*kind as u8) == n)
    }
}

/// Code to run for statement and expression commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet(String);

impl Snippet {
    /// Build a snippet from a request body.
    ///
    /// A string body is source code. Any other JSON value evaluates to
    /// itself, so it is wrapped as a parenthesised literal.
    pub fn from_body(body: Value) -> Self {
        match body {
            Value::String(code) => Self(code),
            other => Self(format!("({other})")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A request with its kind resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Statement(Snippet),
    Expression(Snippet),
    /// Raw assignment body; its shape is validated by the dispatcher.
    Assignment(Value),
    StringifiedExpression(Snippet),
    Unknown(Value),
}

impl Command {
    pub fn from_envelope(envelope: RequestEnvelope) -> Self {
        let RequestEnvelope { kind, body } = envelope;
        match CommandKind::from_value(&kind) {
            Some(CommandKind::Statement) => Self::Statement(Snippet::from_body(body)),
            Some(CommandKind::Expression) => Self::Expression(Snippet::from_body(body)),
            Some(CommandKind::Assignment) => Self::Assignment(body),
            Some(CommandKind::StringifiedExpression) => {
                Self::StringifiedExpression(Snippet::from_body(body))
            }
            None => Self::Unknown(kind),
        }
    }
}

/// Result kind tag of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(into = "u8", try_from = "u8")]
pub enum ResultKind {
    Success = 0,
    Error = 1,
}

impl From<ResultKind> for u8 {
    fn from(kind: ResultKind) -> Self {
        kind as Self
    }
}

impl TryFrom<u8> for ResultKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(ResultKind::Error),
            other => Err(format!("unknown result kind {other}")),
        }
    }
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    /// Failure category (e.g. `ReferenceError`) or protocol error text.
    pub message: String,
    /// Human-readable detail; empty for protocol errors.
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(untagged)]
pub enum ResponseBody {
    Error(ErrorBody),
    Value(Value),
}

/// Response sent back for a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// Success carrying a value.
    pub fn success(body: impl Into<Value>) -> Self {
        Self {
            kind: ResultKind::Success,
            body: ResponseBody::Value(body.into()),
        }
    }

    /// Success with an empty string body (statements and assignments).
    pub fn empty() -> Self {
        Self::success("")
    }

    pub fn error(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Error,
            body: ResponseBody::Error(ErrorBody {
                message: message.into(),
                cause: cause.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResultKind::Success
    }

    /// Encode as a single JSON line (without the trailing newline).
    ///
    /// Never fails: if serialization does fail, an error envelope describing
    /// the failure is returned in its place.
    pub fn encode(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                let cause = Value::String(e.to_string());
                format!(
                    r#"{{"type":{},"body":{{"message":"EncodeError","cause":{cause}}}}}"#,
                    u8::from(ResultKind::Error)
                )
            }
        }
    }
}

/// Render a JSON value the way script string concatenation would.
///
/// Used to echo an unknown command type: `99` stays `99`, `"x"` becomes
/// `x`, arrays join their elements with commas.
pub fn script_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => script_text(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
        other => other.to_string(),
    }
}

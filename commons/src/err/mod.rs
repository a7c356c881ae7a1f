use anyhow::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io;
use thiserror::Error as ThisError;

/// Fixed protocol error taxonomy. Every variant maps to one wire code/message pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    MethodExists,
    ServerError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::ParseError,
        ErrorKind::InvalidRequest,
        ErrorKind::MethodNotFound,
        ErrorKind::InvalidParams,
        ErrorKind::InternalError,
        ErrorKind::MethodExists,
        ErrorKind::ServerError,
    ];

    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError => -32603,
            ErrorKind::MethodExists => -32000,
            ErrorKind::ServerError => -32001,
        }
    }

    /// The wire message that accompanies the code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "Parse error",
            ErrorKind::InvalidRequest => "Invalid Request",
            ErrorKind::MethodNotFound => "Method not found",
            ErrorKind::InvalidParams => "Invalid params",
            ErrorKind::InternalError => "Internal error",
            ErrorKind::MethodExists => "Method already exists",
            // peers match on this literal
            ErrorKind::ServerError => "Client error",
        }
    }

    /// Returns a canonical string representation of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::MethodExists => "METHOD_EXISTS",
            ErrorKind::ServerError => "SERVER_ERROR",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| Error::msg(format!("Invalid error kind string: {}", s)))
    }
}

/// Protocol-level error carried in the `error` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ErrorObject {
    pub fn new(kind: ErrorKind, metadata: Option<Value>) -> Self {
        Self {
            code: kind.code(),
            message: kind.message().to_string(),
            metadata,
        }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(kind, Some(Value::String(detail.into())))
    }

    /// The symbolic kind, if the code is one of the fixed pairs.
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.code)
    }

    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        map.insert("code".to_string(), Value::from(self.code));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(metadata) = &self.metadata {
            map.insert("metadata".to_string(), metadata.clone());
        }
        Value::Object(map)
    }

    pub fn from_wire(value: &Value) -> Result<Self, ErrorObject> {
        serde_json::from_value(value.clone()).map_err(|e| {
            ErrorObject::with_detail(
                ErrorKind::InvalidRequest,
                format!("Malformed error object: {}", e),
            )
        })
    }
}

impl From<ErrorKind> for ErrorObject {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, None)
    }
}

impl std::error::Error for ErrorObject {}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.metadata {
            Some(Value::String(detail)) => write!(f, "{} ({}): {}", self.message, self.code, detail),
            Some(other) => write!(f, "{} ({}): {}", self.message, self.code, other),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

pub type RPCResult<T> = Result<T, ErrorObject>;

/// Failures raised by the transport and frame layers. These always reach the caller.
#[derive(ThisError, Debug)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Socket operation timed out")]
    Timeout,
    #[error("Peer stalled mid-frame after {received} of {expected} bytes")]
    Stalled { received: usize, expected: usize },
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Maps a raw socket error onto the transport taxonomy.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::ConnectionClosed,
            _ => TransportError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_fixed_code_pairs() {
        assert_eq!(ErrorKind::ParseError.code(), -32700);
        assert_eq!(ErrorKind::InvalidRequest.code(), -32600);
        assert_eq!(ErrorKind::MethodNotFound.code(), -32601);
        assert_eq!(ErrorKind::InvalidParams.code(), -32602);
        assert_eq!(ErrorKind::InternalError.code(), -32603);
        assert_eq!(ErrorKind::MethodExists.code(), -32000);
        assert_eq!(ErrorKind::ServerError.code(), -32001);
        assert_eq!(ErrorKind::MethodNotFound.message(), "Method not found");

        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
            assert_eq!(ErrorKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert_eq!(ErrorKind::from_code(42), None);
        assert!(ErrorKind::from_str("nope").is_err());
    }

    #[test]
    fn test_error_object_wire_shape() {
        let err = ErrorObject::new(ErrorKind::InvalidParams, Some(json!("Missing required parameters: b")));
        assert_eq!(
            err.to_wire(),
            json!({"code": -32602, "message": "Invalid params", "metadata": "Missing required parameters: b"})
        );

        let bare = ErrorObject::from(ErrorKind::ParseError);
        assert_eq!(bare.to_wire(), json!({"code": -32700, "message": "Parse error"}));
        assert_eq!(bare.kind(), Some(ErrorKind::ParseError));
    }

    #[test]
    fn test_error_object_accepts_data_alias() {
        let parsed = ErrorObject::from_wire(&json!({"code": -32603, "message": "Internal error", "data": "boom"})).unwrap();
        assert_eq!(parsed.metadata, Some(json!("boom")));

        let bad = ErrorObject::from_wire(&json!({"code": "x"})).unwrap_err();
        assert_eq!(bad.kind(), Some(ErrorKind::InvalidRequest));
    }

    #[test]
    fn test_transport_error_mapping() {
        let timeout = io::Error::new(io::ErrorKind::WouldBlock, "would block");
        assert!(matches!(TransportError::from_io(timeout), TransportError::Timeout));

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(TransportError::from_io(eof), TransportError::ConnectionClosed));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(TransportError::from_io(other), TransportError::Io(_)));
    }
}

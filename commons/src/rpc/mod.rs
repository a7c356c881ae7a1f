use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::err::{ErrorKind, ErrorObject, RPCResult};

pub mod frame;
pub mod tcp;

pub const VERSION_KEY: &str = "jsonrpc";
pub const PROTOCOL_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
}

impl MessageType {
    /// Decides whether a wire dict is a request or a response.
    ///
    /// `method` wins over `result`/`error`; anything else is an invalid request.
    pub fn classify(value: &Value) -> RPCResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            ErrorObject::with_detail(ErrorKind::InvalidRequest, "Message must be a JSON object")
        })?;
        if map.contains_key("method") {
            Ok(MessageType::Request)
        } else if map.contains_key("result") || map.contains_key("error") {
            Ok(MessageType::Response)
        } else {
            Err(ErrorObject::with_detail(
                ErrorKind::InvalidRequest,
                "Message is neither a request nor a response",
            ))
        }
    }
}

/// Canonical key for an identifier in the tracker tables: the id's compact
/// JSON text, so `1` and `"1"` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Value> for CallId {
    fn from(value: &Value) -> Self {
        CallId(value.to_string())
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        CallId::from(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        CallId::from(&Value::String(value))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_version(map: &Map<String, Value>) -> RPCResult<()> {
    match map.get(VERSION_KEY) {
        Some(Value::String(v)) if v == PROTOCOL_VERSION => Ok(()),
        _ => Err(ErrorObject::with_detail(
            ErrorKind::InvalidRequest,
            format!("Invalid or missing {} version, expected {}", VERSION_KEY, PROTOCOL_VERSION),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub id: Option<Value>,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            method: method.into(),
            id,
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(method, params, None)
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    pub fn call_id(&self) -> Option<CallId> {
        match &self.id {
            None | Some(Value::Null) => None,
            Some(id) => Some(CallId::from(id)),
        }
    }

    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        map.insert(VERSION_KEY.to_string(), Value::from(PROTOCOL_VERSION));
        map.insert("method".to_string(), Value::String(self.method.clone()));
        if let Some(id) = &self.id {
            map.insert("id".to_string(), id.clone());
        }
        if let Some(params) = &self.params {
            map.insert("params".to_string(), params.clone());
        }
        Value::Object(map)
    }

    pub fn from_wire(value: &Value) -> RPCResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            ErrorObject::with_detail(ErrorKind::InvalidRequest, "Request must be a JSON object")
        })?;
        check_version(map)?;
        let method = match map.get("method") {
            Some(Value::String(method)) => method.clone(),
            Some(_) => {
                return Err(ErrorObject::with_detail(
                    ErrorKind::InvalidRequest,
                    "Method must be a string",
                ))
            }
            None => {
                return Err(ErrorObject::with_detail(
                    ErrorKind::InvalidRequest,
                    "Missing method",
                ))
            }
        };
        Ok(Self {
            method,
            id: map.get("id").cloned(),
            params: map.get("params").cloned(),
        })
    }
}

/// Either side of a response. Holding exactly one of them is enforced by the type.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Value,
    pub outcome: Outcome,
    pub exec_time: Option<i64>,
}

impl Response {
    /// Builds a response from optional parts, rejecting both-set and neither-set.
    pub fn new(id: Value, result: Option<Value>, error: Option<ErrorObject>) -> RPCResult<Self> {
        let outcome = match (result, error) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => Outcome::Error(error),
            (Some(_), Some(_)) => {
                return Err(ErrorObject::with_detail(
                    ErrorKind::InvalidRequest,
                    "Response cannot carry both result and error",
                ))
            }
            (None, None) => {
                return Err(ErrorObject::with_detail(
                    ErrorKind::InvalidRequest,
                    "Response must carry either result or error",
                ))
            }
        };
        Ok(Self {
            id,
            outcome,
            exec_time: None,
        })
    }

    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
            exec_time: None,
        }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
            exec_time: None,
        }
    }

    pub fn with_exec_time(mut self, exec_time: i64) -> Self {
        self.exec_time = Some(exec_time);
        self
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(result) => Some(result),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn call_id(&self) -> CallId {
        CallId::from(&self.id)
    }

    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        map.insert(VERSION_KEY.to_string(), Value::from(PROTOCOL_VERSION));
        map.insert("id".to_string(), self.id.clone());
        match &self.outcome {
            Outcome::Result(result) => {
                map.insert("result".to_string(), result.clone());
            }
            Outcome::Error(error) => {
                map.insert("error".to_string(), error.to_wire());
            }
        }
        if let Some(exec_time) = self.exec_time {
            map.insert("exec_time".to_string(), Value::from(exec_time));
        }
        Value::Object(map)
    }

    pub fn from_wire(value: &Value) -> RPCResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            ErrorObject::with_detail(ErrorKind::InvalidRequest, "Response must be a JSON object")
        })?;
        check_version(map)?;
        let id = map.get("id").cloned().ok_or_else(|| {
            ErrorObject::with_detail(ErrorKind::InvalidRequest, "Response is missing id")
        })?;
        let error = match map.get("error") {
            Some(error) => Some(ErrorObject::from_wire(error)?),
            None => None,
        };
        let mut response = Self::new(id, map.get("result").cloned(), error)?;
        response.exec_time = Some(map.get("exec_time").and_then(Value::as_i64).unwrap_or(0));
        Ok(response)
    }
}

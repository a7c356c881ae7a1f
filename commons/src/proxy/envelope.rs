use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{EncodedRecord, ProxyError, RecordProxy, RecordTreeDescriptor};
use crate::rpc::{Request, Response};

pub const CLASS_NAME_KEY: &str = "ClassName";
pub const PRIORITY_KEY: &str = "Priority";
pub const DATA_KEY: &str = "Data";
pub const MESSAGE_KEY: &str = "Message";
pub const ID_KEY: &str = "id";
pub const EXEC_TIME_KEY: &str = "exec_time";

/// Addressing of the peer-side actor that receives enveloped calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    pub library: String,
    pub priority: i32,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            library: "Chat Window.lvlib".to_string(),
            priority: 2,
        }
    }
}

impl EnvelopeConfig {
    pub fn class_name(&self, method: &str) -> String {
        format!("{}:{} Msg.lvclass", self.library, method)
    }
}

impl RecordProxy {
    /// Wraps `request` into the three-field actor envelope and encodes it.
    pub fn to_envelope(&self, request: &Request, config: &EnvelopeConfig) -> Result<EncodedRecord, ProxyError> {
        let id = request
            .id
            .clone()
            .filter(|id| !id.is_null())
            .ok_or_else(|| ProxyError::MissingField(ID_KEY.to_string()))?;
        let message = request
            .params
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|params| params.get(MESSAGE_KEY).or_else(|| params.get("message")))
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));

        let mut data = Map::new();
        data.insert(MESSAGE_KEY.to_string(), message);
        data.insert(ID_KEY.to_string(), id);
        data.insert(EXEC_TIME_KEY.to_string(), Value::from(0));

        let mut envelope = Map::new();
        envelope.insert(CLASS_NAME_KEY.to_string(), Value::String(config.class_name(&request.method)));
        envelope.insert(PRIORITY_KEY.to_string(), Value::from(config.priority));
        envelope.insert(DATA_KEY.to_string(), Value::Object(data));
        self.encode(&envelope)
    }

    /// Decodes an envelope reply and lifts `Data.id` out into the response id.
    pub fn from_envelope(&self, bytes: &[u8], descriptor: &RecordTreeDescriptor) -> Result<Response, ProxyError> {
        let mut envelope = self.decode(bytes, descriptor)?;
        let mut data = match envelope.remove(DATA_KEY) {
            Some(Value::Object(data)) => data,
            Some(other) => {
                return Err(ProxyError::DescriptorMismatch(format!(
                    "{} is not a nested record: {}",
                    DATA_KEY, other
                )))
            }
            None => return Err(ProxyError::MissingField(DATA_KEY.to_string())),
        };
        let id = data
            .remove(ID_KEY)
            .ok_or_else(|| ProxyError::MissingField(format!("{}.{}", DATA_KEY, ID_KEY)))?;
        Ok(Response::success(id, Value::Object(data)))
    }
}

//! Bridges nested key/value payloads and the peer's flat record format.
//!
//! The peer only understands flat ordered records, so every nested map is encoded
//! first, its bytes are turned into a string leaf of the parent, and a
//! [`RecordTreeDescriptor`] remembers where that happened so [`RecordProxy::decode`]
//! can undo it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

pub mod envelope;
pub mod msgpack;

pub use envelope::EnvelopeConfig;
pub use msgpack::MsgPackRecordCodec;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Record codec failed: {0}")]
    Codec(anyhow::Error),
    #[error("Unsupported value for key '{key}': {reason}")]
    UnsupportedValue { key: String, reason: String },
    #[error("Text encoding failed: {0}")]
    Encoding(String),
    #[error("Descriptor does not match record: {0}")]
    DescriptorMismatch(String),
    #[error("Missing field: {0}")]
    MissingField(String),
}

/// Serializer for one flat level of a record. The proxy never looks inside the bytes.
pub trait RecordCodec: Send + Sync {
    /// Returns `(body, header)` for the ordered values.
    fn serialize(&self, values: &[Value], keys: &[String], version: u32) -> anyhow::Result<(Vec<u8>, Vec<u8>)>;
    fn deserialize(&self, header: &[u8], body: &[u8], version: u32) -> anyhow::Result<Vec<Value>>;
}

/// How a nested child's bytes are carried as a string leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    /// One char per byte, lossless for any byte sequence.
    #[default]
    Latin1,
    Utf8,
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String, ProxyError> {
        match self {
            TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            TextEncoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| ProxyError::Encoding(e.to_string())),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, ProxyError> {
        match self {
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(c).map_err(|_| {
                        ProxyError::Encoding(format!("character {:?} is outside latin-1", c))
                    })
                })
                .collect(),
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordTreeDescriptor {
    pub header: Vec<u8>,
    pub keys: Vec<String>,
    pub children: Vec<ChildDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDescriptor {
    pub index: usize,
    pub keys: Vec<String>,
    pub tree: RecordTreeDescriptor,
}

/// Encoded bytes and the descriptor needed to read them back. They travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRecord {
    pub bytes: Vec<u8>,
    pub descriptor: RecordTreeDescriptor,
}

#[derive(Clone)]
pub struct RecordProxy {
    codec: Arc<dyn RecordCodec>,
    version: u32,
    encoding: TextEncoding,
}

impl Default for RecordProxy {
    fn default() -> Self {
        Self::new(Arc::new(MsgPackRecordCodec))
    }
}

impl RecordProxy {
    pub fn new(codec: Arc<dyn RecordCodec>) -> Self {
        Self {
            codec,
            version: 0,
            encoding: TextEncoding::default(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn encode(&self, tree: &Map<String, Value>) -> Result<EncodedRecord, ProxyError> {
        let mut keys = Vec::with_capacity(tree.len());
        let mut values = Vec::with_capacity(tree.len());
        let mut children = Vec::new();

        for (index, (key, value)) in tree.iter().enumerate() {
            keys.push(key.clone());
            match value {
                Value::Object(nested) => {
                    let child = self.encode(nested)?;
                    values.push(Value::String(self.encoding.decode(&child.bytes)?));
                    children.push(ChildDescriptor {
                        index,
                        keys: child.descriptor.keys.clone(),
                        tree: child.descriptor,
                    });
                }
                Value::Array(items) if items.iter().any(contains_object) => {
                    return Err(ProxyError::UnsupportedValue {
                        key: key.clone(),
                        reason: "arrays of nested structures cannot be flattened".to_string(),
                    });
                }
                leaf => values.push(leaf.clone()),
            }
        }

        let (bytes, header) = self
            .codec
            .serialize(&values, &keys, self.version)
            .map_err(ProxyError::Codec)?;
        Ok(EncodedRecord {
            bytes,
            descriptor: RecordTreeDescriptor {
                header,
                keys,
                children,
            },
        })
    }

    pub fn decode(&self, bytes: &[u8], descriptor: &RecordTreeDescriptor) -> Result<Map<String, Value>, ProxyError> {
        let mut values = self
            .codec
            .deserialize(&descriptor.header, bytes, self.version)
            .map_err(ProxyError::Codec)?;
        if values.len() != descriptor.keys.len() {
            return Err(ProxyError::DescriptorMismatch(format!(
                "{} keys but {} values",
                descriptor.keys.len(),
                values.len()
            )));
        }

        for child in &descriptor.children {
            let child_bytes = match values.get(child.index) {
                Some(Value::String(text)) => self.encoding.encode(text)?,
                Some(other) => {
                    return Err(ProxyError::DescriptorMismatch(format!(
                        "child at index {} is not a string leaf: {}",
                        child.index, other
                    )))
                }
                None => {
                    return Err(ProxyError::DescriptorMismatch(format!(
                        "child index {} out of range",
                        child.index
                    )))
                }
            };
            let nested = self.decode(&child_bytes, &child.tree)?;
            values[child.index] = Value::Object(nested);
        }

        Ok(descriptor.keys.iter().cloned().zip(values).collect())
    }
}

fn contains_object(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(contains_object),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_flat_record() {
        let proxy = RecordProxy::default();
        let tree = as_map(json!({"name": "probe", "count": 3, "gain": 1.5, "armed": true}));
        let encoded = proxy.encode(&tree).unwrap();

        assert_eq!(encoded.descriptor.keys, vec!["name", "count", "gain", "armed"]);
        assert!(encoded.descriptor.children.is_empty());
        assert_eq!(proxy.decode(&encoded.bytes, &encoded.descriptor).unwrap(), tree);
    }

    #[test]
    fn test_nested_record_decodes_to_original() {
        let proxy = RecordProxy::default();
        let tree = as_map(json!({
            "ClassName": "Chat Window.lvlib:echo Msg.lvclass",
            "Priority": 2,
            "Data": {
                "Message": "hello",
                "inner": {"depth": 2, "deeper": {"depth": 3, "ratio": -0.25}},
                "tags": ["a", "b"],
            },
            "trailing": -7,
        }));
        let encoded = proxy.encode(&tree).unwrap();

        let data_child = &encoded.descriptor.children[0];
        assert_eq!(encoded.descriptor.children.len(), 1);
        assert_eq!(data_child.index, 2);
        assert_eq!(data_child.keys, vec!["Message", "inner", "tags"]);
        assert_eq!(data_child.tree.children[0].index, 1);

        let decoded = proxy.decode(&encoded.bytes, &encoded.descriptor).unwrap();
        assert_eq!(decoded, tree);
        let order: Vec<&String> = decoded.keys().collect();
        assert_eq!(order, vec!["ClassName", "Priority", "Data", "trailing"]);
    }

    #[test]
    fn test_empty_nested_record() {
        let proxy = RecordProxy::default();
        let tree = as_map(json!({"empty": {}, "x": 1}));
        let encoded = proxy.encode(&tree).unwrap();
        assert_eq!(proxy.decode(&encoded.bytes, &encoded.descriptor).unwrap(), tree);
    }

    #[test]
    fn test_arrays_of_records_are_rejected() {
        let proxy = RecordProxy::default();
        let tree = as_map(json!({"rows": [{"a": 1}]}));
        assert!(matches!(
            proxy.encode(&tree),
            Err(ProxyError::UnsupportedValue { key, .. }) if key == "rows"
        ));
    }

    #[test]
    fn test_wrong_descriptor_is_reported() {
        let proxy = RecordProxy::default();
        let first = proxy.encode(&as_map(json!({"a": 1, "b": 2}))).unwrap();
        let mut descriptor = first.descriptor.clone();
        descriptor.keys.pop();
        assert!(matches!(
            proxy.decode(&first.bytes, &descriptor),
            Err(ProxyError::DescriptorMismatch(_))
        ));

        let mut descriptor = first.descriptor.clone();
        descriptor.children.push(ChildDescriptor {
            index: 0,
            keys: vec![],
            tree: RecordTreeDescriptor::default(),
        });
        assert!(matches!(
            proxy.decode(&first.bytes, &descriptor),
            Err(ProxyError::DescriptorMismatch(_))
        ));
    }

    #[test]
    fn test_text_encodings() {
        let raw: Vec<u8> = (0..=255).collect();
        let text = TextEncoding::Latin1.decode(&raw).unwrap();
        assert_eq!(TextEncoding::Latin1.encode(&text).unwrap(), raw);
        assert!(TextEncoding::Latin1.encode("\u{20ac}").is_err());

        assert!(TextEncoding::Utf8.decode(&[0xc3, 0x28]).is_err());
        assert_eq!(TextEncoding::Utf8.encode("h\u{e9}").unwrap(), vec![b'h', 0xc3, 0xa9]);
    }

    #[test]
    fn test_version_is_checked_by_codec() {
        let writer = RecordProxy::default().with_version(3);
        let reader = RecordProxy::default().with_version(4);
        let encoded = writer.encode(&as_map(json!({"a": 1}))).unwrap();
        assert!(matches!(
            reader.decode(&encoded.bytes, &encoded.descriptor),
            Err(ProxyError::Codec(_))
        ));
    }
}

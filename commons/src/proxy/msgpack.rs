use anyhow::{anyhow, bail, ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RecordCodec;

/// Type tag of one field in a flat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
}

impl FieldType {
    pub fn of(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Bool,
            Value::Number(n) if n.is_f64() => FieldType::Float,
            Value::Number(_) => FieldType::Int,
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => bail!("nested structures must be flattened before serialization"),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    version: u32,
    fields: Vec<FieldType>,
}

/// MessagePack backed [`RecordCodec`]: the header lists field types, the body is the value array.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackRecordCodec;

impl RecordCodec for MsgPackRecordCodec {
    fn serialize(&self, values: &[Value], keys: &[String], version: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        ensure!(
            values.len() == keys.len(),
            "{} values for {} keys",
            values.len(),
            keys.len()
        );
        let fields = values.iter().map(FieldType::of).collect::<Result<Vec<_>>>()?;
        let header = rmp_serde::to_vec(&RecordHeader { version, fields })?;
        let body = rmp_serde::to_vec(values)?;
        Ok((body, header))
    }

    fn deserialize(&self, header: &[u8], body: &[u8], version: u32) -> Result<Vec<Value>> {
        let header: RecordHeader = rmp_serde::from_slice(header)
            .map_err(|e| anyhow!("invalid record header: {}", e))?;
        ensure!(
            header.version == version,
            "record format version {} does not match expected {}",
            header.version,
            version
        );
        let values: Vec<Value> = rmp_serde::from_slice(body)
            .map_err(|e| anyhow!("invalid record body: {}", e))?;
        ensure!(
            values.len() == header.fields.len(),
            "header describes {} fields but body holds {}",
            header.fields.len(),
            values.len()
        );
        for (position, (value, expected)) in values.iter().zip(&header.fields).enumerate() {
            let actual = FieldType::of(value)?;
            ensure!(
                actual == *expected,
                "field {} should be {:?} but is {:?}",
                position,
                expected,
                actual
            );
        }
        Ok(values)
    }
}

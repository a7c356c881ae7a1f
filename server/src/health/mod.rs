use anyhow::Result;
use commons::handler::CallArgs;
use serde_json::{json, Value};

pub fn check(_args: &CallArgs) -> Result<Value> {
    let host = hostname::get()?.to_string_lossy().into_owned();
    Ok(json!({"status": "ok", "host": host}))
}

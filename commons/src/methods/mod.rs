use anyhow::{bail, Result};
use log::{debug, error};
use serde_json::Value;

use crate::err::ErrorObject;
use crate::handler::{
    response_fn, CallArgs, HandlerRegistry, MethodProvider, MethodTag, RequestHandlerKind,
    RequestMethod, ResponseHandlerKind, DEFAULT_RESPONSE_HANDLER,
};

pub fn echo(args: &CallArgs) -> Result<Value> {
    Ok(args.value("message")?.clone())
}

/// Integer arithmetic when both operands are integers, float otherwise.
fn arith(args: &CallArgs, int_op: fn(i64, i64) -> Option<i64>, float_op: fn(f64, f64) -> f64) -> Result<Value> {
    let (a, b) = (args.value("a")?, args.value("b")?);
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return Ok(Value::from(r));
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::from(float_op(x, y))),
        _ => bail!("operands must be numbers, got {} and {}", a, b),
    }
}

pub fn add(args: &CallArgs) -> Result<Value> {
    arith(args, i64::checked_add, |x, y| x + y)
}

pub fn subtract(args: &CallArgs) -> Result<Value> {
    arith(args, i64::checked_sub, |x, y| x - y)
}

fn log_response(method: &str, id: &Value, result: Option<&Value>, error: Option<&ErrorObject>) -> Result<()> {
    match (result, error) {
        (_, Some(error)) => error!("{} call {} failed: {}", method, id, error),
        (Some(result), None) => debug!("{} call {} returned {}", method, id, result),
        (None, None) => debug!("{} call {} returned nothing", method, id),
    }
    Ok(())
}

/// Request methods `echo`, `add`, `subtract` plus logging response handlers for each.
pub struct BuiltinMethods;

impl MethodProvider for BuiltinMethods {
    fn tag(&self) -> MethodTag {
        MethodTag::Both
    }

    fn register_requests(&self, registry: &mut HandlerRegistry<RequestHandlerKind>) {
        registry
            .register("echo", RequestMethod::new(echo).param("message"))
            .register("add", RequestMethod::new(add).param("a").param("b"))
            .register("subtract", RequestMethod::new(subtract).param("a").param("b"));
    }

    fn register_responses(&self, registry: &mut HandlerRegistry<ResponseHandlerKind>) {
        for name in ["echo", "add", "subtract", DEFAULT_RESPONSE_HANDLER] {
            registry.register(
                name,
                response_fn(move |id, result, error| log_response(name, id, result, error)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::err::ErrorKind;
    use crate::tracker::{CallTracker, TrackerConfig};
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let mut d = Dispatcher::new(CallTracker::shared(TrackerConfig::default()));
        d.register_provider(&BuiltinMethods);
        d
    }

    fn call(d: &Dispatcher, method: &str, params: Value) -> Value {
        let reply = d
            .process_message(json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1}))
            .unwrap();
        reply.result().cloned().unwrap_or_else(|| reply.error().unwrap().to_wire())
    }

    #[test]
    fn test_builtin_registration() {
        let d = dispatcher();
        assert_eq!(d.request_methods().names(), vec!["add", "echo", "subtract"]);
        assert_eq!(d.response_methods().len(), 4);
        assert!(d.response_methods().contains(DEFAULT_RESPONSE_HANDLER));
    }

    #[test]
    fn test_arithmetic() {
        let d = dispatcher();
        assert_eq!(call(&d, "add", json!({"a": 2, "b": 3})), json!(5));
        assert_eq!(call(&d, "subtract", json!([10, 4])), json!(6));
        assert_eq!(call(&d, "add", json!([1.5, 2])), json!(3.5));
        assert_eq!(call(&d, "echo", json!({"message": {"nested": [1, 2]}})), json!({"nested": [1, 2]}));
    }

    #[test]
    fn test_non_numeric_operands() {
        let d = dispatcher();
        let error = call(&d, "add", json!({"a": "x", "b": 1}));
        assert_eq!(error["code"], json!(ErrorKind::InternalError.code()));
    }
}

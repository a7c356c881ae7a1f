use anyhow::{anyhow, Result};
use log::warn;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::err::{ErrorKind, ErrorObject};

pub const DEFAULT_RESPONSE_HANDLER: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Request,
    Response,
}

impl HandlerType {
    fn label(&self) -> &'static str {
        match self {
            HandlerType::Request => "request",
            HandlerType::Response => "response",
        }
    }
}

/// Which registries a method provider fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTag {
    Request,
    Response,
    Both,
}

impl MethodTag {
    pub fn covers(&self, handler_type: HandlerType) -> bool {
        matches!(
            (self, handler_type),
            (MethodTag::Both, _)
                | (MethodTag::Request, HandlerType::Request)
                | (MethodTag::Response, HandlerType::Response)
        )
    }
}

pub trait HandlerKind {
    type Handler;
    fn handler_type() -> HandlerType;
}

pub struct RequestHandlerKind;
pub struct ResponseHandlerKind;

impl HandlerKind for RequestHandlerKind {
    type Handler = RequestMethod;

    fn handler_type() -> HandlerType {
        HandlerType::Request
    }
}

impl HandlerKind for ResponseHandlerKind {
    type Handler = ResponseFn;

    fn handler_type() -> HandlerType {
        HandlerType::Response
    }
}

pub type RequestFn = Arc<dyn Fn(&CallArgs) -> Result<Value> + Send + Sync>;
pub type ResponseFn = Arc<dyn Fn(&Value, Option<&Value>, Option<&ErrorObject>) -> Result<()> + Send + Sync>;

/// Wraps a closure as a response handler.
pub fn response_fn<F>(f: F) -> ResponseFn
where
    F: Fn(&Value, Option<&Value>, Option<&ErrorObject>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A request handler together with the parameters it declares.
#[derive(Clone)]
pub struct RequestMethod {
    params: Vec<ParamSpec>,
    handler: RequestFn,
}

impl RequestMethod {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            params: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn param(mut self, name: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            default: None,
        });
        self
    }

    pub fn param_with_default(mut self, name: &str, default: Value) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            default: Some(default),
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.is_required()).count()
    }

    /// Binds wire params onto the declared parameters, failing with `InvalidParams`.
    pub fn bind(&self, params: Option<&Value>) -> Result<CallArgs, ErrorObject> {
        let mut bound = Map::new();
        match params {
            None | Some(Value::Null) => self.bind_named(&Map::new(), &mut bound)?,
            Some(Value::Object(named)) => self.bind_named(named, &mut bound)?,
            Some(Value::Array(positional)) => self.bind_positional(positional, &mut bound)?,
            Some(_) => {
                return Err(ErrorObject::with_detail(
                    ErrorKind::InvalidParams,
                    "Params must be an object or an array",
                ))
            }
        }
        Ok(CallArgs { values: bound })
    }

    fn bind_named(&self, named: &Map<String, Value>, bound: &mut Map<String, Value>) -> Result<(), ErrorObject> {
        let missing: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.is_required() && !named.contains_key(&p.name))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ErrorObject::with_detail(
                ErrorKind::InvalidParams,
                format!("Missing required parameters: {}", missing.join(", ")),
            ));
        }
        for (key, value) in named {
            bound.insert(key.clone(), value.clone());
        }
        for spec in &self.params {
            if let (false, Some(default)) = (bound.contains_key(&spec.name), &spec.default) {
                bound.insert(spec.name.clone(), default.clone());
            }
        }
        Ok(())
    }

    fn bind_positional(&self, positional: &[Value], bound: &mut Map<String, Value>) -> Result<(), ErrorObject> {
        let required = self.required_count();
        if positional.len() < required {
            return Err(ErrorObject::with_detail(
                ErrorKind::InvalidParams,
                format!(
                    "Method requires {} positional arguments, got {}",
                    required,
                    positional.len()
                ),
            ));
        }
        if positional.len() > self.params.len() {
            return Err(ErrorObject::with_detail(
                ErrorKind::InvalidParams,
                format!(
                    "Method accepts at most {} positional arguments, got {}",
                    self.params.len(),
                    positional.len()
                ),
            ));
        }
        for (index, spec) in self.params.iter().enumerate() {
            match (positional.get(index), &spec.default) {
                (Some(value), _) => {
                    bound.insert(spec.name.clone(), value.clone());
                }
                (None, Some(default)) => {
                    bound.insert(spec.name.clone(), default.clone());
                }
                (None, None) => {
                    return Err(ErrorObject::with_detail(
                        ErrorKind::InvalidParams,
                        format!("Missing required parameters: {}", spec.name),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn invoke(&self, args: &CallArgs) -> Result<Value> {
        (self.handler)(args)
    }
}

/// Arguments after binding, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    values: Map<String, Value>,
}

impl CallArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn value(&self, name: &str) -> Result<&Value> {
        self.get(name).ok_or_else(|| anyhow!("missing argument '{}'", name))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.value(name)?
            .as_str()
            .ok_or_else(|| anyhow!("argument '{}' must be a string", name))
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.value(name)?
            .as_f64()
            .ok_or_else(|| anyhow!("argument '{}' must be a number", name))
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

/// A component that contributes its methods to a dispatcher when it is built.
pub trait MethodProvider {
    fn tag(&self) -> MethodTag;

    fn register_requests(&self, _registry: &mut HandlerRegistry<RequestHandlerKind>) {}

    fn register_responses(&self, _registry: &mut HandlerRegistry<ResponseHandlerKind>) {}
}

pub struct HandlerRegistry<H: HandlerKind> {
    functions: HashMap<String, H::Handler>,
    _phantom: std::marker::PhantomData<H>,
}

impl<H: HandlerKind> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HandlerKind> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Registers `handler` under `name`; an existing entry is overwritten with a warning.
    pub fn register(&mut self, name: &str, handler: H::Handler) -> &mut Self {
        if self.functions.insert(name.to_string(), handler).is_some() {
            warn!(
                "Overriding existing {} method: {}",
                H::handler_type().label(),
                name
            );
        }
        self
    }

    pub fn try_register(&mut self, name: &str, handler: H::Handler) -> Result<&mut Self, ErrorObject> {
        if self.functions.contains_key(name) {
            return Err(ErrorObject::with_detail(
                ErrorKind::MethodExists,
                format!("{} method '{}' is already registered", H::handler_type().label(), name),
            ));
        }
        self.functions.insert(name.to_string(), handler);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&H::Handler> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add() -> RequestMethod {
        RequestMethod::new(|args| Ok(json!(args.f64("a")? + args.f64("b")?)))
            .param("a")
            .param("b")
    }

    #[test]
    fn test_bind_named() {
        let args = add().bind(Some(&json!({"a": 1, "b": 2}))).unwrap();
        assert_eq!(add().invoke(&args).unwrap(), json!(3.0));

        let err = add().bind(Some(&json!({"a": 1}))).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidParams));
        assert_eq!(err.metadata, Some(json!("Missing required parameters: b")));

        let err = add().bind(None).unwrap_err();
        assert_eq!(err.metadata, Some(json!("Missing required parameters: a, b")));
    }

    #[test]
    fn test_bind_positional() {
        let args = add().bind(Some(&json!([5, 3]))).unwrap();
        assert_eq!(args.get("a"), Some(&json!(5)));
        assert_eq!(args.get("b"), Some(&json!(3)));

        let err = add().bind(Some(&json!([5]))).unwrap_err();
        assert_eq!(err.metadata, Some(json!("Method requires 2 positional arguments, got 1")));

        let err = add().bind(Some(&json!([1, 2, 3]))).unwrap_err();
        assert_eq!(err.metadata, Some(json!("Method accepts at most 2 positional arguments, got 3")));

        let err = add().bind(Some(&json!("nope"))).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidParams));
    }

    #[test]
    fn test_defaults_fill_optional_params() {
        let greet = RequestMethod::new(|args| Ok(json!(format!("{} {}", args.str("greeting")?, args.str("name")?))))
            .param("name")
            .param_with_default("greeting", json!("hello"));
        assert_eq!(greet.required_count(), 1);

        let args = greet.bind(Some(&json!({"name": "ada"}))).unwrap();
        assert_eq!(greet.invoke(&args).unwrap(), json!("hello ada"));

        let args = greet.bind(Some(&json!(["ada"]))).unwrap();
        assert_eq!(greet.invoke(&args).unwrap(), json!("hello ada"));

        let args = greet.bind(Some(&json!({"name": "ada", "greeting": "hi", "extra": 1}))).unwrap();
        assert_eq!(greet.invoke(&args).unwrap(), json!("hi ada"));
        assert_eq!(args.get("extra"), Some(&json!(1)));
    }

    #[test]
    fn test_registry_overwrite_and_try_register() {
        let mut registry: HandlerRegistry<RequestHandlerKind> = HandlerRegistry::new();
        registry
            .register("add", add())
            .register("one", RequestMethod::new(|_| Ok(json!(1))));
        registry.register("one", RequestMethod::new(|_| Ok(json!("one"))));

        assert_eq!(registry.names(), vec!["add", "one"]);
        let one = registry.get("one").unwrap();
        assert_eq!(one.invoke(&CallArgs::default()).unwrap(), json!("one"));

        let err = registry
            .try_register("add", RequestMethod::new(|_| Ok(Value::Null)))
            .err()
            .unwrap();
        assert_eq!(err.kind(), Some(ErrorKind::MethodExists));

        assert!(registry.unregister("add"));
        assert!(!registry.contains("add"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_response_registry() {
        let mut registry: HandlerRegistry<ResponseHandlerKind> = HandlerRegistry::new();
        registry.register(DEFAULT_RESPONSE_HANDLER, response_fn(|_, _, _| Ok(())));
        let handler = registry.get(DEFAULT_RESPONSE_HANDLER).unwrap();
        assert!(handler(&json!(1), Some(&json!("ok")), None).is_ok());
    }

    #[test]
    fn test_method_tags() {
        assert!(MethodTag::Both.covers(HandlerType::Request));
        assert!(MethodTag::Both.covers(HandlerType::Response));
        assert!(MethodTag::Request.covers(HandlerType::Request));
        assert!(!MethodTag::Request.covers(HandlerType::Response));
    }
}

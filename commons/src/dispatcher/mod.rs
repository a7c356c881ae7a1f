use log::{debug, error, warn};
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::err::{ErrorKind, ErrorObject};
use crate::handler::{
    HandlerRegistry, HandlerType, MethodProvider, RequestHandlerKind, RequestMethod,
    ResponseHandlerKind, ResponseFn, DEFAULT_RESPONSE_HANDLER,
};
use crate::rpc::{CallId, MessageType, Request, Response};
use crate::tracker::CallTracker;

/// Input accepted by [`Dispatcher::process_message`]: raw JSON text or an already parsed value.
pub enum RawMessage<'a> {
    Text(&'a [u8]),
    Value(Value),
}

impl<'a> From<&'a [u8]> for RawMessage<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        RawMessage::Text(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for RawMessage<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        RawMessage::Text(bytes.as_slice())
    }
}

impl<'a> From<&'a str> for RawMessage<'a> {
    fn from(text: &'a str) -> Self {
        RawMessage::Text(text.as_bytes())
    }
}

impl From<Value> for RawMessage<'_> {
    fn from(value: Value) -> Self {
        RawMessage::Value(value)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Routes parsed messages to registered handlers and is the only producer of protocol errors.
pub struct Dispatcher {
    request_methods: HandlerRegistry<RequestHandlerKind>,
    response_methods: HandlerRegistry<ResponseHandlerKind>,
    tracker: Arc<CallTracker>,
}

impl Dispatcher {
    pub fn new(tracker: Arc<CallTracker>) -> Self {
        Self {
            request_methods: HandlerRegistry::new(),
            response_methods: HandlerRegistry::new(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    pub fn request_methods(&self) -> &HandlerRegistry<RequestHandlerKind> {
        &self.request_methods
    }

    pub fn request_methods_mut(&mut self) -> &mut HandlerRegistry<RequestHandlerKind> {
        &mut self.request_methods
    }

    pub fn response_methods(&self) -> &HandlerRegistry<ResponseHandlerKind> {
        &self.response_methods
    }

    pub fn response_methods_mut(&mut self) -> &mut HandlerRegistry<ResponseHandlerKind> {
        &mut self.response_methods
    }

    pub fn register_request(&mut self, name: &str, method: RequestMethod) -> &mut Self {
        self.request_methods.register(name, method);
        self
    }

    pub fn register_response(&mut self, name: &str, handler: ResponseFn) -> &mut Self {
        self.response_methods.register(name, handler);
        self
    }

    pub fn register_provider(&mut self, provider: &dyn MethodProvider) -> &mut Self {
        let tag = provider.tag();
        if tag.covers(HandlerType::Request) {
            provider.register_requests(&mut self.request_methods);
        }
        if tag.covers(HandlerType::Response) {
            provider.register_responses(&mut self.response_methods);
        }
        self
    }

    /// Builds a request with a fresh id when none is given and tracks it as outgoing.
    pub fn create_request(&self, method: &str, params: Option<Value>, id: Option<Value>) -> Request {
        self.create_request_with_timeout(method, params, id, self.tracker.config().default_timeout)
    }

    pub fn create_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        id: Option<Value>,
        timeout: Duration,
    ) -> Request {
        let id = id.unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        let request = Request::new(method, params, Some(id));
        self.tracker.track_outgoing_request(&request, timeout);
        request
    }

    /// Notifications carry no id and are never tracked.
    pub fn create_notification(&self, method: &str, params: Option<Value>) -> Request {
        Request::notification(method, params)
    }

    pub fn create_response(&self, result: Value, id: Value) -> Response {
        self.tracker.track_outgoing_response(&CallId::from(&id), true);
        Response::success(id, result)
    }

    pub fn create_error(&self, kind: ErrorKind, data: Option<Value>, id: Option<Value>) -> Response {
        self.reply_error(ErrorObject::new(kind, data), id.unwrap_or(Value::Null))
    }

    fn reply_error(&self, error: ErrorObject, id: Value) -> Response {
        self.tracker.track_outgoing_response(&CallId::from(&id), false);
        Response::failure(id, error)
    }

    /// Top-level entry point. Returns the reply to send, or `None` when no reply is due.
    pub fn process_message<'a>(&self, message: impl Into<RawMessage<'a>>) -> Option<Response> {
        let value = match message.into() {
            RawMessage::Text(bytes) => match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to parse message: {}", e);
                    return Some(self.create_error(ErrorKind::ParseError, Some(Value::String(e.to_string())), None));
                }
            },
            RawMessage::Value(value) => value,
        };
        let id_hint = value.get("id").cloned().unwrap_or(Value::Null);

        match MessageType::classify(&value) {
            Ok(MessageType::Request) => match Request::from_wire(&value) {
                Ok(request) => self.process_request(request),
                Err(e) => Some(self.reply_error(e, id_hint)),
            },
            Ok(MessageType::Response) => match Response::from_wire(&value) {
                Ok(response) => {
                    self.process_response(response);
                    None
                }
                Err(e) => Some(self.reply_error(e, id_hint)),
            },
            Err(e) => Some(self.reply_error(e, id_hint)),
        }
    }

    fn process_request(&self, request: Request) -> Option<Response> {
        let notification = request.is_notification();
        if !notification {
            self.tracker.track_incoming_request(&request);
        }
        debug!("Processing request {} (id {:?})", request.method, request.id);

        let outcome = self.execute(&request);
        if notification {
            if let Err(e) = outcome {
                warn!("Notification {} failed: {}", request.method, e);
            }
            return None;
        }

        let id = request.id.unwrap_or(Value::Null);
        Some(match outcome {
            Ok(result) => self.create_response(result, id),
            Err(error) => self.reply_error(error, id),
        })
    }

    fn execute(&self, request: &Request) -> Result<Value, ErrorObject> {
        let method = self.request_methods.get(&request.method).ok_or_else(|| {
            warn!("Method not found: {}", request.method);
            ErrorObject::with_detail(ErrorKind::MethodNotFound, request.method.clone())
        })?;
        let args = method.bind(request.params.as_ref())?;

        match catch_unwind(AssertUnwindSafe(|| method.invoke(&args))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                error!("Error executing method {}: {:#}", request.method, e);
                Err(ErrorObject::with_detail(ErrorKind::InternalError, format!("{:#}", e)))
            }
            Err(panic) => {
                let msg = panic_message(panic);
                error!("Method {} panicked: {}", request.method, msg);
                Err(ErrorObject::with_detail(ErrorKind::InternalError, msg))
            }
        }
    }

    fn process_response(&self, response: Response) {
        let id = response.call_id();
        // must be read before the tracker forgets the outgoing call
        let method = self.tracker.outgoing_method(&id);
        self.tracker.track_incoming_response(&response);

        let handler = method
            .as_deref()
            .and_then(|name| self.response_methods.get(name))
            .or_else(|| self.response_methods.get(DEFAULT_RESPONSE_HANDLER));
        let Some(handler) = handler else {
            warn!(
                "No response handler for {} (method {:?}) and no default, dropping",
                id, method
            );
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| {
            handler(&response.id, response.result(), response.error())
        })) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Response handler for {} failed: {:#}", id, e),
            Err(panic) => error!("Response handler for {} panicked: {}", id, panic_message(panic)),
        }
    }
}

use anyhow::Result;
use commons::dispatcher::Dispatcher;
use commons::handler::RequestMethod;
use commons::methods::BuiltinMethods;

/// Register the request and response methods this server answers to.
pub fn register_handlers(dispatcher: &mut Dispatcher) -> Result<()> {
    dispatcher
        .register_provider(&BuiltinMethods)
        .request_methods_mut()
        .try_register("health", RequestMethod::new(crate::health::check))?;
    Ok(())
}

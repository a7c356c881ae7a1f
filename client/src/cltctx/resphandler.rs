use anyhow::Result;
use commons::dispatcher::Dispatcher;
use commons::handler::response_fn;
use commons::methods::BuiltinMethods;
use log::{info, warn};

/// Register response handlers for replies coming back from the peer
pub fn register_handlers(dispatcher: &mut Dispatcher) -> Result<()> {
    dispatcher.register_provider(&BuiltinMethods).register_response(
        "health",
        response_fn(|id, result, error| {
            match (result, error) {
                (Some(status), _) => info!("Peer health ({}): {}", id, status),
                (None, Some(error)) => warn!("Peer health check {} failed: {}", id, error),
                (None, None) => warn!("Peer health check {} returned nothing", id),
            }
            Ok(())
        }),
    );
    Ok(())
}

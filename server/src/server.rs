use anyhow::Result;
use commons::dispatcher::Dispatcher;
use commons::tracker::{CallTracker, TrackerConfig};
use log::info;

mod health;
mod srvctx;

use srvctx::{ServerConfig, ServerContext};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let tracker = CallTracker::shared(TrackerConfig::from_env());
    tracker.start_monitoring(None);

    let mut dispatcher = Dispatcher::new(tracker.clone());
    srvctx::register_handlers(&mut dispatcher)?;
    info!("Registered request methods: {:?}", dispatcher.request_methods().names());

    let server = ServerContext::bind(config, dispatcher)?;
    let host = hostname::get()?.to_string_lossy().into_owned();
    info!("Server on {} listening at {}", host, server.local_addr()?);

    let result = server.serve();
    tracker.stop_monitoring();
    result
}

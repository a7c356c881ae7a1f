use anyhow::{anyhow, Context, Result};
use commons::bench::RunStats;
use commons::dispatcher::Dispatcher;
use commons::err::TransportError;
use commons::proxy::envelope::EnvelopeConfig;
use commons::proxy::RecordProxy;
use commons::rpc::tcp::{TcpTransport, Transport};
use commons::rpc::Response;
use commons::tracker::{CallTracker, TrackerConfig};
use commons::utils::EnvUtility;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

mod resphandler;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Used for the connect attempt and as the socket read/write timeout.
    pub timeout: Duration,
    pub no_delay: bool,
    /// Run the tracker's background sweep while connected.
    pub monitor: bool,
    pub envelope: EnvelopeConfig,
    pub record_version: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2001,
            timeout: Duration::from_secs(10),
            no_delay: true,
            monitor: true,
            envelope: EnvelopeConfig::default(),
            record_version: 0,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: EnvUtility::string_or("NEURORPC_HOST", &defaults.host),
            port: EnvUtility::parse_or("NEURORPC_PORT", defaults.port),
            timeout: EnvUtility::duration_ms_or("NEURORPC_TIMEOUT_MS", defaults.timeout),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EchoBenchmarkPlan {
    pub sizes: Vec<usize>,
    pub iterations: usize,
    pub rounds: usize,
}

impl Default for EchoBenchmarkPlan {
    fn default() -> Self {
        Self {
            sizes: Self::linspace(0, 9600, 21),
            iterations: 10,
            rounds: 3,
        }
    }
}

impl EchoBenchmarkPlan {
    /// `steps` evenly spaced sizes from `start` to `end`, both included.
    pub fn linspace(start: usize, end: usize, steps: usize) -> Vec<usize> {
        match steps {
            0 => Vec::new(),
            1 => vec![start],
            _ => (0..steps)
                .map(|i| start + (end - start) * i / (steps - 1))
                .collect(),
        }
    }
}

/// Decoded reply of an enveloped call, with the frame length and the trailer it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub size: usize,
    pub response: Response,
    pub exec_time: u32,
}

pub struct ClientContext<T: Transport = TcpTransport> {
    config: ClientConfig,
    transport: T,
    dispatcher: Dispatcher,
    proxy: RecordProxy,
}

impl ClientContext<TcpTransport> {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::new(config.no_delay);
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> ClientContext<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Result<Self> {
        let mut dispatcher = Dispatcher::new(CallTracker::shared(TrackerConfig::from_env()));
        resphandler::register_handlers(&mut dispatcher)?;
        let proxy = RecordProxy::default().with_version(config.record_version);
        Ok(Self {
            config,
            transport,
            dispatcher,
            proxy,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        self.dispatcher.tracker()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// One attempt with the configured timeout. Starts the tracker sweep if enabled.
    pub fn connect(&mut self) -> Result<()> {
        self.transport
            .connect(&self.config.host, self.config.port, self.config.timeout)?;
        if self.config.monitor && self.tracker().start_monitoring(None) {
            debug!("Call tracker monitoring started");
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn send_message(&mut self, message: &Value) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.transport.send_frame(&payload, 0)?;
        Ok(())
    }

    pub fn receive_message(&mut self) -> Result<Value> {
        let frame = self.transport.recv_frame()?;
        let value = serde_json::from_slice(&frame.payload)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        Ok(value)
    }

    /// Sends a JSON request and waits for the reply carrying its id.
    ///
    /// Replies to earlier calls that arrive first, e.g. after a timeout, are
    /// routed through the dispatcher so the tracker closes them, then skipped.
    pub fn call(&mut self, method: &str, params: Option<Value>) -> Result<Response> {
        let request = self.dispatcher.create_request(method, params, None);
        self.send_message(&request.to_wire())?;
        let expected = request.id.unwrap_or(Value::Null);

        loop {
            let reply = self.receive_message()?;
            let response = Response::from_wire(&reply)
                .map_err(|e| anyhow!("Invalid reply to {}: {}", method, e))?;
            self.dispatcher.process_message(reply);
            if response.id == expected {
                return Ok(response);
            }
            warn!("Skipping stale reply {} while waiting for {}", response.id, expected);
        }
    }

    pub fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let request = self.dispatcher.create_notification(method, params);
        self.send_message(&request.to_wire())
    }

    /// Enveloped call. The reply is decoded with the descriptor of the request just sent.
    pub fn rpc(&mut self, method: &str, params: Value, expect_response: bool) -> Result<Option<RpcReply>> {
        let request = self.dispatcher.create_request(method, Some(params), None);
        let encoded = self.proxy.to_envelope(&request, &self.config.envelope)?;
        self.transport.send_frame(&encoded.bytes, 0)?;
        if !expect_response {
            return Ok(None);
        }

        let frame = self.transport.recv_frame()?;
        let response = self
            .proxy
            .from_envelope(&frame.payload, &encoded.descriptor)
            .with_context(|| format!("Failed to decode reply to {}", method))?
            .with_exec_time(frame.trailer as i64);
        Ok(Some(RpcReply {
            size: frame.length() as usize,
            response,
            exec_time: frame.trailer,
        }))
    }

    pub fn echo(&mut self, message: &str) -> Result<RpcReply> {
        let reply = self
            .rpc("echo", json!({ "Message": message }), true)?
            .ok_or_else(|| anyhow!("echo expects a reply"))?;
        self.dispatcher.process_message(reply.response.to_wire());
        self.tracker()
            .set_exec_time(&reply.response.call_id(), reply.exec_time as i64);
        Ok(reply)
    }

    /// Runs one benchmark run per round, each covering every payload size, and returns their stats.
    pub fn echo_benchmark(&mut self, plan: &EchoBenchmarkPlan) -> Result<Vec<RunStats>> {
        let tracker = self.tracker().clone();
        let mut all = Vec::with_capacity(plan.rounds);
        for round in 0..plan.rounds {
            let run = tracker.start_benchmark(None);
            let outcome = plan.sizes.iter().try_for_each(|&size| {
                let payload = "X".repeat(size);
                (0..plan.iterations).try_for_each(|_| self.echo(&payload).map(|_| ()))
            });
            let stats = tracker.stop_benchmark(Some(&run))?;
            outcome?;
            info!(
                "round {}: {} ok over {} sizes, total {:.3}ms, exec {:.3}ms, network {:.3}ms",
                round,
                stats.completed,
                plan.sizes.len(),
                stats.avg_total_latency_ms,
                stats.avg_exec_time_ms,
                stats.avg_network_latency_ms
            );
            all.push(stats);
        }
        Ok(all)
    }

    pub fn export_benchmark(&self, path: impl AsRef<Path>) -> Result<()> {
        self.tracker().export_benchmark(path)?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.tracker().stop_monitoring();
        self.disconnect();
    }
}

use anyhow::{Context, Result};
use commons::aop;
use commons::dispatcher::Dispatcher;
use commons::err::TransportError;
use commons::rpc::tcp::{TcpTransport, Transport};
use commons::utils::{EnvUtility, TimeUtility};
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadpool::ThreadPool;
use tokio::sync::Semaphore;

mod reqhandler;
pub use reqhandler::register_handlers;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub no_delay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6363,
            max_connections: Self::num_cpus_limit(),
            read_timeout: Duration::from_secs(30),
            no_delay: true,
        }
    }
}

impl ServerConfig {
    fn num_cpus_limit() -> usize {
        (2 * num_cpus::get()).max(4)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: EnvUtility::string_or("NEURORPC_HOST", &defaults.host),
            port: EnvUtility::parse_or("NEURORPC_PORT", defaults.port),
            max_connections: EnvUtility::parse_or("NEURORPC_MAX_CONNECTIONS", defaults.max_connections).max(1),
            ..defaults
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Asks a running [`ServerContext::serve`] loop to return.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // accept() only returns on a new connection, so knock once
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            debug!("Wake-up connect to {} failed: {}", wake, e);
        }
    }
}

pub struct ServerContext {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    limiter: Arc<Semaphore>,
    pool: ThreadPool,
    stop: Arc<AtomicBool>,
}

impl ServerContext {
    pub fn bind(config: ServerConfig, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(config.address())
            .with_context(|| format!("Failed to bind {}", config.address()))?;
        let limiter = Arc::new(Semaphore::new(config.max_connections));
        let pool = ThreadPool::with_name("neurorpc-conn".to_string(), config.max_connections);
        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            listener,
            limiter,
            pool,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> Result<ServerHandle> {
        Ok(ServerHandle {
            stop: self.stop.clone(),
            addr: self.local_addr()?,
        })
    }

    /// Accepts connections until [`ServerHandle::stop`] is called, then waits for workers.
    pub fn serve(self) -> Result<()> {
        info!(
            "Serving on {} with up to {} connections",
            self.local_addr()?,
            self.config.max_connections
        );
        for incoming in self.listener.incoming() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let permit = match self.limiter.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "Connection limit of {} reached, rejecting {:?}",
                        self.config.max_connections,
                        stream.peer_addr().ok()
                    );
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
            };

            let dispatcher = self.dispatcher.clone();
            let stop = self.stop.clone();
            let config = self.config.clone();
            self.pool.execute(move || {
                let _permit = permit;
                if let Err(e) = handle_connection(stream, &dispatcher, &config, &stop) {
                    error!("Connection handler failed: {:#}", e);
                }
            });
        }
        info!("Server loop stopped, waiting for {} active connections", self.pool.active_count());
        self.pool.join();
        Ok(())
    }
}

/// Dispatches one JSON payload. Returns the encoded reply and its exec time in microseconds.
pub fn process_frame(dispatcher: &Dispatcher, payload: &[u8]) -> Option<(Vec<u8>, u32)> {
    let (reply, elapsed) = aop::timed("dispatch", || dispatcher.process_message(payload));
    let exec_time = TimeUtility::duration_us_u32(elapsed);
    let reply = reply?.with_exec_time(exec_time as i64);
    match serde_json::to_vec(&reply.to_wire()) {
        Ok(bytes) => Some((bytes, exec_time)),
        Err(e) => {
            error!("Failed to serialize reply for {}: {}", reply.id, e);
            None
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
    stop: &AtomicBool,
) -> Result<()> {
    let mut transport = TcpTransport::from_stream(stream, config.no_delay)?;
    transport.set_read_timeout(Some(config.read_timeout))?;
    let peer = transport.peer_addr();
    info!("Connection opened: {:?}", peer);

    loop {
        let frame = match transport.recv_frame() {
            Ok(frame) => frame,
            // idle between frames; a started frame never surfaces as Timeout
            Err(TransportError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(TransportError::ConnectionClosed) => break,
            Err(TransportError::MalformedFrame(reason)) => {
                warn!("Malformed frame from {:?}: {}", peer, reason);
                break;
            }
            Err(e @ TransportError::Stalled { .. }) => {
                warn!("Dropping {:?}: {}", peer, e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Received {} bytes from {:?}", frame.payload.len(), peer);

        if let Some((reply, exec_time)) = process_frame(dispatcher, &frame.payload) {
            transport.send_frame(&reply, exec_time)?;
        }
    }

    transport.close();
    info!("Connection closed: {:?}", peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commons::err::ErrorKind;
    use commons::rpc::frame::FrameCodec;
    use commons::rpc::Response;
    use commons::tracker::{CallTracker, TrackerConfig};
    use serde_json::{json, Value};
    use std::thread;

    fn start(max_connections: usize) -> (ServerHandle, SocketAddr, thread::JoinHandle<()>) {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            read_timeout: Duration::from_millis(200),
            no_delay: true,
        };
        let mut dispatcher = Dispatcher::new(CallTracker::shared(TrackerConfig::default()));
        register_handlers(&mut dispatcher).unwrap();
        let server = ServerContext::bind(config, dispatcher).unwrap();
        let handle = server.handle().unwrap();
        let addr = server.local_addr().unwrap();
        let join = thread::spawn(move || server.serve().unwrap());
        (handle, addr, join)
    }

    fn connect(addr: SocketAddr) -> TcpTransport {
        let mut transport = TcpTransport::new(true);
        transport
            .connect("127.0.0.1", addr.port(), Duration::from_secs(5))
            .unwrap();
        transport
    }

    fn exchange(transport: &mut TcpTransport, message: Value) -> (Response, u32) {
        transport
            .send_frame(&serde_json::to_vec(&message).unwrap(), 0)
            .unwrap();
        let frame = transport.recv_frame().unwrap();
        let value: Value = serde_json::from_slice(&frame.payload).unwrap();
        (Response::from_wire(&value).unwrap(), frame.trailer)
    }

    #[test]
    fn test_echo_over_loopback() {
        let (handle, addr, join) = start(4);
        let mut client = connect(addr);

        let (reply, trailer) = exchange(
            &mut client,
            json!({"jsonrpc": "2.0", "method": "echo", "params": {"message": "hi"}, "id": "x1"}),
        );
        assert_eq!(reply.id, json!("x1"));
        assert_eq!(reply.result(), Some(&json!("hi")));
        assert_eq!(reply.exec_time, Some(trailer as i64));

        let (reply, _) = exchange(&mut client, json!({"jsonrpc": "2.0", "method": "health", "id": 2}));
        assert_eq!(reply.result().unwrap()["status"], json!("ok"));

        let (reply, _) = exchange(&mut client, json!({"jsonrpc": "2.0", "method": "missing", "id": 3}));
        assert_eq!(reply.error().unwrap().kind(), Some(ErrorKind::MethodNotFound));

        client.close();
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_notification_gets_no_reply() {
        let (handle, addr, join) = start(4);
        let mut client = connect(addr);

        let note = json!({"jsonrpc": "2.0", "method": "echo", "params": {"message": "quiet"}});
        client.send_frame(&serde_json::to_vec(&note).unwrap(), 0).unwrap();
        let (reply, _) = exchange(&mut client, json!({"jsonrpc": "2.0", "method": "add", "params": [1, 2], "id": 9}));
        assert_eq!(reply.id, json!(9));
        assert_eq!(reply.result(), Some(&json!(3)));

        client.close();
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_admission_limit_rejects_extra_connections() {
        let (handle, addr, join) = start(1);
        let mut first = connect(addr);
        let (reply, _) = exchange(&mut first, json!({"jsonrpc": "2.0", "method": "echo", "params": ["a"], "id": 1}));
        assert_eq!(reply.result(), Some(&json!("a")));

        let mut second = connect(addr);
        assert!(matches!(
            second.recv_exactly(4),
            Err(TransportError::ConnectionClosed)
        ));

        first.close();
        second.close();
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_slow_peer_frame_survives_read_timeout() {
        let (handle, addr, join) = start(4);
        let mut client = connect(addr);

        let request = json!({"jsonrpc": "2.0", "method": "echo", "params": {"message": "hi"}, "id": "slow"});
        let bytes = FrameCodec::encode(&serde_json::to_vec(&request).unwrap(), 0).unwrap();
        client.send_all(&bytes[..9]).unwrap();
        thread::sleep(Duration::from_millis(600));
        client.send_all(&bytes[9..]).unwrap();

        let frame = client.recv_frame().unwrap();
        let value: Value = serde_json::from_slice(&frame.payload).unwrap();
        let reply = Response::from_wire(&value).unwrap();
        assert_eq!(reply.id, json!("slow"));
        assert_eq!(reply.result(), Some(&json!("hi")));

        let (reply, _) = exchange(&mut client, json!({"jsonrpc": "2.0", "method": "add", "params": [2, 3], "id": 4}));
        assert_eq!(reply.result(), Some(&json!(5)));

        client.close();
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_garbage_payload_gets_parse_error() {
        let dispatcher = Dispatcher::new(CallTracker::shared(TrackerConfig::default()));
        let (bytes, exec_time) = process_frame(&dispatcher, b"not json").unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], json!(ErrorKind::ParseError.code()));
        assert_eq!(value["exec_time"], json!(exec_time));
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:6363");
        assert!(config.max_connections >= 4);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
    }
}

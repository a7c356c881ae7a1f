use log::{debug, info, warn};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::err::TransportError;
use crate::rpc::frame::{read_exactly, Frame, FrameCodec};

/// Duplex byte stream the client talks through.
pub trait Transport {
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError>;
    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn recv_exactly(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;
    /// Reads one whole frame. `Timeout` means no byte of it had arrived yet.
    fn recv_frame(&mut self) -> Result<Frame, TransportError>;
    fn close(&mut self);
    fn is_connected(&self) -> bool;

    fn send_frame(&mut self, payload: &[u8], trailer: u32) -> Result<(), TransportError> {
        self.send_all(&FrameCodec::encode(payload, trailer)?)
    }
}

pub struct TcpTransport {
    stream: Option<TcpStream>,
    no_delay: bool,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(no_delay: bool) -> Self {
        Self {
            stream: None,
            no_delay,
            peer: None,
        }
    }

    /// Wraps an already connected stream, e.g. one returned by `accept`.
    pub fn from_stream(stream: TcpStream, no_delay: bool) -> Result<Self, TransportError> {
        stream.set_nodelay(no_delay)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream: Some(stream),
            no_delay,
            peer,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.stream()?.set_read_timeout(timeout)?;
        Ok(())
    }

    fn stream(&self) -> Result<&TcpStream, TransportError> {
        self.stream.as_ref().ok_or(TransportError::NotConnected)
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError> {
        if self.stream.is_some() {
            debug!("Already connected to {:?}", self.peer);
            return Ok(());
        }
        let addr_str = format!("{}:{}", host, port);
        let addr = addr_str
            .to_socket_addrs()
            .map_err(|source| TransportError::Connect {
                addr: addr_str.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::Connect {
                addr: addr_str.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
            })?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|source| {
            TransportError::Connect {
                addr: addr_str.clone(),
                source,
            }
        })?;
        stream.set_nodelay(self.no_delay)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        info!("Connected to {}", addr);
        self.peer = Some(addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        stream.write_all(bytes).map_err(TransportError::from_io)?;
        stream.flush().map_err(TransportError::from_io)
    }

    fn recv_exactly(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut()?;
        read_exactly(stream, n)
    }

    fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        FrameCodec::decode(self.stream_mut()?)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                warn!("Error shutting down connection to {:?}: {}", self.peer, e);
            }
            info!("Disconnected from {:?}", self.peer);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_not_connected() {
        let mut transport = TcpTransport::new(true);
        assert!(!transport.is_connected());
        assert!(matches!(transport.send_all(b"x"), Err(TransportError::NotConnected)));
        assert!(matches!(transport.recv_exactly(1), Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_frame_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = FrameCodec::decode(&mut stream).unwrap();
            let reply = FrameCodec::encode(&frame.payload, frame.trailer + 1).unwrap();
            stream.write_all(&reply).unwrap();
        });

        let mut transport = TcpTransport::new(true);
        transport.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        transport.send_frame(b"ping", 41).unwrap();
        let frame = transport.recv_frame().unwrap();
        assert_eq!(frame.payload, b"ping".to_vec());
        assert_eq!(frame.trailer, 42);

        peer.join().unwrap();
        assert!(matches!(transport.recv_exactly(4), Err(TransportError::ConnectionClosed)));
        transport.close();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut transport = TcpTransport::new(true);
        let result = transport.connect("127.0.0.1", port, Duration::from_millis(500));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}

use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use std::io::{self, Read};

use crate::err::TransportError;

// Frame format:
// [4 bytes] length, big endian, covers payload + trailer
// [N bytes] payload
// [4 bytes] trailer, big endian (exec time in microseconds, or 0)

pub const LENGTH_SIZE: usize = 4;
pub const TRAILER_SIZE: usize = 4;
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;
/// Consecutive read timeouts tolerated once a frame has started arriving.
pub const MAX_MID_FRAME_STALLS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub trailer: u32,
}

impl Frame {
    pub fn new(payload: Vec<u8>, trailer: u32) -> Self {
        Self { payload, trailer }
    }

    /// Splits a length-checked body into payload and trailer.
    pub fn from_body(mut body: Vec<u8>) -> Self {
        let tail = body.split_off(body.len() - TRAILER_SIZE);
        let trailer = (&tail[..]).get_u32();
        Self::new(body, trailer)
    }

    /// Value written into the length header.
    pub fn length(&self) -> u32 {
        (self.payload.len() + TRAILER_SIZE) as u32
    }
}

pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(payload: &[u8], trailer: u32) -> Result<Vec<u8>, TransportError> {
        let length = payload.len() + TRAILER_SIZE;
        check_length(length)?;
        let mut buf = BytesMut::with_capacity(LENGTH_SIZE + length);
        buf.put_u32(length as u32);
        buf.put_slice(payload);
        buf.put_u32(trailer);
        Ok(buf.to_vec())
    }

    /// Reads one full frame from `reader`, blocking until it is complete.
    ///
    /// A read timeout before the first header byte surfaces as
    /// [`TransportError::Timeout`] and leaves the stream aligned. Once the
    /// frame has started, timeouts are retried so the stream never resumes
    /// mid-frame; a peer that stays silent for [`MAX_MID_FRAME_STALLS`]
    /// consecutive timeouts yields [`TransportError::Stalled`].
    pub fn decode<R: Read>(reader: &mut R) -> Result<Frame, TransportError> {
        let header = read_into(reader, LENGTH_SIZE, false)?;
        let length = Self::parse_length(&header)?;
        let body = read_into(reader, length, true)?;
        Ok(Frame::from_body(body))
    }

    /// Validates a 4-byte length header and returns the announced body size.
    pub fn parse_length(header: &[u8]) -> Result<usize, TransportError> {
        if header.len() != LENGTH_SIZE {
            return Err(TransportError::MalformedFrame(format!(
                "length header must be {} bytes, got {}",
                LENGTH_SIZE,
                header.len()
            )));
        }
        let length = (&header[..]).get_u32() as usize;
        check_length(length)?;
        Ok(length)
    }

    /// Decodes a frame that is already fully buffered.
    pub fn decode_slice(buf: &[u8]) -> Result<Frame, TransportError> {
        if buf.len() < LENGTH_SIZE {
            return Err(TransportError::MalformedFrame(format!(
                "buffer of {} bytes is shorter than the length header",
                buf.len()
            )));
        }
        let mut cursor = buf;
        let length = cursor.get_u32() as usize;
        check_length(length)?;
        if cursor.remaining() != length {
            return Err(TransportError::MalformedFrame(format!(
                "header announces {} bytes but {} follow",
                length,
                cursor.remaining()
            )));
        }
        Ok(Frame::from_body(cursor.to_vec()))
    }
}

fn check_length(length: usize) -> Result<(), TransportError> {
    if length < TRAILER_SIZE {
        return Err(TransportError::MalformedFrame(format!(
            "length {} is smaller than the {}-byte trailer",
            length, TRAILER_SIZE
        )));
    }
    if length > MAX_FRAME_SIZE {
        return Err(TransportError::MalformedFrame(format!(
            "length {} exceeds maximum of {}",
            length, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Loops until exactly `n` bytes are read. A zero-byte read means the peer closed.
/// Timeouts only surface as [`TransportError::Timeout`] while nothing has been read.
pub fn read_exactly<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u8>, TransportError> {
    read_into(reader, n, false)
}

fn read_into<R: Read>(reader: &mut R, n: usize, mut started: bool) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    let mut stalls = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(read) => {
                filled += read;
                started = true;
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => match TransportError::from_io(e) {
                TransportError::Timeout if started => {
                    stalls += 1;
                    if stalls >= MAX_MID_FRAME_STALLS {
                        return Err(TransportError::Stalled { received: filled, expected: n });
                    }
                    debug!("Peer stalled mid-frame at {}/{} bytes, waiting", filled, n);
                }
                other => return Err(other),
            },
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `chunk` bytes per read call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = (self.pos + self.chunk).min(self.data.len()).min(self.pos + buf.len());
            let n = end - self.pos;
            buf[..n].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = FrameCodec::encode(b"abc", 0x01020304).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 7, b'a', b'b', b'c', 1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_reads_back_payload_and_trailer() {
        let payload = br#"{"jsonrpc":"2.0","method":"echo"}"#.to_vec();
        let bytes = FrameCodec::encode(&payload, 1234).unwrap();
        let frame = FrameCodec::decode(&mut Cursor::new(bytes.clone())).unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.trailer, 1234);
        assert_eq!(frame.length() as usize, payload.len() + TRAILER_SIZE);

        assert_eq!(FrameCodec::decode_slice(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_empty_payload() {
        let bytes = FrameCodec::encode(&[], 0).unwrap();
        let frame = FrameCodec::decode(&mut Cursor::new(bytes)).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.trailer, 0);
    }

    #[test]
    fn test_decode_survives_short_reads() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut reader = Trickle {
            data: FrameCodec::encode(&payload, 99).unwrap(),
            pos: 0,
            chunk: 3,
        };
        let frame = FrameCodec::decode(&mut reader).unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.trailer, 99);
    }

    #[test]
    fn test_truncated_stream_is_connection_closed() {
        let mut bytes = FrameCodec::encode(b"hello", 5).unwrap();
        bytes.truncate(6);
        let result = FrameCodec::decode(&mut Cursor::new(bytes));
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        let result = FrameCodec::decode(&mut Cursor::new(Vec::new()));
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_malformed_lengths() {
        let too_short = vec![0, 0, 0, 2, 9, 9];
        assert!(matches!(
            FrameCodec::decode(&mut Cursor::new(too_short)),
            Err(TransportError::MalformedFrame(_))
        ));

        let huge = vec![0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            FrameCodec::decode(&mut Cursor::new(huge)),
            Err(TransportError::MalformedFrame(_))
        ));

        let mut trailing = FrameCodec::encode(b"x", 1).unwrap();
        trailing.push(0);
        assert!(matches!(
            FrameCodec::decode_slice(&trailing),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    /// Replays a script of byte chunks and read timeouts.
    struct Stutter {
        steps: Vec<Option<Vec<u8>>>,
    }

    impl Read for Stutter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.steps.is_empty() {
                return Ok(0);
            }
            match self.steps.remove(0) {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.steps.insert(0, Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out")),
            }
        }
    }

    #[test]
    fn test_timeout_before_header_is_idle() {
        let mut reader = Stutter { steps: vec![None] };
        assert!(matches!(
            FrameCodec::decode(&mut reader),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_timeout_mid_frame_keeps_reading() {
        let bytes = FrameCodec::encode(b"hello world", 3).unwrap();
        let mut reader = Stutter {
            steps: vec![
                Some(bytes[..2].to_vec()),
                None,
                Some(bytes[2..9].to_vec()),
                None,
                None,
                Some(bytes[9..].to_vec()),
            ],
        };
        let frame = FrameCodec::decode(&mut reader).unwrap();
        assert_eq!(frame.payload, b"hello world".to_vec());
        assert_eq!(frame.trailer, 3);
    }

    #[test]
    fn test_silent_peer_mid_frame_is_stalled() {
        let bytes = FrameCodec::encode(b"hello", 0).unwrap();
        let mut steps = vec![Some(bytes[..6].to_vec())];
        steps.extend((0..MAX_MID_FRAME_STALLS).map(|_| None));
        let mut reader = Stutter { steps };
        assert!(matches!(
            FrameCodec::decode(&mut reader),
            Err(TransportError::Stalled { received: 2, expected: 9 })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE - TRAILER_SIZE + 1];
        assert!(matches!(
            FrameCodec::encode(&payload, 0),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(FrameCodec::encode(&payload[1..], 0).is_ok());
    }
}

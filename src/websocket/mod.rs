//! Minimal blocking WebSocket client.
//!
//! Covers the subset of RFC 6455 an ndt7 client uses: the opening
//! handshake with a subprotocol, masked client frames, message
//! reassembly, ping/pong, the close handshake and a read size limit.

pub mod frame;
pub mod handshake;

use frame::{
    close_payload, encode_frame, parse_close_payload, FrameHeader, OpCode,
    CLOSE_NORMAL,
};
use log::debug;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Size of the internal read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Errors from the WebSocket layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("I/O deadline expired")]
    Timeout,

    #[error("connection closed without a close frame")]
    UnexpectedEof,

    #[error("connection closed by peer (code {code}) {reason}")]
    Closed { code: u16, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: usize },

    #[error("invalid handshake: {0}")]
    Handshake(String),
}

impl Error {
    /// Whether this is the peer's normal closure (code 1000).
    pub fn is_normal_closure(&self) -> bool {
        matches!(self, Error::Closed { code: CLOSE_NORMAL, .. })
    }

    /// The closest I/O error kind, for classifying failures.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Io(err) => err.kind(),
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            Error::Closed { .. } => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::InvalidData,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::Io(err),
        }
    }
}

/// A byte stream a WebSocket can run over.
///
/// Timeouts are adjusted per read so that a whole message can be bounded
/// by a single deadline.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close both directions of the underlying connection.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }
}

/// A complete data message.
///
/// Text payloads are handed over as received. Checking that they are
/// UTF-8 is left to whoever decodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

impl Message {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Message::Text(data) | Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffered reader over the transport whose reads honour a deadline.
struct Inbound<S> {
    stream: S,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    deadline: Option<Instant>,
}

impl<S: Transport> Inbound<S> {
    /// One read from the transport into `buf`, bounded by the deadline.
    fn fill(&mut self) -> io::Result<usize> {
        let Some(deadline) = self.deadline else {
            return self.stream.read(&mut self.buf);
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline expired",
                ));
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut self.buf) {
                // Socket timeouts can fire slightly before the deadline.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }
}

impl<S: Transport> Read for Inbound<S> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.filled {
            let n = self.fill()?;
            if n == 0 {
                return Ok(0);
            }
            self.pos = 0;
            self.filled = n;
        }

        let n = out.len().min(self.filled - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Client end of an established WebSocket connection.
pub struct WebSocket<S: Transport> {
    inbound: Inbound<S>,
    write_buf: Vec<u8>,
    max_message_size: usize,
    close_sent: bool,
}

impl<S: Transport> WebSocket<S> {
    /// Wrap a stream on which the opening handshake already completed.
    pub fn from_handshaken(stream: S, max_message_size: usize) -> Self {
        Self {
            inbound: Inbound {
                stream,
                buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
                pos: 0,
                filled: 0,
                deadline: None,
            },
            write_buf: Vec::new(),
            max_message_size,
            close_sent: false,
        }
    }

    /// Read the next data message, answering pings on the way.
    ///
    /// The whole message must arrive within `timeout`. A Close frame from
    /// the server is answered and reported as [`Error::Closed`].
    pub fn read_message(&mut self, timeout: Duration) -> Result<Message, Error> {
        self.inbound.deadline = Some(Instant::now() + timeout);
        let result = self.read_message_inner();
        self.inbound.deadline = None;
        result
    }

    fn read_message_inner(&mut self) -> Result<Message, Error> {
        let mut partial: Option<(OpCode, Vec<u8>)> = None;

        loop {
            let header = FrameHeader::read_from(&mut self.inbound)?;
            let buffered = partial.as_ref().map_or(0, |(_, data)| data.len() as u64);
            let size = buffered + header.payload_len;
            if !header.opcode.is_control() && size > self.max_message_size as u64 {
                return Err(Error::MessageTooLarge { size, max: self.max_message_size });
            }

            let mut payload = vec![0u8; header.payload_len as usize];
            self.inbound.read_exact(&mut payload)?;

            match header.opcode {
                OpCode::Ping => {
                    debug!("answering ping of {} bytes", payload.len());
                    self.write_frame(OpCode::Pong, &payload)?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let (code, reason) = parse_close_payload(&payload)?;
                    debug!("received close frame: {} {}", code, reason);
                    if !self.close_sent {
                        // Echo the code back unless the server sent none.
                        let reply = if payload.is_empty() {
                            Vec::new()
                        } else {
                            close_payload(code, "")
                        };
                        let _ = self.write_frame(OpCode::Close, &reply);
                        self.close_sent = true;
                    }
                    return Err(Error::Closed { code, reason });
                }
                OpCode::Text | OpCode::Binary => {
                    if partial.is_some() {
                        return Err(Error::Protocol(
                            "new message before previous one finished".into(),
                        ));
                    }
                    if header.fin {
                        return Ok(into_message(header.opcode, payload));
                    }
                    partial = Some((header.opcode, payload));
                }
                OpCode::Continuation => {
                    let Some((opcode, mut data)) = partial.take() else {
                        return Err(Error::Protocol(
                            "continuation without a message".into(),
                        ));
                    };
                    data.extend_from_slice(&payload);
                    if header.fin {
                        return Ok(into_message(opcode, data));
                    }
                    partial = Some((opcode, data));
                }
            }
        }
    }

    /// Send one binary message.
    pub fn write_binary(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.write_frame(OpCode::Binary, payload)
    }

    fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        encode_frame(&mut self.write_buf, opcode, payload, Some(rand::random()));
        let stream = &mut self.inbound.stream;
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    /// Start the close handshake with a normal closure, if not done yet.
    pub fn send_close(&mut self) -> Result<(), Error> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        self.write_frame(OpCode::Close, &close_payload(CLOSE_NORMAL, ""))
    }

    /// Send a Close frame if needed and shut the transport down.
    pub fn close(&mut self) -> Result<(), Error> {
        let sent = self.send_close();
        let shutdown = self.inbound.stream.shutdown();
        sent?;
        match shutdown {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn into_message(opcode: OpCode, data: Vec<u8>) -> Message {
    match opcode {
        OpCode::Text => Message::Text(data),
        _ => Message::Binary(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory transport: reads from a script, records writes.
    #[derive(Clone, Default)]
    struct MemoryTransport {
        pub incoming: Arc<Mutex<VecDeque<u8>>>,
        pub outgoing: Arc<Mutex<Vec<u8>>>,
        pub shut_down: Arc<Mutex<bool>>,
    }

    impl MemoryTransport {
        pub fn push_frame(&self, opcode: OpCode, fin: bool, payload: &[u8]) {
            let mut bytes = Vec::new();
            encode_frame(&mut bytes, opcode, payload, None);
            if !fin {
                bytes[0] &= 0x7F;
            }
            self.incoming.lock().unwrap().extend(bytes);
        }
    }

    impl Read for MemoryTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.lock().unwrap();
            if incoming.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            let n = buf.len().min(incoming.len());
            for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MemoryTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MemoryTransport {
        fn set_read_timeout(&mut self, _: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn set_write_timeout(&mut self, _: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&mut self) -> io::Result<()> {
            *self.shut_down.lock().unwrap() = true;
            Ok(())
        }
    }

    /// Decode the client's masked frames from raw written bytes.
    fn decode_client_frames(mut bytes: &[u8]) -> Vec<(OpCode, Vec<u8>)> {
        let mut frames = Vec::new();
        while bytes.len() >= 2 {
            let opcode = OpCode::from_u8(bytes[0] & 0x0F).unwrap();
            assert!(bytes[1] & 0x80 != 0, "client frames must be masked");
            let (len, mut offset) = match bytes[1] & 0x7F {
                126 => (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4),
                127 => {
                    let mut ext = [0u8; 8];
                    ext.copy_from_slice(&bytes[2..10]);
                    (u64::from_be_bytes(ext) as usize, 10)
                }
                len => (len as usize, 2),
            };
            let mut key = [0u8; 4];
            key.copy_from_slice(&bytes[offset..offset + 4]);
            offset += 4;
            let mut payload = bytes[offset..offset + len].to_vec();
            frame::apply_mask(&mut payload, key);
            frames.push((opcode, payload));
            bytes = &bytes[offset + len..];
        }
        frames
    }

    fn socket(transport: &MemoryTransport) -> WebSocket<MemoryTransport> {
        WebSocket::from_handshaken(transport.clone(), 1 << 17)
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_read_text_and_binary_messages() {
        let transport = MemoryTransport::default();
        transport.push_frame(OpCode::Text, true, b"{\"elapsed\":1}");
        transport.push_frame(OpCode::Binary, true, &[7u8; 300]);
        let mut ws = socket(&transport);

        assert_eq!(
            ws.read_message(TIMEOUT).unwrap(),
            Message::Text(b"{\"elapsed\":1}".to_vec())
        );
        assert_eq!(
            ws.read_message(TIMEOUT).unwrap(),
            Message::Binary(vec![7u8; 300])
        );
    }

    #[test]
    fn test_fragmented_message_is_reassembled() {
        let transport = MemoryTransport::default();
        transport.push_frame(OpCode::Binary, false, b"abc");
        transport.push_frame(OpCode::Ping, true, b"hi");
        transport.push_frame(OpCode::Continuation, true, b"def");
        let mut ws = socket(&transport);

        assert_eq!(
            ws.read_message(TIMEOUT).unwrap(),
            Message::Binary(b"abcdef".to_vec())
        );

        let written = transport.outgoing.lock().unwrap().clone();
        let frames = decode_client_frames(&written);
        assert_eq!(frames, vec![(OpCode::Pong, b"hi".to_vec())]);
    }

    #[test]
    fn test_normal_close_is_echoed() {
        let transport = MemoryTransport::default();
        transport.push_frame(OpCode::Close, true, &close_payload(CLOSE_NORMAL, "bye"));
        let mut ws = socket(&transport);

        let err = ws.read_message(TIMEOUT).unwrap_err();
        assert!(err.is_normal_closure());

        let written = transport.outgoing.lock().unwrap().clone();
        let frames = decode_client_frames(&written);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, OpCode::Close);
        assert_eq!(&frames[0].1[..2], &CLOSE_NORMAL.to_be_bytes());
    }

    #[test]
    fn test_abnormal_close_is_not_normal() {
        let transport = MemoryTransport::default();
        transport.push_frame(OpCode::Close, true, &close_payload(1011, "oops"));
        let mut ws = socket(&transport);

        let err = ws.read_message(TIMEOUT).unwrap_err();
        assert!(!err.is_normal_closure());
        assert!(matches!(err, Error::Closed { code: 1011, .. }));
    }

    #[test]
    fn test_message_over_limit_is_rejected() {
        let transport = MemoryTransport::default();
        transport.push_frame(OpCode::Binary, true, &vec![0u8; 2048]);
        let mut ws = WebSocket::from_handshaken(transport.clone(), 1024);

        assert!(matches!(
            ws.read_message(TIMEOUT),
            Err(Error::MessageTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[test]
    fn test_text_payload_is_not_decoded() {
        let transport = MemoryTransport::default();
        transport.push_frame(OpCode::Text, true, &[0xff, 0xfe, b'x']);
        let mut ws = socket(&transport);

        let message = ws.read_message(TIMEOUT).unwrap();
        assert_eq!(message, Message::Text(vec![0xff, 0xfe, b'x']));
        assert_eq!(message.len(), 3);
    }

    #[test]
    fn test_no_data_maps_to_timeout() {
        let transport = MemoryTransport::default();
        let mut ws = socket(&transport);

        assert!(matches!(
            ws.read_message(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_close_sends_frame_once_and_shuts_down() {
        let transport = MemoryTransport::default();
        let mut ws = socket(&transport);

        ws.write_binary(&[1, 2, 3]).unwrap();
        ws.close().unwrap();
        ws.close().unwrap();

        let written = transport.outgoing.lock().unwrap().clone();
        let frames = decode_client_frames(&written);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (OpCode::Binary, vec![1, 2, 3]));
        assert_eq!(frames[1].0, OpCode::Close);
        assert!(*transport.shut_down.lock().unwrap());
    }
}

//! Framed channel: `u32` little-endian length prefix + UTF-8 payload.
//!
//! Reads and writes use independent locks, so a command sent from the
//! control thread never waits behind the receiver thread's blocking read.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::message::Message;
use crate::ChannelError;

/// Largest frame either side accepts (16 MB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame-level failures.
#[derive(Debug)]
pub enum FrameError {
    /// The peer closed the connection, before or in the middle of a frame.
    Closed,
    /// Declared length exceeds the limit.
    TooLarge { size: usize, max: usize },
    /// Frame payload is not UTF-8.
    InvalidUtf8,
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Closed => write!(f, "Connection closed"),
            FrameError::TooLarge { size, max } => {
                write!(f, "Frame of {} bytes exceeds the {} byte limit", size, max)
            }
            FrameError::InvalidUtf8 => write!(f, "Frame is not valid UTF-8"),
            FrameError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => FrameError::Closed,
            _ => FrameError::Io(e),
        }
    }
}

/// Outcome of reading up to `buf.len()` bytes.
enum Fill {
    Full,
    /// Read timed out before the first byte arrived.
    Idle,
}

/// Duplex framed channel over any byte stream.
pub struct FramedChannel {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Socket handle used to unblock a pending read on close.
    control: Option<TcpStream>,
    max_frame_bytes: usize,
}

impl FramedChannel {
    /// Wrap an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            control: None,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Wrap a connected socket.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let mut channel = Self::new(reader, stream);
        channel.control = Some(control);
        Ok(channel)
    }

    /// Connect to `addr`, failing after `timeout`.
    pub fn connect(addr: &SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        Self::from_stream(stream)
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Address of the remote end, when the channel is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Set how long a receive waits for the first byte of a frame.
    ///
    /// With a timeout set, an idle receive returns an empty frame.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.control {
            Some(stream) => stream.set_read_timeout(timeout),
            None => Ok(()),
        }
    }

    /// Write one frame. Concurrent senders never interleave.
    pub fn send(&self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_bytes {
            return Err(FrameError::TooLarge { size: payload.len(), max: self.max_frame_bytes });
        }
        let header = (payload.len() as u32).to_le_bytes();

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&header)?;
        writer.write_all(payload)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame.
    ///
    /// Returns an empty vector when a read timeout expires before any byte of
    /// the header arrived, or when the peer sent a zero-length frame.
    pub fn receive(&self) -> Result<Vec<u8>, FrameError> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);

        let mut header = [0u8; 4];
        if let Fill::Idle = fill(&mut **reader, &mut header, true)? {
            return Ok(Vec::new());
        }

        let size = u32::from_le_bytes(header) as usize;
        if size > self.max_frame_bytes {
            return Err(FrameError::TooLarge { size, max: self.max_frame_bytes });
        }

        let mut body = vec![0u8; size];
        fill(&mut **reader, &mut body, false)?;
        Ok(body)
    }

    pub fn send_text(&self, text: &str) -> Result<(), FrameError> {
        self.send(text.as_bytes())
    }

    pub fn receive_text(&self) -> Result<String, FrameError> {
        String::from_utf8(self.receive()?).map_err(|_| FrameError::InvalidUtf8)
    }

    pub fn send_message(&self, msg: &Message) -> Result<(), FrameError> {
        log::trace!("-> {}", msg.kind());
        self.send_text(&msg.encode())
    }

    /// Read and decode one message. `Ok(None)` means no frame yet.
    pub fn receive_message(&self) -> Result<Option<Message>, ChannelError> {
        let text = self.receive_text()?;
        let msg = Message::decode(&text)?;
        if let Some(msg) = &msg {
            log::trace!("<- {}", msg.kind());
        }
        Ok(msg)
    }

    /// Shut the socket down in both directions. Unblocks a pending receive.
    ///
    /// Errors are ignored; closing twice is harmless.
    pub fn close(&self) {
        if let Some(stream) = &self.control {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Fill `buf` completely.
///
/// When `idle_ok` is set and the read times out before the first byte,
/// reports `Fill::Idle` instead of an error. Once a frame has started,
/// timeouts keep waiting for the rest of it.
fn fill(reader: &mut dyn Read, buf: &mut [u8], idle_ok: bool) -> Result<Fill, FrameError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => read += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if read == 0 && idle_ok {
                    return Ok(Fill::Idle);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Fill::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    /// Writer that appends into a shared buffer, so tests can read it back.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn written(buf: &SharedBuf) -> Vec<u8> {
        buf.0.lock().unwrap().clone()
    }

    #[test]
    fn test_send_writes_le_prefix() {
        let out = SharedBuf::default();
        let channel = FramedChannel::new(Cursor::new(Vec::new()), out.clone());
        channel.send(b"hey").unwrap();
        assert_eq!(written(&out), vec![3, 0, 0, 0, b'h', b'e', b'y']);
    }

    #[test]
    fn test_receive_reads_one_frame_at_a_time() {
        let mut input = Vec::new();
        for text in ["first", "", "third \u{00e9}"] {
            input.extend_from_slice(&(text.len() as u32).to_le_bytes());
            input.extend_from_slice(text.as_bytes());
        }
        let channel = FramedChannel::new(Cursor::new(input), io::sink());

        assert_eq!(channel.receive_text().unwrap(), "first");
        assert_eq!(channel.receive_text().unwrap(), "");
        assert_eq!(channel.receive_text().unwrap(), "third \u{00e9}");
        assert!(matches!(channel.receive(), Err(FrameError::Closed)));
    }

    #[test]
    fn test_close_mid_header_is_closed() {
        let channel = FramedChannel::new(Cursor::new(vec![5, 0]), io::sink());
        assert!(matches!(channel.receive(), Err(FrameError::Closed)));
    }

    #[test]
    fn test_close_mid_body_is_closed() {
        let channel = FramedChannel::new(Cursor::new(vec![5, 0, 0, 0, b'a', b'b']), io::sink());
        assert!(matches!(channel.receive(), Err(FrameError::Closed)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let channel = FramedChannel::new(Cursor::new(vec![0xff, 0xff, 0xff, 0x7f]), io::sink())
            .with_max_frame_bytes(1024);
        assert!(matches!(channel.receive(), Err(FrameError::TooLarge { max: 1024, .. })));

        let channel = FramedChannel::new(Cursor::new(Vec::new()), io::sink()).with_max_frame_bytes(2);
        assert!(matches!(channel.send(b"abc"), Err(FrameError::TooLarge { size: 3, .. })));
    }

    #[test]
    fn test_invalid_utf8() {
        let channel = FramedChannel::new(Cursor::new(vec![2, 0, 0, 0, 0xc3, 0x28]), io::sink());
        assert!(matches!(channel.receive_text(), Err(FrameError::InvalidUtf8)));
    }

    #[test]
    fn test_message_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let channel = FramedChannel::from_stream(stream).unwrap();
            let msg = channel.receive_message().unwrap().unwrap();
            channel.send_message(&Message::Ehlo).unwrap();
            msg
        });

        let channel = FramedChannel::connect(&addr, Duration::from_secs(5)).unwrap();
        channel.send_message(&Message::hello("0.2")).unwrap();
        assert_eq!(channel.receive_message().unwrap(), Some(Message::Ehlo));
        assert_eq!(server.join().unwrap(), Message::hello("0.2"));
    }

    #[test]
    fn test_idle_read_timeout_yields_empty_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let channel = FramedChannel::from_stream(client).unwrap();
        channel.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(channel.receive().unwrap().is_empty());
        assert!(matches!(channel.receive_message(), Ok(None)));
    }

    #[test]
    fn test_close_unblocks_receiver() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let channel = Arc::new(FramedChannel::from_stream(client).unwrap());
        let reader = Arc::clone(&channel);
        let handle = thread::spawn(move || reader.receive());

        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert!(matches!(handle.join().unwrap(), Err(FrameError::Closed)));
    }

    #[test]
    fn test_peer_close_is_distinct_from_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);

        let channel = FramedChannel::from_stream(client).unwrap();
        let err = channel.receive_message().unwrap_err();
        assert!(err.is_closed());
    }
}

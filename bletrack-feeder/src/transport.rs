//! Concrete byte transports for the capture link.
//!
//! Input modes:
//! - `ReaderTransport`:   readers with their own timeout (TCP streams)
//! - `ChannelTransport`:  readers that block forever (files, FIFOs, stdin,
//!   tty devices), drained on a reader thread
//! - `SerialTransport`:   serial device at a fixed baud rate (`serial` feature)
//!
//! `open_transport` picks one from a transport identifier.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use bletrack_core::transport::Transport;
use bletrack_core::types::TransportError;
use tracing::debug;

// ---------------------------------------------------------------------------
// Generic reader transport
// ---------------------------------------------------------------------------

/// Transport over any blocking reader.
///
/// Timeouts configured on the underlying reader (socket or serial read
/// timeout) surface as `TransportError::TimedOut`. EOF surfaces as `Closed`.
pub struct ReaderTransport<R: Read> {
    inner: Option<BufReader<R>>,
    name: String,
}

impl<R: Read> ReaderTransport<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        ReaderTransport {
            inner: Some(BufReader::new(reader)),
            name: name.into(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

impl<R: Read> Transport for ReaderTransport<R> {
    fn read_byte(&mut self) -> Result<u8, TransportError> {
        let reader = self.inner.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = [0u8; 1];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(_) => return Ok(buf[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => return Err(TransportError::TimedOut),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let reader = self.inner.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(TransportError::Closed),
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        if filled < n {
            return Err(TransportError::ShortRead {
                expected: n,
                actual: filled,
            });
        }
        Ok(buf)
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!(transport = %self.name, "transport closed");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub type TcpTransport = ReaderTransport<TcpStream>;

/// Connect to a TCP byte stream (e.g. a serial-to-network bridge).
pub fn connect_tcp(addr: &str, read_timeout: Duration) -> io::Result<TcpTransport> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(read_timeout))?;
    Ok(ReaderTransport::new(stream, format!("tcp://{addr}")))
}

// ---------------------------------------------------------------------------
// Reader thread transport
// ---------------------------------------------------------------------------

const CHUNK_LEN: usize = 512;
/// Chunks buffered ahead of the decoder before the reader thread blocks.
const CHANNEL_DEPTH: usize = 64;

type Chunk = io::Result<Vec<u8>>;

/// Transport over a reader that cannot time out on its own.
///
/// A background thread performs the blocking reads and forwards chunks over a
/// bounded channel. Reads on the transport wait at most `read_timeout` for
/// the next chunk, so the capture loop keeps polling its stop flag while the
/// link is silent. The thread exits at EOF, on a read error, or once the
/// transport is closed and its next send fails.
pub struct ChannelTransport {
    rx: Option<Receiver<Chunk>>,
    pending: VecDeque<u8>,
    read_timeout: Duration,
    name: String,
}

impl ChannelTransport {
    pub fn spawn<R>(
        mut reader: R,
        name: impl Into<String>,
        read_timeout: Duration,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel::<Chunk>(CHANNEL_DEPTH);
        thread::Builder::new()
            .name(format!("link-reader {name}"))
            .spawn(move || {
                let mut buf = [0u8; CHUNK_LEN];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(Ok(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted || is_timeout(e.kind()) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            })?;
        Ok(ChannelTransport {
            rx: Some(rx),
            pending: VecDeque::new(),
            read_timeout,
            name,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Wait up to one read timeout for the next chunk. `Ok(false)` on timeout.
    fn fill(&mut self) -> Result<bool, TransportError> {
        let rx = self.rx.as_ref().ok_or(TransportError::Closed)?;
        match rx.recv_timeout(self.read_timeout) {
            Ok(Ok(chunk)) => {
                self.pending.extend(chunk);
                Ok(true)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

impl Transport for ChannelTransport {
    fn read_byte(&mut self) -> Result<u8, TransportError> {
        if self.rx.is_none() {
            return Err(TransportError::Closed);
        }
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Ok(b);
            }
            if !self.fill()? {
                return Err(TransportError::TimedOut);
            }
        }
    }

    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        if self.rx.is_none() {
            return Err(TransportError::Closed);
        }
        while self.pending.len() < n {
            match self.fill() {
                Ok(true) => {}
                Ok(false) => break,
                Err(TransportError::Closed) if self.pending.is_empty() => {
                    return Err(TransportError::Closed);
                }
                Err(TransportError::Closed) => break,
                Err(e) => return Err(e),
            }
        }
        if self.pending.len() < n {
            let actual = self.pending.len();
            self.pending.clear();
            return Err(TransportError::ShortRead {
                expected: n,
                actual,
            });
        }
        Ok(self.pending.drain(..n).collect())
    }

    fn close(&mut self) {
        if self.rx.take().is_some() {
            self.pending.clear();
            debug!(transport = %self.name, "transport closed");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Open a capture file, FIFO or character device for reading.
pub fn open_file(path: &str, read_timeout: Duration) -> io::Result<ChannelTransport> {
    ChannelTransport::spawn(File::open(path)?, path, read_timeout)
}

pub fn stdin(read_timeout: Duration) -> io::Result<ChannelTransport> {
    ChannelTransport::spawn(io::stdin(), "stdin", read_timeout)
}

// ---------------------------------------------------------------------------
// Serial device
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
pub type SerialTransport = ReaderTransport<Box<dyn serialport::SerialPort>>;

/// Open a serial device with the link's framing (8N1, no flow control).
#[cfg(feature = "serial")]
pub fn open_serial(path: &str, baud: u32, read_timeout: Duration) -> io::Result<SerialTransport> {
    let port = serialport::new(path, baud)
        .timeout(read_timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(io::Error::from)?;
    Ok(ReaderTransport::new(port, path))
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Where a transport identifier points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Stdin,
    Tcp(String),
    Serial(String),
    File(String),
}

impl Endpoint {
    /// `-` is stdin, `tcp://host:port` is TCP, `/dev/...` and `COMn` are
    /// serial devices, anything else is a file.
    pub fn parse(id: &str) -> Endpoint {
        let id = id.trim();
        if id == "-" {
            Endpoint::Stdin
        } else if let Some(addr) = id.strip_prefix("tcp://") {
            Endpoint::Tcp(addr.to_string())
        } else if id.starts_with("/dev/") || id.to_ascii_uppercase().starts_with("COM") {
            Endpoint::Serial(id.to_string())
        } else {
            Endpoint::File(id.to_string())
        }
    }
}

/// Open the transport named by `id`.
///
/// Without the `serial` feature, device paths are opened as plain files;
/// the line settings must then be applied externally (`stty`).
pub fn open_transport(
    id: &str,
    baud: u32,
    read_timeout: Duration,
) -> io::Result<Box<dyn Transport + Send>> {
    let transport: Box<dyn Transport + Send> = match Endpoint::parse(id) {
        Endpoint::Stdin => Box::new(stdin(read_timeout)?),
        Endpoint::Tcp(addr) => Box::new(connect_tcp(&addr, read_timeout)?),
        Endpoint::File(path) => Box::new(open_file(&path, read_timeout)?),
        Endpoint::Serial(path) => open_device(&path, baud, read_timeout)?,
    };
    debug!(id, baud, "transport opened");
    Ok(transport)
}

#[cfg(feature = "serial")]
fn open_device(
    path: &str,
    baud: u32,
    read_timeout: Duration,
) -> io::Result<Box<dyn Transport + Send>> {
    Ok(Box::new(open_serial(path, baud, read_timeout)?))
}

#[cfg(not(feature = "serial"))]
fn open_device(
    path: &str,
    _baud: u32,
    read_timeout: Duration,
) -> io::Result<Box<dyn Transport + Send>> {
    Ok(Box::new(open_file(path, read_timeout)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Write;

    /// Reader that yields scripted results, one per `read` call.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.0.push_front(Ok(chunk[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn scripted(items: Vec<io::Result<Vec<u8>>>) -> ReaderTransport<Scripted> {
        ReaderTransport::new(Scripted(items.into()), "scripted")
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("-"), Endpoint::Stdin);
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.2:7000"),
            Endpoint::Tcp("10.0.0.2:7000".into())
        );
        assert_eq!(
            Endpoint::parse("/dev/ttyUSB0"),
            Endpoint::Serial("/dev/ttyUSB0".into())
        );
        assert_eq!(Endpoint::parse("COM3"), Endpoint::Serial("COM3".into()));
        assert_eq!(
            Endpoint::parse("capture.bin"),
            Endpoint::File("capture.bin".into())
        );
    }

    #[test]
    fn test_timeout_maps_to_timed_out() {
        let mut t = scripted(vec![Err(io::Error::from(ErrorKind::WouldBlock)), Ok(vec![7])]);
        assert!(matches!(t.read_byte(), Err(TransportError::TimedOut)));
        assert_eq!(t.read_byte().unwrap(), 7);
    }

    #[test]
    fn test_exact_read_across_chunks() {
        let mut t = scripted(vec![Ok(vec![1, 2]), Ok(vec![3]), Ok(vec![4, 5])]);
        assert_eq!(t.read_exact_bytes(5).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_timeout_mid_read_is_short() {
        let mut t = scripted(vec![
            Ok(vec![1, 2]),
            Err(io::Error::from(ErrorKind::TimedOut)),
        ]);
        match t.read_exact_bytes(4) {
            Err(TransportError::ShortRead { expected, actual }) => {
                assert_eq!((expected, actual), (4, 2));
            }
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[test]
    fn test_eof_is_closed() {
        let mut t = scripted(vec![]);
        assert!(matches!(t.read_byte(), Err(TransportError::Closed)));
        assert!(matches!(t.read_exact_bytes(3), Err(TransportError::Closed)));
    }

    #[test]
    fn test_io_error_is_fatal() {
        let mut t = scripted(vec![Err(io::Error::other("unplugged"))]);
        let err = t.read_byte().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_close_drops_reader() {
        let mut t = scripted(vec![Ok(vec![1, 2, 3])]);
        t.close();
        assert!(t.is_closed());
        assert!(matches!(t.read_byte(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_open_file_transport() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x55, 0x55, 0x55, 0x55, 0x01]).unwrap();
        file.flush().unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let mut t = open_transport(&path, 115_200, Duration::from_millis(100)).unwrap();
        assert_eq!(t.name(), path);
        assert_eq!(t.read_exact_bytes(5).unwrap()[4], 0x01);
        assert!(matches!(t.read_byte(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_tcp_transport_timeout_then_data() {
        use std::net::TcpListener;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(150));
            sock.write_all(&[0xAB]).unwrap();
        });

        let mut t = connect_tcp(&addr, Duration::from_millis(30)).unwrap();
        assert!(matches!(t.read_byte(), Err(TransportError::TimedOut)));
        let mut got = None;
        for _ in 0..100 {
            match t.read_byte() {
                Ok(b) => {
                    got = Some(b);
                    break;
                }
                Err(TransportError::TimedOut) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(got, Some(0xAB));
        server.join().unwrap();
    }

    /// Reader that blocks in `read` until its sender is dropped.
    struct Stalled(mpsc::Receiver<()>);

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_channel_transport_times_out_on_stalled_reader() {
        let (hold, rx) = mpsc::channel::<()>();
        let mut t =
            ChannelTransport::spawn(Stalled(rx), "stalled", Duration::from_millis(20)).unwrap();
        assert!(matches!(t.read_byte(), Err(TransportError::TimedOut)));
        assert!(matches!(
            t.read_exact_bytes(3),
            Err(TransportError::ShortRead {
                expected: 3,
                actual: 0
            })
        ));

        drop(hold);
        let mut closed = false;
        for _ in 0..50 {
            match t.read_byte() {
                Err(TransportError::Closed) => {
                    closed = true;
                    break;
                }
                Err(TransportError::TimedOut) => continue,
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        assert!(closed);
    }

    #[test]
    fn test_channel_transport_chunks_and_errors() {
        let reader = Scripted(
            vec![
                Ok(vec![1, 2]),
                Err(io::Error::from(ErrorKind::Interrupted)),
                Ok(vec![3, 4, 5]),
                Err(io::Error::other("unplugged")),
            ]
            .into(),
        );
        let mut t = ChannelTransport::spawn(reader, "scripted", Duration::from_secs(1)).unwrap();
        assert_eq!(t.read_byte().unwrap(), 1);
        assert_eq!(t.read_exact_bytes(4).unwrap(), vec![2, 3, 4, 5]);
        let err = t.read_byte().unwrap_err();
        assert!(err.is_fatal());

        t.close();
        assert!(t.is_closed());
        assert!(matches!(t.read_byte(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_pipeline_on_stalled_link_stops_on_flag() {
        use bletrack_core::frame::FrameFormat;
        use bletrack_core::pipeline::{CapturePipeline, RunLimits, StopReason};
        use bletrack_core::queue::NotificationQueue;
        use bletrack_core::sink::NullSink;
        use bletrack_core::types::StopFlag;
        use std::sync::Arc;
        use std::time::Instant;

        let (_hold, rx) = mpsc::channel::<()>();
        let transport =
            ChannelTransport::spawn(Stalled(rx), "stalled", Duration::from_millis(20)).unwrap();
        let mut pipeline = CapturePipeline::new(
            transport,
            FrameFormat::default(),
            NullSink,
            Arc::new(NotificationQueue::unbounded()),
        );

        let stop = StopFlag::new();
        let signal = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            signal.stop();
        });

        let started = Instant::now();
        let summary = pipeline.run(&RunLimits::new(None, stop)).unwrap();
        stopper.join().unwrap();

        assert_eq!(summary.reason, StopReason::Signal);
        assert!(summary.capture.idle_reads > 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(pipeline.transport().is_closed());
    }
}

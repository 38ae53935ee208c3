//! GPS receiver bindings.
//!
//! The correlator needs sources that never block. Blocking readers are
//! moved onto a reader thread and drained through a channel; serial ports
//! report how many bytes are waiting and are read only that far.

use std::fs::File;
use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use bletrack_core::gps::GpsSource;
use tracing::{debug, warn};

use crate::transport::Endpoint;

const CHUNK_LEN: usize = 512;

// ---------------------------------------------------------------------------
// Reader thread
// ---------------------------------------------------------------------------

/// Non-blocking view of a blocking reader.
///
/// A background thread reads chunks and forwards them; `read_available`
/// only drains what already arrived. When the reader hits EOF or an error,
/// the thread exits and later calls report `Ok(0)` forever.
pub struct ReaderGpsSource {
    rx: Receiver<Vec<u8>>,
    finished: bool,
}

impl ReaderGpsSource {
    pub fn spawn<R: Read + Send + 'static>(mut reader: R, name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let label = name.to_string();
        thread::Builder::new()
            .name(format!("gps-reader:{name}"))
            .spawn(move || {
                let mut buf = [0u8; CHUNK_LEN];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            debug!(source = %label, "GPS input ended");
                            break;
                        }
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            warn!(source = %label, error = %e, "GPS reader stopped");
                            break;
                        }
                    }
                }
            })?;
        Ok(ReaderGpsSource {
            rx,
            finished: false,
        })
    }

    /// True once the reader thread has exited and every chunk was drained.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl GpsSource for ReaderGpsSource {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    total += chunk.len();
                    buf.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.finished = true;
                    break;
                }
            }
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Serial receiver
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
pub struct SerialGpsSource {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialGpsSource {
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(std::time::Duration::from_millis(10))
            .open()
            .map_err(io::Error::from)?;
        Ok(SerialGpsSource { port })
    }
}

#[cfg(feature = "serial")]
impl GpsSource for SerialGpsSource {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if waiting == 0 {
            return Ok(0);
        }
        let start = buf.len();
        buf.resize(start + waiting, 0);
        match self.port.read(&mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                buf.truncate(start);
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Open the GPS source named by `id` (same identifier scheme as transports).
pub fn open_gps_source(id: &str, baud: u32) -> io::Result<Box<dyn GpsSource + Send>> {
    let source: Box<dyn GpsSource + Send> = match Endpoint::parse(id) {
        Endpoint::Stdin => Box::new(ReaderGpsSource::spawn(io::stdin(), "stdin")?),
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(&addr)?;
            Box::new(ReaderGpsSource::spawn(stream, &addr)?)
        }
        Endpoint::File(path) => Box::new(ReaderGpsSource::spawn(File::open(&path)?, &path)?),
        Endpoint::Serial(path) => open_gps_device(&path, baud)?,
    };
    debug!(id, baud, "GPS source opened");
    Ok(source)
}

#[cfg(feature = "serial")]
fn open_gps_device(path: &str, baud: u32) -> io::Result<Box<dyn GpsSource + Send>> {
    Ok(Box::new(SerialGpsSource::open(path, baud)?))
}

#[cfg(not(feature = "serial"))]
fn open_gps_device(path: &str, _baud: u32) -> io::Result<Box<dyn GpsSource + Send>> {
    Ok(Box::new(ReaderGpsSource::spawn(File::open(path)?, path)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

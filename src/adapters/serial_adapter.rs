//! Line-oriented request/response transport over a serial port.
//!
//! `SerialAdapter` owns one port. Every [`SerialAdapter::request`] appends the
//! write terminator, encodes, writes within the write timeout, then reads byte
//! by byte until the read terminator shows up or the read timeout elapses.
//! Input still pending when a request starts (the tail of a reply that timed
//! out) is discarded first, so a retried request never reads a stale answer.
//!
//! Port I/O is blocking and runs on Tokio's blocking task executor, so calling
//! tasks are suspended, not the runtime, for up to the configured timeout.

use crate::error::{DaqError, DaqResult};
use log::{debug, info};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Byte stream the adapter talks to. Implemented by real serial ports and by
/// [`MockSerialPort`](super::mock::MockSerialPort).
pub trait SerialStream: Read + Write + Send {
    /// Discard bytes that were received but not read yet.
    fn clear_input(&mut self) -> io::Result<()>;
}

#[cfg(feature = "instrument_serial")]
impl SerialStream for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Opens the underlying stream for a given set of settings.
pub type PortOpener = Arc<dyn Fn(&SerialSettings) -> DaqResult<Box<dyn SerialStream>> + Send + Sync>;

/// Text encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// 7-bit ASCII
    Ascii,
    /// UTF-8
    Utf8,
}

impl Encoding {
    fn encode(self, text: &str) -> DaqResult<Vec<u8>> {
        if self == Encoding::Ascii && !text.is_ascii() {
            return Err(DaqError::Encoding(format!(
                "request '{}' is not ASCII",
                text.trim_end()
            )));
        }
        Ok(text.as_bytes().to_vec())
    }

    fn decode(self, bytes: &[u8]) -> DaqResult<String> {
        if self == Encoding::Ascii && !bytes.is_ascii() {
            return Err(DaqError::Encoding(format!(
                "response {:?} is not ASCII",
                String::from_utf8_lossy(bytes)
            )));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DaqError::Encoding(format!("response is not UTF-8: {}", e)))
    }
}

/// Port parameters, fixed for the lifetime of the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    /// Port path (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Communication speed
    pub baud_rate: u32,
    /// Maximum wait for a complete response line
    pub read_timeout: Duration,
    /// Maximum wait for a request to be accepted by the port
    pub write_timeout: Duration,
    /// Wire encoding
    pub encoding: Encoding,
    /// Appended to every request
    pub write_terminator: String,
    /// Marks the end of every response
    pub read_terminator: String,
}

impl SerialSettings {
    /// Settings of the PFTL DAQ firmware: 9600 baud, 1 s timeouts, ASCII,
    /// `\n` on write and `\r\n` on read.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 9600,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            encoding: Encoding::Ascii,
            write_terminator: "\n".to_string(),
            read_terminator: "\r\n".to_string(),
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Serial transport for the DAQ.
///
/// Created closed. [`open`](Self::open) claims the port, [`close`](Self::close)
/// releases it and may be called any number of times.
#[derive(Clone)]
pub struct SerialAdapter {
    settings: SerialSettings,
    opener: PortOpener,

    /// The open port (behind Arc<Mutex> so blocking I/O can move to another thread)
    port: Arc<Mutex<Option<Box<dyn SerialStream>>>>,
}

impl fmt::Debug for SerialAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialAdapter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SerialAdapter {
    /// Create an adapter for a real serial port.
    pub fn new(settings: SerialSettings) -> Self {
        Self::with_opener(settings, Arc::new(open_system_port))
    }

    /// Create an adapter whose port is produced by `opener`.
    pub fn with_opener(settings: SerialSettings, opener: PortOpener) -> Self {
        Self {
            settings,
            opener,
            port: Arc::new(Mutex::new(None)),
        }
    }

    /// Port settings
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Whether the port is currently open.
    pub async fn is_open(&self) -> bool {
        self.port.lock().await.is_some()
    }

    /// Claim the port. Opening an already open adapter is a no-op.
    pub async fn open(&self) -> DaqResult<()> {
        let mut port = self.port.lock().await;
        if port.is_some() {
            debug!("Serial port '{}' already open", self.settings.port);
            return Ok(());
        }

        let opener = self.opener.clone();
        let settings = self.settings.clone();
        let stream = tokio::task::spawn_blocking(move || opener(&settings))
            .await
            .map_err(|e| DaqError::Task(format!("Serial open task panicked: {}", e)))??;

        *port = Some(stream);
        info!(
            "Serial port '{}' opened at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        Ok(())
    }

    /// Release the port. Safe to call when not open.
    pub async fn close(&self) {
        if self.port.lock().await.take().is_some() {
            info!("Serial port '{}' closed", self.settings.port);
        }
    }

    /// Send `message` and return the decoded response line without its terminator.
    pub async fn request(&self, message: &str) -> DaqResult<String> {
        let port = self.port.clone();
        let settings = self.settings.clone();
        let message = message.to_string();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let stream = guard.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
            exchange(stream.as_mut(), &settings, &message)
        })
        .await
        .map_err(|e| DaqError::Task(format!("Serial I/O task panicked: {}", e)))?
    }
}

fn exchange(stream: &mut dyn SerialStream, settings: &SerialSettings, message: &str) -> DaqResult<String> {
    let frame = settings
        .encoding
        .encode(&format!("{}{}", message, settings.write_terminator))?;
    // Leftovers of an earlier timed-out reply must not be read as this one.
    stream.clear_input()?;
    write_frame(stream, &frame, settings.write_timeout)?;
    debug!("Sent serial command: {}", message);

    let terminator = settings.read_terminator.as_bytes();
    let raw = read_line(stream, terminator, settings.read_timeout)?;
    let response = settings.encoding.decode(&raw[..raw.len() - terminator.len()])?;
    let response = response.trim().to_string();
    debug!("Received serial response: {}", response);
    Ok(response)
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn write_frame(stream: &mut dyn SerialStream, frame: &[u8], timeout: Duration) -> DaqResult<()> {
    let start = Instant::now();
    let mut written = 0;

    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(e) if is_transient(e.kind()) => {
                if start.elapsed() > timeout {
                    return Err(DaqError::Timeout(timeout));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    stream.flush()?;
    Ok(())
}

/// Read until `terminator`, returning the bytes including it.
fn read_line(stream: &mut dyn SerialStream, terminator: &[u8], timeout: Duration) -> DaqResult<Vec<u8>> {
    let start = Instant::now();
    let mut response = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if start.elapsed() > timeout {
            return Err(DaqError::Timeout(timeout));
        }

        match stream.read(&mut byte) {
            Ok(1) => {
                response.push(byte[0]);
                if response.ends_with(terminator) {
                    return Ok(response);
                }
            }
            Ok(_) => return Err(DaqError::SerialUnexpectedEof),
            // Port timeout is shorter than our overall timeout
            Err(e) if is_transient(e.kind()) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn open_system_port(settings: &SerialSettings) -> DaqResult<Box<dyn SerialStream>> {
    // Short internal timeout; the adapter enforces the configured deadlines itself.
    let poll = settings.read_timeout.min(Duration::from_millis(100));
    let port = serialport::new(&settings.port, settings.baud_rate)
        .timeout(poll)
        .open()
        .map_err(|e| DaqError::PortUnavailable {
            port: settings.port.clone(),
            reason: e.to_string(),
        })?;
    Ok(Box::new(port) as Box<dyn SerialStream>)
}

#[cfg(not(feature = "instrument_serial"))]
fn open_system_port(_settings: &SerialSettings) -> DaqResult<Box<dyn SerialStream>> {
    Err(DaqError::SerialFeatureDisabled)
}

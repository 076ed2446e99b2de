//! In-memory serial port for exercising the transport and device client
//! without hardware.
//!
//! `MockSerialPort` implements `Read` and `Write`. Every complete request line
//! written to it is recorded in a [`RequestLog`] and handed to a responder,
//! whose reply (raw text, terminator included) becomes readable. When nothing
//! is pending a read behaves like an idle serial line and times out.
//!
//! [`SimulatedFirmware`] is a responder that speaks the PFTL DAQ protocol.

use super::serial_adapter::{PortOpener, SerialSettings, SerialStream};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Shared record of the request lines a mock port received, in order.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RequestLog {
    /// Every request line received so far, terminators removed.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the recorded lines
    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

/// Client side of a scripted serial line.
pub struct MockSerialPort {
    responder: Arc<Mutex<Responder>>,
    log: RequestLog,
    write_terminator: Vec<u8>,
    incoming: Vec<u8>,
    outgoing: VecDeque<u8>,
}

impl MockSerialPort {
    /// Create a port answering each request line with `responder`.
    pub fn new<F>(write_terminator: &str, responder: F) -> (Self, RequestLog)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let log = RequestLog::default();
        let responder: Responder = Box::new(responder);
        let port = Self::shared(write_terminator, Arc::new(Mutex::new(responder)), log.clone());
        (port, log)
    }

    /// Build a [`PortOpener`] handing out mock ports that share one responder
    /// and one request log, so a closed and reopened adapter keeps its state.
    pub fn opener<F>(responder: F) -> (PortOpener, RequestLog)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let log = RequestLog::default();
        let responder: Responder = Box::new(responder);
        let responder = Arc::new(Mutex::new(responder));
        let opener_log = log.clone();
        let opener: PortOpener = Arc::new(move |settings: &SerialSettings| {
            let port = MockSerialPort::shared(
                &settings.write_terminator,
                responder.clone(),
                opener_log.clone(),
            );
            Ok(Box::new(port) as Box<dyn SerialStream>)
        });
        (opener, log)
    }

    fn shared(write_terminator: &str, responder: Arc<Mutex<Responder>>, log: RequestLog) -> Self {
        Self {
            responder,
            log,
            write_terminator: write_terminator.as_bytes().to_vec(),
            incoming: Vec::new(),
            outgoing: VecDeque::new(),
        }
    }

    fn dispatch_complete_lines(&mut self) {
        let term = self.write_terminator.len();
        while let Some(pos) = self
            .incoming
            .windows(term)
            .position(|window| window == self.write_terminator.as_slice())
        {
            let line: Vec<u8> = self.incoming.drain(..pos + term).take(pos).collect();
            let line = String::from_utf8_lossy(&line).into_owned();
            self.log.push(line.clone());

            let reply = {
                let mut responder = self.responder.lock().unwrap_or_else(PoisonError::into_inner);
                (*responder)(&line)
            };
            if let Some(reply) = reply {
                self.outgoing.extend(reply.into_bytes());
            }
        }
    }
}

impl Read for MockSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outgoing.is_empty() {
            // Idle line: behave like a port-level read timeout.
            std::thread::sleep(Duration::from_millis(2));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data pending"));
        }
        let n = buf.len().min(self.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(self.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockSerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.incoming.extend_from_slice(buf);
        self.dispatch_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialStream for MockSerialPort {
    fn clear_input(&mut self) -> io::Result<()> {
        self.outgoing.clear();
        Ok(())
    }
}

/// Emulation of the PFTL DAQ firmware.
///
/// Two output channels (0 and 1) hold the last code written to them. Input
/// channel `n` reads back output `n` rescaled from the 12-bit output range to
/// the 10-bit input range, as with a wire looping each output to its input.
/// Unknown channels and commands answer with an `ERROR` line.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFirmware {
    outputs: HashMap<u32, i64>,
    input_overrides: HashMap<u32, String>,
}

impl SimulatedFirmware {
    /// Identification string returned for `*IDN?`.
    pub const IDN: &'static str = "PFTL DAQ Device v1.0 (simulated)";

    /// Firmware with both outputs at code 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `MEAS:CH{channel}?` with `raw` instead of the loopback value.
    pub fn with_input_response(mut self, channel: u32, raw: impl Into<String>) -> Self {
        self.input_overrides.insert(channel, raw.into());
        self
    }

    /// Handle one request line; returns the reply including `\r\n`.
    pub fn respond(&mut self, line: &str) -> Option<String> {
        Some(format!("{}\r\n", self.reply(line.trim())))
    }

    /// Turn the firmware into a responder for [`MockSerialPort`].
    pub fn into_responder(mut self) -> impl FnMut(&str) -> Option<String> + Send + 'static {
        move |line: &str| self.respond(line)
    }

    fn reply(&mut self, line: &str) -> String {
        if line == "*IDN?" {
            return Self::IDN.to_string();
        }
        if let Some(rest) = line.strip_prefix("MEAS:CH") {
            return match rest.strip_suffix('?').and_then(Self::channel) {
                Some(channel) => match self.input_overrides.get(&channel) {
                    Some(raw) => raw.clone(),
                    None => (self.output(channel) * 1023 / 4095).to_string(),
                },
                None => "ERROR bad channel".to_string(),
            };
        }
        if let Some(rest) = line.strip_prefix("OUT:CH") {
            if let Some(query) = rest.strip_suffix('?') {
                return match Self::channel(query) {
                    Some(channel) => self.output(channel).to_string(),
                    None => "ERROR bad channel".to_string(),
                };
            }
            let mut parts = rest.splitn(2, ' ');
            let channel = parts.next().and_then(Self::channel);
            let code = parts.next().and_then(|v| v.trim().parse::<i64>().ok());
            return match (channel, code) {
                (None, _) => "ERROR bad channel".to_string(),
                (Some(_), None) => "ERROR bad value".to_string(),
                (Some(_), Some(code)) if !(0..=4095).contains(&code) => {
                    "ERROR value out of range".to_string()
                }
                (Some(channel), Some(code)) => {
                    self.outputs.insert(channel, code);
                    code.to_string()
                }
            };
        }
        "ERROR unknown command".to_string()
    }

    fn channel(text: &str) -> Option<u32> {
        text.parse::<u32>().ok().filter(|channel| *channel <= 1)
    }

    fn output(&self, channel: u32) -> i64 {
        self.outputs.get(&channel).copied().unwrap_or(0)
    }
}

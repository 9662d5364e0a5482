use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::command::{is_probe_ack, Command};
use crate::errors::{DriverError, Result};
use crate::session::{ByteSource, ConnectionStatus, StatusEvent, StreamingSession};

/// Baud rate the firmware's UART runs at.
pub const BAUD_RATE: u32 = 115_200;

const DEFAULT_IO_TIMEOUT_MS: u64 = 100;
const PROBE_TIMEOUT_SECS: u64 = 5;
const PROBE_WAIT_SECS: u64 = 2;
const MAX_OPEN_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Upper bound on bytes read while looking for the probe acknowledgment.
const PROBE_READ_LIMIT: usize = 256;

/// Opens serial ports to the WaveDAC board.
///
/// `io_timeout` bounds each read of the streaming loop, which is also how
/// long `stop()` may take to be noticed.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub baud_rate: u32,
    pub io_timeout: Duration,
    pub probe_timeout: Duration,
    /// Time the board gets to answer a probe before the reply is read.
    pub probe_wait: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
            probe_wait: Duration::from_secs(PROBE_WAIT_SECS),
            max_retries: MAX_OPEN_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl SerialConnector {
    /// Ask whatever is on `port` to identify itself.
    ///
    /// Returns `Ok(false)` when the port opens but nothing answers with the
    /// board's acknowledgment. Note the probe command also resets the board.
    pub fn probe(&self, port: &str) -> Result<bool> {
        debug!("probing port {}", port);
        let mut handle = serialport::new(port, self.baud_rate)
            .timeout(self.probe_timeout)
            .open()?;
        let found = probe_link(&mut handle, self.probe_wait)?;
        if found {
            info!("WaveDAC board found on {}", port);
        } else {
            debug!("no acknowledgment from {}", port);
        }
        Ok(found)
    }

    /// Open `port` for streaming, retrying with backoff.
    pub fn open(&self, port: &str) -> Result<SerialLink> {
        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                debug!(
                    "retrying serial open after {:?} (port={}, attempt={})",
                    delay, port, attempt
                );
                thread::sleep(delay);
            }

            match self.open_once(port) {
                Ok(link) => {
                    info!("serial port opened: port={}, baud={}", port, self.baud_rate);
                    return Ok(link);
                }
                Err(e) => {
                    warn!(
                        "serial open attempt failed: port={}, attempt={}, error={}",
                        port, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DriverError::DeviceNotFound { port: port.into() }))
    }

    fn open_once(&self, port: &str) -> Result<SerialLink> {
        let reader = serialport::new(port, self.baud_rate)
            .timeout(self.io_timeout)
            .open()?;
        let writer = reader.try_clone()?;
        Ok(SerialLink {
            name: port.to_string(),
            source: SerialSource { port: reader },
            writer,
        })
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Write the probe command and look for the acknowledgment in the reply.
fn probe_link<L: Read + Write + ?Sized>(link: &mut L, wait: Duration) -> io::Result<bool> {
    link.write_all(&[Command::Probe.as_byte()])?;
    link.flush()?;
    thread::sleep(wait);

    let mut reply = Vec::new();
    let mut buf = [0u8; 64];
    while reply.len() < PROBE_READ_LIMIT {
        let n = match link.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_timeout(&e) => break,
            Err(e) => return Err(e),
        };
        reply.extend_from_slice(&buf[..n]);
        if is_probe_ack(&reply) {
            return Ok(true);
        }
    }
    Ok(is_probe_ack(&reply))
}

/// An open serial connection, split into a read side and a command writer.
pub struct SerialLink {
    pub name: String,
    pub source: SerialSource,
    pub writer: Box<dyn SerialPort>,
}

/// Read side of a serial port.
pub struct SerialSource {
    port: Box<dyn SerialPort>,
}

impl Read for SerialSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl ByteSource for SerialSource {
    fn reset_input_buffer(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl StreamingSession {
    /// Probe `port` and, if the board answers, attach it to this session.
    ///
    /// # Errors
    /// [`DriverError::DeviceNotFound`] if the port opens but the board does
    /// not acknowledge; serial errors if the port cannot be opened.
    pub fn connect_serial(&self, port: &str, connector: &SerialConnector) -> Result<()> {
        self.emit(StatusEvent::Message(format!("Checking: {port}")));
        if !connector.probe(port)? {
            self.emit(StatusEvent::Message("Board is not connected.".into()));
            return Err(DriverError::DeviceNotFound { port: port.into() });
        }
        self.emit(StatusEvent::ConnectionChanged(ConnectionStatus::Found));
        self.emit(StatusEvent::Message(format!("Device found on port: {port}")));

        let link = connector.open(port)?;
        self.attach(link.name, link.source, link.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Scripted link: records writes, replays a canned reply, then times out.
    struct Scripted {
        reply: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Scripted {
        fn new(reply: &[u8]) -> Self {
            Self {
                reply: Cursor::new(reply.to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // One byte at a time to exercise reply reassembly.
            let limit = buf.len().min(1);
            match self.reply.read(&mut buf[..limit])? {
                0 => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
                n => Ok(n),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn probe_accepts_firmware_banner() {
        let mut link = Scripted::new(b"Wave Kivy $$$");
        assert!(probe_link(&mut link, Duration::ZERO).unwrap());
        assert_eq!(link.written, b"v");
    }

    #[test]
    fn probe_rejects_other_devices() {
        let mut link = Scripted::new(b"AT\r\nOK\r\n");
        assert!(!probe_link(&mut link, Duration::ZERO).unwrap());

        let mut silent = Scripted::new(b"");
        assert!(!probe_link(&mut silent, Duration::ZERO).unwrap());
    }

    #[test]
    fn probe_stops_reading_at_limit() {
        let noise = vec![b'x'; PROBE_READ_LIMIT * 2];
        let mut link = Scripted::new(&noise);
        assert!(!probe_link(&mut link, Duration::ZERO).unwrap());
        assert_eq!(link.reply.position() as usize, PROBE_READ_LIMIT);
    }

    #[test]
    fn defaults_match_firmware() {
        let connector = SerialConnector::default();
        assert_eq!(connector.baud_rate, 115_200);
        assert_eq!(connector.probe_timeout, Duration::from_secs(5));
        assert!(connector.io_timeout <= Duration::from_secs(1));
    }

    #[test]
    fn missing_port_fails_to_open() {
        let connector = SerialConnector {
            max_retries: 1,
            ..SerialConnector::default()
        };
        assert!(connector.open("/dev/wavedac-does-not-exist").is_err());
        let session = StreamingSession::default();
        assert!(session
            .connect_serial("/dev/wavedac-does-not-exist", &connector)
            .is_err());
        assert!(!session.is_connected());
    }
}

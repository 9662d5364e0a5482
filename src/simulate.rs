//! In-memory stand-in for the serial link.
//!
//! [`SimulatedSource`] behaves like a serial port opened with a read timeout:
//! reads return whatever has been pushed so far (possibly a partial chunk) and
//! return zero bytes once the timeout elapses with nothing queued. The paired
//! [`SimulatedHandle`] pushes data from any thread, injects link failures and
//! records the commands written through [`SimulatedWriter`].
//!
//! [`SimulatedBoard`] runs a small firmware emulator on top of a link: it
//! follows the commands written to it and streams the selected waveform while
//! started.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use crate::command::{Command, Range, Wave};
use crate::decoder::{encode_frame, REFERENCE_VOLTS};
use crate::session::ByteSource;

#[derive(Default)]
struct Link {
    chunks: VecDeque<Vec<u8>>,
    failure: Option<io::ErrorKind>,
    written: Vec<u8>,
    input_resets: usize,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    link: Mutex<Link>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Link> {
        // A panicking test thread must not wedge the other side of the link.
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read side of a simulated link.
pub struct SimulatedSource {
    shared: Arc<Shared>,
    timeout: Duration,
}

/// Write side of a simulated link; everything written is recorded.
pub struct SimulatedWriter {
    shared: Arc<Shared>,
}

/// Control handle for a simulated link.
#[derive(Clone)]
pub struct SimulatedHandle {
    shared: Arc<Shared>,
}

impl SimulatedSource {
    /// Create a link whose reads give up after `timeout`.
    pub fn new(timeout: Duration) -> (Self, SimulatedHandle) {
        let shared = Arc::new(Shared::default());
        let source = Self {
            shared: Arc::clone(&shared),
            timeout,
        };
        (source, SimulatedHandle { shared })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Read for SimulatedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut link = self.shared.lock();
        loop {
            if let Some(kind) = link.failure {
                return Err(io::Error::new(kind, "simulated link failure"));
            }

            if let Some(mut chunk) = link.chunks.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    chunk.drain(..n);
                    link.chunks.push_front(chunk);
                }
                return Ok(n);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            link = self
                .shared
                .ready
                .wait_timeout(link, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
    }
}

impl ByteSource for SimulatedSource {
    fn reset_input_buffer(&mut self) -> io::Result<()> {
        let mut link = self.shared.lock();
        if let Some(kind) = link.failure {
            return Err(io::Error::new(kind, "simulated link failure"));
        }
        link.chunks.clear();
        link.input_resets += 1;
        Ok(())
    }
}

impl Write for SimulatedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut link = self.shared.lock();
        if let Some(kind) = link.failure {
            return Err(io::Error::new(kind, "simulated link failure"));
        }
        link.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SimulatedHandle {
    /// A writer feeding this link's command log.
    pub fn writer(&self) -> SimulatedWriter {
        SimulatedWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue bytes as one chunk. Empty chunks are ignored.
    pub fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.shared.lock().chunks.push_back(bytes.to_vec());
        self.shared.ready.notify_all();
    }

    /// Queue one frame per raw reading, all in a single chunk.
    pub fn push_frames(&self, raw: &[u16]) {
        let bytes: Vec<u8> = raw.iter().flat_map(|&r| encode_frame(r)).collect();
        self.push(&bytes);
    }

    /// Make every subsequent read and write fail with `kind`.
    pub fn fail(&self, kind: io::ErrorKind) {
        self.shared.lock().failure = Some(kind);
        self.shared.ready.notify_all();
    }

    /// Everything written to the link so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().written.clone()
    }

    /// Written bytes decoded as commands; unknown bytes are dropped.
    pub fn commands(&self) -> Vec<Command> {
        self.written().into_iter().filter_map(Command::from_byte).collect()
    }

    /// How many times the reader discarded its pending input.
    pub fn input_resets(&self) -> usize {
        self.shared.lock().input_resets
    }

    /// Bytes queued but not read yet.
    pub fn pending(&self) -> usize {
        self.shared.lock().chunks.iter().map(Vec::len).sum()
    }

    /// Whether the read side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// Raw reading at `phase` (0..1) of one waveform cycle.
fn raw_sample(wave: Wave, range: Range, phase: f64) -> u16 {
    let unit = match wave {
        Wave::Sine => 0.5 - 0.5 * (2.0 * PI * phase).cos(),
        Wave::Triangle => 1.0 - (2.0 * phase - 1.0).abs(),
    };
    let volts = unit * range.full_scale_volts().min(REFERENCE_VOLTS);
    (volts / REFERENCE_VOLTS * 65535.0).round() as u16
}

/// Raw readings for `n` samples of the board's test waveform, `period`
/// samples per cycle. The waveform swings between 0 V and the range's full
/// scale, like the DAC output looped back into the ADC.
pub fn waveform(wave: Wave, range: Range, period: usize, n: usize) -> Vec<u16> {
    let period = period.max(2);
    (0..n)
        .map(|i| raw_sample(wave, range, (i % period) as f64 / period as f64))
        .collect()
}

/// Reply the firmware sends to [`Command::Probe`].
pub const PROBE_REPLY: &[u8] = b"Wave Kivy $$$";

/// Firmware emulator for a simulated link.
///
/// Reacts to the same commands as the board: `Probe` answers and resets to
/// sine on the large range, start/stop toggle streaming, wave and range
/// commands change the output. The thread exits once the link's read side is
/// dropped.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    pub sample_rate_hz: u32,
    /// Samples per waveform cycle.
    pub period: usize,
    pub tick: Duration,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self {
            sample_rate_hz: 100,
            period: 100,
            tick: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct BoardState {
    streaming: bool,
    wave: Wave,
    range: Range,
    index: usize,
}

impl BoardState {
    fn apply(&mut self, cmd: Command, handle: &SimulatedHandle) {
        match cmd {
            Command::Probe => {
                *self = BoardState::default();
                handle.push(PROBE_REPLY);
            }
            Command::StartStreaming => self.streaming = true,
            Command::StopStreaming => self.streaming = false,
            Command::WaveSine => self.wave = Wave::Sine,
            Command::WaveTriangle => self.wave = Wave::Triangle,
            Command::RangeSmall => self.range = Range::Small,
            Command::RangeLarge => self.range = Range::Large,
        }
    }
}

impl SimulatedBoard {
    /// Samples emitted per tick, at least one.
    fn batch(&self) -> usize {
        let per_tick = self.sample_rate_hz as f64 * self.tick.as_secs_f64();
        (per_tick.round() as usize).max(1)
    }

    /// Run the emulator on its own thread.
    pub fn spawn(self, handle: SimulatedHandle) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("wavedac-sim".into())
            .spawn(move || self.run(handle))
    }

    fn run(self, handle: SimulatedHandle) {
        let period = self.period.max(2);
        let batch = self.batch();
        let mut state = BoardState::default();
        let mut seen = 0;

        while !handle.is_closed() {
            let written = handle.written();
            for cmd in written[seen..].iter().filter_map(|&b| Command::from_byte(b)) {
                debug!("simulated board received {:?}", cmd);
                state.apply(cmd, &handle);
            }
            seen = written.len();

            if state.streaming {
                let raw: Vec<u16> = (0..batch)
                    .map(|k| {
                        let i = (state.index + k) % period;
                        raw_sample(state.wave, state.range, i as f64 / period as f64)
                    })
                    .collect();
                state.index = (state.index + batch) % period;
                handle.push_frames(&raw);
            }
            thread::sleep(self.tick);
        }
        debug!("simulated board stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{sample_from_bytes, FrameDecoder};
    use std::thread;

    #[test]
    fn reads_split_long_chunks() {
        let (mut source, handle) = SimulatedSource::new(Duration::from_millis(10));
        handle.push(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(handle.pending(), 2);
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[test]
    fn empty_link_times_out() {
        let (mut source, _handle) = SimulatedSource::new(Duration::from_millis(20));
        let started = Instant::now();
        let err = source.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn push_from_another_thread_wakes_reader() {
        let (mut source, handle) = SimulatedSource::new(Duration::from_secs(5));
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.push(&[0xA0]);
        });
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 1);
        feeder.join().unwrap();
    }

    #[test]
    fn reset_drops_queued_input() {
        let (mut source, handle) = SimulatedSource::new(Duration::from_millis(10));
        handle.push(&[9, 9, 9]);
        source.reset_input_buffer().unwrap();
        assert_eq!(handle.pending(), 0);
        assert_eq!(handle.input_resets(), 1);
    }

    #[test]
    fn failure_hits_both_directions() {
        let (mut source, handle) = SimulatedSource::new(Duration::from_millis(10));
        let mut writer = handle.writer();
        writer.write_all(b"b").unwrap();
        handle.fail(io::ErrorKind::BrokenPipe);

        assert_eq!(source.read(&mut [0u8; 1]).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert!(writer.write_all(b"s").is_err());
        assert_eq!(handle.commands(), vec![Command::StartStreaming]);
    }

    #[test]
    fn waveform_stays_inside_range() {
        for wave in [Wave::Sine, Wave::Triangle] {
            for range in [Range::Small, Range::Large] {
                let raw = waveform(wave, range, 50, 100);
                let peak = raw
                    .iter()
                    .map(|&r| sample_from_bytes((r >> 8) as u8, r as u8))
                    .fold(0.0_f64, f64::max);
                assert!(peak <= range.full_scale_volts() + 1e-3);
                assert!(peak >= range.full_scale_volts() - 1e-3);
                assert_eq!(raw[0], 0);
            }
        }
    }

    #[test]
    fn dropping_source_closes_link() {
        let (source, handle) = SimulatedSource::new(Duration::from_millis(10));
        assert!(!handle.is_closed());
        drop(source);
        assert!(handle.is_closed());
    }

    #[test]
    fn board_follows_commands() {
        let (mut source, handle) = SimulatedSource::new(Duration::from_millis(200));
        let board = SimulatedBoard {
            tick: Duration::from_millis(2),
            ..SimulatedBoard::default()
        }
        .spawn(handle.clone())
        .unwrap();
        let mut writer = handle.writer();

        writer.write_all(b"v").unwrap();
        let mut reply = Vec::new();
        let mut buf = [0u8; 32];
        while !crate::command::is_probe_ack(&reply) {
            let n = source.read(&mut buf).unwrap();
            reply.extend_from_slice(&buf[..n]);
        }
        assert_eq!(reply, PROBE_REPLY);

        writer.write_all(b"ft").unwrap();
        writer.write_all(b"b").unwrap();
        let mut decoder = FrameDecoder::new();
        let mut samples = Vec::new();
        while samples.len() < 60 {
            let n = source.read(&mut buf).unwrap();
            samples.extend(decoder.feed_slice(&buf[..n]).filter_map(|e| e.sample()));
        }
        let peak = samples.iter().copied().fold(0.0_f64, f64::max);
        assert!(peak <= Range::Small.full_scale_volts() + 1e-3);
        assert!(peak > 0.0);

        drop(source);
        board.join().unwrap();
    }

    #[test]
    fn pushed_frames_decode() {
        let (mut source, handle) = SimulatedSource::new(Duration::from_millis(10));
        handle.push_frames(&[0, 32768, 65535]);

        let mut buf = [0u8; 64];
        let n = source.read(&mut buf).unwrap();
        let mut decoder = FrameDecoder::new();
        let samples: Vec<f64> = decoder.feed_slice(&buf[..n]).filter_map(|e| e.sample()).collect();
        assert_eq!(samples.len(), 3);
        assert!((samples[2] - 5.0).abs() < 1e-9);
    }
}

//! Streaming session for the WaveDAC board.
//!
//! A [`StreamingSession`] owns the link to the board (a [`ByteSource`] for
//! reading plus a separate writer for commands), runs the read loop on a
//! background thread and fans decoded samples out to registered observers.
//!
//! # Threading
//!
//! The session is `Send + Sync` and meant to be built once and shared as an
//! `Arc<StreamingSession>` with every consumer (toolbar, status bar, plots).
//! Control calls (`stop()`, `add_observer()`, commands) may come from any
//! thread while the read loop runs.
//!
//! - The source and the decoder are moved into the read loop while streaming
//!   and handed back when it exits. Commands go through the writer, so they
//!   never wait on an in-flight read.
//! - `stop()` only clears the streaming flag and tells the board to stop. The
//!   loop notices at its next check, which is at most one read timeout away.
//!   Use [`StreamingSession::wait`] to block until it has exited.
//! - Observers run synchronously on the read-loop thread, in registration
//!   order. A slow observer delays the next read, so keep callbacks short and
//!   hand heavy work to another thread.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::command::{Command, Range, Wave};
use crate::decoder::{DecodeEvent, FrameDecoder, FRAME_LEN};
use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default number of bytes requested per read.
const DEFAULT_CHUNK_SIZE: usize = 256;

/// Default run of skipped bytes that raises a desync warning.
const DEFAULT_MAX_SKIP: u64 = 3000;

/// Poll interval while waiting for the read loop with a timeout.
const JOIN_POLL: Duration = Duration::from_millis(5);

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Read side of a link to the board.
///
/// Reads must be bounded by a timeout. A read that times out may return
/// `Ok(0)` or fail with `TimedOut`/`WouldBlock`; both count as "no data yet".
/// Any other error is treated as a lost connection.
pub trait ByteSource: Read + Send {
    /// Discard everything received but not read yet.
    fn reset_input_buffer(&mut self) -> io::Result<()>;
}

/// Read into `buf`, mapping timeouts to zero bytes.
fn read_chunk(source: &mut dyn ByteSource, buf: &mut [u8]) -> io::Result<usize> {
    match source.read(buf) {
        Ok(n) => Ok(n),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Receives every decoded sample, on the read-loop thread.
pub trait SampleObserver: Send + Sync {
    fn on_sample(&self, volts: f64);
}

impl<F> SampleObserver for F
where
    F: Fn(f64) + Send + Sync,
{
    fn on_sample(&self, volts: f64) {
        self(volts)
    }
}

/// Receives connection, lifecycle and message updates.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_status(&self, event: &StatusEvent) {
        self(event)
    }
}

/// Connection progress, as shown in a status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// The board answered a probe but the port is not open for streaming yet.
    Found,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    ConnectionChanged(ConnectionStatus),
    StateChanged(SessionState),
    /// Human-readable message for the user.
    Message(String),
}

/// Why the read loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopExit {
    /// `stop()` or `disconnect()` was called.
    Stopped,
    /// The byte source failed; the session is disconnected.
    ConnectionLost(String),
}

// ============================================================================
// Configuration and statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bytes requested per read call.
    pub chunk_size: usize,
    /// Consecutive skipped bytes after which a desync warning is raised.
    /// `None` disables the warning; decoding is the same either way.
    pub max_skip: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_skip: Some(DEFAULT_MAX_SKIP),
        }
    }
}

/// Counters for the current (or last) streaming run. Reset by `start()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Samples delivered to observers.
    pub samples: u64,
    /// Frames dropped because of a bad trailer.
    pub invalid_frames: u64,
    /// Bytes discarded while seeking a frame start.
    pub skipped_bytes: u64,
    /// Bytes skipped since the last valid frame.
    pub skip_run: u64,
    /// Desync warnings raised.
    pub desyncs: u64,
}

#[derive(Default)]
struct Counters {
    samples: AtomicU64,
    invalid_frames: AtomicU64,
    skipped_bytes: AtomicU64,
    skip_run: AtomicU64,
    desyncs: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for c in [
            &self.samples,
            &self.invalid_frames,
            &self.skipped_bytes,
            &self.skip_run,
            &self.desyncs,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            samples: self.samples.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            skipped_bytes: self.skipped_bytes.load(Ordering::Relaxed),
            skip_run: self.skip_run.load(Ordering::Relaxed),
            desyncs: self.desyncs.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Identity check on the allocation, ignoring vtables.
fn same_observer<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn register<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>, observer: Arc<T>) -> bool {
    let mut list = write_lock(list);
    if list.iter().any(|o| same_observer(o, &observer)) {
        return false;
    }
    list.push(observer);
    true
}

fn unregister<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>, observer: &Arc<T>) -> bool {
    let mut list = write_lock(list);
    let before = list.len();
    list.retain(|o| !same_observer(o, observer));
    list.len() != before
}

/// State shared between the session and its read loop.
#[derive(Default)]
struct Shared {
    streaming: AtomicBool,
    connected: AtomicBool,
    counters: Counters,
    observers: RwLock<Vec<Arc<dyn SampleObserver>>>,
    status_observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
}

impl Shared {
    fn emit(&self, event: StatusEvent) {
        // Snapshot so observers may (un)register from inside the callback.
        let observers = read_lock(&self.status_observers).clone();
        for observer in &observers {
            observer.on_status(&event);
        }
    }

    fn message(&self, text: impl Into<String>) {
        self.emit(StatusEvent::Message(text.into()));
    }

    fn mark_lost(&self, reason: &str) {
        let was_streaming = self.streaming.swap(false, Ordering::AcqRel);
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if was_streaming {
            self.emit(StatusEvent::StateChanged(SessionState::Idle));
        }
        if was_connected {
            warn!("connection lost: {}", reason);
            self.emit(StatusEvent::ConnectionChanged(ConnectionStatus::Disconnected));
            self.message(format!("Connection lost: {reason}"));
        }
    }

    /// Decode one chunk and deliver its samples.
    fn dispatch(&self, decoder: &mut FrameDecoder, bytes: &[u8]) {
        let observers = read_lock(&self.observers).clone();
        let mut invalid = 0u64;
        let mut skipped = 0u64;

        for event in decoder.feed_slice(bytes) {
            match event {
                DecodeEvent::SampleReady(volts) => {
                    self.counters.samples.fetch_add(1, Ordering::Relaxed);
                    for observer in &observers {
                        observer.on_sample(volts);
                    }
                }
                DecodeEvent::InvalidFrame => invalid += 1,
                DecodeEvent::Skipped => skipped += 1,
                DecodeEvent::Desynchronized { skipped: run } => {
                    skipped += 1;
                    self.counters.desyncs.fetch_add(1, Ordering::Relaxed);
                    warn!("no frame start in the last {} bytes, stream may be desynchronized", run);
                }
                DecodeEvent::NoOp => {}
            }
        }

        self.counters.invalid_frames.fetch_add(invalid, Ordering::Relaxed);
        self.counters.skipped_bytes.fetch_add(skipped, Ordering::Relaxed);
        self.counters.skip_run.store(decoder.skip_count(), Ordering::Relaxed);

        if invalid > 0 {
            warn!("invalid frames in chunk: {} (suppressing per-frame logs)", invalid);
        }
        if skipped > 0 {
            debug!("skipped {} bytes while seeking frame start", skipped);
        }
    }
}

/// Clears the streaming flag when the read loop ends, even by panic.
struct StreamingGuard(Arc<Shared>);

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.0.streaming.store(false, Ordering::Release);
    }
}

// ============================================================================
// Read loop
// ============================================================================

struct WorkerExit {
    source: Box<dyn ByteSource>,
    decoder: FrameDecoder,
    reason: LoopExit,
}

fn run_read_loop(
    mut source: Box<dyn ByteSource>,
    mut decoder: FrameDecoder,
    shared: Arc<Shared>,
    chunk_size: usize,
) -> WorkerExit {
    let _guard = StreamingGuard(Arc::clone(&shared));
    let mut buf = vec![0u8; chunk_size.max(FRAME_LEN)];
    debug!("read loop started (chunk_size={})", buf.len());

    let reason = loop {
        if !shared.streaming.load(Ordering::Acquire) {
            break LoopExit::Stopped;
        }

        let n = match read_chunk(source.as_mut(), &mut buf) {
            Ok(n) => n,
            Err(e) => break LoopExit::ConnectionLost(e.to_string()),
        };

        // Bytes that arrive after a stop request are dropped.
        if n == 0 || !shared.streaming.load(Ordering::Acquire) {
            continue;
        }
        shared.dispatch(&mut decoder, &buf[..n]);
    };

    if let LoopExit::ConnectionLost(ref msg) = reason {
        shared.mark_lost(msg);
    }
    debug!("read loop finished: {:?}", reason);

    WorkerExit {
        source,
        decoder,
        reason,
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Default)]
struct Link {
    name: Option<String>,
    writer: Option<Box<dyn Write + Send>>,
    source: Option<Box<dyn ByteSource>>,
    decoder: Option<FrameDecoder>,
    worker: Option<JoinHandle<WorkerExit>>,
    last_exit: Option<LoopExit>,
}

impl Link {
    fn write_command(&mut self, cmd: Command) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(DriverError::NotConnected)?;
        writer
            .write_all(&[cmd.as_byte()])
            .and_then(|_| writer.flush())
            .map_err(|e| DriverError::ConnectionLost(e.to_string()))?;
        debug!("sent command {:?} ({:?})", cmd, cmd.as_byte() as char);
        Ok(())
    }

    fn clear(&mut self) {
        self.name = None;
        self.writer = None;
        self.source = None;
        self.decoder = None;
    }
}

/// Connection to a WaveDAC board and its sample stream.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use _core::{SimulatedSource, StreamingSession};
///
/// let (source, handle) = SimulatedSource::new(Duration::from_millis(10));
/// let session = Arc::new(StreamingSession::default());
/// session.attach("sim", source, handle.writer()).unwrap();
/// session.add_observer(Arc::new(|volts: f64| println!("{volts:.3} V")));
///
/// session.start().unwrap();
/// handle.push_frames(&[0, 32768, 65535]);
/// # std::thread::sleep(Duration::from_millis(50));
/// session.stop().unwrap();
/// session.wait(Some(Duration::from_secs(1))).unwrap();
/// ```
pub struct StreamingSession {
    config: SessionConfig,
    link: Mutex<Link>,
    shared: Arc<Shared>,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl StreamingSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link::default()),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, event: StatusEvent) {
        self.shared.emit(event);
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Install a link to the board. Any previous link is disconnected first,
    /// including one whose read loop already ended with a lost connection.
    ///
    /// `source` must be read with a bounded timeout; `writer` carries commands
    /// and may be another handle to the same port.
    pub fn attach<S, W>(&self, name: impl Into<String>, source: S, writer: W) -> Result<()>
    where
        S: ByteSource + 'static,
        W: Write + Send + 'static,
    {
        if self.is_connected() {
            self.disconnect()?;
        } else {
            // Reap a loop that died on its own so it cannot tear down the new link.
            self.join_worker(None)?;
        }

        let name = name.into();
        {
            let mut link = self.link();
            link.name = Some(name.clone());
            link.writer = Some(Box::new(writer));
            link.source = Some(Box::new(source));
            link.decoder = Some(FrameDecoder::with_max_skip(self.config.max_skip.unwrap_or(0)));
            link.last_exit = None;
        }
        self.shared.connected.store(true, Ordering::Release);

        info!("device connected: port={}", name);
        self.emit(StatusEvent::ConnectionChanged(ConnectionStatus::Connected));
        self.shared.message(format!("Device connected at {name}"));
        Ok(())
    }

    /// Stop streaming, wait for the read loop and release the link.
    pub fn disconnect(&self) -> Result<()> {
        let was_connected = self.shared.connected.load(Ordering::Acquire);
        if self.is_streaming() {
            // Best effort: the link may already be gone.
            if let Err(e) = self.stop() {
                debug!("stop during disconnect failed: {}", e);
            }
        }
        let joined = self.join_worker(None);

        self.link().clear();
        self.shared.connected.store(false, Ordering::Release);
        if was_connected {
            info!("device disconnected");
            self.emit(StatusEvent::ConnectionChanged(ConnectionStatus::Disconnected));
            self.shared.message("Device disconnected");
        }
        joined.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Name of the attached port, if any.
    pub fn port_name(&self) -> Option<String> {
        self.link().name.clone()
    }

    // ------------------------------------------------------------------------
    // Streaming lifecycle
    // ------------------------------------------------------------------------

    /// Start streaming.
    ///
    /// Drops any input already buffered, tells the board to start, resets the
    /// decoder and counters, then spawns the read loop. Does nothing if the
    /// session is already streaming. If a previous loop is still winding down
    /// after `stop()`, this waits for it first.
    ///
    /// # Errors
    /// [`DriverError::NotConnected`] if no link is attached.
    pub fn start(&self) -> Result<()> {
        if !self.is_connected() {
            warn!("start requested but the board is not connected");
            return Err(DriverError::NotConnected);
        }
        if self.is_streaming() {
            return Ok(());
        }
        self.join_worker(None)?;

        let mut link = self.link();
        let (Some(mut source), Some(mut decoder)) = (link.source.take(), link.decoder.take()) else {
            return Err(DriverError::NotConnected);
        };

        let prepared = source
            .reset_input_buffer()
            .map_err(|e| DriverError::ConnectionLost(e.to_string()))
            .and_then(|_| link.write_command(Command::StartStreaming));
        if let Err(e) = prepared {
            link.source = Some(source);
            link.decoder = Some(decoder);
            drop(link);
            if let DriverError::ConnectionLost(ref msg) = e {
                self.shared.mark_lost(msg);
            }
            return Err(e);
        }

        decoder.reset();
        self.shared.counters.reset();
        self.shared.streaming.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let chunk_size = self.config.chunk_size;
        let spawned = thread::Builder::new()
            .name("wavedac-reader".into())
            .spawn(move || run_read_loop(source, decoder, shared, chunk_size));
        match spawned {
            Ok(handle) => link.worker = Some(handle),
            Err(e) => {
                // The source went down with the closure.
                link.clear();
                drop(link);
                self.shared.streaming.store(false, Ordering::Release);
                self.shared.mark_lost(&e.to_string());
                return Err(DriverError::Io(e));
            }
        }
        let name = link.name.clone().unwrap_or_default();
        drop(link);

        info!("streaming started: port={}", name);
        self.emit(StatusEvent::StateChanged(SessionState::Streaming));
        self.shared.message("Started streaming");
        Ok(())
    }

    /// Ask the read loop to stop and tell the board to stop streaming.
    ///
    /// Returns without waiting for the loop; it exits within one read timeout.
    /// Call [`wait`](Self::wait) to synchronize with it.
    pub fn stop(&self) -> Result<()> {
        let was_streaming = self.shared.streaming.swap(false, Ordering::AcqRel);
        if was_streaming {
            info!("streaming stop requested");
            self.emit(StatusEvent::StateChanged(SessionState::Idle));
            self.shared.message("Stopped streaming data");
        }

        if !self.is_connected() {
            return Ok(());
        }
        let sent = self.link().write_command(Command::StopStreaming);
        if let Err(DriverError::ConnectionLost(ref msg)) = sent {
            self.shared.mark_lost(msg);
        }
        sent
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if self.is_streaming() {
            SessionState::Streaming
        } else {
            SessionState::Idle
        }
    }

    /// Whether a read loop thread is still alive.
    pub fn is_running(&self) -> bool {
        self.link()
            .worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Block until the read loop has exited, or until `timeout` elapses.
    ///
    /// Returns the exit reason of the most recent loop, or `None` if no loop
    /// has run yet or it is still running when the timeout expires.
    ///
    /// # Errors
    /// [`DriverError::Worker`] if the loop panicked or if called from an
    /// observer (the read-loop thread cannot wait for itself).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<LoopExit>> {
        self.join_worker(timeout)
    }

    fn join_worker(&self, timeout: Option<Duration>) -> Result<Option<LoopExit>> {
        let worker = self.link().worker.take();
        let Some(handle) = worker else {
            return Ok(self.link().last_exit.clone());
        };

        if handle.thread().id() == thread::current().id() {
            self.link().worker = Some(handle);
            return Err(DriverError::Worker(
                "the read loop cannot wait for itself (wait/start/attach/disconnect called \
                 from an observer)"
                    .into(),
            ));
        }

        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    self.link().worker = Some(handle);
                    return Ok(None);
                }
                thread::sleep(JOIN_POLL);
            }
        }

        // The link lock is not held while joining: observers on the loop
        // thread may call back into the session.
        match handle.join() {
            Ok(exit) => {
                let mut link = self.link();
                // The exited loop owned the source; a source already in place
                // belongs to a newer link and is left alone.
                if link.source.is_none() {
                    if matches!(exit.reason, LoopExit::Stopped) {
                        link.source = Some(exit.source);
                        link.decoder = Some(exit.decoder);
                    } else {
                        link.clear();
                    }
                }
                link.last_exit = Some(exit.reason.clone());
                Ok(Some(exit.reason))
            }
            Err(_) => {
                let mut link = self.link();
                if link.source.is_none() {
                    link.clear();
                }
                drop(link);
                self.shared.mark_lost("read loop panicked");
                Err(DriverError::Worker("read loop panicked".into()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Write a single command byte to the board.
    pub fn send_command(&self, cmd: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let sent = self.link().write_command(cmd);
        if let Err(DriverError::ConnectionLost(ref msg)) = sent {
            self.shared.mark_lost(msg);
        }
        sent
    }

    pub fn select_wave(&self, wave: Wave) -> Result<()> {
        self.send_command(wave.command())?;
        debug!("wave set to {}", wave);
        Ok(())
    }

    pub fn select_range(&self, range: Range) -> Result<()> {
        self.send_command(range.command())?;
        debug!("range set to {}", range);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Register a sample observer. Registering the same `Arc` twice is a
    /// no-op; returns whether it was added.
    pub fn add_observer(&self, observer: Arc<dyn SampleObserver>) -> bool {
        register(&self.shared.observers, observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn SampleObserver>) -> bool {
        unregister(&self.shared.observers, observer)
    }

    /// Register a status observer, independent of the sample observers.
    pub fn add_status_observer(&self, observer: Arc<dyn StatusObserver>) -> bool {
        register(&self.shared.status_observers, observer)
    }

    pub fn remove_status_observer(&self, observer: &Arc<dyn StatusObserver>) -> bool {
        unregister(&self.shared.status_observers, observer)
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if self.is_streaming() {
            if let Err(e) = self.stop() {
                warn!("error sending stop during drop: {}", e);
            }
        }
        if let Err(e) = self.join_worker(None) {
            warn!("error stopping read loop during drop: {}", e);
        }
    }
}

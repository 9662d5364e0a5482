//! WaveDAC streaming driver with optional Python bindings.
//!
//! The WaveDAC board (a PSoC running a DAC/ADC loopback) streams one ADC
//! reading per 4-byte frame over a serial link:
//!
//! ```text
//! 0xA0  MSB  LSB  0xC0
//! ```
//!
//! [`FrameDecoder`] turns that byte stream into voltages (0..5 V), and
//! [`StreamingSession`] owns the link, runs the read loop on a background
//! thread and pushes each sample to registered observers.
//!
//! # Timing
//!
//! Samples carry no timestamp or sequence number. They are delivered in
//! arrival order, synchronously on the read-loop thread, so observers that
//! need a time axis should count samples against the board's sampling rate.
//!
//! # Python
//!
//! Build with the `python` feature (maturin does this) to get the `_core`
//! extension module with a `StreamingSession` class.

mod command;
mod decoder;
mod errors;
pub mod logging;
mod serial;
mod session;
mod simulate;

pub use command::{is_probe_ack, Command, Range, Wave, PROBE_ACK};
pub use decoder::{
    encode_frame, sample_from_bytes, DecodeEvent, DecoderState, DecoderStats, FrameDecoder,
    END_BYTE, FRAME_LEN, REFERENCE_VOLTS, START_BYTE,
};
pub use errors::*;
pub use serial::{SerialConnector, SerialLink, SerialSource, BAUD_RATE};
pub use session::{
    ByteSource, ConnectionStatus, LoopExit, SampleObserver, SessionConfig, SessionState,
    SessionStats, StatusEvent, StatusObserver, StreamingSession,
};
pub use simulate::{
    waveform, SimulatedBoard, SimulatedHandle, SimulatedSource, SimulatedWriter, PROBE_REPLY,
};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use super::*;

    /// Read timeout of the simulated link.
    const SIM_READ_TIMEOUT: Duration = Duration::from_millis(20);

    fn to_py_err(e: DriverError) -> PyErr {
        match e {
            DriverError::NotConnected
            | DriverError::ConnectionLost(_)
            | DriverError::DeviceNotFound { .. } => PyConnectionError::new_err(e.to_string()),
            DriverError::InvalidArgument(_) => PyValueError::new_err(e.to_string()),
            DriverError::Worker(_) => PyRuntimeError::new_err(e.to_string()),
            DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(e.to_string()),
        }
    }

    fn status_tuple(event: &StatusEvent) -> (&'static str, String) {
        match event {
            StatusEvent::ConnectionChanged(status) => {
                let s = match status {
                    ConnectionStatus::Disconnected => "disconnected",
                    ConnectionStatus::Found => "found",
                    ConnectionStatus::Connected => "connected",
                };
                ("connection", s.to_string())
            }
            StatusEvent::StateChanged(SessionState::Idle) => ("state", "idle".to_string()),
            StatusEvent::StateChanged(SessionState::Streaming) => {
                ("state", "streaming".to_string())
            }
            StatusEvent::Message(text) => ("message", text.clone()),
        }
    }

    fn exit_str(exit: LoopExit) -> String {
        match exit {
            LoopExit::Stopped => "stopped".to_string(),
            LoopExit::ConnectionLost(reason) => format!("connection lost: {reason}"),
        }
    }

    /// Python callables registered on the session, keyed by object identity.
    struct Registry<T: ?Sized> {
        entries: Mutex<Vec<(Py<PyAny>, Arc<T>)>>,
    }

    impl<T: ?Sized> Registry<T> {
        fn new() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
            }
        }

        fn lock(&self) -> MutexGuard<'_, Vec<(Py<PyAny>, Arc<T>)>> {
            self.entries.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn find(&self, callback: &Py<PyAny>) -> Option<Arc<T>> {
            self.lock()
                .iter()
                .find(|(cb, _)| cb.as_ptr() == callback.as_ptr())
                .map(|(_, observer)| Arc::clone(observer))
        }

        fn insert(&self, callback: Py<PyAny>, observer: Arc<T>) {
            self.lock().push((callback, observer));
        }

        fn take(&self, callback: &Py<PyAny>) -> Option<Arc<T>> {
            let mut entries = self.lock();
            let pos = entries
                .iter()
                .position(|(cb, _)| cb.as_ptr() == callback.as_ptr())?;
            Some(entries.remove(pos).1)
        }
    }

    /// Streaming session for a WaveDAC board.
    ///
    /// Observers are called from the read-loop thread with the GIL held;
    /// keep them short.
    ///
    /// Example:
    ///     >>> session = StreamingSession()
    ///     >>> session.connect("/dev/ttyACM0")
    ///     >>> session.add_observer(lambda volts: print(volts))
    ///     >>> session.start()
    ///     >>> session.stop()
    ///     >>> session.wait(1.0)
    #[pyclass(name = "StreamingSession")]
    struct PySession {
        inner: Arc<StreamingSession>,
        observers: Registry<dyn SampleObserver>,
        status_observers: Registry<dyn StatusObserver>,
    }

    #[pymethods]
    impl PySession {
        #[new]
        #[pyo3(signature = (chunk_size=256, max_skip=Some(3000)))]
        fn new(chunk_size: usize, max_skip: Option<u64>) -> Self {
            PySession {
                inner: Arc::new(StreamingSession::new(SessionConfig {
                    chunk_size,
                    max_skip,
                })),
                observers: Registry::new(),
                status_observers: Registry::new(),
            }
        }

        /// Probe `port` for the board and connect to it.
        ///
        /// Raises:
        ///     ConnectionError: If nothing on the port answers like the board.
        ///     IOError: If the port cannot be opened.
        fn connect(&self, py: Python<'_>, port: String) -> PyResult<()> {
            let inner = Arc::clone(&self.inner);
            py.detach(move || inner.connect_serial(&port, &SerialConnector::default()))
                .map_err(to_py_err)
        }

        /// Connect to an emulated board producing the test waveform.
        #[pyo3(signature = (sample_rate_hz=100))]
        fn simulate(&self, py: Python<'_>, sample_rate_hz: u32) -> PyResult<()> {
            let inner = Arc::clone(&self.inner);
            py.detach(move || -> Result<()> {
                let (source, handle) = SimulatedSource::new(SIM_READ_TIMEOUT);
                SimulatedBoard {
                    sample_rate_hz,
                    ..SimulatedBoard::default()
                }
                .spawn(handle.clone())?;
                inner.attach("simulated", source, handle.writer())
            })
            .map_err(to_py_err)
        }

        fn disconnect(&self, py: Python<'_>) -> PyResult<()> {
            let inner = Arc::clone(&self.inner);
            py.detach(move || inner.disconnect()).map_err(to_py_err)
        }

        fn start(&self, py: Python<'_>) -> PyResult<()> {
            let inner = Arc::clone(&self.inner);
            py.detach(move || inner.start()).map_err(to_py_err)
        }

        /// Request the read loop to stop; use `wait()` to block until it has.
        fn stop(&self) -> PyResult<()> {
            self.inner.stop().map_err(to_py_err)
        }

        /// Block until the read loop exits or `timeout` seconds elapse.
        ///
        /// Returns:
        ///     "stopped", "connection lost: ..." or None if still running.
        #[pyo3(signature = (timeout=None))]
        fn wait(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Option<String>> {
            let timeout = match timeout {
                Some(t) if t < 0.0 || !t.is_finite() => {
                    return Err(PyValueError::new_err("timeout must be a non-negative number"))
                }
                t => t.map(Duration::from_secs_f64),
            };
            let inner = Arc::clone(&self.inner);
            py.detach(move || inner.wait(timeout))
                .map(|exit| exit.map(exit_str))
                .map_err(to_py_err)
        }

        /// Register `callback(volts: float)`. Returns False if already registered.
        fn add_observer(&self, py: Python<'_>, callback: Py<PyAny>) -> bool {
            if self.observers.find(&callback).is_some() {
                return false;
            }
            let cb = callback.clone_ref(py);
            let observer: Arc<dyn SampleObserver> = Arc::new(move |volts: f64| {
                Python::attach(|py| {
                    if let Err(e) = cb.bind(py).call1((volts,)) {
                        e.print(py);
                    }
                })
            });
            self.observers.insert(callback, Arc::clone(&observer));
            self.inner.add_observer(observer)
        }

        fn remove_observer(&self, callback: Py<PyAny>) -> bool {
            match self.observers.take(&callback) {
                Some(observer) => self.inner.remove_observer(&observer),
                None => false,
            }
        }

        /// Register `callback(kind: str, value: str)` for connection ("connection"),
        /// lifecycle ("state") and user-facing ("message") updates.
        fn add_status_observer(&self, py: Python<'_>, callback: Py<PyAny>) -> bool {
            if self.status_observers.find(&callback).is_some() {
                return false;
            }
            let cb = callback.clone_ref(py);
            let observer: Arc<dyn StatusObserver> = Arc::new(move |event: &StatusEvent| {
                let (kind, value) = status_tuple(event);
                Python::attach(|py| {
                    if let Err(e) = cb.bind(py).call1((kind, value)) {
                        e.print(py);
                    }
                })
            });
            self.status_observers.insert(callback, Arc::clone(&observer));
            self.inner.add_status_observer(observer)
        }

        fn remove_status_observer(&self, callback: Py<PyAny>) -> bool {
            match self.status_observers.take(&callback) {
                Some(observer) => self.inner.remove_status_observer(&observer),
                None => false,
            }
        }

        /// Select the generated waveform: "SINE" or "TRIANGLE".
        fn select_wave(&self, wave: &str) -> PyResult<()> {
            let wave: Wave = wave.parse().map_err(to_py_err)?;
            self.inner.select_wave(wave).map_err(to_py_err)
        }

        /// Select the output range: "SMALL" (1 V) or "LARGE" (4 V).
        fn select_range(&self, range: &str) -> PyResult<()> {
            let range: Range = range.parse().map_err(to_py_err)?;
            self.inner.select_range(range).map_err(to_py_err)
        }

        /// Counters for the current streaming run.
        fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let stats = self.inner.stats();
            let dict = PyDict::new(py);
            dict.set_item("samples", stats.samples)?;
            dict.set_item("invalid_frames", stats.invalid_frames)?;
            dict.set_item("skipped_bytes", stats.skipped_bytes)?;
            dict.set_item("skip_run", stats.skip_run)?;
            dict.set_item("desyncs", stats.desyncs)?;
            Ok(dict)
        }

        #[getter]
        fn is_streaming(&self) -> bool {
            self.inner.is_streaming()
        }

        #[getter]
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        #[getter]
        fn port(&self) -> Option<String> {
            self.inner.port_name()
        }

        fn __repr__(&self) -> String {
            format!(
                "StreamingSession(port={:?}, streaming={})",
                self.inner.port_name(),
                self.inner.is_streaming()
            )
        }
    }

    impl Drop for PySession {
        fn drop(&mut self) {
            // The read loop may be waiting for the GIL inside an observer.
            let _ = self.inner.stop();
            let inner = Arc::clone(&self.inner);
            Python::attach(|py| {
                py.detach(move || {
                    let _ = inner.wait(None);
                })
            });
        }
    }

    /// Route Rust logs into Python's `logging` module.
    #[pyfunction]
    fn init_logging(py: Python<'_>) -> PyResult<()> {
        logging::init_python_logging(py)
    }

    /// Set the minimum forwarded level ("error", "warn", "info", "debug", "trace").
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        logging::set_python_log_level_str(py, level)
    }

    /// Forget cached Python loggers after reconfiguring `logging`.
    #[pyfunction]
    fn reset_log_cache() {
        logging::reset_python_logging_cache();
    }

    /// The Python module definition
    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PySession>()?;
        m.add_function(wrap_pyfunction!(init_logging, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
        m.add_function(wrap_pyfunction!(reset_log_cache, m)?)?;

        m.add("BAUD_RATE", BAUD_RATE)?;
        m.add("REFERENCE_VOLTS", REFERENCE_VOLTS)?;
        m.add("WAVES", vec!["SINE", "TRIANGLE"])?;
        m.add("RANGES", vec!["SMALL", "LARGE"])?;

        Ok(())
    }
}

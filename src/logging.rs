use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "WAVEDAC_LOG";

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Initialize stderr logging for binaries from `WAVEDAC_LOG`/`RUST_LOG`.
///
/// `verbosity` overrides the environment when given (e.g. from `-v` flags).
/// Only the first call installs a logger.
pub fn init_rust_logging(verbosity: Option<&str>) {
    let level = parse_level(verbosity).unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python::{
    init_python_logging, reset_python_logging_cache, set_python_log_level,
    set_python_log_level_str,
};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards Rust log records to Python's `logging`, one Python logger per
    /// Rust target (`_core::session` becomes `_core.session`).
    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        cache: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn top(&self) -> LevelFilter {
            *self.top_filter.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn py_level(level: log::Level) -> usize {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }

        fn effective_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            use log::Level::*;
            for level in [Trace, Debug, Info, Warn, Error] {
                if logger
                    .call_method1("isEnabledFor", (Self::py_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((level, logger)) = cache.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::effective_level(&logger)?;
            let logger = logger.unbind();
            cache.insert(target.to_string(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (enabled, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > enabled || level > self.top() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let rec = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    Self::py_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (rec,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.top()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            // Records come from the read-loop thread too; take the GIL here.
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) -> PyResult<&'static PyLogger> {
        PY_LOGGER
            .get_or_try_init(|| {
                PyLogger::new(py, level).map(|logger| &*Box::leak(Box::new(logger)))
            })
            .copied()
    }

    /// Route Rust logs into Python's `logging`. Only the first call installs
    /// the bridge.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match install(py, level) {
            Ok(logger) => {
                if log::set_logger(logger).is_ok() {
                    log::set_max_level(level);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Drop cached per-target loggers (after changing Python logging config).
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            logger
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        let logger = install(py, level)?;
        *logger.top_filter.lock().unwrap_or_else(|e| e.into_inner()) = level;
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }

    /// Like [`set_python_log_level`], from a level name; falls back to the
    /// environment when `level` is missing or invalid.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        set_python_log_level(py, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some(" WARN ")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
        assert_eq!(level_to_str(LevelFilter::Trace), "trace");
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_rust_logging(Some("debug"));
        init_rust_logging(None);
        log::debug!("logging initialized twice");
    }
}

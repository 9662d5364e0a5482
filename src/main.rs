use std::process::exit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use _core::logging::init_rust_logging;
use _core::{
    DriverError, LoopExit, Range, SerialConnector, SessionConfig, SimulatedBoard,
    SimulatedSource, StatusEvent, StreamingSession, Wave,
};

#[derive(Parser, Debug)]
#[command(name = "wavedac-demo", about = "Stream samples from a WaveDAC board")]
struct Args {
    /// Serial port of the board (e.g. /dev/ttyACM0, COM3)
    #[arg(required_unless_present = "simulate")]
    port: Option<String>,
    /// Use an emulated board instead of a serial port
    #[arg(long)]
    simulate: bool,
    /// How long to stream, in seconds
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,
    /// Waveform to select before streaming (SINE or TRIANGLE)
    #[arg(long)]
    wave: Option<Wave>,
    /// Output range to select before streaming (SMALL or LARGE)
    #[arg(long)]
    range: Option<Range>,
    /// Open the port without sending the probe command (which resets the board)
    #[arg(long)]
    skip_probe: bool,
    /// Print every Nth sample
    #[arg(long, default_value_t = 100)]
    every: u64,
    /// Log level (overrides WAVEDAC_LOG/RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    if let Err(e) = run() {
        if let Some(driver) = e.downcast_ref::<DriverError>() {
            if driver.is_disconnect() {
                eprintln!("Hint: check the cable and that the board runs the WaveDAC firmware.");
            }
        }
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging(args.log_level.as_deref());

    if !(args.seconds.is_finite() && args.seconds > 0.0) {
        bail!("--seconds must be a positive number");
    }

    let session = Arc::new(StreamingSession::new(SessionConfig::default()));
    session.add_status_observer(Arc::new(|event: &StatusEvent| {
        if let StatusEvent::Message(text) = event {
            println!("[status] {text}");
        }
    }));

    // 1. Connection
    if args.simulate {
        let (source, handle) = SimulatedSource::new(Duration::from_millis(20));
        SimulatedBoard::default()
            .spawn(handle.clone())
            .context("failed to start simulated board")?;
        session.attach("simulated", source, handle.writer())?;
    } else {
        let port = args.port.as_deref().context("a serial port is required")?;
        let connector = SerialConnector::default();
        if args.skip_probe {
            let link = connector
                .open(port)
                .with_context(|| format!("failed to open {port}"))?;
            session.attach(link.name, link.source, link.writer)?;
        } else {
            session
                .connect_serial(port, &connector)
                .with_context(|| format!("failed to connect to {port}"))?;
        }
    }

    // 2. Configuration
    if let Some(wave) = args.wave {
        session.select_wave(wave)?;
        println!("Wave: {wave}");
    }
    if let Some(range) = args.range {
        session.select_range(range)?;
        println!("Range: {range} ({} V full scale)", range.full_scale_volts());
    }

    let every = args.every.max(1);
    let count = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&count);
    session.add_observer(Arc::new(move |volts: f64| {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % every == 0 {
            println!("[sample {n:>6}] {volts:.4} V");
        }
    }));

    // 3. Acquisition
    println!("Streaming for {:.1}s...", args.seconds);
    session.start()?;
    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    while Instant::now() < deadline && session.is_streaming() {
        thread::sleep(Duration::from_millis(100));
    }

    // 4. Cleanup
    if session.is_streaming() {
        session.stop()?;
    }
    let exit_reason = session.wait(Some(Duration::from_secs(2)))?;
    let stats = session.stats();
    println!(
        "Samples: {} | invalid frames: {} | skipped bytes: {} | desync warnings: {}",
        stats.samples, stats.invalid_frames, stats.skipped_bytes, stats.desyncs
    );
    session.disconnect()?;

    match exit_reason {
        Some(LoopExit::ConnectionLost(reason)) => {
            Err(DriverError::ConnectionLost(reason)).context("streaming ended early")
        }
        _ => {
            println!("Done.");
            Ok(())
        }
    }
}

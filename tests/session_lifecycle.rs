use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use _core::{
    Command, ConnectionStatus, DriverError, LoopExit, Range, SessionConfig, SessionState,
    SimulatedBoard, SimulatedSource, StatusEvent, StreamingSession, Wave,
};

const PATIENCE: Duration = Duration::from_secs(3);

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn emulated_session() -> (Arc<StreamingSession>, _core::SimulatedHandle, thread::JoinHandle<()>) {
    let (source, handle) = SimulatedSource::new(Duration::from_millis(20));
    let board = SimulatedBoard {
        sample_rate_hz: 1000,
        period: 50,
        tick: Duration::from_millis(5),
    }
    .spawn(handle.clone())
    .unwrap();
    let session = Arc::new(StreamingSession::new(SessionConfig::default()));
    session.attach("emulated", source, handle.writer()).unwrap();
    (session, handle, board)
}

#[test]
fn streams_from_emulated_board() {
    let (session, handle, board) = emulated_session();
    let peak = Arc::new(Mutex::new(0.0_f64));
    let count = Arc::new(AtomicU64::new(0));
    {
        let peak = Arc::clone(&peak);
        let count = Arc::clone(&count);
        session.add_observer(Arc::new(move |v: f64| {
            count.fetch_add(1, Ordering::Relaxed);
            let mut p = peak.lock().unwrap();
            *p = p.max(v);
        }));
    }

    session.select_range(Range::Small).unwrap();
    session.select_wave(Wave::Triangle).unwrap();
    session.start().unwrap();
    assert!(wait_until(|| count.load(Ordering::Relaxed) >= 200));

    session.stop().unwrap();
    assert_eq!(session.wait(Some(PATIENCE)).unwrap(), Some(LoopExit::Stopped));

    let peak = *peak.lock().unwrap();
    assert!(peak > 0.9 && peak <= 1.0 + 1e-3, "peak {peak}");
    let stats = session.stats();
    assert_eq!(stats.samples, count.load(Ordering::Relaxed));
    assert_eq!(stats.invalid_frames, 0);

    assert_eq!(
        &handle.commands()[..3],
        &[Command::RangeSmall, Command::WaveTriangle, Command::StartStreaming]
    );

    session.disconnect().unwrap();
    board.join().unwrap();
}

#[test]
fn stop_from_another_thread() {
    let (session, _handle, _board) = emulated_session();
    let count = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&count);
    session.add_observer(Arc::new(move |_v: f64| {
        sink.fetch_add(1, Ordering::Relaxed);
    }));

    session.start().unwrap();
    let remote = Arc::clone(&session);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.stop().unwrap();
    })
    .join()
    .unwrap();

    assert_eq!(session.wait(Some(PATIENCE)).unwrap(), Some(LoopExit::Stopped));
    assert_eq!(session.state(), SessionState::Idle);
    let after_stop = count.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(count.load(Ordering::Relaxed), after_stop);
}

#[test]
fn restart_after_stop_resumes_streaming() {
    let (session, _handle, _board) = emulated_session();
    let count = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&count);
    session.add_observer(Arc::new(move |_v: f64| {
        sink.fetch_add(1, Ordering::Relaxed);
    }));

    for _ in 0..3 {
        let before = count.load(Ordering::Relaxed);
        session.start().unwrap();
        assert!(wait_until(|| count.load(Ordering::Relaxed) > before + 10));
        session.stop().unwrap();
    }
    assert_eq!(session.wait(Some(PATIENCE)).unwrap(), Some(LoopExit::Stopped));
}

#[test]
fn link_failure_while_streaming() {
    let (session, handle, _board) = emulated_session();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.add_status_observer(Arc::new(move |e: &StatusEvent| {
        sink.lock().unwrap().push(e.clone());
    }));

    session.start().unwrap();
    thread::sleep(Duration::from_millis(30));
    handle.fail(std::io::ErrorKind::BrokenPipe);

    let exit = session.wait(Some(PATIENCE)).unwrap();
    assert!(matches!(exit, Some(LoopExit::ConnectionLost(_))));
    assert!(!session.is_connected());
    assert!(matches!(session.start(), Err(DriverError::NotConnected)));
    assert!(events
        .lock()
        .unwrap()
        .contains(&StatusEvent::ConnectionChanged(ConnectionStatus::Disconnected)));
}

#[test]
fn reconnect_to_a_new_board_after_link_failure() {
    let (session, handle, _board) = emulated_session();
    let count = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&count);
    session.add_observer(Arc::new(move |_v: f64| {
        sink.fetch_add(1, Ordering::Relaxed);
    }));

    session.start().unwrap();
    assert!(wait_until(|| count.load(Ordering::Relaxed) > 0));
    handle.fail(std::io::ErrorKind::BrokenPipe);
    assert!(wait_until(|| !session.is_connected()));

    let (source, fresh) = SimulatedSource::new(Duration::from_millis(20));
    let board = SimulatedBoard {
        sample_rate_hz: 1000,
        period: 50,
        tick: Duration::from_millis(5),
    }
    .spawn(fresh.clone())
    .unwrap();
    session.attach("replacement", source, fresh.writer()).unwrap();

    let before = count.load(Ordering::Relaxed);
    session.start().unwrap();
    assert!(wait_until(|| count.load(Ordering::Relaxed) > before + 20));
    assert_eq!(session.stats().invalid_frames, 0);

    session.disconnect().unwrap();
    board.join().unwrap();
}

#[test]
fn dropping_the_session_joins_the_loop() {
    let (session, handle, board) = emulated_session();
    session.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    drop(session);

    // The source went down with the session, so the emulator exits too.
    assert!(handle.is_closed());
    board.join().unwrap();
    assert_eq!(handle.commands().last(), Some(&Command::StopStreaming));
}

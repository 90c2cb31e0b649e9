//! Per-camera capture: pipeline ownership, autonomous restart, frame fan-out
//!
//! Each `CaptureSource` owns one GStreamer pipeline and a monitor thread
//! that drives the pipeline's message bus. Transient pipeline failures
//! (bus errors, end-of-stream, relaunch failures) are hidden from
//! subscribers: the monitor restarts the pipeline with exponential backoff,
//! without an upper bound on attempts. Industrial operation assumes the
//! network may be down for hours.

mod fanout;
mod pipeline;

pub use fanout::{FanoutRegistry, FrameCallback};
pub use pipeline::{description as pipeline_description, PipelineError};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::CameraConfig;
use crate::frame::EncodedFrame;

use pipeline::{ActivePipeline, BusEvent};

/// Bus poll granularity; bounds how long shutdown can go unnoticed
const BUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff sleeps are sliced to this quantum so shutdown preempts them
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Backoff between relaunch attempts starts here and doubles per failure
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// State shared between the `CaptureSource` handle, the monitor thread, and
/// the appsink sample callback.
pub struct SourceShared {
    config: CameraConfig,
    running: AtomicBool,
    shutdown: AtomicBool,
    frame_count: AtomicU64,
    restart_count: AtomicU32,
    last_frame: Mutex<Option<Instant>>,
    subscribers: FanoutRegistry,
}

impl SourceShared {
    pub(crate) fn camera(&self) -> &CameraConfig {
        &self.config
    }

    /// Called from the appsink thread for every emitted access unit.
    pub(crate) fn deliver(&self, frame: EncodedFrame) {
        self.frame_count.fetch_add(1, Ordering::SeqCst);
        *self.last_frame.lock() = Some(Instant::now());
        self.subscribers.dispatch(&frame);
    }
}

/// One camera's capture runtime: owns the pipeline and its monitor thread,
/// and exposes the frame-subscription registry.
pub struct CaptureSource {
    shared: Arc<SourceShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            shared: Arc::new(SourceShared {
                config,
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                frame_count: AtomicU64::new(0),
                restart_count: AtomicU32::new(0),
                last_frame: Mutex::new(None),
                subscribers: FanoutRegistry::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.shared.config
    }

    /// Launch the pipeline and start the monitor thread.
    ///
    /// Returns true on success (or when already running); false when the
    /// initial pipeline construction fails, leaving the source idle. A
    /// fresh start clears any previous shutdown latch and restart history.
    pub fn start(&self) -> bool {
        let mut monitor = self.monitor.lock();
        if let Some(handle) = monitor.as_ref() {
            if !handle.is_finished() {
                warn!(camera = %self.id(), "capture already running");
                return true;
            }
        }
        if let Some(stale) = monitor.take() {
            let _ = stale.join();
        }

        self.shared.shutdown.store(false, Ordering::SeqCst);
        self.shared.restart_count.store(0, Ordering::SeqCst);

        info!(camera = %self.id(), "starting capture");
        match ActivePipeline::launch(&self.shared) {
            Ok(active) => {
                self.shared.running.store(true, Ordering::SeqCst);
                let shared = Arc::clone(&self.shared);
                *monitor = Some(std::thread::spawn(move || run_monitor(shared, active)));
                info!(camera = %self.id(), "capture started");
                true
            }
            Err(e) => {
                error!(camera = %self.id(), error = %e, "failed to start capture");
                false
            }
        }
    }

    /// Latch shutdown, tear the pipeline down, and join the monitor thread.
    ///
    /// Safe to call repeatedly and from `Drop`. Converges within roughly one
    /// bus-poll interval plus the bounded pipeline teardown.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            info!(camera = %self.id(), "stopping capture");
            let _ = handle.join();
            info!(camera = %self.id(), "capture stopped");
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Register a frame callback; returns its subscription id.
    pub fn subscribe<F>(&self, callback: F) -> u64
    where
        F: Fn(&EncodedFrame) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(Box::new(callback))
    }

    /// Remove one subscription; no-op if the id is unknown.
    pub fn unsubscribe(&self, id: u64) {
        self.shared.subscribers.unsubscribe(id);
    }

    /// Remove every subscription.
    pub fn unsubscribe_all(&self) {
        self.shared.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// True only while the underlying pipeline is fully PLAYING
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Frames delivered over the source's whole lifetime; the counter
    /// continues across `stop()`/`start()` cycles.
    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::SeqCst)
    }

    /// Autonomous restart attempts since the last explicit `start()`
    pub fn restart_count(&self) -> u32 {
        self.shared.restart_count.load(Ordering::SeqCst)
    }

    pub fn seconds_since_last_frame(&self) -> Option<f64> {
        self.shared
            .last_frame
            .lock()
            .map(|t| t.elapsed().as_secs_f64())
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Monitor loop: pump the bus while the pipeline runs, tear down on a
/// terminal event, then relaunch with exponential backoff. Expressed as a
/// flat loop so pathological flapping cannot grow the stack.
fn run_monitor(shared: Arc<SourceShared>, mut active: ActivePipeline) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let shutdown = pump_bus(&shared, &active);
        shared.running.store(false, Ordering::SeqCst);
        active.shut_down();
        if shutdown {
            return;
        }
        match relaunch_with_backoff(&shared, &mut backoff) {
            Some(next) => active = next,
            None => return,
        }
    }
}

/// Drive the bus until shutdown (returns true) or a terminal pipeline event
/// (returns false). Polls are bounded so shutdown is observed promptly.
fn pump_bus(shared: &SourceShared, active: &ActivePipeline) -> bool {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return true;
        }
        match active.next_event(BUS_POLL_INTERVAL) {
            Some(BusEvent::Error(msg)) => {
                error!(camera = %shared.config.id, "pipeline error: {msg}");
                return false;
            }
            Some(BusEvent::Eos) => {
                warn!(camera = %shared.config.id, "unexpected end of stream");
                return false;
            }
            None => {}
        }
    }
}

/// Keep attempting to relaunch the pipeline, sleeping `backoff` between
/// attempts and doubling it (capped) after each failure. Returns None when
/// shutdown preempts the wait.
fn relaunch_with_backoff(
    shared: &Arc<SourceShared>,
    backoff: &mut Duration,
) -> Option<ActivePipeline> {
    loop {
        if !interruptible_sleep(shared, *backoff) {
            return None;
        }
        let attempt = shared.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(camera = %shared.config.id, attempt, "restarting pipeline");
        match ActivePipeline::launch(shared) {
            Ok(active) => {
                shared.running.store(true, Ordering::SeqCst);
                *backoff = INITIAL_BACKOFF;
                info!(camera = %shared.config.id, "pipeline recovered");
                return Some(active);
            }
            Err(e) => {
                error!(camera = %shared.config.id, error = %e, "relaunch failed");
                *backoff = next_backoff(*backoff);
            }
        }
    }
}

/// Sleep for `total`, sliced into short quanta with shutdown checks between.
/// Returns false if shutdown was latched before the wait elapsed.
fn interruptible_sleep(shared: &SourceShared, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SHUTDOWN_CHECK_INTERVAL.min(deadline - now));
    }
}

/// Next wait in the 1, 2, 4, 8, 16, 30, 30, … backoff sequence
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraKind, EncoderKind};
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    fn test_camera() -> CameraConfig {
        CameraConfig {
            id: "cam0".to_string(),
            name: "Test".to_string(),
            kind: CameraKind::Test,
            uri: String::new(),
            width: 640,
            height: 480,
            fps: 30,
            bitrate: 1000,
            encoder: EncoderKind::Software,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let mut waits = Vec::new();
        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..8 {
            waits.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_idle_source_introspection() {
        let source = CaptureSource::new(test_camera());
        assert!(!source.is_running());
        assert_eq!(source.frame_count(), 0);
        assert_eq!(source.restart_count(), 0);
        assert!(source.seconds_since_last_frame().is_none());
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_stop_without_start_is_safe() {
        let source = CaptureSource::new(test_camera());
        source.stop();
        source.stop();
    }

    #[test]
    fn test_deliver_updates_counters_and_subscribers() {
        let source = CaptureSource::new(test_camera());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let id = source.subscribe(move |f| {
            sink.lock().unwrap().push(f.pts_ns);
            Ok(())
        });

        for n in 0..3u64 {
            source
                .shared
                .deliver(EncodedFrame::new(Bytes::from_static(b"au"), n, n == 0));
        }

        assert_eq!(source.frame_count(), 3);
        assert!(source.seconds_since_last_frame().unwrap() < 1.0);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

        source.unsubscribe(id);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_all() {
        let source = CaptureSource::new(test_camera());
        source.subscribe(|_| Ok(()));
        source.subscribe(|_| Ok(()));
        assert_eq!(source.subscriber_count(), 2);
        source.unsubscribe_all();
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_interruptible_sleep_preempted_by_shutdown() {
        let source = CaptureSource::new(test_camera());
        source.shared.shutdown.store(true, Ordering::SeqCst);
        let begin = Instant::now();
        let completed = interruptible_sleep(&source.shared, Duration::from_secs(10));
        assert!(!completed);
        assert!(begin.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_interruptible_sleep_completes() {
        let source = CaptureSource::new(test_camera());
        let completed = interruptible_sleep(&source.shared, Duration::from_millis(50));
        assert!(completed);
    }
}

//! Process-wide run state and signal handling
//!
//! The only global state in the server: a run flag flipped by the first
//! SIGINT/SIGTERM and a signal counter. The first signal requests a graceful
//! stop; a second signal at any point forces immediate exit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

pub struct Shutdown {
    stop_requested: AtomicBool,
    signal_count: AtomicU32,
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(false);
        Arc::new(Self {
            stop_requested: AtomicBool::new(false),
            signal_count: AtomicU32::new(0),
            tx,
        })
    }

    /// Create the run state and spawn the signal listener task.
    pub fn install() -> Arc<Self> {
        let shutdown = Self::new();
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle.listen_for_signals().await;
        });
        shutdown
    }

    /// Request a graceful stop; idempotent.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Wait until a stop has been requested. Returns immediately if one
    /// already has.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    async fn listen_for_signals(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            let count = self.signal_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 1 {
                info!("shutdown signal received, stopping (send again to force exit)");
                self.request_stop();
            } else {
                warn!("second shutdown signal, exiting immediately");
                std::process::exit(1);
            }
        }
    }
}

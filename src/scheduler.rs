// =============================================================================
// Scheduler — the outer tick-loop driver
// =============================================================================
//
// Grounded on the reconnect loop in `price_stream.rs` (`tokio::select!`
// against a shared `Notify` for graceful shutdown, sleep between attempts).
// Here the "attempt" is one `Engine::tick()`; the engine itself decides how
// long to sleep before the next one (`position_scan_interval` while a
// position is open, `scan_interval` otherwise), so the scheduler only needs
// to drive the loop and guard against overlapping ticks.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::engine::Engine;

pub struct Scheduler {
    engine: Arc<Engine>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Idempotent: a second `start()` while already running is a no-op.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running — start() ignored");
            return;
        }
        info!("scheduler loop starting");
        tokio::spawn(async move { self.run().await });
    }

    /// Idempotent: a second `stop()` is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        info!("scheduler loop stop requested");
    }

    async fn run(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let delay_secs = self.engine.tick().await;

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("scheduler loop stopped");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(delay_secs.max(1))) => {}
            }
        }
    }
}

//! Periodic background tasks with a non-overlap guarantee.
//!
//! Each background component owns one [`PeriodicTask`]. The timer loop awaits
//! each pass before ticking again, and components additionally wrap their pass
//! in an [`InFlightGuard`] so a periodic tick never overlaps a manual trigger.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Proof that the holder is the only pass currently running.
pub type InFlightPermit = OwnedMutexGuard<()>;

/// Explicit in-flight flag for a component's pass function.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl InFlightGuard {
    /// Create a new, idle guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard if no pass is running. Used by timer-driven passes,
    /// which skip rather than queue.
    pub fn try_enter(&self) -> Option<InFlightPermit> {
        self.lock.clone().try_lock_owned().ok()
    }

    /// Wait for any running pass to finish, then claim the guard. Used by
    /// operator-triggered passes.
    pub async fn enter(&self) -> InFlightPermit {
        self.lock.clone().lock_owned().await
    }

    /// Whether a pass currently holds the guard.
    pub fn is_active(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A named timer that invokes a pass function at a fixed period.
///
/// Stopping only cancels future ticks; a pass that is already running is
/// allowed to finish.
pub struct PeriodicTask {
    name: String,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    /// Create a stopped task.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Mutex::new(None),
        }
    }

    /// Task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the timer is currently scheduled.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Schedule `pass` every `period`, first firing after `initial_delay`.
    ///
    /// Returns `false` without scheduling anything if the task is already
    /// running. Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, period: Duration, initial_delay: Duration, pass: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut running) = self.running.lock() else {
            warn!(task = %self.name, "Periodic task state poisoned, refusing to start");
            return false;
        };

        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(task = %self.name, "Periodic task already running");
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        debug!(task = %name, "Periodic pass firing");
                        pass().await;
                    }
                }
            }

            info!(task = %name, "Periodic task stopped");
        });

        info!(task = %self.name, period_secs = period.as_secs(), "Periodic task scheduled");
        *running = Some(Running { stop_tx, handle });
        true
    }

    /// Cancel future firings. Returns `true` if the task was running.
    pub fn stop(&self) -> bool {
        let taken = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };

        match taken {
            Some(running) => {
                let _ = running.stop_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Cancel future firings and wait for the in-flight pass, if any, to finish.
    pub async fn shutdown(&self) {
        let taken = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };

        if let Some(running) = taken {
            let _ = running.stop_tx.send(true);
            if let Err(e) = running.handle.await {
                warn!(task = %self.name, "Periodic task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                let _ = running.stop_tx.send(true);
            }
        }
    }
}

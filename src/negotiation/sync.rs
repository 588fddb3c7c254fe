use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::remote::{NegotiationService, SyncSnapshot};

#[derive(Debug, Default)]
struct FlightState {
    in_flight: bool,
    rerun: bool,
    completed: u64,
}

struct SyncInner {
    service: Arc<dyn NegotiationService>,
    snapshot: watch::Receiver<SyncSnapshot>,
    state: Mutex<FlightState>,
}

impl SyncInner {
    fn state(&self) -> MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.in_flight {
                state.rerun = true;
                tracing::debug!("sync in flight, queued one rerun");
                return;
            }
            state.in_flight = true;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.work().await });
    }

    async fn work(&self) {
        loop {
            let snapshot = self.snapshot.borrow().clone();
            match self.service.sync_state(snapshot).await {
                Ok(()) => tracing::debug!("background sync complete"),
                Err(e) => tracing::warn!(error = %e, "background sync failed"),
            }

            let again = {
                let mut state = self.state();
                state.completed += 1;
                if state.rerun {
                    state.rerun = false;
                    true
                } else {
                    state.in_flight = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }
}

/// Best-effort background sync of transcript and offer state. Bursts of
/// [`schedule_sync`](Self::schedule_sync) collapse into one run after a quiet
/// window; at most one run is in flight, with at most one rerun queued behind
/// it. Failures are logged and otherwise ignored.
pub struct SyncScheduler {
    inner: Arc<SyncInner>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    debounce: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(service: Arc<dyn NegotiationService>, debounce: Duration) -> Self {
        let (snapshot_tx, snapshot) = watch::channel(SyncSnapshot::default());
        Self {
            inner: Arc::new(SyncInner {
                service,
                snapshot,
                state: Mutex::new(FlightState::default()),
            }),
            snapshot_tx,
            debounce,
            timer: Mutex::new(None),
        }
    }

    /// Replace the state the next sync will send.
    pub fn publish(&self, snapshot: SyncSnapshot) {
        self.snapshot_tx.send_replace(snapshot);
    }

    pub fn schedule_sync(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = timer.take() {
            pending.abort();
        }

        let inner = Arc::clone(&self.inner);
        let debounce = self.debounce;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.start();
        }));
    }

    pub fn run_sync(&self) {
        self.inner.start();
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.state().in_flight
    }

    /// Number of sync calls that have finished, successful or not.
    pub fn completed_runs(&self) -> u64 {
        self.inner.state().completed
    }

    pub fn shutdown(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = timer.take() {
            pending.abort();
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

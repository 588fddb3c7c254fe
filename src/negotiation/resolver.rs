use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub id: TurnId,
    pub dispatched_at: DateTime<Utc>,
    pub status: TurnStatus,
}

/// A raw reply as it comes off the network, before ordering.
#[derive(Debug)]
pub struct TurnEnvelope<T> {
    pub epoch: u64,
    pub turn_id: TurnId,
    pub payload: T,
}

/// Hands out increasing turn ids and releases replies strictly in id order,
/// regardless of the order in which they complete.
pub struct TurnResolver<T> {
    epoch: u64,
    next_id: TurnId,
    next_expected: TurnId,
    turns: BTreeMap<TurnId, Turn>,
    pending: BTreeMap<TurnId, T>,
    cancel: CancellationToken,
    cancelled: bool,
    tx: mpsc::UnboundedSender<TurnEnvelope<T>>,
    rx: mpsc::UnboundedReceiver<TurnEnvelope<T>>,
}

impl<T: Send + 'static> TurnResolver<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            epoch: 0,
            next_id: 1,
            next_expected: 1,
            turns: BTreeMap::new(),
            pending: BTreeMap::new(),
            cancel: CancellationToken::new(),
            cancelled: false,
            tx,
            rx,
        }
    }

    /// Reserve the next turn id. Returns `None` once cancelled.
    pub fn allocate(&mut self) -> Option<TurnId> {
        if self.cancelled {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.turns.insert(
            id,
            Turn {
                id,
                dispatched_at: Utc::now(),
                status: TurnStatus::Pending,
            },
        );
        Some(id)
    }

    /// Allocate a turn and run `request` in the background. The reply comes
    /// back through [`TurnResolver::recv`]; the caller never blocks here.
    pub fn dispatch<F>(&mut self, request: F) -> Option<TurnId>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let turn_id = self.allocate()?;
        let tx = self.tx.clone();
        let token = self.cancel.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(turn_id, "turn cancelled before completion");
                }
                payload = request => {
                    let _ = tx.send(TurnEnvelope { epoch, turn_id, payload });
                }
            }
        });

        tracing::debug!(turn_id, epoch, "turn dispatched");
        Some(turn_id)
    }

    pub async fn recv(&mut self) -> Option<TurnEnvelope<T>> {
        self.rx.recv().await
    }

    /// Feed a raw envelope; stale epochs are dropped.
    pub fn accept(&mut self, envelope: TurnEnvelope<T>) -> Vec<(TurnId, T)> {
        if envelope.epoch != self.epoch {
            tracing::debug!(
                turn_id = envelope.turn_id,
                epoch = envelope.epoch,
                "dropping reply from superseded epoch"
            );
            return Vec::new();
        }
        self.on_response(envelope.turn_id, envelope.payload)
    }

    /// Buffer a reply and return every reply that is now next in line, in
    /// turn order. Stops at the first gap.
    pub fn on_response(&mut self, turn_id: TurnId, payload: T) -> Vec<(TurnId, T)> {
        if self.cancelled {
            tracing::debug!(turn_id, "dropping reply after cancellation");
            return Vec::new();
        }
        if turn_id < self.next_expected
            || self.pending.contains_key(&turn_id)
            || !self.turns.contains_key(&turn_id)
        {
            tracing::debug!(turn_id, "dropping duplicate or unknown reply");
            return Vec::new();
        }

        self.pending.insert(turn_id, payload);
        if let Some(turn) = self.turns.get_mut(&turn_id) {
            turn.status = TurnStatus::Resolved;
        }
        self.drain()
    }

    fn drain(&mut self) -> Vec<(TurnId, T)> {
        let mut ready = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            self.turns.remove(&self.next_expected);
            ready.push((self.next_expected, payload));
            self.next_expected += 1;
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                waiting_on = self.next_expected,
                buffered = self.pending.len(),
                "replies buffered behind an outstanding turn"
            );
        }
        ready
    }

    /// Stop for good: buffered replies are discarded, in-flight requests are
    /// abandoned and no further turns can be dispatched.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.pending.clear();
        self.turns.clear();
        self.cancel.cancel();
    }

    /// Start a fresh epoch after a session restart. Replies to earlier turns
    /// are ignored when they arrive.
    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch += 1;
        self.cancelled = false;
        self.pending.clear();
        self.turns.clear();
        self.next_expected = self.next_id;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn in_flight(&self) -> usize {
        self.turns.len()
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn next_expected(&self) -> TurnId {
        self.next_expected
    }

    pub fn turn(&self, turn_id: TurnId) -> Option<&Turn> {
        self.turns.get(&turn_id)
    }
}

impl<T: Send + 'static> Default for TurnResolver<T> {
    fn default() -> Self {
        Self::new()
    }
}

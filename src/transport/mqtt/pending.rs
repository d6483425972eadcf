//! Matching event loop confirmations to the requests that caused them
//!
//! rumqttc writes requests in the order they were queued, and QoS 0
//! publishes all carry packet id 0, so confirmations are matched by
//! position: the n-th request queued is settled by the n-th confirmation.
//! A waiter that gives up keeps its slot, so a late confirmation is
//! discarded instead of settling a newer request.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug)]
struct Ledger<T> {
    issued: u64,
    confirmed: u64,
    settled: HashMap<u64, T>,
    abandoned: HashSet<u64>,
    closed: bool,
}

/// Confirmations for one kind of request, in request order
#[derive(Debug)]
pub struct PendingRequests<T> {
    ledger: Mutex<Ledger<T>>,
    changed: watch::Sender<u64>,
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            ledger: Mutex::new(Ledger {
                issued: 0,
                confirmed: 0,
                settled: HashMap::new(),
                abandoned: HashSet::new(),
                closed: false,
            }),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger<T>> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the slot of a request that was just queued
    ///
    /// Callers must issue in the same order they queue requests.
    pub fn issue(self: &Arc<Self>) -> Ticket<T> {
        let mut ledger = self.lock();
        ledger.issued += 1;
        Ticket {
            pending: Arc::clone(self),
            seq: ledger.issued,
            done: false,
        }
    }

    /// Settle the oldest request that has no confirmation yet
    pub fn confirm(&self, value: T) {
        let seq = {
            let mut ledger = self.lock();
            ledger.confirmed += 1;
            let seq = ledger.confirmed;
            if !ledger.abandoned.remove(&seq) {
                ledger.settled.insert(seq, value);
            }
            seq
        };
        self.changed.send_replace(seq);
    }

    /// Release every waiter; unconfirmed requests will never be confirmed
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.send_modify(|_| {});
    }

    /// Requests queued but not yet confirmed
    pub fn outstanding(&self) -> u64 {
        let ledger = self.lock();
        ledger.issued.saturating_sub(ledger.confirmed)
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One request's claim on its confirmation
///
/// Dropping the ticket before the confirmation arrives abandons the slot.
#[derive(Debug)]
pub struct Ticket<T> {
    pending: Arc<PendingRequests<T>>,
    seq: u64,
    done: bool,
}

impl<T> Ticket<T> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for this request's confirmation; `None` once the link closed without it
    pub async fn wait(mut self) -> Option<T> {
        let mut changed = self.pending.changed.subscribe();
        loop {
            {
                let mut ledger = self.pending.lock();
                if let Some(value) = ledger.settled.remove(&self.seq) {
                    self.done = true;
                    return Some(value);
                }
                if ledger.closed {
                    return None;
                }
            }
            if changed.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut ledger = self.pending.lock();
        if ledger.settled.remove(&self.seq).is_none() && self.seq > ledger.confirmed {
            ledger.abandoned.insert(self.seq);
        }
    }
}

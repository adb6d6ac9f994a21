//! Waiter bookkeeping for blocking pops.
//!
//! The engine never parks a caller itself. A blocking pop that finds nothing
//! registers a [`Waiter`] on every requested queue and hands the caller a
//! oneshot receiver; the push path resolves waiters strictly in registration
//! order, sending the freshly popped items through the oneshot. Timeout and
//! disconnect detach the waiter from every queue without resolving it.
//!
//! All state lives behind one mutex owned by the store; registration order
//! across queues is therefore global, which is what makes the fairness
//! guarantee hold between consumers waiting on different queue subsets.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::core::id::MessageId;

/// One item delivered to a blocked consumer: which queue served it plus the
/// message itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PopItem {
    pub queue: String,
    pub id: MessageId,
    pub payload: Bytes,
}

/// A consumer parked on one or more queues.
#[derive(Debug)]
struct Waiter {
    consumer: Uuid,
    /// Items the consumer still wants when a queue turns non-empty.
    want: u64,
    /// Queues this waiter is registered on, in request order.
    names: Vec<String>,
    /// Queue lists still referencing this waiter; freed at zero.
    refs: usize,
    /// Taken exactly once, on resolve.
    tx: Option<oneshot::Sender<Vec<PopItem>>>,
}

/// Registration-ordered waiter lists, one per queue name.
#[derive(Debug, Default)]
pub(crate) struct Coordinator {
    next_token: u64,
    waiters: HashMap<u64, Waiter>,
    by_queue: HashMap<String, VecDeque<u64>>,
}

impl Coordinator {
    /// Registers a consumer on every named queue and returns its token plus
    /// the receiver the caller parks on. Tokens increase in registration
    /// order, and each queue's list is appended in that same order.
    pub fn register(
        &mut self,
        consumer: Uuid,
        want: u64,
        names: &[String],
    ) -> (u64, oneshot::Receiver<Vec<PopItem>>) {
        let token = self.next_token;
        self.next_token += 1;

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(
            token,
            Waiter {
                consumer,
                want,
                names: names.to_vec(),
                refs: names.len(),
                tx: Some(tx),
            },
        );
        for name in names {
            self.by_queue.entry(name.clone()).or_default().push_back(token);
        }
        debug!(%consumer, token, queues = names.len(), want, "consumer parked");
        (token, rx)
    }

    /// Front-most waiter registered on `name`, if any. Lists only ever hold
    /// live tokens: resolve and detach unlink from every queue eagerly.
    pub fn first_waiter(&self, name: &str) -> Option<u64> {
        self.by_queue.get(name).and_then(|list| list.front().copied())
    }

    pub fn want(&self, token: u64) -> u64 {
        self.waiters.get(&token).map_or(0, |w| w.want)
    }

    /// Resolves a waiter with delivered items and detaches it everywhere.
    /// Returns false when the consumer is already gone; the items then stay
    /// in the serving queue's delivered list for a later RECOVER.
    pub fn resolve(&mut self, token: u64, items: Vec<PopItem>) -> bool {
        let Some(mut waiter) = self.remove(token) else {
            return false;
        };
        let Some(tx) = waiter.tx.take() else {
            return false;
        };
        let delivered = tx.send(items).is_ok();
        if !delivered {
            debug!(consumer = %waiter.consumer, token, "consumer vanished before resume");
        }
        delivered
    }

    /// Detaches a waiter from every queue it was registered on without
    /// resolving it. Used for timeout and disconnect; idempotent.
    pub fn detach(&mut self, token: u64) {
        if let Some(waiter) = self.remove(token) {
            debug!(consumer = %waiter.consumer, token, "consumer detached");
        }
    }

    /// Count of waiters registered on `name`.
    pub fn waiter_count(&self, name: &str) -> usize {
        self.by_queue.get(name).map_or(0, VecDeque::len)
    }

    fn remove(&mut self, token: u64) -> Option<Waiter> {
        let mut waiter = self.waiters.remove(&token)?;
        for name in &waiter.names {
            if let Some(list) = self.by_queue.get_mut(name) {
                if let Some(pos) = list.iter().position(|&t| t == token) {
                    list.remove(pos);
                    waiter.refs -= 1;
                }
                if list.is_empty() {
                    self.by_queue.remove(name);
                }
            }
        }
        debug_assert_eq!(waiter.refs, 0, "waiter freed while still referenced");
        Some(waiter)
    }
}

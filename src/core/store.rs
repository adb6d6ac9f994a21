//! The per-key queue store.
//!
//! This is the host layer the engine expects around it: a concurrent map
//! from queue name to queue instance, lazy creation on first use, the
//! per-queue mutual-exclusion boundary, and the glue between pushes and
//! parked consumers. Queue mutexes are never held across a suspension
//! point; a blocking pop parks on a [`PopTicket`] outside every lock.
//!
//! Lock order is coordinator before queue, everywhere. The blocking pop
//! path holds the coordinator lock from its final emptiness check through
//! registration, which closes the check-then-park race against concurrent
//! pushes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::blocking::{Coordinator, PopItem};
use crate::core::error::QueueError;
use crate::core::id::{mstime, MessageId};
use crate::core::queue::{ListKind, MessageView, ReliableQueue};
use crate::core::snapshot::QueueSnapshot;

type QueueCell = Arc<Mutex<ReliableQueue>>;

/// How long a pop may wait for items. Wire convention: `0` = don't block,
/// `> 0` = block up to that many milliseconds, `< 0` = block until served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    None,
    Timeout(Duration),
    Forever,
}

impl BlockMode {
    pub fn from_ms(ms: i64) -> Self {
        match ms {
            0 => BlockMode::None,
            ms if ms < 0 => BlockMode::Forever,
            ms => BlockMode::Timeout(Duration::from_millis(ms as u64)),
        }
    }
}

/// `INFO` reply: queue counters plus the store-level waiter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    pub last_id: MessageId,
    pub undelivered: u64,
    pub delivered: u64,
    pub waiters: u64,
    pub memory_used: u64,
}

/// Result of a pop: items right away, or a ticket to park on.
pub enum PopOutcome {
    Items(Vec<PopItem>),
    Pending(PopTicket),
}

/// Handle for a parked consumer. Await it with [`PopTicket::wait`];
/// dropping it unserved detaches the waiter without resuming it, which is
/// how consumer disconnects are handled.
pub struct PopTicket {
    coord: Arc<Mutex<Coordinator>>,
    token: u64,
    mode: BlockMode,
    rx: oneshot::Receiver<Vec<PopItem>>,
}

impl PopTicket {
    /// Parks the caller until a push resolves the waiter or the timeout
    /// elapses. Timeout resolves as an empty success, not an error.
    pub async fn wait(mut self) -> Vec<PopItem> {
        match self.mode {
            BlockMode::Timeout(limit) => match timeout(limit, &mut self.rx).await {
                Ok(res) => res.unwrap_or_default(),
                Err(_elapsed) => {
                    // Detach first; if a push resolved us in the meantime the
                    // detach is a no-op and the items are sitting in the
                    // channel, so pick them up rather than strand them.
                    self.coord.lock().detach(self.token);
                    self.rx.try_recv().unwrap_or_default()
                }
            },
            _ => (&mut self.rx).await.unwrap_or_default(),
        }
    }
}

impl Drop for PopTicket {
    fn drop(&mut self) {
        self.coord.lock().detach(self.token);
    }
}

/// Maps queue names to live queues and coordinates blocked consumers.
pub struct QueueStore {
    queues: DashMap<String, QueueCell>,
    coord: Arc<Mutex<Coordinator>>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            coord: Arc::new(Mutex::new(Coordinator::default())),
        }
    }

    /// Appends a batch to the named queue, creating it on first use, then
    /// serves any parked consumers from the fresh items. Returns the
    /// assigned ids in push order.
    pub fn push(&self, name: &str, payloads: Vec<Bytes>) -> Result<Vec<MessageId>, QueueError> {
        if payloads.is_empty() {
            return Err(QueueError::InvalidArgument(
                "PUSH needs at least one payload".into(),
            ));
        }
        let cell = self.cell_or_create(name);
        let ids = { cell.lock().push(payloads, mstime()) };
        self.wake_waiters(name, &cell);
        Ok(ids)
    }

    /// Pops up to `count` items from the first non-empty queue in `names`.
    /// With a blocking mode, an empty result instead registers a waiter on
    /// every named queue (creating absent ones) and returns a ticket.
    pub fn pop(
        &self,
        names: &[String],
        count: u64,
        block: BlockMode,
        consumer: Uuid,
    ) -> Result<PopOutcome, QueueError> {
        if names.is_empty() {
            return Err(QueueError::InvalidArgument(
                "POP needs at least one queue".into(),
            ));
        }
        if count == 0 {
            return Err(QueueError::InvalidArgument(
                "count must be positive".into(),
            ));
        }

        if matches!(block, BlockMode::None) {
            return Ok(PopOutcome::Items(self.try_pop(names, count)));
        }

        let mut coord = self.coord.lock();
        let items = self.try_pop(names, count);
        if !items.is_empty() {
            return Ok(PopOutcome::Items(items));
        }
        for name in names {
            self.cell_or_create(name);
        }
        let (token, rx) = coord.register(consumer, count, names);
        Ok(PopOutcome::Pending(PopTicket {
            coord: Arc::clone(&self.coord),
            token,
            mode: block,
            rx,
        }))
    }

    /// Removes the identified messages from the queue's delivered list.
    /// Missing ids are skipped; the result holds only actual removals.
    pub fn ack(&self, name: &str, ids: &[MessageId]) -> Result<Vec<MessageId>, QueueError> {
        if ids.is_empty() {
            return Err(QueueError::InvalidArgument(
                "ACK needs at least one id".into(),
            ));
        }
        let cell = self.existing(name)?;
        let removed = { cell.lock().ack(ids) };
        debug!(queue = name, requested = ids.len(), removed = removed.len(), "ack");
        Ok(removed)
    }

    /// Re-delivers up to `count` messages idle for at least `min_idle_ms`.
    pub fn recover(
        &self,
        name: &str,
        count: u64,
        min_idle_ms: i64,
    ) -> Result<Vec<MessageView>, QueueError> {
        if count == 0 {
            return Err(QueueError::InvalidArgument(
                "count must be positive".into(),
            ));
        }
        if min_idle_ms < 0 {
            return Err(QueueError::InvalidArgument(
                "min idle must be non-negative".into(),
            ));
        }
        let cell = self.existing(name)?;
        let out = cell.lock().recover(count, min_idle_ms, mstime());
        Ok(out)
    }

    /// Read-only slice of either list; see [`ReliableQueue::range`].
    pub fn range(
        &self,
        name: &str,
        which: ListKind,
        start: i64,
        count: u64,
    ) -> Result<Vec<MessageView>, QueueError> {
        let cell = self.existing(name)?;
        let out = cell.lock().range(which, start, count);
        Ok(out)
    }

    pub fn info(&self, name: &str) -> Result<StoreInfo, QueueError> {
        let cell = self.existing(name)?;
        let qi = { cell.lock().info() };
        let waiters = { self.coord.lock().waiter_count(name) as u64 };
        Ok(StoreInfo {
            last_id: qi.last_id,
            undelivered: qi.undelivered,
            delivered: qi.delivered,
            waiters,
            memory_used: qi.memory_used,
        })
    }

    /// Drops a queue and every message it owns.
    pub fn remove(&self, name: &str) -> bool {
        self.queues.remove(name).is_some()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn export(&self) -> Vec<QueueSnapshot> {
        self.queue_names()
            .into_iter()
            .filter_map(|name| self.cell(&name).map(|cell| cell.lock().snapshot()))
            .collect()
    }

    pub(crate) fn import(&self, snaps: Vec<QueueSnapshot>) {
        for snap in snaps {
            let name = snap.name.clone();
            self.queues
                .insert(name, Arc::new(Mutex::new(ReliableQueue::restore(snap))));
        }
    }

    fn cell(&self, name: &str) -> Option<QueueCell> {
        self.queues.get(name).map(|entry| Arc::clone(&entry))
    }

    fn existing(&self, name: &str) -> Result<QueueCell, QueueError> {
        self.cell(name)
            .ok_or_else(|| QueueError::NoSuchQueue(name.to_string()))
    }

    fn cell_or_create(&self, name: &str) -> QueueCell {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, "queue created");
                Arc::new(Mutex::new(ReliableQueue::new(name)))
            })
            .clone()
    }

    fn try_pop(&self, names: &[String], count: u64) -> Vec<PopItem> {
        for name in names {
            let Some(cell) = self.cell(name) else { continue };
            let views = { cell.lock().pop(count, mstime()) };
            if !views.is_empty() {
                return attach_queue(name, views);
            }
        }
        Vec::new()
    }

    /// Serves parked consumers from a queue that just gained items,
    /// strictly in registration order, until waiters or items run out.
    fn wake_waiters(&self, name: &str, cell: &QueueCell) {
        let mut coord = self.coord.lock();
        while let Some(token) = coord.first_waiter(name) {
            let want = coord.want(token);
            let views = { cell.lock().pop(want, mstime()) };
            if views.is_empty() {
                break;
            }
            if !coord.resolve(token, attach_queue(name, views)) {
                // The popped items are in `delivered` now; RECOVER will
                // hand them to the next consumer once they age.
                warn!(queue = name, "woken consumer already gone");
            }
        }
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}

fn attach_queue(name: &str, views: Vec<MessageView>) -> Vec<PopItem> {
    views
        .into_iter()
        .map(|m| PopItem {
            queue: name.to_string(),
            id: m.id,
            payload: m.payload,
        })
        .collect()
}

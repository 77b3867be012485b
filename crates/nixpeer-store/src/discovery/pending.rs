//! Pending query table: correlates answers with the queries that asked.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

/// What a peer told us: fetch `path` from `addr:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Source address of the answer datagram.
    pub addr: IpAddr,
    /// HTTP port the peer advertised.
    pub port: u16,
    pub path: String,
}

/// Index → waiting query. The lock covers both the counter and the map,
/// so allocating an index and registering it is one step.
#[derive(Default)]
pub struct PendingQueries {
    inner: Mutex<PendingTable>,
}

#[derive(Default)]
struct PendingTable {
    next_index: u32,
    waiters: HashMap<u32, oneshot::Sender<Answer>>,
}

impl PendingQueries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate the next index and register a slot for it.
    pub fn register(self: &Arc<Self>) -> PendingQuery {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        let index = table.next_index;
        table.next_index = index.wrapping_add(1);
        table.waiters.insert(index, tx);
        PendingQuery {
            index,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Hand `answer` to the query waiting on `index`.
    ///
    /// Returns false when nothing was waiting: unknown index, already
    /// answered, timed out, or the asker went away.
    pub fn resolve(&self, index: u32, answer: Answer) -> bool {
        let waiter = self.lock().waiters.remove(&index);
        match waiter {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered query. Dropping it retires its index.
pub struct PendingQuery {
    index: u32,
    rx: oneshot::Receiver<Answer>,
    table: Arc<PendingQueries>,
}

impl PendingQuery {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Wait for the first answer, or `None` once `timeout` passes.
    pub async fn wait(mut self, timeout: Duration) -> Option<Answer> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(answer)) => Some(answer),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        self.table.lock().waiters.remove(&self.index);
    }
}

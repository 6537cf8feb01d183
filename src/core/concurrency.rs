//! Per-key serialization of event execution.
//!
//! Each lock key is either idle or active. While active, arrivals for the
//! same key wait in a FIFO queue; when the active item finishes (success,
//! failure or panic) the drain task pops the next one itself, so ordering is
//! strict and the stack never grows with the queue length.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type Runner<T> = Arc<dyn Fn(T) -> BoxTask + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// Waiting behind the active item; `position` is 1-based.
    Queued { position: usize },
    /// The key was busy and the caller asked not to queue.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyStatus {
    pub active: bool,
    pub queued: usize,
}

struct LockTable<T> {
    active: HashSet<String>,
    queues: HashMap<String, VecDeque<T>>,
}

pub struct ConcurrencyController<T: Send + 'static> {
    table: Arc<Mutex<LockTable<T>>>,
    runner: Runner<T>,
}

impl<T: Send + 'static> Clone for ConcurrencyController<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            runner: self.runner.clone(),
        }
    }
}

impl<T: Send + 'static> ConcurrencyController<T> {
    pub fn new(runner: Runner<T>) -> Self {
        Self {
            table: Arc::new(Mutex::new(LockTable {
                active: HashSet::new(),
                queues: HashMap::new(),
            })),
            runner,
        }
    }

    /// Admit `item` under `lock_key`. `None` runs immediately with no
    /// ordering relative to anything else.
    pub async fn submit(&self, lock_key: Option<String>, item: T, reject_when_busy: bool) -> Admission {
        let Some(key) = lock_key else {
            tokio::spawn((self.runner)(item));
            return Admission::Started;
        };

        {
            let mut table = self.table.lock().await;
            if table.active.contains(&key) {
                if reject_when_busy {
                    return Admission::Rejected;
                }
                let queue = table.queues.entry(key.clone()).or_default();
                queue.push_back(item);
                let position = queue.len();
                debug!("Lock [{}] busy, queued at position {}", key, position);
                return Admission::Queued { position };
            }
            table.active.insert(key.clone());
        }

        let table = self.table.clone();
        let runner = self.runner.clone();
        tokio::spawn(drain(table, runner, key, item));
        Admission::Started
    }

    pub async fn status(&self, lock_key: &str) -> KeyStatus {
        let table = self.table.lock().await;
        KeyStatus {
            active: table.active.contains(lock_key),
            queued: table.queues.get(lock_key).map(VecDeque::len).unwrap_or(0),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.table.lock().await.active.len()
    }

    /// Drop every queued item. Active items keep running and release their
    /// keys normally.
    pub async fn clear_queues(&self) -> usize {
        let mut table = self.table.lock().await;
        let dropped = table.queues.values().map(VecDeque::len).sum();
        table.queues.clear();
        dropped
    }
}

async fn drain<T: Send + 'static>(
    table: Arc<Mutex<LockTable<T>>>,
    runner: Runner<T>,
    key: String,
    first: T,
) {
    let mut next = Some(first);
    while let Some(item) = next.take() {
        // Run in a child task so a panic still releases the key.
        if let Err(e) = tokio::spawn(runner(item)).await {
            error!("Task under lock [{}] aborted: {}", key, e);
        }

        let mut table = table.lock().await;
        next = table.queues.get_mut(&key).and_then(VecDeque::pop_front);
        if next.is_none() {
            table.queues.remove(&key);
            table.active.remove(&key);
        }
    }
    debug!("Lock [{}] released", key);
}

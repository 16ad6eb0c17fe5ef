//! Bounded task queue: a global concurrency cap shared by every task, with
//! strict per-user FIFO chains.
//!
//! Invariants: two tasks for the same user never run concurrently; total
//! running never exceeds the cap; a task that panics does not poison its
//! user's chain; the next queued task still runs.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    pub queued: bool,
    /// Depth of the user's chain after the call (or at rejection time).
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub running: usize,
    pub waiting: usize,
}

/// A held global slot for non-user work (crons, tools).  Dropping it releases
/// the slot.
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

struct UserChain {
    tasks: VecDeque<Task>,
    draining: bool,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    users: Mutex<HashMap<String, UserChain>>,
    running: AtomicUsize,
    waiting: AtomicUsize,
    max_per_user: usize,
}

#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    pub fn new(max_concurrent: usize, max_per_user: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                users: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                max_per_user: max_per_user.max(1),
            }),
        }
    }

    /// Queue a task on the user's FIFO chain.  Rejected (not queued) when the
    /// chain is already at `max_per_user`.
    pub async fn enqueue<F>(&self, user_id: &str, task: F) -> EnqueueResult
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut users = self.inner.users.lock().await;
        let chain = users.entry(user_id.to_string()).or_insert_with(|| UserChain {
            tasks: VecDeque::new(),
            draining: false,
        });

        if chain.tasks.len() >= self.inner.max_per_user {
            debug!(user = user_id, depth = chain.tasks.len(), "queue full — task rejected");
            return EnqueueResult {
                queued: false,
                depth: chain.tasks.len(),
            };
        }

        chain.tasks.push_back(Box::pin(task));
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let depth = chain.tasks.len();

        if !chain.draining {
            chain.draining = true;
            let queue = self.clone();
            let user = user_id.to_string();
            tokio::spawn(async move {
                queue.drain_user(user).await;
            });
        }

        EnqueueResult { queued: true, depth }
    }

    /// Worker loop for one user: strictly serial, bounded by the global cap.
    async fn drain_user(&self, user_id: String) {
        loop {
            let task = {
                let mut users = self.inner.users.lock().await;
                let Some(chain) = users.get_mut(&user_id) else {
                    return;
                };
                match chain.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        chain.draining = false;
                        return;
                    }
                }
            };

            let permit = match self.inner.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            // Running is bumped before waiting drops so `drain` never sees a
            // momentarily idle queue with a task in hand.
            self.inner.running.fetch_add(1, Ordering::SeqCst);
            self.inner.waiting.fetch_sub(1, Ordering::SeqCst);

            // Run inside its own task so a panic is contained and the chain
            // keeps draining.
            let handle = tokio::spawn(task);
            if let Err(err) = handle.await {
                warn!(user = %user_id, %err, "queued task crashed — chain continues");
            }

            self.inner.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
    }

    /// Take a global slot for non-user work.  Waits until one is free.
    pub async fn acquire_slot(&self) -> SlotGuard {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("queue semaphore never closes");
        self.inner.running.fetch_add(1, Ordering::SeqCst);
        SlotGuard { _permit: permit }
    }

    /// Release a slot taken with [`Queue::acquire_slot`].
    pub fn release_slot(&self, guard: SlotGuard) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Wait until the queue is fully idle, bounded by `timeout_ms`.  Returns
    /// `true` when idle was reached.
    pub async fn drain(&self, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let stats = self.stats();
            if stats.running == 0 && stats.waiting == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            running: self.inner.running.load(Ordering::SeqCst),
            waiting: self.inner.waiting.load(Ordering::SeqCst),
        }
    }
}

//! Per-location disk thread pools.
//!
//! Reads go through a prioritized pool: lower priority values run earlier,
//! equal priorities run in submission order. Writes go through a plain FIFO
//! pool, which also serializes them when it has a single thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{format_err, Error};
use tokio::sync::oneshot;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: i64,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smaller (priority, seq) must compare
        // greater so it pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// Prioritized worker pool backed by dedicated OS threads.
pub struct PrioritizedPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl PrioritizedPool {
    pub fn new(name: &str, thread_count: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let workers = (0..thread_count.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueue a task; lower `priority` runs earlier.
    pub fn spawn(&self, priority: i64, task: Task) {
        let seq = self.shared.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push(QueuedTask {
            priority,
            seq,
            task,
        });
        self.shared.wakeup.notify_one();
    }

    /// Run a fallible closure on the pool and await its outcome.
    pub fn submit<T, F>(
        &self,
        priority: i64,
        f: F,
    ) -> impl Future<Output = Result<T, Error>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(
            priority,
            Box::new(move || {
                let _ = tx.send(f());
            }),
        );
        async move {
            rx.await
                .map_err(|_| format_err!("worker pool terminated"))?
        }
    }
}

impl Drop for PrioritizedPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.wakeup.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(queued) = queue.pop() {
                    break queued.task;
                }
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    return;
                }
                queue = shared.wakeup.wait(queue).unwrap();
            }
        };
        task();
    }
}

/// FIFO worker pool. With one thread this serializes all submitted work,
/// which is what the per-location write path relies on.
pub struct FifoPool {
    sender: Option<crossbeam_channel::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl FifoPool {
    pub fn new(name: &str, thread_count: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let workers = (0..thread_count.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn spawn(&self, task: Task) {
        self.sender
            .as_ref()
            .expect("pool is shut down")
            .send(task)
            .expect("pool workers are gone");
    }

    pub fn submit<T, F>(&self, f: F) -> impl Future<Output = Result<T, Error>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(Box::new(move || {
            let _ = tx.send(f());
        }));
        async move {
            rx.await
                .map_err(|_| format_err!("worker pool terminated"))?
        }
    }
}

impl Drop for FifoPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_priority_order() {
        // a single worker kept busy while we enqueue out of order
        let pool = PrioritizedPool::new("test-read", 1);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let gate = Arc::new((StdMutex::new(false), Condvar::new()));
        {
            let gate = Arc::clone(&gate);
            pool.spawn(
                i64::MIN,
                Box::new(move || {
                    let (lock, cvar) = &*gate;
                    let mut open = lock.lock().unwrap();
                    while !*open {
                        open = cvar.wait(open).unwrap();
                    }
                }),
            );
        }

        for priority in [5i64, 1, 3, 1] {
            let order = Arc::clone(&order);
            pool.spawn(
                priority,
                Box::new(move || {
                    order.lock().unwrap().push(priority);
                }),
            );
        }

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        // dropping joins the workers
        drop(pool);
        // equal priorities keep submission order
        assert_eq!(*order.lock().unwrap(), vec![1, 1, 3, 5]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_roundtrip() {
        let pool = FifoPool::new("test-write", 1);
        let value = pool.submit(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);

        let err = pool
            .submit::<(), _>(|| Err(format_err!("boom")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}

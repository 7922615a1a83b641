use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Unit of work queued on a worker thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<(u64, Job)>,
    outstanding: usize,
    destroying: bool,
}

struct WorkQueue {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    drained: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                outstanding: 0,
                destroying: false,
            }),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    // Jobs never run under the lock, so a poisoned mutex still holds consistent state
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed set of worker threads, each with its own FIFO job queue.
///
/// Work for one thread executes in submission order, which is what lets the
/// renderers record into a single secondary command buffer from one worker.
pub struct ThreadManager {
    queues: Vec<Arc<WorkQueue>>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadManager {
    /// Spawn `count` workers
    pub fn new(count: usize) -> std::io::Result<Self> {
        let mut queues = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let queue = Arc::new(WorkQueue::new());
            let worker_queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("terra-worker-{index}"))
                .spawn(move || worker_loop(index, &worker_queue))?;
            queues.push(queue);
            handles.push(handle);
        }

        log::debug!("Spawned {count} worker threads");
        Ok(Self { queues, handles })
    }

    /// Number of workers
    pub fn thread_count(&self) -> usize {
        self.queues.len()
    }

    /// Queue `job` on worker `thread`; `id` is only used for diagnostics.
    ///
    /// # Panics
    /// Panics if `thread` is not a valid worker index.
    pub fn add_work<F>(&self, thread: usize, id: u64, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = &self.queues[thread];
        let mut state = queue.lock();
        state.jobs.push_back((id, Box::new(job)));
        state.outstanding += 1;
        queue.work_ready.notify_one();
    }

    /// Jobs queued or running on `thread`
    pub fn pending(&self, thread: usize) -> usize {
        self.queues[thread].lock().outstanding
    }

    /// Block until every job queued on `thread` so far has finished
    pub fn wait(&self, thread: usize) {
        let queue = &self.queues[thread];
        let mut state = queue.lock();
        while state.outstanding > 0 {
            state = queue
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until every worker is idle
    pub fn wait_all(&self) {
        for thread in 0..self.queues.len() {
            self.wait(thread);
        }
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.wait_all();

        for queue in &self.queues {
            queue.lock().destroying = true;
            queue.work_ready.notify_all();
        }

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker thread exited with a panic");
            }
        }
    }
}

fn worker_loop(index: usize, queue: &WorkQueue) {
    loop {
        let (id, job) = {
            let mut state = queue.lock();
            loop {
                if let Some(work) = state.jobs.pop_front() {
                    break work;
                }
                if state.destroying {
                    return;
                }
                state = queue
                    .work_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Job {id:#x} panicked on worker {index}");
        }

        let mut state = queue.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            queue.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_wait_returns_after_all_jobs_finished() {
        let manager = ThreadManager::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for id in 0..50 {
            let counter = Arc::clone(&counter);
            manager.add_work(1, id, move || {
                thread::sleep(Duration::from_micros(100));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        manager.wait(1);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(manager.pending(1), 0);
    }

    #[test]
    fn test_jobs_on_one_thread_run_in_submission_order() {
        let manager = ThreadManager::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..20u64 {
            let order = Arc::clone(&order);
            manager.add_work(0, id, move || order.lock().unwrap().push(id));
        }

        manager.wait(0);
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_on_idle_thread_returns_immediately() {
        let manager = ThreadManager::new(3).unwrap();
        manager.wait(2);
        manager.wait_all();
        assert_eq!(manager.thread_count(), 3);
    }

    #[test]
    fn test_panicking_job_does_not_strand_waiters() {
        let manager = ThreadManager::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        manager.add_work(0, 1, || panic!("job failure"));
        let after = Arc::clone(&counter);
        manager.add_work(0, 2, move || {
            after.fetch_add(1, Ordering::SeqCst);
        });

        manager.wait(0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_drains_queued_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let manager = ThreadManager::new(2).unwrap();
            for id in 0..10 {
                let counter = Arc::clone(&counter);
                manager.add_work((id % 2) as usize, id, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}

//! A fixed-size pool of worker threads.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
};

use crossbeam_channel::Sender;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-shot completion handle for a submitted task.
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run.
    ///
    /// Returns `None` when the pool shut down before the task was started;
    /// the task never runs in that case.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }
}

/// A fixed number of workers draining a shared FIFO task queue.
///
/// Tasks are movable-only closures. On drop the pool stops: in-flight tasks
/// finish, queued tasks are discarded and their handles resolve as not run,
/// and every worker is joined before the drop returns.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> WorkerPool {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let stop = Arc::clone(&stop);

                thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();

                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                    }
                })
            })
            .collect();

        WorkerPool {
            tx: Some(tx),
            stop,
            workers,
        }
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task, returning its completion handle.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);

        let job: Job = Box::new(move || {
            // The receiver may already be gone; nobody is waiting then.
            let _ = tx.send(task());
        });

        if let Some(queue) = &self.tx {
            // A failed send drops the job, which resolves the handle as not
            // run. Only possible once every worker has exited.
            let _ = queue.send(job);
        }

        TaskHandle { rx }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        // Closing the queue wakes idle workers; busy ones see the stop flag
        // after their current task.
        self.tx.take();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_complete() {
        let pool = WorkerPool::new(4);

        let handles: Vec<_> = (0..32u64).map(|i| pool.submit(move || i * i)).collect();

        let mut results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        results.sort_unstable();

        assert_eq!(results, (0..32u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_tasks_are_movable_only() {
        let pool = WorkerPool::new(1);

        let owned = vec![1u64, 2, 3];
        let handle = pool.submit(move || owned.into_iter().sum::<u64>());

        assert_eq!(handle.wait(), Some(6));
    }

    #[test]
    fn test_shutdown_drops_queued_tasks() {
        let pool = WorkerPool::new(1);

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        let in_flight = pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            1u64
        });

        // Queued behind the blocked worker; never started.
        let queued = pool.submit(|| 2u64);

        started_rx.recv().unwrap();

        // Let the worker finish its current task once shutdown is underway.
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });

        drop(pool);
        releaser.join().unwrap();

        assert_eq!(in_flight.wait(), Some(1));
        assert_eq!(queued.wait(), None);
    }
}

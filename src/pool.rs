use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use core_affinity::{get_core_ids, set_for_current};
use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
    sender: Option<Sender<Job>>,
}

/// A minimal thread pool with core affinity. No effort is made to schedule
/// jobs intelligently; unhinted jobs go round-robin, and hinted jobs go to
/// the hinted worker modulo the pool size, which keeps one node's kernels on
/// one core across stages.
///
pub struct ThreadPool {
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
}

impl ThreadPool {
    /// Create a new thread pool with at most the given number of threads. If
    /// the system has fewer physical CPU cores than the requested number of
    /// threads, then the number of cores is used instead.
    ///
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "thread pool requires at least one worker");
        let workers = get_core_ids()
            .unwrap_or_default()
            .into_iter()
            .map(Some)
            .chain(std::iter::repeat(None))
            .take(num_threads)
            .map(|core_id| {
                let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
                let handle = thread::spawn(move || {
                    if let Some(core_id) = core_id {
                        set_for_current(core_id);
                    }
                    for job in receiver {
                        job()
                    }
                });
                Worker {
                    handle: Some(handle),
                    sender: Some(sender),
                }
            })
            .collect();

        ThreadPool {
            workers,
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Return the number of worker threads in the pool.
    ///
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Spawn a job onto the worker thread with the given index modulo the
    /// pool size, if it is `Some`. Otherwise the job is run on the current
    /// round-robin worker index, which is then incremented.
    ///
    pub fn spawn_on<F>(&self, worker_id: Option<usize>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let worker_id = match worker_id {
            Some(worker_id) => worker_id % self.num_threads(),
            None => self.next_worker.fetch_add(1, Ordering::Relaxed) % self.num_threads(),
        };
        self.workers[worker_id]
            .sender
            .as_ref()
            .unwrap()
            .send(Box::new(job))
            .unwrap();
    }

    /// Spawn a job onto the next round-robin worker.
    ///
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_on(None, job)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.sender.take().unwrap();
        self.handle.take().unwrap().join().unwrap();
    }
}

#[cfg(test)]
mod test {
    use super::ThreadPool;
    use crossbeam_channel::unbounded;

    #[test]
    fn jobs_run_on_every_worker() {
        let pool = ThreadPool::new(3);
        let (sink, source) = unbounded();

        for n in 0..12 {
            let sink = sink.clone();
            pool.spawn(move || sink.send(n).unwrap());
        }
        let mut got: Vec<i32> = source.iter().take(12).collect();
        got.sort();
        assert_eq!(got, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn hints_wrap_around_the_pool() {
        let pool = ThreadPool::new(2);
        let (sink, source) = unbounded();
        let sink2 = sink.clone();

        pool.spawn_on(Some(7), move || sink.send(1).unwrap());
        pool.spawn_on(Some(9), move || sink2.send(2).unwrap());
        let mut got: Vec<i32> = source.iter().take(2).collect();
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }
}

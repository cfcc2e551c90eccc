//! A bounded pool of worker threads pulling recipe jobs off a shared queue.
//! Results come back over a channel; stop sentinels shut the workers down,
//! even when a thread panics.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc::{sync_channel, Receiver},
};

use crossbeam::deque::{Injector, Steal};
use scopeguard::{defer, defer_on_unwind};

pub trait Job: Send {
    type Output: Send;
    fn run(self) -> Self::Output;
}

enum QueueEntry<J> {
    Stop,
    Job(J),
}

pub struct JobPool<J: Job> {
    capacity: usize,
    queue: Injector<QueueEntry<J>>,
    running: AtomicUsize,
}

/// Handed to the scheduling closure; jobs can only be enqueued while the
/// workers are alive.
pub struct Scope<'a, J: Job> {
    pool: &'a JobPool<J>,
    pub rx: Receiver<J::Output>,
}

impl<'a, J> Scope<'a, J>
where
    J: Job,
{
    pub fn enqueue(&self, job: J) {
        self.pool.queue.push(QueueEntry::Job(job));
    }

    /// Advisory: a worker may still be draining its last job.
    pub fn has_capacity(&self) -> bool {
        self.pool.running.load(Ordering::Relaxed) < self.pool.capacity
    }
}

impl<J> JobPool<J>
where
    J: Job,
{
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1);
        JobPool {
            capacity,
            queue: Injector::new(),
            running: AtomicUsize::new(0),
        }
    }

    /// Runs `main_thread` with the workers alive. A panic on any worker is
    /// returned as the Err value after the pool has shut down, the same way
    /// `crossbeam::scope` reports it; the caller decides what to do with it.
    pub fn run<F, R>(&self, main_thread: F) -> Result<R, Box<dyn std::any::Any + Send>>
    where
        F: FnOnce(Scope<J>) -> R,
        R: Send,
    {
        let (tx, rx) = sync_channel(self.capacity);

        crossbeam::scope(|s| {
            for _ in 0..self.capacity {
                let tx = tx.clone();
                s.spawn(move |_| {
                    defer_on_unwind! {
                        for _ in 0..self.capacity {
                            self.queue.push(QueueEntry::Stop);
                        }
                    }

                    loop {
                        match self.queue.steal() {
                            Steal::Success(QueueEntry::Stop) => break,
                            Steal::Success(QueueEntry::Job(job)) => {
                                self.running.fetch_add(1, Ordering::SeqCst);
                                defer! { self.running.fetch_sub(1, Ordering::SeqCst); }
                                let result = job.run();
                                if tx.send(result).is_err() {
                                    // Receiver gone; nobody wants results.
                                    break;
                                }
                            }
                            _ => std::thread::yield_now(),
                        }
                    }
                });
            }

            // Drop our sender so rx closes once the workers exit.
            drop(tx);

            // Shut the workers down even if the main closure panics.
            defer!(for _ in 0..self.capacity {
                self.queue.push(QueueEntry::Stop);
            });
            main_thread(Scope { pool: self, rx })
        })
    }
}

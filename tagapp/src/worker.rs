//! Worker runtime: each component runs its loop on a dedicated OS thread and
//! communicates only through subjects and queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};

/// A long-running component. The runtime calls [`start`](Worker::start), then
/// [`run`](Worker::run) repeatedly until it returns false or shutdown is
/// requested, then [`stop`](Worker::stop).
pub trait Worker: Send {
    fn name(&self) -> &str;

    fn start(&mut self) {}

    fn stop(&mut self) {}

    /// One loop iteration: handle at most one command, perform bounded work.
    fn run(&mut self) -> bool;
}

/// Cooperative sleep used by worker loops while idle.
pub fn wait(millis: u64) {
    std::thread::sleep(Duration::from_millis(millis));
}

pub struct WorkerHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request termination after the current loop iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker {} panicked", self.name);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn a worker on its own named thread.
pub fn spawn(mut worker: Box<dyn Worker>) -> WorkerHandle {
    let name = worker.name().to_owned();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let thread_name = name.clone();
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            info!("worker {thread_name} started");
            worker.start();
            while !flag.load(Ordering::SeqCst) {
                if !worker.run() {
                    debug!("worker {thread_name} finished by itself");
                    break;
                }
            }
            worker.stop();
            info!("worker {thread_name} stopped");
        })
        .expect("failed to spawn worker thread");

    WorkerHandle { name, shutdown, handle: Some(handle) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        ticks: Arc<AtomicUsize>,
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl Worker for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn start(&mut self) {
            self.started.store(true, Ordering::SeqCst);
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn run(&mut self) -> bool {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            wait(1);
            true
        }
    }

    #[test]
    fn lifecycle_runs_start_loop_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = spawn(Box::new(Counter {
            ticks: ticks.clone(),
            started: started.clone(),
            stopped: stopped.clone(),
        }));

        while ticks.load(Ordering::SeqCst) < 3 {
            wait(1);
        }
        handle.join();

        assert!(started.load(Ordering::SeqCst));
        assert!(stopped.load(Ordering::SeqCst));
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    struct OneShot;

    impl Worker for OneShot {
        fn name(&self) -> &str {
            "oneshot"
        }

        fn run(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn worker_may_finish_itself() {
        let handle = spawn(Box::new(OneShot));
        while !handle.is_finished() {
            wait(1);
        }
    }
}

//! Serialized execution context
//!
//! [`EventRunner`] is a named single-thread job queue: the Rust stand-in for
//! the control ("wifi") thread that all session-state mutations and callback
//! dispatches are posted to. Anything that must not race with message
//! dispatch goes through [`EventRunner::post`]; the monitor and transport
//! never touch shared scorer/session state from their own threads.

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Shutdown,
}

/// Single-thread job queue with FIFO execution.
pub struct EventRunner {
    name: String,
    tx: Mutex<Sender<Command>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventRunner {
    pub fn new(name: &str) -> Arc<Self> {
        let (tx, rx) = channel::<Command>();
        let handle = thread::spawn(move || {
            while let Ok(command) = rx.recv() {
                match command {
                    Command::Run(job) => job(),
                    Command::Shutdown => break,
                }
            }
        });
        Arc::new(Self {
            name: name.to_string(),
            tx: Mutex::new(tx),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Jobs run in posting order, one at a time.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.lock().send(Command::Run(Box::new(job))).is_err() {
            warn!(runner = %self.name, "job posted after runner shutdown");
        }
    }

    /// Block until every job posted before this call has run. Used by tests
    /// to observe queue effects deterministically.
    pub fn flush(&self) {
        let (done_tx, done_rx) = channel::<()>();
        self.post(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv_timeout(Duration::from_secs(5));
    }
}

impl Drop for EventRunner {
    fn drop(&mut self) {
        let _ = self.tx.lock().send(Command::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_order() {
        let runner = EventRunner::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            runner.post(move || order.lock().push(i));
        }
        runner.flush();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_flush_waits_for_posted_jobs() {
        let runner = EventRunner::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            runner.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        runner.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}

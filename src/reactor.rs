//! The event loop driving asynchronous channel completions.
//!
//! Each reactor wraps a single-threaded runtime that exactly one worker
//! thread drives by calling [`Reactor::run`]. Queued operations execute
//! as tasks inside that call, so every completion callback fires on the
//! worker thread. The loop keeps running for as long as at least one
//! [`WorkAnchor`] is alive: established channels hold one for the
//! lifetime of their connection, every queued operation holds one for
//! its own duration, and the messaging adapter holds one for its whole
//! life. When the last anchor drops, `run` returns and the worker exits.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::trace;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;

pub(crate) struct Reactor {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    work: AtomicUsize,
    idle: Notify,
}

impl Reactor {
    /// Creates a reactor with an I/O-enabled single-threaded runtime.
    pub(crate) fn new() -> io::Result<Reactor> {
        let runtime = Builder::new_current_thread().enable_io().build()?;
        let handle = runtime.handle().clone();
        Ok(Reactor {
            runtime: Mutex::new(Some(runtime)),
            handle,
            work: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Returns the handle used to queue operations onto this reactor.
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queues a task for execution on the worker thread.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Drives the event loop until no work-anchors remain.
    ///
    /// Must be called by exactly one worker thread; a second call is a
    /// no-op. Dropping the runtime on the way out cancels any task that
    /// slipped in after the last anchor was released.
    pub(crate) fn run(&self) {
        let runtime = match self.runtime.lock().unwrap().take() {
            Some(runtime) => runtime,
            None => return,
        };
        runtime.block_on(async {
            while self.work.load(Ordering::Acquire) != 0 {
                self.idle.notified().await;
            }
        });
        trace!("reactor out of work, worker exiting");
    }

    /// Creates a token that keeps this reactor's loop alive.
    pub(crate) fn anchor(self: &Arc<Self>) -> WorkAnchor {
        self.work.fetch_add(1, Ordering::AcqRel);
        WorkAnchor {
            reactor: Arc::clone(self),
        }
    }
}

/// Keeps a reactor alive for as long as the token exists.
pub(crate) struct WorkAnchor {
    reactor: Arc<Reactor>,
}

impl Drop for WorkAnchor {
    fn drop(&mut self) {
        if self.reactor.work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.reactor.idle.notify_one();
        }
    }
}

/// Spawns the dedicated worker thread that drives `reactor`.
pub(crate) fn spawn_worker(reactor: Arc<Reactor>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("xchannel-reactor".into())
        .spawn(move || reactor.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_worker_exits_when_last_anchor_drops() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let anchor = reactor.anchor();
        let worker = spawn_worker(Arc::clone(&reactor)).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());

        drop(anchor);
        worker.join().unwrap();
    }

    #[test]
    fn test_spawned_task_runs_on_worker() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let anchor = reactor.anchor();
        let worker = spawn_worker(Arc::clone(&reactor)).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        reactor.spawn(async move {
            let _ = tx.send(thread::current().name().map(String::from));
        });

        let name = rx.blocking_recv().unwrap();
        assert_eq!(name.as_deref(), Some("xchannel-reactor"));

        drop(anchor);
        worker.join().unwrap();
    }
}

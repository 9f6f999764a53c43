//! Single-consumer task worker thread
//!
//! A `TaskWorker` owns one dedicated thread draining a FIFO queue of
//! typed requests. The worker can also be started with a periodic tick
//! so the handler runs on an interval even when the queue is empty.
//! Producers hold a clonable [`TaskHandle`] and enqueue with `push`, or
//! with `push_if` when a duplicate request must not pile up behind an
//! unconsumed one.
//!
//! Handler invocations are totally ordered; there are never two handler
//! runs in flight. A panic inside the handler is caught and logged, and
//! the worker moves on to the next request.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

struct State<R> {
    reqs: VecDeque<R>,
    stop: bool,
    consume_all: bool,
}

struct Shared<R> {
    state: Mutex<State<R>>,
    cond: Condvar,
}

/// Producer side of a [`TaskWorker`] queue.
pub struct TaskHandle<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> TaskHandle<R> {
    /// Enqueue a request and wake the worker.
    pub fn push(&self, req: R) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.reqs.push_back(req);
        }
        self.shared.cond.notify_one();
    }

    /// Enqueue unless a queued request already satisfies `is_dup`.
    ///
    /// Returns whether the request was accepted.
    pub fn push_if<P>(&self, req: R, is_dup: P) -> bool
    where
        P: Fn(&R) -> bool,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.reqs.iter().any(|r| is_dup(r)) {
                return false;
            }
            state.reqs.push_back(req);
        }
        self.shared.cond.notify_one();
        true
    }
}

/// Worker thread with a FIFO request queue.
pub struct TaskWorker<R> {
    shared: Arc<Shared<R>>,
    thread: Option<JoinHandle<()>>,
}

impl<R> Default for TaskWorker<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TaskWorker<R> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    reqs: VecDeque::new(),
                    stop: false,
                    consume_all: false,
                }),
                cond: Condvar::new(),
            }),
            thread: None,
        }
    }

    /// Get a producer handle for this worker's queue.
    pub fn handle(&self) -> TaskHandle<R> {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// When set, `stop()` drains the queue before the worker exits.
    pub fn set_consume_all(&self, consume_all: bool) {
        self.shared.state.lock().unwrap().consume_all = consume_all;
    }

    /// Signal the worker to stop, wake it, and join the thread.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.cond.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("task worker thread panicked");
            }
        }
    }
}

impl<R: Send + 'static> TaskWorker<R> {
    /// Start the worker; the handler runs once per queued request.
    ///
    /// Starting an already-running worker is a programming error.
    pub fn start<F>(&mut self, mut handler: F)
    where
        F: FnMut(R) + Send + 'static,
    {
        assert!(self.thread.is_none(), "task worker already started");
        self.reset_stop();

        let shared = Arc::clone(&self.shared);
        self.thread = Some(thread::spawn(move || {
            loop {
                let req = {
                    let mut state = shared.state.lock().unwrap();
                    while state.reqs.is_empty() && !state.stop {
                        state = shared.cond.wait(state).unwrap();
                    }

                    if state.stop && (state.reqs.is_empty() || !state.consume_all) {
                        break;
                    }

                    state.reqs.pop_front()
                };

                if let Some(req) = req {
                    run_handler(|| handler(req));
                }
            }

            shared.state.lock().unwrap().reqs.clear();
        }));
    }

    /// Start the worker with a periodic tick.
    ///
    /// The handler runs once immediately, then whenever a request arrives
    /// or `interval` elapses with an empty queue; in the latter case it
    /// receives `None`.
    pub fn start_periodic<F>(&mut self, interval: Duration, mut handler: F)
    where
        F: FnMut(Option<R>) + Send + 'static,
    {
        assert!(self.thread.is_none(), "task worker already started");
        self.reset_stop();

        let shared = Arc::clone(&self.shared);
        self.thread = Some(thread::spawn(move || {
            run_handler(|| handler(None));

            loop {
                let req = {
                    let state = shared.state.lock().unwrap();
                    let (mut state, _timeout) = shared
                        .cond
                        .wait_timeout_while(state, interval, |s| s.reqs.is_empty() && !s.stop)
                        .unwrap();

                    if state.stop && (state.reqs.is_empty() || !state.consume_all) {
                        break;
                    }

                    state.reqs.pop_front()
                };

                run_handler(|| handler(req));
            }

            shared.state.lock().unwrap().reqs.clear();
        }));
    }

    fn reset_stop(&self) {
        self.shared.state.lock().unwrap().stop = false;
    }
}

impl<R> Drop for TaskWorker<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_handler<F: FnOnce()>(f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("task handler panicked; worker continues");
    }
}

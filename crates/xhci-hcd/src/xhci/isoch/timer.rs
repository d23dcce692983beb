//! Single-shot deferred feed timer.
//!
//! One worker thread per timer sleeps until the armed deadline and then runs the callback with
//! the token it was armed with. Re-arming replaces the pending deadline; clearing drops it. The
//! callback runs without the timer's lock held, so it may re-arm the timer itself.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Default)]
struct TimerState {
    deadline: Option<(Instant, u64)>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FeedTimer {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl FeedTimer {
    pub fn spawn<F>(name: &str, callback: F) -> io::Result<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(&worker_shared, callback))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            shared,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Arms the timer to fire once after `delay`, replacing any pending deadline.
    pub fn set(&self, delay: Duration, token: u64) {
        let mut state = self.shared.lock();
        state.deadline = Some((Instant::now() + delay, token));
        self.shared.cv.notify_all();
    }

    /// Drops the pending deadline, if any.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        if state.deadline.take().is_some() {
            self.shared.cv.notify_all();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared.lock().deadline.is_some()
    }
}

fn run<F: Fn(u64)>(shared: &TimerShared, callback: F) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = shared.cv.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some((at, token)) => {
                let now = Instant::now();
                if now >= at {
                    state.deadline = None;
                    drop(state);
                    trace!(token, "feed timer fired");
                    callback(token);
                    state = shared.lock();
                } else {
                    state = shared
                        .cv
                        .wait_timeout(state, at - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
    }
}

impl Drop for FeedTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.deadline = None;
            self.shared.cv.notify_all();
        }
        // The last owner may be the callback itself; the worker then exits on its own.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

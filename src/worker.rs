// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Unifies the various kinds of "a thing is running in the background and
//! I need to know when it stops" into one interface.
//!
//! The original program tracked some workers by PID (`waitpid`/`WNOHANG`) and
//! others by `pthread_t` (`pthread_tryjoin_np`), with separate code paths for
//! each. Both reduce to the same three questions: is it still running, how
//! did it finish, and can I ask it to stop early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Outcome of a non-blocking liveness check.
#[derive(Debug)]
pub enum PollResult {
    Running,
    ExitedOk,
    ExitedErr(i32),
}

/// A cancellable, pollable background worker.
pub trait WorkerHandle: Send {
    /// Non-blocking: returns the worker's current state.
    fn poll(&mut self) -> PollResult;

    /// Requests that the worker stop soon. Idempotent.
    fn cancel(&mut self);
}

/// A worker backed by a plain OS thread sharing an `Arc<AtomicBool>` cancel flag.
///
/// The thread's closure is expected to check `cancel_flag` periodically and
/// return an exit status of 0 for success, nonzero for failure.
pub struct ThreadWorker {
    cancel_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<i32>>,
}

impl ThreadWorker {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> ThreadWorker
    where
        F: FnOnce(Arc<AtomicBool>) -> i32 + Send + 'static,
    {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let flag_for_thread = cancel_flag.clone();
        let join = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || f(flag_for_thread))
            .expect("thread spawn should not fail");
        ThreadWorker {
            cancel_flag,
            join: Some(join),
        }
    }
}

impl WorkerHandle for ThreadWorker {
    fn poll(&mut self) -> PollResult {
        let Some(join) = &self.join else {
            return PollResult::ExitedOk;
        };
        if !join.is_finished() {
            return PollResult::Running;
        }
        let join = self.join.take().unwrap();
        match join.join() {
            Ok(0) => PollResult::ExitedOk,
            Ok(code) => PollResult::ExitedErr(code),
            Err(_) => PollResult::ExitedErr(-1),
        }
    }

    fn cancel(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn thread_worker_reports_ok() {
        let mut w = ThreadWorker::spawn("t", |_flag| 0);
        loop {
            match w.poll() {
                PollResult::Running => std::thread::sleep(Duration::from_millis(5)),
                PollResult::ExitedOk => break,
                PollResult::ExitedErr(c) => panic!("unexpected error exit {c}"),
            }
        }
    }

    #[test]
    fn thread_worker_reports_err() {
        let mut w = ThreadWorker::spawn("t", |_flag| 7);
        loop {
            match w.poll() {
                PollResult::Running => std::thread::sleep(Duration::from_millis(5)),
                PollResult::ExitedOk => panic!("expected error exit"),
                PollResult::ExitedErr(c) => {
                    assert_eq!(c, 7);
                    break;
                }
            }
        }
    }

    #[test]
    fn cancel_is_observed_by_closure() {
        let mut w = ThreadWorker::spawn("t", |flag| {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            0
        });
        w.cancel();
        loop {
            match w.poll() {
                PollResult::Running => std::thread::sleep(Duration::from_millis(5)),
                PollResult::ExitedOk => break,
                PollResult::ExitedErr(c) => panic!("unexpected error exit {c}"),
            }
        }
    }
}

// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Graceful shutdown signaling shared between the supervisor and its workers.
//!
//! There's no async runtime in this process, so the classic `Slab<Waker>` +
//! `Future` machinery isn't needed: workers only ever poll, never await. A
//! shared flag plus a condvar (for the one thread that wants to block with a
//! timeout, the supervisor's own tick sleep) is enough.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// Dropping the last `Sender` (or calling [`Sender::shutdown`]) requests shutdown.
#[derive(Clone)]
pub struct Sender(Arc<Inner>);

impl Sender {
    pub fn shutdown(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        let _g = self.0.mutex.lock().unwrap();
        self.0.condvar.notify_all();
    }

    pub fn receiver(&self) -> Receiver {
        Receiver(self.0.clone())
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.flag.load(Ordering::SeqCst) {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        // Workers that only ever poll (never block) can hold just the flag.
        Arc::new(AtomicBool::new(self.0.flag.load(Ordering::SeqCst)))
    }

    /// Blocks up to `timeout`, returning early if shutdown is requested.
    ///
    /// Returns `Ok(())` if the full timeout elapsed without a shutdown signal,
    /// `Err(ShutdownError)` if shutdown was observed.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        if self.0.flag.load(Ordering::SeqCst) {
            return Err(ShutdownError);
        }
        let g = self.0.mutex.lock().unwrap();
        let (_g, result) = self
            .0
            .condvar
            .wait_timeout_while(g, timeout, |()| !self.0.flag.load(Ordering::SeqCst))
            .unwrap();
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        flag: AtomicBool::new(false),
        mutex: Mutex::new(()),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_check() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        tx.shutdown();
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking() {
        let (tx, rx) = channel();
        rx.wait_for(Duration::from_secs(0)).unwrap();
        let rx2 = rx.clone();
        let h = std::thread::spawn(move || rx2.wait_for(Duration::from_secs(1000)).unwrap_err());

        // Make it likely rx2 has done its initial check and is waiting on the condvar.
        std::thread::sleep(Duration::from_millis(10));

        tx.shutdown();
        h.join().unwrap();
    }
}

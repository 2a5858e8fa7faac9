// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Clock interface and implementations for testability.
//!
//! Wall-clock time is expressed as [`SystemTime`] (converted to a
//! `jiff::Timestamp` by callers that need calendar arithmetic, such as
//! segment boundary alignment). Monotonic time is expressed as a
//! plain [`Duration`]
//! elapsed since an arbitrary, clock-specific reference point; it is only ever
//! compared against another reading from the same clock.

use std::mem;
use std::sync::Mutex;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::warn;

use crate::error::Error;

/// Abstract interface to the system clocks. This exists so tests can advance
/// time deterministically instead of sleeping in real time.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> SystemTime;

    /// Gets an opaque, monotonically non-decreasing duration.
    ///
    /// On Linux this is backed by `CLOCK_BOOTTIME` (includes suspended time);
    /// elsewhere, `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Duration;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Retries `f` until it succeeds or `shutdown` is set, sleeping one second
/// between attempts and logging the failure.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown: &std::sync::atomic::AtomicBool,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Option<T>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        match f() {
            Ok(t) => return Some(t),
            Err(e) => {
                let e = e.into();
                if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    return None;
                }
                warn!(err = %e.chain(), "sleeping for 1s after error");
                clocks.sleep(Duration::from_secs(1));
            }
        }
        if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> Duration {
        unsafe {
            let mut ts = mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> SystemTime {
        SystemTime::now()
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Duration {
        self.get(libc::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Duration {
        self.get(libc::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: Duration) {
        thread::sleep(how_long);
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the guard lives "too long" before being dropped.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing: advances only when `sleep` is called.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: SystemTime,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: SystemTime) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> SystemTime {
        self.0.boot + *self.0.uptime.lock().unwrap()
    }

    fn monotonic(&self) -> Duration {
        *self.0.uptime.lock().unwrap()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }

    /// Advances the clock by the specified amount if data isn't immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(Duration::new(0, 0));
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let c = SimulatedClocks::new(SystemTime::UNIX_EPOCH);
        assert_eq!(c.monotonic(), Duration::ZERO);
        c.sleep(Duration::from_secs(5));
        assert_eq!(c.monotonic(), Duration::from_secs(5));
        assert_eq!(
            c.realtime().duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_secs(5)
        );
    }
}

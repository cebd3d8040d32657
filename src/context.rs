//! Cancellation and deadline handle carried by every operation.

use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// How often a caller blocked in [`Context::run`] re-checks for
/// cancellation while the worker is still busy.
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Stand-in for durations too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Default)]
struct Signal {
    canceled: Mutex<bool>,
    cond: Condvar,
}

/// Clones share one cancellation signal. Derived contexts
/// ([`Context::with_timeout`]) share the signal and may only tighten the
/// deadline.
#[derive(Clone, Default)]
pub struct Context {
    signal: Arc<Signal>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless canceled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        self.with_deadline(now.checked_add(timeout).unwrap_or(now + FAR_FUTURE))
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            signal: self.signal.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        let mut canceled = self.signal.canceled.lock();
        *canceled = true;
        self.signal.cond.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        *self.signal.canceled.lock()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_done(&self) -> bool {
        self.is_canceled() || self.is_expired()
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err(Canceled)` once the context is done.
    pub fn check(&self) -> Result<()> {
        if self.is_done() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let now = Instant::now();
        let mut wake_at = now.checked_add(duration).unwrap_or(now + FAR_FUTURE);
        let cut_short = matches!(self.deadline, Some(d) if d < wake_at);
        if let Some(d) = self.deadline {
            wake_at = wake_at.min(d);
        }
        let mut canceled = self.signal.canceled.lock();
        while !*canceled {
            if self.signal.cond.wait_until(&mut canceled, wake_at).timed_out() {
                break;
            }
        }
        !*canceled && !cut_short
    }

    /// Run a blocking call on a worker thread and wait for it, giving up
    /// with `Canceled` as soon as the context is done. An abandoned
    /// worker runs to completion in the background and its result is
    /// dropped.
    pub fn run<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.check()?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("sealwrap-{name}"))
            .spawn(move || {
                let _ = tx.send(f());
            })
            .map_err(|e| Error::Internal(format!("spawn {name} worker: {e}")))?;

        loop {
            let wait = self
                .remaining()
                .map_or(POLL_INTERVAL, |r| r.min(POLL_INTERVAL));
            match rx.recv_timeout(wait) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.is_done() {
                        log::debug!("{name}: abandoning in-flight call");
                        return Err(Error::Canceled);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Internal(format!("{name} worker exited without a result")));
                }
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.is_canceled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.remaining().is_none());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn cancel_is_shared_by_clones_and_children() {
        let ctx = Context::background();
        let child = ctx.with_timeout(Duration::from_secs(60));
        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_canceled());
        assert!(child.is_done());
        assert_eq!(child.check(), Err(Error::Canceled));
    }

    #[test]
    fn child_deadline_never_extends_parent() {
        let parent = Context::timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let ctx = Context::background();
        let canceler = ctx.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceler.cancel();
        });
        assert!(!ctx.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn oversized_durations_do_not_overflow() {
        let ctx = Context::timeout(Duration::MAX);
        assert!(!ctx.is_done());
        let canceler = ctx.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceler.cancel();
        });
        assert!(!ctx.sleep(Duration::MAX));
        handle.join().unwrap();
    }

    #[test]
    fn sleep_completes_without_cancel() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn sleep_is_cut_short_by_deadline() {
        let ctx = Context::timeout(Duration::from_millis(10));
        assert!(!ctx.sleep(Duration::from_secs(5)));
        assert!(ctx.is_expired());
    }

    #[test]
    fn run_returns_worker_result() {
        let ctx = Context::background();
        let value = ctx.run("test", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn run_abandons_slow_worker_on_deadline() {
        let ctx = Context::timeout(Duration::from_millis(20));
        let start = Instant::now();
        let result: Result<()> = ctx.run("slow", || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert_eq!(result, Err(Error::Canceled));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn run_refuses_to_start_when_done() {
        let ctx = Context::background();
        ctx.cancel();
        let result = ctx.run("never", || Ok(()));
        assert_eq!(result, Err(Error::Canceled));
    }
}

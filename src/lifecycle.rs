//! Service state machine and the background token renewal task.

use std::{
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    context::Context,
    error::{Error, Result},
};

/// Shortest wait between renewals, whatever the lease says.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);
/// Longest wait between renewals, whatever the lease says.
const MAX_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Wait before retrying after a failed renewal.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    Configuring,
    Ready,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Unconfigured => "unconfigured",
            State::Configuring => "configuring",
            State::Ready => "ready",
            State::Closed => "closed",
        })
    }
}

/// An auth token's remaining lifetime as reported by the issuer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub duration: Duration,
    pub renewable: bool,
}

/// Something whose credentials can be extended.
pub trait Renew: Send + Sync + 'static {
    fn renew(&self, ctx: &Context) -> Result<Lease>;
}

/// Renew after two thirds of the lease has elapsed.
fn renew_after(lease: Duration) -> Duration {
    lease
        .checked_mul(2)
        .map_or(MAX_RENEW_INTERVAL, |d| d / 3)
        .clamp(MIN_RENEW_INTERVAL, MAX_RENEW_INTERVAL)
}

/// Background thread that keeps a lease alive until stopped.
///
/// Stopping cancels the thread's context and joins it, so no renewal is
/// in flight once [`KeepAlive::stop`] returns.
pub struct KeepAlive {
    ctx: Context,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start(name: &str, renewer: Arc<dyn Renew>, initial: Lease) -> Result<Self> {
        let ctx = Context::background();
        let worker_ctx = ctx.clone();
        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("sealwrap-renew-{name}"))
            .spawn(move || renew_loop(&label, &worker_ctx, renewer.as_ref(), initial))
            .map_err(|e| Error::Internal(format!("spawn renewal thread: {e}")))?;
        log::info!("{name}: token renewal started, lease {}s", initial.duration.as_secs());
        Ok(Self {
            ctx,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.ctx.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("renewal thread panicked");
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

fn renew_loop(name: &str, ctx: &Context, renewer: &dyn Renew, initial: Lease) {
    let mut wait = renew_after(initial.duration);
    loop {
        if !ctx.sleep(wait) {
            break;
        }
        match renewer.renew(ctx) {
            Ok(lease) => {
                log::info!("{name}: token renewed, lease {}s", lease.duration.as_secs());
                if !lease.renewable {
                    log::info!("{name}: token no longer renewable");
                    break;
                }
                wait = renew_after(lease.duration);
            }
            Err(Error::Canceled) => break,
            Err(e) => {
                log::warn!("{name}: token renewal failed: {e}");
                wait = RETRY_INTERVAL;
            }
        }
    }
    log::info!("{name}: token renewal stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        calls: AtomicUsize,
        renewable_for: usize,
    }

    impl Renew for Counting {
        fn renew(&self, _ctx: &Context) -> Result<Lease> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Lease {
                duration: Duration::from_millis(600),
                renewable: n < self.renewable_for,
            })
        }
    }

    #[test]
    fn renew_interval_has_a_floor() {
        assert_eq!(renew_after(Duration::from_secs(30)), Duration::from_secs(20));
        assert_eq!(renew_after(Duration::ZERO), MIN_RENEW_INTERVAL);
    }

    #[test]
    fn huge_leases_are_capped() {
        assert_eq!(renew_after(Duration::from_secs(u64::MAX)), MAX_RENEW_INTERVAL);
        assert_eq!(renew_after(Duration::from_secs(10 * 24 * 60 * 60)), MAX_RENEW_INTERVAL);
    }

    #[test]
    fn renews_until_the_lease_stops_being_renewable() {
        let renewer = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            renewable_for: 2,
        });
        let lease = Lease {
            duration: Duration::from_millis(600),
            renewable: true,
        };
        let keep_alive = KeepAlive::start("test", renewer.clone(), lease).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while keep_alive.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!keep_alive.is_running());
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_joins_promptly() {
        let renewer = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            renewable_for: usize::MAX,
        });
        let lease = Lease {
            duration: Duration::from_secs(3600),
            renewable: true,
        };
        let mut keep_alive = KeepAlive::start("test", renewer.clone(), lease).unwrap();
        assert!(keep_alive.is_running());
        let start = std::time::Instant::now();
        keep_alive.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!keep_alive.is_running());
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
        keep_alive.stop();
    }

    #[test]
    fn state_names() {
        assert_eq!(State::Ready.to_string(), "ready");
        assert_eq!(State::Closed.to_string(), "closed");
    }
}

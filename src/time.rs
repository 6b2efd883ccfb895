//! Injectable clock (§8 "Boundary behaviors": "validated by property test
//! with clock injection").
//!
//! Every TTL/heartbeat/election timing decision in this crate goes through a
//! `Arc<dyn Clock>` rather than calling `Instant::now()` / `tokio::time::sleep`
//! directly, so tests can swap in [`MockClock`] and advance time
//! deterministically instead of racing real wall-clock sleeps.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Abstract "what time is it, and how do I wait" source.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Real-time clock backed by Tokio's timer wheel. Used in production; the
/// default for [`crate::runtime::config::ServiceConfig`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

#[cfg(any(test, feature = "testkit"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "testkit"))]
mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Notify;

    struct Inner {
        epoch: Instant,
        elapsed_ns: AtomicU64,
        notify: Notify,
    }

    impl Inner {
        fn elapsed(&self) -> Duration {
            Duration::from_nanos(self.elapsed_ns.load(Ordering::SeqCst))
        }
    }

    /// A virtual clock for deterministic tests. `now()` starts at
    /// `Instant::now()` at construction time and only advances when
    /// [`MockClock::advance`] is called; sleepers registered via
    /// [`Clock::sleep`] complete in timestamp order as the clock passes
    /// their deadline.
    pub struct MockClock {
        inner: Arc<Inner>,
    }

    impl MockClock {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Arc::new(Inner {
                    epoch: Instant::now(),
                    elapsed_ns: AtomicU64::new(0),
                    notify: Notify::new(),
                }),
            })
        }

        /// Advances virtual time by `duration`, waking any sleeper whose
        /// deadline has now passed.
        pub fn advance(&self, duration: Duration) {
            self.inner
                .elapsed_ns
                .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
            self.inner.notify.notify_waiters();
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            self.inner.epoch + self.inner.elapsed()
        }

        fn sleep(&self, duration: Duration) -> Sleep {
            let inner = self.inner.clone();
            let deadline_ns = inner.elapsed().as_nanos() as u64 + duration.as_nanos() as u64;
            Box::pin(async move {
                loop {
                    if inner.elapsed().as_nanos() as u64 >= deadline_ns {
                        return;
                    }
                    inner.notify.notified().await;
                }
            })
        }
    }
}

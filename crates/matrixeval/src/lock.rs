use std::sync::Mutex;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use tokio::sync::Notify;

/// Time source for the lock, injectable so tests can simulate expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of a foreground acquire attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    /// Another execution context holds the pipeline
    Blocked {
        background_active: bool,
        foreground_active: bool,
    },
}

/// Snapshot of the lock for status polling; never mutates state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub foreground_active: bool,
    pub background_active: bool,
}

#[derive(Debug, Default)]
struct LockState {
    /// Expiry of the current foreground hold; None means not held
    foreground_expires_at: Option<DateTime<Utc>>,
    /// True while the background drain loop is executing a pipeline
    background_active: bool,
}

/// Cooperative mutual-exclusion gate between the interactive (foreground)
/// caller and the queued (background) drain loop.
///
/// The encode/evaluate pipeline contends for one exclusive hardware resource;
/// this lock is the single gate enforcing one pipeline execution per process
/// regardless of which entry point runs it. A foreground hold expires after a
/// fixed timeout so a crashed holder cannot wedge the queue.
pub struct ExecutionLock {
    state: Mutex<LockState>,
    timeout: Duration,
    clock: Box<dyn Clock>,
    released: Notify,
}

impl ExecutionLock {
    pub fn new(timeout_secs: u64, clock: Box<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            timeout: Duration::seconds(timeout_secs as i64),
            clock,
            released: Notify::new(),
        }
    }

    /// True if a foreground holder currently holds an unexpired lock
    fn foreground_held(&self, state: &LockState) -> bool {
        match state.foreground_expires_at {
            Some(expires_at) => self.clock.now() < expires_at,
            None => false,
        }
    }

    /// Try to take the lock for a foreground execution.
    ///
    /// Blocked while the background drain loop is active or another
    /// unexpired foreground holder exists; an expired hold is treated as
    /// free and silently reclaimed.
    pub fn acquire(&self) -> AcquireOutcome {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.background_active {
            return AcquireOutcome::Blocked {
                background_active: true,
                foreground_active: false,
            };
        }
        if self.foreground_held(&state) {
            return AcquireOutcome::Blocked {
                background_active: false,
                foreground_active: true,
            };
        }
        if state.foreground_expires_at.is_some() {
            warn!("foreground lock hold expired without release, reclaiming");
        }
        state.foreground_expires_at = Some(self.clock.now() + self.timeout);
        info!("foreground lock acquired (expires in {}s)", self.timeout.num_seconds());
        AcquireOutcome::Granted
    }

    /// Clear the foreground hold unconditionally and wake the drain loop
    pub fn release(&self) {
        {
            let mut state = self.state.lock().expect("lock state poisoned");
            state.foreground_expires_at = None;
        }
        info!("foreground lock released");
        self.released.notify_waiters();
    }

    /// Current holder state for status polling
    pub fn check(&self) -> LockStatus {
        let state = self.state.lock().expect("lock state poisoned");
        LockStatus {
            foreground_active: self.foreground_held(&state),
            background_active: state.background_active,
        }
    }

    /// True when the drain loop may claim the pipeline
    pub fn foreground_idle(&self) -> bool {
        let state = self.state.lock().expect("lock state poisoned");
        !self.foreground_held(&state)
    }

    pub(crate) fn set_background_active(&self, active: bool) {
        let mut state = self.state.lock().expect("lock state poisoned");
        state.background_active = active;
    }

    /// Future resolving at the next `release()` call.
    ///
    /// Callers must `enable` the returned future before re-checking the
    /// holder state, so a release landing between the check and the await
    /// still wakes them.
    pub fn released_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.released.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Manually advanced clock for expiry tests
    struct TestClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn test_lock(timeout_secs: u64) -> (ExecutionLock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(Utc::now()));
        let lock = ExecutionLock::new(timeout_secs, Box::new(TestClock { now: now.clone() }));
        (lock, now)
    }

    #[test]
    fn acquire_is_never_double_granted() {
        let (lock, _) = test_lock(1800);
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);
        assert_eq!(
            lock.acquire(),
            AcquireOutcome::Blocked { background_active: false, foreground_active: true }
        );
    }

    #[test]
    fn acquire_blocked_while_background_active() {
        let (lock, _) = test_lock(1800);
        lock.set_background_active(true);
        assert_eq!(
            lock.acquire(),
            AcquireOutcome::Blocked { background_active: true, foreground_active: false }
        );
        lock.set_background_active(false);
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);
    }

    #[test]
    fn release_frees_the_lock_immediately() {
        let (lock, _) = test_lock(1800);
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);
        lock.release();
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);
    }

    #[test]
    fn unreleased_hold_expires_after_timeout() {
        let (lock, now) = test_lock(1800);
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);

        // One second before expiry the hold is still live
        *now.lock().unwrap() += Duration::seconds(1799);
        assert!(matches!(lock.acquire(), AcquireOutcome::Blocked { .. }));
        assert!(!lock.foreground_idle());

        // Past expiry the lock is reclaimable without release()
        *now.lock().unwrap() += Duration::seconds(2);
        assert!(lock.foreground_idle());
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);
    }

    #[tokio::test]
    async fn release_before_await_still_wakes_an_enabled_waiter() {
        let (lock, _) = test_lock(1800);
        assert_eq!(lock.acquire(), AcquireOutcome::Granted);

        let released = lock.released_notified();
        tokio::pin!(released);
        released.as_mut().enable();

        // The release lands before the waiter awaits; an enabled future
        // must not miss it
        lock.release();
        tokio::time::timeout(std::time::Duration::from_millis(100), released)
            .await
            .unwrap();
    }

    #[test]
    fn check_reports_without_mutating() {
        let (lock, _) = test_lock(1800);
        let status = lock.check();
        assert!(!status.foreground_active);
        assert!(!status.background_active);

        assert_eq!(lock.acquire(), AcquireOutcome::Granted);
        lock.set_background_active(true);
        let status = lock.check();
        assert!(status.foreground_active);
        assert!(status.background_active);
        // Polling must not consume the hold
        assert!(lock.check().foreground_active);
    }
}

//! The four direction-scoped wait groups that drive EOF propagation: an
//! atomic-counter-plus-`Notify` pair per direction per read/write role,
//! avoiding any global stage-count based logic.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// One direction's read or write participant count. Reaching zero is a
/// one-way transition for this run, since stages are one-shot.
#[derive(Default)]
pub struct WaitGroup {
    count: AtomicI64,
    zero: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            zero: Notify::new(),
        }
    }

    /// Adds `delta` (may be negative). Returns `true` the instant the
    /// counter transitions from >0 to 0 — the caller's cue to close the
    /// corresponding direction side exactly once.
    pub fn add(&self, delta: i64) -> bool {
        let prev = self.count.fetch_add(delta, Ordering::AcqRel);
        let now = prev + delta;
        if now == 0 {
            self.zero.notify_waiters();
        }
        prev != 0 && now == 0
    }

    pub fn done(&self) -> bool {
        self.add(-1)
    }

    pub fn get(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_zero(&self) -> bool {
        self.get() <= 0
    }

    /// Blocks until the counter is (or becomes) zero.
    pub async fn wait(&self) {
        loop {
            if self.is_zero() {
                return;
            }
            let notified = self.zero.notified();
            if self.is_zero() {
                return;
            }
            notified.await;
        }
    }
}

/// The four direction-scoped wait groups: L-read, L-write, R-read, R-write.
#[derive(Default)]
pub struct WaitGroups {
    pub l_read: WaitGroup,
    pub l_write: WaitGroup,
    pub r_read: WaitGroup,
    pub r_write: WaitGroup,
}

impl WaitGroups {
    pub fn new() -> Self {
        Self {
            l_read: WaitGroup::new(),
            l_write: WaitGroup::new(),
            r_read: WaitGroup::new(),
            r_write: WaitGroup::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_reports_zero_crossing_once() {
        let wg = WaitGroup::new();
        assert!(!wg.add(2));
        assert!(!wg.add(-1));
        assert!(wg.add(-1));
        assert!(!wg.add(0));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_zero() {
        let wg = WaitGroup::new();
        tokio::time::timeout(std::time::Duration::from_millis(50), wg.wait())
            .await
            .expect("wait() should not block when count is zero");
    }

    #[tokio::test]
    async fn wait_unblocks_on_done() {
        let wg = std::sync::Arc::new(WaitGroup::new());
        wg.add(1);
        let waiter = tokio::spawn({
            let wg = wg.clone();
            async move { wg.wait().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        wg.done();
        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("wait() should unblock after done()")
            .unwrap();
    }
}

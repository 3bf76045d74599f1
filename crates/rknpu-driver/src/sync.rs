//! Synchronisation primitives shared by the scheduler and the workers.
//!
//! - [`Countdown`]: fan-in counter with a single decrement-and-test step.
//! - [`WaitQueue`]: condition-variable wait with a predicate and a timeout.
//! - [`StopSignal`]: interruptible sleep for background workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Atomic fan-in counter.
///
/// Each participant calls [`decrement_and_test`](Self::decrement_and_test)
/// once; exactly one caller (the last) observes `true`. Further calls after
/// zero are no-ops and never wrap.
#[derive(Debug)]
pub struct Countdown(AtomicUsize);

impl Countdown {
    /// Counter expecting `participants` arrivals.
    pub const fn new(participants: usize) -> Self {
        Self(AtomicUsize::new(participants))
    }

    /// Record one arrival. Returns `true` for the arrival that reached zero.
    pub fn decrement_and_test(&self) -> bool {
        matches!(
            self.0
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)),
            Ok(1)
        )
    }

    /// Arrivals still outstanding.
    pub fn remaining(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// A queue of threads waiting for a condition.
///
/// Wakers publish their state change first, then call
/// [`wake_all`](Self::wake_all); the brief lock in `wake_all` orders the
/// notification after any waiter's predicate check.
#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    /// Empty wait queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `ready` returns `true` or `timeout` elapses.
    ///
    /// Returns whether `ready` held when the wait ended.
    pub fn wait_timeout(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let guard = lock(&self.lock);
        let (_guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |_| !ready())
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out() || ready()
    }

    /// Wake every waiter so it re-evaluates its predicate.
    pub fn wake_all(&self) {
        drop(lock(&self.lock));
        self.cond.notify_all();
    }
}

/// One-shot stop flag with an interruptible sleep.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    /// Signal not yet raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake any sleeper.
    pub fn stop(&self) {
        *lock(&self.stopped) = true;
        self.cond.notify_all();
    }

    /// Sleep for `period` or until stopped. Returns `true` when stopped.
    pub fn sleep(&self, period: Duration) -> bool {
        let guard = lock(&self.stopped);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, period, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn countdown_last_arrival_wins_once() {
        let c = Countdown::new(3);
        assert!(!c.decrement_and_test());
        assert!(!c.decrement_and_test());
        assert!(c.decrement_and_test());
        assert_eq!(c.remaining(), 0);
        // past zero: no wrap, no second winner
        assert!(!c.decrement_and_test());
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn countdown_concurrent_single_winner() {
        let c = Arc::new(Countdown::new(8));
        let winners: usize = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || usize::from(c.decrement_and_test()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn wait_queue_times_out() {
        let q = WaitQueue::new();
        let start = Instant::now();
        assert!(!q.wait_timeout(Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_queue_wakes_on_condition() {
        let q = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));
        let waker = {
            let (q, flag) = (Arc::clone(&q), Arc::clone(&flag));
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::Release);
                q.wake_all();
            })
        };
        assert!(q.wait_timeout(Duration::from_secs(5), || flag.load(Ordering::Acquire)));
        waker.join().unwrap();
    }

    #[test]
    fn stop_signal_interrupts_sleep() {
        let s = Arc::new(StopSignal::new());
        let stopper = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.stop())
        };
        assert!(s.sleep(Duration::from_secs(5)));
        stopper.join().unwrap();
        // stays raised
        assert!(s.sleep(Duration::ZERO));
    }
}

//! Waiting policies and the condvar-backed queue behind every blocking verb.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// How long a blocking verb may wait for its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail with [`Error::WouldBlock`] instead of sleeping.
    NonBlocking,
    /// Sleep until the condition holds or the wait is torn down.
    Forever,
    /// Sleep at most this long, then fail with [`Error::TimedOut`].
    Deadline(Duration),
}

/// A wakeup point for one condition over shared ring state.
///
/// The queue carries no data of its own: `block_on` re-polls the caller's
/// condition under the queue lock, so a wakeup between the fast-path poll and
/// the sleep cannot be lost.
pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake every waiter. Takes the queue lock briefly so a waiter cannot
    /// slip between its poll and its sleep while we notify.
    pub(crate) fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Run `poll` until it yields a value, honouring the waiting policy.
    ///
    /// `poll` returns `Ok(Some(v))` when the condition holds, `Ok(None)` to
    /// keep waiting, or `Err(_)` to abort the wait (state torn down, channel
    /// closed). Spurious wakeups are absorbed by re-polling.
    pub(crate) fn block_on<T>(
        &self,
        wait: Wait,
        mut poll: impl FnMut() -> Result<Option<T>>,
    ) -> Result<T> {
        if let Some(v) = poll()? {
            return Ok(v);
        }
        let deadline = match wait {
            Wait::NonBlocking => return Err(Error::WouldBlock),
            Wait::Forever => None,
            Wait::Deadline(d) => Some(Instant::now() + d),
        };

        let mut guard = self.lock.lock();
        loop {
            if let Some(v) = poll()? {
                return Ok(v);
            }
            match deadline {
                None => self.cond.wait(&mut guard),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        // One last look; a wakeup may have raced the clock.
                        return match poll()? {
                            Some(v) => Ok(v),
                            None => Err(Error::TimedOut),
                        };
                    }
                    let _ = self.cond.wait_for(&mut guard, dl - now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn non_blocking_returns_would_block() {
        let q = WaitQueue::new();
        let err = q
            .block_on::<()>(Wait::NonBlocking, || Ok(None))
            .unwrap_err();
        assert_eq!(err, Error::WouldBlock);
    }

    #[test]
    fn deadline_times_out() {
        let q = WaitQueue::new();
        let err = q
            .block_on::<()>(Wait::Deadline(Duration::from_millis(10)), || Ok(None))
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
    }

    #[test]
    fn wakeup_observes_new_state() {
        let q = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));
        let waker = {
            let q = Arc::clone(&q);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
                q.wake_all();
            })
        };
        let got = q.block_on(Wait::Forever, || {
            Ok(flag.load(Ordering::SeqCst).then_some(7u32))
        });
        waker.join().unwrap();
        assert_eq!(got, Ok(7));
    }

    #[test]
    fn poll_error_aborts_the_wait() {
        let q = WaitQueue::new();
        let err = q
            .block_on::<()>(Wait::Forever, || Err(Error::Interrupted))
            .unwrap_err();
        assert_eq!(err, Error::Interrupted);
    }
}

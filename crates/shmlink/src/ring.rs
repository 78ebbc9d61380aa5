//! Lock-and-waitqueue wrapper around the raw rings, used by the block
//! layer.
//!
//! A transfer ring and a free pool are the same structure driven from
//! opposite ends, so one engine serves both: each [`RingCtl`] pairs a raw
//! ring with a local mutex (callers on this endpoint) and a wait queue
//! (blocking verbs parked until the peer moves a counter).

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::layout::RawRing;
use crate::wait::{Wait, WaitQueue};

pub(crate) struct RingCtl<D: Copy> {
    q: Mutex<RawRing<D>>,
    pub(crate) wait: WaitQueue,
}

impl<D: Copy> RingCtl<D> {
    pub(crate) fn new(ring: RawRing<D>) -> Self {
        Self {
            q: Mutex::new(ring),
            wait: WaitQueue::new(),
        }
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&RawRing<D>) -> T) -> T {
        f(&self.q.lock())
    }

    pub(crate) fn fill(&self) -> u32 {
        self.q.lock().fill()
    }

    /// Blocking pop with the channel's abort conditions checked on every
    /// poll, including once more after each wakeup. A racing taker on this
    /// endpoint may still win between wakeup and lock, in which case the
    /// wait simply continues.
    pub(crate) fn pop_wait(
        &self,
        wait: Wait,
        abort: impl Fn() -> Option<Error>,
    ) -> Result<D> {
        self.wait.block_on(wait, || {
            if let Some(e) = abort() {
                return Err(e);
            }
            Ok(self.q.lock().try_pop())
        })
    }
}

/// One direction of a block channel: the free pool blocks are taken from
/// and the transfer ring they travel on.
pub(crate) struct PoolPair<D: Copy> {
    pub(crate) pool: RingCtl<D>,
    pub(crate) ring: RingCtl<D>,
}

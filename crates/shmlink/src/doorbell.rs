//! Out-of-band wakeup between endpoints.
//!
//! On hardware this is a mailbox register or an inter-processor interrupt;
//! here it is a trait so tests and embedders choose the delivery. The crate
//! ships a direct-dispatch implementation that runs the remote endpoint's
//! message pump on the caller's thread, which is how the in-process link
//! pairs two endpoints without a kernel in between.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::control::ControlIpc;

/// Rung by a sender after it publishes into the message ring.
pub trait Doorbell: Send + Sync {
    fn ring(&self);
}

/// Doorbell that drops the signal. Useful while wiring an endpoint up, or
/// when the embedder polls `dispatch` itself.
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&self) {
        trace!("doorbell rung with no receiver attached");
    }
}

/// Dispatches straight into the paired endpoint's receive pump.
///
/// Holds a weak reference so tearing one endpoint down never keeps the other
/// alive; a ring after teardown is a no-op.
pub struct DirectDoorbell {
    target: Mutex<Weak<ControlIpc>>,
}

impl DirectDoorbell {
    pub fn unconnected() -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(Weak::new()),
        })
    }

    pub fn connect(&self, target: &Arc<ControlIpc>) {
        *self.target.lock() = Arc::downgrade(target);
    }
}

impl Doorbell for DirectDoorbell {
    fn ring(&self) {
        let target = self.target.lock().upgrade();
        match target {
            Some(ipc) => ipc.dispatch(),
            None => trace!("doorbell rung after peer teardown"),
        }
    }
}

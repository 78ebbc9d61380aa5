//! Bring-up of a two-endpoint link over one shared buffer.
//!
//! The crate ships a single transport: both endpoints live in the same
//! process and signal each other through direct-dispatch doorbells. That is
//! enough for every test and for embedders that model a remote processor in
//! software; a real mailbox only needs a different
//! [`Doorbell`](crate::doorbell::Doorbell) and a real mapping behind the
//! views.
//!
//! Buffer layout:
//!
//! ```text
//! +---------------------+------------------------------------------+
//! |   message rings     |   channel pool (block/packet/stream      |
//! |   (2 hdrs + slots)  |   layouts carved out by the allocator)   |
//! +---------------------+------------------------------------------+
//! ```

use std::sync::Arc;

use crate::control::{ControlConfig, ControlIpc};
use crate::doorbell::DirectDoorbell;
use crate::error::{Error, Result};
use crate::region::{PoolAllocator, ShmView};

/// Which side of the link an endpoint plays.
///
/// The host creates channel layouts and answers handshakes; the peer
/// attaches to layouts from the base address delivered in the DONE reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Peer,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub name: String,
    /// Channel ids the link carries.
    pub channels: Vec<u8>,
    /// Slots per message ring; power of two.
    pub msg_ring_size: u32,
    /// Bytes of shared memory behind the message rings, managed by the
    /// host-side allocator.
    pub pool_size: u32,
    /// Base of the host's mapping of the window.
    pub host_base: u32,
    /// Base of the peer's mapping; on-wire addresses use this view.
    pub peer_base: u32,
    pub fatal_on_die: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "link".to_owned(),
            channels: Vec::new(),
            msg_ring_size: 64,
            pool_size: 256 * 1024,
            host_base: 0x8760_0000,
            peer_base: 0x0076_0000,
            fatal_on_die: false,
        }
    }
}

/// One side of a link: the message layer plus (on the host) the allocator
/// that channel layouts come from.
pub struct Endpoint {
    control: Arc<ControlIpc>,
    shm: ShmView,
    pool: Option<Arc<PoolAllocator>>,
    role: Role,
}

impl Endpoint {
    pub fn control(&self) -> &Arc<ControlIpc> {
        &self.control
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn shm(&self) -> &ShmView {
        &self.shm
    }

    /// Host-side allocator, for diagnostics (used bytes, live records).
    pub fn allocator(&self) -> Option<&Arc<PoolAllocator>> {
        self.pool.as_ref()
    }

    pub(crate) fn alloc(&self, size: u32) -> Result<u32> {
        self.pool
            .as_ref()
            .ok_or(Error::InvalidArgument("peer endpoints do not allocate"))?
            .alloc(size)
    }

    pub(crate) fn free(&self, addr: u32) {
        if let Some(pool) = &self.pool {
            pool.free(addr);
        }
    }

    /// Tear the endpoint down; every blocked verb on it returns
    /// [`Error::Interrupted`].
    pub fn shutdown(&self) {
        self.control.shutdown();
    }
}

/// Build both endpoints of an in-process link.
pub fn pair(cfg: &LinkConfig) -> Result<(Endpoint, Endpoint)> {
    let ctrl_cfg = ControlConfig {
        name: cfg.name.clone(),
        channels: cfg.channels.clone(),
        ring_size: cfg.msg_ring_size,
        cache_size: 256,
        fatal_on_die: cfg.fatal_on_die,
    };
    let msg_bytes = ControlIpc::required_size(&ctrl_cfg);
    let total = msg_bytes
        .checked_add(cfg.pool_size)
        .ok_or(Error::InvalidArgument("link size overflows"))?;

    let (host_view, peer_view) = ShmView::pair(total, cfg.host_base, cfg.peer_base);
    let host_ctrl = ControlIpc::attach(host_view.clone(), host_view.base(), Role::Host, &ctrl_cfg)?;
    let peer_ctrl = ControlIpc::attach(peer_view.clone(), peer_view.base(), Role::Peer, &ctrl_cfg)?;

    let to_peer = DirectDoorbell::unconnected();
    to_peer.connect(&peer_ctrl);
    host_ctrl.set_doorbell(to_peer);
    let to_host = DirectDoorbell::unconnected();
    to_host.connect(&host_ctrl);
    peer_ctrl.set_doorbell(to_host);

    let allocator = Arc::new(PoolAllocator::new(
        cfg.host_base + msg_bytes,
        cfg.pool_size,
    ));

    let host = Endpoint {
        control: host_ctrl,
        shm: host_view,
        pool: Some(allocator),
        role: Role::Host,
    };
    let peer = Endpoint {
        control: peer_ctrl,
        shm: peer_view,
        pool: None,
        role: Role::Peer,
    };
    Ok((host, peer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_wires_control_both_ways() {
        let (host, peer) = pair(&LinkConfig {
            channels: vec![3],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(host.role(), Role::Host);
        assert_eq!(peer.role(), Role::Peer);
        assert!(host.allocator().is_some());
        assert!(peer.allocator().is_none());
        assert_eq!(host.allocator().unwrap().used(), 0);
    }
}

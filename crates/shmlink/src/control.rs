//! The fixed-size message channel every other layer rides on.
//!
//! One endpoint pair shares two message rings (one per direction). Messages
//! are eight bytes: `{channel, kind, flag, value}`. Sending never blocks;
//! a full ring is an error surfaced to the caller. Receiving goes through a
//! per-channel cache filled by [`ControlIpc::dispatch`], the software half
//! of the doorbell interrupt.
//!
//! Channel lifecycle: UNUSED → WAITING (peer's OPEN seen before ours) →
//! OPENED → FREE (peer closed, drains in progress) → UNUSED.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::doorbell::Doorbell;
use crate::error::{Error, Result};
use crate::layout::{HeaderView, RawRing, SlotArray, RING_HEADER_BYTES};
use crate::link::Role;
use crate::region::ShmView;
use crate::wait::{Wait, WaitQueue};

/// Handshake magic carried by OPEN messages.
pub const OPEN_MAGIC: u16 = 0xbeee;
/// Handshake magic carried by CLOSE messages.
pub const CLOSE_MAGIC: u16 = 0xeddd;

/// Message flag values used by the channel layers.
pub mod flags {
    /// CMD: peer asks the creator to publish the channel layout.
    pub const CMD_INIT: u16 = 0x0001;
    /// DONE: reply to [`CMD_INIT`]; value is the layout base in the wire view.
    pub const DONE_INIT: u16 = 0x0002;
    /// EVENT: transfer ring went non-empty; value names the ring pair when a
    /// channel multiplexes several.
    pub const EVENT_SEND: u16 = 0x0001;
    /// EVENT: free pool went non-empty.
    pub const EVENT_RELEASE: u16 = 0x0002;
    /// EVENT: stream producer advanced its write counter.
    pub const EVENT_WROTE: u16 = 0x0003;
    /// EVENT: stream consumer advanced its read counter.
    pub const EVENT_READ: u16 = 0x0004;
}

/// Message kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Open = 1,
    Close = 2,
    Cmd = 3,
    Done = 4,
    Event = 5,
    Die = 6,
}

impl MsgKind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => MsgKind::Open,
            2 => MsgKind::Close,
            3 => MsgKind::Cmd,
            4 => MsgKind::Done,
            5 => MsgKind::Event,
            6 => MsgKind::Die,
            _ => return None,
        })
    }
}

/// One wire message, exactly as it sits in the shared ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub channel: u8,
    pub kind: u8,
    pub flag: u16,
    pub value: u32,
}

pub(crate) const MSG_BYTES: u32 = std::mem::size_of::<Message>() as u32;

impl Message {
    pub fn new(channel: u8, kind: MsgKind, flag: u16, value: u32) -> Self {
        Self {
            channel,
            kind: kind as u8,
            flag,
            value,
        }
    }

    pub fn open(channel: u8) -> Self {
        Self::new(channel, MsgKind::Open, OPEN_MAGIC, 0)
    }

    pub fn close(channel: u8) -> Self {
        Self::new(channel, MsgKind::Close, CLOSE_MAGIC, 0)
    }

    pub fn kind(&self) -> Option<MsgKind> {
        MsgKind::from_u8(self.kind)
    }
}

/// Channel states. u8 so they live in an atomic.
mod state {
    pub const UNUSED: u8 = 0;
    pub const WAITING: u8 = 1;
    pub const OPENED: u8 = 2;
    pub const FREE: u8 = 3;
}

struct ChannelCache {
    ring: Mutex<CacheRing>,
    rxwait: WaitQueue,
    /// Serializes receivers; a non-blocking recv that cannot take it
    /// reports WouldBlock instead of queueing behind another reader.
    rxlock: Mutex<()>,
}

struct CacheRing {
    buf: Box<[Message]>,
    rd: u32,
    wr: u32,
}

impl CacheRing {
    fn new(capacity: u32) -> Self {
        let nil = Message {
            channel: 0,
            kind: 0,
            flag: 0,
            value: 0,
        };
        Self {
            buf: vec![nil; capacity as usize].into_boxed_slice(),
            rd: 0,
            wr: 0,
        }
    }

    fn push(&mut self, msg: Message) -> bool {
        let cap = self.buf.len() as u32;
        if self.wr.wrapping_sub(self.rd) >= cap {
            return false;
        }
        self.buf[(self.wr & (cap - 1)) as usize] = msg;
        self.wr = self.wr.wrapping_add(1);
        true
    }

    fn pop(&mut self) -> Option<Message> {
        if self.wr == self.rd {
            return None;
        }
        let cap = self.buf.len() as u32;
        let msg = self.buf[(self.rd & (cap - 1)) as usize];
        self.rd = self.rd.wrapping_add(1);
        Some(msg)
    }
}

struct ChannelEntry {
    state: AtomicU8,
    /// Dispatches currently touching this channel; close() drains to zero
    /// before releasing the cache.
    busy: AtomicU32,
    cache: Mutex<Option<Arc<ChannelCache>>>,
}

struct BusyGuard<'a>(&'a AtomicU32);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Configuration of one endpoint's message layer.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Endpoint name used in logs ("ap", "cp-wcn", ...).
    pub name: String,
    /// Channel ids this link carries. Messages for anything else are dropped.
    pub channels: Vec<u8>,
    /// Slots per message ring; power of two.
    pub ring_size: u32,
    /// Slots per channel receive cache; power of two.
    pub cache_size: u32,
    /// Whether a DIE message takes the process down (debug builds of the
    /// original halt; production logs and carries on).
    pub fatal_on_die: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            name: "link".to_owned(),
            channels: Vec::new(),
            ring_size: 64,
            cache_size: 256,
            fatal_on_die: false,
        }
    }
}

/// One endpoint's message layer over a shared pair of rings.
pub struct ControlIpc {
    name: String,
    shm: ShmView,
    tx: Mutex<RawRing<Message>>,
    rx: Mutex<RawRing<Message>>,
    channels: HashMap<u8, ChannelEntry>,
    doorbell: Mutex<Option<Arc<dyn Doorbell>>>,
    shutdown: AtomicBool,
    fatal_on_die: bool,
    cache_size: u32,
}

impl ControlIpc {
    /// Bytes of shared memory the message layer needs at the region start.
    pub fn required_size(cfg: &ControlConfig) -> u32 {
        2 * RING_HEADER_BYTES + 2 * cfg.ring_size * MSG_BYTES
    }

    /// Attach to the message rings at `base` (local view).
    ///
    /// The host initializes both ring headers; the peer expects them ready
    /// and takes the mirrored tx/rx assignment.
    pub fn attach(shm: ShmView, base: u32, role: Role, cfg: &ControlConfig) -> Result<Arc<Self>> {
        if !cfg.ring_size.is_power_of_two() || !cfg.cache_size.is_power_of_two() {
            return Err(Error::InvalidArgument("ring sizes must be powers of two"));
        }
        if !shm.contains(base, Self::required_size(cfg)) {
            return Err(Error::InvalidArgument("message rings exceed the region"));
        }

        let hdr_a = base;
        let hdr_b = base + RING_HEADER_BYTES;
        let slots_a = base + 2 * RING_HEADER_BYTES;
        let slots_b = slots_a + cfg.ring_size * MSG_BYTES;

        // SAFETY: both header/slot ranges were bounds-checked against the
        // view above and the view outlives the rings inside self.
        let (ring_a, ring_b) = unsafe {
            let ha = HeaderView::at(&shm, hdr_a);
            let hb = HeaderView::at(&shm, hdr_b);
            if role == Role::Host {
                ha.init(shm.to_shared(slots_a), cfg.ring_size, MSG_BYTES);
                hb.init(shm.to_shared(slots_b), cfg.ring_size, MSG_BYTES);
            } else if ha.count() != cfg.ring_size || hb.count() != cfg.ring_size {
                return Err(Error::InvalidArgument("peer ring size mismatch"));
            }
            let sa = SlotArray::at(&shm, slots_a, cfg.ring_size);
            let sb = SlotArray::at(&shm, slots_b, cfg.ring_size);
            (RawRing::new(ha, sa), RawRing::new(hb, sb))
        };
        // Host transmits on ring A; the peer's view is mirrored.
        let (tx, rx) = match role {
            Role::Host => (ring_a, ring_b),
            Role::Peer => (ring_b, ring_a),
        };

        let channels = cfg
            .channels
            .iter()
            .map(|&ch| {
                (
                    ch,
                    ChannelEntry {
                        state: AtomicU8::new(state::UNUSED),
                        busy: AtomicU32::new(0),
                        cache: Mutex::new(None),
                    },
                )
            })
            .collect();

        Ok(Arc::new(Self {
            name: cfg.name.clone(),
            shm,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            channels,
            doorbell: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            fatal_on_die: cfg.fatal_on_die,
            cache_size: cfg.cache_size,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shm(&self) -> &ShmView {
        &self.shm
    }

    pub fn set_doorbell(&self, bell: Arc<dyn Doorbell>) {
        *self.doorbell.lock() = Some(bell);
    }

    fn entry(&self, channel: u8) -> Result<&ChannelEntry> {
        self.channels
            .get(&channel)
            .ok_or(Error::InvalidArgument("unknown channel id"))
    }

    /// Open a channel: install the receive cache, announce OPEN, and wait
    /// for the peer's OPEN unless it already arrived.
    pub fn open(&self, channel: u8, wait: Wait) -> Result<()> {
        let entry = self.entry(channel)?;
        {
            let mut slot = entry.cache.lock();
            if slot.is_some() {
                return Err(Error::InvalidArgument("channel already open"));
            }
            *slot = Some(Arc::new(ChannelCache {
                ring: Mutex::new(CacheRing::new(self.cache_size)),
                rxwait: WaitQueue::new(),
                rxlock: Mutex::new(()),
            }));
        }

        let res = self.open_inner(channel, entry, wait);
        if res.is_err() {
            entry.state.store(state::UNUSED, Ordering::Release);
            self.drain_busy(entry);
            *entry.cache.lock() = None;
        }
        res
    }

    fn open_inner(&self, channel: u8, entry: &ChannelEntry, wait: Wait) -> Result<()> {
        self.send(Message::open(channel))?;
        if entry.state.load(Ordering::Acquire) == state::WAITING {
            // The peer's OPEN arrived before ours went out.
            entry.state.store(state::OPENED, Ordering::Release);
            debug!(link = %self.name, channel, "channel opened (fast path)");
            return Ok(());
        }
        loop {
            let msg = self.recv(channel, wait)?;
            if msg.kind() == Some(MsgKind::Open) && msg.flag == OPEN_MAGIC {
                break;
            }
            debug!(link = %self.name, channel, ?msg, "discarding pre-open message");
        }
        entry.state.store(state::OPENED, Ordering::Release);
        debug!(link = %self.name, channel, "channel opened");
        Ok(())
    }

    /// Re-announce OPEN on an already-open channel (handshake after a peer
    /// reboot).
    pub fn open_ack(&self, channel: u8) -> Result<()> {
        self.send(Message::open(channel))
    }

    pub fn close_ack(&self, channel: u8) -> Result<()> {
        self.send(Message::close(channel))
    }

    /// Close a channel: announce CLOSE, kick every reader out, wait for
    /// in-flight dispatches to drain, then release the cache.
    pub fn close(&self, channel: u8) -> Result<()> {
        let entry = self.entry(channel)?;
        if entry.cache.lock().is_none() {
            return Ok(());
        }
        if let Err(e) = self.send(Message::close(channel)) {
            warn!(link = %self.name, channel, %e, "close announcement failed");
        }
        entry.state.store(state::FREE, Ordering::Release);
        if let Some(cache) = entry.cache.lock().clone() {
            cache.rxwait.wake_all();
        }
        self.drain_busy(entry);
        *entry.cache.lock() = None;
        entry.state.store(state::UNUSED, Ordering::Release);
        debug!(link = %self.name, channel, "channel closed");
        Ok(())
    }

    fn drain_busy(&self, entry: &ChannelEntry) {
        while entry.busy.load(Ordering::Acquire) != 0 {
            if let Some(cache) = entry.cache.lock().clone() {
                cache.rxwait.wake_all();
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queue one message for the peer. Never blocks: a full ring is
    /// [`Error::Exhausted`] and the caller decides what that means.
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Interrupted);
        }
        let entry = self.entry(msg.channel)?;
        if entry.cache.lock().is_none() {
            return Err(Error::NotFound);
        }
        let st = entry.state.load(Ordering::Acquire);
        let kind = msg.kind().ok_or(Error::InvalidArgument("bad message kind"))?;
        if st != state::OPENED && !matches!(kind, MsgKind::Open | MsgKind::Close) {
            return Err(Error::InvalidArgument("channel not opened for this kind"));
        }
        self.send_raw(msg)
    }

    /// Push without channel-state checks. The DIE path and tests use this.
    pub(crate) fn send_raw(&self, msg: Message) -> Result<()> {
        {
            let tx = self.tx.lock();
            if let Err(e) = tx.try_push(msg) {
                warn!(link = %self.name, ?msg, "message ring full, dropping send");
                return Err(e);
            }
            trace!(link = %self.name, ?msg, "sent");
        }
        if let Some(bell) = self.doorbell.lock().clone() {
            bell.ring();
        }
        Ok(())
    }

    /// Tell the peer this endpoint is going down hard.
    pub fn send_die(&self, channel: u8) -> Result<()> {
        self.send_raw(Message::new(channel, MsgKind::Die, 0, 0))
    }

    /// Take the next cached message for `channel`.
    pub fn recv(&self, channel: u8, wait: Wait) -> Result<Message> {
        let entry = self.entry(channel)?;
        let _busy = BusyGuard::enter(&entry.busy);
        let cache = entry.cache.lock().clone().ok_or(Error::NotFound)?;

        let _rx = match wait {
            Wait::NonBlocking => cache.rxlock.try_lock().ok_or(Error::WouldBlock)?,
            _ => cache.rxlock.lock(),
        };

        cache.rxwait.block_on(wait, || {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            if entry.state.load(Ordering::Acquire) == state::FREE {
                return Err(Error::Closed);
            }
            Ok(cache.ring.lock().pop())
        })
    }

    /// Drain the shared receive ring into per-channel caches. This is the
    /// doorbell service routine; it never blocks and never fails.
    pub fn dispatch(&self) {
        let rx = self.rx.lock();
        while let Some(msg) = rx.try_pop() {
            self.route(msg);
        }
    }

    fn route(&self, msg: Message) {
        trace!(link = %self.name, ?msg, "received");
        let Some(kind) = msg.kind() else {
            warn!(link = %self.name, ?msg, "dropping message with invalid kind");
            return;
        };
        if kind == MsgKind::Die {
            if self.fatal_on_die {
                panic!("peer of link {} reported fatal death", self.name);
            }
            error!(link = %self.name, "peer reported fatal death");
            return;
        }
        let Some(entry) = self.channels.get(&msg.channel) else {
            warn!(link = %self.name, channel = msg.channel, "dropping message for unknown channel");
            return;
        };
        let _busy = BusyGuard::enter(&entry.busy);
        let cache = entry.cache.lock().clone();
        match cache {
            None => {
                // Nobody opened this side yet. A peer OPEN parks the channel
                // in WAITING so a later local open() completes immediately.
                if kind == MsgKind::Open
                    && msg.flag == OPEN_MAGIC
                    && entry.state.load(Ordering::Acquire) == state::UNUSED
                {
                    entry.state.store(state::WAITING, Ordering::Release);
                    debug!(link = %self.name, channel = msg.channel, "peer open noted, channel waiting");
                } else {
                    warn!(link = %self.name, ?msg, "dropping message for unopened channel");
                }
            }
            Some(cache) => {
                if !cache.ring.lock().push(msg) {
                    warn!(link = %self.name, ?msg, "receive cache full, dropping message");
                }
                cache.rxwait.wake_all();
            }
        }
    }

    /// Tear the endpoint down: every blocked verb returns
    /// [`Error::Interrupted`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for entry in self.channels.values() {
            if let Some(cache) = entry.cache.lock().clone() {
                cache.rxwait.wake_all();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_state(&self, channel: u8) -> u8 {
        self.channels[&channel].state.load(Ordering::Acquire)
    }
}

/// Shared skeleton of the per-channel worker threads: open the channel, run
/// the caller's post-open step, then pump cached messages until the channel
/// is torn down. Transient receive errors are logged and retried.
pub(crate) fn run_channel_worker(
    control: &ControlIpc,
    channel: u8,
    closing: &AtomicBool,
    after_open: impl FnOnce(),
    mut on_msg: impl FnMut(Message),
) {
    if let Err(e) = control.open(channel, Wait::Forever) {
        warn!(link = %control.name, channel, %e, "channel worker failed to open");
        return;
    }
    after_open();
    while !closing.load(Ordering::Acquire) {
        match control.recv(channel, Wait::Forever) {
            Ok(msg) => on_msg(msg),
            Err(Error::Closed | Error::Interrupted | Error::NotFound) => break,
            Err(e) => {
                warn!(link = %control.name, channel, %e, "channel worker receive error");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::DirectDoorbell;
    use std::time::Duration;

    const CH: u8 = 5;

    fn pair() -> (Arc<ControlIpc>, Arc<ControlIpc>) {
        let cfg = ControlConfig {
            name: "test".to_owned(),
            channels: vec![CH],
            ring_size: 16,
            cache_size: 256,
            fatal_on_die: false,
        };
        let size = ControlIpc::required_size(&cfg);
        let (hv, pv) = ShmView::pair(size, 0x8000_0000, 0x0080_0000);
        let host_base = hv.base();
        let peer_base = pv.base();
        let host = ControlIpc::attach(hv, host_base, Role::Host, &cfg).unwrap();
        let peer = ControlIpc::attach(pv, peer_base, Role::Peer, &cfg).unwrap();

        let to_peer = DirectDoorbell::unconnected();
        to_peer.connect(&peer);
        host.set_doorbell(to_peer);
        let to_host = DirectDoorbell::unconnected();
        to_host.connect(&host);
        peer.set_doorbell(to_host);
        (host, peer)
    }

    fn open_both(host: &Arc<ControlIpc>, peer: &Arc<ControlIpc>) {
        let h = Arc::clone(host);
        let t = std::thread::spawn(move || h.open(CH, Wait::Deadline(Duration::from_secs(2))));
        peer.open(CH, Wait::Deadline(Duration::from_secs(2))).unwrap();
        t.join().unwrap().unwrap();
    }

    #[test]
    fn open_handshake_and_fast_path() {
        let (host, peer) = pair();
        // Peer opens first; its OPEN parks the host channel in WAITING.
        let p = Arc::clone(&peer);
        let t = std::thread::spawn(move || p.open(CH, Wait::Deadline(Duration::from_secs(2))));
        while host.channel_state(CH) != state::WAITING {
            std::thread::yield_now();
        }
        // Host open now completes without waiting for a message.
        host.open(CH, Wait::NonBlocking).unwrap();
        t.join().unwrap().unwrap();
        assert_eq!(host.channel_state(CH), state::OPENED);
        assert_eq!(peer.channel_state(CH), state::OPENED);
    }

    #[test]
    fn send_and_recv_roundtrip() {
        let (host, peer) = pair();
        open_both(&host, &peer);

        host.send(Message::new(CH, MsgKind::Event, flags::EVENT_SEND, 42))
            .unwrap();
        let msg = peer.recv(CH, Wait::Deadline(Duration::from_secs(1))).unwrap();
        assert_eq!(msg.kind(), Some(MsgKind::Event));
        assert_eq!(msg.flag, flags::EVENT_SEND);
        assert_eq!(msg.value, 42);
    }

    #[test]
    fn send_requires_known_open_channel() {
        let (host, _peer) = pair();
        let ev = Message::new(CH, MsgKind::Event, flags::EVENT_SEND, 0);
        // Known id, never opened locally.
        assert_eq!(host.send(ev), Err(Error::NotFound));
        // Unknown id.
        let bad = Message::new(99, MsgKind::Event, 0, 0);
        assert!(matches!(host.send(bad), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn non_event_kinds_blocked_before_open_completes() {
        let (host, peer) = pair();
        open_both(&host, &peer);
        // Force the state back to exercise the guard.
        host.channels[&CH].state.store(state::WAITING, Ordering::Release);
        let ev = Message::new(CH, MsgKind::Event, flags::EVENT_SEND, 0);
        assert!(matches!(host.send(ev), Err(Error::InvalidArgument(_))));
        assert!(host.send(Message::open(CH)).is_ok());
    }

    #[test]
    fn close_unblocks_reader_with_closed() {
        let (host, peer) = pair();
        open_both(&host, &peer);

        let p = Arc::clone(&peer);
        let reader = std::thread::spawn(move || p.recv(CH, Wait::Forever));
        std::thread::sleep(Duration::from_millis(20));
        peer.close(CH).unwrap();
        assert_eq!(reader.join().unwrap(), Err(Error::Closed));
        assert_eq!(peer.channel_state(CH), state::UNUSED);

        // The host sees the CLOSE announcement as a normal message.
        let msg = host.recv(CH, Wait::Deadline(Duration::from_secs(1))).unwrap();
        assert_eq!(msg.kind(), Some(MsgKind::Close));
        assert_eq!(msg.flag, CLOSE_MAGIC);
    }

    #[test]
    fn cache_overflow_drops_instead_of_blocking() {
        let (host, peer) = pair();
        open_both(&host, &peer);

        // 300 events into a 256-slot cache: dispatch must not stall.
        for i in 0..300u32 {
            host.send(Message::new(CH, MsgKind::Event, flags::EVENT_SEND, i))
                .unwrap();
        }
        let mut got = 0;
        while peer.recv(CH, Wait::NonBlocking).is_ok() {
            got += 1;
        }
        assert_eq!(got, 256);
    }

    #[test]
    fn full_message_ring_is_an_error_not_a_stall() {
        let cfg = ControlConfig {
            name: "t".to_owned(),
            channels: vec![CH],
            ring_size: 4,
            cache_size: 8,
            fatal_on_die: false,
        };
        let size = ControlIpc::required_size(&cfg);
        let (hv, _pv) = ShmView::pair(size, 0x1000, 0x2000);
        // No doorbell and no peer draining: the ring fills up.
        let host = ControlIpc::attach(hv, 0x1000, Role::Host, &cfg).unwrap();
        for _ in 0..4 {
            host.send_raw(Message::open(CH)).unwrap();
        }
        assert!(matches!(
            host.send_raw(Message::open(CH)),
            Err(Error::Exhausted(_))
        ));
    }

    #[test]
    fn die_is_logged_not_fatal_by_default() {
        let (host, peer) = pair();
        open_both(&host, &peer);
        host.send_die(CH).unwrap();
        // Nothing lands in the cache and nothing panics.
        assert_eq!(peer.recv(CH, Wait::NonBlocking), Err(Error::WouldBlock));
    }

    #[test]
    fn shutdown_interrupts_blocked_readers() {
        let (host, peer) = pair();
        open_both(&host, &peer);
        let p = Arc::clone(&peer);
        let reader = std::thread::spawn(move || p.recv(CH, Wait::Forever));
        std::thread::sleep(Duration::from_millis(20));
        peer.shutdown();
        assert_eq!(reader.join().unwrap(), Err(Error::Interrupted));
        let _ = host;
    }
}

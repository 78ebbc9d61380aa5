//! Packet variant of the block transport, tuned for small high-rate
//! traffic: packed one-word descriptors, a second pool/ring pair per
//! direction reserved for ack-sized packets, and a coalescing timer that
//! batches cross-core notifications.
//!
//! Channel layout (one allocation, host-created):
//!
//! ```text
//! +----------------+--------------------+------------------------------+
//! | 8 ring/pool    | descriptor arrays  | storage: tx, tx-ack,         |
//! | headers        | (one word / slot)  | rx, rx-ack blocks            |
//! +----------------+--------------------+------------------------------+
//! ```
//!
//! Descriptors carry a block index plus an 11-bit length and 5-bit offset,
//! so a block is at `class_base + index * size + offset`. Whether a block
//! is ack-class is decided by its address range, which lets recovery and
//! put() route a block without carrying extra state.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::block::{Block, ChannelEvent, EventHandler};
use crate::control::{flags, run_channel_worker, ControlIpc, Message, MsgKind};
use crate::error::{Error, Result};
use crate::layout::{
    HeaderView, PacketDesc, RawRing, SlotArray, PACKET_DESC_BYTES, PACKET_LEN_MAX,
    PACKET_OFFSET_MAX, RING_HEADER_BYTES,
};
use crate::link::{Endpoint, Role};
use crate::region::{PoolAllocator, ShmView};
use crate::wait::{Wait, WaitQueue};

/// Ring index carried in the EVENT value when a channel multiplexes
/// several ring pairs.
pub const RING_NORMAL: u32 = 0;
pub const RING_ACK: u32 = 1;

/// Cache maintenance hooks for windows mapped cacheable. The default
/// no-ops suit the uncached mapping.
pub trait CacheSync: Send + Sync {
    fn flush(&self, _addr: u32, _len: u32) {}
    fn invalidate(&self, _addr: u32, _len: u32) {}
}

struct NoCacheSync;

impl CacheSync for NoCacheSync {}

#[derive(Clone)]
pub struct PacketConfig {
    pub channel: u8,
    /// Normal-class blocks per direction.
    pub count: u32,
    pub size: u32,
    /// Ack-class blocks per direction.
    pub ack_count: u32,
    pub ack_size: u32,
    /// Bytes reserved at the front of every block handed out by get().
    pub headroom: u32,
    /// How long a lone queued packet may wait before the notification
    /// goes out.
    pub coalesce: Duration,
    /// Cache maintenance for cacheable mappings.
    pub cache: Option<Arc<dyn CacheSync>>,
}

impl PacketConfig {
    fn validate(&self) -> Result<()> {
        if self.count == 0 || self.ack_count == 0 {
            return Err(Error::InvalidArgument("zero block count"));
        }
        if self.count > u16::MAX as u32 || self.ack_count > u16::MAX as u32 {
            return Err(Error::InvalidArgument("block count exceeds descriptor index"));
        }
        if self.size == 0
            || self.ack_size == 0
            || self.size > PACKET_LEN_MAX
            || self.ack_size > PACKET_LEN_MAX
        {
            return Err(Error::InvalidArgument("block size exceeds descriptor length"));
        }
        if self.headroom > PACKET_OFFSET_MAX {
            return Err(Error::InvalidArgument("headroom exceeds descriptor offset"));
        }
        if self.headroom >= self.size || self.headroom >= self.ack_size {
            return Err(Error::InvalidArgument("headroom swallows the block"));
        }
        Ok(())
    }
}

mod status {
    pub const IDLE: u8 = 0;
    pub const READY: u8 = 1;
}

/// One class (normal or ack) of one direction.
struct PClass {
    pool: Mutex<RawRing<PacketDesc>>,
    ring: Mutex<RawRing<PacketDesc>>,
    blk_base: u32,
    blk_count: u32,
    blk_size: u32,
}

impl PClass {
    fn holds(&self, addr: u32) -> bool {
        (addr.wrapping_sub(self.blk_base) as u64) < self.blk_count as u64 * self.blk_size as u64
    }

    fn locate(&self, addr: u32) -> (u16, u32) {
        let off = addr.wrapping_sub(self.blk_base);
        ((off / self.blk_size) as u16, off % self.blk_size)
    }

    fn block_start(&self, idx: u16) -> u32 {
        self.blk_base + idx as u32 * self.blk_size
    }
}

/// One direction: both classes plus the wakeup points shared by them.
struct PDir {
    normal: PClass,
    ack: PClass,
    pool_wait: WaitQueue,
    ring_wait: WaitQueue,
    /// At most one block leased out of this direction at a time; recovery
    /// reclaims it.
    record: Mutex<Option<Block>>,
}

impl PDir {
    fn classify(&self, addr: u32) -> Result<(&PClass, bool)> {
        if self.normal.holds(addr) {
            Ok((&self.normal, false))
        } else if self.ack.holds(addr) {
            Ok((&self.ack, true))
        } else {
            Err(Error::InvalidArgument("address outside packet storage"))
        }
    }
}

struct Rings {
    base: u32,
    tx: PDir,
    rx: PDir,
}

#[derive(Debug)]
struct Geometry {
    hdrs: [u32; 8],
    slots: [u32; 8],
    tx_blocks: u32,
    tx_ack_blocks: u32,
    rx_blocks: u32,
    rx_ack_blocks: u32,
    total: u32,
}

// Header/slot order: tx ring, tx pool, tx-ack ring, tx-ack pool, then the
// same four for rx.
fn geometry(base: u32, cfg: &PacketConfig) -> Result<Geometry> {
    let counts = [
        cfg.count,
        cfg.count,
        cfg.ack_count,
        cfg.ack_count,
        cfg.count,
        cfg.count,
        cfg.ack_count,
        cfg.ack_count,
    ];
    // The base arrives over the wire on the attach side, so every offset
    // is checked rather than trusted to stay inside u32.
    let overflow = Error::InvalidArgument("channel layout overflows");
    let mut hdrs = [0u32; 8];
    for (i, h) in hdrs.iter_mut().enumerate() {
        *h = base
            .checked_add(i as u32 * RING_HEADER_BYTES)
            .ok_or(overflow)?;
    }
    let mut off = base.checked_add(8 * RING_HEADER_BYTES).ok_or(overflow)?;
    let mut slots = [0u32; 8];
    for (i, s) in slots.iter_mut().enumerate() {
        *s = off;
        let descs = counts[i].checked_mul(PACKET_DESC_BYTES).ok_or(overflow)?;
        off = off.checked_add(descs).ok_or(overflow)?;
    }
    let storage = |count: u32, size: u32| count.checked_mul(size).ok_or(overflow);
    let tx_blocks = off;
    let tx_ack_blocks = tx_blocks
        .checked_add(storage(cfg.count, cfg.size)?)
        .ok_or(overflow)?;
    let rx_blocks = tx_ack_blocks
        .checked_add(storage(cfg.ack_count, cfg.ack_size)?)
        .ok_or(overflow)?;
    let rx_ack_blocks = rx_blocks
        .checked_add(storage(cfg.count, cfg.size)?)
        .ok_or(overflow)?;
    let end = rx_ack_blocks
        .checked_add(storage(cfg.ack_count, cfg.ack_size)?)
        .ok_or(overflow)?;
    Ok(Geometry {
        hdrs,
        slots,
        tx_blocks,
        tx_ack_blocks,
        rx_blocks,
        rx_ack_blocks,
        total: end - base,
    })
}

fn build_rings(
    shm: &ShmView,
    cfg: &PacketConfig,
    base: u32,
    role: Role,
    init: bool,
) -> Result<Rings> {
    let g = geometry(base, cfg)?;
    if !shm.contains(base, g.total) {
        return Err(Error::InvalidArgument("channel layout exceeds the region"));
    }
    let counts = [
        cfg.count,
        cfg.count,
        cfg.ack_count,
        cfg.ack_count,
        cfg.count,
        cfg.count,
        cfg.ack_count,
        cfg.ack_count,
    ];
    let sizes = [
        cfg.size,
        cfg.size,
        cfg.ack_size,
        cfg.ack_size,
        cfg.size,
        cfg.size,
        cfg.ack_size,
        cfg.ack_size,
    ];

    // SAFETY: every range is inside the bounds-checked layout; the view
    // outlives the rings inside the channel.
    let mut rings: Vec<RawRing<PacketDesc>> = Vec::with_capacity(8);
    unsafe {
        for i in 0..8 {
            let hdr = HeaderView::at(shm, g.hdrs[i]);
            if init {
                hdr.init(shm.to_shared(g.slots[i]), counts[i], sizes[i]);
            } else if hdr.count() != counts[i] || hdr.size() != sizes[i] {
                return Err(Error::InvalidArgument("peer layout mismatch"));
            }
            rings.push(RawRing::new(hdr, SlotArray::at(shm, g.slots[i], counts[i])));
        }
    }
    // Unpack in reverse so we can pop by value.
    let rx_ack_pool = rings.pop().unwrap_or_else(|| unreachable!());
    let rx_ack_ring = rings.pop().unwrap_or_else(|| unreachable!());
    let rx_pool = rings.pop().unwrap_or_else(|| unreachable!());
    let rx_ring = rings.pop().unwrap_or_else(|| unreachable!());
    let tx_ack_pool = rings.pop().unwrap_or_else(|| unreachable!());
    let tx_ack_ring = rings.pop().unwrap_or_else(|| unreachable!());
    let tx_pool = rings.pop().unwrap_or_else(|| unreachable!());
    let tx_ring = rings.pop().unwrap_or_else(|| unreachable!());

    if init {
        for (pool, count) in [(&tx_pool, cfg.count), (&tx_ack_pool, cfg.ack_count)] {
            for i in 0..count {
                let pushed = pool.try_push(PacketDesc::idle(i as u16));
                debug_assert!(pushed.is_ok());
            }
        }
        for (pool, count) in [(&rx_pool, cfg.count), (&rx_ack_pool, cfg.ack_count)] {
            for i in 0..count {
                let pushed = pool.try_push(PacketDesc::idle(i as u16));
                debug_assert!(pushed.is_ok());
            }
        }
    }

    let class = |pool, ring, blk_base, blk_count, blk_size| PClass {
        pool: Mutex::new(pool),
        ring: Mutex::new(ring),
        blk_base,
        blk_count,
        blk_size,
    };
    let dir = |normal, ack| PDir {
        normal,
        ack,
        pool_wait: WaitQueue::new(),
        ring_wait: WaitQueue::new(),
        record: Mutex::new(None),
    };

    let host_tx = dir(
        class(tx_pool, tx_ring, g.tx_blocks, cfg.count, cfg.size),
        class(tx_ack_pool, tx_ack_ring, g.tx_ack_blocks, cfg.ack_count, cfg.ack_size),
    );
    let host_rx = dir(
        class(rx_pool, rx_ring, g.rx_blocks, cfg.count, cfg.size),
        class(rx_ack_pool, rx_ack_ring, g.rx_ack_blocks, cfg.ack_count, cfg.ack_size),
    );
    let (tx, rx) = match role {
        Role::Host => (host_tx, host_rx),
        Role::Peer => (host_rx, host_tx),
    };
    Ok(Rings { base, tx, rx })
}

/// Delays the SEND notification so several queued packets share one
/// doorbell. Armed on the empty→one append, cancelled when the ring fills
/// (the notification goes out immediately instead) or on flush.
struct CoalesceTimer {
    state: Mutex<TimerState>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct TimerState {
    deadline: Option<Instant>,
    quit: bool,
}

impl CoalesceTimer {
    fn start(fire: impl Fn() + Send + 'static) -> Arc<Self> {
        let timer = Arc::new(Self {
            state: Mutex::new(TimerState {
                deadline: None,
                quit: false,
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        });
        let t = Arc::clone(&timer);
        let handle = std::thread::Builder::new()
            .name("shmlink-coalesce".to_owned())
            .spawn(move || {
                let mut s = t.state.lock();
                loop {
                    if s.quit {
                        break;
                    }
                    match s.deadline {
                        None => t.cond.wait(&mut s),
                        Some(dl) => {
                            let now = Instant::now();
                            if now >= dl {
                                s.deadline = None;
                                drop(s);
                                fire();
                                s = t.state.lock();
                            } else {
                                let _ = t.cond.wait_for(&mut s, dl - now);
                            }
                        }
                    }
                }
            });
        match handle {
            Ok(h) => *timer.worker.lock() = Some(h),
            Err(_) => warn!("coalesce timer thread failed to start"),
        }
        timer
    }

    fn arm(&self, period: Duration) {
        let mut s = self.state.lock();
        if s.deadline.is_none() {
            s.deadline = Some(Instant::now() + period);
            self.cond.notify_all();
        }
    }

    fn cancel(&self) {
        self.state.lock().deadline = None;
    }

    fn stop(&self) {
        {
            let mut s = self.state.lock();
            s.quit = true;
            self.cond.notify_all();
        }
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
    }
}

struct Inner {
    channel: u8,
    role: Role,
    cfg: PacketConfig,
    cache: Arc<dyn CacheSync>,
    control: Arc<ControlIpc>,
    shm: ShmView,
    allocator: Option<Arc<PoolAllocator>>,
    status: AtomicU8,
    closing: AtomicBool,
    recovery_armed: AtomicBool,
    rings: OnceLock<Rings>,
    timer: OnceLock<Arc<CoalesceTimer>>,
    notifier: Mutex<Option<EventHandler>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one packet channel. Clones share the channel.
#[derive(Clone)]
pub struct PacketChannel {
    inner: Arc<Inner>,
}

impl PacketChannel {
    pub fn create(endpoint: &Endpoint, cfg: &PacketConfig) -> Result<PacketChannel> {
        if endpoint.role() != Role::Host {
            return Err(Error::InvalidArgument("only the host creates channels"));
        }
        cfg.validate()?;
        let probe = geometry(0, cfg)?;
        let base = endpoint.alloc(probe.total)?;
        let rings = match build_rings(endpoint.shm(), cfg, base, Role::Host, true) {
            Ok(r) => r,
            Err(e) => {
                endpoint.free(base);
                return Err(e);
            }
        };
        Self::start(endpoint, cfg.clone(), Role::Host, Some(rings))
    }

    pub fn attach(endpoint: &Endpoint, cfg: &PacketConfig) -> Result<PacketChannel> {
        if endpoint.role() != Role::Peer {
            return Err(Error::InvalidArgument("only the peer attaches"));
        }
        cfg.validate()?;
        Self::start(endpoint, cfg.clone(), Role::Peer, None)
    }

    fn start(
        endpoint: &Endpoint,
        cfg: PacketConfig,
        role: Role,
        rings: Option<Rings>,
    ) -> Result<PacketChannel> {
        let cache = cfg
            .cache
            .clone()
            .unwrap_or_else(|| Arc::new(NoCacheSync) as Arc<dyn CacheSync>);
        let inner = Arc::new(Inner {
            channel: cfg.channel,
            role,
            cfg,
            cache,
            control: Arc::clone(endpoint.control()),
            shm: endpoint.shm().clone(),
            allocator: endpoint.allocator().cloned(),
            status: AtomicU8::new(status::IDLE),
            closing: AtomicBool::new(false),
            recovery_armed: AtomicBool::new(false),
            rings: OnceLock::new(),
            timer: OnceLock::new(),
            notifier: Mutex::new(None),
            worker: Mutex::new(None),
        });
        if let Some(r) = rings {
            let _ = inner.rings.set(r);
        }

        let weak = Arc::downgrade(&inner);
        let timer = CoalesceTimer::start(move || fire_send_event(&weak));
        let _ = inner.timer.set(timer);

        let worker = {
            let for_loop = Arc::clone(&inner);
            let for_open = Arc::clone(&inner);
            let for_msgs = Arc::clone(&inner);
            std::thread::Builder::new()
                .name(format!("shmlink-packet-{}", inner.channel))
                .spawn(move || {
                    run_channel_worker(
                        &for_loop.control,
                        for_loop.channel,
                        &for_loop.closing,
                        move || {
                            if for_open.role == Role::Peer {
                                let msg = Message::new(
                                    for_open.channel,
                                    MsgKind::Cmd,
                                    flags::CMD_INIT,
                                    0,
                                );
                                if let Err(e) = for_open.control.send(msg) {
                                    warn!(channel = for_open.channel, %e, "init request failed");
                                }
                            }
                        },
                        move |msg| for_msgs.handle_msg(msg),
                    );
                })
                .map_err(|_| Error::Exhausted("worker thread"))?
        };
        *inner.worker.lock() = Some(worker);
        Ok(PacketChannel { inner })
    }

    fn rings(&self) -> Result<&Rings> {
        self.inner.rings.get().ok_or(Error::NotReady)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.inner.status.load(Ordering::Acquire) != status::READY {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    fn abort_reason(&self) -> Option<Error> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Some(Error::Interrupted);
        }
        if self.inner.status.load(Ordering::Acquire) != status::READY {
            return Some(Error::NotReady);
        }
        None
    }

    fn timer(&self) -> &Arc<CoalesceTimer> {
        self.inner
            .timer
            .get()
            .unwrap_or_else(|| unreachable!("timer set at construction"))
    }

    fn post_event(&self, flag: u16, value: u32) -> Result<()> {
        self.inner.control.send(Message::new(
            self.inner.channel,
            MsgKind::Event,
            flag,
            value,
        ))
    }

    /// Take a free block, ack pool first when `ack` is set (falling back
    /// to the normal pool), normal pool only otherwise. The returned
    /// address already skips the configured headroom.
    pub fn get(&self, wait: Wait, ack: bool) -> Result<Block> {
        self.ensure_ready()?;
        let r = self.rings()?;
        let dir = &r.tx;
        let (desc, class) = dir.pool_wait.block_on(wait, || {
            if let Some(e) = self.abort_reason() {
                return Err(e);
            }
            if ack {
                if let Some(d) = dir.ack.pool.lock().try_pop() {
                    return Ok(Some((d, &dir.ack)));
                }
            }
            Ok(dir.normal.pool.lock().try_pop().map(|d| (d, &dir.normal)))
        })?;
        let addr = class.block_start(desc.index) + self.inner.cfg.headroom;
        let blk = Block {
            addr,
            len: class.blk_size - self.inner.cfg.headroom,
        };
        *dir.record.lock() = Some(blk);
        Ok(blk)
    }

    /// Hand back an unsent block to its pool.
    pub fn put(&self, blk: &Block) -> Result<()> {
        let r = self.rings()?;
        let (class, _) = r.tx.classify(blk.addr)?;
        let (idx, _) = class.locate(blk.addr);
        class.pool.lock().try_unpop(PacketDesc::idle(idx))?;
        r.tx.record.lock().take();
        r.tx.pool_wait.wake_all();
        Ok(())
    }

    /// Queue a filled block. A lone packet arms the coalescing timer; a
    /// ring that just filled up forces the notification out immediately.
    pub fn send(&self, blk: &Block) -> Result<()> {
        self.ensure_ready()?;
        let r = self.rings()?;
        let (class, is_ack) = r.tx.classify(blk.addr)?;
        let (idx, offset) = class.locate(blk.addr);
        if offset + blk.len > class.blk_size {
            return Err(Error::InvalidArgument("length exceeds block"));
        }
        self.inner.cache.flush(blk.addr, blk.len);
        let desc = PacketDesc::new(idx, blk.len, offset)?;
        let fill = class.ring.lock().try_push(desc)?;
        r.tx.record.lock().take();

        let ring_index = if is_ack { RING_ACK } else { RING_NORMAL };
        if fill == class.blk_count {
            self.timer().cancel();
            self.post_event(flags::EVENT_SEND, ring_index)?;
        } else if fill == 1 {
            self.timer().arm(self.inner.cfg.coalesce);
        }
        Ok(())
    }

    /// Push any deferred notification out now.
    pub fn flush(&self) -> Result<()> {
        self.ensure_ready()?;
        let r = self.rings()?;
        self.timer().cancel();
        let normal_queued = r.tx.normal.ring.lock().fill() != 0;
        let ack_queued = r.tx.ack.ring.lock().fill() != 0;
        if normal_queued || ack_queued {
            // The event value names a ring that actually holds data.
            let ring_index = if normal_queued { RING_NORMAL } else { RING_ACK };
            self.post_event(flags::EVENT_SEND, ring_index)?;
        }
        Ok(())
    }

    /// Take the next arrived block, draining the ack ring first.
    pub fn receive(&self, wait: Wait) -> Result<Block> {
        self.ensure_ready()?;
        let r = self.rings()?;
        let dir = &r.rx;
        let (desc, class) = dir.ring_wait.block_on(wait, || {
            if let Some(e) = self.abort_reason() {
                return Err(e);
            }
            if let Some(d) = dir.ack.ring.lock().try_pop() {
                return Ok(Some((d, &dir.ack)));
            }
            Ok(dir.normal.ring.lock().try_pop().map(|d| (d, &dir.normal)))
        })?;
        let addr = class.block_start(desc.index) + desc.offset();
        let blk = Block {
            addr,
            len: desc.len(),
        };
        self.inner.cache.invalidate(blk.addr, blk.len);
        *dir.record.lock() = Some(blk);
        Ok(blk)
    }

    /// Return a consumed block to the peer-facing pool. The RELEASE event
    /// goes out on the empty→one pool transition only.
    pub fn release(&self, blk: &Block) -> Result<()> {
        let r = self.rings()?;
        let (class, is_ack) = r.rx.classify(blk.addr)?;
        let (idx, _) = class.locate(blk.addr);
        let fill = class.pool.lock().try_push(PacketDesc::idle(idx))?;
        r.rx.record.lock().take();
        if fill == 1 && self.inner.status.load(Ordering::Acquire) == status::READY {
            let ring_index = if is_ack { RING_ACK } else { RING_NORMAL };
            if let Err(e) = self.post_event(flags::EVENT_RELEASE, ring_index) {
                warn!(channel = self.inner.channel, %e, "release event failed");
            }
        }
        Ok(())
    }

    /// Packets queued by the peer, both classes.
    pub fn get_arrived_count(&self) -> Result<u32> {
        let r = self.rings()?;
        Ok(r.rx.normal.ring.lock().fill() + r.rx.ack.ring.lock().fill())
    }

    /// Free normal-class transmit blocks.
    pub fn get_free_count(&self) -> Result<u32> {
        Ok(self.rings()?.tx.normal.pool.lock().fill())
    }

    pub fn query(&self) -> Result<()> {
        self.ensure_ready()
    }

    pub fn register_notifier(&self, handler: EventHandler) -> Result<()> {
        let mut slot = self.inner.notifier.lock();
        if slot.is_some() {
            return Err(Error::InvalidArgument("notifier already registered"));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Drain every ring back into its pool and reclaim outstanding leases.
    /// All counters move forward only. See [`crate::block::BlockChannel::recover`]
    /// for when this runs.
    pub fn recover(&self) -> Result<()> {
        let r = self.rings()?;
        self.inner.status.store(status::IDLE, Ordering::Release);
        self.timer().cancel();

        for dir in [&r.tx, &r.rx] {
            for class in [&dir.normal, &dir.ack] {
                let ring = class.ring.lock();
                let pool = class.pool.lock();
                while let Some(d) = ring.try_pop() {
                    let pushed = pool.try_push(PacketDesc::idle(d.index));
                    debug_assert!(pushed.is_ok());
                }
            }
            if let Some(blk) = dir.record.lock().take() {
                if let Ok((class, _)) = dir.classify(blk.addr) {
                    let (idx, _) = class.locate(blk.addr);
                    let pushed = class.pool.lock().try_push(PacketDesc::idle(idx));
                    debug_assert!(pushed.is_ok());
                }
            }
            dir.pool_wait.wake_all();
            dir.ring_wait.wake_all();
        }
        debug!(channel = self.inner.channel, "packet channel recovered");
        Ok(())
    }

    /// Copy payload into a block leased by get().
    pub fn copy_to_block(&self, blk: &Block, data: &[u8]) -> Result<()> {
        let r = self.rings()?;
        let (class, _) = r.tx.classify(blk.addr)?;
        let (_, offset) = class.locate(blk.addr);
        if offset as u64 + data.len() as u64 > class.blk_size as u64 {
            return Err(Error::InvalidArgument("copy exceeds block"));
        }
        // SAFETY: the block is leased to this caller; range checked above.
        unsafe { self.inner.shm.copy_in(blk.addr, data) };
        Ok(())
    }

    /// Copy payload out of a block leased by receive().
    pub fn copy_from_block(&self, blk: &Block, buf: &mut [u8]) -> Result<usize> {
        let r = self.rings()?;
        let (class, _) = r.rx.classify(blk.addr)?;
        let (_, offset) = class.locate(blk.addr);
        let n = (buf.len() as u64)
            .min(blk.len as u64)
            .min(class.blk_size as u64 - offset as u64) as usize;
        // SAFETY: the block is leased to this caller; range checked above.
        unsafe { self.inner.shm.copy_out(blk.addr, &mut buf[..n]) };
        Ok(n)
    }

    /// Tear the channel down. Idempotent.
    pub fn destroy(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.status.store(status::IDLE, Ordering::Release);
        if let Some(timer) = self.inner.timer.get() {
            timer.stop();
        }
        if let Some(r) = self.inner.rings.get() {
            for dir in [&r.tx, &r.rx] {
                dir.pool_wait.wake_all();
                dir.ring_wait.wake_all();
            }
        }
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            while !handle.is_finished() {
                let _ = self.inner.control.close(self.inner.channel);
                std::thread::sleep(Duration::from_millis(2));
            }
            let _ = handle.join();
        }
        let _ = self.inner.control.close(self.inner.channel);
        if self.inner.role == Role::Host {
            if let (Some(alloc), Some(r)) = (&self.inner.allocator, self.inner.rings.get()) {
                alloc.free(r.base);
            }
        }
        debug!(channel = self.inner.channel, "packet channel destroyed");
    }
}

fn fire_send_event(inner: &Weak<Inner>) {
    let Some(inner) = inner.upgrade() else { return };
    if inner.status.load(Ordering::Acquire) != status::READY {
        return;
    }
    let msg = Message::new(inner.channel, MsgKind::Event, flags::EVENT_SEND, RING_NORMAL);
    if let Err(e) = inner.control.send(msg) {
        warn!(channel = inner.channel, %e, "coalesced send event failed");
    }
}

impl Inner {
    fn notify(&self, ev: ChannelEvent) {
        if let Some(handler) = self.notifier.lock().as_ref() {
            handler(ev);
        }
    }

    fn handle_msg(self: &Arc<Self>, msg: Message) {
        let ch = PacketChannel {
            inner: Arc::clone(self),
        };
        match msg.kind() {
            Some(MsgKind::Open) => {
                // Peer reboot on an armed channel. Only the armed side
                // acks, so the reply cannot echo back as another OPEN.
                if self.recovery_armed.load(Ordering::Acquire) {
                    self.notify(ChannelEvent::Closed);
                    if let Err(e) = ch.recover() {
                        warn!(channel = self.channel, %e, "recovery failed");
                    }
                    let _ = self.control.open_ack(self.channel);
                }
            }
            Some(MsgKind::Close) => {
                self.status.store(status::IDLE, Ordering::Release);
                if let Some(r) = self.rings.get() {
                    r.tx.pool_wait.wake_all();
                    r.rx.ring_wait.wake_all();
                }
                self.notify(ChannelEvent::Closed);
                let _ = self.control.close_ack(self.channel);
            }
            Some(MsgKind::Cmd) if msg.flag == flags::CMD_INIT => {
                if self.role != Role::Host {
                    return;
                }
                let Some(r) = self.rings.get() else { return };
                let reply = Message::new(
                    self.channel,
                    MsgKind::Done,
                    flags::DONE_INIT,
                    self.shm.to_shared(r.base),
                );
                if let Err(e) = self.control.send(reply) {
                    warn!(channel = self.channel, %e, "init reply failed");
                    return;
                }
                self.status.store(status::READY, Ordering::Release);
                self.recovery_armed.store(true, Ordering::Release);
                self.notify(ChannelEvent::Opened);
            }
            Some(MsgKind::Done) if msg.flag == flags::DONE_INIT => {
                if self.role != Role::Peer {
                    return;
                }
                let base = self.shm.from_shared(msg.value);
                if self.rings.get().is_none() {
                    match build_rings(&self.shm, &self.cfg, base, Role::Peer, false) {
                        Ok(r) => {
                            let _ = self.rings.set(r);
                        }
                        Err(e) => {
                            warn!(channel = self.channel, %e, "attach failed");
                            return;
                        }
                    }
                }
                self.status.store(status::READY, Ordering::Release);
                self.notify(ChannelEvent::Opened);
            }
            Some(MsgKind::Event) => match msg.flag {
                flags::EVENT_SEND => {
                    if let Some(r) = self.rings.get() {
                        r.rx.ring_wait.wake_all();
                    }
                    self.notify(ChannelEvent::DataArrived);
                }
                flags::EVENT_RELEASE => {
                    if let Some(r) = self.rings.get() {
                        r.tx.pool_wait.wake_all();
                    }
                    self.notify(ChannelEvent::BlockFreed);
                }
                other => warn!(channel = self.channel, flag = other, "unknown event flag"),
            },
            _ => warn!(channel = self.channel, ?msg, "unexpected channel message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{self, LinkConfig};
    use std::sync::atomic::AtomicU32;

    const CH: u8 = 9;

    fn cfg() -> PacketConfig {
        PacketConfig {
            channel: CH,
            count: 4,
            size: 1024,
            ack_count: 2,
            ack_size: 64,
            headroom: 16,
            coalesce: Duration::from_millis(80),
            cache: None,
        }
    }

    fn ready_pair(cfg: &PacketConfig) -> (link::Endpoint, link::Endpoint, PacketChannel, PacketChannel) {
        let (he, pe) = link::pair(&LinkConfig {
            channels: vec![CH],
            ..Default::default()
        })
        .unwrap();
        let host = PacketChannel::create(&he, cfg).unwrap();
        let peer = PacketChannel::attach(&pe, cfg).unwrap();
        for _ in 0..1000 {
            if host.query().is_ok() && peer.query().is_ok() {
                return (he, pe, host, peer);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("packet channel never became ready");
    }

    #[test]
    fn config_limits_are_enforced() {
        let mut bad = cfg();
        bad.size = PACKET_LEN_MAX + 1;
        assert!(bad.validate().is_err());
        let mut bad = cfg();
        bad.headroom = PACKET_OFFSET_MAX + 1;
        assert!(bad.validate().is_err());
        let mut bad = cfg();
        bad.ack_count = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn roundtrip_keeps_payload_headroom_and_length() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());

        let blk = host.get(Wait::NonBlocking, false).unwrap();
        assert_eq!(blk.len, 1024 - 16);
        host.copy_to_block(&blk, b"packet payload").unwrap();
        host.send(&Block { len: 14, ..blk }).unwrap();
        host.flush().unwrap();

        let got = peer.receive(Wait::Deadline(Duration::from_secs(2))).unwrap();
        assert_eq!(got.len, 14);
        let mut buf = [0u8; 32];
        let n = peer.copy_from_block(&got, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"packet payload");
        peer.release(&got).unwrap();
        assert_eq!(host.get_free_count().unwrap(), 4);
        peer.destroy();
        host.destroy();
    }

    #[test]
    fn ack_ring_drains_before_normal() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());

        let normal = host.get(Wait::NonBlocking, false).unwrap();
        host.send(&Block { len: 100, ..normal }).unwrap();
        let ack = host.get(Wait::NonBlocking, true).unwrap();
        host.send(&Block { len: 8, ..ack }).unwrap();
        host.flush().unwrap();

        // The ack-sized packet jumps the queue.
        let first = peer.receive(Wait::Deadline(Duration::from_secs(2))).unwrap();
        assert_eq!(first.len, 8);
        let second = peer.receive(Wait::Deadline(Duration::from_secs(2))).unwrap();
        assert_eq!(second.len, 100);
        peer.destroy();
        host.destroy();
    }

    #[test]
    fn ack_get_falls_back_to_the_normal_pool() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());
        let a1 = host.get(Wait::NonBlocking, true).unwrap();
        let a2 = host.get(Wait::NonBlocking, true).unwrap();
        assert_eq!(a1.len, 64 - 16);
        assert_eq!(a2.len, 64 - 16);
        // Ack pool (2 blocks) exhausted: the next ack get is normal-sized.
        let a3 = host.get(Wait::NonBlocking, true).unwrap();
        assert_eq!(a3.len, 1024 - 16);
        peer.destroy();
        host.destroy();
    }

    #[test]
    fn notifications_coalesce_until_the_timer_fires() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());
        let arrived = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&arrived);
        peer.register_notifier(Box::new(move |ev| {
            if ev == ChannelEvent::DataArrived {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

        for _ in 0..3 {
            let blk = host.get(Wait::NonBlocking, false).unwrap();
            host.send(&Block { len: 32, ..blk }).unwrap();
        }
        // Before the period elapses nothing has gone out.
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(arrived.load(Ordering::SeqCst), 0);
        // One batched notification afterwards.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(arrived.load(Ordering::SeqCst), 1);
        assert_eq!(peer.get_arrived_count().unwrap(), 3);
        peer.destroy();
        host.destroy();
    }

    #[test]
    fn full_ring_forces_the_notification_immediately() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());
        let arrived = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&arrived);
        peer.register_notifier(Box::new(move |ev| {
            if ev == ChannelEvent::DataArrived {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

        for _ in 0..4 {
            let blk = host.get(Wait::NonBlocking, false).unwrap();
            host.send(&Block { len: 32, ..blk }).unwrap();
        }
        // Fourth send filled the ring: the event must not wait the period.
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(arrived.load(Ordering::SeqCst), 1);
        // Timer was cancelled: no second event later.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(arrived.load(Ordering::SeqCst), 1);
        peer.destroy();
        host.destroy();
    }

    #[test]
    fn flush_posts_now_and_cancels_the_timer() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());
        let arrived = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&arrived);
        peer.register_notifier(Box::new(move |ev| {
            if ev == ChannelEvent::DataArrived {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

        let blk = host.get(Wait::NonBlocking, false).unwrap();
        host.send(&Block { len: 32, ..blk }).unwrap();
        host.flush().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(arrived.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(arrived.load(Ordering::SeqCst), 1);
        peer.destroy();
        host.destroy();
    }

    #[test]
    fn layout_near_the_address_ceiling_is_rejected() {
        // The attach side computes the layout from a wire-delivered base,
        // so a base near the top of the address space must error out
        // instead of wrapping.
        let err = geometry(u32::MAX - 64, &cfg()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn flush_names_the_ack_ring_when_only_acks_are_queued() {
        let (he, pe) = link::pair(&LinkConfig {
            channels: vec![CH],
            ..Default::default()
        })
        .unwrap();
        let host = PacketChannel::create(&he, &cfg()).unwrap();
        // Drive the peer by hand so the raw events stay observable.
        pe.control()
            .open(CH, Wait::Deadline(Duration::from_secs(2)))
            .unwrap();
        pe.control()
            .send(Message::new(CH, MsgKind::Cmd, flags::CMD_INIT, 0))
            .unwrap();
        let done = pe
            .control()
            .recv(CH, Wait::Deadline(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(done.kind(), Some(MsgKind::Done));
        for _ in 0..1000 {
            if host.query().is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(host.query().is_ok());

        let ack = host.get(Wait::NonBlocking, true).unwrap();
        host.send(&Block { len: 8, ..ack }).unwrap();
        host.flush().unwrap();
        let ev = pe
            .control()
            .recv(CH, Wait::Deadline(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(ev.kind(), Some(MsgKind::Event));
        assert_eq!(ev.flag, flags::EVENT_SEND);
        assert_eq!(ev.value, RING_ACK);

        // Once a normal packet is queued too, the event names the
        // normal ring again.
        let blk = host.get(Wait::NonBlocking, false).unwrap();
        host.send(&Block { len: 8, ..blk }).unwrap();
        host.flush().unwrap();
        let ev = pe
            .control()
            .recv(CH, Wait::Deadline(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(ev.value, RING_NORMAL);
        host.destroy();
    }

    #[test]
    fn recovery_drains_rings_and_reclaims_the_lease() {
        let (_he, _pe, host, peer) = ready_pair(&cfg());

        // Two packets stuck in the ring, one block leased out.
        for _ in 0..2 {
            let blk = host.get(Wait::NonBlocking, false).unwrap();
            host.send(&Block { len: 32, ..blk }).unwrap();
        }
        let _leased = host.get(Wait::NonBlocking, false).unwrap();
        assert_eq!(host.get_free_count().unwrap(), 1);

        host.recover().unwrap();
        assert_eq!(host.query(), Err(Error::NotReady));
        // Ring entries and the recorded lease are all back in the pool.
        assert_eq!(host.get_free_count().unwrap(), 4);

        host.recover().unwrap();
        assert_eq!(host.get_free_count().unwrap(), 4);
        peer.destroy();
        host.destroy();
    }
}

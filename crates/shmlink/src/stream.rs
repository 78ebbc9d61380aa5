//! Byte-stream channel: one circular byte buffer per direction, the same
//! header/counter discipline as the block rings with single bytes as the
//! unit. Writes and reads move as many bytes as fit and report the count;
//! callers loop if they need more.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::control::{flags, run_channel_worker, ControlIpc, Message, MsgKind};
use crate::error::{Error, Result};
use crate::layout::{ring_pos, HeaderView, RING_HEADER_BYTES};
use crate::link::{Endpoint, Role};
use crate::region::{PoolAllocator, ShmView};
use crate::wait::{Wait, WaitQueue};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub channel: u8,
    /// Host→peer buffer capacity in bytes.
    pub tx_len: u32,
    /// Peer→host buffer capacity in bytes.
    pub rx_len: u32,
}

impl StreamConfig {
    fn validate(&self) -> Result<()> {
        if self.tx_len == 0 || self.rx_len == 0 {
            return Err(Error::InvalidArgument("zero stream capacity"));
        }
        Ok(())
    }
}

mod status {
    pub const IDLE: u8 = 0;
    pub const READY: u8 = 1;
}

struct SDir {
    hdr: HeaderView,
    buf_base: u32,
    cap: u32,
    wait: WaitQueue,
    /// Serializes local writers (or readers) of this direction.
    lock: Mutex<()>,
}

struct Rings {
    base: u32,
    tx: SDir,
    rx: SDir,
}

fn build_rings(
    shm: &ShmView,
    cfg: &StreamConfig,
    base: u32,
    role: Role,
    init: bool,
) -> Result<Rings> {
    let tx_hdr = base;
    let rx_hdr = base + RING_HEADER_BYTES;
    let tx_buf = base + 2 * RING_HEADER_BYTES;
    let rx_buf = tx_buf
        .checked_add(cfg.tx_len)
        .ok_or(Error::InvalidArgument("layout overflows"))?;
    let end = rx_buf
        .checked_add(cfg.rx_len)
        .ok_or(Error::InvalidArgument("layout overflows"))?;
    if !shm.contains(base, end - base) {
        return Err(Error::InvalidArgument("channel layout exceeds the region"));
    }

    // SAFETY: both headers are inside the bounds-checked layout and the
    // view outlives the channel.
    let (h_tx, h_rx) = unsafe {
        let h_tx = HeaderView::at(shm, tx_hdr);
        let h_rx = HeaderView::at(shm, rx_hdr);
        if init {
            h_tx.init(shm.to_shared(tx_buf), cfg.tx_len, 1);
            h_rx.init(shm.to_shared(rx_buf), cfg.rx_len, 1);
        } else if h_tx.count() != cfg.tx_len || h_rx.count() != cfg.rx_len {
            return Err(Error::InvalidArgument("peer layout mismatch"));
        }
        (h_tx, h_rx)
    };

    let dir = |hdr, buf_base, cap| SDir {
        hdr,
        buf_base,
        cap,
        wait: WaitQueue::new(),
        lock: Mutex::new(()),
    };
    let host_tx = dir(h_tx, tx_buf, cfg.tx_len);
    let host_rx = dir(h_rx, rx_buf, cfg.rx_len);
    let (tx, rx) = match role {
        Role::Host => (host_tx, host_rx),
        Role::Peer => (host_rx, host_tx),
    };
    Ok(Rings { base, tx, rx })
}

fn layout_bytes(cfg: &StreamConfig) -> Result<u32> {
    (2 * RING_HEADER_BYTES)
        .checked_add(cfg.tx_len)
        .and_then(|v| v.checked_add(cfg.rx_len))
        .ok_or(Error::InvalidArgument("layout overflows"))
}

struct Inner {
    channel: u8,
    role: Role,
    cfg: StreamConfig,
    control: Arc<ControlIpc>,
    shm: ShmView,
    allocator: Option<Arc<PoolAllocator>>,
    status: AtomicU8,
    closing: AtomicBool,
    rings: OnceLock<Rings>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one byte-stream channel. Clones share the channel.
#[derive(Clone)]
pub struct StreamChannel {
    inner: Arc<Inner>,
}

impl StreamChannel {
    pub fn create(endpoint: &Endpoint, cfg: &StreamConfig) -> Result<StreamChannel> {
        if endpoint.role() != Role::Host {
            return Err(Error::InvalidArgument("only the host creates channels"));
        }
        cfg.validate()?;
        let base = endpoint.alloc(layout_bytes(cfg)?)?;
        let rings = match build_rings(endpoint.shm(), cfg, base, Role::Host, true) {
            Ok(r) => r,
            Err(e) => {
                endpoint.free(base);
                return Err(e);
            }
        };
        Self::start(endpoint, cfg.clone(), Role::Host, Some(rings))
    }

    pub fn attach(endpoint: &Endpoint, cfg: &StreamConfig) -> Result<StreamChannel> {
        if endpoint.role() != Role::Peer {
            return Err(Error::InvalidArgument("only the peer attaches"));
        }
        cfg.validate()?;
        Self::start(endpoint, cfg.clone(), Role::Peer, None)
    }

    fn start(
        endpoint: &Endpoint,
        cfg: StreamConfig,
        role: Role,
        rings: Option<Rings>,
    ) -> Result<StreamChannel> {
        let inner = Arc::new(Inner {
            channel: cfg.channel,
            role,
            cfg,
            control: Arc::clone(endpoint.control()),
            shm: endpoint.shm().clone(),
            allocator: endpoint.allocator().cloned(),
            status: AtomicU8::new(status::IDLE),
            closing: AtomicBool::new(false),
            rings: OnceLock::new(),
            worker: Mutex::new(None),
        });
        if let Some(r) = rings {
            let _ = inner.rings.set(r);
        }

        let worker = {
            let for_loop = Arc::clone(&inner);
            let for_open = Arc::clone(&inner);
            let for_msgs = Arc::clone(&inner);
            std::thread::Builder::new()
                .name(format!("shmlink-stream-{}", inner.channel))
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
        Ok(StreamChannel { inner })
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

    fn post_event(&self, flag: u16) {
        let msg = Message::new(self.inner.channel, MsgKind::Event, flag, 0);
        if let Err(e) = self.inner.control.send(msg) {
            warn!(channel = self.inner.channel, %e, "stream event failed");
        }
    }

    /// Write as many of `data`'s bytes as fit, waiting for space per the
    /// policy. Returns the count written (at least one on success).
    pub fn write(&self, data: &[u8], wait: Wait) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.ensure_ready()?;
        let r = self.rings()?;
        let dir = &r.tx;
        let n = dir.wait.block_on(wait, || {
            if let Some(e) = self.abort_reason() {
                return Err(e);
            }
            let _g = dir.lock.lock();
            let wr = dir.hdr.wrptr();
            let rd = dir.hdr.rdptr();
            let space = dir.cap - wr.wrapping_sub(rd);
            if space == 0 {
                return Ok(None);
            }
            let n = (space as usize).min(data.len());
            let pos = ring_pos(wr, dir.cap);
            let first = ((dir.cap - pos) as usize).min(n);
            // SAFETY: the producer owns [wrptr, rdptr + cap); both
            // segments are inside the buffer.
            unsafe {
                self.inner.shm.copy_in(dir.buf_base + pos, &data[..first]);
                if first < n {
                    self.inner.shm.copy_in(dir.buf_base, &data[first..n]);
                }
            }
            dir.hdr.set_wrptr(wr.wrapping_add(n as u32));
            Ok(Some(n))
        })?;
        self.post_event(flags::EVENT_WROTE);
        Ok(n)
    }

    /// Read up to `buf.len()` bytes, waiting for data per the policy.
    pub fn read(&self, buf: &mut [u8], wait: Wait) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_ready()?;
        let r = self.rings()?;
        let dir = &r.rx;
        let n = dir.wait.block_on(wait, || {
            if let Some(e) = self.abort_reason() {
                return Err(e);
            }
            let _g = dir.lock.lock();
            let wr = dir.hdr.wrptr();
            let rd = dir.hdr.rdptr();
            let avail = wr.wrapping_sub(rd);
            if avail == 0 {
                return Ok(None);
            }
            let n = (avail as usize).min(buf.len());
            let pos = ring_pos(rd, dir.cap);
            let first = ((dir.cap - pos) as usize).min(n);
            // SAFETY: the consumer owns [rdptr, wrptr); both segments are
            // inside the buffer.
            unsafe {
                self.inner.shm.copy_out(dir.buf_base + pos, &mut buf[..first]);
                if first < n {
                    self.inner.shm.copy_out(dir.buf_base, &mut buf[first..n]);
                }
            }
            dir.hdr.set_rdptr(rd.wrapping_add(n as u32));
            Ok(Some(n))
        })?;
        self.post_event(flags::EVENT_READ);
        Ok(n)
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> Result<u32> {
        let r = self.rings()?;
        Ok(r.rx.hdr.wrptr().wrapping_sub(r.rx.hdr.rdptr()))
    }

    pub fn query(&self) -> Result<()> {
        self.ensure_ready()
    }

    /// Tear the channel down. Idempotent.
    pub fn destroy(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.status.store(status::IDLE, Ordering::Release);
        if let Some(r) = self.inner.rings.get() {
            r.tx.wait.wake_all();
            r.rx.wait.wake_all();
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
        debug!(channel = self.inner.channel, "stream channel destroyed");
    }
}

impl Inner {
    fn handle_msg(self: &Arc<Self>, msg: Message) {
        match msg.kind() {
            Some(MsgKind::Open) => {
                // A post-handshake OPEN is a peer restart. The layout
                // owner acks so the restarted side can finish its open;
                // the attaching side stays quiet to avoid an OPEN echo.
                if self.role == Role::Host {
                    let _ = self.control.open_ack(self.channel);
                }
            }
            Some(MsgKind::Close) => {
                self.status.store(status::IDLE, Ordering::Release);
                if let Some(r) = self.rings.get() {
                    r.tx.wait.wake_all();
                    r.rx.wait.wake_all();
                }
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
            }
            Some(MsgKind::Event) => {
                if let Some(r) = self.rings.get() {
                    match msg.flag {
                        // Peer wrote: our read side has data.
                        flags::EVENT_WROTE => r.rx.wait.wake_all(),
                        // Peer read: our write side has space.
                        flags::EVENT_READ => r.tx.wait.wake_all(),
                        other => {
                            warn!(channel = self.channel, flag = other, "unknown event flag")
                        }
                    }
                }
            }
            _ => warn!(channel = self.channel, ?msg, "unexpected channel message"),
        }
    }
}

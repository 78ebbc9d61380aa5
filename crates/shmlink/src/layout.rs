//! `#[repr(C)]` structures that live inside the shared window, and the raw
//! ring engine that operates on them.
//!
//! One header shape describes both transfer rings and free pools; the roles
//! differ only in which side advances which counter. Counters are free
//! running u32s: fill level is `wrptr - rdptr` in wrapping arithmetic and a
//! counter maps to a slot position modulo the ring count (a mask when the
//! count is a power of two). Descriptor writes are published with a release
//! store of the counter and observed with an acquire load, so a consumer that
//! sees the new counter also sees the slot contents.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::region::ShmView;

/// Ring or pool header as laid out in shared memory.
///
/// `addr` points at the descriptor-slot array, in the on-wire address view.
/// For a transfer ring the producer advances `wrptr` and the consumer
/// `rdptr`; for a free pool the block taker advances `rdptr` and the
/// returner `wrptr`. Each field has exactly one writer while both sides are
/// alive.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RingHeader {
    pub addr: u32,
    pub count: u32,
    pub size: u32,
    pub rdptr: u32,
    pub wrptr: u32,
}

pub const RING_HEADER_BYTES: u32 = std::mem::size_of::<RingHeader>() as u32;

const RDPTR_WORD: usize = 3;
const WRPTR_WORD: usize = 4;

/// Map a free-running counter to a slot position.
pub(crate) fn ring_pos(counter: u32, count: u32) -> u32 {
    if count.is_power_of_two() {
        counter & (count - 1)
    } else {
        counter % count
    }
}

/// Atomic view over a [`RingHeader`] in the shared window.
pub(crate) struct HeaderView {
    ptr: *mut u32,
}

// SAFETY: all accesses go through &AtomicU32; cross-side ordering is the
// acquire/release protocol documented on the module.
unsafe impl Send for HeaderView {}
unsafe impl Sync for HeaderView {}

impl HeaderView {
    /// # Safety
    /// `addr` must point at a [`RingHeader`]-sized, 4-aligned range inside
    /// `view` that stays mapped for the life of the value.
    pub(crate) unsafe fn at(view: &ShmView, addr: u32) -> Self {
        debug_assert!(view.contains(addr, RING_HEADER_BYTES));
        debug_assert_eq!(addr % 4, 0);
        Self {
            ptr: view.ptr(addr) as *mut u32,
        }
    }

    fn word(&self, idx: usize) -> &AtomicU32 {
        // SAFETY: idx < 5 words of the header, alignment checked at
        // construction; AtomicU32::from_ptr ties the lifetime to &self.
        unsafe { AtomicU32::from_ptr(self.ptr.add(idx)) }
    }

    /// Fill in every field. Only the layout creator calls this, before the
    /// base address is handed to the peer.
    pub(crate) fn init(&self, addr: u32, count: u32, size: u32) {
        self.word(0).store(addr, Ordering::Relaxed);
        self.word(1).store(count, Ordering::Relaxed);
        self.word(2).store(size, Ordering::Relaxed);
        self.word(RDPTR_WORD).store(0, Ordering::Relaxed);
        self.word(WRPTR_WORD).store(0, Ordering::Release);
    }

    pub(crate) fn count(&self) -> u32 {
        self.word(1).load(Ordering::Relaxed)
    }

    pub(crate) fn size(&self) -> u32 {
        self.word(2).load(Ordering::Relaxed)
    }

    pub(crate) fn rdptr(&self) -> u32 {
        self.word(RDPTR_WORD).load(Ordering::Acquire)
    }

    pub(crate) fn wrptr(&self) -> u32 {
        self.word(WRPTR_WORD).load(Ordering::Acquire)
    }

    pub(crate) fn set_rdptr(&self, v: u32) {
        self.word(RDPTR_WORD).store(v, Ordering::Release);
    }

    pub(crate) fn set_wrptr(&self, v: u32) {
        self.word(WRPTR_WORD).store(v, Ordering::Release);
    }
}

/// Descriptor for one block in a transfer ring or free pool: absolute
/// on-wire address plus the valid payload length.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDesc {
    pub addr: u32,
    pub length: u32,
}

pub const BLOCK_DESC_BYTES: u32 = std::mem::size_of::<BlockDesc>() as u32;

/// Packed descriptor of the packet variant: a block index plus an 11-bit
/// payload length and a 5-bit start offset squeezed into one control word.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDesc {
    pub index: u16,
    ctrl: u16,
}

pub const PACKET_DESC_BYTES: u32 = std::mem::size_of::<PacketDesc>() as u32;

/// Largest payload length a packed descriptor can carry.
pub const PACKET_LEN_MAX: u32 = (1 << 11) - 1;
/// Largest start offset a packed descriptor can carry.
pub const PACKET_OFFSET_MAX: u32 = (1 << 5) - 1;

impl PacketDesc {
    pub fn new(index: u16, len: u32, offset: u32) -> Result<Self> {
        if len > PACKET_LEN_MAX {
            return Err(Error::InvalidArgument("packet length exceeds 11 bits"));
        }
        if offset > PACKET_OFFSET_MAX {
            return Err(Error::InvalidArgument("packet offset exceeds 5 bits"));
        }
        Ok(Self {
            index,
            ctrl: ((offset as u16) << 11) | len as u16,
        })
    }

    /// Pool entries carry only the index; length and offset are meaningless
    /// until the block is sent.
    pub fn idle(index: u16) -> Self {
        Self { index, ctrl: 0 }
    }

    pub fn len(&self) -> u32 {
        (self.ctrl & 0x7ff) as u32
    }

    pub fn offset(&self) -> u32 {
        (self.ctrl >> 11) as u32
    }
}

/// Raw view over a descriptor-slot array in the shared window.
pub(crate) struct SlotArray<D> {
    base: *mut D,
    count: u32,
}

// SAFETY: slots are only read below the published wrptr and only written at
// unpublished positions; the enclosing ring lock serializes local callers.
unsafe impl<D: Copy + Send> Send for SlotArray<D> {}
unsafe impl<D: Copy + Send> Sync for SlotArray<D> {}

impl<D: Copy> SlotArray<D> {
    /// # Safety
    /// `addr` must point at `count` `D`-sized slots inside `view`, suitably
    /// aligned, mapped for the life of the value.
    pub(crate) unsafe fn at(view: &ShmView, addr: u32, count: u32) -> Self {
        debug_assert!(view.contains(addr, count * std::mem::size_of::<D>() as u32));
        Self {
            base: view.ptr(addr) as *mut D,
            count,
        }
    }

    pub(crate) fn read(&self, pos: u32) -> D {
        debug_assert!(pos < self.count);
        // SAFETY: pos is in range; volatile matches the word-at-a-time
        // access the shared window requires.
        unsafe { self.base.add(pos as usize).read_volatile() }
    }

    pub(crate) fn write(&self, pos: u32, d: D) {
        debug_assert!(pos < self.count);
        // SAFETY: as above.
        unsafe { self.base.add(pos as usize).write_volatile(d) }
    }
}

/// One ring (or pool), header plus slots, with single-role operations.
///
/// Callers wrap this in a mutex for local mutual exclusion; the counter
/// protocol handles the cross-side race. Each endpoint only ever calls the
/// operations matching its role on a given ring, which is what keeps every
/// shared counter single-writer.
pub(crate) struct RawRing<D> {
    hdr: HeaderView,
    slots: SlotArray<D>,
}

impl<D: Copy> RawRing<D> {
    /// # Safety
    /// See [`HeaderView::at`] and [`SlotArray::at`]; additionally
    /// `hdr.count()` must equal the slot count for the life of the ring.
    pub(crate) unsafe fn new(hdr: HeaderView, slots: SlotArray<D>) -> Self {
        Self { hdr, slots }
    }

    pub(crate) fn count(&self) -> u32 {
        self.hdr.count()
    }

    pub(crate) fn fill(&self) -> u32 {
        self.hdr.wrptr().wrapping_sub(self.hdr.rdptr())
    }

    pub(crate) fn space(&self) -> u32 {
        self.count() - self.fill()
    }

    /// Producer: append one descriptor. Returns the fill level after the
    /// append so callers can detect the empty→one transition.
    pub(crate) fn try_push(&self, d: D) -> Result<u32> {
        let wr = self.hdr.wrptr();
        let rd = self.hdr.rdptr();
        let count = self.count();
        if wr.wrapping_sub(rd) >= count {
            return Err(Error::Exhausted("ring full"));
        }
        self.slots.write(ring_pos(wr, count), d);
        // Release publish: the slot write above is visible before the
        // counter moves.
        self.hdr.set_wrptr(wr.wrapping_add(1));
        Ok(wr.wrapping_add(1).wrapping_sub(rd))
    }

    /// Consumer: take the oldest descriptor, if any.
    pub(crate) fn try_pop(&self) -> Option<D> {
        let rd = self.hdr.rdptr();
        let wr = self.hdr.wrptr();
        if wr == rd {
            return None;
        }
        let d = self.slots.read(ring_pos(rd, self.count()));
        self.hdr.set_rdptr(rd.wrapping_add(1));
        Some(d)
    }

    /// Consumer: hand back the most recently taken descriptor by retreating
    /// the taker counter. Returns the fill level after the retreat.
    pub(crate) fn try_unpop(&self, d: D) -> Result<u32> {
        let rd = self.hdr.rdptr();
        let wr = self.hdr.wrptr();
        let count = self.count();
        if wr.wrapping_sub(rd) >= count {
            return Err(Error::Exhausted("ring full"));
        }
        let rd = rd.wrapping_sub(1);
        self.slots.write(ring_pos(rd, count), d);
        self.hdr.set_rdptr(rd);
        Ok(wr.wrapping_sub(rd))
    }

    /// Producer-side collapse: discard everything queued by moving `wrptr`
    /// down to `rdptr`. Only legal while the peer is known dead.
    pub(crate) fn collapse_producer(&self) {
        self.hdr.set_wrptr(self.hdr.rdptr());
    }

    /// Consumer-side collapse: discard everything queued by advancing
    /// `rdptr` to `wrptr`. Counter stays monotonic.
    pub(crate) fn collapse_consumer(&self) {
        self.hdr.set_rdptr(self.hdr.wrptr());
    }

    pub(crate) fn rdptr(&self) -> u32 {
        self.hdr.rdptr()
    }
}

//! Shared-memory region with per-endpoint address views, plus the pool
//! allocator that carves channel layouts out of it.
//!
//! The two processors map the same physical window at different virtual
//! bases. Inside shared structures every address is expressed in the *peer's*
//! view, so the side that created the layout translates on the way in and out
//! while the peer reads addresses it can use directly. The translation is a
//! fixed offset established once at creation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// Allocation granularity of the pool allocator.
pub const ALLOC_ALIGN: u32 = 8;

struct Backing {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the backing is plain bytes; all concurrent access goes through
// atomic counter views or is serialized by the transport protocol (a block
// address is touched by exactly one side between publishes).
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self { ptr, len }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from Box::into_raw of a boxed slice of
        // exactly this length and are dropped exactly once.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

/// One endpoint's window onto the shared buffer.
///
/// `base` is the address this endpoint uses locally; `shared_base` is the
/// base in which on-wire addresses (header fields, descriptors, handshake
/// values) are expressed. For the layout creator the two differ; for the
/// attaching peer they coincide.
#[derive(Clone)]
pub struct ShmView {
    backing: Arc<Backing>,
    base: u32,
    shared_base: u32,
}

impl ShmView {
    /// Build both views over one freshly zeroed buffer. The first view is the
    /// creator's (translating), the second the peer's (identity).
    pub fn pair(len: u32, host_base: u32, peer_base: u32) -> (ShmView, ShmView) {
        assert!(len > 0, "empty region");
        assert!(host_base.checked_add(len).is_some(), "host view overflows");
        assert!(peer_base.checked_add(len).is_some(), "peer view overflows");
        let backing = Arc::new(Backing::zeroed(len as usize));
        let host = ShmView {
            backing: Arc::clone(&backing),
            base: host_base,
            shared_base: peer_base,
        };
        let peer = ShmView {
            backing,
            base: peer_base,
            shared_base: peer_base,
        };
        (host, peer)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.backing.len as u32
    }

    pub fn is_empty(&self) -> bool {
        self.backing.len == 0
    }

    /// Translate a local address into the on-wire view.
    pub fn to_shared(&self, local: u32) -> u32 {
        local.wrapping_sub(self.base).wrapping_add(self.shared_base)
    }

    /// Translate an on-wire address into this endpoint's view.
    pub fn from_shared(&self, shared: u32) -> u32 {
        shared
            .wrapping_sub(self.shared_base)
            .wrapping_add(self.base)
    }

    /// Does `[addr, addr + len)` fall inside this view?
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        let off = addr.wrapping_sub(self.base) as u64;
        off + len as u64 <= self.backing.len as u64
    }

    /// Raw pointer for a local-view address.
    ///
    /// The address must be in range; this is checked in debug builds only,
    /// callers on the hot path validate once when the layout is built.
    pub(crate) fn ptr(&self, addr: u32) -> *mut u8 {
        debug_assert!(self.contains(addr, 1), "address {addr:#x} out of region");
        let off = addr.wrapping_sub(self.base) as usize;
        // SAFETY: offset is within the allocation (asserted above in debug,
        // guaranteed by layout validation in release).
        unsafe { self.backing.ptr.add(off) }
    }

    /// Copy `data` into the region at a local-view address.
    ///
    /// # Safety
    /// The caller must hold the lease on the target range (a block obtained
    /// from get()/receive() and not yet handed back), so no other writer
    /// races with the copy.
    pub(crate) unsafe fn copy_in(&self, addr: u32, data: &[u8]) {
        debug_assert!(self.contains(addr, data.len() as u32));
        // SAFETY: range is inside the allocation and exclusively leased.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr(addr), data.len());
        }
    }

    /// Copy bytes out of the region at a local-view address.
    ///
    /// # Safety
    /// Same lease requirement as [`ShmView::copy_in`].
    pub(crate) unsafe fn copy_out(&self, addr: u32, buf: &mut [u8]) {
        debug_assert!(self.contains(addr, buf.len() as u32));
        // SAFETY: range is inside the allocation and exclusively leased.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(addr), buf.as_mut_ptr(), buf.len());
        }
    }
}

/// Who requested an allocation, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct AllocRecord {
    pub addr: u32,
    pub size: u32,
    pub owner: String,
}

struct PoolInner {
    /// Sorted, coalesced free extents (local-view addr, size).
    free: Vec<(u32, u32)>,
    records: Vec<AllocRecord>,
    used: u32,
}

/// First-fit allocator over a sub-range of the shared region.
///
/// Channel creation carves its whole layout (headers, descriptor arrays,
/// block storage) out of here in one allocation; destroy returns it.
pub struct PoolAllocator {
    base: u32,
    size: u32,
    inner: Mutex<PoolInner>,
}

impl PoolAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            inner: Mutex::new(PoolInner {
                free: vec![(base, size)],
                records: Vec::new(),
                used: 0,
            }),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Allocate `size` bytes (rounded up to [`ALLOC_ALIGN`]), first fit.
    pub fn alloc(&self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation"));
        }
        let size = align_up(size, ALLOC_ALIGN);
        let owner = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_owned();

        let mut inner = self.inner.lock();
        let slot = inner
            .free
            .iter()
            .position(|&(_, extent)| extent >= size)
            .ok_or_else(|| {
                warn!(size, used = inner.used, total = self.size, "pool exhausted");
                Error::Exhausted("shared-memory pool")
            })?;
        let (addr, extent) = inner.free[slot];
        if extent == size {
            inner.free.remove(slot);
        } else {
            inner.free[slot] = (addr + size, extent - size);
        }
        inner.used += size;
        inner.records.push(AllocRecord { addr, size, owner });
        Ok(addr)
    }

    /// Return an allocation. Unknown addresses are logged and ignored.
    pub fn free(&self, addr: u32) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.records.iter().position(|r| r.addr == addr) else {
            warn!(addr = format_args!("{addr:#x}"), "free of unknown address");
            return;
        };
        let rec = inner.records.swap_remove(idx);
        inner.used -= rec.size;

        // Insert sorted and coalesce with neighbours.
        let pos = inner
            .free
            .iter()
            .position(|&(a, _)| a > rec.addr)
            .unwrap_or(inner.free.len());
        inner.free.insert(pos, (rec.addr, rec.size));
        if pos + 1 < inner.free.len() {
            let (a, s) = inner.free[pos];
            let (na, ns) = inner.free[pos + 1];
            if a + s == na {
                inner.free[pos] = (a, s + ns);
                inner.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (pa, ps) = inner.free[pos - 1];
            let (a, s) = inner.free[pos];
            if pa + ps == a {
                inner.free[pos - 1] = (pa, ps + s);
                inner.free.remove(pos);
            }
        }
    }

    pub fn used(&self) -> u32 {
        self.inner.lock().used
    }

    pub fn available(&self) -> u32 {
        self.size - self.inner.lock().used
    }

    /// Snapshot of live allocations for diagnostics.
    pub fn records(&self) -> Vec<AllocRecord> {
        self.inner.lock().records.clone()
    }
}

pub(crate) fn align_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

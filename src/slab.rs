// src/slab.rs
//
// Preallocated connection slab plus the lock-free free stack threaded
// through its cells. Slots are referenced by dense index everywhere; the
// epoll token and the reaper key are both the slot index.
use libc::c_int;
use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

pub const RECV_BUF_LEN: usize = 4096;

/// Free-list chain terminator.
const NIL: i32 = -1;

/// One cell of the connection slab.
///
/// A slot is either chained in the free stack (descriptor 0) or bound to
/// a live socket, never both. The identifier is assigned once at slab
/// construction and never changes.
#[repr(C, align(64))]
pub struct Slot<S> {
    id: u32,
    fd: AtomicI32,
    next: AtomicI32,
    buf: UnsafeCell<[u8; RECV_BUF_LEN]>,
    state: UnsafeCell<S>,
}

impl<S> Slot<S> {
    /// Stable identifier, `0..capacity`.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Currently bound descriptor; 0 when the slot is free.
    pub fn fd(&self) -> c_int {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn bind_fd(&self, fd: c_int) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Claims the descriptor for termination. Only one caller observes a
    /// nonzero value.
    pub(crate) fn take_fd(&self) -> c_int {
        self.fd.swap(0, Ordering::AcqRel)
    }

    /// Receive buffer access.
    ///
    /// # Safety
    /// The caller must hold the slot's dispatch exclusivity (one-shot
    /// registration serializes dispatch per connection).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn recv_buf(&self) -> &mut [u8; RECV_BUF_LEN] {
        &mut *self.buf.get()
    }

    /// User state access.
    ///
    /// # Safety
    /// Same exclusivity requirement as [`Slot::recv_buf`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state_mut(&self) -> &mut S {
        &mut *self.state.get()
    }
}

/// Contiguous block of connection slots.
///
/// The requested capacity is grown so that the slab's byte footprint
/// covers whole memory pages; it never drops below the hint. Created at
/// pool start, dropped at pool stop, not resizable.
pub struct Slab<S> {
    slots: Box<[Slot<S>]>,
}

// Slots hand out interior access only under the per-connection dispatch
// exclusivity enforced by the pool.
unsafe impl<S: Send> Send for Slab<S> {}
unsafe impl<S: Send> Sync for Slab<S> {}

impl<S: Default> Slab<S> {
    pub fn new(capacity_hint: usize) -> Self {
        let capacity = page_rounded_capacity::<S>(capacity_hint.max(1));

        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                id: i as u32,
                fd: AtomicI32::new(0),
                next: AtomicI32::new(NIL),
                buf: UnsafeCell::new([0; RECV_BUF_LEN]),
                state: UnsafeCell::new(S::default()),
            });
        }

        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

impl<S> Slab<S> {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &Slot<S> {
        &self.slots[idx]
    }
}

/// Number of slots filling the page-rounded footprint of `hint` slots.
fn page_rounded_capacity<S>(hint: usize) -> usize {
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };

    let slot = mem::size_of::<Slot<S>>();
    let bytes = hint * slot;
    let padded = bytes + (page - bytes % page) % page;
    padded / slot
}

/// Treiber-style lock-free stack of free slot indices.
///
/// ABA is avoided by construction: a slot is pushed only by terminate,
/// which runs at most once per (accept, terminate) cycle, and the pool
/// never re-pushes a slot while it is bound to a descriptor.
pub struct FreeStack {
    head: AtomicI32,
}

impl FreeStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicI32::new(NIL),
        }
    }

    /// Chains every slab cell into the stack. Pop order is deterministic:
    /// highest index first, the bottom cell links to nothing.
    pub fn init<S>(&self, slab: &Slab<S>) {
        let capacity = slab.capacity();
        for i in 0..capacity {
            let link = if i == 0 { NIL } else { i as i32 - 1 };
            slab.slot(i).next.store(link, Ordering::Relaxed);
        }
        self.head.store(capacity as i32 - 1, Ordering::Release);
    }

    pub fn push<S>(&self, slab: &Slab<S>, idx: u32) {
        let slot = slab.slot(idx as usize);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            slot.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, idx as i32, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    pub fn pop<S>(&self, slab: &Slab<S>) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == NIL {
                return None;
            }
            let next = slab.slot(head as usize).next.load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Some(head as u32);
            }
        }
    }
}

impl Default for FreeStack {
    fn default() -> Self {
        Self::new()
    }
}

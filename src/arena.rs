// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-thread slot arenas: anonymous, page-aligned `mmap` regions holding
//! `SLOTS_PER_ARENA` version slots apiece, plus the global, process-lifetime
//! directories that let any thread resolve any other thread's handles.
//!
//! # Allocation path
//!
//! `make_version` on a thread context: pop the local free-stack; if empty,
//! batch-steal every owned arena's shared `top_handle` (an atomic exchange
//! with the empty sentinel, detaching the whole remote MPSC stack as one
//! unit) and splice the result in as the new local stack; if still empty,
//! provision a fresh arena and link its slots locally. Every
//! `SLOTS_PER_ARENA` allocations, check whether the arena provisioned just
//! before the current one has been fully returned *and* is no longer the
//! arena backing the local free-stack; if so, detach its remaining
//! free-stack entries, mark it retired, and `madvise` its pages away without
//! giving up the virtual address range or the directory entry. A retired
//! arena is skipped by `batch_steal` and never provisioned into again.
//!
//! # Free path
//!
//! `free_slot` CAS-pushes the freed handle onto its owning arena's tagged
//! `top_handle` — a Treiber stack where the depth tag defeats ABA on the top
//! word, since many threads may free concurrently while only the owning
//! thread ever pops.

use crate::config::{MAX_ARENAS_PER_THREAD, MAX_THREADS, SLOTS_PER_ARENA};
use crate::error::{GateError, Result};
use crate::handle::{Handle, StackTop};
use crate::version::Version;
use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// A single page-aligned region of `SLOTS_PER_ARENA` version slots, owned by
/// exactly one thread index for its whole lifetime.
#[repr(C)]
struct Arena {
    slots: *mut Version,
    /// Shared MPSC free-stack top: `[depth_tag(24) | handle(40)]`.
    top_handle: AtomicU64,
    /// Slots currently allocated out of this arena (not on any free-stack).
    outstanding: AtomicUsize,
    /// Set once this arena's pages have been reclaimed. A retired arena never
    /// hands out slots again; `batch_steal` skips it outright instead of
    /// relying on its drained `top_handle` reading empty.
    retired: AtomicBool,
}

// SAFETY: `slots` points at an mmap'd region sized for `SLOTS_PER_ARENA`
// `Version`s and is never reallocated or moved; all access to the pointed-to
// slots goes through `Version`'s own atomics.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn provision() -> Result<Box<Arena>> {
        let bytes = SLOTS_PER_ARENA * std::mem::size_of::<Version>();
        debug_assert_eq!(bytes % page_size(), 0, "arena size must be page-aligned");

        // SAFETY: anonymous, private mapping; no fd, no shared state with
        // any other process. `bytes` is a compile-time-derived, non-zero,
        // page-aligned size. The mapping is read/write for this process
        // only. Failure is reported via MAP_FAILED and converted to an
        // `io::Error`, never dereferenced.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(GateError::ArenaProvisionFailed(io::Error::last_os_error()));
        }
        let slots = ptr as *mut Version;

        // SAFETY: `slots` is valid for `SLOTS_PER_ARENA` writes of `Version`
        // (freshly mapped, zeroed, exclusively owned by this call until the
        // `Box` below is returned). `Version::empty()` has no drop glue that
        // would double-run.
        for i in 0..SLOTS_PER_ARENA {
            unsafe { slots.add(i).write(Version::empty()) };
        }

        log::debug!("vgate: provisioned arena of {} slots ({bytes} bytes)", SLOTS_PER_ARENA);

        Ok(Box::new(Arena {
            slots,
            top_handle: AtomicU64::new(StackTop::empty().0),
            outstanding: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }))
    }

    /// # Safety
    /// `idx` must be `< SLOTS_PER_ARENA`.
    unsafe fn slot(&self, idx: usize) -> &Version {
        &*self.slots.add(idx)
    }

    /// CAS-push `handle` onto this arena's shared free-stack.
    fn push_shared(&self, handle: Handle, version: &Version) {
        let mut cur = self.top_handle.load(Ordering::Acquire);
        loop {
            let top = StackTop(cur);
            version.set_next_handle(top.handle().0);
            let depth = top.depth().wrapping_add(1);
            let new_top = StackTop::new(depth, handle).0;
            match self.top_handle.compare_exchange_weak(
                cur,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Atomically detach the entire shared free-stack as one batch.
    fn steal_shared(&self) -> Handle {
        let prev = self.top_handle.swap(StackTop::empty().0, Ordering::AcqRel);
        StackTop(prev).handle()
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Retires this arena: detaches and discards whatever remains on its
    /// shared free-stack, marks it off-limits, then `madvise`s its pages
    /// away. The caller (`ThreadContext::maybe_reclaim`) must already have
    /// established that no thread-local free-stack is currently sourced from
    /// this arena and that nothing is outstanding, so every one of its slots
    /// is reachable only through `top_handle` at this point — detaching that
    /// chain here, before the pages are zeroed, is what makes the reclaim
    /// below safe.
    fn retire(&self) {
        let _ = self.steal_shared();
        self.retired.store(true, Ordering::Release);
        self.reclaim_pages();
    }

    /// Best-effort `madvise(MADV_DONTNEED)` over the whole arena. Keeps the
    /// virtual address range (and the directory entry pointing at it) alive;
    /// only the physical pages backing it are released.
    fn reclaim_pages(&self) {
        let bytes = SLOTS_PER_ARENA * std::mem::size_of::<Version>();
        #[cfg(target_os = "linux")]
        {
            // SAFETY: `self.slots`/`bytes` describe exactly this arena's own
            // mapping, established once in `provision` and never resized.
            // MADV_DONTNEED is advisory; the kernel re-zeroes pages lazily on
            // next touch, which is fine because a retired arena's slots are
            // never touched again, by construction (see `retire`).
            let rc = unsafe {
                libc::madvise(self.slots as *mut libc::c_void, bytes, libc::MADV_DONTNEED)
            };
            if rc != 0 {
                log::warn!("vgate: madvise(MADV_DONTNEED) failed: {}", io::Error::last_os_error());
            } else {
                log::debug!("vgate: reclaimed {bytes} bytes from a fully-returned arena");
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = bytes;
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let bytes = SLOTS_PER_ARENA * std::mem::size_of::<Version>();
        // SAFETY: `self.slots` is the pointer returned by the `mmap` call in
        // `provision`, sized identically; nothing else holds a reference to
        // it once the owning `ThreadContext`/global table entry is dropped
        // (which only happens at process teardown, since arenas are never
        // compacted during normal operation).
        unsafe {
            libc::munmap(self.slots as *mut libc::c_void, bytes);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) takes no pointer arguments and always
    // returns a small positive value on supported platforms.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Per-thread allocation state: owned arenas, the private free-stack, and the
/// bookkeeping that drives periodic reclamation.
pub(crate) struct ThreadContext {
    thread_idx: usize,
    arenas: Vec<OnceLock<Box<Arena>>>,
    arena_count: Cell<usize>,
    /// Count of provisioned arenas that have not been retired. Purely
    /// informational bookkeeping mirrored alongside each arena's own
    /// `retired` flag (see `maybe_reclaim`); `batch_steal`'s scan range still
    /// has to run over `0..arena_count`, since retirement isn't necessarily
    /// contiguous from the newest arena.
    active_arena_count: Cell<usize>,
    local_free_head: Cell<Handle>,
    /// Which arena `local_free_head`'s chain currently belongs to, if any.
    /// A local chain is always entirely drawn from one arena (see module
    /// docs); this lets `maybe_reclaim` tell whether an arena with
    /// `outstanding == 0` still has un-popped slots sitting in the local
    /// stack, which wouldn't show up in `outstanding` at all.
    local_free_arena: Cell<Option<usize>>,
    alloc_count: Cell<u64>,
}

// SAFETY: a ThreadContext is only ever mutated (via its `Cell`s) by the one
// thread that owns it; other threads only reach it to resolve handles into
// arenas, which goes through the `OnceLock`-guarded `arenas` table.
unsafe impl Sync for ThreadContext {}

impl ThreadContext {
    fn new(thread_idx: usize) -> Self {
        let mut arenas = Vec::with_capacity(MAX_ARENAS_PER_THREAD);
        arenas.resize_with(MAX_ARENAS_PER_THREAD, OnceLock::new);
        ThreadContext {
            thread_idx,
            arenas,
            arena_count: Cell::new(0),
            active_arena_count: Cell::new(0),
            local_free_head: Cell::new(Handle::NULL),
            local_free_arena: Cell::new(None),
            alloc_count: Cell::new(0),
        }
    }

    fn provision_arena(&self) -> Result<usize> {
        let idx = self.arena_count.get();
        if idx >= MAX_ARENAS_PER_THREAD {
            return Err(GateError::ArenaProvisionFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "thread has exhausted MAX_ARENAS_PER_THREAD",
            )));
        }
        let arena = Arena::provision()?;
        let _ = self.arenas[idx].set(arena);
        self.arena_count.set(idx + 1);
        self.active_arena_count.set(self.active_arena_count.get() + 1);

        // Link slots 1..SLOTS_PER_ARENA into the local free-stack (slot 0 is
        // a permanent sentinel, never allocated). Only this thread touches
        // the local stack, so plain relaxed stores suffice.
        let arena_ref = self.arenas[idx].get().unwrap();
        let mut head = Handle::NULL;
        for slot_idx in (1..SLOTS_PER_ARENA).rev() {
            let h = Handle::new(self.thread_idx, idx, slot_idx);
            // SAFETY: slot_idx < SLOTS_PER_ARENA, arena freshly provisioned.
            let slot = unsafe { arena_ref.slot(slot_idx) };
            slot.set_next_handle(head.0);
            head = h;
        }
        self.local_free_head.set(head);
        self.local_free_arena.set(Some(idx));
        Ok(idx)
    }

    fn pop_local(&self, table: &ArenaTable) -> Option<Handle> {
        let head = self.local_free_head.get();
        if head.is_null() {
            return None;
        }
        let slot = table.resolve(head);
        let next = Handle::from_raw(slot.next_handle());
        self.local_free_head.set(next);
        if next.is_null() {
            // Local stack just ran dry; it no longer pins any arena's slots.
            self.local_free_arena.set(None);
        }
        Some(head)
    }

    fn batch_steal(&self) -> bool {
        for idx in 0..self.arena_count.get() {
            let Some(arena) = self.arenas[idx].get() else { continue };
            if arena.is_retired() {
                continue;
            }
            let stolen = arena.steal_shared();
            if !stolen.is_null() {
                self.local_free_head.set(stolen);
                self.local_free_arena.set(Some(idx));
                return true;
            }
        }
        false
    }

    /// Every `SLOTS_PER_ARENA` allocations, checks whether the arena
    /// provisioned just before the current one can be retired.
    ///
    /// `outstanding == 0` only means no slot of that arena is currently
    /// allocated out — it says nothing about whether some of its slots are
    /// still sitting, un-popped, inside this thread's local free-stack
    /// (`local_free_head`), whose `next_handle` links live inside the
    /// arena's own mmap'd pages. Reclaiming while that's true would zero the
    /// very links the local stack is about to walk. So this also requires
    /// that the local stack isn't currently sourced from this arena; once
    /// both hold, every remaining slot is provably parked on the arena's own
    /// shared `top_handle`, which `Arena::retire` detaches before `madvise`.
    fn maybe_reclaim(&self) {
        let count = self.alloc_count.get() + 1;
        self.alloc_count.set(count);
        if count as usize % SLOTS_PER_ARENA != 0 {
            return;
        }
        let arenas_so_far = self.arena_count.get();
        if arenas_so_far < 2 {
            return;
        }
        let last_idx = arenas_so_far - 2;
        if self.local_free_arena.get() == Some(last_idx) {
            return;
        }
        let Some(arena) = self.arenas[last_idx].get() else { return };
        if arena.is_retired() {
            return;
        }
        if arena.outstanding.load(Ordering::Acquire) == 0 {
            arena.retire();
            self.active_arena_count.set(self.active_arena_count.get() - 1);
        }
    }
}

/// The global, process-lifetime directory of arena pointers and thread
/// contexts. Indexed `[thread_idx][arena_idx]`; entries are written at most
/// once and never removed, so lookups never race a concurrent teardown.
pub(crate) struct ArenaTable {
    contexts: Vec<OnceLock<Box<ThreadContext>>>,
    bitmap: Vec<AtomicU64>,
}

impl ArenaTable {
    fn new() -> Self {
        let mut contexts = Vec::with_capacity(MAX_THREADS);
        contexts.resize_with(MAX_THREADS, OnceLock::new);
        let words = MAX_THREADS.div_ceil(64);
        let mut bitmap = Vec::with_capacity(words);
        bitmap.resize_with(words, || AtomicU64::new(0));
        ArenaTable { contexts, bitmap }
    }

    fn acquire_thread_idx(&self) -> Result<usize> {
        for word_idx in 0..self.bitmap.len() {
            let word = &self.bitmap[word_idx];
            let mut cur = word.load(Ordering::Relaxed);
            loop {
                if cur == u64::MAX {
                    break;
                }
                let bit = (!cur).trailing_zeros();
                let idx = word_idx * 64 + bit as usize;
                if idx >= MAX_THREADS {
                    break;
                }
                let new = cur | (1u64 << bit);
                match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => return Ok(idx),
                    Err(actual) => cur = actual,
                }
            }
        }
        Err(GateError::ThreadPoolExhausted)
    }

    fn release_thread_idx(&self, idx: usize) {
        let word = idx / 64;
        let bit = idx % 64;
        self.bitmap[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
    }

    fn context(&self, thread_idx: usize) -> Option<&ThreadContext> {
        self.contexts[thread_idx].get().map(|b| b.as_ref())
    }

    fn context_or_init(&self, thread_idx: usize) -> &ThreadContext {
        self.contexts[thread_idx]
            .get_or_init(|| {
                log::debug!("vgate: adopting thread context for thread_idx={thread_idx}");
                Box::new(ThreadContext::new(thread_idx))
            })
            .as_ref()
    }

    pub(crate) fn resolve(&self, handle: Handle) -> &Version {
        let ctx = self
            .context(handle.thread_idx())
            .expect("resolved handle must name a live thread context");
        let arena = ctx.arenas[handle.arena_idx()]
            .get()
            .expect("resolved handle must name a provisioned arena");
        // SAFETY: handle.slot_idx() < SLOTS_PER_ARENA by construction
        // (Handle::new debug-asserts this at creation time, and handles
        // reaching here were constructed by this module alone).
        unsafe { arena.slot(handle.slot_idx()) }
    }
}

fn global_table() -> &'static ArenaTable {
    static TABLE: OnceLock<ArenaTable> = OnceLock::new();
    TABLE.get_or_init(ArenaTable::new)
}

struct ThreadIdLease(usize);

impl Drop for ThreadIdLease {
    fn drop(&mut self) {
        // The context itself (and its arenas) stay in the global directory
        // for adoption by whichever thread acquires this index next; only
        // the bitmap bit is released so the index becomes assignable again.
        global_table().release_thread_idx(self.0);
    }
}

thread_local! {
    static THREAD_ID: std::cell::RefCell<Option<ThreadIdLease>> = const { std::cell::RefCell::new(None) };
}

fn current_thread_idx() -> Result<usize> {
    THREAD_ID.with(|cell| {
        if let Some(lease) = cell.borrow().as_ref() {
            return Ok(lease.0);
        }
        let idx = global_table().acquire_thread_idx()?;
        *cell.borrow_mut() = Some(ThreadIdLease(idx));
        Ok(idx)
    })
}

/// Allocates a fresh version slot for the calling thread, returning its
/// handle and a reference to the (already zero-initialized) slot.
pub(crate) fn make_version(
    object: *mut (),
    free_context: *mut (),
    gate: *mut crate::gate::GateInner,
) -> Result<(Handle, &'static Version)> {
    let table = global_table();
    let thread_idx = current_thread_idx()?;
    let ctx = table.context_or_init(thread_idx);

    ctx.maybe_reclaim();

    let handle = match ctx.pop_local(table) {
        Some(h) => h,
        None => {
            if ctx.batch_steal() {
                ctx.pop_local(table).expect("batch-steal left the local stack non-empty")
            } else {
                ctx.provision_arena()?;
                ctx.pop_local(table).expect("freshly provisioned arena is never empty")
            }
        }
    };

    let slot = table.resolve(handle);
    slot.reset_for_allocation(handle.0, object, free_context, gate);

    let arena = ctx.arenas[handle.arena_idx()].get().unwrap();
    arena.outstanding.fetch_add(1, Ordering::AcqRel);

    Ok((handle, slot))
}

/// Returns a slot to its owning arena's shared free-stack. Safe to call from
/// any thread, not just the one that allocated it.
pub(crate) fn free_slot(handle: Handle) {
    let table = global_table();
    let version = table.resolve(handle);
    let owner = table
        .context(handle.thread_idx())
        .expect("freed handle must name a live thread context");
    let arena = owner.arenas[handle.arena_idx()]
        .get()
        .expect("freed handle must name a provisioned arena");
    arena.push_shared(handle, version);
    arena.outstanding.fetch_sub(1, Ordering::AcqRel);
}

/// Resolves a handle to its slot. Exposed to `gate` for the acquire/exchange
/// hot path, which never allocates.
pub(crate) fn resolve(handle: Handle) -> &'static Version {
    global_table().resolve(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_version_then_free_then_reallocate_reuses_the_slot() {
        let (h1, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()).unwrap();
        free_slot(h1);
        let (h2, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn allocations_never_hand_out_the_sentinel_slot() {
        let (h, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()).unwrap();
        assert_ne!(h.slot_idx(), 0);
    }

    #[test]
    fn provisioning_past_slots_per_arena_crosses_into_a_second_arena() {
        let mut handles = Vec::new();
        for _ in 0..(SLOTS_PER_ARENA + 8) {
            let (h, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()).unwrap();
            handles.push(h);
        }
        assert!(handles.iter().any(|h| h.arena_idx() > 0));
        for h in handles {
            free_slot(h);
        }
    }

    /// Spawns many short-lived threads, each allocating and freeing exactly
    /// one slot. `MAX_THREADS` bounds the global bitmap, so if a dying
    /// thread's index were never released back for adoption, this loop would
    /// start returning `ThreadPoolExhausted` well before it completes.
    /// Running past `MAX_THREADS` iterations is itself the proof that thread
    /// ids (and the arenas their contexts own) are being recycled.
    #[test]
    fn thread_ids_are_recycled_across_thread_exit() {
        for i in 0..(MAX_THREADS + 64) {
            std::thread::spawn(move || {
                let (h, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut())
                    .unwrap_or_else(|e| panic!("iteration {i} failed to allocate: {e}"));
                free_slot(h);
            })
            .join()
            .unwrap();
        }
    }

    #[test]
    fn freed_slots_from_another_thread_are_batch_stolen() {
        let (h, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()).unwrap();
        let handle_bits = h.0;
        std::thread::spawn(move || {
            free_slot(Handle::from_raw(handle_bits));
        })
        .join()
        .unwrap();

        // The freeing thread pushed onto the owning arena's shared stack;
        // the owner's next allocation must batch-steal it back.
        let (h2, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()).unwrap();
        free_slot(h2);
    }

    /// Drives a thread through `maybe_reclaim`'s retire path: serial
    /// alloc-then-free across two full arenas' worth of slots means the
    /// first arena gets fully drained, batch-stolen back, and (once it's no
    /// longer the local stack's source) retired and `madvise`'d while its
    /// own thread keeps allocating. If retirement ran while any of its
    /// slots were still linked on a reachable free-stack, the corrupted
    /// `next_handle` chain would eventually resolve to the sentinel slot.
    #[test]
    fn reclaimed_arena_never_resurfaces_the_sentinel_slot() {
        let mut saw_arena_zero = false;
        for i in 0..(2 * SLOTS_PER_ARENA) {
            let (h, _) = make_version(ptr::null_mut(), ptr::null_mut(), ptr::null_mut())
                .unwrap_or_else(|e| panic!("iteration {i} failed to allocate: {e}"));
            assert_ne!(h.slot_idx(), 0, "iteration {i} handed out the sentinel slot");
            saw_arena_zero |= h.arena_idx() == 0;
            free_slot(h);
        }
        assert!(saw_arena_zero, "test never actually exercised arena 0");
    }
}

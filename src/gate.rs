// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The public gate: one or more control blocks naming the current version of
//! a shared `T`, plus the generic `Version`/`VersionBox` wrappers that turn
//! the type-erased core into an ordinary owned-value API.
//!
//! Freeing follows plain Rust ownership: [`VersionBox::drop`] and
//! [`Version::drop`] are the only places a payload is ever reconstituted from
//! its erased `*mut ()` and dropped, and each is generic over the caller's
//! `T` — the non-generic core (`arena`, `version`, `control`) only ever moves
//! raw pointers around and reports, via a `bool`, whether *this* call is the
//! one that won the right to free.

use crate::arena;
use crate::config::MAX_CONTROL_BLOCKS;
use crate::control::{ControlBlock, ControlWord};
use crate::error::{GateError, Result};
use crate::handle::Handle;
use std::marker::PhantomData;
use std::ops::Deref;

/// Type-erased gate state: a boxed slice of control blocks. Never generic,
/// since a gate's control blocks are reached by raw pointer from every
/// version it has ever installed (`Version::gate` in `version.rs`), and that
/// back-link has to type-check regardless of which `Gate<T>` wraps it.
pub(crate) struct GateInner {
    controls: Box<[ControlBlock]>,
}

/// A reader-safe atomic snapshot gate over `T`.
///
/// Wraps one or more independent control blocks (`1 + extra_slots`), each
/// naming its own current version of `T`. Readers call [`Gate::acquire`];
/// writers call [`Gate::make_version`] followed by [`Gate::exchange`] or
/// [`Gate::compare_exchange`].
pub struct Gate<T: Send + Sync> {
    inner: Box<GateInner>,
    _marker: PhantomData<T>,
}

// SAFETY: GateInner holds only atomics and is freely shared; `T: Send + Sync`
// is required on the wrapper precisely because values cross thread
// boundaries through acquire/exchange.
unsafe impl<T: Send + Sync> Send for Gate<T> {}
unsafe impl<T: Send + Sync> Sync for Gate<T> {}

impl<T: Send + Sync> Gate<T> {
    /// Builds a gate with `1 + extra_slots` independent control blocks, each
    /// initially empty (no version installed; `acquire` on an empty slot
    /// returns `None` until the first `exchange`/`compare_exchange`).
    pub fn new(extra_slots: usize) -> Result<Self> {
        let slot_count = extra_slots
            .checked_add(1)
            .filter(|n| *n <= MAX_CONTROL_BLOCKS)
            .ok_or(GateError::TooManyControlBlocks(extra_slots))?;

        let controls: Box<[ControlBlock]> = (0..slot_count)
            .map(|_| ControlBlock::new(Handle::NULL))
            .collect();

        Ok(Gate {
            inner: Box::new(GateInner { controls }),
            _marker: PhantomData,
        })
    }

    /// Number of independent control blocks this gate manages.
    pub fn slot_count(&self) -> usize {
        self.inner.controls.len()
    }

    fn gate_ptr(&self) -> *mut GateInner {
        self.inner.as_ref() as *const GateInner as *mut GateInner
    }

    /// Allocates a fresh version slot holding `object`, not yet visible to any
    /// reader. Returns `None` if the per-thread arena allocator is exhausted
    /// (every thread-id slot in the global directory occupied).
    pub fn make_version(&self, object: T) -> Option<VersionBox<T>> {
        let object_ptr = Box::into_raw(Box::new(object)) as *mut ();
        match arena::make_version(object_ptr, std::ptr::null_mut(), self.gate_ptr()) {
            Ok((handle, _slot)) => Some(VersionBox {
                handle,
                _marker: PhantomData,
            }),
            Err(e) => {
                // SAFETY: object_ptr was just produced by Box::into_raw above
                // and has not been handed to any slot, so reclaiming it here
                // is the sole owner reclaiming its own allocation.
                drop(unsafe { Box::from_raw(object_ptr as *mut T) });
                log::warn!("vgate: make_version failed: {e}");
                None
            }
        }
    }

    /// Records one more reader against whichever version `slot_idx` currently
    /// names. Returns `None` if that slot has never had a version installed,
    /// or if `slot_idx` is out of range.
    pub fn acquire(&self, slot_idx: usize) -> Option<Version<T>> {
        let cb = self.inner.controls.get(slot_idx)?;
        let handle = cb.acquire();
        if handle.is_null() {
            return None;
        }
        Some(Version {
            handle,
            _marker: PhantomData,
        })
    }

    /// Unconditionally installs `new_version` into `slot_idx`, displacing
    /// whatever was there. The displaced version is detached and, if this
    /// call wins the resulting finalize race, freed inline.
    ///
    /// # Panics
    /// Panics if `slot_idx >= self.slot_count()`.
    pub fn exchange(&self, slot_idx: usize, new_version: VersionBox<T>) {
        let new_handle = new_version.handle;
        std::mem::forget(new_version);
        let displaced = self.inner.controls[slot_idx].exchange(new_handle);
        self.retire(displaced);
    }

    /// Installs `new_version` into `slot_idx` only if it still names
    /// `expected`. On success, the displaced version is retired exactly as in
    /// [`Gate::exchange`]. On failure, ownership of `new_version` is handed
    /// back to the caller untouched.
    ///
    /// # Panics
    /// Panics if `slot_idx >= self.slot_count()`.
    pub fn compare_exchange(
        &self,
        slot_idx: usize,
        expected: &Version<T>,
        new_version: VersionBox<T>,
    ) -> std::result::Result<(), VersionBox<T>> {
        let new_handle = new_version.handle;
        match self.inner.controls[slot_idx].compare_exchange(expected.handle, new_handle) {
            Ok(displaced) => {
                std::mem::forget(new_version);
                self.retire(displaced);
                Ok(())
            }
            Err(_) => Err(new_version),
        }
    }

    fn retire(&self, displaced: ControlWord) {
        let handle = displaced.handle();
        if handle.is_null() {
            // Nothing was ever installed here; the outer refcount in
            // `displaced` only ever counted acquires against an empty slot,
            // which returned `None` and released nothing to balance.
            return;
        }
        let slot = arena::resolve(handle);
        if slot.detach(displaced.outer()) {
            let object = slot.object();
            if !object.is_null() {
                // SAFETY: this call won the one-shot FINALIZED transition for
                // `handle`; no other caller will ever reconstruct a `Box<T>`
                // from this pointer.
                drop(unsafe { Box::from_raw(object as *mut T) });
            }
            arena::free_slot(handle);
        }
    }
}

impl<T: Send + Sync> Drop for Gate<T> {
    /// The Rust analog of the C API's `destroy_gate`: null-exchanges every
    /// control block so whatever version each currently names is detached
    /// and, assuming the caller has already ensured no reader or writer still
    /// references this gate (the same precondition `destroy_gate` documents),
    /// retired right here.
    fn drop(&mut self) {
        for cb in self.inner.controls.iter() {
            let displaced = cb.exchange(Handle::NULL);
            self.retire(displaced);
        }
    }
}

/// An allocated version not yet visible to any reader. Dropping one that was
/// never installed via [`Gate::exchange`]/[`Gate::compare_exchange`] frees
/// both the payload and the slot.
pub struct VersionBox<T: Send + Sync> {
    handle: Handle,
    _marker: PhantomData<T>,
}

// SAFETY: a VersionBox owns its payload exclusively until installed; the
// payload itself must be Send + Sync for the whole gate API to be sound.
unsafe impl<T: Send + Sync> Send for VersionBox<T> {}
unsafe impl<T: Send + Sync> Sync for VersionBox<T> {}

impl<T: Send + Sync> VersionBox<T> {
    /// The payload, readable before publication.
    pub fn get(&self) -> &T {
        let slot = arena::resolve(self.handle);
        // SAFETY: this handle has never been installed on a control block,
        // so no reader can be concurrently mutating or freeing it; the
        // object pointer was populated by `Gate::make_version` and is valid
        // for the lifetime of this `VersionBox`.
        unsafe { &*(slot.object() as *const T) }
    }
}

impl<T: Send + Sync> Deref for VersionBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: Send + Sync> Drop for VersionBox<T> {
    fn drop(&mut self) {
        let slot = arena::resolve(self.handle);
        let object = slot.object();
        if !object.is_null() {
            // SAFETY: never published, so no reader holds a reference; sole
            // owner reclaiming its own allocation.
            drop(unsafe { Box::from_raw(object as *mut T) });
        }
        arena::free_slot(self.handle);
    }
}

/// An acquired reader handle on a published version. Releases on `Drop`; if
/// this release is the one that brings the version's refcount to zero after
/// it has been detached, the payload and slot are freed inline.
pub struct Version<T: Send + Sync> {
    handle: Handle,
    _marker: PhantomData<T>,
}

// SAFETY: see VersionBox.
unsafe impl<T: Send + Sync> Send for Version<T> {}
unsafe impl<T: Send + Sync> Sync for Version<T> {}

impl<T: Send + Sync> Version<T> {
    /// The payload observed at acquire time. Stable for this handle's
    /// lifetime even if a writer installs a newer version concurrently.
    pub fn get(&self) -> &T {
        let slot = arena::resolve(self.handle);
        // SAFETY: holding a live `Version<T>` means this slot's refcount is
        // bounded away from zero by our own outstanding acquire, so the
        // object pointer cannot have been freed yet.
        unsafe { &*(slot.object() as *const T) }
    }
}

impl<T: Send + Sync> Deref for Version<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: Send + Sync> Drop for Version<T> {
    fn drop(&mut self) {
        let slot = arena::resolve(self.handle);
        if slot.release() {
            let object = slot.object();
            if !object.is_null() {
                // SAFETY: this release won the FINALIZED CAS for `handle`;
                // every other acquirer has already released or never will.
                drop(unsafe { Box::from_raw(object as *mut T) });
            }
            arena::free_slot(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquiring_an_empty_slot_returns_none() {
        let gate: Gate<u64> = Gate::new(0).unwrap();
        assert!(gate.acquire(0).is_none());
    }

    #[test]
    fn acquire_out_of_range_slot_returns_none() {
        let gate: Gate<u64> = Gate::new(0).unwrap();
        assert!(gate.acquire(5).is_none());
    }

    #[test]
    fn publish_then_acquire_sees_the_installed_value() {
        let gate: Gate<u64> = Gate::new(0).unwrap();
        let v = gate.make_version(42).unwrap();
        gate.exchange(0, v);
        let acquired = gate.acquire(0).unwrap();
        assert_eq!(*acquired, 42);
    }

    #[test]
    fn exchange_retires_the_previous_version_once_all_readers_release() {
        let gate: Gate<u64> = Gate::new(0).unwrap();
        gate.exchange(0, gate.make_version(1).unwrap());
        let reader = gate.acquire(0).unwrap();
        gate.exchange(0, gate.make_version(2).unwrap());
        assert_eq!(*reader, 1);
        assert_eq!(*gate.acquire(0).unwrap(), 2);
        drop(reader);
    }

    #[test]
    fn compare_exchange_succeeds_against_matching_expected() {
        let gate: Gate<u64> = Gate::new(0).unwrap();
        gate.exchange(0, gate.make_version(1).unwrap());
        let current = gate.acquire(0).unwrap();
        let result = gate.compare_exchange(0, &current, gate.make_version(2).unwrap());
        assert!(result.is_ok());
        assert_eq!(*gate.acquire(0).unwrap(), 2);
    }

    #[test]
    fn compare_exchange_fails_and_returns_ownership_against_stale_expected() {
        let gate: Gate<u64> = Gate::new(0).unwrap();
        gate.exchange(0, gate.make_version(1).unwrap());
        let stale = gate.acquire(0).unwrap();
        gate.exchange(0, gate.make_version(2).unwrap());

        let candidate = gate.make_version(3).unwrap();
        let result = gate.compare_exchange(0, &stale, candidate);
        assert!(result.is_err());
        let returned = result.err().unwrap();
        assert_eq!(*returned, 3);
        assert_eq!(*gate.acquire(0).unwrap(), 2);
    }

    #[test]
    fn dropping_an_unpublished_version_box_frees_without_touching_any_slot() {
        let gate: Gate<String> = Gate::new(0).unwrap();
        let v = gate.make_version(String::from("unpublished")).unwrap();
        drop(v);
        assert!(gate.acquire(0).is_none());
    }

    #[test]
    fn independent_slots_hold_independent_versions() {
        let gate: Gate<u64> = Gate::new(2).unwrap();
        gate.exchange(0, gate.make_version(10).unwrap());
        gate.exchange(1, gate.make_version(20).unwrap());
        gate.exchange(2, gate.make_version(30).unwrap());
        assert_eq!(*gate.acquire(0).unwrap(), 10);
        assert_eq!(*gate.acquire(1).unwrap(), 20);
        assert_eq!(*gate.acquire(2).unwrap(), 30);
    }

    #[test]
    fn too_many_control_blocks_is_rejected() {
        let result: Result<Gate<u64>> = Gate::new(usize::MAX);
        assert!(matches!(result, Err(GateError::TooManyControlBlocks(_))));
    }
}

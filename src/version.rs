// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The version slot: a fixed 40-byte record carrying an opaque object
//! pointer, the gate it belongs to, and the dual-counter protocol that
//! decides when the object and the slot itself can be reused.
//!
//! # The `inner_state` word
//!
//! `inner_state` packs a wide release counter in the high 38 bits with two
//! flags in the low bits: `DETACHED` (this slot has been displaced from its
//! control block and will receive no further acquires) and `FINALIZED` (the
//! free callback has run, or is guaranteed to by whoever won the race). The
//! counter is strictly wider than a control block's 24-bit outer refcount, so
//! in any workload that isn't deliberately constructing a boundary (see the
//! wraparound tests below) the counter portion never approaches its own
//! modulus — the masking-into-the-outer-domain comparison below amounts to an
//! ordinary equality check against zero.
//!
//! Release is a wait-free `fetch_add` against the counter bits; detach (run
//! from `exchange`/`compare_exchange` on the displaced version) is a
//! lock-free CAS loop that debits the captured outer refcount and sets
//! `DETACHED` atomically, so a release racing the detach can never observe a
//! half-updated word. Either side that brings the masked counter to zero
//! while `DETACHED` is set wins a CAS on `FINALIZED` and runs the free
//! callback exactly once.

use crate::config::{
    INNER_COUNT_SHIFT, INNER_DETACHED_BIT, INNER_FINALIZED_BIT, TAG_BITS,
};
use crate::gate::GateInner;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Mask recovering the low `TAG_BITS` of the wide counter — the domain the
/// outer refcount itself lives in.
const OUTER_DOMAIN_MASK: u64 = (1u64 << TAG_BITS) - 1;
/// Sign bit of the `TAG_BITS`-wide signed view used to detect a masked
/// counter that reads as positive when it should read as non-positive.
const OUTER_DOMAIN_SIGN_BIT: u64 = 1u64 << (TAG_BITS - 1);

/// A single version slot. Exactly 40 bytes: five `u64`-sized fields, no
/// padding, cache-friendly when packed 16-wide into a 640-byte arena page
/// pair.
#[repr(C)]
pub(crate) struct Version {
    /// Opaque payload pointer; the core never dereferences it except to hand
    /// it to the gate's free callback at finalize time.
    object: AtomicPtr<()>,
    /// Opaque free-callback context, likewise never inspected by the core.
    free_context: AtomicPtr<()>,
    /// Gate this version belongs to. Immutable while the slot is live;
    /// rewritten by the allocating thread each time the slot is reused.
    gate: AtomicPtr<GateInner>,
    /// Wide release counter + `DETACHED`/`FINALIZED` flags. See module docs.
    inner_state: AtomicU64,
    /// This slot's own handle while live; the next free slot's handle while
    /// sitting on a free-stack. Never both at once.
    link: AtomicU64,
}

// SAFETY: Version is reached only through resolved handles behind a Gate's
// arena tables; all field access is mediated by the atomics above, which
// establish the happens-before edges real multi-threaded access requires.
unsafe impl Send for Version {}
unsafe impl Sync for Version {}

impl Version {
    pub(crate) const fn empty() -> Self {
        Version {
            object: AtomicPtr::new(std::ptr::null_mut()),
            free_context: AtomicPtr::new(std::ptr::null_mut()),
            gate: AtomicPtr::new(std::ptr::null_mut()),
            inner_state: AtomicU64::new(0),
            link: AtomicU64::new(0),
        }
    }

    /// Re-initializes a freshly allocated (or freshly reused) slot for a new
    /// live object. Only the allocating thread calls this, before the slot's
    /// own handle is ever published to a control block.
    pub(crate) fn reset_for_allocation(
        &self,
        self_handle: u64,
        object: *mut (),
        free_context: *mut (),
        gate: *mut GateInner,
    ) {
        self.object.store(object, Ordering::Relaxed);
        self.free_context.store(free_context, Ordering::Relaxed);
        self.gate.store(gate, Ordering::Relaxed);
        self.inner_state.store(0, Ordering::Relaxed);
        self.link.store(self_handle, Ordering::Release);
    }

    pub(crate) fn object(&self) -> *mut () {
        self.object.load(Ordering::Acquire)
    }

    pub(crate) fn gate(&self) -> *mut GateInner {
        self.gate.load(Ordering::Acquire)
    }

    pub(crate) fn next_handle(&self) -> u64 {
        self.link.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_handle(&self, next: u64) {
        self.link.store(next, Ordering::Release);
    }

    /// Reader release: one fewer outstanding acquire against this version.
    /// Returns `true` if this call is the one that should run the free
    /// callback (i.e. it won the `FINALIZED` CAS).
    pub(crate) fn release(&self) -> bool {
        let prev = self.inner_state.fetch_add(1u64 << INNER_COUNT_SHIFT, Ordering::Release);
        let new_raw = prev.wrapping_add(1u64 << INNER_COUNT_SHIFT);
        let masked = masked_outer_domain(new_raw);
        if masked == 0 && new_raw & INNER_DETACHED_BIT != 0 {
            self.try_finalize()
        } else {
            false
        }
    }

    /// Writer-side detach: called once, by whichever `exchange`/
    /// `compare_exchange` displaced this version, with the outer refcount
    /// that had accumulated against it. Debits the counter and sets
    /// `DETACHED` atomically. Returns `true` if this call should run the
    /// free callback.
    pub(crate) fn detach(&self, captured_outer: u32) -> bool {
        let debit = u64::from(captured_outer) << INNER_COUNT_SHIFT;
        let mut cur = self.inner_state.load(Ordering::Acquire);
        let new_raw = loop {
            let candidate = cur.wrapping_sub(debit) | INNER_DETACHED_BIT;
            match self.inner_state.compare_exchange_weak(
                cur,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break candidate,
                Err(actual) => cur = actual,
            }
        };

        let masked = masked_outer_domain(new_raw);
        // A masked residue of exactly zero covers both the common case (no
        // outer wraps occurred against this version) and the rare one (the
        // outer refcount wrapped some whole number of times while this
        // version was live): either way the true release/acquire totals
        // agree modulo the outer domain's width. A residue that reads as
        // strictly positive would mean releases outran the captured acquire
        // count, which the protocol never permits from real call sequences —
        // only a test that pokes `inner_state` directly can manufacture it.
        debug_assert!(
            !is_positive_in_outer_domain(masked),
            "inner_state counter outran its captured outer debit"
        );

        if masked == 0 {
            self.try_finalize()
        } else {
            false
        }
    }

    /// Attempts to win the one-shot `FINALIZED` transition. At most one
    /// caller across all racing `release`/`detach` calls ever gets `true`.
    fn try_finalize(&self) -> bool {
        let prev = self.inner_state.fetch_or(INNER_FINALIZED_BIT, Ordering::AcqRel);
        prev & INNER_FINALIZED_BIT == 0
    }

    #[cfg(test)]
    pub(crate) fn set_inner_state_for_test(&self, raw: u64) {
        self.inner_state.store(raw, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn inner_state_for_test(&self) -> u64 {
        self.inner_state.load(Ordering::Relaxed)
    }
}

/// Takes the wide counter's low `TAG_BITS` (the domain the outer refcount
/// itself lives in) out of a raw `inner_state` word.
fn masked_outer_domain(raw: u64) -> u64 {
    (raw >> INNER_COUNT_SHIFT) & OUTER_DOMAIN_MASK
}

/// Interprets a `TAG_BITS`-wide masked value as signed two's complement and
/// reports whether it reads as strictly positive — the signature of a result
/// that should have been non-positive but wrapped past the domain modulus.
fn is_positive_in_outer_domain(masked: u64) -> bool {
    masked != 0 && masked & OUTER_DOMAIN_SIGN_BIT == 0
}

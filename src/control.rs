// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The control block: a single 64-bit atomic naming the current version and
//! counting in-flight readers against it.
//!
//! Layout: `[outer_refcount(24) | handle(40)]`. `acquire` is a wait-free
//! fetch-add against the whole word (incrementing the refcount never touches
//! the handle bits below it); `exchange` is a wait-free swap that hands the
//! displaced word's outer refcount to the caller as a debit to settle against
//! the displaced version's `inner_state`; `compare_exchange` is a lock-free
//! CAS loop that re-reads the handle on every retry so it never succeeds
//! against a version that has already moved on.

use crate::config::HANDLE_BITS;
use crate::handle::Handle;
use std::sync::atomic::{AtomicU64, Ordering};

/// `[outer_refcount(24) | handle(40)]`, decoded view of a control block's word.
#[derive(Clone, Copy)]
pub(crate) struct ControlWord(pub(crate) u64);

impl ControlWord {
    pub(crate) fn new(outer: u32, handle: Handle) -> Self {
        ControlWord((u64::from(outer) << HANDLE_BITS) | handle.0)
    }

    pub(crate) fn handle(self) -> Handle {
        Handle::from_raw(self.0)
    }

    pub(crate) fn outer(self) -> u32 {
        (self.0 >> HANDLE_BITS) as u32
    }
}

/// A single reader/writer rendezvous point: "what's the current version, and
/// how many readers are presently looking at it."
#[repr(transparent)]
pub(crate) struct ControlBlock(AtomicU64);

impl ControlBlock {
    pub(crate) fn new(handle: Handle) -> Self {
        ControlBlock(AtomicU64::new(ControlWord::new(0, handle).0))
    }

    /// Wait-free: record one more reader against whatever version is current
    /// right now, and return which version that was.
    ///
    /// Ordering is `Acquire` so the reader's subsequent load of the resolved
    /// version's `object` pointer happens-after the writer's `exchange`/
    /// `compare_exchange` that published it.
    pub(crate) fn acquire(&self) -> Handle {
        let prev = self.0.fetch_add(1u64 << HANDLE_BITS, Ordering::Acquire);
        ControlWord(prev).handle()
    }

    /// Wait-free: install `new_handle` unconditionally and return the
    /// displaced word (handle + the outer refcount accumulated against it),
    /// which the caller debits from the displaced version's `inner_state`.
    pub(crate) fn exchange(&self, new_handle: Handle) -> ControlWord {
        let prev = self
            .0
            .swap(ControlWord::new(0, new_handle).0, Ordering::AcqRel);
        ControlWord(prev)
    }

    /// Lock-free: install `new_handle` only if the control block still names
    /// `expected`. Retries against a refreshed outer refcount on spurious CAS
    /// failure, but never against a stale handle: a concurrent `acquire` bumps
    /// the refcount without changing the handle bits, so it alone cannot make
    /// this call wrongly succeed or wrongly fail.
    pub(crate) fn compare_exchange(&self, expected: Handle, new_handle: Handle) -> Result<ControlWord, Handle> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let cur_word = ControlWord(cur);
            if cur_word.handle() != expected {
                return Err(cur_word.handle());
            }
            let new_word = ControlWord::new(0, new_handle).0;
            match self
                .0
                .compare_exchange_weak(cur, new_word, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(cur_word),
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn load_handle(&self) -> Handle {
        ControlWord(self.0.load(Ordering::Acquire)).handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_bumps_outer_without_disturbing_handle() {
        let h = Handle::new(1, 2, 3);
        let cb = ControlBlock::new(h);
        assert_eq!(cb.acquire(), h);
        assert_eq!(cb.acquire(), h);
        let word = ControlWord(cb.0.load(Ordering::Acquire));
        assert_eq!(word.outer(), 2);
        assert_eq!(word.handle(), h);
    }

    #[test]
    fn exchange_returns_displaced_word_with_accumulated_outer() {
        let h0 = Handle::new(1, 1, 1);
        let h1 = Handle::new(2, 2, 2);
        let cb = ControlBlock::new(h0);
        cb.acquire();
        cb.acquire();
        cb.acquire();
        let displaced = cb.exchange(h1);
        assert_eq!(displaced.handle(), h0);
        assert_eq!(displaced.outer(), 3);
        assert_eq!(cb.load_handle(), h1);
    }

    #[test]
    fn compare_exchange_fails_against_stale_expectation() {
        let h0 = Handle::new(1, 1, 1);
        let h1 = Handle::new(2, 2, 2);
        let h2 = Handle::new(3, 3, 3);
        let cb = ControlBlock::new(h0);
        cb.exchange(h1);
        assert!(cb.compare_exchange(h0, h2).is_err());
        assert_eq!(cb.load_handle(), h1);
    }

    #[test]
    fn compare_exchange_succeeds_across_concurrent_acquires() {
        let h0 = Handle::new(1, 1, 1);
        let h1 = Handle::new(2, 2, 2);
        let cb = ControlBlock::new(h0);
        cb.acquire();
        cb.acquire();
        let result = cb.compare_exchange(h0, h1);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().outer(), 2);
        assert_eq!(cb.load_handle(), h1);
    }
}

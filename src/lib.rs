// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # vgate - lock-free atomic snapshot gate
//!
//! A reader-safe, lock-free mechanism for publishing immutable snapshots of a
//! shared value: many readers observe a stable "current version" of `T` while
//! a writer installs new versions and reclaims old ones, without readers ever
//! blocking and without a grace-period scan.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vgate::Gate;
//!
//! struct Config {
//!     timeout_ms: u64,
//! }
//!
//! fn main() {
//!     let gate: Gate<Config> = Gate::new(0).expect("gate allocation");
//!
//!     // Publish the first version.
//!     let v0 = gate.make_version(Config { timeout_ms: 100 }).unwrap();
//!     gate.exchange(0, v0);
//!
//!     // Readers acquire a stable snapshot; it stays valid even across a
//!     // concurrent exchange.
//!     let reader = gate.acquire(0).unwrap();
//!     assert_eq!(reader.timeout_ms, 100);
//!
//!     // Writer installs a new version; the old one is reclaimed once the
//!     // last reader drops its handle.
//!     let v1 = gate.make_version(Config { timeout_ms: 250 }).unwrap();
//!     gate.exchange(0, v1);
//!
//!     drop(reader);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                           Public API                                |
//! |   Gate<T> -> Version<T> (reader handle) / VersionBox<T> (writer)    |
//! +---------------------------------------------------------------------+
//! |                        Gate (control blocks)                        |
//! |   [outer_refcount(24) | handle(40)] per slot, acquire/exchange/CAS  |
//! +---------------------------------------------------------------------+
//! |                             Version                                  |
//! |   object ptr | gate back-link | inner_state (release ctr + flags)   |
//! +---------------------------------------------------------------------+
//! |                       Slot arena allocator                          |
//! |   per-thread arenas | local free-stack | MPSC batch-steal           |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Gate`] | Entry point: one or more independent control blocks over `T` |
//! | [`Version`] | A reader's acquired, stable snapshot; releases on `Drop` |
//! | [`VersionBox`] | A writer's freshly allocated, not-yet-published version |
//! | [`GateError`] | Errors from the gate's fallible constructor boundaries |
//!
//! ## Design notes
//!
//! - No grace-period scan, no hazard-pointer list walk: reclamation is driven
//!   entirely by a dual-counter protocol local to each version (see
//!   [`mod@version`]).
//! - Handles are 40-bit and never touch the allocator, heap, or a lock;
//!   resolving one is direct array indexing into a per-thread arena (see
//!   [`mod@arena`]).
//! - The free callback of a C-style API collapses into ordinary `Drop`: `T`
//!   is reconstructed from its erased pointer and dropped exactly once, by
//!   whichever `Version`/`VersionBox` drop (or gate retire) wins the
//!   underlying finalize race.
//!
//! ## See Also
//!
//! - Herlihy & Shavit, *The Art of Multiprocessor Programming* — Treiber
//!   stacks and ABA.
//! - Hart, McKenney, Brown, Walpole — *Performance of memory reclamation for
//!   lockless synchronization* (the family of techniques this protocol is a
//!   variant of).

#![warn(missing_docs)]

// Clippy: No blanket suppressions beyond what's in Cargo.toml's [lints.clippy].
// Fix issues properly or use an inline #[allow] with justification.

mod arena;
/// Compile-time tunables for handle layout and arena geometry.
pub mod config;
/// The control block: atomic `[outer_refcount | handle]` rendezvous point.
mod control;
/// Error types for the gate's fallible constructor boundaries.
mod error;
/// 40-bit slot handles and the tagged words built on top of them.
mod handle;
/// Version slots and the dual-counter reclamation protocol.
mod version;

mod gate;

pub use error::GateError;
pub use gate::{Gate, Version, VersionBox};

/// vgate version string.
pub const VERSION: &str = "0.1.0";

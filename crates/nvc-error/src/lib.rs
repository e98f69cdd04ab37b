#![forbid(unsafe_code)]
//! Error types for NvCache.
//!
//! # Error Taxonomy
//!
//! The caller-visible taxonomy is deliberately small. Cache reads and writes
//! can fail for exactly one recoverable reason: every slot is dirty and even
//! a forced flush did not yield a usable slot ([`NvcError::SlotsExhausted`]).
//! Everything else is either a backing-store transaction failure surfaced by
//! the bus layer or a configuration-time registration failure from the tick
//! scheduler.
//!
//! | Variant | Origin | Recoverable |
//! |---------|--------|-------------|
//! | `SlotsExhausted` | cache slot acquisition | yes, retry after a tick |
//! | `AtomicSpan` | strict multi-byte write | yes, split the span |
//! | `AddressRange` | backing store adapter | no, caller bug |
//! | `Bus` | serial bus transaction | depends on the bus |
//! | `WriteVerify` | read-after-write check | no, failing hardware |
//! | `TickQueueFull` | deferred dispatch queue | yes, drain and retry |
//! | `NoTimerChannel` | observer registration | no, raise the channel budget |
//! | `NoObserverSlot` | observer registration | no, raise the slot budget |
//! | `IntervalTooLong` | observer registration | no, shorten the interval |
//! | `ObserverNotFound` | observer removal | no, caller bug |
//!
//! ## Design Constraints
//!
//! - This crate depends on nothing else in the workspace, so every other
//!   crate can return [`NvcError`] without cycles.
//! - String payloads are owned (`String`); bus implementations live behind
//!   trait objects and cannot lend borrowed detail upward.
//! - Partial-failure contracts are NOT encoded in the error: a failed read
//!   leaves the output buffer populated up to the failure point, and a failed
//!   write leaves prior bytes applied. Callers needing atomicity use the
//!   strict write variant and handle `AtomicSpan`.

use thiserror::Error;

/// Unified error type for all NvCache operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NvcError {
    /// Every cache slot is dirty and a forced flush did not free one.
    ///
    /// The only recoverable error a plain read or write can return. Retry is
    /// the caller's responsibility; the operation performed no more than one
    /// forced flush before giving up.
    #[error("no cache slot available: all slots dirty and forced flush freed none")]
    SlotsExhausted,

    /// A strict (atomic) write spans more pages than the cache can hold
    /// resident at once.
    #[error("atomic write span of {needed} pages cannot be held in {capacity} slots")]
    AtomicSpan { needed: usize, capacity: usize },

    /// Byte address beyond the chip family's addressable space.
    #[error("address {address:#07x} outside the backing store address space")]
    AddressRange { address: u32 },

    /// Serial bus transaction failed.
    #[error("bus transaction failed: {0}")]
    Bus(String),

    /// Read-after-write verification found the backing store differs from
    /// the page just written.
    #[error("write verification failed for page {page}")]
    WriteVerify { page: u32 },

    /// Deferred tick queue is full; the tick notification was not enqueued.
    #[error("deferred tick queue full")]
    TickQueueFull,

    /// All hardware timer channels are allocated to other intervals.
    #[error("no timer channel available for a new interval")]
    NoTimerChannel,

    /// Every channel running at the requested interval has a full observer set.
    #[error("no observer slot free on any channel at the requested interval")]
    NoObserverSlot,

    /// Requested tick interval exceeds what the hardware timer can achieve.
    #[error("interval {requested_us} us exceeds timer maximum {max_us} us")]
    IntervalTooLong { requested_us: u128, max_us: u128 },

    /// Observer is not registered with any channel.
    #[error("observer not attached to any timer channel")]
    ObserverNotFound,
}

/// Result alias using `NvcError`.
pub type Result<T> = std::result::Result<T, NvcError>;

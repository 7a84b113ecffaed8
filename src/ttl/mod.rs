//! # TTL Module
//!
//! Absolute expiration deadlines and the clock capability that drives them.
//!
//! ## Design Invariants
//!
//! - Deadlines are absolute wall-clock milliseconds since the Unix epoch.
//! - Every key in the table is also live in the index; the engine enforces
//!   this (a TTL without a value is impossible), the table itself stays dumb.
//! - A deadline `t` is expired at time `now` iff `t <= now` — so a relative
//!   TTL of zero expires the key immediately.
//! - Expiry is detected here but *materialized* by the engine: the table
//!   never mutates on reads.
//! - The table is fully in-memory and is reconstructed on recovery from the
//!   replayed log records.
//!
//! Time is injected: the engine never calls a clock directly, it holds a
//! [`Clock`] chosen at construction. [`SystemClock`] is the production
//! implementation; [`ManualClock`] is a shared settable clock that lets
//! embedders and tests drive expiry deterministically.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Clock capability
// ------------------------------------------------------------------------------------------------

/// Source of "now", in milliseconds since the Unix epoch.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

/// Production clock over [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }
}

/// A settable clock shared between the engine and its driver.
///
/// Cloning yields a handle onto the same instant, so a test can hand one
/// clone to the engine and advance time through the other.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    /// Creates a clock frozen at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jumps the clock to an absolute instant.
    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ------------------------------------------------------------------------------------------------
// TTL Table
// ------------------------------------------------------------------------------------------------

/// Liveness of a key's deadline at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlState {
    /// No deadline armed for the key.
    NoTtl,

    /// Deadline armed and still in the future.
    Alive { remaining_ms: i64 },

    /// Deadline elapsed; the key is logically absent.
    Expired,
}

/// In-memory map of key → absolute expiration deadline.
#[derive(Debug, Default)]
pub struct TtlTable {
    deadlines: HashMap<Vec<u8>, i64>,
}

impl TtlTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the deadline for a key.
    pub fn set(&mut self, key: Vec<u8>, expires_at_ms: i64) {
        trace!(expires_at_ms, "ttl armed");
        self.deadlines.insert(key, expires_at_ms);
    }

    /// Disarms any deadline for the key. Idempotent; reports whether one was set.
    pub fn clear(&mut self, key: &[u8]) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// The armed deadline, if any.
    pub fn expires_at(&self, key: &[u8]) -> Option<i64> {
        self.deadlines.get(key).copied()
    }

    /// Classifies the key's deadline as of `now_ms`.
    pub fn check(&self, key: &[u8], now_ms: i64) -> TtlState {
        match self.deadlines.get(key) {
            None => TtlState::NoTtl,
            Some(&t) if t <= now_ms => TtlState::Expired,
            Some(&t) => TtlState::Alive {
                remaining_ms: t - now_ms,
            },
        }
    }

    /// Number of armed deadlines.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

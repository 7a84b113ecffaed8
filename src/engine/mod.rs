//! # Storage Engine
//!
//! The orchestrator of the store: one append-only [`Log`], one B+ tree
//! [`Index`], one [`TtlTable`], and an optional [`TxBuffer`] overlay, composed
//! into a crash-safe, single-client key–value engine.
//!
//! ## Design Overview
//!
//! Reads consult the transaction overlay (when one is active) before the base
//! index, and resolve TTLs lazily. Writes either go straight through the
//! write-ahead path or stage into the overlay:
//!
//! ```text
//!             ┌──────────────────────────────────────────┐
//!             │                 Engine                   │
//!  command ──►│  ┌───────────┐   ┌─────────┐  ┌───────┐  │
//!             │  │ TxBuffer  │──►│  Index  │  │  TTL  │  │
//!             │  │ (overlay) │   │ (B+tree)│  │ table │  │
//!             │  └─────┬─────┘   └────▲────┘  └───▲───┘  │
//!             │        │ commit       │ replay    │      │
//!             │        ▼              │           │      │
//!             │  ┌───────────────────────────────────┐   │
//!             │  │        append-only Log (disk)     │   │
//!             │  └───────────────────────────────────┘   │
//!             └──────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Write-ahead durability:** every mutation is appended and flushed to the
//!   log *before* the index or TTL table changes; a failed append leaves the
//!   in-memory state untouched.
//! - **Crash recovery:** [`Engine::open`] truncates any torn log tail and
//!   replays the surviving records, reproducing the exact state after the last
//!   successful commit or non-transactional write.
//! - **Transaction atomicity:** COMMIT appends the whole journal as one batch
//!   with a single flush; a crash mid-commit leaves a torn tail that the next
//!   open erases wholesale, so no partial transaction is ever visible.
//! - **Lazy expiry:** an elapsed deadline is materialized on first access as a
//!   synthetic DEL — logged first, then removed from index and TTL — so replay
//!   stays deterministic and repeated materialization is harmless.
//!
//! ## Concurrency Model
//!
//! Single-threaded and single-client by contract: commands arrive one at a
//! time and each completes before the next is read. The engine therefore owns
//! its state exclusively through `&mut self` — there is no interior locking.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::index::Index;
use crate::log::{Log, LogError, LogRecord};
use crate::ttl::{Clock, SystemClock, TtlState, TtlTable};
use crate::tx::{Shadow, TxBuffer};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// `ttl()` result when the key carries no deadline.
pub const TTL_NONE: i64 = -1;

/// `ttl()` result when the key is absent or expired.
pub const TTL_ABSENT: i64 = -2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the log subsystem.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// BEGIN issued while a transaction is already active.
    #[error("nested transactions not supported")]
    TransactionActive,

    /// COMMIT or ABORT issued with no transaction active.
    #[error("no active transaction")]
    NoTransaction,
}

// ------------------------------------------------------------------------------------------------
// Engine Core
// ------------------------------------------------------------------------------------------------

/// The storage engine handle.
///
/// Owns the log file for the process lifetime and every in-memory structure
/// derived from it. All operations take `&mut self`; see the
/// [module-level documentation](self) for the concurrency contract.
pub struct Engine {
    /// Authoritative durable state.
    log: Log,

    /// Live keys in lexicographic order.
    index: Index,

    /// Absolute expiration deadlines.
    ttl: TtlTable,

    /// Injected time source.
    clock: Box<dyn Clock>,

    /// Overlay for the active transaction, if any.
    tx: Option<TxBuffer>,
}

impl Engine {
    /// Opens (or creates) an engine over the log file at `path`, using the
    /// system wall clock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        Self::open_with_clock(path, Box::new(SystemClock))
    }

    /// Opens (or creates) an engine with an injected clock.
    ///
    /// # Behavior
    /// - Opening the log applies tail recovery (torn trailing records are
    ///   truncated; non-tail corruption and unknown tags are fatal).
    /// - Every surviving record is replayed into the index and TTL table
    ///   without re-logging.
    /// - Elapsed deadlines are *not* eagerly materialized; the first access to
    ///   each such key does it. This keeps open fast.
    pub fn open_with_clock<P: AsRef<Path>>(
        path: P,
        clock: Box<dyn Clock>,
    ) -> Result<Self, EngineError> {
        // 1. Open the log; rule R1 tail recovery happens here.
        let log = Log::open(path)?;

        let mut engine = Self {
            log,
            index: Index::new(),
            ttl: TtlTable::new(),
            clock,
            tx: None,
        };

        // 2. Replay record-by-record. Replay and commit application share one
        //    policy so recovery reproduces exactly what the writer saw.
        let mut replayed = 0u64;
        for record in engine.log.scan()? {
            engine.apply(record?);
            replayed += 1;
        }

        info!(replayed, keys = engine.index.len(), "engine opened");
        Ok(engine)
    }

    /// Whether a transaction is active.
    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Point lookup. Returns `None` for absent, deleted, or expired keys.
    ///
    /// May materialize the key's expiry as a side effect.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let now = self.clock.now_ms();

        if let Some(tx) = &self.tx {
            match tx.entry(key) {
                Some(Shadow::Tombstone) => return Ok(None),
                Some(Shadow::Put { value, expires_at }) => {
                    if deadline_elapsed(*expires_at, now) {
                        return Ok(None);
                    }
                    return Ok(Some(value.clone()));
                }
                Some(Shadow::Ttl(pending)) => {
                    // The staged deadline supersedes the base TTL; nothing is
                    // durable yet, so an elapsed pending deadline reads as
                    // absent without materialization.
                    if deadline_elapsed(*pending, now) {
                        return Ok(None);
                    }
                    return Ok(self.index.get(key).map(<[u8]>::to_vec));
                }
                None => {}
            }
        }

        self.materialize_if_expired(key)?;
        Ok(self.index.get(key).map(<[u8]>::to_vec))
    }

    /// Multi-key lookup; result order matches `keys`.
    pub fn mget(&mut self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Remaining lifetime of a key in milliseconds, [`TTL_NONE`] when no
    /// deadline is armed, [`TTL_ABSENT`] when the key is absent or expired.
    pub fn ttl(&mut self, key: &[u8]) -> Result<i64, EngineError> {
        let now = self.clock.now_ms();

        if let Some(shadow) = self.tx.as_ref().and_then(|tx| tx.entry(key)) {
            let code = match shadow {
                Shadow::Tombstone => TTL_ABSENT,
                Shadow::Put { expires_at, .. } => deadline_code(*expires_at, now),
                Shadow::Ttl(pending) => deadline_code(*pending, now),
            };
            return Ok(code);
        }

        self.materialize_if_expired(key)?;
        if !self.index.contains(key) {
            return Ok(TTL_ABSENT);
        }
        Ok(match self.ttl.check(key, now) {
            TtlState::NoTtl => TTL_NONE,
            TtlState::Alive { remaining_ms } => remaining_ms,
            TtlState::Expired => TTL_ABSENT,
        })
    }

    /// Live keys with `lo <= key <= hi`, ascending. Either bound may be open.
    ///
    /// Expired keys encountered by the scan are materialized; with a
    /// transaction active the overlay is merge-joined over the base keys.
    pub fn range(
        &mut self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<Vec<u8>>, EngineError> {
        let now = self.clock.now_ms();

        let mut live: Vec<Vec<u8>> = Vec::new();
        let mut dead: Vec<Vec<u8>> = Vec::new();

        for (key, _value) in self.index.range(lo, hi) {
            if self.tx.as_ref().is_some_and(|tx| tx.entry(key).is_some()) {
                // The overlay owns this key's fate — its base TTL must not be
                // materialized out from under a staged override.
                live.push(key.to_vec());
                continue;
            }
            match self.ttl.check(key, now) {
                TtlState::Expired => dead.push(key.to_vec()),
                _ => live.push(key.to_vec()),
            }
        }

        for key in &dead {
            self.materialize_expiry(key)?;
        }

        let Some(tx) = &self.tx else {
            return Ok(live);
        };

        // Merge-join the sorted base keys with the sorted overlay view: the
        // overlay wins collisions and contributes pending puts of its own.
        let mut merged = Vec::with_capacity(live.len());
        let mut base_iter = live.into_iter();
        let mut overlay_iter = tx.range_entries(lo, hi);
        let mut base = base_iter.next();
        let mut overlay = overlay_iter.next();

        loop {
            match (base.take(), overlay.take()) {
                (Some(bk), Some((ok, os))) => match bk.as_slice().cmp(ok.as_slice()) {
                    Ordering::Less => {
                        merged.push(bk);
                        base = base_iter.next();
                        overlay = Some((ok, os));
                    }
                    Ordering::Greater => {
                        if shadow_is_live(os, now) {
                            merged.push(ok.clone());
                        }
                        base = Some(bk);
                        overlay = overlay_iter.next();
                    }
                    Ordering::Equal => {
                        if shadow_is_live(os, now) {
                            merged.push(bk);
                        }
                        base = base_iter.next();
                        overlay = overlay_iter.next();
                    }
                },
                (Some(bk), None) => {
                    merged.push(bk);
                    base = base_iter.next();
                }
                (None, Some((ok, os))) => {
                    if shadow_is_live(os, now) {
                        merged.push(ok.clone());
                    }
                    overlay = overlay_iter.next();
                }
                (None, None) => break,
            }
        }

        Ok(merged)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Bind a key to a value, cancelling any prior deadline.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        if let Some(tx) = &mut self.tx {
            tx.stage_set(key, value);
            return Ok(());
        }

        // 1. Log first (crash safety)
        self.log.append(&LogRecord::Set {
            key: key.clone(),
            value: value.clone(),
        })?;

        // 2. In-memory update
        self.ttl.clear(&key);
        self.index.put(key, value);
        Ok(())
    }

    /// Bind several keys in order, all-or-nothing with respect to durability:
    /// one batched append, then the in-memory updates.
    pub fn mset(&mut self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), EngineError> {
        if let Some(tx) = &mut self.tx {
            for (key, value) in pairs {
                tx.stage_set(key, value);
            }
            return Ok(());
        }

        let records: Vec<LogRecord> = pairs
            .iter()
            .map(|(key, value)| LogRecord::Set {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        // 1. Log first (crash safety) — the whole batch, one flush.
        self.log.append_batch(&records)?;

        // 2. In-memory updates in the given order.
        for (key, value) in pairs {
            self.ttl.clear(&key);
            self.index.put(key, value);
        }
        Ok(())
    }

    /// Remove a key. Returns `true` when something was deleted.
    pub fn del(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        let now = self.clock.now_ms();
        if !self.is_visible(key, now)? {
            return Ok(false);
        }

        if let Some(tx) = &mut self.tx {
            tx.stage_del(key.to_vec());
            return Ok(true);
        }

        // 1. Log first (crash safety)
        self.log.append(&LogRecord::Del { key: key.to_vec() })?;

        // 2. In-memory update
        self.index.delete(key);
        self.ttl.clear(key);
        Ok(true)
    }

    /// Arm a deadline `rel_ms` milliseconds from now. Returns `false` when the
    /// key is absent or already expired.
    pub fn expire(&mut self, key: &[u8], rel_ms: i64) -> Result<bool, EngineError> {
        let now = self.clock.now_ms();
        if !self.is_visible(key, now)? {
            return Ok(false);
        }

        let expires_at_ms = now.saturating_add(rel_ms);

        if let Some(tx) = &mut self.tx {
            tx.stage_expire(key.to_vec(), expires_at_ms);
            return Ok(true);
        }

        // 1. Log first (crash safety)
        self.log.append(&LogRecord::ExpireAt {
            key: key.to_vec(),
            expires_at_ms,
        })?;

        // 2. In-memory update
        self.ttl.set(key.to_vec(), expires_at_ms);
        Ok(true)
    }

    /// Disarm a key's deadline. Returns `true` only when a deadline was armed.
    pub fn persist(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        let now = self.clock.now_ms();
        if !self.is_visible(key, now)? {
            return Ok(false);
        }

        // The overlay's pending TTL action supersedes the base table.
        let armed = match self.tx.as_ref().and_then(|tx| tx.entry(key)) {
            Some(Shadow::Put { expires_at, .. }) => expires_at.is_some(),
            Some(Shadow::Ttl(pending)) => pending.is_some(),
            Some(Shadow::Tombstone) => false,
            None => matches!(self.ttl.check(key, now), TtlState::Alive { .. }),
        };
        if !armed {
            return Ok(false);
        }

        if let Some(tx) = &mut self.tx {
            tx.stage_persist(key.to_vec());
            return Ok(true);
        }

        // 1. Log first (crash safety)
        self.log.append(&LogRecord::Persist { key: key.to_vec() })?;

        // 2. In-memory update
        self.ttl.clear(key);
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Start a transaction: subsequent writes stage into the overlay until
    /// COMMIT or ABORT.
    pub fn begin(&mut self) -> Result<(), EngineError> {
        if self.tx.is_some() {
            return Err(EngineError::TransactionActive);
        }
        debug!("transaction begun");
        self.tx = Some(TxBuffer::new());
        Ok(())
    }

    /// Atomically apply the active transaction.
    ///
    /// # Behavior
    /// 1. The whole journal is appended as one batch with a single flush.
    /// 2. Only on success is each record applied in issue order to index + TTL.
    /// 3. The overlay is dropped and the engine leaves transaction mode.
    ///
    /// On append failure the overlay is **retained**: the client may retry
    /// COMMIT or issue ABORT, and no in-memory state has changed.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        let Some(tx) = &self.tx else {
            return Err(EngineError::NoTransaction);
        };

        // 1. Durability first.
        self.log.append_batch(tx.journal())?;

        // 2. Visibility second, in issue order.
        let journal = self
            .tx
            .take()
            .map(TxBuffer::into_journal)
            .unwrap_or_default();
        let records = journal.len();
        for record in journal {
            self.apply(record);
        }

        debug!(records, "transaction committed");
        Ok(())
    }

    /// Discard the active transaction. Durable state is untouched.
    pub fn abort(&mut self) -> Result<(), EngineError> {
        match self.tx.take() {
            Some(tx) => {
                debug!(discarded = tx.len(), "transaction aborted");
                Ok(())
            }
            None => Err(EngineError::NoTransaction),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Applies one record to the in-memory structures without logging it.
    /// Shared by recovery replay and commit application.
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Set { key, value } => {
                // SET always cancels a prior deadline: a fresh binding.
                self.ttl.clear(&key);
                self.index.put(key, value);
            }
            LogRecord::Del { key } => {
                self.index.delete(&key);
                self.ttl.clear(&key);
            }
            LogRecord::ExpireAt {
                key,
                expires_at_ms,
            } => {
                // Stale deadlines for absent keys are ignored.
                if self.index.contains(&key) {
                    self.ttl.set(key, expires_at_ms);
                }
            }
            LogRecord::Persist { key } => {
                self.ttl.clear(&key);
            }
        }
    }

    /// Whether `key` currently reads as present, overlay included. Falls back
    /// to the base index after materializing an elapsed base deadline.
    fn is_visible(&mut self, key: &[u8], now: i64) -> Result<bool, EngineError> {
        let staged = self
            .tx
            .as_ref()
            .and_then(|tx| tx.entry(key))
            .map(|shadow| shadow_is_live(shadow, now));

        match staged {
            Some(live) => Ok(live),
            None => {
                self.materialize_if_expired(key)?;
                Ok(self.index.contains(key))
            }
        }
    }

    /// Materializes the key's expiry iff its base deadline has elapsed.
    fn materialize_if_expired(&mut self, key: &[u8]) -> Result<(), EngineError> {
        let now = self.clock.now_ms();
        if matches!(self.ttl.check(key, now), TtlState::Expired) {
            self.materialize_expiry(key)?;
        }
        Ok(())
    }

    /// Turns an elapsed deadline into durable absence: synthetic DEL to the
    /// log first, then index and TTL removal. Idempotent — a repeat finds the
    /// key already gone.
    fn materialize_expiry(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.log.append(&LogRecord::Del { key: key.to_vec() })?;
        self.index.delete(key);
        self.ttl.clear(key);
        debug!("expired key materialized");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Deadline helpers
// ------------------------------------------------------------------------------------------------

/// Whether an optional deadline has elapsed as of `now_ms`.
fn deadline_elapsed(deadline: Option<i64>, now_ms: i64) -> bool {
    deadline.is_some_and(|t| t <= now_ms)
}

/// Encodes an optional deadline as a `ttl()` result.
fn deadline_code(deadline: Option<i64>, now_ms: i64) -> i64 {
    match deadline {
        None => TTL_NONE,
        Some(t) if t <= now_ms => TTL_ABSENT,
        Some(t) => t - now_ms,
    }
}

/// Whether a staged overlay effect leaves the key readable.
fn shadow_is_live(shadow: &Shadow, now_ms: i64) -> bool {
    match shadow {
        Shadow::Put { expires_at, .. } => !deadline_elapsed(*expires_at, now_ms),
        Shadow::Tombstone => false,
        Shadow::Ttl(pending) => !deadline_elapsed(*pending, now_ms),
    }
}

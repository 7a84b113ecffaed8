//! # OrdoDB
//!
//! An embedded, single-process, **ordered** key–value store with durable
//! append-only persistence, millisecond-granularity TTLs, atomic single-client
//! transactions, multi-key batch operations, and lexicographic range scans.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Engine                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌───────────────┐   │
//! │  │  B+ tree    │  │  TTL table  │  │  Transaction  │   │
//! │  │  Index      │  │  (deadlines)│  │  overlay      │   │
//! │  └──────▲──────┘  └──────▲──────┘  └───────┬───────┘   │
//! │         │   replay       │   replay        │ commit    │
//! │  ┌──────┴────────────────┴─────────────────▼───────┐   │
//! │  │           append-only Log (data.db)             │   │
//! │  └─────────────────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core engine — open/recover, reads, writes, scans, transactions |
//! | [`log`] | Durable append-only record stream with torn-tail recovery |
//! | [`index`] | In-memory B+ tree over live keys with linked-leaf range scans |
//! | [`ttl`] | Expiration deadlines and the injected clock capability |
//! | [`tx`] | Transaction overlay — journal plus coalescing shadow map |
//! | [`repl`] | Line-oriented command shell over the engine |
//!
//! ## Key Properties
//!
//! - **Write-ahead logging** — every mutation is flushed to the log before it
//!   becomes visible, so recovery replay reproduces the exact durable state.
//! - **Ordered scans** — keys live in a B+ tree whose leaves are chained in
//!   lexicographic order; `RANGE` is one descent plus a linear walk.
//! - **Lazy expiry** — elapsed deadlines are materialized as synthetic `DEL`
//!   records on first access, keeping replay deterministic with no background
//!   sweeper.
//! - **Atomic transactions** — a transaction's journal lands in the log as one
//!   batch with a single flush; torn commit tails are erased on the next open.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ordodb::engine::Engine;
//!
//! let mut engine = Engine::open("/tmp/my.db").unwrap();
//!
//! // Write / read
//! engine.set(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // TTL
//! engine.expire(b"hello", 5_000).unwrap();
//! assert!(engine.ttl(b"hello").unwrap() > 0);
//!
//! // Ordered scan
//! engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
//! engine.set(b"b".to_vec(), b"2".to_vec()).unwrap();
//! let keys = engine.range(Some(b"a"), Some(b"b")).unwrap();
//! assert_eq!(keys.len(), 2);
//!
//! // Transaction
//! engine.begin().unwrap();
//! engine.set(b"x".to_vec(), b"1".to_vec()).unwrap();
//! engine.commit().unwrap();
//! ```

pub mod engine;
pub mod index;
pub mod log;
pub mod repl;
pub mod ttl;
pub mod tx;

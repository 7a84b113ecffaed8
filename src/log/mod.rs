//! Append-Only Log Module
//!
//! This module implements the **durable**, **append-only** record log that is the
//! authoritative state of the store. Every state-changing event is persisted as one
//! self-describing record line before the corresponding in-memory mutation is applied,
//! and on startup the log is replayed in order to rebuild the index and TTL table.
//!
//! ## Design Overview
//!
//! The log is a plain text file of newline-terminated records, one record per line,
//! whitespace-separated tokens. Keys and values are single tokens at this layer — no
//! embedded spaces, tabs, or newlines; callers that need richer encodings must escape
//! before appending.
//!
//! # On-disk layout
//!
//! ```text
//! SET <key> <value>\n
//! DEL <key>\n
//! EXPIREAT <key> <expires_at_ms>\n
//! PERSIST <key>\n
//! ...
//! ```
//!
//! # Recovery
//!
//! [`Log::open`] scans the file start-to-end and truncates malformed *trailing*
//! content — a final line missing its terminator, or a malformed final record — back
//! to the last valid record boundary. This makes [`Log::append_batch`] atomic with
//! respect to crash: a commit either lands all its lines or its partial tail is
//! erased on the next open. A malformed record that is **not** at the tail, or an
//! unrecognized record tag anywhere, is fatal at open.
//!
//! # Guarantees
//!
//! - **Durability:** Every `append()` is followed by an `fsync()` via [`File::sync_all`].
//! - **Batch atomicity:** `append_batch()` writes all lines contiguously and syncs once;
//!   torn tails are discarded during recovery.
//! - **Replay order:** [`Log::scan`] yields records in exact file order.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A complete record before the tail failed to parse.
    #[error("corrupt record at byte offset {offset}")]
    Corrupt { offset: u64 },

    /// A record carried a tag this version does not recognize.
    #[error("unrecognized record tag {0:?}")]
    UnknownTag(String),
}

/// Why a single record line failed to parse.
///
/// [`UnknownTag`](RecordParseError::UnknownTag) is fatal wherever it occurs (the file
/// was written by an incompatible version); [`Malformed`](RecordParseError::Malformed)
/// is recoverable at the tail (torn write) and fatal elsewhere.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordParseError {
    /// Wrong token count or unparsable integer field.
    Malformed,

    /// First token is not a known record tag.
    UnknownTag(String),
}

// ------------------------------------------------------------------------------------------------
// Record type
// ------------------------------------------------------------------------------------------------

/// A single logged state-changing event.
///
/// Records are appended to the log, replayed during recovery, and buffered in the
/// transaction journal. Together they form a complete, replayable history of the
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Bind a key to a value (and cancel any prior TTL).
    Set { key: Vec<u8>, value: Vec<u8> },

    /// Remove a key (explicit delete or materialized expiry).
    Del { key: Vec<u8> },

    /// Arm an absolute expiration deadline, in milliseconds since the Unix epoch.
    ExpireAt { key: Vec<u8>, expires_at_ms: i64 },

    /// Disarm any expiration deadline.
    Persist { key: Vec<u8> },
}

impl LogRecord {
    /// Appends this record's line encoding (terminator included) to `buf`.
    pub fn encode_line(&self, buf: &mut Vec<u8>) {
        match self {
            LogRecord::Set { key, value } => {
                buf.extend_from_slice(b"SET ");
                buf.extend_from_slice(key);
                buf.push(b' ');
                buf.extend_from_slice(value);
            }
            LogRecord::Del { key } => {
                buf.extend_from_slice(b"DEL ");
                buf.extend_from_slice(key);
            }
            LogRecord::ExpireAt {
                key,
                expires_at_ms,
            } => {
                buf.extend_from_slice(b"EXPIREAT ");
                buf.extend_from_slice(key);
                buf.push(b' ');
                buf.extend_from_slice(expires_at_ms.to_string().as_bytes());
            }
            LogRecord::Persist { key } => {
                buf.extend_from_slice(b"PERSIST ");
                buf.extend_from_slice(key);
            }
        }
        buf.push(b'\n');
    }

    /// Parses one record from a line (terminator already stripped).
    pub fn parse_line(line: &[u8]) -> Result<Self, RecordParseError> {
        let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());

        let tag = tokens.next().ok_or(RecordParseError::Malformed)?;
        let record = match tag {
            b"SET" => LogRecord::Set {
                key: tokens.next().ok_or(RecordParseError::Malformed)?.to_vec(),
                value: tokens.next().ok_or(RecordParseError::Malformed)?.to_vec(),
            },
            b"DEL" => LogRecord::Del {
                key: tokens.next().ok_or(RecordParseError::Malformed)?.to_vec(),
            },
            b"EXPIREAT" => {
                let key = tokens.next().ok_or(RecordParseError::Malformed)?.to_vec();
                let ms = tokens.next().ok_or(RecordParseError::Malformed)?;
                let ms = std::str::from_utf8(ms)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(RecordParseError::Malformed)?;
                LogRecord::ExpireAt {
                    key,
                    expires_at_ms: ms,
                }
            }
            b"PERSIST" => LogRecord::Persist {
                key: tokens.next().ok_or(RecordParseError::Malformed)?.to_vec(),
            },
            other => {
                return Err(RecordParseError::UnknownTag(
                    String::from_utf8_lossy(other).into_owned(),
                ));
            }
        };

        if tokens.next().is_some() {
            return Err(RecordParseError::Malformed);
        }
        Ok(record)
    }
}

// ------------------------------------------------------------------------------------------------
// Log Core
// ------------------------------------------------------------------------------------------------

/// The append-only durable record stream.
///
/// See the [module-level documentation](self) for format, recovery, and guarantees.
/// The file handle is held exclusively for the lifetime of the engine; replay
/// iterators open their own read-only handle on the same path.
#[derive(Debug)]
pub struct Log {
    /// Writable handle, positioned at end-of-file between appends.
    file: File,

    /// Path to the log file on disk.
    path: PathBuf,
}

impl Log {
    /// Open or create a log file at the given path, applying tail recovery.
    ///
    /// # Behavior
    /// - A missing file is created empty.
    /// - An existing file is scanned start-to-end; torn trailing content is
    ///   truncated back to the last valid record boundary.
    ///
    /// # Errors
    /// - [`LogError::Corrupt`] for a malformed record that is not at the tail.
    /// - [`LogError::UnknownTag`] for a record tag from an incompatible version.
    /// - [`LogError::Io`] for filesystem failures.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path_ref)?;

        let file_len = file.metadata()?.len();
        let valid_len = scan_valid_prefix(&mut file)?;

        if valid_len < file_len {
            warn!(
                path = %path_ref.display(),
                trimmed = file_len - valid_len,
                "truncating torn log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        file.seek(SeekFrom::End(0))?;
        info!(path = %path_ref.display(), len = valid_len, "log opened");

        Ok(Self {
            file,
            path: path_ref.to_path_buf(),
        })
    }

    /// Appends a single record and forces it to durable storage before returning.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let mut buf = Vec::new();
        record.encode_line(&mut buf);

        self.file.write_all(&buf)?;
        self.file.sync_all()?;

        trace!(len = buf.len(), "log record appended");
        Ok(())
    }

    /// Appends a batch of records contiguously with exactly one flush at the end.
    ///
    /// Crash atomicity comes from tail recovery: an interrupted batch leaves a torn
    /// tail that [`Log::open`] erases, so either every line of the batch survives a
    /// crash or the partial remainder is discarded wholesale.
    pub fn append_batch(&mut self, records: &[LogRecord]) -> Result<(), LogError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            record.encode_line(&mut buf);
        }

        self.file.write_all(&buf)?;
        self.file.sync_all()?;

        debug!(records = records.len(), bytes = buf.len(), "log batch appended");
        Ok(())
    }

    /// Returns a streaming iterator over all records in file order.
    ///
    /// The iterator reads from an independent handle on the same path, so it does
    /// not disturb the append position.
    pub fn scan(&self) -> Result<LogIter, LogError> {
        debug!(path = %self.path.display(), "log replay started");

        let file = File::open(&self.path)?;
        Ok(LogIter {
            reader: BufReader::new(file),
            offset: 0,
            buf: Vec::new(),
        })
    }

    /// Get the path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, LogError> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            tracing::error!(path = %self.path.display(), error = %e, "log sync failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// LogIter
// ------------------------------------------------------------------------------------------------

/// Streaming log replay iterator.
///
/// Yields parsed [`LogRecord`]s in file order, one line at a time, without loading
/// the whole log into memory. An unterminated final line ends iteration silently:
/// [`Log::open`] has already erased torn tails, so a partial line can only appear
/// if the file was modified behind the engine's back.
pub struct LogIter {
    reader: BufReader<File>,
    offset: u64,
    buf: Vec<u8>,
}

impl std::fmt::Debug for LogIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIter")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl Iterator for LogIter {
    type Item = Result<LogRecord, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        let n = match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(n) => n,
            Err(e) => return Some(Err(LogError::Io(e))),
        };

        if n == 0 {
            trace!(offset = self.offset, "log replay reached end of file");
            return None;
        }

        if self.buf.last() != Some(&b'\n') {
            warn!(offset = self.offset, "unterminated trailing line during replay");
            return None;
        }

        let line = &self.buf[..n - 1];
        let result = match LogRecord::parse_line(line) {
            Ok(record) => Ok(record),
            Err(RecordParseError::UnknownTag(tag)) => Err(LogError::UnknownTag(tag)),
            Err(RecordParseError::Malformed) => Err(LogError::Corrupt {
                offset: self.offset,
            }),
        };

        self.offset += n as u64;
        Some(result)
    }
}

// ------------------------------------------------------------------------------------------------
// Tail recovery
// ------------------------------------------------------------------------------------------------

/// Scans the file from the start and returns the byte length of the valid record
/// prefix, rewinding conceptually to the last good newline boundary.
///
/// Tail rule: an unterminated final line is torn; a *complete* final line that is
/// malformed (wrong token count, bad integer) is trailing corruption and equally
/// truncated. A malformed complete line followed by more data, or an unrecognized
/// tag on any complete line, is fatal.
fn scan_valid_prefix(file: &mut File) -> Result<u64, LogError> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);

    let mut valid: u64 = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }

        if buf.last() != Some(&b'\n') {
            debug!(offset = valid, "unterminated final line treated as torn");
            return Ok(valid);
        }

        match LogRecord::parse_line(&buf[..n - 1]) {
            Ok(_) => valid += n as u64,
            Err(RecordParseError::UnknownTag(tag)) => {
                return Err(LogError::UnknownTag(tag));
            }
            Err(RecordParseError::Malformed) => {
                let at_eof = reader.fill_buf()?.is_empty();
                if at_eof {
                    debug!(offset = valid, "malformed final record treated as torn");
                    return Ok(valid);
                }
                return Err(LogError::Corrupt { offset: valid });
            }
        }
    }

    Ok(valid)
}

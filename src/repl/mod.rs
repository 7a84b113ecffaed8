//! # Command Shell Module
//!
//! The thin line-oriented shell around the engine: parse one command per input
//! line, invoke exactly one engine operation, write the exact response lines.
//! No algorithmic content lives here.
//!
//! ## Protocol
//!
//! Commands are whitespace-separated tokens, case-sensitive, one per line.
//! Responses are exact newline-terminated strings:
//!
//! | Command | Success response |
//! |---------|------------------|
//! | `SET k v` | `OK` |
//! | `GET k` | value or `nil` |
//! | `DEL k` | `1` / `0` |
//! | `EXPIRE k ms` | `1` / `0` |
//! | `TTL k` | remaining ms, `-1`, or `-2` |
//! | `PERSIST k` | `1` / `0` |
//! | `MSET k1 v1 k2 v2 …` | `OK` |
//! | `MGET k1 k2 …` | one value-or-`nil` line per key |
//! | `RANGE lo hi` (`-` = open bound) | matching keys, then `END` |
//! | `BEGIN` / `COMMIT` / `ABORT` | `OK` |
//!
//! Errors are a single line `ERR <tag>`: `usage` (wrong arity), `int` (bad
//! milliseconds), `tx` (transaction state), `io` (append failure), `unknown`
//! (unrecognized command). Blank lines produce no response. EOF with an open
//! transaction aborts it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::trace;

use crate::engine::{Engine, EngineError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Command-line parse failures. The display string is the protocol error tag.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Wrong arity (including an odd MSET token count).
    #[error("usage")]
    Usage,

    /// Milliseconds argument not a non-negative integer.
    #[error("int")]
    Int,

    /// Unrecognized command word.
    #[error("unknown")]
    Unknown,
}

// ------------------------------------------------------------------------------------------------
// Commands
// ------------------------------------------------------------------------------------------------

/// One parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Del { key: Vec<u8> },
    Expire { key: Vec<u8>, rel_ms: i64 },
    Ttl { key: Vec<u8> },
    Persist { key: Vec<u8> },
    MSet { pairs: Vec<(Vec<u8>, Vec<u8>)> },
    MGet { keys: Vec<Vec<u8>> },
    Range { lo: Option<Vec<u8>>, hi: Option<Vec<u8>> },
    Begin,
    Commit,
    Abort,
}

/// Parses one input line. `Ok(None)` means a blank line (no command).
///
/// Tokenization is byte-oriented: keys and values are opaque byte tokens split
/// on spaces and tabs, never interpreted as text.
pub fn parse(line: &[u8]) -> Result<Option<Command>, CommandError> {
    let tokens: Vec<&[u8]> = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|t| !t.is_empty())
        .collect();

    let Some((&word, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let command = match word {
        b"SET" => match args {
            [key, value] => Command::Set {
                key: key.to_vec(),
                value: value.to_vec(),
            },
            _ => return Err(CommandError::Usage),
        },
        b"GET" => Command::Get {
            key: single_key(args)?,
        },
        b"DEL" => Command::Del {
            key: single_key(args)?,
        },
        b"EXPIRE" => match args {
            [key, ms] => Command::Expire {
                key: key.to_vec(),
                rel_ms: parse_ms(ms)?,
            },
            _ => return Err(CommandError::Usage),
        },
        b"TTL" => Command::Ttl {
            key: single_key(args)?,
        },
        b"PERSIST" => Command::Persist {
            key: single_key(args)?,
        },
        b"MSET" => {
            if args.len() % 2 != 0 {
                return Err(CommandError::Usage);
            }
            Command::MSet {
                pairs: args
                    .chunks_exact(2)
                    .map(|pair| (pair[0].to_vec(), pair[1].to_vec()))
                    .collect(),
            }
        }
        b"MGET" => Command::MGet {
            keys: args.iter().map(|key| key.to_vec()).collect(),
        },
        b"RANGE" => match args {
            [lo, hi] => Command::Range {
                lo: bound(lo),
                hi: bound(hi),
            },
            _ => return Err(CommandError::Usage),
        },
        b"BEGIN" => bare(args, Command::Begin)?,
        b"COMMIT" => bare(args, Command::Commit)?,
        b"ABORT" => bare(args, Command::Abort)?,
        _ => return Err(CommandError::Unknown),
    };

    Ok(Some(command))
}

fn single_key(args: &[&[u8]]) -> Result<Vec<u8>, CommandError> {
    match args {
        [key] => Ok(key.to_vec()),
        _ => Err(CommandError::Usage),
    }
}

fn parse_ms(token: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|&ms| ms >= 0)
        .ok_or(CommandError::Int)
}

/// `-` marks an open range bound.
fn bound(token: &[u8]) -> Option<Vec<u8>> {
    if token == b"-" {
        None
    } else {
        Some(token.to_vec())
    }
}

fn bare(args: &[&[u8]], command: Command) -> Result<Command, CommandError> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(CommandError::Usage)
    }
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Runs one command against the engine and writes its response lines.
///
/// Engine failures become `ERR` lines rather than propagating: a durability
/// error aborts only the current command.
pub fn execute<W: Write>(engine: &mut Engine, command: Command, out: &mut W) -> io::Result<()> {
    match command {
        Command::Set { key, value } => match engine.set(key, value) {
            Ok(()) => out.write_all(b"OK\n"),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Get { key } => match engine.get(&key) {
            Ok(value) => write_value(out, value.as_deref()),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Del { key } => match engine.del(&key) {
            Ok(deleted) => write_count(out, deleted),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Expire { key, rel_ms } => match engine.expire(&key, rel_ms) {
            Ok(applied) => write_count(out, applied),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Ttl { key } => match engine.ttl(&key) {
            Ok(code) => writeln!(out, "{code}"),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Persist { key } => match engine.persist(&key) {
            Ok(removed) => write_count(out, removed),
            Err(e) => write_engine_error(out, &e),
        },
        Command::MSet { pairs } => match engine.mset(pairs) {
            Ok(()) => out.write_all(b"OK\n"),
            Err(e) => write_engine_error(out, &e),
        },
        Command::MGet { keys } => match engine.mget(&keys) {
            Ok(values) => {
                for value in values {
                    write_value(out, value.as_deref())?;
                }
                Ok(())
            }
            Err(e) => write_engine_error(out, &e),
        },
        Command::Range { lo, hi } => match engine.range(lo.as_deref(), hi.as_deref()) {
            Ok(keys) => {
                for key in keys {
                    out.write_all(&key)?;
                    out.write_all(b"\n")?;
                }
                out.write_all(b"END\n")
            }
            Err(e) => write_engine_error(out, &e),
        },
        Command::Begin => match engine.begin() {
            Ok(()) => out.write_all(b"OK\n"),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Commit => match engine.commit() {
            Ok(()) => out.write_all(b"OK\n"),
            Err(e) => write_engine_error(out, &e),
        },
        Command::Abort => match engine.abort() {
            Ok(()) => out.write_all(b"OK\n"),
            Err(e) => write_engine_error(out, &e),
        },
    }
}

fn write_value<W: Write>(out: &mut W, value: Option<&[u8]>) -> io::Result<()> {
    match value {
        Some(value) => {
            out.write_all(value)?;
            out.write_all(b"\n")
        }
        None => out.write_all(b"nil\n"),
    }
}

fn write_count<W: Write>(out: &mut W, applied: bool) -> io::Result<()> {
    out.write_all(if applied { b"1\n" } else { b"0\n" })
}

fn write_engine_error<W: Write>(out: &mut W, error: &EngineError) -> io::Result<()> {
    let tag = match error {
        EngineError::Log(_) => "io",
        EngineError::TransactionActive | EngineError::NoTransaction => "tx",
    };
    writeln!(out, "ERR {tag}")
}

// ------------------------------------------------------------------------------------------------
// Command loop
// ------------------------------------------------------------------------------------------------

/// Reads commands one line at a time until EOF, executing each against the
/// engine and flushing the response before the next read.
///
/// EOF with a transaction open is equivalent to ABORT: the overlay is
/// discarded without touching the log.
pub fn run<R: BufRead, W: Write>(engine: &mut Engine, mut input: R, mut out: W) -> io::Result<()> {
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = input.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        trace!(bytes = n, "command line read");

        match parse(&line) {
            Ok(None) => {}
            Ok(Some(command)) => execute(engine, command, &mut out)?,
            Err(e) => writeln!(out, "ERR {e}")?,
        }
        out.flush()?;
    }

    if engine.in_tx() {
        let _ = engine.abort();
    }
    Ok(())
}

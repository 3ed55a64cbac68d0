//! Structured error types, one enum per component boundary.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! The engine wraps these with anyhow contexts naming the failing operation
//! (`func-lookup`, `region-parse`, `make-profilers`, ...).

use std::fmt::Write as _;
use thiserror::Error;

/// Errors produced while resolving symbolic region descriptions to
/// addresses. These surface to the user before tracing starts.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid elf type (not an executable or shared object)")]
    InvalidElfType,

    #[error("no elf symbol table")]
    NoSymbolTable,

    #[error("no DWARF debugging data")]
    MissingDebugInfo,

    #[error("{0} has no associated address")]
    NotFound(String),

    #[error("multiple matches:\n{}", candidates(.0))]
    AmbiguousMatches(Vec<String>),

    #[error("could not find load bias for '{0}' in /proc/{1}/maps")]
    NoLoadBias(String, i32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("elf parse error: {0}")]
    Elf(#[from] object::Error),

    #[error("DWARF parse error: {0}")]
    Dwarf(#[from] gimli::Error),
}

fn candidates(matches: &[String]) -> String {
    let mut out = String::new();
    for m in matches {
        let _ = writeln!(out, "  {m}");
    }
    out
}

/// Errors from the ptrace supervisor. Apart from [`TraceError::Finished`],
/// these are fatal to the current trace: a failed poke risks leaving
/// corrupted text behind, so no retry is attempted.
#[derive(Error, Debug)]
pub enum TraceError {
    /// Terminal condition, not a failure: every traced process has exited
    /// or the trace was cancelled and cleanly detached.
    #[error("tracing finished")]
    Finished,

    #[error("no breakpoint installed at 0x{0:x}")]
    InvalidBreakpoint(u64),

    #[error("unknown ptrace trap cause {0}")]
    UnknownTrapCause(i32),

    #[error("short transfer on tracee memory: wanted {want} bytes, got {got}")]
    ShortTransfer { want: usize, got: usize },

    #[error("unexpected stop while attaching: {0}")]
    UnexpectedStop(String),

    #[error("wait worker disappeared")]
    WaitLost,

    #[error("ptrace: {0}")]
    Ptrace(#[from] nix::Error),

    #[error("failed to spawn target: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Errors from perf_event_open and counter reads. Open failures are
/// collected into a [`CounterErrors`] bundle and reported; the trace then
/// runs with whichever counters did open.
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("perf_event_open failed for '{label}': {source}")]
    Open {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read counter '{label}': {source}")]
    Read {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("counter ioctl failed for '{label}': {source}")]
    Ioctl {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("tracepoint '{0}' not found in tracefs")]
    UnknownTracepoint(String),
}

/// A bundle of counter errors gathered while opening one counter set.
#[derive(Error, Debug)]
#[error("{}", join_errors(.0))]
pub struct CounterErrors(pub Vec<CounterError>);

fn join_errors(errors: &[CounterError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

//! # perfspan — region-gated perf counter profiling
//!
//! perfspan measures hardware and software performance counters over
//! user-chosen regions of a native executable, instead of sampling a whole
//! program run. Counting is gated to the exact dynamic intervals during
//! which the traced program's instruction pointer lies between a region's
//! start and end locations.
//!
//! ```text
//! ┌──────────────┐   region specs    ┌──────────────┐
//! │     cli      │──────────────────▶│   symbols    │  ELF + DWARF tables,
//! └──────┬───────┘                   │ (BinaryIndex)│  fuzzy name lookup,
//!        │ events                    └──────┬───────┘  load bias
//!        ▼                                  │ addresses
//! ┌──────────────┐                          ▼
//! │   counters   │   enable/disable  ┌──────────────┐
//! │ (perf fds)   │◀──────────────────│    engine    │
//! └──────────────┘   per region      └──────┬───────┘
//!        ▲                                  │ wait / classify
//!        │ read counts                      ▼
//! ┌──────┴───────┐                   ┌──────────────┐
//! │   metrics    │◀──────────────────│    trace     │  ptrace supervisor,
//! │  + output    │   region events   │  (Program)   │  0xCC breakpoints
//! └──────────────┘                   └──────────────┘
//! ```
//!
//! How a region is traced:
//!
//! 1. [`symbols::BinaryIndex`] resolves region names (functions,
//!    `file:line` pairs, raw addresses) to unbiased virtual addresses and
//!    computes the runtime load bias for position-independent executables.
//! 2. [`trace::Program`] runs the target under ptrace with `0xCC`
//!    breakpoints at region starts. On each entry it captures the end
//!    address (the dynamic return address for a function region), moves
//!    the breakpoint there, and reports a start event; on the end
//!    breakpoint it re-arms the start.
//! 3. [`counters::CounterSet`] wraps the `perf_event_open` fds for one
//!    (process, region) pair; the [`engine`] resets and enables them on
//!    every region entry and snapshots them into a
//!    [`metrics::NamedMetrics`] record on every exit.
//!
//! Threads and forked children of the target are traced automatically;
//! children that execve into a different image are left alone. The whole
//! tracer is single-threaded and must stay on one OS thread (Linux binds
//! the ptrace relationship to the tracer's kernel thread id); x86_64 only.

pub mod cli;
pub mod counters;
pub mod domain;
pub mod engine;
pub mod metrics;
pub mod output;
pub mod symbols;
pub mod trace;

//! Shared helpers for the integration tests: fixture compilation and
//! environment gating. Tracing needs a C compiler, ptrace permissions, and
//! perf_event_open access; tests skip (with a note) where those are
//! missing rather than fail.

// not every test binary uses every helper
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use perfspan::counters::catalog::EventCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Pie,
    NoPie,
}

/// Compile `tests/fixtures/<source>` into `dir`, returning the binary path
/// or `None` when no working C compiler is available.
pub fn build_fixture(dir: &Path, source: &str, out: &str, linkage: Linkage) -> Option<PathBuf> {
    let flags: &[&str] = match linkage {
        Linkage::Pie => &["-O0", "-g", "-fPIE", "-pie"],
        Linkage::NoPie => &["-O0", "-g", "-no-pie"],
    };
    build_fixture_with(dir, source, out, flags)
}

/// Compile a fixture with explicit compiler flags.
pub fn build_fixture_with(
    dir: &Path,
    source: &str,
    out: &str,
    flags: &[&str],
) -> Option<PathBuf> {
    let source_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(source);
    let out_path = dir.join(out);

    let mut cmd = Command::new("cc");
    cmd.args(flags).arg("-o").arg(&out_path).arg(&source_path);

    match cmd.output() {
        Ok(output) if output.status.success() => Some(out_path),
        Ok(output) => {
            eprintln!(
                "skipping: cc failed for {source}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            None
        }
        Err(e) => {
            eprintln!("skipping: no C compiler: {e}");
            None
        }
    }
}

/// Line number (1-based) of the first line containing `marker` in a
/// fixture source file.
pub fn marker_line(source: &str, marker: &str) -> Option<u32> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(source);
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .position(|l| l.contains(marker))
        .map(|i| i as u32 + 1)
}

/// Whether this environment lets us open perf counters at all.
pub fn perf_available() -> bool {
    let available = !EventCatalog.available_software().is_empty();
    if !available {
        eprintln!("skipping: perf_event_open unavailable (paranoid setting?)");
    }
    available
}

/// Whether an error looks like a missing-privilege condition rather than a
/// bug; the end-to-end tests skip in that case.
pub fn is_permission_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}");
    msg.contains("EPERM")
        || msg.contains("EACCES")
        || msg.contains("Operation not permitted")
        || msg.contains("Permission denied")
}

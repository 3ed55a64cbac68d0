//! End-to-end traces against freshly-compiled C targets.
//!
//! These tests spawn real tracees, so they need ptrace and perf_event_open
//! permissions; they skip with a note where the environment forbids that.
//! They also serialize on one lock: each trace waits on any child of the
//! test process, so two concurrent traces would steal each other's stops.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::bounded;
use object::{Object, ObjectSection};

use common::{build_fixture, is_permission_error, perf_available, Linkage};
use perfspan::counters::catalog::EventCatalog;
use perfspan::counters::{Events, PerfOptions};
use perfspan::engine::{self, Target};
use perfspan::metrics::{NamedMetrics, TotalMetrics};
use perfspan::symbols::{BinaryIndex, RegionResolver};

static TRACE_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    TRACE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn base_events(names: &[&str]) -> Events {
    let catalog = EventCatalog;
    Events {
        base: names
            .iter()
            .map(|n| catalog.resolve(n).expect("known event"))
            .collect(),
        groups: Vec::new(),
    }
}

fn opts() -> PerfOptions {
    PerfOptions {
        exclude_kernel: true,
        exclude_hypervisor: true,
        exclude_user: false,
    }
}

fn run_trace(target: &Target, regions: &[&str], events: &Events) -> Option<TotalMetrics> {
    let (_cancel_tx, cancel_rx) = bounded(1);
    let specs: Vec<String> = regions.iter().map(|s| s.to_string()).collect();
    match engine::run(target, &specs, events, &opts(), &cancel_rx, None) {
        Ok(total) => Some(total),
        Err(e) if is_permission_error(&e) => {
            eprintln!("skipping: {e:#}");
            None
        }
        Err(e) => panic!("trace failed: {e:#}"),
    }
}

fn count_of(record: &NamedMetrics, label: &str) -> u64 {
    record
        .metrics
        .counts
        .iter()
        .find(|c| c.label == label)
        .unwrap_or_else(|| panic!("missing counter '{label}' in {record:?}"))
        .value
}

/// The byte the ELF file holds at virtual address `vaddr`.
fn elf_byte_at(path: &Path, vaddr: u64) -> Option<u8> {
    let data = fs::read(path).ok()?;
    let obj = object::File::parse(&*data).ok()?;
    for section in obj.sections() {
        let addr = section.address();
        if vaddr >= addr && vaddr < addr + section.size() {
            return section.data().ok()?.get((vaddr - addr) as usize).copied();
        }
    }
    None
}

fn read_child_byte(pid: i32, addr: u64) -> Option<u8> {
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};
    use std::io::IoSliceMut;

    let mut buf = [0u8; 1];
    let mut local = [IoSliceMut::new(&mut buf)];
    let remote = [RemoteIoVec { base: addr as usize, len: 1 }];
    process_vm_readv(nix::unistd::Pid::from_raw(pid), &mut local, &remote).ok()?;
    Some(buf[0])
}

#[test]
fn single_region_counts_instructions() {
    let _guard = lock();
    if !perf_available() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "sum.c", "sum", Linkage::NoPie) else {
        return;
    };

    let events = base_events(&["instructions", "branch-instructions", "branch-misses"]);
    let target = Target::Command { path: bin.display().to_string(), args: Vec::new() };
    let Some(total) = run_trace(&target, &["sum"], &events) else {
        return;
    };

    assert_eq!(total.0.len(), 1, "expected one region instance");
    let record = &total.0[0];
    assert_eq!(record.name, "sum");

    // 10M-element sum at -O0: a handful of instructions and one branch per
    // element, and a well-predicted loop branch.
    let instructions = count_of(record, "instructions");
    let branches = count_of(record, "branch-instructions");
    let misses = count_of(record, "branch-misses");
    assert!(
        (20_000_000..400_000_000).contains(&instructions),
        "instructions = {instructions}"
    );
    assert!(
        (5_000_000..100_000_000).contains(&branches),
        "branch-instructions = {branches}"
    );
    assert!(misses < 5_000_000, "branch-misses = {misses}");
    assert!(record.metrics.elapsed > Duration::ZERO);
}

#[test]
fn pie_target_counts_match() {
    let _guard = lock();
    if !perf_available() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "sum.c", "sum-pie", Linkage::Pie) else {
        return;
    };
    assert!(BinaryIndex::open(&bin).expect("index").pie());

    let events = base_events(&["instructions"]);
    let target = Target::Command { path: bin.display().to_string(), args: Vec::new() };
    let Some(total) = run_trace(&target, &["sum"], &events) else {
        return;
    };

    assert_eq!(total.0.len(), 1);
    let instructions = count_of(&total.0[0], "instructions");
    assert!(
        (20_000_000..400_000_000).contains(&instructions),
        "instructions = {instructions}"
    );
}

#[test]
fn loop_emits_one_record_per_region_instance() {
    let _guard = lock();
    if !perf_available() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "loop.c", "loop", Linkage::NoPie) else {
        return;
    };

    let events = base_events(&["instructions"]);
    let target = Target::Command { path: bin.display().to_string(), args: Vec::new() };
    let Some(total) = run_trace(&target, &["sum"], &events) else {
        return;
    };

    assert_eq!(total.0.len(), 1000, "one record per call");
    for record in &total.0 {
        assert_eq!(record.name, "sum");
        let instructions = count_of(record, "instructions");
        assert!(
            (200_000..100_000_000).contains(&instructions),
            "instructions = {instructions}"
        );
    }
}

#[test]
fn forked_child_is_traced_too() {
    let _guard = lock();
    if !perf_available() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "fork.c", "fork", Linkage::NoPie) else {
        return;
    };

    let events = base_events(&["instructions"]);
    let target = Target::Command { path: bin.display().to_string(), args: Vec::new() };
    let Some(total) = run_trace(&target, &["sum"], &events) else {
        return;
    };

    // parent and child each execute the region once
    assert_eq!(total.0.len(), 2, "one record per process");
    for record in &total.0 {
        assert_eq!(record.name, "sum");
    }
}

#[test]
fn attach_collects_then_detaches_cleanly() {
    let _guard = lock();
    if !perf_available() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "spin.c", "spin", Linkage::Pie) else {
        return;
    };

    let mut child = std::process::Command::new(&bin)
        .stdout(std::process::Stdio::null())
        .spawn()
        .expect("spawn spin target");
    let pid = child.id() as i32;
    // let it reach its steady loop
    std::thread::sleep(Duration::from_millis(300));

    let index = BinaryIndex::open(&bin).expect("index spin");
    let sum_addr = index.func_to_pc("sum").expect("resolve sum");
    let bias = index.load_bias(pid).expect("load bias of live pid");
    assert_ne!(bias, 0, "PIE target must have a nonzero load bias");

    let events = base_events(&["instructions"]);
    let (cancel_tx, cancel_rx) = bounded(1);
    let mut seen = 0u32;
    let mut on_record = |_: &NamedMetrics| {
        seen += 1;
        if seen >= 2 {
            let _ = cancel_tx.try_send(());
        }
    };

    let result = engine::run(
        &Target::Pid(pid),
        &[String::from("sum")],
        &events,
        &opts(),
        &cancel_rx,
        Some(&mut on_record),
    );

    match result {
        Ok(total) => {
            assert!(!total.0.is_empty(), "no records collected before cancel");

            // After detach the tracee's text must be byte-identical to the
            // ELF at the former breakpoint address.
            let live = read_child_byte(pid, sum_addr + bias).expect("read tracee memory");
            assert_ne!(live, 0xCC, "breakpoint byte left behind after detach");
            let file = elf_byte_at(&bin, sum_addr).expect("read elf byte");
            assert_eq!(live, file, "tracee text differs from ELF after detach");
        }
        Err(e) if is_permission_error(&e) => eprintln!("skipping: {e:#}"),
        Err(e) => {
            let _ = child.kill();
            panic!("attach trace failed: {e:#}");
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

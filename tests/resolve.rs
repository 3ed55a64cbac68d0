//! Symbol resolution against freshly-compiled C binaries: no tracing or
//! perf permissions required, only a C compiler.

#![cfg(target_os = "linux")]

mod common;

use common::{build_fixture, build_fixture_with, marker_line, Linkage};
use perfspan::domain::errors::ResolveError;
use perfspan::symbols::{BinaryIndex, RegionResolver};

#[test]
fn function_symbols_resolve_in_both_linkages() {
    let dir = tempfile::tempdir().expect("tempdir");

    let Some(fixed) = build_fixture(dir.path(), "sum.c", "sum-nopie", Linkage::NoPie) else {
        return;
    };
    let index = BinaryIndex::open(&fixed).expect("index no-pie binary");
    assert!(!index.pie());
    let fixed_addr = index.func_to_pc("sum").expect("resolve sum");
    assert_ne!(fixed_addr, 0);
    // non-PIE binaries need no bias
    assert_eq!(index.load_bias(std::process::id() as i32).unwrap(), 0);

    let Some(pie) = build_fixture(dir.path(), "sum.c", "sum-pie", Linkage::Pie) else {
        return;
    };
    let index = BinaryIndex::open(&pie).expect("index pie binary");
    assert!(index.pie());
    index.func_to_pc("sum").expect("resolve sum in pie build");
}

#[test]
fn missing_function_reports_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "sum.c", "sum", Linkage::NoPie) else {
        return;
    };
    let index = BinaryIndex::open(&bin).expect("index binary");
    assert!(matches!(
        index.func_to_pc("definitely_not_here"),
        Err(ResolveError::NotFound(_))
    ));
}

#[test]
fn line_numbers_resolve_through_dwarf() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture(dir.path(), "sum.c", "sum", Linkage::NoPie) else {
        return;
    };
    let line = marker_line("sum.c", "line-probe").expect("marker present in fixture");

    let index = BinaryIndex::open(&bin).expect("index binary");
    let line_addr = index.line_to_pc("sum.c", line).expect("resolve file:line");
    let func_addr = index.func_to_pc("sum").expect("resolve sum");

    // the loop body lives inside the function
    assert!(line_addr > func_addr);
    assert!(line_addr < func_addr + 0x1000);
}

#[test]
fn inlining_sites_are_recovered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(bin) = build_fixture_with(dir.path(), "inline.c", "inline", &["-O2", "-g"]) else {
        return;
    };
    let index = BinaryIndex::open(&bin).expect("index binary");
    match index.inlined_func_to_pcs("mix") {
        Ok(ranges) => {
            assert!(!ranges.is_empty());
            for range in ranges {
                assert!(range.low < range.high, "bad range {range:?}");
            }
        }
        // Some toolchains emit no inlined-subroutine DIEs for this shape;
        // resolution failure is then expected rather than a bug here.
        Err(e) => eprintln!("skipping inline assertions: {e}"),
    }
}

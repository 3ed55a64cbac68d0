//! The top-level tracing loop: resolve regions, supervise the target, and
//! slice counter windows around every region instance.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, warn};

use crate::counters::{CounterSet, Events, PerfOptions};
use crate::domain::errors::TraceError;
use crate::metrics::{NamedMetrics, TotalMetrics};
use crate::symbols::{BinaryIndex, RegionResolver};
use crate::trace::{AddressRegion, FuncRegion, Program, Region, RegionPhase};

/// What to trace: a command to spawn, or a live PID to attach to.
#[derive(Debug, Clone)]
pub enum Target {
    Command { path: String, args: Vec<String> },
    Pid(i32),
}

/// Parse a location: `file:line` (resolved through DWARF) or a hex/decimal
/// address.
pub fn parse_location(resolver: &dyn RegionResolver, loc: &str) -> Result<u64> {
    if let Some((file, line)) = loc.rsplit_once(':') {
        let line: u32 = line
            .parse()
            .with_context(|| format!("invalid line number in '{loc}'"))?;
        return Ok(resolver.line_to_pc(file, line)?);
    }
    if let Some(hex) = loc.strip_prefix("0x").or_else(|| loc.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).with_context(|| format!("invalid address '{loc}'"));
    }
    loc.parse::<u64>()
        .with_context(|| format!("invalid location '{loc}'"))
}

/// Parse an explicit `start-end` region, each side a location as accepted
/// by [`parse_location`].
pub fn parse_region(resolver: &dyn RegionResolver, spec: &str) -> Result<AddressRegion> {
    let parts: Vec<&str> = spec.split('-').collect();
    if parts.len() != 2 {
        bail!("invalid region '{spec}': expected 'start-end'");
    }
    Ok(AddressRegion {
        start: parse_location(resolver, parts[0])?,
        end: parse_location(resolver, parts[1])?,
    })
}

/// Resolve every user-supplied region spec. A spec containing `-` is an
/// explicit address region; anything else names a function, which yields a
/// function region plus one address region per inlining site recovered from
/// DWARF. The second return value maps each resolved region back to the
/// index of the spec that produced it, for labeling records.
fn resolve_regions(
    resolver: &dyn RegionResolver,
    specs: &[String],
) -> Result<(Vec<Region>, Vec<usize>)> {
    let mut regions = Vec::new();
    let mut spec_of = Vec::new();

    for (i, spec) in specs.iter().enumerate() {
        if spec.contains('-') {
            let region = parse_region(resolver, spec).context("region-parse")?;
            debug!("{spec}: 0x{:x}-0x{:x}", region.start, region.end);
            regions.push(Region::Address(region));
            spec_of.push(i);
        } else {
            let pc = resolver.func_to_pc(spec).context("func-lookup")?;
            debug!("{spec}: 0x{pc:x}");
            regions.push(Region::Func(FuncRegion { addr: pc }));
            spec_of.push(i);

            match resolver.inlined_func_to_pcs(spec) {
                Ok(ranges) => {
                    for range in ranges {
                        debug!("{spec} (inlined): 0x{:x}-0x{:x}", range.low, range.high);
                        regions.push(Region::Address(AddressRegion {
                            start: range.low,
                            end: range.high,
                        }));
                        spec_of.push(i);
                    }
                }
                Err(e) => debug!("{spec}: no inlining sites: {e}"),
            }
        }
    }

    Ok((regions, spec_of))
}

fn open_counters(pid: i32, n: usize, events: &Events, opts: &PerfOptions) -> Vec<CounterSet> {
    (0..n)
        .map(|_| {
            let (set, errors) = CounterSet::open(events, opts, pid, -1);
            if !errors.0.is_empty() {
                warn!("make-profilers: {errors}");
            }
            set
        })
        .collect()
}

/// Trace `target`, gating `events` on the given regions, until every traced
/// process exits or `cancel` receives a message. Records are accumulated in
/// event order and, when `on_record` is given, streamed to it as they are
/// produced.
///
/// The caller must stay on one OS thread from this call until it returns:
/// the ptrace tracer relationship is bound to the calling kernel thread.
/// Only the internal waiter briefly runs elsewhere, and it touches no
/// ptrace state.
pub fn run(
    target: &Target,
    region_specs: &[String],
    events: &Events,
    opts: &PerfOptions,
    cancel: &Receiver<()>,
    mut on_record: Option<&mut dyn FnMut(&NamedMetrics)>,
) -> Result<TotalMetrics> {
    if region_specs.is_empty() {
        bail!("no regions given");
    }
    if events.is_empty() {
        bail!("no events given");
    }

    let index = match target {
        Target::Command { path, .. } => BinaryIndex::open(path).context("elf-read")?,
        Target::Pid(pid) => BinaryIndex::from_pid(*pid).context("elf-read")?,
    };

    let (regions, spec_of) = resolve_regions(&index, region_specs)?;
    let region_count = regions.len();

    let (mut program, root) = match target {
        Target::Command { path, args } => {
            Program::spawn(&index, path, args, regions).context("trace")?
        }
        Target::Pid(pid) => Program::attach(&index, *pid, regions).context("trace")?,
    };

    let mut counters: HashMap<i32, Vec<CounterSet>> = HashMap::new();
    counters.insert(
        root.as_raw(),
        open_counters(root.as_raw(), region_count, events, opts),
    );

    let mut total = TotalMetrics::default();

    loop {
        let (pid, region_events, status) = match program.wait(cancel) {
            Ok(result) => result,
            Err(TraceError::Finished) => break,
            Err(e) => return Err(e).context("wait"),
        };
        let raw = pid.as_raw();

        if raw > 0 && !counters.contains_key(&raw) {
            counters.insert(raw, open_counters(raw, region_count, events, opts));
        }

        if let Some(sets) = counters.get_mut(&raw) {
            for event in &region_events {
                let set = &mut sets[event.id];
                match event.phase {
                    RegionPhase::Start => {
                        debug!("{raw}: counting enabled");
                        // A lost end event would leave the counters running;
                        // stop them before the reset so every instance
                        // starts from a clean slate.
                        if let Err(e) = set.disable() {
                            warn!("{raw}: {e}");
                        }
                        if let Err(e) = set.reset() {
                            warn!("{raw}: {e}");
                        }
                        if let Err(e) = set.enable() {
                            warn!("{raw}: {e}");
                        }
                    }
                    RegionPhase::End => {
                        if let Err(e) = set.disable() {
                            warn!("{raw}: {e}");
                        }
                        debug!("{raw}: counting disabled");
                        let record = NamedMetrics {
                            name: region_specs[spec_of[event.id]].clone(),
                            metrics: set.metrics(),
                        };
                        if let Some(cb) = on_record.as_mut() {
                            cb(&record);
                        }
                        total.push(record);
                    }
                }
            }
        }

        program.continue_proc(pid, &status).context("trace-continue")?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ResolveError;
    use crate::symbols::InlinedRange;

    struct StubResolver;

    impl RegionResolver for StubResolver {
        fn func_to_pc(&self, name: &str) -> Result<u64, ResolveError> {
            match name {
                "sum" => Ok(0x1100),
                other => Err(ResolveError::NotFound(other.to_string())),
            }
        }

        fn inlined_func_to_pcs(&self, name: &str) -> Result<Vec<InlinedRange>, ResolveError> {
            match name {
                "sum" => Ok(vec![InlinedRange { low: 0x2000, high: 0x2040 }]),
                other => Err(ResolveError::NotFound(other.to_string())),
            }
        }

        fn line_to_pc(&self, file: &str, line: u32) -> Result<u64, ResolveError> {
            if file == "sum.c" && line == 10 {
                Ok(0x1180)
            } else {
                Err(ResolveError::NotFound(format!("{file}:{line}")))
            }
        }

        fn load_bias(&self, _pid: i32) -> Result<u64, ResolveError> {
            Ok(0)
        }
    }

    #[test]
    fn locations_parse_hex_decimal_and_lines() {
        let r = StubResolver;
        assert_eq!(parse_location(&r, "0x400a").unwrap(), 0x400a);
        assert_eq!(parse_location(&r, "1234").unwrap(), 1234);
        assert_eq!(parse_location(&r, "sum.c:10").unwrap(), 0x1180);
        assert!(parse_location(&r, "sum.c:xx").is_err());
        assert!(parse_location(&r, "zz").is_err());
    }

    #[test]
    fn regions_need_exactly_two_locations() {
        let r = StubResolver;
        let region = parse_region(&r, "0x1000-0x2000").unwrap();
        assert_eq!((region.start, region.end), (0x1000, 0x2000));
        assert!(parse_region(&r, "0x1000").is_err());
        assert!(parse_region(&r, "0x1-0x2-0x3").is_err());
    }

    #[test]
    fn function_specs_expand_to_inlining_sites() {
        let (regions, spec_of) =
            resolve_regions(&StubResolver, &["sum".to_string()]).unwrap();
        assert_eq!(regions.len(), 2);
        assert!(matches!(regions[0], Region::Func(FuncRegion { addr: 0x1100 })));
        assert!(matches!(
            regions[1],
            Region::Address(AddressRegion { start: 0x2000, end: 0x2040 })
        ));
        // both map back to the one user-supplied name
        assert_eq!(spec_of, vec![0, 0]);
    }

    #[test]
    fn dash_specs_resolve_as_address_regions() {
        let specs = vec!["sum.c:10-0x1200".to_string()];
        let (regions, spec_of) = resolve_regions(&StubResolver, &specs).unwrap();
        assert_eq!(regions.len(), 1);
        assert!(matches!(
            regions[0],
            Region::Address(AddressRegion { start: 0x1180, end: 0x1200 })
        ));
        assert_eq!(spec_of, vec![0]);
    }

    #[test]
    fn unknown_function_aborts_resolution() {
        assert!(resolve_regions(&StubResolver, &["missing".to_string()]).is_err());
    }
}

//! The catalog of named perf events.
//!
//! Mnemonic strings (`instructions`, `l1d-read-misses`,
//! `sched:sched_switch`, ...) map to opaque attribute configurators; the
//! tracing engine only ever sees the configurators. Hardware, software and
//! cache events come from fixed tables; cache mnemonics are composed as
//! `<cache>-<op>-<result>`; tracepoints are `subsystem:event` pairs whose
//! config id is read from tracefs.

use std::fs;
use std::mem;

use perf_event_open_sys as sys;
use sys::bindings::{self, perf_event_attr};

use crate::domain::errors::CounterError;

const TRACEFS: &str = "/sys/kernel/debug/tracing";

/// An opaque perf-event attribute configurator.
pub trait Configure {
    fn label(&self) -> &str;
    fn configure(&self, attr: &mut perf_event_attr);
}

/// A resolved event: its display label and the attr type/config pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    label: String,
    ty: u32,
    config: u64,
}

impl Configure for EventSpec {
    fn label(&self) -> &str {
        &self.label
    }

    fn configure(&self, attr: &mut perf_event_attr) {
        attr.type_ = self.ty;
        attr.config = self.config;
    }
}

const HARDWARE_EVENTS: &[(&str, u32)] = &[
    ("branch-instructions", bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", bindings::PERF_COUNT_HW_BRANCH_MISSES),
    ("bus-cycles", bindings::PERF_COUNT_HW_BUS_CYCLES),
    ("cache-misses", bindings::PERF_COUNT_HW_CACHE_MISSES),
    ("cache-references", bindings::PERF_COUNT_HW_CACHE_REFERENCES),
    ("cpu-cycles", bindings::PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", bindings::PERF_COUNT_HW_INSTRUCTIONS),
    ("ref-cycles", bindings::PERF_COUNT_HW_REF_CPU_CYCLES),
    ("stalled-cycles-backend", bindings::PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
    ("stalled-cycles-frontend", bindings::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
];

const SOFTWARE_EVENTS: &[(&str, u32)] = &[
    ("alignment-faults", bindings::PERF_COUNT_SW_ALIGNMENT_FAULTS),
    ("context-switches", bindings::PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cpu-clock", bindings::PERF_COUNT_SW_CPU_CLOCK),
    ("cpu-migrations", bindings::PERF_COUNT_SW_CPU_MIGRATIONS),
    ("emulation-faults", bindings::PERF_COUNT_SW_EMULATION_FAULTS),
    ("major-faults", bindings::PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    ("minor-faults", bindings::PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("page-faults", bindings::PERF_COUNT_SW_PAGE_FAULTS),
    ("task-clock", bindings::PERF_COUNT_SW_TASK_CLOCK),
];

const CACHES: &[(&str, u32)] = &[
    ("l1d", bindings::PERF_COUNT_HW_CACHE_L1D),
    ("l1i", bindings::PERF_COUNT_HW_CACHE_L1I),
    ("ll", bindings::PERF_COUNT_HW_CACHE_LL),
    ("dtlb", bindings::PERF_COUNT_HW_CACHE_DTLB),
    ("itlb", bindings::PERF_COUNT_HW_CACHE_ITLB),
    ("bpu", bindings::PERF_COUNT_HW_CACHE_BPU),
    ("node", bindings::PERF_COUNT_HW_CACHE_NODE),
];

const CACHE_OPS: &[(&str, u32)] = &[
    ("read", bindings::PERF_COUNT_HW_CACHE_OP_READ),
    ("write", bindings::PERF_COUNT_HW_CACHE_OP_WRITE),
    ("prefetch", bindings::PERF_COUNT_HW_CACHE_OP_PREFETCH),
];

const CACHE_RESULTS: &[(&str, u32)] = &[
    ("accesses", bindings::PERF_COUNT_HW_CACHE_RESULT_ACCESS),
    ("misses", bindings::PERF_COUNT_HW_CACHE_RESULT_MISS),
];

fn table_get(table: &[(&str, u32)], key: &str) -> Option<u32> {
    table.iter().find(|(name, _)| *name == key).map(|(_, v)| *v)
}

/// `<cache>-<op>-<result>` composed into an HW_CACHE config value.
fn cache_config(name: &str) -> Option<u64> {
    let mut parts = name.splitn(3, '-');
    let cache = table_get(CACHES, parts.next()?)?;
    let op = table_get(CACHE_OPS, parts.next()?)?;
    let result = table_get(CACHE_RESULTS, parts.next()?)?;
    Some(u64::from(cache) | u64::from(op) << 8 | u64::from(result) << 16)
}

/// The catalog of event mnemonics understood by this machine.
#[derive(Debug, Default)]
pub struct EventCatalog;

impl EventCatalog {
    /// Map a mnemonic to its attribute configurator.
    ///
    /// # Errors
    /// Unknown mnemonics and tracepoints absent from tracefs are rejected.
    pub fn resolve(&self, name: &str) -> Result<EventSpec, CounterError> {
        if let Some(config) = table_get(HARDWARE_EVENTS, name) {
            return Ok(EventSpec {
                label: name.to_string(),
                ty: bindings::PERF_TYPE_HARDWARE,
                config: u64::from(config),
            });
        }
        if let Some(config) = table_get(SOFTWARE_EVENTS, name) {
            return Ok(EventSpec {
                label: name.to_string(),
                ty: bindings::PERF_TYPE_SOFTWARE,
                config: u64::from(config),
            });
        }
        if let Some(config) = cache_config(name) {
            return Ok(EventSpec {
                label: name.to_string(),
                ty: bindings::PERF_TYPE_HW_CACHE,
                config,
            });
        }
        if let Some((subsystem, event)) = name.split_once(':') {
            return self.tracepoint(name, subsystem, event);
        }
        Err(CounterError::UnknownEvent(name.to_string()))
    }

    /// A tracepoint's config is the id tracefs assigns it.
    fn tracepoint(
        &self,
        label: &str,
        subsystem: &str,
        event: &str,
    ) -> Result<EventSpec, CounterError> {
        let path = format!("{TRACEFS}/events/{subsystem}/{event}/id");
        let id = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| CounterError::UnknownTracepoint(label.to_string()))?;
        Ok(EventSpec {
            label: label.to_string(),
            ty: bindings::PERF_TYPE_TRACEPOINT,
            config: id,
        })
    }

    /// Hardware event mnemonics this system accepts.
    pub fn available_hardware(&self) -> Vec<String> {
        self.probe_table(HARDWARE_EVENTS, bindings::PERF_TYPE_HARDWARE)
    }

    /// Software event mnemonics this system accepts.
    pub fn available_software(&self) -> Vec<String> {
        self.probe_table(SOFTWARE_EVENTS, bindings::PERF_TYPE_SOFTWARE)
    }

    /// Cache event mnemonics this system accepts.
    pub fn available_cache(&self) -> Vec<String> {
        let mut available = Vec::new();
        for (cache, _) in CACHES {
            for (op, _) in CACHE_OPS {
                for (result, _) in CACHE_RESULTS {
                    let name = format!("{cache}-{op}-{result}");
                    let Some(config) = cache_config(&name) else {
                        continue;
                    };
                    if probe(bindings::PERF_TYPE_HW_CACHE, config) {
                        available.push(name);
                    }
                }
            }
        }
        available.sort();
        available
    }

    /// Tracepoint names (`subsystem:event`), straight from tracefs. Needs
    /// read access to the tracing debugfs, typically root.
    pub fn available_tracepoints(&self) -> Vec<String> {
        let Ok(events) = fs::read_to_string(format!("{TRACEFS}/available_events")) else {
            return Vec::new();
        };
        let mut names: Vec<String> = events
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    fn probe_table(&self, table: &[(&str, u32)], ty: u32) -> Vec<String> {
        let mut available: Vec<String> = table
            .iter()
            .filter(|(_, config)| probe(ty, u64::from(*config)))
            .map(|(name, _)| name.to_string())
            .collect();
        available.sort();
        available
    }
}

/// Trial-open an event on the calling thread to see whether this kernel and
/// hardware support it.
fn probe(ty: u32, config: u64) -> bool {
    let mut attr = perf_event_attr::default();
    attr.size = mem::size_of::<perf_event_attr>() as u32;
    attr.type_ = ty;
    attr.config = config;
    attr.set_disabled(1);
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);
    let fd = unsafe {
        sys::perf_event_open(
            &mut attr,
            0,
            -1,
            -1,
            u64::from(bindings::PERF_FLAG_FD_CLOEXEC) as libc::c_ulong,
        )
    };
    if fd < 0 {
        return false;
    }
    unsafe { libc::close(fd) };
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_mnemonics_resolve() {
        let catalog = EventCatalog;
        let spec = catalog.resolve("instructions").unwrap();
        assert_eq!(spec.label(), "instructions");
        assert_eq!(spec.ty, bindings::PERF_TYPE_HARDWARE);
        assert_eq!(spec.config, u64::from(bindings::PERF_COUNT_HW_INSTRUCTIONS));
    }

    #[test]
    fn software_mnemonics_resolve() {
        let spec = EventCatalog.resolve("page-faults").unwrap();
        assert_eq!(spec.ty, bindings::PERF_TYPE_SOFTWARE);
        assert_eq!(spec.config, u64::from(bindings::PERF_COUNT_SW_PAGE_FAULTS));
    }

    #[test]
    fn cache_mnemonics_compose() {
        let spec = EventCatalog.resolve("l1d-read-misses").unwrap();
        assert_eq!(spec.ty, bindings::PERF_TYPE_HW_CACHE);
        let expected = u64::from(bindings::PERF_COUNT_HW_CACHE_L1D)
            | u64::from(bindings::PERF_COUNT_HW_CACHE_OP_READ) << 8
            | u64::from(bindings::PERF_COUNT_HW_CACHE_RESULT_MISS) << 16;
        assert_eq!(spec.config, expected);
    }

    #[test]
    fn partial_cache_names_are_rejected() {
        assert!(cache_config("l1d-read").is_none());
        assert!(cache_config("l1d-peek-misses").is_none());
        assert!(matches!(
            EventCatalog.resolve("l1d-read"),
            Err(CounterError::UnknownEvent(_))
        ));
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(matches!(
            EventCatalog.resolve("not-an-event"),
            Err(CounterError::UnknownEvent(_))
        ));
    }

    #[test]
    fn missing_tracepoint_is_rejected() {
        assert!(matches!(
            EventCatalog.resolve("nosuchsys:nosuchevent"),
            Err(CounterError::UnknownTracepoint(_))
        ));
    }
}

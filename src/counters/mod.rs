//! perf_event counter ownership and the enable/disable/reset/read surface.
//!
//! For each (PID, region) pair the engine owns one [`CounterSet`]: a "base"
//! collection of independently-opened counters the kernel is free to
//! multiplex, plus zero or more [`GroupCounter`]s whose events are opened
//! as a leader with followers so the kernel schedules them together.
//!
//! Counts are read with `PERF_FORMAT_TOTAL_TIME_ENABLED|RUNNING` so
//! multiplexed values can be rescaled by enabled/running. The kernel does
//! not zero time-enabled on `PERF_EVENT_IOC_RESET`; a baseline snapshotted
//! at each reset is subtracted so reported elapsed time covers only the
//! interval since the most recent reset.

pub mod catalog;

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::warn;
use perf_event_open_sys as sys;
use sys::bindings::{self, perf_event_attr};

use crate::domain::errors::{CounterError, CounterErrors};
use crate::metrics::{Count, Metrics};
use catalog::{Configure, EventSpec};

/// Scope filters applied to every opened counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfOptions {
    pub exclude_kernel: bool,
    pub exclude_hypervisor: bool,
    pub exclude_user: bool,
}

/// The events to measure per region: independent base counters and
/// kernel-coscheduled groups.
#[derive(Debug, Clone, Default)]
pub struct Events {
    pub base: Vec<EventSpec>,
    pub groups: Vec<Vec<EventSpec>>,
}

impl Events {
    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.groups.iter().all(Vec::is_empty)
    }
}

fn base_attr(opts: &PerfOptions, disabled: bool) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.size = mem::size_of::<perf_event_attr>() as u32;
    attr.read_format = u64::from(
        bindings::PERF_FORMAT_TOTAL_TIME_ENABLED | bindings::PERF_FORMAT_TOTAL_TIME_RUNNING,
    );
    attr.set_disabled(disabled.into());
    attr.set_exclude_kernel(opts.exclude_kernel.into());
    attr.set_exclude_hv(opts.exclude_hypervisor.into());
    attr.set_exclude_user(opts.exclude_user.into());
    attr
}

fn open_fd(
    attr: &mut perf_event_attr,
    pid: i32,
    cpu: i32,
    group_fd: RawFd,
    label: &str,
) -> Result<OwnedFd, CounterError> {
    let fd = unsafe {
        sys::perf_event_open(
            attr,
            pid,
            cpu,
            group_fd,
            u64::from(bindings::PERF_FLAG_FD_CLOEXEC) as libc::c_ulong,
        )
    };
    if fd < 0 {
        return Err(CounterError::Open {
            label: label.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn check_ioctl(res: libc::c_int, label: &str) -> Result<(), CounterError> {
    if res == -1 {
        return Err(CounterError::Ioctl {
            label: label.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn read_words(fd: RawFd, out: &mut [u64], label: &str) -> Result<(), CounterError> {
    let want = mem::size_of_val(out);
    let n = unsafe { libc::read(fd, out.as_mut_ptr().cast(), want) };
    if n < 0 {
        return Err(CounterError::Read {
            label: label.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    if (n as usize) < want {
        return Err(CounterError::Read {
            label: label.to_string(),
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{n} of {want} bytes"),
            ),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct RawCount {
    value: u64,
    enabled: u64,
    running: u64,
}

/// Rescale a multiplexed count by enabled/running.
fn scaled(raw: RawCount, label: &str) -> u64 {
    if raw.running == 0 || raw.enabled == raw.running {
        return raw.value;
    }
    let scale = raw.enabled as f64 / raw.running as f64;
    warn!("counter '{label}' was multiplexed; scaling count by {scale:.2}");
    (raw.value as f64 * scale) as u64
}

/// One independently-scheduled counter fd.
pub struct SingleCounter {
    fd: OwnedFd,
    label: String,
    /// Time-enabled at the most recent reset.
    baseline: u64,
}

impl SingleCounter {
    /// Open a single counter for `pid` on `cpu` (-1 for any), created
    /// disabled.
    pub fn open(
        event: &dyn Configure,
        opts: &PerfOptions,
        pid: i32,
        cpu: i32,
    ) -> Result<Self, CounterError> {
        let mut attr = base_attr(opts, true);
        event.configure(&mut attr);
        let fd = open_fd(&mut attr, pid, cpu, -1, event.label())?;
        Ok(Self { fd, label: event.label().to_string(), baseline: 0 })
    }

    pub fn enable(&self) -> Result<(), CounterError> {
        check_ioctl(
            unsafe { sys::ioctls::ENABLE(self.fd.as_raw_fd(), 0) },
            &self.label,
        )
    }

    pub fn disable(&self) -> Result<(), CounterError> {
        check_ioctl(
            unsafe { sys::ioctls::DISABLE(self.fd.as_raw_fd(), 0) },
            &self.label,
        )
    }

    /// Zero the count and snapshot the time-enabled baseline.
    pub fn reset(&mut self) -> Result<(), CounterError> {
        check_ioctl(
            unsafe { sys::ioctls::RESET(self.fd.as_raw_fd(), 0) },
            &self.label,
        )?;
        self.baseline = self.read_raw()?.enabled;
        Ok(())
    }

    fn read_raw(&self) -> Result<RawCount, CounterError> {
        let mut buf = [0u64; 3];
        read_words(self.fd.as_raw_fd(), &mut buf, &self.label)?;
        Ok(RawCount { value: buf[0], enabled: buf[1], running: buf[2] })
    }
}

/// A leader plus followers opened with a shared `group_fd`: the kernel
/// schedules the whole group onto the PMU at once, so member counts are
/// directly comparable.
pub struct GroupCounter {
    leader: OwnedFd,
    // Follower fds are never read individually (the leader read returns the
    // whole group) but must stay open for the counters to exist.
    _followers: Vec<OwnedFd>,
    labels: Vec<String>,
    baseline: u64,
}

impl GroupCounter {
    /// Open `events` as one scheduling group. The leader is created
    /// disabled; followers are enabled and disabled with it.
    pub fn open(
        events: &[EventSpec],
        opts: &PerfOptions,
        pid: i32,
        cpu: i32,
    ) -> Result<Self, CounterError> {
        let mut leader: Option<OwnedFd> = None;
        let mut followers = Vec::new();
        let mut labels = Vec::new();

        for event in events {
            let mut attr = base_attr(opts, leader.is_none());
            event.configure(&mut attr);
            match &leader {
                None => {
                    attr.read_format |= u64::from(bindings::PERF_FORMAT_GROUP);
                    leader = Some(open_fd(&mut attr, pid, cpu, -1, event.label())?);
                }
                Some(fd) => {
                    followers.push(open_fd(&mut attr, pid, cpu, fd.as_raw_fd(), event.label())?);
                }
            }
            labels.push(event.label().to_string());
        }

        let Some(leader) = leader else {
            return Err(CounterError::Open {
                label: String::from("group"),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty event group"),
            });
        };
        Ok(Self { leader, _followers: followers, labels, baseline: 0 })
    }

    fn group_label(&self) -> &str {
        self.labels.first().map(String::as_str).unwrap_or("group")
    }

    pub fn enable(&self) -> Result<(), CounterError> {
        check_ioctl(
            unsafe { sys::ioctls::ENABLE(self.leader.as_raw_fd(), bindings::PERF_IOC_FLAG_GROUP) },
            self.group_label(),
        )
    }

    pub fn disable(&self) -> Result<(), CounterError> {
        check_ioctl(
            unsafe {
                sys::ioctls::DISABLE(self.leader.as_raw_fd(), bindings::PERF_IOC_FLAG_GROUP)
            },
            self.group_label(),
        )
    }

    pub fn reset(&mut self) -> Result<(), CounterError> {
        check_ioctl(
            unsafe { sys::ioctls::RESET(self.leader.as_raw_fd(), bindings::PERF_IOC_FLAG_GROUP) },
            self.group_label(),
        )?;
        let (_, enabled, _) = self.read_group()?;
        self.baseline = enabled;
        Ok(())
    }

    /// Read the whole group through the leader:
    /// `{nr, time_enabled, time_running, value[nr]}`.
    fn read_group(&self) -> Result<(Vec<u64>, u64, u64), CounterError> {
        let mut buf = vec![0u64; 3 + self.labels.len()];
        read_words(self.leader.as_raw_fd(), &mut buf, self.group_label())?;
        let nr = buf[0] as usize;
        let values = buf[3..3 + nr.min(self.labels.len())].to_vec();
        Ok((values, buf[1], buf[2]))
    }
}

/// All counters for one (PID, region) pair behind one façade.
pub struct CounterSet {
    base: Vec<SingleCounter>,
    groups: Vec<GroupCounter>,
}

impl CounterSet {
    /// Open every requested counter for `pid`. Failures are collected and
    /// returned alongside the set; the set still works with whichever
    /// counters did open.
    pub fn open(events: &Events, opts: &PerfOptions, pid: i32, cpu: i32) -> (Self, CounterErrors) {
        let mut errors = Vec::new();
        let mut base = Vec::new();
        for event in &events.base {
            match SingleCounter::open(event, opts, pid, cpu) {
                Ok(counter) => base.push(counter),
                Err(e) => errors.push(e),
            }
        }
        let mut groups = Vec::new();
        for group in &events.groups {
            if group.is_empty() {
                continue;
            }
            match GroupCounter::open(group, opts, pid, cpu) {
                Ok(counter) => groups.push(counter),
                Err(e) => errors.push(e),
            }
        }
        (Self { base, groups }, CounterErrors(errors))
    }

    pub fn enable(&self) -> Result<(), CounterErrors> {
        self.apply(SingleCounter::enable, GroupCounter::enable)
    }

    pub fn disable(&self) -> Result<(), CounterErrors> {
        self.apply(SingleCounter::disable, GroupCounter::disable)
    }

    pub fn reset(&mut self) -> Result<(), CounterErrors> {
        let mut errors = Vec::new();
        for counter in &mut self.base {
            if let Err(e) = counter.reset() {
                errors.push(e);
            }
        }
        for group in &mut self.groups {
            if let Err(e) = group.reset() {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CounterErrors(errors))
        }
    }

    fn apply(
        &self,
        single: fn(&SingleCounter) -> Result<(), CounterError>,
        group: fn(&GroupCounter) -> Result<(), CounterError>,
    ) -> Result<(), CounterErrors> {
        let mut errors = Vec::new();
        for counter in &self.base {
            if let Err(e) = single(counter) {
                errors.push(e);
            }
        }
        for g in &self.groups {
            if let Err(e) = group(g) {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CounterErrors(errors))
        }
    }

    /// Read every counter, rescaling multiplexed values. A counter that
    /// never ran (time-running of zero) yields an empty Metrics; a counter
    /// that fails to read is logged and skipped.
    pub fn metrics(&self) -> Metrics {
        let mut counts = Vec::new();
        let mut elapsed = 0u64;

        for counter in &self.base {
            let raw = match counter.read_raw() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("{e}");
                    continue;
                }
            };
            if raw.running == 0 {
                return Metrics::default();
            }
            counts.push(Count {
                label: counter.label.clone(),
                value: scaled(raw, &counter.label),
            });
            elapsed = elapsed.max(raw.enabled.saturating_sub(counter.baseline));
        }

        for group in &self.groups {
            let (values, enabled, running) = match group.read_group() {
                Ok(read) => read,
                Err(e) => {
                    warn!("{e}");
                    continue;
                }
            };
            if running == 0 {
                return Metrics::default();
            }
            for (label, value) in group.labels.iter().zip(values) {
                counts.push(Count {
                    label: label.clone(),
                    value: scaled(RawCount { value, enabled, running }, label),
                });
            }
            elapsed = elapsed.max(enabled.saturating_sub(group.baseline));
        }

        Metrics { counts, elapsed: Duration::from_nanos(elapsed) }
    }
}

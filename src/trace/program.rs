//! Multi-process supervision: one wait loop classifying every stop.
//!
//! A [`Program`] owns every task being traced. Threads and children that
//! share or copy the original text keep being traced; a task that calls
//! execve is moved aside (its text no longer contains our breakpoints) but
//! stays attached so its later stops and exit can still be classified.
//!
//! The blocking multi-process wait runs on a short-lived helper thread so
//! cancellation can race it through a channel select; every ptrace request
//! stays on the supervising thread, which must not change for the lifetime
//! of the trace (the kernel binds tracees to the tracer's thread id).

use std::collections::HashMap;

use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::proc::TracedProc;
use super::region::{Region, RegionEvent};
use crate::domain::errors::TraceError;
use crate::symbols::RegionResolver;

type WaitResult = Result<WaitStatus, nix::Error>;

/// How the process that just stopped must be resumed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Status {
    /// A foreign signal to re-deliver on continue.
    pub deliver: Option<Signal>,
    /// The stop was a group stop; resume with PTRACE_LISTEN.
    pub group_stop: bool,
}

/// A collection of traced processes executing the same text.
pub struct Program<'a> {
    procs: HashMap<i32, TracedProc>,
    untraced: HashMap<i32, TracedProc>,
    regions: Vec<Region>,
    resolver: &'a dyn RegionResolver,
    /// Canonical breakpoint map seeded into every inherited child.
    breakpoints: HashMap<u64, u8>,
}

impl<'a> Program<'a> {
    /// Start `target args...` under the supervisor. Returns the program and
    /// the root PID.
    pub fn spawn(
        resolver: &'a dyn RegionResolver,
        target: &str,
        args: &[String],
        regions: Vec<Region>,
    ) -> Result<(Self, Pid), TraceError> {
        let proc = TracedProc::spawn(resolver, target, args, &regions)?;
        Ok(Self::from_proc(proc, resolver, regions))
    }

    /// Attach to a live PID instead of spawning.
    pub fn attach(
        resolver: &'a dyn RegionResolver,
        pid: i32,
        regions: Vec<Region>,
    ) -> Result<(Self, Pid), TraceError> {
        let proc = TracedProc::attach(Pid::from_raw(pid), resolver, &regions)?;
        Ok(Self::from_proc(proc, resolver, regions))
    }

    fn from_proc(
        proc: TracedProc,
        resolver: &'a dyn RegionResolver,
        regions: Vec<Region>,
    ) -> (Self, Pid) {
        let pid = proc.pid();
        let breakpoints = proc.breakpoints().clone();
        let program = Self {
            procs: HashMap::from([(pid.as_raw(), proc)]),
            untraced: HashMap::new(),
            regions,
            resolver,
            breakpoints,
        };
        (program, pid)
    }

    /// Block until some task stops, classify the stop, and return the
    /// affected PID with any region events it produced. The caller must
    /// resume the task with [`Program::continue_proc`] afterwards.
    ///
    /// A message on `cancel` interrupts the wait: every traced task is
    /// stopped, its text restored, and detached, and the terminal
    /// [`TraceError::Finished`] is returned.
    pub fn wait(
        &mut self,
        cancel: &Receiver<()>,
    ) -> Result<(Pid, Vec<RegionEvent>, Status), TraceError> {
        let (tx, rx) = bounded::<WaitResult>(1);
        std::thread::spawn(move || {
            let _ = tx.send(waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)));
        });

        let status = crossbeam_channel::select! {
            recv(rx) -> msg => msg.map_err(|_| TraceError::WaitLost)??,
            recv(cancel) -> _ => {
                self.detach_all(&rx);
                return Err(TraceError::Finished);
            }
        };

        self.classify(status)
    }

    fn classify(
        &mut self,
        status: WaitStatus,
    ) -> Result<(Pid, Vec<RegionEvent>, Status), TraceError> {
        let mut out = Status::default();
        let Some(pid) = status.pid() else {
            return Ok((Pid::from_raw(0), Vec::new(), out));
        };
        let raw = pid.as_raw();

        let untraced = self.untraced.contains_key(&raw);
        if !self.procs.contains_key(&raw) && !untraced {
            // A thread or child the kernel attached automatically because
            // of the TRACECLONE/TRACEFORK options. It shares (or copied)
            // the parent's patched text, so it inherits the canonical
            // breakpoint map without installing anything.
            let proc = TracedProc::new_traced(
                pid,
                self.resolver,
                &self.regions,
                self.breakpoints.clone(),
                false,
            )?;
            self.procs.insert(raw, proc);
            info!("{raw}: new process created (tracing enabled)");
            return Ok((pid, Vec::new(), out));
        }

        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                info!("{raw}: exited");
                if let Some(mut proc) = self.procs.remove(&raw) {
                    proc.mark_exited();
                }
                self.untraced.remove(&raw);
                if self.procs.is_empty() {
                    return Err(TraceError::Finished);
                }
                Ok((pid, Vec::new(), out))
            }

            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                if untraced {
                    return Ok((pid, Vec::new(), out));
                }
                let events = match self.procs.get_mut(&raw) {
                    Some(proc) => proc.handle_interrupt()?,
                    None => Vec::new(),
                };
                Ok((pid, events, out))
            }

            WaitStatus::Stopped(_, signal) => {
                // A signal from the outside world; re-deliver it on continue.
                info!("{raw}: received signal '{signal}'");
                out.deliver = Some(signal);
                Ok((pid, Vec::new(), out))
            }

            WaitStatus::PtraceEvent(_, _, event) => {
                self.classify_event(pid, event, &mut out)?;
                Ok((pid, Vec::new(), out))
            }

            // Not stopped (spurious wakeups, syscall stops we never asked
            // for): nothing to do.
            _ => Ok((pid, Vec::new(), out)),
        }
    }

    fn classify_event(
        &mut self,
        pid: Pid,
        event: i32,
        out: &mut Status,
    ) -> Result<(), TraceError> {
        let raw = pid.as_raw();
        if event == Event::PTRACE_EVENT_STOP as i32 {
            info!("{raw}: received group stop");
            out.group_stop = true;
        } else if event == Event::PTRACE_EVENT_CLONE as i32 {
            // The new thread shows up as an unknown PID on a later wait.
            match self.tracer_of(raw).map(|t| t.get_event_msg()) {
                Some(Ok(new_pid)) => info!("{raw}: called clone() = {new_pid}"),
                Some(Err(e)) => warn!("{raw}: called clone(), event message lost: {e}"),
                None => debug!("{raw}: clone event from unknown proc"),
            }
        } else if event == Event::PTRACE_EVENT_FORK as i32 {
            info!("{raw}: called fork()");
        } else if event == Event::PTRACE_EVENT_VFORK as i32 {
            info!("{raw}: called vfork()");
        } else if event == Event::PTRACE_EVENT_EXEC as i32 {
            // New text: our breakpoints no longer exist in this image.
            info!("{raw}: called exec() (tracing disabled)");
            if let Some(proc) = self.procs.remove(&raw) {
                self.untraced.insert(raw, proc);
            }
        } else {
            return Err(TraceError::UnknownTrapCause(event));
        }
        Ok(())
    }

    fn tracer_of(&self, raw: i32) -> Option<&super::tracer::Tracer> {
        self.procs
            .get(&raw)
            .or_else(|| self.untraced.get(&raw))
            .map(TracedProc::tracer)
    }

    /// Resume the given process according to its wait status. A process
    /// that already exited is a no-op.
    pub fn continue_proc(&mut self, pid: Pid, status: &Status) -> Result<(), TraceError> {
        let raw = pid.as_raw();
        match self.procs.get(&raw).or_else(|| self.untraced.get(&raw)) {
            Some(proc) => proc.cont(status.deliver, status.group_stop),
            None => Ok(()),
        }
    }

    /// Stop and release every traced task: interrupt them, drain the
    /// resulting stops (the in-flight waiter owns one of them), restore
    /// every patched byte, and detach. Errors are ignored; this is the
    /// cancellation path and the tracees must be left runnable regardless.
    fn detach_all(&mut self, rx: &Receiver<WaitResult>) {
        for proc in self.procs.values() {
            let _ = proc.tracer().interrupt();
        }

        let mut consumed = None;
        if let Ok(Ok(status)) = rx.recv() {
            consumed = status.pid();
        }

        for (raw, proc) in &mut std::mem::take(&mut self.procs) {
            let pid = Pid::from_raw(*raw);
            if consumed != Some(pid) {
                let _ = waitpid(pid, None);
            }
            proc.clear_breaks();
            let _ = proc.tracer().detach();
            debug!("{raw}: detached");
        }
    }
}

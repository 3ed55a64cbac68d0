//! Per-process tracing state: breakpoints and region state machines.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Command;

use log::{debug, warn};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use super::region::{ActiveRegion, Region, RegionEvent, RegionPhase};
use super::tracer::Tracer;
use crate::domain::errors::TraceError;
use crate::symbols::RegionResolver;

/// INT3 on x86_64; executing it raises the SIGTRAP that hands control back.
const INTERRUPT: [u8; 1] = [0xCC];

pub(crate) fn trace_options() -> Options {
    Options::PTRACE_O_EXITKILL
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC
}

/// One traced task: its tracer handle, load bias, the set of installed
/// breakpoints (address → saved original byte) and the per-region state
/// machines.
pub struct TracedProc {
    tracer: Tracer,
    load_bias: u64,
    regions: Vec<ActiveRegion>,
    breakpoints: HashMap<u64, u8>,
    exited: bool,
}

impl TracedProc {
    /// Spawn `target args...` stopped under ptrace, install a breakpoint at
    /// every region start, and set the task running with the full option
    /// mask. Stdio is inherited from the supervisor.
    pub(crate) fn spawn(
        resolver: &dyn RegionResolver,
        target: &str,
        args: &[String],
        regions: &[Region],
    ) -> Result<Self, TraceError> {
        let mut cmd = Command::new(target);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(|| {
                ptrace::traceme()?;
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        // The traceme child stops with SIGTRAP when it reaches execve.
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            status => return Err(TraceError::UnexpectedStop(format!("{status:?}"))),
        }

        let proc = Self::new_traced(pid, resolver, regions, HashMap::new(), true)?;

        // Swap the traceme attachment for a seize so group stops are
        // delivered correctly, then consume the stop the seize generates.
        proc.tracer.reattach_and_continue(trace_options())?;
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) | WaitStatus::PtraceEvent(..) => {}
            status => return Err(TraceError::UnexpectedStop(format!("{status:?}"))),
        }
        proc.cont(None, false)?;

        Ok(proc)
    }

    /// Attach to an already-running task. The task is seized with the full
    /// option mask, stopped once to install the region-start breakpoints,
    /// and resumed.
    pub(crate) fn attach(
        pid: Pid,
        resolver: &dyn RegionResolver,
        regions: &[Region],
    ) -> Result<Self, TraceError> {
        let tracer = Tracer::new(pid);
        tracer.seize(trace_options())?;
        tracer.interrupt()?;
        waitpid(pid, None)?;

        let proc = Self::new_traced(pid, resolver, regions, HashMap::new(), true)?;
        proc.cont(None, false)?;
        Ok(proc)
    }

    /// Build the per-task state for a stopped tracee. With `install` set,
    /// a breakpoint is placed at every region's start address; an inherited
    /// task instead receives a copy of its parent's breakpoint map, since
    /// the patched text already exists in its (shared or forked) address
    /// space.
    pub(crate) fn new_traced(
        pid: Pid,
        resolver: &dyn RegionResolver,
        regions: &[Region],
        seed: HashMap<u64, u8>,
        install: bool,
    ) -> Result<Self, TraceError> {
        let bias = resolver.load_bias(pid.as_raw())?;
        debug!("{pid}: load bias is 0x{bias:x}");

        let mut proc = Self {
            tracer: Tracer::new(pid),
            load_bias: bias,
            regions: Vec::with_capacity(regions.len()),
            breakpoints: seed,
            exited: false,
        };

        for (id, region) in regions.iter().enumerate() {
            let start = region.start(bias);
            if install {
                proc.set_break(start)?;
            }
            proc.regions.push(ActiveRegion {
                region: *region,
                phase: RegionPhase::Start,
                cur_interrupt: start,
                id,
            });
        }

        Ok(proc)
    }

    pub fn pid(&self) -> Pid {
        self.tracer.pid()
    }

    pub(crate) fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub(crate) fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub(crate) fn breakpoints(&self) -> &HashMap<u64, u8> {
        &self.breakpoints
    }

    pub(crate) fn mark_exited(&mut self) {
        self.exited = true;
    }

    /// Patch `0xCC` over the first byte at `pc`, remembering the original.
    /// No-op if a breakpoint is already installed there.
    fn set_break(&mut self, pc: u64) -> Result<(), TraceError> {
        if self.breakpoints.contains_key(&pc) {
            return Ok(());
        }
        let mut orig = [0u8; 1];
        self.tracer.peek_data(pc, &mut orig)?;
        self.tracer.poke_data(pc, &INTERRUPT)?;
        self.breakpoints.insert(pc, orig[0]);
        Ok(())
    }

    /// Restore the original byte at `pc` and forget the breakpoint.
    fn remove_break(&mut self, pc: u64) -> Result<(), TraceError> {
        let orig = self
            .breakpoints
            .remove(&pc)
            .ok_or(TraceError::InvalidBreakpoint(pc))?;
        self.tracer.poke_data(pc, &[orig])
    }

    /// Restore every saved byte, leaving the tracee's text pristine.
    /// Best-effort: used on the detach path, where a failed poke must not
    /// stop the remaining restorations.
    pub(crate) fn clear_breaks(&mut self) {
        for (pc, orig) in std::mem::take(&mut self.breakpoints) {
            if let Err(e) = self.tracer.poke_data(pc, &[orig]) {
                warn!("{}: failed to restore byte at 0x{pc:x}: {e}", self.pid());
            }
        }
    }

    /// Handle a breakpoint SIGTRAP.
    ///
    /// The trap fires after the `0xCC` has executed, so the instruction
    /// pointer is first rewound onto the patched address. The breakpoint is
    /// removed once, then every region armed at that address emits an event
    /// and advances: Start → End computes the dynamic end address, End →
    /// Start re-arms the entry. Each advance reinstalls its next breakpoint,
    /// which may re-add the address just removed when regions overlap.
    pub(crate) fn handle_interrupt(&mut self) -> Result<Vec<RegionEvent>, TraceError> {
        let mut regs = self.tracer.get_regs()?;
        regs.rip -= INTERRUPT.len() as u64;
        self.tracer.set_regs(&regs)?;

        debug!("{}: interrupt at 0x{:x}", self.pid(), regs.rip);

        self.remove_break(regs.rip)?;

        let mut events = Vec::new();
        for i in 0..self.regions.len() {
            let (region, phase, armed) = {
                let r = &self.regions[i];
                (r.region, r.phase, r.cur_interrupt)
            };
            if armed != regs.rip {
                continue;
            }
            events.push(RegionEvent { id: self.regions[i].id, phase });

            let (next_phase, next_pc) = match phase {
                RegionPhase::Start => (RegionPhase::End, region.end(regs.rsp, self)?),
                RegionPhase::End => (RegionPhase::Start, region.start(self.load_bias)),
            };
            let r = &mut self.regions[i];
            r.phase = next_phase;
            r.cur_interrupt = next_pc;
            self.set_break(next_pc)?;
        }

        Ok(events)
    }

    /// Resume the task. A group stop is resumed with `PTRACE_LISTEN` (no
    /// signal injection); otherwise any foreign signal received while
    /// waiting is re-delivered.
    pub(crate) fn cont(&self, signal: Option<Signal>, group_stop: bool) -> Result<(), TraceError> {
        if self.exited {
            return Ok(());
        }
        if group_stop {
            return self.tracer.listen();
        }
        self.tracer.cont(signal)
    }
}

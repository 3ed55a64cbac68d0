//! Thin typed wrapper over ptrace and `process_vm_readv`/`writev`.
//!
//! Every request here is issued from the supervising thread; the kernel
//! ties the tracee relationship to that thread's id, so the wrapper must
//! never be driven from more than one OS thread.

use std::io::{IoSlice, IoSliceMut};
use std::mem;

use libc::user_regs_struct;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

use crate::domain::errors::TraceError;

const WORD: usize = mem::size_of::<libc::c_long>();

fn addr_of(addr: u64) -> ptrace::AddressType {
    addr as usize as ptrace::AddressType
}

/// A PID-bound handle for ptrace requests against one tracee task.
#[derive(Debug)]
pub struct Tracer {
    pid: Pid,
}

impl Tracer {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn seize(&self, options: Options) -> Result<(), TraceError> {
        ptrace::seize(self.pid, options)?;
        Ok(())
    }

    /// Re-attach to a tracee that was started with `PTRACE_TRACEME`.
    ///
    /// Group stops are only reported properly for tracees attached with
    /// `PTRACE_SEIZE`, so the initial traceme attachment is swapped out:
    /// stop the task, detach, seize it with the desired options, and let it
    /// run again. The caller must consume the stop generated by the
    /// re-attachment before continuing the tracee.
    pub fn reattach_and_continue(&self, options: Options) -> Result<(), TraceError> {
        signal::kill(self.pid, Signal::SIGSTOP)?;
        ptrace::detach(self.pid, None)?;
        ptrace::seize(self.pid, options)?;
        signal::kill(self.pid, Signal::SIGCONT)?;
        Ok(())
    }

    /// Resume the tracee, delivering `signal` if one is pending for it.
    pub fn cont(&self, signal: Option<Signal>) -> Result<(), TraceError> {
        ptrace::cont(self.pid, signal)?;
        Ok(())
    }

    /// Resume a group-stopped tracee without letting it run: the task stays
    /// stopped as far as job control is concerned but will report further
    /// events. Restarting a group stop with `cont` would wrongly cancel it.
    pub fn listen(&self) -> Result<(), TraceError> {
        // nix has no PTRACE_LISTEN wrapper
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_LISTEN,
                self.pid.as_raw(),
                0_usize,
                0_usize,
            )
        };
        Errno::result(res)?;
        Ok(())
    }

    /// Resume the tracee, stopping at the next syscall entry or exit.
    pub fn syscall(&self, signal: Option<Signal>) -> Result<(), TraceError> {
        ptrace::syscall(self.pid, signal)?;
        Ok(())
    }

    /// Stop the tracee with a `PTRACE_EVENT_STOP`.
    pub fn interrupt(&self) -> Result<(), TraceError> {
        ptrace::interrupt(self.pid)?;
        Ok(())
    }

    pub fn detach(&self) -> Result<(), TraceError> {
        ptrace::detach(self.pid, None)?;
        Ok(())
    }

    pub fn get_regs(&self) -> Result<user_regs_struct, TraceError> {
        Ok(ptrace::getregs(self.pid)?)
    }

    pub fn set_regs(&self, regs: &user_regs_struct) -> Result<(), TraceError> {
        ptrace::setregs(self.pid, *regs)?;
        Ok(())
    }

    /// Fetch the event message of the current stop; for clone/fork/vfork
    /// events this is the new task's PID.
    pub fn get_event_msg(&self) -> Result<libc::c_long, TraceError> {
        Ok(ptrace::getevent(self.pid)?)
    }

    /// Read `buf.len()` bytes of tracee memory at `addr`, word by word.
    pub fn peek_data(&self, addr: u64, buf: &mut [u8]) -> Result<(), TraceError> {
        let mut read = 0;
        while read < buf.len() {
            let word = ptrace::read(self.pid, addr_of(addr + read as u64))?;
            let bytes = word.to_ne_bytes();
            let n = usize::min(WORD, buf.len() - read);
            buf[read..read + n].copy_from_slice(&bytes[..n]);
            read += n;
        }
        Ok(())
    }

    /// Write `data` into tracee memory at `addr`. Partial trailing words
    /// are read back first so the bytes beyond `data` survive the poke.
    /// Pokes go through ptrace rather than `process_vm_writev` because the
    /// latter respects page protections and cannot patch read-only text.
    pub fn poke_data(&self, addr: u64, data: &[u8]) -> Result<(), TraceError> {
        let mut written = 0;
        while written < data.len() {
            let cur = addr + written as u64;
            let left = data.len() - written;
            let word = if left >= WORD {
                let mut bytes = [0u8; WORD];
                bytes.copy_from_slice(&data[written..written + WORD]);
                libc::c_long::from_ne_bytes(bytes)
            } else {
                let mut bytes = ptrace::read(self.pid, addr_of(cur))?.to_ne_bytes();
                bytes[..left].copy_from_slice(&data[written..]);
                libc::c_long::from_ne_bytes(bytes)
            };
            self.poke_word(cur, word)?;
            written += usize::min(WORD, left);
        }
        Ok(())
    }

    fn poke_word(&self, addr: u64, word: libc::c_long) -> Result<(), TraceError> {
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.pid.as_raw(),
                addr as usize,
                word,
            )
        };
        Errno::result(res)?;
        Ok(())
    }

    /// Vectored read of tracee memory, bypassing the word-granular ptrace
    /// path. Requires the caller to hold ptrace permissions on the tracee.
    pub fn read_vm(&self, addr: u64, buf: &mut [u8]) -> Result<(), TraceError> {
        let want = buf.len();
        let remote = [RemoteIoVec { base: addr as usize, len: want }];
        let mut local = [IoSliceMut::new(buf)];
        let got = process_vm_readv(self.pid, &mut local, &remote)?;
        if got != want {
            return Err(TraceError::ShortTransfer { want, got });
        }
        Ok(())
    }

    /// Vectored write of tracee memory.
    pub fn write_vm(&self, addr: u64, data: &[u8]) -> Result<(), TraceError> {
        let want = data.len();
        let remote = [RemoteIoVec { base: addr as usize, len: want }];
        let local = [IoSlice::new(data)];
        let got = process_vm_writev(self.pid, &local, &remote)?;
        if got != want {
            return Err(TraceError::ShortTransfer { want, got });
        }
        Ok(())
    }
}

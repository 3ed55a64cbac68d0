//! Regions: pairs of program-counter locations that gate counting.

use super::proc::TracedProc;
use crate::domain::errors::TraceError;

/// Whether the tracee has just entered or just left a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionPhase {
    Start,
    End,
}

/// A fixed address range. Both ends are unbiased; the load bias is added on
/// use.
#[derive(Debug, Clone, Copy)]
pub struct AddressRegion {
    pub start: u64,
    pub end: u64,
}

/// A function region: starts at the function entry, ends at the dynamic
/// return address.
#[derive(Debug, Clone, Copy)]
pub struct FuncRegion {
    pub addr: u64,
}

/// The two region variants, distinguished by whether the end address is
/// fixed in advance or discovered from the stack when the region starts.
#[derive(Debug, Clone, Copy)]
pub enum Region {
    Address(AddressRegion),
    Func(FuncRegion),
}

impl Region {
    /// Biased start address for a particular process.
    pub(crate) fn start(&self, bias: u64) -> u64 {
        match self {
            Region::Address(a) => a.start.wrapping_add(bias),
            Region::Func(f) => f.addr.wrapping_add(bias),
        }
    }

    /// Biased end address. For a function region the entry breakpoint has
    /// just fired, so the call instruction's return address sits at the top
    /// of the stack; it is read back as an absolute address, no bias added.
    ///
    /// If the same function is entered again on the same thread before this
    /// end address is reached (recursion, or a second call), the earlier
    /// end address is overwritten and that earlier instance is lost.
    pub(crate) fn end(&self, sp: u64, proc: &TracedProc) -> Result<u64, TraceError> {
        match self {
            Region::Address(a) => Ok(a.end.wrapping_add(proc.load_bias())),
            Region::Func(_) => {
                let mut buf = [0u8; 8];
                proc.tracer().read_vm(sp, &mut buf)?;
                Ok(u64::from_le_bytes(buf))
            }
        }
    }
}

/// A region boundary crossing observed on some process.
#[derive(Debug, Clone, Copy)]
pub struct RegionEvent {
    /// Index into the engine's region list.
    pub id: usize,
    pub phase: RegionPhase,
}

/// Per-process tracking state for one region.
#[derive(Debug)]
pub(crate) struct ActiveRegion {
    pub region: Region,
    pub phase: RegionPhase,
    /// The one address where this region currently has a breakpoint armed.
    pub cur_interrupt: u64,
    pub id: usize,
}

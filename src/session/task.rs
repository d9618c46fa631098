use crate::kernel_abi::SupportedArch;
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::session::address_space::AddressSpaceSharedPtr;
use crate::wait_status::{MaybeStopSignal, WaitStatus};
use libc::pid_t;

/// Enumeration of ways to resume execution. See the ptrace manual for
/// the semantics.
///
/// A strong type so callers can't confuse a resume request with the
/// other integers flying around ptrace call sites.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    ResumeCont = libc::PTRACE_CONT as u32,
    ResumeSinglestep = libc::PTRACE_SINGLESTEP as u32,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum WaitRequest {
    /// After resuming, blocking-waitpid() until the tracee status changes.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

/// A stopped tracee, as seen by the fast-forward engine.
///
/// The contract mirrors ptrace: the tracee is stopped whenever a method
/// is invoked, `resume_execution` with `ResumeWait` blocks until the next
/// stop, and the implementation clears the debug status (DR6) on every
/// resume so it only ever reflects events since the last stop.
///
/// The implementation is also responsible for materializing the
/// breakpoint and watchpoint registry returned by `vm()` into the tracee
/// (int3 bytes, debug registers) before execution resumes.
pub trait Task {
    /// The tid of the tracee, for diagnostics.
    fn tid(&self) -> pid_t;

    fn arch(&self) -> SupportedArch;

    /// The current register file. Reads during one decision round must go
    /// through a single snapshot; this returns the live one.
    fn regs_ref(&self) -> &Registers;

    fn set_regs(&mut self, regs: &Registers);

    /// The current $ip of the tracee.
    fn ip(&self) -> RemoteCodePtr {
        self.regs_ref().ip()
    }

    /// Resume execution and, with `WaitRequest::ResumeWait`, block until
    /// the tracee next stops.
    fn resume_execution(&mut self, how: ResumeRequest, wait_how: WaitRequest);

    /// The status of the last wait.
    fn status(&self) -> WaitStatus;

    /// The signal that stopped the tracee as of the last wait.
    fn maybe_stop_sig(&self) -> MaybeStopSignal {
        self.status().maybe_stop_sig()
    }

    /// The debug status (DR6 on x86) reported at the last stop.
    fn debug_status(&self) -> usize;

    /// Read and clear the debug status.
    fn consume_debug_status(&mut self) -> usize;

    /// Read up to `buf.len()` bytes from `addr` in the tracee, returning
    /// how many bytes were read. Short reads happen at mapping
    /// boundaries; `Err` means nothing was readable.
    fn read_bytes_fallible(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) -> Result<usize, ()>;

    /// The breakpoint/watchpoint registry shared by every task in this
    /// address space.
    fn vm(&self) -> AddressSpaceSharedPtr;
}

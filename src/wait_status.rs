use crate::kernel_metadata::{ptrace_event_name, signal_name};
use crate::sig::Sig;
use libc::{SIGSTOP, SIGTRAP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. (See ptrace man page.)
    /// You must use PTRACE_SEIZE to generate PTRACE_EVENT_STOPs, or these
    /// will be treated as STOP_SIGNAL.
    GroupStop,
    /// Task is in a syscall-stop triggered by PTRACE_SYSCALL
    /// and PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop, except for PTRACE_EVENT_STOP
    /// which is treated as GroupStop.
    PtraceEvent,
}

/// The stop signal reported by the last wait, if the task stopped for a
/// signal at all. Compares directly against `Sig` constants.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MaybeStopSignal(Option<Sig>);

impl MaybeStopSignal {
    pub fn new_sig(sig: i32) -> MaybeStopSignal {
        MaybeStopSignal(Sig::try_from(sig).ok())
    }

    pub fn not_a_sig() -> MaybeStopSignal {
        MaybeStopSignal(None)
    }

    pub fn is_sig(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_not_sig(&self) -> bool {
        self.0.is_none()
    }

    pub fn unwrap_sig(self) -> Sig {
        self.0.unwrap()
    }
}

impl PartialEq<Sig> for MaybeStopSignal {
    fn eq(&self, other: &Sig) -> bool {
        self.0 == Some(*other)
    }
}

impl Display for MaybeStopSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(sig) => write!(f, "{}", sig),
            None => write!(f, "(no signal)"),
        }
    }
}

/// A raw `waitpid` status word and accessors to pick it apart.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl Default for WaitStatus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.maybe_stop_sig().is_sig() {
            return WaitType::SignalStop;
        }

        if self.maybe_group_stop_sig().is_sig() {
            return WaitType::GroupStop;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        if WIFSIGNALED(self.status) && WTERMSIG(self.status) > 0 {
            Some(WTERMSIG(self.status))
        } else {
            None
        }
    }

    /// Stop signal if wait_type() == SignalStop, otherwise not-a-signal.
    /// A zero signal (rare but observed via PTRACE_INTERRUPT) is converted
    /// to SIGSTOP.
    pub fn maybe_stop_sig(&self) -> MaybeStopSignal {
        // (status >> 16) & 0xff != 0 means a ptrace event or a group stop.
        if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff) != 0 {
            return MaybeStopSignal::not_a_sig();
        }

        let mut sig = WSTOPSIG(self.status);
        if sig == (SIGTRAP | 0x80) {
            // Syscall-enter or syscall-exit stop under PTRACE_O_TRACESYSGOOD.
            return MaybeStopSignal::not_a_sig();
        }

        sig &= !0x80;
        MaybeStopSignal::new_sig(if sig != 0 { sig } else { SIGSTOP })
    }

    /// Group stop signal if wait_type() == GroupStop, otherwise
    /// not-a-signal. A zero signal is converted to SIGSTOP.
    pub fn maybe_group_stop_sig(&self) -> MaybeStopSignal {
        // (status >> 16) & 0xff == PTRACE_EVENT_STOP is the signature of a
        // group stop when PTRACE_SEIZE is used.
        if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff) != libc::PTRACE_EVENT_STOP {
            return MaybeStopSignal::not_a_sig();
        }

        let sig = WSTOPSIG(self.status) & !0x80;
        MaybeStopSignal::new_sig(if sig != 0 { sig } else { SIGSTOP })
    }

    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !WIFSTOPPED(self.status) {
            return false;
        }

        WSTOPSIG(self.status) == (SIGTRAP | 0x80)
    }

    /// Ptrace event if wait_type() == PtraceEvent, None otherwise.
    pub fn ptrace_event(&self) -> Option<i32> {
        let event = (self.status >> 16) & 0xff;
        if event == libc::PTRACE_EVENT_STOP || event == 0 {
            None
        } else {
            Some(event)
        }
    }

    /// A WaitStatus for a process exit.
    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    /// A WaitStatus for a fatal signal.
    pub fn for_fatal_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: sig.as_raw(),
        }
    }

    /// A WaitStatus for a stop signal.
    pub fn for_stop_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: (sig.as_raw() << 8) | 0x7f,
        }
    }

    /// A WaitStatus for a ptrace event.
    pub fn for_ptrace_event(ptrace_event: i32) -> WaitStatus {
        debug_assert!(ptrace_event >= 1 && ptrace_event < 0x100);
        WaitStatus {
            status: (ptrace_event << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }

    pub fn get(&self) -> i32 {
        self.status
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(f, " (STOP-{})", self.maybe_stop_sig()),
            WaitType::GroupStop => write!(f, " (GROUP-STOP-{})", self.maybe_group_stop_sig()),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig;

    #[test]
    fn stop_sig_round_trip() {
        let status = WaitStatus::for_stop_sig(sig::SIGTRAP);
        assert_eq!(status.wait_type(), WaitType::SignalStop);
        assert!(status.maybe_stop_sig() == sig::SIGTRAP);
        assert!(status.maybe_group_stop_sig().is_not_sig());
        assert!(!status.is_syscall());
    }

    #[test]
    fn exit_code_round_trip() {
        let status = WaitStatus::for_exit_code(3);
        assert_eq!(status.wait_type(), WaitType::Exit);
        assert_eq!(status.exit_code(), Some(3));
        assert!(status.maybe_stop_sig().is_not_sig());
    }

    #[test]
    fn syscall_stop_is_not_a_stop_sig() {
        // SIGTRAP | 0x80 under PTRACE_O_TRACESYSGOOD.
        let status = WaitStatus::new(((SIGTRAP | 0x80) << 8) | 0x7f);
        assert!(status.maybe_stop_sig().is_not_sig());
        assert!(status.is_syscall());
        assert_eq!(status.wait_type(), WaitType::SyscallStop);
    }

    #[test]
    fn ptrace_event_round_trip() {
        let status = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT);
        assert_eq!(status.wait_type(), WaitType::PtraceEvent);
        assert_eq!(status.ptrace_event(), Some(libc::PTRACE_EVENT_EXIT));
    }
}

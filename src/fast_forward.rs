use crate::kernel_abi::SupportedArch;
use crate::log::LogLevel::LogDebug;
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::session::address_space::{
    AddressSpaceSharedPtr, BreakpointType, DebugStatus, WatchConfig, WatchType,
};
use crate::session::task::{ResumeRequest, Task, WaitRequest};
use crate::sig;
use std::cmp::{max, min};
use std::ops::BitOr;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FastForwardStatus {
    /// True if the tracee was advanced past at least one string
    /// instruction iteration beyond the mandatory singlestep.
    pub did_fast_forward: bool,
    /// True if the string instruction still had iterations to go when we
    /// returned, i.e. the tracee is still at the instruction.
    pub incomplete_fast_forward: bool,
}

impl FastForwardStatus {
    pub fn new() -> FastForwardStatus {
        FastForwardStatus {
            did_fast_forward: false,
            incomplete_fast_forward: false,
        }
    }
}

impl Default for FastForwardStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl BitOr for FastForwardStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            did_fast_forward: self.did_fast_forward | rhs.did_fast_forward,
            incomplete_fast_forward: self.incomplete_fast_forward | rhs.incomplete_fast_forward,
        }
    }
}

/// Return true if the instruction at t.ip() is a REP-prefixed string
/// instruction.
pub fn at_x86_string_instruction<T: Task>(t: &mut T) -> bool {
    if !is_x86ish(t) {
        return false;
    }

    let ip = t.ip();
    is_string_instruction_at(t, ip)
}

/// Return true if the instruction at t.ip(), or the instruction
/// immediately before t.ip(), could be a REP-prefixed string instruction.
/// It's OK to return true if it's not really a string instruction
/// (though for performance reasons, this should be rare).
pub fn maybe_at_or_after_x86_string_instruction<T: Task>(t: &mut T) -> bool {
    if !is_x86ish(t) {
        return false;
    }

    let ip = t.ip();
    is_string_instruction_at(t, ip) || is_string_instruction_before(t, ip)
}

/// Perform one or more synchronous singlesteps of `t`. Usually just does
/// one singlestep, except when a singlestep leaves the IP unchanged, i.e.
/// a single instruction represents a loop, as a REP-prefixed x86 string
/// instruction does.
///
/// We always perform at least one singlestep. We stop after a singlestep
/// if one of the following is true, or will be true after one more
/// singlestep:
/// -- Any breakpoint or watchpoint has been triggered
/// -- IP has advanced to the next instruction
/// -- One of the register states in `states` has been reached.
///
/// Spurious returns after any singlestep are also allowed.
///
/// Returns a status whose `did_fast_forward` is true if we fast-forwarded,
/// false if we just did one regular singlestep.
pub fn fast_forward_through_instruction<T: Task>(
    t: &mut T,
    states: &[Registers],
) -> FastForwardStatus {
    let mut result = FastForwardStatus::new();

    let ip = t.ip();

    t.resume_execution(ResumeRequest::ResumeSinglestep, WaitRequest::ResumeWait);
    ed_assert_eq!(t, t.maybe_stop_sig(), sig::SIGTRAP);

    if t.ip() != ip {
        return result;
    }
    if t.vm().get_breakpoint_type_at_addr(ip) != BreakpointType::BkptNone {
        // breakpoint must have fired
        return result;
    }
    if t.debug_status() & DebugStatus::DsWatchpointAny as usize != 0 {
        // watchpoint fired
        return result;
    }
    for state in states {
        if state.matches(t.regs_ref()) {
            return result;
        }
    }
    if !is_x86ish(t) {
        return result;
    }

    let instruction_buf = match read_instruction(t, ip) {
        Ok(buf) => buf,
        Err(()) => return result,
    };
    let decoded = match decode_x86_string_instruction(&instruction_buf) {
        Ok(decoded) => decoded,
        Err(()) => return result,
    };
    let limit_ip = ip + decoded.length;

    let mut extra_state_to_avoid: Option<Registers> = None;

    loop {
        // This string instruction executes until CX reaches 0 and we move
        // to the next instruction, or we hit one of the states in
        // `states`, or the ZF flag changes so that the REP stops, or we
        // hit a watchpoint. (We can't hit a breakpoint during the loop
        // since we already verified there isn't one set here.)

        // We'll compute an upper bound on the number of string
        // instruction iterations to execute, set a watchpoint on the
        // memory location accessed through DI in the iteration we want to
        // stop at, and set a breakpoint after the string instruction to
        // catch it ending via a ZF change.
        // Keep in mind that states in `states` might belong to multiple
        // independent loops of this string instruction, with registers
        // reset in between the loops.

        // One register snapshot per decision round; mixing stale and
        // fresh values here would break the bounding arithmetic.
        let regs = *t.regs_ref();

        let cur_cx = regs.cx();
        if cur_cx == 0 {
            // This instruction will be skipped entirely.
            return result;
        }
        // There is at least one more iteration to go.
        result.incomplete_fast_forward = true;

        // Don't execute the last iteration of the string instruction.
        // That simplifies code below that tries to emulate the register
        // effects of singlestepping, to predict if the next singlestep
        // would reach one of the `states`.
        let mut iterations = cur_cx - 1;

        // Bound `iterations` so we stop before reaching any `states`.
        for state in states.iter().chain(extra_state_to_avoid.iter()) {
            if state.ip() == ip {
                let dest_cx = state.cx();
                if dest_cx == 0 {
                    // This state represents entering the instruction with
                    // CX==0, unreachable in the current loop.
                    continue;
                }
                if dest_cx >= cur_cx {
                    // Can't be reached in the current loop.
                    continue;
                }
                iterations = min(iterations, cur_cx - dest_cx - 1);
            } else if state.ip() == limit_ip {
                let dest_cx = state.cx();
                if dest_cx >= cur_cx {
                    // Can't be reached in the current loop.
                    continue;
                }
                iterations = min(iterations, cur_cx - dest_cx - 1);
            }
        }

        // We don't bound the iterations for a coming ZF change here.
        // Instead we run the loop, observe the ZF change, and rerun the
        // loop with the loop-exit state added to the avoid set. See
        // below.

        // A code watchpoint would already have been hit if we were going
        // to hit it. Check for data watchpoints we might hit when
        // reading/writing memory. Make conservative assumptions about the
        // watchpoint type and assume every string instruction uses both
        // SI and DI; unnecessary bounds just cost a few more singlesteps.
        for watch in t.vm().all_watchpoints() {
            bound_iterations_for_watchpoint(
                regs.si().into(),
                regs.df_flag(),
                &decoded,
                &watch,
                &mut iterations,
            );
            bound_iterations_for_watchpoint(
                regs.di().into(),
                regs.df_flag(),
                &decoded,
                &watch,
                &mut iterations,
            );
        }

        if iterations == 0 {
            return result;
        }

        log!(
            LogDebug,
            "x86-string fast-forward: {} iterations required (ip={})",
            iterations,
            ip
        );
        result.did_fast_forward = true;

        let direction: isize = if regs.df_flag() { -1 } else { 1 };

        // Figure out the address to set a watchpoint at. This address
        // must be accessed at or before the last iteration we want to
        // perform. We have to account for a CPU quirk: Intel CPUs may
        // coalesce iterations to write up to 64 bytes at a time (observed
        // for "rep stosb" on Ivy Bridge). Assume 128 bytes to be safe.
        const BYTES_COALESCED: usize = 128;
        let mut watch_offset = decoded.operand_size * (iterations - 1);
        if watch_offset > BYTES_COALESCED {
            watch_offset -= BYTES_COALESCED;
            let di: RemotePtr<Void> = regs.di().into();
            let watch_di = if direction > 0 {
                di + watch_offset
            } else {
                di - watch_offset
            };
            log!(
                LogDebug,
                "Set x86-string fast-forward watchpoint at {}",
                watch_di
            );
            let vm = t.vm();
            // Watchpoints can be widened to conserve debug registers and
            // then fire spuriously, so take the existing ones out of the
            // way for the duration of the continue.
            vm.save_watchpoints();
            vm.remove_all_watchpoints();
            let ok = vm.add_watchpoint(watch_di, 1, WatchType::WatchReadWrite);
            ed_assert!(t, ok, "Can't even handle one watchpoint?");
            let ok = vm.add_breakpoint(limit_ip, BreakpointType::BkptInternal);
            ed_assert!(t, ok, "Failed to add breakpoint");
            // Saved watchpoints must come back and the internal
            // breakpoint must go, however this phase ends.
            let _saved_traps = SavedTraps { vm, limit_ip };

            t.resume_execution(ResumeRequest::ResumeCont, WaitRequest::ResumeWait);
            ed_assert_eq!(t, t.maybe_stop_sig(), sig::SIGTRAP);
            let debug_status = t.consume_debug_status();
            if debug_status & DebugStatus::DsWatchpointAny as usize == 0 {
                // The watchpoint didn't fire: the loop exited early via a
                // ZF change and ran into the breakpoint. IP is one byte
                // past the breakpoint instruction.
                ed_assert!(
                    t,
                    t.ip() == limit_ip.increment_by_bkpt_insn_length(t.arch())
                        && decoded.modifies_flags
                );
                // Undo the execution of the breakpoint instruction.
                let mut tmp = *t.regs_ref();
                tmp.set_ip(limit_ip);
                t.set_regs(&tmp);
            }

            iterations -= cur_cx - t.regs_ref().cx();
        }

        log!(
            LogDebug,
            "x86-string fast-forward: {} iterations to go",
            iterations
        );

        // Singlestep through the remaining iterations.
        while iterations > 0 && t.ip() == ip {
            t.resume_execution(ResumeRequest::ResumeSinglestep, WaitRequest::ResumeWait);
            ed_assert_eq!(t, t.maybe_stop_sig(), sig::SIGTRAP);
            let debug_status = t.consume_debug_status();
            // No watchpoint can have fired. Even if we exited the loop,
            // no instruction outside it has executed yet, so no EXEC
            // watchpoint can have triggered either.
            ed_assert!(
                t,
                debug_status & DebugStatus::DsWatchpointAny as usize == 0
            );
            iterations -= 1;
        }

        if t.ip() == ip {
            log!(LogDebug, "x86-string fast-forward done");
            return result;
        }

        // We exited the loop early because the compare/scan changed ZF.
        ed_assert!(t, t.ip() == limit_ip && decoded.modifies_flags);
        // String instructions that modify flags have no non-register side
        // effects, so resetting registers unwinds the loop. Rerun it with
        // this loop-exit state added to the states to avoid stepping
        // into. We shouldn't need to do this more than once!
        ed_assert!(t, extra_state_to_avoid.is_none());
        extra_state_to_avoid = Some(*t.regs_ref());
        t.set_regs(&regs);
    }
}

/// Restores the saved watchpoint set and removes the internal breakpoint
/// on every exit path of the batched phase.
struct SavedTraps {
    vm: AddressSpaceSharedPtr,
    limit_ip: RemoteCodePtr,
}

impl Drop for SavedTraps {
    fn drop(&mut self) {
        self.vm
            .remove_breakpoint(self.limit_ip, BreakpointType::BkptInternal);
        self.vm.restore_watchpoints();
    }
}

struct InstructionBuf {
    arch: SupportedArch,
    code_buf: [u8; 32],
    /// code_buf_len <= 32
    code_buf_len: usize,
}

fn read_instruction<T: Task>(t: &mut T, ip: RemoteCodePtr) -> Result<InstructionBuf, ()> {
    let mut result = InstructionBuf {
        arch: t.arch(),
        code_buf: [0u8; 32],
        code_buf_len: 0,
    };
    result.code_buf_len = t.read_bytes_fallible(ip.to_data_ptr::<Void>(), &mut result.code_buf)?;

    Ok(result)
}

#[derive(Default)]
struct DecodedInstruction {
    operand_size: usize,
    length: usize,
    modifies_flags: bool,
}

/// This can be conservative: for weird prefix combinations that make
/// valid string instructions but aren't ever used in practice, we can
/// return Err.
fn decode_x86_string_instruction(code: &InstructionBuf) -> Result<DecodedInstruction, ()> {
    let mut found_operand_prefix = false;
    let mut found_rep_prefix = false;
    let mut found_rexw_prefix = false;

    let mut decoded = DecodedInstruction::default();
    let mut done = false;
    let mut last_i = 0;
    for i in 0..code.code_buf_len {
        last_i = i;
        match code.code_buf[i] {
            0x66 => {
                found_operand_prefix = true;
            }
            0x48 if code.arch == SupportedArch::X64 => {
                found_rexw_prefix = true;
            }
            0xF2 | 0xF3 => {
                found_rep_prefix = true;
            }
            // MOVSB, MOVSW, STOSB, STOSW, LODSB, LODSW
            0xA4 | 0xA5 | 0xAA | 0xAB | 0xAC | 0xAD => {
                done = true;
            }
            // CMPSB, CMPSW, SCASB, SCASW
            0xA6 | 0xA7 | 0xAE | 0xAF => {
                decoded.modifies_flags = true;
                done = true;
            }
            _ => return Err(()),
        }
        if done {
            break;
        }
    }

    if !done || !found_rep_prefix {
        return Err(());
    }

    decoded.length = last_i + 1;
    if code.code_buf[last_i] & 1 != 0 {
        decoded.operand_size = if found_rexw_prefix {
            8
        } else if found_operand_prefix {
            2
        } else {
            4
        };
    } else {
        decoded.operand_size = 1;
    }
    Ok(decoded)
}

fn mem_intersect(a1: RemotePtr<Void>, s1: usize, a2: RemotePtr<Void>, s2: usize) -> bool {
    debug_assert!(a1 + s1 > a1);
    debug_assert!(a2 + s2 > a2);
    max(a1, a2) < min(a1 + s1, a2 + s2)
}

/// Tighten `iterations` so that stepping that many times cannot carry the
/// address register `reg` onto `watch`. 0 means the very next iteration
/// would hit the watchpoint.
fn bound_iterations_for_watchpoint(
    reg: RemotePtr<Void>,
    df_flag: bool,
    decoded: &DecodedInstruction,
    watch: &WatchConfig,
    iterations: &mut usize,
) {
    if watch.num_bytes == 0 {
        // Ignore zero-sized watch. It can't ever trigger.
        return;
    }

    let size = decoded.operand_size;
    let direction: isize = if df_flag { -1 } else { 1 };

    if mem_intersect(reg, size, watch.addr, watch.num_bytes) {
        *iterations = 0;
        return;
    }

    // Number of iterations we can perform without triggering the
    // watchpoint.
    let steps: usize;
    if direction > 0 {
        if watch.addr < reg {
            // We're assuming wraparound can't happen!
            return;
        }
        // We'll hit the first byte of the watchpoint moving forward.
        steps = (watch.addr - reg) / size;
    } else {
        if watch.addr > reg {
            // We're assuming wraparound can't happen!
            return;
        }
        // We'll hit the last byte of the watchpoint moving backward.
        steps = (reg - (watch.addr + watch.num_bytes)) / size + 1;
    }

    *iterations = min(*iterations, steps);
}

fn is_x86ish<T: Task>(t: &T) -> bool {
    t.arch() == SupportedArch::X86 || t.arch() == SupportedArch::X64
}

fn is_ignorable_prefix<T: Task>(t: &T, byte: u8) -> bool {
    if (0x40..=0x4f).contains(&byte) {
        // REX prefix
        return t.arch() == SupportedArch::X64;
    }
    matches!(
        byte,
        0x26 | // ES override
        0x2E | // CS override
        0x36 | // SS override
        0x3E | // DS override
        0x64 | // FS override
        0x65 | // GS override
        0x66 | // operand-size override
        0x67 | // address-size override
        0xF0 // LOCK
    )
}

fn is_rep_prefix(byte: u8) -> bool {
    byte == 0xF2 || byte == 0xF3
}

fn is_string_instruction(byte: u8) -> bool {
    matches!(
        byte,
        0xA4 | // MOVSB
        0xA5 | // MOVSW
        0xA6 | // CMPSB
        0xA7 | // CMPSW
        0xAA | // STOSB
        0xAB | // STOSW
        0xAC | // LODSB
        0xAD | // LODSW
        0xAE | // SCASB
        0xAF // SCASW
    )
}

fn fallible_read_byte<T: Task>(t: &mut T, ip: RemotePtr<u8>) -> Result<u8, ()> {
    let mut byte = [0u8; 1];
    match t.read_bytes_fallible(ip, &mut byte) {
        Ok(1) => Ok(byte[0]),
        _ => Err(()),
    }
}

fn is_string_instruction_at<T: Task>(t: &mut T, ip: RemoteCodePtr) -> bool {
    let mut found_rep = false;
    let mut bare_ip = ip.to_data_ptr::<u8>();
    loop {
        match fallible_read_byte(t, bare_ip) {
            Err(()) => {
                return false;
            }
            Ok(byte) if is_rep_prefix(byte) => {
                found_rep = true;
            }
            Ok(byte) if is_string_instruction(byte) => {
                return found_rep;
            }
            Ok(byte) if !is_ignorable_prefix(t, byte) => {
                return false;
            }
            Ok(_) => (),
        }
        bare_ip = bare_ip + 1usize;
    }
}

fn is_string_instruction_before<T: Task>(t: &mut T, ip: RemoteCodePtr) -> bool {
    let mut bare_ip = ip.to_data_ptr::<u8>();
    bare_ip = bare_ip - 1usize;
    match fallible_read_byte(t, bare_ip) {
        Ok(byte) if is_string_instruction(byte) => (),
        _ => return false,
    }

    loop {
        bare_ip = bare_ip - 1usize;
        match fallible_read_byte(t, bare_ip) {
            Err(()) => {
                return false;
            }
            Ok(byte) if is_rep_prefix(byte) => {
                return true;
            }
            Ok(byte) if !is_ignorable_prefix(t, byte) => {
                return false;
            }
            Ok(_) => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::SupportedArch::X64;
    use crate::registers::{X86_DF_FLAG, X86_ZF_FLAG};
    use crate::session::address_space::AddressSpace;
    use crate::wait_status::WaitStatus;
    use libc::pid_t;
    use std::rc::Rc;

    const MEM_START: usize = 0x10_0000;
    const MEM_LEN: usize = 0x8_0000;
    const CODE: usize = 0x10_1000;
    const SRC: usize = 0x12_0000;
    const DST: usize = 0x14_0000;

    #[derive(Copy, Clone, Eq, PartialEq)]
    enum StringOp {
        Movs,
        Stos,
        Lods,
        Cmps,
        Scas,
    }

    struct EmuInsn {
        op: StringOp,
        repe: bool,
        repne: bool,
        modifies_flags: bool,
        size: usize,
        len: usize,
    }

    /// A synthetic x86-64 tracee: registers, one flat memory region and
    /// the shared breakpoint/watchpoint registry. String instructions
    /// retire one iteration per singlestep; continues run until a
    /// breakpoint fetch or a watchpoint access, like the real thing
    /// minus the coalescing quirk.
    struct EmuTask {
        regs: Registers,
        mem: Vec<u8>,
        vm: AddressSpaceSharedPtr,
        wait_status: WaitStatus,
        debug_status: usize,
        singlesteps: usize,
        conts: usize,
    }

    impl EmuTask {
        fn new() -> EmuTask {
            let mut regs = Registers::new(X64);
            regs.set_ip(RemoteCodePtr::new(CODE));
            EmuTask {
                regs,
                mem: vec![0u8; MEM_LEN],
                vm: AddressSpace::new(),
                wait_status: WaitStatus::for_stop_sig(sig::SIGTRAP),
                debug_status: 0,
                singlesteps: 0,
                conts: 0,
            }
        }

        fn with_code(code: &[u8]) -> EmuTask {
            let mut t = EmuTask::new();
            t.poke_bytes(CODE, code);
            t
        }

        fn poke_bytes(&mut self, addr: usize, bytes: &[u8]) {
            let offset = addr - MEM_START;
            self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        fn peek(&self, addr: usize) -> u8 {
            self.mem[addr - MEM_START]
        }

        fn load(&self, addr: usize, size: usize) -> u64 {
            let mut val = 0u64;
            for i in 0..size {
                val |= (self.peek(addr + i) as u64) << (8 * i);
            }
            val
        }

        fn store(&mut self, addr: usize, val: u64, size: usize) {
            for i in 0..size {
                self.mem[addr - MEM_START + i] = (val >> (8 * i)) as u8;
            }
        }

        fn set_zf(&mut self, zf: bool) {
            let flags = self.regs.flags();
            self.regs.set_flags(if zf {
                flags | X86_ZF_FLAG
            } else {
                flags & !X86_ZF_FLAG
            });
        }

        fn decode_at_ip(&self) -> Option<EmuInsn> {
            let mut addr = self.regs.ip().as_usize();
            let mut repe = false;
            let mut repne = false;
            let mut op16 = false;
            let mut rexw = false;
            loop {
                let byte = self.peek(addr);
                match byte {
                    0xF3 => repe = true,
                    0xF2 => repne = true,
                    0x66 => op16 = true,
                    0x48 => rexw = true,
                    0xA4..=0xA7 | 0xAA..=0xAF => {
                        if !repe && !repne {
                            return None;
                        }
                        let (op, modifies_flags) = match byte {
                            0xA4 | 0xA5 => (StringOp::Movs, false),
                            0xA6 | 0xA7 => (StringOp::Cmps, true),
                            0xAA | 0xAB => (StringOp::Stos, false),
                            0xAC | 0xAD => (StringOp::Lods, false),
                            _ => (StringOp::Scas, true),
                        };
                        let size = if byte & 1 == 0 {
                            1
                        } else if rexw {
                            8
                        } else if op16 {
                            2
                        } else {
                            4
                        };
                        return Some(EmuInsn {
                            op,
                            repe,
                            repne,
                            modifies_flags,
                            size,
                            len: addr + 1 - self.regs.ip().as_usize(),
                        });
                    }
                    _ => return None,
                }
                addr += 1;
            }
        }

        fn note_access(&mut self, addr: usize, size: usize, is_write: bool) {
            for watch in self.vm.all_watchpoints() {
                let fires = match watch.type_ {
                    WatchType::WatchExec => false,
                    WatchType::WatchWrite => is_write,
                    WatchType::WatchReadWrite => true,
                };
                if fires
                    && mem_intersect(addr.into(), size, watch.addr, watch.num_bytes)
                {
                    self.debug_status |= DebugStatus::DsWatchpointAny as usize;
                }
            }
        }

        /// Retire one instruction, or one iteration of a REP string
        /// instruction. Anything undecodable acts as a one-byte no-op.
        fn step_insn(&mut self) {
            let insn = match self.decode_at_ip() {
                Some(insn) => insn,
                None => {
                    let ip = self.regs.ip();
                    self.regs.set_ip(ip + 1usize);
                    return;
                }
            };

            let limit_ip = self.regs.ip() + insn.len;
            if self.regs.cx() == 0 {
                // The count is exhausted before the first iteration; the
                // instruction is a no-op.
                self.regs.set_ip(limit_ip);
                return;
            }

            let size = insn.size;
            let step = |reg: usize, df: bool| -> usize {
                if df {
                    reg - size
                } else {
                    reg + size
                }
            };
            let df = self.regs.df_flag();
            let si = self.regs.si();
            let di = self.regs.di();
            let mut zf = self.regs.zf_flag();

            match insn.op {
                StringOp::Movs => {
                    let val = self.load(si, size);
                    self.note_access(si, size, false);
                    self.store(di, val, size);
                    self.note_access(di, size, true);
                    self.regs.set_si(step(si, df));
                    self.regs.set_di(step(di, df));
                }
                StringOp::Stos => {
                    let val = self.regs.ax() as u64;
                    self.store(di, val, size);
                    self.note_access(di, size, true);
                    self.regs.set_di(step(di, df));
                }
                StringOp::Lods => {
                    let val = self.load(si, size);
                    self.note_access(si, size, false);
                    // Only the low bytes of the accumulator are replaced.
                    let mask = low_bytes_mask(size);
                    let merged = (self.regs.ax() as u64 & !mask) | (val & mask);
                    self.regs.set_ax(merged as usize);
                    self.regs.set_si(step(si, df));
                }
                StringOp::Cmps => {
                    let a = self.load(si, size);
                    self.note_access(si, size, false);
                    let b = self.load(di, size);
                    self.note_access(di, size, false);
                    zf = a == b;
                    self.regs.set_si(step(si, df));
                    self.regs.set_di(step(di, df));
                }
                StringOp::Scas => {
                    let a = self.regs.ax() as u64 & low_bytes_mask(size);
                    let b = self.load(di, size);
                    self.note_access(di, size, false);
                    zf = a == b;
                    self.regs.set_di(step(di, df));
                }
            }

            if insn.modifies_flags {
                self.set_zf(zf);
            }

            let cx = self.regs.cx() - 1;
            self.regs.set_cx(cx);

            let rep_terminates = insn.modifies_flags
                && ((insn.repe && !zf) || (insn.repne && zf));
            if cx == 0 || rep_terminates {
                self.regs.set_ip(limit_ip);
            }
        }

        fn at_breakpoint(&self) -> bool {
            self.vm.get_breakpoint_type_at_addr(self.regs.ip()) != BreakpointType::BkptNone
        }
    }

    /// Truncation mask for partial-register operands.
    fn low_bytes_mask(size: usize) -> u64 {
        if size == 8 {
            !0u64
        } else {
            (1u64 << (8 * size)) - 1
        }
    }

    impl Task for EmuTask {
        fn tid(&self) -> pid_t {
            1234
        }

        fn arch(&self) -> SupportedArch {
            self.regs.arch()
        }

        fn regs_ref(&self) -> &Registers {
            &self.regs
        }

        fn set_regs(&mut self, regs: &Registers) {
            self.regs = *regs;
        }

        fn resume_execution(&mut self, how: ResumeRequest, _wait_how: WaitRequest) {
            self.debug_status = 0;
            self.wait_status = WaitStatus::for_stop_sig(sig::SIGTRAP);
            match how {
                ResumeRequest::ResumeSinglestep => {
                    self.singlesteps += 1;
                    if self.at_breakpoint() {
                        // The step executes the int3 that overlays the
                        // instruction.
                        let ip = self.regs.ip();
                        self.regs.set_ip(ip.increment_by_bkpt_insn_length(self.arch()));
                        return;
                    }
                    self.step_insn();
                    self.debug_status |= DebugStatus::DsSingleStep as usize;
                }
                ResumeRequest::ResumeCont => {
                    self.conts += 1;
                    let mut retired = 0u64;
                    loop {
                        retired += 1;
                        assert!(retired < (1 << 24), "runaway tracee");
                        if self.at_breakpoint() {
                            let ip = self.regs.ip();
                            self.regs.set_ip(ip.increment_by_bkpt_insn_length(self.arch()));
                            return;
                        }
                        self.step_insn();
                        if self.debug_status & DebugStatus::DsWatchpointAny as usize != 0 {
                            return;
                        }
                    }
                }
            }
        }

        fn status(&self) -> WaitStatus {
            self.wait_status
        }

        fn debug_status(&self) -> usize {
            self.debug_status
        }

        fn consume_debug_status(&mut self) -> usize {
            let status = self.debug_status;
            self.debug_status = 0;
            status
        }

        fn read_bytes_fallible(
            &mut self,
            addr: RemotePtr<Void>,
            buf: &mut [u8],
        ) -> Result<usize, ()> {
            let addr = addr.as_usize();
            if addr < MEM_START || addr >= MEM_START + MEM_LEN {
                return Err(());
            }
            let avail = min(MEM_START + MEM_LEN - addr, buf.len());
            let offset = addr - MEM_START;
            buf[..avail].copy_from_slice(&self.mem[offset..offset + avail]);
            Ok(avail)
        }

        fn vm(&self) -> AddressSpaceSharedPtr {
            Rc::clone(&self.vm)
        }
    }

    fn decode_raw(arch: SupportedArch, bytes: &[u8]) -> Result<DecodedInstruction, ()> {
        let mut buf = InstructionBuf {
            arch,
            code_buf: [0u8; 32],
            code_buf_len: bytes.len(),
        };
        buf.code_buf[..bytes.len()].copy_from_slice(bytes);
        decode_x86_string_instruction(&buf)
    }

    mod decoder {
        use super::*;
        use crate::kernel_abi::SupportedArch::{X64, X86};

        #[test]
        fn rep_movsb() {
            let d = decode_raw(X64, &[0xF3, 0xA4]).unwrap();
            assert_eq!(d.operand_size, 1);
            assert_eq!(d.length, 2);
            assert!(!d.modifies_flags);
        }

        #[test]
        fn rep_stosq_rexw() {
            let d = decode_raw(X64, &[0xF3, 0x48, 0xAB]).unwrap();
            assert_eq!(d.operand_size, 8);
            assert_eq!(d.length, 3);
        }

        #[test]
        fn rep_stosw_operand_size_override() {
            let d = decode_raw(X64, &[0xF3, 0x66, 0xAB]).unwrap();
            assert_eq!(d.operand_size, 2);
            assert_eq!(d.length, 3);
        }

        #[test]
        fn rexw_beats_operand_size_override() {
            let d = decode_raw(X64, &[0x66, 0xF3, 0x48, 0xAF]).unwrap();
            assert_eq!(d.operand_size, 8);
            assert_eq!(d.length, 4);
            assert!(d.modifies_flags);
        }

        #[test]
        fn repne_scasb_modifies_flags() {
            let d = decode_raw(X64, &[0xF2, 0xAE]).unwrap();
            assert_eq!(d.operand_size, 1);
            assert!(d.modifies_flags);
        }

        #[test]
        fn stosd_without_rexw() {
            let d = decode_raw(X64, &[0xF3, 0xAB]).unwrap();
            assert_eq!(d.operand_size, 4);
        }

        #[test]
        fn missing_rep_prefix_rejected() {
            assert!(decode_raw(X64, &[0xA4]).is_err());
        }

        #[test]
        fn unknown_byte_rejected() {
            assert!(decode_raw(X64, &[0xF3, 0x90]).is_err());
        }

        #[test]
        fn rexw_rejected_on_x86() {
            assert!(decode_raw(X86, &[0xF3, 0x48, 0xAB]).is_err());
        }

        #[test]
        fn truncated_buffer_rejected() {
            assert!(decode_raw(X64, &[]).is_err());
            assert!(decode_raw(X64, &[0xF3, 0x66]).is_err());
        }
    }

    mod bounding {
        use super::*;

        fn decoded_with_size(operand_size: usize) -> DecodedInstruction {
            DecodedInstruction {
                operand_size,
                length: 2,
                modifies_flags: false,
            }
        }

        #[test]
        fn forward_reachable_watchpoint() {
            let watch = WatchConfig::new(0x1010usize.into(), 4, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                false,
                &decoded_with_size(1),
                &watch,
                &mut iterations,
            );
            assert_eq!(iterations, 16);
        }

        #[test]
        fn forward_watchpoint_behind_is_unreachable() {
            let watch = WatchConfig::new(0x0f00usize.into(), 4, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                false,
                &decoded_with_size(1),
                &watch,
                &mut iterations,
            );
            assert_eq!(iterations, 1000);
        }

        #[test]
        fn backward_reachable_watchpoint() {
            let watch = WatchConfig::new(0x0ff0usize.into(), 4, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                true,
                &decoded_with_size(1),
                &watch,
                &mut iterations,
            );
            // Safe down to 0xff4: (0x1000 - 0xff4) / 1 + 1 steps short.
            assert_eq!(iterations, 13);
        }

        #[test]
        fn backward_watchpoint_above_is_unreachable() {
            let watch = WatchConfig::new(0x1010usize.into(), 4, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                true,
                &decoded_with_size(1),
                &watch,
                &mut iterations,
            );
            assert_eq!(iterations, 1000);
        }

        #[test]
        fn intersecting_watchpoint_blocks_immediately() {
            let watch = WatchConfig::new(0x1002usize.into(), 1, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                false,
                &decoded_with_size(4),
                &watch,
                &mut iterations,
            );
            assert_eq!(iterations, 0);
        }

        #[test]
        fn zero_sized_watchpoint_ignored() {
            let watch = WatchConfig::new(0x1008usize.into(), 0, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                false,
                &decoded_with_size(1),
                &watch,
                &mut iterations,
            );
            assert_eq!(iterations, 1000);
        }

        #[test]
        fn operand_size_scales_steps() {
            let watch = WatchConfig::new(0x1080usize.into(), 1, WatchType::WatchWrite);
            let mut iterations = 1000;
            bound_iterations_for_watchpoint(
                0x1000usize.into(),
                false,
                &decoded_with_size(8),
                &watch,
                &mut iterations,
            );
            assert_eq!(iterations, 16);
        }

        #[test]
        fn ranges_intersect_half_open() {
            assert!(mem_intersect(0x1000usize.into(), 4, 0x1003usize.into(), 1));
            assert!(!mem_intersect(0x1000usize.into(), 4, 0x1004usize.into(), 1));
        }
    }

    #[test]
    fn plain_rep_movsb_fast_forwards_to_final_iteration() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        let pattern: Vec<u8> = (0..1200u32).map(|i| (i * 7) as u8).collect();
        t.poke_bytes(SRC, &pattern);
        t.regs.set_cx(1000);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert!(status.incomplete_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.regs.cx(), 1);
        assert_eq!(t.regs.si(), SRC + 999);
        assert_eq!(t.regs.di(), DST + 999);
        // One trial step, one batched continue, 128 tail steps.
        assert_eq!(t.conts, 1);
        assert_eq!(t.singlesteps, 129);
        // 999 iterations retired, the last byte not yet copied.
        assert_eq!(t.peek(DST + 998), pattern[998]);
        assert_eq!(t.peek(DST + 999), 0);
        // Nothing we installed survives the call.
        assert!(t.vm.all_watchpoints().is_empty());
        assert_eq!(
            t.vm.get_breakpoint_type_at_addr(RemoteCodePtr::new(CODE + 2)),
            BreakpointType::BkptNone
        );
    }

    #[test]
    fn rep_stosq_uses_eight_byte_strides() {
        let mut t = EmuTask::with_code(&[0xF3, 0x48, 0xAB]);
        t.regs.set_cx(100);
        t.regs.set_di(DST);
        t.regs.set_ax(0x0102_0304_0506_0708);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.regs.cx(), 1);
        assert_eq!(t.regs.di(), DST + 99 * 8);
        assert_eq!(t.conts, 1);
        assert_eq!(t.load(DST, 8), 0x0102_0304_0506_0708);
        assert_eq!(t.load(DST + 98 * 8, 8), 0x0102_0304_0506_0708);
        assert_eq!(t.load(DST + 99 * 8, 8), 0);
    }

    #[test]
    fn repne_scasb_zf_exit_through_batched_breakpoint() {
        let mut t = EmuTask::with_code(&[0xF2, 0xAE]);
        t.regs.set_cx(300);
        t.regs.set_di(DST);
        t.regs.set_ax(0x55);
        // The scan finds its byte well before the fast-forward
        // watchpoint, so the loop exits by ZF and runs into the internal
        // breakpoint.
        t.poke_bytes(DST + 50, &[0x55]);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        // The ZF retry reran the loop and stopped one iteration short of
        // the exit.
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.regs.cx(), 250);
        assert_eq!(t.regs.di(), DST + 50);
        assert_eq!(t.conts, 1);
        assert_eq!(t.singlesteps, 50);
        assert!(t.vm.all_watchpoints().is_empty());
        assert_eq!(
            t.vm.get_breakpoint_type_at_addr(RemoteCodePtr::new(CODE + 2)),
            BreakpointType::BkptNone
        );
    }

    #[test]
    fn repe_cmpsb_zf_exit_through_tail_steps() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA6]);
        t.regs.set_cx(50);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);
        t.poke_bytes(SRC, &[0x11; 64]);
        t.poke_bytes(DST, &[0x11; 64]);
        // Mismatch at offset 10 flips ZF during the tail singlesteps.
        t.poke_bytes(DST + 10, &[0x22]);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        // Stopped one iteration short of the ZF exit.
        assert_eq!(t.regs.cx(), 40);
        assert_eq!(t.conts, 0);
        assert_eq!(t.singlesteps, 1 + 10 + 9);
    }

    #[test]
    fn mid_loop_target_state_bounds_iterations() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA6]);
        t.regs.set_cx(200);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);
        t.poke_bytes(SRC, &[0x07; 256]);
        t.poke_bytes(DST, &[0x07; 256]);

        let mut target = Registers::new(X64);
        target.set_ip(RemoteCodePtr::new(CODE));
        target.set_cx(50);

        let status = fast_forward_through_instruction(&mut t, &[target]);

        assert!(status.did_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        // We must stop before stepping into CX==50, with the final
        // iteration reserved for the caller.
        assert_eq!(t.regs.cx(), 51);
    }

    #[test]
    fn watchpoint_under_si_blocks_fast_forward() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_cx(100);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);
        // Lands exactly under SI after the trial step.
        assert!(t
            .vm
            .add_watchpoint((SRC + 1).into(), 1, WatchType::WatchWrite));

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(!status.did_fast_forward);
        assert!(status.incomplete_fast_forward);
        assert_eq!(t.regs.cx(), 99);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.singlesteps, 1);
        assert_eq!(t.conts, 0);
        assert_eq!(t.vm.all_watchpoints().len(), 1);
    }

    #[test]
    fn watchpoint_ahead_of_di_bounds_iterations() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.poke_bytes(SRC, &[0x5A; 32]);
        t.regs.set_cx(100);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);
        assert!(t
            .vm
            .add_watchpoint((DST + 11).into(), 1, WatchType::WatchWrite));

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        // Ten tail steps from CX==99; the watched byte is never touched.
        assert_eq!(t.regs.cx(), 89);
        assert_eq!(t.conts, 0);
        assert_eq!(t.peek(DST + 10), 0x5A);
        assert_eq!(t.peek(DST + 11), 0);
        assert_eq!(t.vm.all_watchpoints().len(), 1);
    }

    #[test]
    fn backward_copy_with_df_set() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        let pattern: Vec<u8> = (0..2000u32).map(|i| (i * 13) as u8).collect();
        t.poke_bytes(SRC, &pattern);
        t.regs.set_cx(1000);
        t.regs.set_si(SRC + 1999);
        t.regs.set_di(DST + 1999);
        t.regs.set_flags(X86_DF_FLAG);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.regs.cx(), 1);
        assert_eq!(t.regs.di(), DST + 1000);
        assert_eq!(t.conts, 1);
        // 999 bytes copied downwards from the top.
        assert_eq!(t.peek(DST + 1999), pattern[1999]);
        assert_eq!(t.peek(DST + 1001), pattern[1001]);
        assert_eq!(t.peek(DST + 1000), 0);
    }

    #[test]
    fn rep_lodsb_fast_forwards_through_tail() {
        let mut t = EmuTask::with_code(&[0xF3, 0xAC]);
        let pattern: Vec<u8> = (0..32u32).map(|i| (0x30 + i) as u8).collect();
        t.poke_bytes(SRC, &pattern);
        t.regs.set_cx(20);
        t.regs.set_si(SRC);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.regs.cx(), 1);
        assert_eq!(t.regs.si(), SRC + 19);
        // AL holds the last byte loaded, iteration 19.
        assert_eq!(t.regs.ax() as u8, pattern[18]);
        assert_eq!(t.conts, 0);
    }

    #[test]
    fn trial_step_returns_when_ip_advances() {
        // A NOP is not fast-forwardable; the routine must stop after the
        // mandatory singlestep.
        let mut t = EmuTask::with_code(&[0x90]);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(!status.did_fast_forward);
        assert!(!status.incomplete_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE + 1);
        assert_eq!(t.singlesteps, 1);
        assert_eq!(t.conts, 0);
    }

    #[test]
    fn trial_step_completes_final_iteration() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_cx(1);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(!status.did_fast_forward);
        assert!(!status.incomplete_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE + 2);
        assert_eq!(t.regs.cx(), 0);
        assert_eq!(t.singlesteps, 1);
        assert_eq!(t.conts, 0);
    }

    #[test]
    fn rep_with_zero_count_is_skipped_by_trial_step() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_cx(0);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);
        t.poke_bytes(SRC, &[0xAB; 4]);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(!status.incomplete_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE + 2);
        assert_eq!(t.regs.cx(), 0);
        assert_eq!(t.peek(DST), 0);
        assert_eq!(t.singlesteps, 1);
    }

    #[test]
    fn trial_step_returns_on_target_state_match() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_cx(100);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);

        // The exact register state one iteration in.
        let mut target = t.regs;
        target.set_cx(99);
        target.set_si(SRC + 1);
        target.set_di(DST + 1);

        let status = fast_forward_through_instruction(&mut t, &[target]);

        assert!(!status.did_fast_forward);
        assert!(!status.incomplete_fast_forward);
        assert_eq!(t.regs.cx(), 99);
        assert_eq!(t.singlesteps, 1);
        assert_eq!(t.conts, 0);
    }

    #[test]
    fn last_reserved_iteration_returns_without_batching() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_cx(2);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(!status.did_fast_forward);
        assert!(status.incomplete_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE);
        assert_eq!(t.regs.cx(), 1);
        assert_eq!(t.singlesteps, 1);
        assert_eq!(t.conts, 0);

        // Calling again just retires the reserved final iteration.
        let status = fast_forward_through_instruction(&mut t, &[]);
        assert!(!status.did_fast_forward);
        assert!(!status.incomplete_fast_forward);
        assert_eq!(t.regs.ip().as_usize(), CODE + 2);
        assert_eq!(t.regs.cx(), 0);
        assert_eq!(t.singlesteps, 2);
        assert_eq!(t.conts, 0);
    }

    #[test]
    fn preexisting_traps_survive_fast_forward() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_cx(1000);
        t.regs.set_si(SRC);
        t.regs.set_di(DST);
        // Far enough ahead that they never bound the loop below its
        // natural limit.
        let bp = RemoteCodePtr::new(CODE + 0x800);
        assert!(t.vm.add_breakpoint(bp, BreakpointType::BkptUser));
        assert!(t
            .vm
            .add_watchpoint((DST + 0x4000).into(), 8, WatchType::WatchReadWrite));

        let status = fast_forward_through_instruction(&mut t, &[]);

        assert!(status.did_fast_forward);
        assert_eq!(t.conts, 1);
        assert_eq!(t.regs.cx(), 1);
        assert_eq!(t.vm.get_breakpoint_type_at_addr(bp), BreakpointType::BkptUser);
        let watches = t.vm.all_watchpoints();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].addr.as_usize(), DST + 0x4000);
        assert_eq!(watches[0].num_bytes, 8);
        assert_eq!(watches[0].type_, WatchType::WatchReadWrite);
    }

    #[test]
    fn status_bitor_accumulates() {
        let a = FastForwardStatus {
            did_fast_forward: true,
            incomplete_fast_forward: false,
        };
        let b = FastForwardStatus {
            did_fast_forward: false,
            incomplete_fast_forward: true,
        };
        let c = a | b;
        assert!(c.did_fast_forward && c.incomplete_fast_forward);
        assert_eq!(FastForwardStatus::new(), FastForwardStatus::default());
    }

    #[test]
    fn string_instruction_predicates() {
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        assert!(at_x86_string_instruction(&mut t));
        assert!(maybe_at_or_after_x86_string_instruction(&mut t));

        // A segment override before the REP prefix is ignorable.
        let mut t = EmuTask::with_code(&[0x2E, 0xF3, 0xA4]);
        assert!(at_x86_string_instruction(&mut t));

        let mut t = EmuTask::with_code(&[0x90]);
        assert!(!at_x86_string_instruction(&mut t));
        assert!(!maybe_at_or_after_x86_string_instruction(&mut t));

        // Just past a REP MOVSB.
        let mut t = EmuTask::with_code(&[0xF3, 0xA4]);
        t.regs.set_ip(RemoteCodePtr::new(CODE + 2));
        assert!(!at_x86_string_instruction(&mut t));
        assert!(maybe_at_or_after_x86_string_instruction(&mut t));
    }
}

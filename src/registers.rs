use crate::kernel_abi::{x64, x86, SupportedArch};
use crate::log::LogLevel::LogInfo;
use crate::remote_code_ptr::RemoteCodePtr;
use std::fmt::{self, Debug, Display, Formatter};

pub const X86_ZF_FLAG: usize = 1 << 6;
pub const X86_TF_FLAG: usize = 1 << 8;
pub const X86_DF_FLAG: usize = 1 << 10;

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum MismatchBehavior {
    ExpectMismatches,
    LogMismatches,
    BailOnMismatch,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union RegistersUnion {
    x86: x86::user_regs_struct,
    x64: x64::user_regs_struct,
}

impl RegistersUnion {
    pub fn default() -> RegistersUnion {
        RegistersUnion {
            x64: x64::user_regs_struct::default(),
        }
    }
}

macro_rules! ff_get_reg {
    ($slf:expr, $x86case:ident, $x64case:ident) => {
        unsafe {
            match $slf.arch_ {
                crate::kernel_abi::SupportedArch::X86 => $slf.u.x86.$x86case as usize,
                crate::kernel_abi::SupportedArch::X64 => $slf.u.x64.$x64case as usize,
            }
        }
    };
}

macro_rules! ff_set_reg {
    ($slf:expr, $x86case:ident, $x64case:ident, $val:expr) => {
        match $slf.arch_ {
            crate::kernel_abi::SupportedArch::X86 => {
                $slf.u.x86.$x86case = $val as i32;
            }
            crate::kernel_abi::SupportedArch::X64 => {
                $slf.u.x64.$x64case = $val as u64;
            }
        }
    };
}

/// A snapshot of the tracee's general-purpose register file, tagged with
/// the architecture that gives the raw bytes their meaning.
#[derive(Copy, Clone)]
pub struct Registers {
    arch_: SupportedArch,
    u: RegistersUnion,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch_: arch,
            u: RegistersUnion::default(),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(ff_get_reg!(self, eip, rip))
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        ff_set_reg!(self, eip, rip, addr.register_value());
    }

    pub fn cx(&self) -> usize {
        ff_get_reg!(self, ecx, rcx)
    }

    pub fn set_cx(&mut self, value: usize) {
        ff_set_reg!(self, ecx, rcx, value);
    }

    pub fn si(&self) -> usize {
        ff_get_reg!(self, esi, rsi)
    }

    pub fn set_si(&mut self, value: usize) {
        ff_set_reg!(self, esi, rsi, value);
    }

    pub fn di(&self) -> usize {
        ff_get_reg!(self, edi, rdi)
    }

    pub fn set_di(&mut self, value: usize) {
        ff_set_reg!(self, edi, rdi, value);
    }

    pub fn ax(&self) -> usize {
        ff_get_reg!(self, eax, rax)
    }

    pub fn set_ax(&mut self, value: usize) {
        ff_set_reg!(self, eax, rax, value);
    }

    pub fn sp(&self) -> usize {
        ff_get_reg!(self, esp, rsp)
    }

    pub fn set_sp(&mut self, value: usize) {
        ff_set_reg!(self, esp, rsp, value);
    }

    pub fn flags(&self) -> usize {
        ff_get_reg!(self, eflags, eflags)
    }

    pub fn set_flags(&mut self, value: usize) {
        ff_set_reg!(self, eflags, eflags, value);
    }

    pub fn singlestep_flag(&self) -> bool {
        self.flags() & X86_TF_FLAG == X86_TF_FLAG
    }

    pub fn df_flag(&self) -> bool {
        self.flags() & X86_DF_FLAG == X86_DF_FLAG
    }

    pub fn zf_flag(&self) -> bool {
        self.flags() & X86_ZF_FLAG == X86_ZF_FLAG
    }

    /// True when `other` denotes the same user-visible state. Registers
    /// whose comparison mask is zero (eflags, orig_*, most segment
    /// selectors) are excluded; they round-trip unreliably through the
    /// kernel.
    pub fn matches(&self, other: &Registers) -> bool {
        compare_register_files(
            "rep",
            self,
            "recorded",
            other,
            MismatchBehavior::ExpectMismatches,
        )
    }
}

impl Display for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ip:{} cx:{:#x} si:{:#x} di:{:#x} sp:{:#x} flags:{:#x} }}",
            self.ip(),
            self.cx(),
            self.si(),
            self.di(),
            self.sp(),
            self.flags()
        )
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// The name, location and comparison mask of one register inside
/// `user_regs_struct`. A zero mask excludes the register from state
/// comparison.
pub struct RegisterValue {
    pub name: &'static str,
    pub offset: usize,
    pub nbytes: usize,
    pub comparison_mask: u64,
}

impl RegisterValue {
    pub fn new(name: &'static str, offset: usize, nbytes: usize) -> RegisterValue {
        let comparison_mask = RegisterValue::mask_for_nbytes(nbytes);
        RegisterValue {
            name,
            offset,
            nbytes,
            comparison_mask,
        }
    }

    pub fn new_with_mask(
        name: &'static str,
        offset: usize,
        nbytes: usize,
        comparison_mask: u64,
    ) -> RegisterValue {
        debug_assert!(comparison_mask & !RegisterValue::mask_for_nbytes(nbytes) == 0);
        RegisterValue {
            name,
            offset,
            nbytes,
            comparison_mask,
        }
    }

    pub fn mask_for_nbytes(nbytes: usize) -> u64 {
        debug_assert!(nbytes <= std::mem::size_of::<u64>());
        if nbytes == std::mem::size_of::<u64>() {
            !0u64
        } else {
            (1u64 << (nbytes * 8)) - 1
        }
    }

    fn value_of(&self, regs: &RegistersUnion) -> u64 {
        let mut raw = [0u8; 8];
        unsafe {
            let p = (regs as *const RegistersUnion as *const u8).add(self.offset);
            std::ptr::copy_nonoverlapping(p, raw.as_mut_ptr(), self.nbytes);
        }
        u64::from_le_bytes(raw)
    }
}

macro_rules! rv_arch {
    ($name:ident, $arch:ident) => {{
        let el = crate::kernel_abi::$arch::user_regs_struct::default();
        let base = &el as *const _ as usize;
        let offset = &el.$name as *const _ as usize - base;
        RegisterValue::new(stringify!($name), offset, std::mem::size_of_val(&el.$name))
    }};
    ($name:ident, $arch:ident, $comparison_mask:expr) => {{
        let el = crate::kernel_abi::$arch::user_regs_struct::default();
        let base = &el as *const _ as usize;
        let offset = &el.$name as *const _ as usize - base;
        RegisterValue::new_with_mask(
            stringify!($name),
            offset,
            std::mem::size_of_val(&el.$name),
            $comparison_mask,
        )
    }};
}

macro_rules! rv_x86 {
    ($name:ident $(, $comparison_mask:expr)?) => {
        rv_arch!($name, x86 $(, $comparison_mask)?)
    };
}

macro_rules! rv_x64 {
    ($name:ident $(, $comparison_mask:expr)?) => {
        rv_arch!($name, x64 $(, $comparison_mask)?)
    };
}

lazy_static! {
    static ref REGISTERS_X86: Vec<RegisterValue> = x86regs();
    static ref REGISTERS_X64: Vec<RegisterValue> = x64regs();
}

fn x86regs() -> Vec<RegisterValue> {
    vec![
        rv_x86!(eax),
        rv_x86!(ecx),
        rv_x86!(edx),
        rv_x86!(ebx),
        rv_x86!(esp),
        rv_x86!(ebp),
        rv_x86!(esi),
        rv_x86!(edi),
        rv_x86!(eip),
        rv_x86!(eflags, 0),
        rv_x86!(xcs, 0),
        rv_x86!(xss, 0),
        rv_x86!(xds, 0),
        rv_x86!(xes, 0),
        // Mask out the RPL from the fs and gs segment selectors. The
        // kernel unconditionally sets RPL=3 on sigreturn, but if the
        // segment index is 0 the CPU resets the entire register to 0, so
        // whether we see the RPL depends on whether the value has
        // round-tripped to the CPU yet.
        rv_x86!(xfs, !3u16 as u64),
        rv_x86!(xgs, !3u16 as u64),
        // Comparison for this is handled specially elsewhere.
        rv_x86!(orig_eax, 0),
    ]
}

fn x64regs() -> Vec<RegisterValue> {
    vec![
        rv_x64!(rax),
        rv_x64!(rcx),
        rv_x64!(rdx),
        rv_x64!(rbx),
        rv_x64!(rsp),
        rv_x64!(rbp),
        rv_x64!(rsi),
        rv_x64!(rdi),
        rv_x64!(r8),
        rv_x64!(r9),
        rv_x64!(r10),
        rv_x64!(r11),
        rv_x64!(r12),
        rv_x64!(r13),
        rv_x64!(r14),
        rv_x64!(r15),
        rv_x64!(rip),
        rv_x64!(eflags, 0),
        rv_x64!(cs, 0),
        rv_x64!(ss, 0),
        rv_x64!(ds, 0),
        rv_x64!(es, 0),
        rv_x64!(fs, 0xffffffff),
        rv_x64!(gs, 0xffffffff),
        // Comparison for this is handled specially elsewhere.
        rv_x64!(orig_rax, 0),
        rv_x64!(fs_base),
        rv_x64!(gs_base),
    ]
}

fn register_table(arch: SupportedArch) -> &'static [RegisterValue] {
    match arch {
        SupportedArch::X86 => &*REGISTERS_X86,
        SupportedArch::X64 => &*REGISTERS_X64,
    }
}

/// Compare two register files under the per-register comparison masks.
/// Returns true when they match. Mismatches are logged when
/// `mismatch_behavior` asks for it; otherwise the comparison stops at the
/// first difference.
pub fn compare_register_files(
    name1: &str,
    regs1: &Registers,
    name2: &str,
    regs2: &Registers,
    mismatch_behavior: MismatchBehavior,
) -> bool {
    if regs1.arch() != regs2.arch() {
        if mismatch_behavior >= MismatchBehavior::LogMismatches {
            log!(
                LogInfo,
                "architecture differs: {} is {:?}, {} is {:?}",
                name1,
                regs1.arch(),
                name2,
                regs2.arch()
            );
        }
        return false;
    }

    let mut matches = true;
    for rv in register_table(regs1.arch()) {
        let v1 = rv.value_of(&regs1.u) & rv.comparison_mask;
        let v2 = rv.value_of(&regs2.u) & rv.comparison_mask;
        if v1 != v2 {
            matches = false;
            if mismatch_behavior >= MismatchBehavior::LogMismatches {
                log!(
                    LogInfo,
                    "{} differs: {}={:#x} vs {}={:#x}",
                    rv.name,
                    name1,
                    v1,
                    name2,
                    v2
                );
            } else {
                break;
            }
        }
    }
    matches
}

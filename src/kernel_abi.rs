#![allow(non_camel_case_types)]

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupportedArch {
    X86,
    X64,
}

#[cfg(target_arch = "x86_64")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X64;

#[cfg(target_arch = "x86")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X86;

pub fn word_size(arch: SupportedArch) -> usize {
    match arch {
        SupportedArch::X86 => 4,
        SupportedArch::X64 => 8,
    }
}

/// Mirrors of the kernel's per-arch `struct user_regs_struct`, i.e. the
/// layout PTRACE_GETREGS/PTRACE_SETREGS traffic in. Field order matters.
pub mod x86 {
    #[repr(C)]
    #[derive(Copy, Clone, Debug, Default)]
    pub struct user_regs_struct {
        pub ebx: i32,
        pub ecx: i32,
        pub edx: i32,
        pub esi: i32,
        pub edi: i32,
        pub ebp: i32,
        pub eax: i32,
        pub xds: i32,
        pub xes: i32,
        pub xfs: i32,
        pub xgs: i32,
        pub orig_eax: i32,
        pub eip: i32,
        pub xcs: i32,
        pub eflags: i32,
        pub esp: i32,
        pub xss: i32,
    }
}

pub mod x64 {
    #[repr(C)]
    #[derive(Copy, Clone, Debug, Default)]
    pub struct user_regs_struct {
        pub r15: u64,
        pub r14: u64,
        pub r13: u64,
        pub r12: u64,
        pub rbp: u64,
        pub rbx: u64,
        pub r11: u64,
        pub r10: u64,
        pub r9: u64,
        pub r8: u64,
        pub rax: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rsi: u64,
        pub rdi: u64,
        pub orig_rax: u64,
        pub rip: u64,
        pub cs: u64,
        pub eflags: u64,
        pub rsp: u64,
        pub ss: u64,
        pub fs_base: u64,
        pub gs_base: u64,
        pub ds: u64,
        pub es: u64,
        pub fs: u64,
        pub gs: u64,
    }
}

#[cfg(target_arch = "x86_64")]
assert_eq_size!(x64::user_regs_struct, libc::user_regs_struct);
#[cfg(target_arch = "x86_64")]
assert_eq_align!(x64::user_regs_struct, libc::user_regs_struct);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_sizes() {
        assert_eq!(word_size(SupportedArch::X86), 4);
        assert_eq!(word_size(SupportedArch::X64), 8);
    }

    #[test]
    fn regs_struct_sizes() {
        assert_eq!(std::mem::size_of::<x86::user_regs_struct>(), 17 * 4);
        assert_eq!(std::mem::size_of::<x64::user_regs_struct>(), 27 * 8);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn native_arch_is_x64() {
        assert_eq!(NATIVE_ARCH, SupportedArch::X64);
        assert_eq!(word_size(NATIVE_ARCH), 8);
    }
}

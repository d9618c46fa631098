use crate::kernel_abi::SupportedArch;
use crate::remote_ptr::RemotePtr;
use std::fmt::{Debug, Display, Formatter, Result};
use std::ops::{Add, Sub};

/// A pointer to tracee code. Kept distinct from `RemotePtr` so that code
/// and data addresses can't be mixed up; arithmetic is always in bytes.
#[derive(Copy, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn new(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    /// An x86 breakpoint traps with IP one byte past the 0xCC opcode,
    /// on both supported architectures.
    pub fn decrement_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        self - 1usize
    }

    pub fn increment_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        self + 1usize
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::<T>::new(self.ptr)
    }

    pub fn register_value(&self) -> usize {
        self.ptr
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(val: usize) -> Self {
        RemoteCodePtr::new(val)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::new(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new(self.ptr - delta)
    }
}

impl Sub<RemoteCodePtr> for RemoteCodePtr {
    type Output = isize;

    fn sub(self, rhs: RemoteCodePtr) -> Self::Output {
        self.ptr as isize - rhs.ptr as isize
    }
}

use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter, Result};
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// The referent type for untyped tracee memory.
pub type Void = u8;

/// A typed pointer into the tracee's address space. Arithmetic is scaled
/// by the referent size, like a raw pointer, but the value is never
/// dereferenced locally.
#[derive(Copy, Clone, Hash)]
pub struct RemotePtr<T> {
    ptr: usize,
    phantom: PhantomData<T>,
}

impl<T> RemotePtr<T> {
    pub fn null() -> RemotePtr<T> {
        RemotePtr {
            ptr: 0,
            phantom: PhantomData,
        }
    }

    pub fn new(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    pub fn referent_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn cast<U>(self) -> RemotePtr<U> {
        RemotePtr::<U>::new(self.ptr)
    }
}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> From<usize> for RemotePtr<T> {
    fn from(val: usize) -> Self {
        RemotePtr::new(val)
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::new(self.ptr + delta * std::mem::size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new(self.ptr - delta * std::mem::size_of::<T>())
    }
}

/// Distance in referents. Panics in debug builds when `rhs` is past
/// `self`, like the `end - start` computations this backs.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> Self::Output {
        (self.ptr - rhs.ptr) / std::mem::size_of::<T>()
    }
}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &RemotePtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &RemotePtr<T>) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &RemotePtr<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

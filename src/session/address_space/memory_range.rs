use crate::remote_ptr::{RemotePtr, Void};
use std::cmp::{max, min};
use std::fmt::{Display, Formatter, Result};

/// A half-open range of tracee addresses: the end point is not included.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MemoryRange {
    start_: RemotePtr<Void>,
    end_: RemotePtr<Void>,
}

impl Default for MemoryRange {
    fn default() -> Self {
        MemoryRange {
            start_: RemotePtr::null(),
            end_: RemotePtr::null(),
        }
    }
}

impl MemoryRange {
    /// If the addition overflows, rust panics in debug mode, so no
    /// explicit start <= end assertion is needed here.
    pub fn new_range(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: RemotePtr<Void>, end: RemotePtr<Void>) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// True iff `other` is fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start_
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.end_
    }

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_open_membership() {
        let r = MemoryRange::new_range(10usize.into(), 5);
        assert!(r.contains_ptr(10usize.into()));
        assert!(r.contains_ptr(14usize.into()));
        assert!(!r.contains_ptr(15usize.into()));
        assert_eq!(r.size(), 5);
    }

    #[test]
    fn intersection() {
        let a = MemoryRange::from_range(0usize.into(), 10usize.into());
        let b = MemoryRange::from_range(5usize.into(), 15usize.into());
        let c = MemoryRange::from_range(10usize.into(), 15usize.into());
        assert!(a.intersects(&b));
        // Touching ranges don't intersect: the end point is excluded.
        assert!(!a.intersects(&c));
        assert_eq!(a.intersect(b), MemoryRange::from_range(5usize.into(), 10usize.into()));
    }

    #[test]
    fn containment() {
        let outer = MemoryRange::from_range(0usize.into(), 10usize.into());
        let inner = MemoryRange::from_range(2usize.into(), 8usize.into());
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn zero_sized_range_intersects_nothing() {
        let empty = MemoryRange::new_range(5usize.into(), 0);
        let r = MemoryRange::from_range(0usize.into(), 10usize.into());
        assert!(!empty.intersects(&r));
        assert!(!r.intersects(&empty));
    }
}

pub mod memory_range;

use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use memory_range::MemoryRange;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointType {
    BkptNone = 0,
    /// Trap for internal replay purposes, e.g. catching the end of a
    /// string-instruction loop.
    BkptInternal = 1,
    /// Trap on behalf of a debugger user.
    BkptUser = 2,
}

/// NB: these random-looking enumeration values are chosen to match the
/// numbers programmed into x86 debug registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

/// DR6 bits the engine cares about.
#[derive(Copy, Clone)]
#[repr(usize)]
pub enum DebugStatus {
    DsWatchpointAny = 0xf,
    DsSingleStep = 1 << 14,
}

/// A distinct watchpoint, corresponding to the information needed to
/// program a single x86 debug register.
#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

/// Refcounts for a breakpoint set at one address. There can be USER and
/// INTERNAL refs on the same address at the same time, and removal order
/// is not fixed, so both counts are tracked explicitly.
#[derive(Clone, Default)]
struct Breakpoint {
    internal_count: u32,
    user_count: u32,
}

impl Breakpoint {
    fn do_ref(&mut self, which: BreakpointType) {
        *self.counter(which) += 1;
    }

    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        let v = self.counter(which);
        debug_assert!(*v > 0);
        *v -= 1;
        self.internal_count + self.user_count
    }

    fn bp_type(&self) -> BreakpointType {
        // USER breakpoints need to be reported before INTERNAL ones: the
        // debugger user gets to dispatch commands before we attend to
        // internal business.
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else {
            BreakpointType::BkptInternal
        }
    }

    fn counter(&mut self, which: BreakpointType) -> &mut u32 {
        if which == BreakpointType::BkptUser {
            &mut self.user_count
        } else {
            &mut self.internal_count
        }
    }
}

bitflags! {
    struct RwxBits: u32 {
        const EXEC_BIT = 1 << 0;
        const READ_BIT = 1 << 1;
        const WRITE_BIT = 1 << 2;
    }
}

/// Watched accesses of a contiguous range of memory addresses, refcounted
/// per access kind so overlapping add/remove pairs balance out.
#[derive(Clone, Default)]
struct Watchpoint {
    exec_count: u32,
    read_count: u32,
    write_count: u32,
}

impl Watchpoint {
    fn watch(&mut self, which: RwxBits) {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count += 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count += 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count += 1;
        }
    }

    fn unwatch(&mut self, which: RwxBits) -> u32 {
        if which.contains(RwxBits::EXEC_BIT) {
            debug_assert!(self.exec_count > 0);
            self.exec_count -= 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            debug_assert!(self.read_count > 0);
            self.read_count -= 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            debug_assert!(self.write_count > 0);
            self.write_count -= 1;
        }
        self.exec_count + self.read_count + self.write_count
    }

    fn watched_bits(&self) -> RwxBits {
        let mut watched = RwxBits::empty();
        if self.exec_count > 0 {
            watched |= RwxBits::EXEC_BIT;
        }
        if self.read_count > 0 {
            watched |= RwxBits::READ_BIT;
        }
        if self.write_count > 0 {
            watched |= RwxBits::WRITE_BIT;
        }
        watched
    }
}

pub type AddressSpaceSharedPtr = Rc<AddressSpace>;

/// Number of hardware debug registers usable for watchpoints (DR0-DR3).
const MAX_HW_WATCH_REGISTERS: usize = 4;

/// The process-wide registry of breakpoints and watchpoints, shared by
/// every subsystem touching the tracee. Watchpoints are tracked per
/// address space on behalf of debuggers that assume that model, even
/// though the hardware programs them per task.
///
/// The registry is purely logical: materializing it into the tracee
/// (int3 bytes, DR0-DR3, DR7) is the Task implementation's concern.
#[derive(Default)]
pub struct AddressSpace {
    breakpoints: RefCell<HashMap<RemoteCodePtr, Breakpoint>>,
    watchpoints: RefCell<HashMap<MemoryRange, Watchpoint>>,
    saved_watchpoints: RefCell<Vec<HashMap<MemoryRange, Watchpoint>>>,
}

impl AddressSpace {
    pub fn new() -> AddressSpaceSharedPtr {
        Rc::new(AddressSpace::default())
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        match self.breakpoints.borrow().get(&addr) {
            Some(bp) => bp.bp_type(),
            None => BreakpointType::BkptNone,
        }
    }

    /// Ensure a breakpoint of `type_` is set at `addr`.
    pub fn add_breakpoint(&self, addr: RemoteCodePtr, type_: BreakpointType) -> bool {
        debug_assert!(type_ != BreakpointType::BkptNone);
        self.breakpoints
            .borrow_mut()
            .entry(addr)
            .or_default()
            .do_ref(type_);
        true
    }

    /// Drop a `type_` reference to the breakpoint at `addr`. The
    /// breakpoint is destroyed when the last reference goes.
    pub fn remove_breakpoint(&self, addr: RemoteCodePtr, type_: BreakpointType) {
        let mut breakpoints = self.breakpoints.borrow_mut();
        let destroy = match breakpoints.get_mut(&addr) {
            Some(bp) => bp.do_unref(type_) == 0,
            None => false,
        };
        if destroy {
            breakpoints.remove(&addr);
        }
    }

    /// Analogous to the breakpoint methods, except that watchpoints
    /// cover an address range. Fails, leaving the registry unchanged,
    /// when the resulting set can't be allocated onto the hardware debug
    /// registers.
    pub fn add_watchpoint(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        let range = range_for_watchpoint(addr, num_bytes);
        self.watchpoints
            .borrow_mut()
            .entry(range)
            .or_default()
            .watch(access_bits_of(type_));
        if !self.allocate_watchpoints() {
            self.remove_watchpoint(addr, num_bytes, type_);
            return false;
        }
        true
    }

    pub fn remove_watchpoint(&self, addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) {
        let range = range_for_watchpoint(addr, num_bytes);
        let mut watchpoints = self.watchpoints.borrow_mut();
        let destroy = match watchpoints.get_mut(&range) {
            Some(w) => w.unwatch(access_bits_of(type_)) == 0,
            None => false,
        };
        if destroy {
            watchpoints.remove(&range);
        }
    }

    pub fn remove_all_watchpoints(&self) {
        self.watchpoints.borrow_mut().clear();
    }

    pub fn all_watchpoints(&self) -> Vec<WatchConfig> {
        let mut configs = Vec::new();
        for (range, w) in self.watchpoints.borrow().iter() {
            let watched = w.watched_bits();
            if watched.contains(RwxBits::EXEC_BIT) {
                configs.push(WatchConfig::new(
                    range.start(),
                    range.size(),
                    WatchType::WatchExec,
                ));
            }
            if watched.contains(RwxBits::READ_BIT) {
                configs.push(WatchConfig::new(
                    range.start(),
                    range.size(),
                    WatchType::WatchReadWrite,
                ));
            } else if watched.contains(RwxBits::WRITE_BIT) {
                configs.push(WatchConfig::new(
                    range.start(),
                    range.size(),
                    WatchType::WatchWrite,
                ));
            }
        }
        configs
    }

    /// Save all watchpoint state onto a stack.
    pub fn save_watchpoints(&self) {
        self.saved_watchpoints
            .borrow_mut()
            .push(self.watchpoints.borrow().clone());
    }

    /// Pop all watchpoint state from the saved-state stack.
    pub fn restore_watchpoints(&self) -> bool {
        debug_assert!(!self.saved_watchpoints.borrow().is_empty());
        *self.watchpoints.borrow_mut() = self.saved_watchpoints.borrow_mut().pop().unwrap();
        self.allocate_watchpoints()
    }

    /// Whether the current watchpoint set fits the hardware. Each
    /// watchpoint range is split into aligned units a debug register can
    /// express; the total must not exceed DR0-DR3.
    fn allocate_watchpoints(&self) -> bool {
        let mut regs_needed = 0;
        for range in self.watchpoints.borrow().keys() {
            regs_needed += hw_watch_units(*range).len();
        }
        regs_needed <= MAX_HW_WATCH_REGISTERS
    }
}

fn range_for_watchpoint(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
    MemoryRange::new_range(addr, num_bytes)
}

fn access_bits_of(type_: WatchType) -> RwxBits {
    match type_ {
        WatchType::WatchExec => RwxBits::EXEC_BIT,
        WatchType::WatchWrite => RwxBits::WRITE_BIT,
        WatchType::WatchReadWrite => RwxBits::READ_BIT | RwxBits::WRITE_BIT,
    }
}

fn align_down(addr: usize, alignment: usize) -> usize {
    addr & !(alignment - 1)
}

/// Split `range` into units an x86 debug register can watch: 1, 2, 4 or
/// 8 bytes, naturally aligned. A short range lying inside one aligned
/// window is covered by a single, possibly widened unit; the widening is
/// allowed because a watchpoint fire is rechecked against the ranges the
/// user asked for. This is also why watchpoints must be disabled around
/// an execution window that may legitimately touch the widened bytes.
fn hw_watch_units(range: MemoryRange) -> Vec<MemoryRange> {
    let start = range.start().as_usize();
    let end = range.end().as_usize();
    if start == end {
        // Zero-sized watch, can never trigger.
        return Vec::new();
    }

    for &width in &[1usize, 2, 4, 8] {
        let aligned = align_down(start, width);
        if aligned + width >= end {
            return vec![MemoryRange::new_range(aligned.into(), width)];
        }
    }

    let mut units = Vec::new();
    let mut p = start;
    while p < end {
        let mut width = 8;
        while width > 1 && (p % width != 0 || p + width > end) {
            width /= 2;
        }
        units.push(MemoryRange::new_range(p.into(), width));
        p += width;
    }
    units
}

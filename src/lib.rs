//! Fast-forward execution engine for replaying x86/x86_64 tracees.
//!
//! During replay a tracee must be single-stepped until it reaches a
//! recorded register state. A `REP`-prefixed string instruction turns that
//! into millions of traps. [`fast_forward::fast_forward_through_instruction`]
//! bounds how many iterations can safely execute before anything
//! interesting happens (a recorded state, a watchpoint, a ZF-based early
//! exit, loop termination), jumps most of them in one hardware
//! continuation, and single-steps only the tail.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod fast_forward;
pub mod kernel_abi;
pub mod kernel_metadata;
pub mod registers;
pub mod remote_code_ptr;
pub mod remote_ptr;
pub mod session;
pub mod sig;
pub mod wait_status;

//! Execution contexts: saved register file, program counter and stack of a suspended flow of
//! control.

use std::ffi::c_void;
use std::io;

use super::stack::StackSize;

#[cfg(unix)]
mod ucontext;
#[cfg(unix)]
pub(crate) use self::ucontext::{Context, Host};

#[cfg(windows)]
mod fiber;
#[cfg(windows)]
pub(crate) use self::fiber::{Context, Host};

#[cfg(not(any(unix, windows)))]
compile_error!("handoff supports only unix and windows hosts");

/// Function to run on a fresh context when it is switched into for the first time.
///
/// It must never return, but switch away for the last time instead.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Entry {
    pub f: unsafe fn(*mut c_void),
    pub arg: *mut c_void,
}

impl Entry {
    pub(crate) unsafe fn run(self) -> ! {
        (self.f)(self.arg);
        // Nothing is left to return to.
        std::process::abort()
    }
}

pub(crate) trait ExecutionContext: Sized {
    /// Host side binding that must outlive every context switched on this thread.
    type Host;

    /// Prepares calling thread for switching. Dropping the returned host undoes it.
    fn attach() -> io::Result<Self::Host>;

    /// Context of no flow of control. It serves as save slot for [ExecutionContext::switch].
    fn empty() -> Self;

    /// Creates a context which starts running `entry` on its own stack once switched into.
    ///
    /// No resource is retained on failure. Dropping the returned context releases its stack.
    fn materialize(entry: Entry, stack_size: StackSize) -> io::Result<Box<Self>>;

    /// Saves calling flow into `backup` and transfers cpu to this context.
    ///
    /// Returns when someone switches into `backup`.
    ///
    /// # Safety
    /// This context must not be the running one, and must still be alive when switched.
    unsafe fn switch(&self, backup: &mut Self);
}

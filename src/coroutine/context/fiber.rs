use std::cell::Cell;
use std::ffi::c_void;
use std::{io, ptr};

use super::{Entry, ExecutionContext};
use crate::coroutine::stack::StackSize;

type FiberStart = unsafe extern "system" fn(*mut c_void);

#[link(name = "kernel32")]
extern "system" {
    fn ConvertThreadToFiber(parameter: *const c_void) -> *mut c_void;
    fn ConvertFiberToThread() -> i32;
    fn CreateFiber(stack_size: usize, start: Option<FiberStart>, parameter: *const c_void) -> *mut c_void;
    fn DeleteFiber(fiber: *const c_void);
    fn SwitchToFiber(fiber: *const c_void);
}

thread_local! {
    // There is no exported GetCurrentFiber, so track it.
    static RUNNING_FIBER: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
    static ATTACHMENTS: Cell<usize> = const { Cell::new(0) };
}

/// Context backed by a host fiber which owns its stack.
pub(crate) struct Context {
    fiber: *mut c_void,
    owned: bool,
    entry: Option<Entry>,
}

/// Keeps calling thread converted to fiber.
pub(crate) struct Host {
    _private: (),
}

impl Drop for Host {
    fn drop(&mut self) {
        let attachments = ATTACHMENTS.with(|c| c.get()) - 1;
        ATTACHMENTS.with(|c| c.set(attachments));
        if attachments == 0 {
            unsafe { ConvertFiberToThread() };
            RUNNING_FIBER.with(|c| c.set(ptr::null_mut()));
        }
    }
}

impl Context {
    unsafe extern "system" fn start(arg: *mut c_void) {
        match (*(arg as *const Context)).entry {
            Some(entry) => entry.run(),
            None => std::process::abort(),
        }
    }
}

impl ExecutionContext for Context {
    type Host = Host;

    fn attach() -> io::Result<Host> {
        if ATTACHMENTS.with(|c| c.get()) == 0 {
            let fiber = unsafe { ConvertThreadToFiber(ptr::null()) };
            if fiber.is_null() {
                return Err(io::Error::last_os_error());
            }
            RUNNING_FIBER.with(|c| c.set(fiber));
        }
        ATTACHMENTS.with(|c| c.set(c.get() + 1));
        Ok(Host { _private: () })
    }

    fn empty() -> Context {
        Context { fiber: ptr::null_mut(), owned: false, entry: None }
    }

    fn materialize(entry: Entry, stack_size: StackSize) -> io::Result<Box<Context>> {
        let mut ctx = Box::new(Context { fiber: ptr::null_mut(), owned: false, entry: Some(entry) });
        let size = if stack_size.is_default() { 0 } else { stack_size.bytes() };
        let arg = ctx.as_mut() as *mut Context as *const c_void;
        let fiber = unsafe { CreateFiber(size, Some(Self::start), arg) };
        if fiber.is_null() {
            return Err(io::Error::last_os_error());
        }
        ctx.fiber = fiber;
        ctx.owned = true;
        Ok(ctx)
    }

    unsafe fn switch(&self, backup: &mut Context) {
        let running = RUNNING_FIBER.with(|c| c.replace(self.fiber));
        assert!(!running.is_null(), "thread not attached");
        backup.fiber = running;
        SwitchToFiber(self.fiber);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.owned && !self.fiber.is_null() {
            unsafe { DeleteFiber(self.fiber) };
        }
    }
}

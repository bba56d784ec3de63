use std::ffi::c_void;
use std::{io, mem, ptr};

use super::{Entry, ExecutionContext};
use crate::coroutine::stack::{Stack, StackSize};

#[allow(improper_ctypes)] // suppress "`extern` block uses type `u128`, which is not FFI-safe"
extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(*mut c_void), argc: libc::c_int, ...);
}

/// Context backed by `ucontext_t` with a stack owned by itself.
#[repr(C, align(16))]
pub(crate) struct Context {
    stack: Stack,
    entry: Option<Entry>,
    context: libc::ucontext_t,
    // macOS and its siblings embed mcontext inside ucontext while libc crate did not include them.
    // See following links for details.
    //
    // * https://github.com/rust-lang/libc/issues/2812
    // * https://github.com/rust-lang/libc/pull/2817
    // * https://github.com/rust-lang/libc/pull/3312
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
    _mcontext: libc::__darwin_mcontext64,
}

/// Nothing to bind, every thread could swap ucontext.
pub(crate) struct Host;

impl Context {
    extern "C" fn start(arg: *mut c_void) {
        let entry = unsafe { (*(arg as *const Context)).entry };
        match entry {
            Some(entry) => unsafe { entry.run() },
            None => std::process::abort(),
        }
    }
}

impl ExecutionContext for Context {
    type Host = Host;

    fn attach() -> io::Result<Host> {
        Ok(Host)
    }

    fn empty() -> Context {
        Context {
            stack: Stack::empty(),
            entry: None,
            context: unsafe { mem::zeroed() },
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
            _mcontext: unsafe { mem::zeroed() },
        }
    }

    // Box Context as ucontext_t could point into itself after getcontext. Moving it afterwards
    // crashes unpredictably.
    fn materialize(entry: Entry, stack_size: StackSize) -> io::Result<Box<Context>> {
        let stack = Stack::alloc(stack_size)?;
        let mut ctx = Box::new(Context::empty());
        if unsafe { getcontext(&mut ctx.context) } != 0 {
            return Err(io::Error::last_os_error());
        }
        ctx.context.uc_stack.ss_sp = stack.base() as *mut c_void;
        ctx.context.uc_stack.ss_size = stack.size();
        ctx.context.uc_stack.ss_flags = 0;
        ctx.context.uc_link = ptr::null_mut();
        ctx.stack = stack;
        ctx.entry = Some(entry);
        let arg = ctx.as_mut() as *mut Context as *mut c_void;
        unsafe { makecontext(&mut ctx.context, Self::start, 1, arg) };
        Ok(ctx)
    }

    unsafe fn switch(&self, backup: &mut Context) {
        let rc = swapcontext(&mut backup.context, &self.context);
        if rc != 0 {
            panic!("swapcontext returns {}, errno {}", rc, errno::errno());
        }
    }
}

/// Default stack size of a coroutine, 64 KiB.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
enum Request {
    #[default]
    Default,
    Extra(usize),
    Exact(usize),
}

/// StackSize specifies desired stack size for new coroutines.
///
/// It defaults to [DEFAULT_STACK_SIZE]. On unix the size is rounded up to page size and never
/// goes below `MINSIGSTKSZ`. On windows the default asks the host for its own default
/// fiber stack size.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct StackSize {
    request: Request,
}

impl StackSize {
    /// Specifies extra stack size in addition to default.
    pub fn with_extra_size(size: usize) -> StackSize {
        assert!(size <= isize::MAX as usize, "stack size is too large");
        StackSize { request: Request::Extra(size) }
    }

    /// Specifies desired stack size.
    pub fn with_size(size: usize) -> StackSize {
        assert!(size <= isize::MAX as usize, "stack size is too large");
        StackSize { request: Request::Exact(size.max(1)) }
    }

    /// Requested size in bytes before any host rounding.
    pub fn bytes(&self) -> usize {
        match self.request {
            Request::Default => DEFAULT_STACK_SIZE,
            Request::Extra(size) => DEFAULT_STACK_SIZE.saturating_add(size),
            Request::Exact(size) => size,
        }
    }

    /// Whether this is the default size, which delegating hosts translate to their own default.
    pub fn is_default(&self) -> bool {
        self.request == Request::Default
    }
}

#[cfg(unix)]
pub(crate) use self::guarded::Stack;

#[cfg(unix)]
mod guarded {
    use std::{alloc, io, ptr};

    use super::super::page_size;
    use super::StackSize;

    /// Stack owned by a coroutine context, with an inaccessible guard page on both ends.
    pub(crate) struct Stack {
        base: *mut u8,
        size: usize,
    }

    impl Stack {
        pub fn empty() -> Stack {
            Stack { base: ptr::null_mut(), size: 0 }
        }

        pub fn base(&self) -> *mut u8 {
            self.base
        }

        pub fn size(&self) -> usize {
            self.size
        }

        fn layout(size: usize) -> io::Result<alloc::Layout> {
            let page_size = page_size::get();
            size.checked_add(2 * page_size)
                .and_then(|alloc_size| alloc::Layout::from_size_align(alloc_size, page_size).ok())
                .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "stack size overflows layout"))
        }

        fn protect(low: *mut u8, size: usize, prot: libc::c_int) -> io::Result<()> {
            let page_size = page_size::get();
            let high = unsafe { low.add(page_size + size) };
            for guard in [low, high] {
                if unsafe { libc::mprotect(guard as *mut libc::c_void, page_size, prot) } != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn alloc(size: StackSize) -> io::Result<Stack> {
            let stack_size = page_size::align_up(size.bytes())
                .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "stack size overflows"))?
                .max(libc::MINSIGSTKSZ);
            let layout = Self::layout(stack_size)?;
            let stack_low = unsafe { alloc::alloc(layout) };
            if stack_low.is_null() {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "fail to allocate coroutine stack"));
            }
            if let Err(err) = Self::protect(stack_low, stack_size, libc::PROT_NONE) {
                Self::protect(stack_low, stack_size, libc::PROT_READ | libc::PROT_WRITE).ok();
                unsafe { alloc::dealloc(stack_low, layout) };
                return Err(err);
            }
            let base = unsafe { stack_low.add(page_size::get()) };
            Ok(Stack { base, size: stack_size })
        }
    }

    impl Drop for Stack {
        fn drop(&mut self) {
            if self.base.is_null() {
                return;
            }
            let low = unsafe { self.base.sub(page_size::get()) };
            if let Err(err) = Self::protect(low, self.size, libc::PROT_READ | libc::PROT_WRITE) {
                // Handing guarded pages back to the allocator would fault later, leak instead.
                tracing::warn!(%err, size = self.size, "fail to unprotect coroutine stack, leaking it");
                return;
            }
            if let Ok(layout) = Self::layout(self.size) {
                unsafe { alloc::dealloc(low, layout) };
            }
        }
    }
}

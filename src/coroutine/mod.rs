//! Coroutine handles and their control blocks.

pub(crate) mod context;
#[cfg(unix)]
mod page_size;
pub(crate) mod stack;

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, io};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::assert_not_impl_any;
use strum::Display;

use self::context::{Context, Entry, ExecutionContext};
use self::stack::StackSize;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static COROUTINE: Cell<Option<NonNull<Block>>> = const { Cell::new(None) };
}

/// Block of the coroutine executing on this thread, `None` for the thread's own flow.
pub(crate) fn current() -> Option<NonNull<Block>> {
    COROUTINE.with(|cell| cell.get())
}

/// Marks a block as the executing one until dropped, restoring the previous one after.
pub(crate) struct Scope {
    previous: Option<NonNull<Block>>,
}

impl Scope {
    pub fn enter(block: &Block) -> Scope {
        let previous = COROUTINE.with(|cell| cell.replace(Some(NonNull::from(block))));
        Scope { previous }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        COROUTINE.with(|cell| cell.set(self.previous));
    }
}

/// Status of a coroutine.
///
/// ```text
/// Ready --resume--> Running --yield--> Ready
///                   Running --return-> Stopped
/// ```
///
/// `Invalid` and `Stopped` are terminal.
#[repr(i8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    /// Empty handle or failed creation.
    Invalid = -1,
    /// Executing, somewhere up in the call chain of a `resume`.
    Running = 0,
    /// Created or suspended, resumable.
    Ready = 1,
    /// Body returned, never runs again.
    Stopped = 2,
}

impl Status {
    /// Whether no transition leaves this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Invalid | Status::Stopped)
    }
}

pub(crate) type Thunk = Box<dyn FnOnce()>;

pub(crate) type PanicError = Box<dyn Any + Send + 'static>;

/// Control block of one coroutine.
///
/// The handle and the tracking manager share it. Its context and entry are released at most once
/// as they are taken out of their slots.
pub(crate) struct Block {
    id: u64,
    status: Cell<Status>,
    context: UnsafeCell<Option<Box<Context>>>,
    resume_context: UnsafeCell<Box<Context>>,
    entry: Cell<Option<Thunk>>,
    panicked: Cell<Option<PanicError>>,
}

impl Block {
    pub fn new() -> Rc<Block> {
        Rc::new(Block {
            id: ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            status: Cell::new(Status::Invalid),
            context: UnsafeCell::new(None),
            resume_context: UnsafeCell::new(Box::new(Context::empty())),
            entry: Cell::new(None),
            panicked: Cell::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn set_status(&self, status: Status) {
        self.status.set(status)
    }

    /// Binds a fresh stack running `f` to this block and makes it [Status::Ready].
    ///
    /// Block stays [Status::Invalid] on failure.
    pub fn materialize(self: &Rc<Self>, f: Thunk, stack_size: StackSize) -> io::Result<()> {
        let entry = Entry { f: Block::main, arg: Rc::as_ptr(self) as *mut c_void };
        let context = Context::materialize(entry, stack_size)?;
        unsafe { *self.context.get() = Some(context) };
        self.entry.set(Some(f));
        self.status.set(Status::Ready);
        Ok(())
    }

    unsafe fn main(arg: *mut c_void) {
        let block = &*(arg as *const Block);
        block.status.set(Status::Running);
        if let Some(f) = block.entry.take() {
            if let Err(err) = panic::catch_unwind(AssertUnwindSafe(f)) {
                block.panicked.set(Some(err));
            }
        }
        block.status.set(Status::Stopped);
        block.switch_out();
    }

    fn context_ptr(&self) -> *mut Context {
        let context = unsafe { &mut *self.context.get() };
        let context = context.as_deref_mut().expect("coroutine context released");
        context as *mut Context
    }

    /// Switches into this block, saving calling flow as its resume context.
    ///
    /// # Safety
    /// Block must be materialized and not running.
    pub unsafe fn switch_in(&self) {
        let context = self.context_ptr();
        let backup = &mut **self.resume_context.get();
        (*context).switch(backup);
    }

    /// Switches back to whoever switched into this block most recently.
    ///
    /// # Safety
    /// Must be called on this block's own stack.
    pub unsafe fn switch_out(&self) {
        let context = &mut *self.context_ptr();
        let resume_context = &**self.resume_context.get();
        resume_context.switch(context);
    }

    /// Releases stack and entry, returns whether there was a stack to release.
    ///
    /// # Safety
    /// Must not be called on this block's own stack.
    pub unsafe fn release(&self) -> bool {
        drop(self.entry.take());
        (*self.context.get()).take().is_some()
    }

    pub fn take_panic(&self) -> Option<PanicError> {
        self.panicked.take()
    }
}

/// Handle to a coroutine created by [crate::Manager::create].
///
/// Handles are move only, at most one handle refers to a coroutine. Dropping a handle never
/// stops its coroutine: an unfinished coroutine stays with its manager.
#[derive(Default)]
pub struct Coroutine {
    block: Option<Rc<Block>>,
}

assert_not_impl_any!(Coroutine: Clone, Send, Sync);

impl Coroutine {
    /// Constructs an empty handle, its status is [Status::Invalid].
    pub fn new() -> Coroutine {
        Coroutine { block: None }
    }

    pub(crate) fn with_block(block: Rc<Block>) -> Coroutine {
        Coroutine { block: Some(block) }
    }

    pub(crate) fn block(&self) -> Option<&Rc<Block>> {
        self.block.as_ref()
    }

    /// Returns status of this coroutine.
    pub fn status(&self) -> Status {
        self.block.as_ref().map_or(Status::Invalid, |block| block.status())
    }

    /// Returns whether this handle refers to a successfully created coroutine.
    pub fn valid(&self) -> bool {
        self.status() != Status::Invalid
    }

    /// Process unique id of the referred coroutine.
    pub fn id(&self) -> Option<u64> {
        self.block.as_ref().map(|block| block.id())
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine").field("id", &self.id()).field("status", &self.status()).finish()
    }
}

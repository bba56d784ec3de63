//! Manager to create, resume and tear down coroutines.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::thread;

use hashbrown::HashMap;
use static_assertions::assert_not_impl_any;
use strum::Display;
use tracing::{debug, trace, warn};

use crate::coroutine::context::{Context, ExecutionContext, Host};
use crate::coroutine::stack::StackSize;
use crate::coroutine::{self, Block, Coroutine, Scope, Status};
use crate::error::Error;

/// Policy for unfinished coroutines when their [Manager] is dropped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Teardown {
    /// Releases stacks and entries of unfinished coroutines without running them again.
    ///
    /// No unwinding happens on abandoned stacks, so whatever a started coroutine owns on its
    /// stack leaks.
    #[default]
    Reclaim,
    /// Resumes unfinished coroutines until all of them stopped.
    ///
    /// Dropping never returns if one coroutine yields forever.
    Drain,
}

/// Builder for [Manager].
#[derive(Default)]
pub struct Builder {
    stack_size: StackSize,
    teardown: Teardown,
}

impl Builder {
    /// Constructs a builder with default stack size and [Teardown::Reclaim].
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Specifies stack size for coroutines created by built manager.
    pub fn stack_size(&mut self, stack_size: StackSize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Specifies teardown policy, it could be changed later by [Manager::set_teardown].
    pub fn teardown(&mut self, teardown: Teardown) -> &mut Self {
        self.teardown = teardown;
        self
    }

    /// Constructs a [Manager].
    pub fn build(&mut self) -> Manager {
        let shared = Shared {
            stack_size: self.stack_size,
            teardown: Cell::new(self.teardown),
            running: Cell::new(None),
            coroutines: RefCell::new(HashMap::new()),
            host: RefCell::new(None),
        };
        Manager { shared: Rc::new(shared) }
    }
}

struct Shared {
    stack_size: StackSize,
    teardown: Cell<Teardown>,

    // Block running under this manager, restored after nested resume.
    running: Cell<Option<NonNull<Block>>>,

    // Created and not yet stopped.
    coroutines: RefCell<HashMap<NonNull<Block>, Rc<Block>>>,

    // Dropped with this, after all coroutines.
    host: RefCell<Option<Host>>,
}

impl Shared {
    fn attach(&self) -> Result<(), Error> {
        let mut host = self.host.borrow_mut();
        if host.is_none() {
            *host = Some(Context::attach()?);
        }
        Ok(())
    }

    fn create(&self, f: Box<dyn FnOnce()>) -> Result<Coroutine, Error> {
        self.attach()?;
        let block = Block::new();
        block.materialize(f, self.stack_size)?;
        debug!(id = block.id(), stack_size = self.stack_size.bytes(), "coroutine created");
        self.coroutines.borrow_mut().insert(NonNull::from(block.as_ref()), block.clone());
        Ok(Coroutine::with_block(block))
    }

    fn resume(&self, block: &Rc<Block>) -> Result<(), Error> {
        let status = block.status();
        if status != Status::Ready {
            return Err(Error::NotResumable(status));
        }
        let key = NonNull::from(block.as_ref());
        if !self.coroutines.borrow().contains_key(&key) {
            return Err(Error::UnknownCoroutine);
        }
        trace!(id = block.id(), "resume coroutine");
        let previous = self.running.replace(Some(key));
        block.set_status(Status::Running);
        {
            let _scope = Scope::enter(block);
            unsafe { block.switch_in() };
        }
        self.running.set(previous);
        if block.status() == Status::Stopped {
            self.coroutines.borrow_mut().remove(&key);
            unsafe { block.release() };
            debug!(id = block.id(), "coroutine stopped");
            if let Some(err) = block.take_panic() {
                panic::resume_unwind(err);
            }
        }
        Ok(())
    }

    fn running_block(&self) -> Result<NonNull<Block>, Error> {
        let key = self.running.get().ok_or(Error::NoActiveCoroutine)?;
        // Only the running coroutine itself could yield, not its nested resumee from others.
        if coroutine::current() != Some(key) {
            return Err(Error::NoActiveCoroutine);
        }
        Ok(key)
    }
}

/// Suspends running block back to its resumer.
///
/// # Safety
/// Must be called on the stack of given block. Nothing of its manager is touched after switching
/// as manager could be gone when this block is abandoned.
unsafe fn suspend(key: NonNull<Block>) {
    let block = key.as_ref();
    trace!(id = block.id(), "yield coroutine");
    block.set_status(Status::Ready);
    block.switch_out();
    block.set_status(Status::Running);
}

impl Shared {
    fn reclaim(&self) {
        let blocks: Vec<_> = self.coroutines.borrow_mut().drain().map(|(_, block)| block).collect();
        for block in blocks {
            // A running block is on some stack up in this call chain.
            if block.status() == Status::Running {
                warn!(id = block.id(), "manager dropped inside its running coroutine");
                continue;
            }
            unsafe { block.release() };
            block.set_status(Status::Stopped);
            debug!(id = block.id(), "coroutine reclaimed");
        }
    }

    fn drain(&self) {
        // Resuming on an unwinding stack risks a second panic, fall back to reclaim.
        if thread::panicking() {
            warn!(remaining = self.coroutines.borrow().len(), "drain while panicking, reclaiming instead");
            return self.reclaim();
        }
        let mut panicked = None;
        loop {
            let next = self.coroutines.borrow().values().next().cloned();
            let block = match next {
                None => break,
                Some(block) => block,
            };
            match panic::catch_unwind(AssertUnwindSafe(|| self.resume(&block))) {
                Ok(Ok(())) => {},
                Ok(Err(err)) => {
                    warn!(id = block.id(), %err, "fail to drain coroutine, reclaiming it");
                    self.coroutines.borrow_mut().remove(&NonNull::from(block.as_ref()));
                    if block.status() != Status::Running {
                        unsafe { block.release() };
                        block.set_status(Status::Stopped);
                    }
                },
                // Block stopped and got released, keep draining others.
                Err(err) => {
                    panicked.get_or_insert(err);
                },
            }
        }
        if let Some(err) = panicked {
            panic::resume_unwind(err);
        }
    }

    fn teardown(&self) {
        let teardown = self.teardown.get();
        debug!(%teardown, remaining = self.coroutines.borrow().len(), "tearing down coroutine manager");
        match teardown {
            Teardown::Reclaim => self.reclaim(),
            Teardown::Drain => self.drain(),
        }
    }
}

/// Manager creates, resumes and tears down coroutines.
///
/// It never picks a coroutine to run, callers name the coroutine to [Manager::resume]. Inside a
/// coroutine, [Manager::yield_now] or [WeakManager::yield_now] transfers control back to its
/// most recent resumer.
///
/// Coroutines unfinished at drop are handled by [Teardown].
pub struct Manager {
    shared: Rc<Shared>,
}

assert_not_impl_any!(Manager: Send, Sync);

impl Manager {
    /// Constructs a manager with default stack size and [Teardown::Reclaim].
    pub fn new() -> Manager {
        Builder::default().build()
    }

    /// Creates a coroutine in [Status::Ready] to run `f` once resumed.
    ///
    /// Returns an [Status::Invalid] coroutine if its stack could not be allocated.
    pub fn create<F>(&self, f: F) -> Coroutine
    where
        F: FnOnce() + 'static,
    {
        self.try_create(f).unwrap_or_default()
    }

    /// Same as [Manager::create] except that it reports why creation failed.
    pub fn try_create<F>(&self, f: F) -> Result<Coroutine, Error>
    where
        F: FnOnce() + 'static,
    {
        self.shared.create(Box::new(f)).map_err(|err| {
            warn!(%err, "fail to create coroutine");
            err
        })
    }

    /// Transfers control into given coroutine until it yields or stops.
    ///
    /// Returns `false` without side effect if it is not [Status::Ready].
    ///
    /// # Panics
    /// Resumes panic from coroutine body on calling stack.
    pub fn resume(&self, co: &mut Coroutine) -> bool {
        self.try_resume(co).is_ok()
    }

    /// Same as [Manager::resume] except that it reports why coroutine is not resumable.
    pub fn try_resume(&self, co: &mut Coroutine) -> Result<(), Error> {
        let block = co.block().ok_or(Error::NotResumable(Status::Invalid))?;
        // Coroutine could drop this manager while running.
        let shared = self.shared.clone();
        shared.resume(block)
    }

    /// Transfers control from running coroutine back to its resumer.
    ///
    /// Returns `false` if called from outside of a coroutine running under this manager.
    pub fn yield_now(&self) -> bool {
        self.try_yield_now().is_ok()
    }

    /// Same as [Manager::yield_now] except that it returns [Error::NoActiveCoroutine] on failure.
    pub fn try_yield_now(&self) -> Result<(), Error> {
        let key = self.shared.running_block()?;
        unsafe { suspend(key) };
        Ok(())
    }

    /// Sets teardown policy, `true` for [Teardown::Drain] and `false` for [Teardown::Reclaim].
    pub fn set_teardown_policy(&self, drain: bool) {
        self.set_teardown(if drain { Teardown::Drain } else { Teardown::Reclaim });
    }

    /// Sets teardown policy.
    pub fn set_teardown(&self, teardown: Teardown) {
        self.shared.teardown.set(teardown);
    }

    /// Current teardown policy.
    pub fn teardown(&self) -> Teardown {
        self.shared.teardown.get()
    }

    /// Number of created and unfinished coroutines.
    pub fn len(&self) -> usize {
        self.shared.coroutines.borrow().len()
    }

    /// Returns whether all created coroutines have stopped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constructs a weak reference to use inside coroutine bodies.
    pub fn downgrade(&self) -> WeakManager {
        WeakManager { shared: Rc::downgrade(&self.shared) }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

/// Weak reference to [Manager] which could be moved into coroutine bodies.
///
/// It keeps no strong reference to manager while suspended, so an abandoned coroutine never keeps
/// its manager alive.
#[derive(Clone)]
pub struct WeakManager {
    shared: Weak<Shared>,
}

assert_not_impl_any!(WeakManager: Send, Sync);

impl WeakManager {
    fn upgrade(&self) -> Option<Rc<Shared>> {
        self.shared.upgrade()
    }

    /// Same as [Manager::resume]. Returns `false` if manager is gone.
    pub fn resume(&self, co: &mut Coroutine) -> bool {
        self.try_resume(co).is_ok()
    }

    /// Same as [Manager::try_resume].
    pub fn try_resume(&self, co: &mut Coroutine) -> Result<(), Error> {
        let block = co.block().ok_or(Error::NotResumable(Status::Invalid))?;
        // Hold manager alive until resume returns, even if coroutine drops it meanwhile.
        let shared = self.upgrade().ok_or(Error::UnknownCoroutine)?;
        shared.resume(block)
    }

    /// Same as [Manager::yield_now]. Returns `false` if manager is gone.
    pub fn yield_now(&self) -> bool {
        self.try_yield_now().is_ok()
    }

    /// Same as [Manager::try_yield_now].
    pub fn try_yield_now(&self) -> Result<(), Error> {
        // No strong reference while suspended, an abandoned coroutine must not pin its manager.
        let key = self.upgrade().ok_or(Error::NoActiveCoroutine)?.running_block()?;
        unsafe { suspend(key) };
        Ok(())
    }
}

//! # Cooperative stackful coroutines with explicit hand-off
//! `handoff` runs many independent flows of control, each with its own stack, on one thread.
//! Control moves only when code asks for it: a caller names the coroutine to resume, and the
//! coroutine yields back to whoever resumed it.
//!
//! ## Usage
//! Construct a [Manager] (or a [Builder] for non default [StackSize] or [Teardown]) to
//! [Manager::create] coroutines.
//!
//! * [Manager::resume] transfers control into a [Status::Ready] coroutine until it yields or
//!   stops.
//! * [Manager::yield_now] transfers control from running coroutine back to its resumer. Move a
//!   [WeakManager] from [Manager::downgrade] into coroutine bodies to reach their manager.
//! * [Coroutine::status] tells whether a coroutine is resumable.
//!
//! Dropping a [Manager] either reclaims unfinished coroutines without running them again, or
//! drains them to completion, see [Teardown].
//!
//! ## Example
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use handoff::{Manager, Status};
//!
//! let manager = Manager::new();
//! let counter = Rc::new(Cell::new(0));
//!
//! let mut co = manager.create({
//!     let manager = manager.downgrade();
//!     let counter = counter.clone();
//!     move || {
//!         for _ in 0..3 {
//!             counter.set(counter.get() + 1);
//!             manager.yield_now();
//!         }
//!     }
//! });
//!
//! let mut resumes = 0;
//! while manager.resume(&mut co) {
//!     resumes += 1;
//! }
//! assert_eq!(resumes, 4);
//! assert_eq!(counter.get(), 3);
//! assert_eq!(co.status(), Status::Stopped);
//! ```

pub mod coroutine;
mod error;
pub mod manager;

pub use coroutine::stack::{StackSize, DEFAULT_STACK_SIZE};
pub use coroutine::{Coroutine, Status};
pub use error::Error;
pub use manager::{Builder, Manager, Teardown, WeakManager};

//! The `{make, swap}` isolation layer over user-space context switching.
//!
//! Everything platform-specific about switching stacks lives behind two
//! operations: [`SavedContext::make`] prepares a context whose program
//! counter is an entry function, and [`SavedContext::switch`] swaps to a
//! saved context, carrying one machine word of data each way. The entry
//! function receives the word from the first switch into it, wide enough
//! for a pointer on every supported target, so no pointer splitting happens
//! above this module.
//!
//! NOTE: this module (together with the io_uring AIO backend) contains the
//! crate's only unsafe code. The safety invariants are documented inline.
#![allow(unsafe_code)]

use super::stack::FiberStack;
use super::{FiberInner, SwitchCode};
use context::{Context, Transfer};
use std::sync::Arc;

/// Entry function for a fresh context. Must never return by falling off;
/// it exits by switching away one final time.
pub(crate) type EntryFn = extern "C" fn(Transfer) -> !;

/// An inert CPU context: registers and stack pointer, sufficient to resume.
///
/// Exactly one side of a switch owns a `SavedContext` at any moment; the
/// switch consumes it and hands back the peer's freshly saved context.
pub(crate) struct SavedContext(Context);

// SAFETY: a saved context is only ever resumed by one thread, and only
// while the execution it snapshots is suspended. Fibers move between
// threads exclusively in this suspended state.
unsafe impl Send for SavedContext {}

impl SavedContext {
    /// Prepares a context that will enter `entry` on `stack`.
    pub(crate) fn make(stack: &FiberStack, entry: EntryFn) -> Self {
        // SAFETY: the stack region outlives the context; both are owned by
        // the same fiber, and the mmap'd region is address-stable across
        // moves of the owning struct.
        Self(unsafe { Context::new(stack.as_stack(), entry) })
    }

    /// Switches to this context, suspending the caller.
    ///
    /// Returns when something switches back, yielding the peer's new
    /// context and the word it passed.
    pub(crate) fn switch(self, data: usize) -> (SavedContext, usize) {
        // SAFETY: the context was saved by a suspended execution that no
        // other thread can resume (single-owner handoff above).
        let transfer = unsafe { self.0.resume(data) };
        (SavedContext(transfer.context), transfer.data)
    }

    /// Switches away for the last time; the calling context is abandoned.
    pub(crate) fn switch_final(self, data: usize) -> ! {
        // SAFETY: as for `switch`; the caller's own context is never
        // resumed again, so discarding the returned transfer is sound.
        let _ = unsafe { self.0.resume(data) };
        unreachable!("resumed a finished fiber context")
    }
}

impl std::fmt::Debug for SavedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedContext").finish_non_exhaustive()
    }
}

/// Prepares the resumable context for a fresh fiber.
pub(crate) fn make_fiber_context(stack: &FiberStack) -> SavedContext {
    SavedContext::make(stack, fiber_trampoline)
}

/// First frame of every fiber.
///
/// Receives the fiber through the transfer word, runs the entry (which
/// completes the fiber's result future itself), marks the fiber exited and
/// switches back to the scheduler for the last time. Unwinding never passes
/// this frame: the entry is run under `catch_unwind` inside
/// [`FiberInner::run_entry`].
extern "C" fn fiber_trampoline(t: Transfer) -> ! {
    // SAFETY: the first switch into a fiber passes `Arc::into_raw` of its
    // `FiberInner`; this is the matching `from_raw`, executed exactly once.
    let fiber = unsafe { Arc::from_raw(t.data as *const FiberInner) };
    fiber.set_return(SavedContext(t.context));

    fiber.run_entry();

    let ret = fiber.take_return();
    // The scheduler still holds a strong reference while the fiber runs, so
    // dropping ours here cannot free the stack we are executing on.
    drop(fiber);
    ret.switch_final(SwitchCode::Exited as usize)
}

//! Guard-paged stacks for fibers.

use crate::error::{Error, ErrorKind, Result};
use context::stack::{ProtectedFixedSizeStack, Stack};

/// A fixed-size fiber stack with a protective guard page below the lowest
/// address, so overflow faults instead of corrupting neighbouring memory.
///
/// The stack is exclusively owned by one fiber for that fiber's whole life
/// and is unmapped when dropped.
pub(crate) struct FiberStack {
    inner: ProtectedFixedSizeStack,
}

// SAFETY: the stack region is only ever executed on by one thread at a time
// (the scheduler thread currently running the owning fiber); ownership moves
// between threads only while the fiber is suspended.
#[allow(unsafe_code)]
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Allocates a stack of `size` bytes, or the platform default if 0.
    pub(crate) fn new(size: usize) -> Result<Self> {
        let size = if size == 0 {
            Stack::default_size()
        } else {
            size
        };
        let inner = ProtectedFixedSizeStack::new(size).map_err(|e| {
            Error::new(ErrorKind::Internal).with_context(format!("stack allocation failed: {e:?}"))
        })?;
        Ok(Self { inner })
    }

    /// The usable stack region (guard page excluded).
    pub(crate) fn as_stack(&self) -> &Stack {
        &self.inner
    }

    /// Usable size in bytes.
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

impl std::fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStack")
            .field("len", &self.inner.len())
            .finish()
    }
}

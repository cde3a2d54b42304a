//! Reentrant pin counter.
//!
//! Single-threaded depth counter deciding when a container's storage has to
//! be registered with (first pin) or released from (last unpin) the
//! collector. It does not synchronize mutators; it only tracks nesting.

use core::cell::Cell;
use core::marker::PhantomData;

/// Per-container pin depth. Embed it and call `enter`/`exit` around every
/// access that needs the container's contents frozen.
#[derive(Debug)]
pub struct PinCount {
    depth: Cell<usize>,
    // Keep !Send + !Sync in line with single-threaded design.
    _nosend: PhantomData<*mut ()>,
}

impl PinCount {
    pub const fn new() -> Self {
        Self {
            depth: Cell::new(0),
            _nosend: PhantomData,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.depth.get() > 0
    }

    /// Add one level. Returns true on the 0 -> 1 transition.
    #[inline]
    pub fn enter(&self) -> bool {
        let d = self.depth.get();
        let n = d.checked_add(1).expect("pin depth overflow");
        self.depth.set(n);
        d == 0
    }

    /// Remove one level. Returns true on the 1 -> 0 transition.
    ///
    /// Panics if nothing is pinned: an unmatched exit would release a root
    /// registration some other caller still relies on.
    #[inline]
    pub fn exit(&self) -> bool {
        let d = self.depth.get();
        assert!(d > 0, "unbalanced unpin: pin depth is already zero");
        self.depth.set(d - 1);
        d == 1
    }
}

impl Default for PinCount {
    fn default() -> Self {
        Self::new()
    }
}

//! Tracing: how a managed object reports the objects it holds strongly.

use crate::heap::Gc;
use crate::identity::ObjectId;
use core::cell::{Cell, RefCell};

/// Report every `Gc` edge held by `self`.
///
/// Trace implementations run inside a collection and must not call back
/// into the heap (no allocation, no rooting, no `collect`).
pub trait Trace {
    fn trace(&self, tracer: &mut Tracer<'_>);
}

/// Marking worklist handed to `Trace::trace`.
pub struct Tracer<'a> {
    worklist: &'a mut Vec<ObjectId>,
    deferred: bool,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(worklist: &'a mut Vec<ObjectId>) -> Self {
        Self {
            worklist,
            deferred: false,
        }
    }

    /// Mark `gc` (and, transitively, what it references) as reachable.
    #[inline]
    pub fn mark<T: ?Sized>(&mut self, gc: Gc<T>) {
        self.worklist.push(gc.id());
    }

    /// Report edges that cannot be read right now, e.g. behind a cell the
    /// mutator holds mutably borrowed. The collection is abandoned before
    /// its sweep and nothing is reclaimed.
    pub fn defer_collection(&mut self) {
        self.deferred = true;
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred
    }
}

macro_rules! leaf_trace {
    ($($t:ty),* $(,)?) => {
        $(
            impl Trace for $t {
                #[inline]
                fn trace(&self, _tracer: &mut Tracer<'_>) {}
            }
        )*
    };
}

leaf_trace!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        if let Some(v) = self {
            v.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        for v in self {
            v.trace(tracer);
        }
    }
}

impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        (**self).trace(tracer);
    }
}

impl<T: Trace + Copy> Trace for Cell<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.get().trace(tracer);
    }
}

// A cell borrowed mutably across an allocation safepoint may be gaining an
// edge right now; its contents are unknown, so the collection is deferred.
impl<T: Trace> Trace for RefCell<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        match self.try_borrow() {
            Ok(value) => value.trace(tracer),
            Err(_) => tracer.defer_collection(),
        }
    }
}

impl<A: Trace, B: Trace> Trace for (A, B) {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.0.trace(tracer);
        self.1.trace(tracer);
    }
}

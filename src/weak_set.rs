//! WeakSet: public set of weakly held managed objects.

use crate::collector::{Collector, CollectorError, Notification, RootRegion};
use crate::heap::Heap;
use crate::pin::PinCount;
use crate::table::{InsertError, WeakSlotTable};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData;
use core::ops::ControlFlow;
use std::rc::Rc;

type Table<C> = WeakSlotTable<<C as Collector>::Id, <C as Collector>::Notifier>;

/// Set of managed objects held without keeping them alive.
///
/// Every operation runs inside a pin bracket: the first pin registers the
/// slot table with the collector as a root region, the last unpin releases
/// it. While pinned, nothing stored in the set can be reclaimed, so the
/// set's contents only change through the caller's own `add`/`remove`.
/// While unpinned, a collection may reclaim any object reachable only
/// through the set; its entry is then removed by the collector's
/// notification.
pub struct WeakSet<T: 'static, C: Collector = Heap> {
    collector: C,
    // Shared with the collector: as a pinned region, and (weakly) with the
    // notifications registered for each entry.
    table: Rc<RefCell<Table<C>>>,
    pins: PinCount,
    token: Cell<Option<C::PinToken>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static, C: Collector> WeakSet<T, C> {
    pub fn new(collector: C) -> Self {
        Self::with_capacity(collector, 0)
    }

    /// Set able to hold `n` objects before its first resize.
    pub fn with_capacity(collector: C, n: usize) -> Self {
        Self {
            collector,
            table: Rc::new(RefCell::new(WeakSlotTable::with_capacity(n))),
            pins: PinCount::new(),
            token: Cell::new(None),
            _marker: PhantomData,
        }
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    /// Pin the set's contents. Reentrant; every `lock` needs one `unlock`.
    pub fn lock(&self) {
        if !self.pins.is_pinned() {
            let region: Rc<dyn RootRegion<C::Id>> = self.table.clone();
            self.token.set(Some(self.collector.pin_region(region)));
            log::trace!("weak set pinned");
        }
        self.pins.enter();
    }

    /// Undo one `lock`.
    ///
    /// # Panics
    ///
    /// Panics if the set is not locked.
    pub fn unlock(&self) {
        if self.pins.exit() {
            if let Some(token) = self.token.take() {
                self.collector.unpin_region(token);
            }
            log::trace!("weak set unpinned");
        }
    }

    /// `lock` now, `unlock` when the guard is dropped.
    pub fn pin(&self) -> PinGuard<'_, T, C> {
        self.lock();
        PinGuard { set: self }
    }

    pub fn is_locked(&self) -> bool {
        self.pins.is_pinned()
    }

    pub fn pin_depth(&self) -> usize {
        self.pins.depth()
    }

    fn notification(&self) -> Notification<C::Id> {
        let table = Rc::downgrade(&self.table);
        Box::new(move |id| {
            let Some(table) = table.upgrade() else {
                return;
            };
            let removed = table
                .try_borrow_mut()
                .expect("reclamation notified while the weak set is mid-operation")
                .remove(id);
            if removed.is_some() {
                log::trace!("weak set entry {id:?} reclaimed");
            }
        })
    }

    /// Add `obj`. Returns `Ok(false)` if it was already present.
    ///
    /// On error the set is unchanged.
    pub fn add(&mut self, obj: &C::Object<T>) -> Result<bool, CollectorError> {
        let _pin = self.pin();
        let id = self.collector.identity::<T>(obj);
        if self.table.borrow().contains(id) {
            return Ok(false);
        }
        // Absent before registering, so the insert cannot see `id` again.
        let notifier = self.collector.register_notifier(id, self.notification())?;
        let inserted = self.table.borrow_mut().insert(id, notifier);
        match inserted {
            Ok(_) => Ok(true),
            Err(InsertError::DuplicateId) => {
                unreachable!("{id:?} appeared in the weak set during registration")
            }
        }
    }

    /// Remove `obj`. Returns whether it was present.
    pub fn remove(&mut self, obj: &C::Object<T>) -> bool {
        let _pin = self.pin();
        let id = self.collector.identity::<T>(obj);
        let removed = self.table.borrow_mut().remove(id);
        match removed {
            Some(notifier) => {
                self.collector.deregister_notifier(notifier);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, obj: &C::Object<T>) -> bool {
        let _pin = self.pin();
        let id = self.collector.identity::<T>(obj);
        self.table.borrow().contains(id)
    }

    /// Membership by weak handle; usable after every strong reference to
    /// the object is gone.
    pub fn contains_id(&self, id: C::Id) -> bool {
        let _pin = self.pin();
        self.table.borrow().contains(id)
    }

    /// Number of objects in the set.
    pub fn len(&self) -> usize {
        let _pin = self.pin();
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        let _pin = self.pin();
        self.table.borrow().capacity()
    }

    /// Remove every object, keeping the capacity.
    pub fn clear(&mut self) {
        let _pin = self.pin();
        let notifiers = self.table.borrow_mut().clear();
        for notifier in notifiers {
            self.collector.deregister_notifier(notifier);
        }
    }

    /// Iterate in table order. The set stays pinned until the iterator is
    /// dropped, so no element can be reclaimed mid-iteration.
    pub fn iter(&self) -> Iter<'_, T, C> {
        Iter {
            guard: self.pin(),
            next: 0,
        }
    }

    /// Visit every object until `visit` breaks. Returns the break value.
    pub fn for_each<B, F>(&self, mut visit: F) -> Option<B>
    where
        F: FnMut(C::Object<T>) -> ControlFlow<B>,
    {
        for obj in self.iter() {
            if let ControlFlow::Break(b) = visit(obj) {
                return Some(b);
            }
        }
        None
    }
}

impl<T: 'static, C: Collector> Drop for WeakSet<T, C> {
    fn drop(&mut self) {
        let notifiers: Vec<C::Notifier> = self.table.borrow().notifiers().collect();
        for notifier in notifiers {
            self.collector.deregister_notifier(notifier);
        }
        if self.pins.is_pinned() {
            log::warn!(
                "weak set dropped while locked ({} unmatched lock calls)",
                self.pins.depth()
            );
            if let Some(token) = self.token.take() {
                self.collector.unpin_region(token);
            }
        }
    }
}

impl<T: 'static, C: Collector> fmt::Debug for WeakSet<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSet")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("pin_depth", &self.pin_depth())
            .finish()
    }
}

/// RAII pin returned by `WeakSet::pin`.
pub struct PinGuard<'a, T: 'static, C: Collector> {
    set: &'a WeakSet<T, C>,
}

impl<'a, T: 'static, C: Collector> Drop for PinGuard<'a, T, C> {
    fn drop(&mut self) {
        self.set.unlock();
    }
}

/// Pinned iterator over a `WeakSet`, yielding strong references.
pub struct Iter<'a, T: 'static, C: Collector> {
    guard: PinGuard<'a, T, C>,
    next: usize,
}

impl<'a, T: 'static, C: Collector> Iterator for Iter<'a, T, C> {
    type Item = C::Object<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let set = self.guard.set;
        loop {
            let id = {
                let table = set.table.borrow();
                if self.next >= table.capacity() {
                    return None;
                }
                table.id_at(self.next)
            };
            self.next += 1;
            // Pinned entries always resolve; a miss would be a collector bug.
            if let Some(obj) = id.and_then(|id| set.collector.upgrade::<T>(id)) {
                return Some(obj);
            }
        }
    }
}

impl<'a, T: 'static, C: Collector> IntoIterator for &'a WeakSet<T, C> {
    type Item = C::Object<T>;
    type IntoIter = Iter<'a, T, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

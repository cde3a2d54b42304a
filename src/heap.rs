//! Heap: a single-threaded, non-moving mark-and-sweep collector.
//!
//! Objects live in a generational slot map; an object's `ObjectId` is its
//! slot key, so a weak handle is just the id and resolving it is a lookup.
//! Strong references come in two kinds:
//! - `Root<T>`: counted roots held by Rust code;
//! - `Gc<T>`: edges stored inside other managed objects, found by `Trace`.
//!
//! A collection marks from every rooted object and every pinned region,
//! sweeps the rest, and then runs the finalization notifications registered
//! for swept objects. Notifications and payload drops run after the heap's
//! bookkeeping borrow is released, so both may use the heap again.

use crate::collector::{Collector, CollectorError, Notification, RootRegion};
use crate::identity::ObjectId;
use crate::trace::{Trace, Tracer};
use core::cell::{Ref, RefCell, RefMut};
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::Deref;
use hashbrown::HashMap;
use slotmap::SlotMap;
use std::any::Any;
use std::rc::Rc;

slotmap::new_key_type! {
    /// Handle of a registered finalization notification.
    pub struct NotifierId;
    /// Key of a pinned root region.
    pub struct PinId;
}

/// Collector tuning. Defaults: collect only when asked, unlimited
/// notifier registrations.
#[derive(Clone, Debug, Default)]
pub struct HeapConfig {
    collect_every: Option<usize>,
    max_notifiers: Option<usize>,
}

impl HeapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a collection before an allocation once this many objects have
    /// been allocated since the previous collection.
    ///
    /// Allocation is then a collection safepoint: anything unrooted and
    /// unpinned may be reclaimed by any `alloc` call.
    pub fn collect_every(mut self, allocations: Option<usize>) -> Self {
        self.collect_every = allocations;
        self
    }

    /// Cap the number of live notifier registrations. Registrations past
    /// the cap fail with `CollectorError::NotifierLimit`.
    pub fn max_notifiers(mut self, limit: Option<usize>) -> Self {
        self.max_notifiers = limit;
        self
    }
}

/// Summary of one collection.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Collection {
    pub marked: usize,
    pub reclaimed: usize,
    pub notified: usize,
    /// A traced object could not report its edges (see
    /// `Tracer::defer_collection`); nothing was reclaimed.
    pub deferred: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub objects: usize,
    pub notifiers: usize,
    pub pinned_regions: usize,
    pub collections: u64,
}

struct HeapObject {
    value: Rc<dyn Any>,
    edges: Rc<dyn Trace>,
    roots: usize,
    marked: bool,
}

struct Registration {
    object: ObjectId,
    callback: Notification<ObjectId>,
}

struct HeapState {
    objects: SlotMap<ObjectId, HeapObject>,
    notifiers: SlotMap<NotifierId, Registration>,
    // Registrations per object, so a sweep only visits what it reclaims.
    by_object: HashMap<ObjectId, Vec<NotifierId>>,
    regions: SlotMap<PinId, Rc<dyn RootRegion<ObjectId>>>,
    allocated_since_collect: usize,
    collections: u64,
}

struct HeapInner {
    state: RefCell<HeapState>,
    config: HeapConfig,
}

/// Handle to a garbage-collected heap. Clones share the same heap.
#[derive(Clone)]
pub struct Heap {
    inner: Rc<HeapInner>,
}

/// Proof of a pinned region; hand it back to `unpin_region`.
#[derive(Debug)]
pub struct PinToken(PinId);

impl Heap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            inner: Rc::new(HeapInner {
                state: RefCell::new(HeapState {
                    objects: SlotMap::with_key(),
                    notifiers: SlotMap::with_key(),
                    by_object: HashMap::new(),
                    regions: SlotMap::with_key(),
                    allocated_since_collect: 0,
                    collections: 0,
                }),
                config,
            }),
        }
    }

    fn state(&self) -> Ref<'_, HeapState> {
        self.inner.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, HeapState> {
        self.inner.state.borrow_mut()
    }

    fn at_safepoint(&self) -> bool {
        match self.inner.config.collect_every {
            Some(every) => self.state().allocated_since_collect >= every,
            None => false,
        }
    }

    /// Allocate a managed object and return the first root to it.
    pub fn alloc<T: Trace + 'static>(&self, value: T) -> Root<T> {
        if self.at_safepoint() {
            self.collect();
        }
        let value = Rc::new(value);
        let as_any: Rc<dyn Any> = value.clone();
        let edges: Rc<dyn Trace> = value.clone();
        let id = {
            let mut st = self.state_mut();
            st.allocated_since_collect += 1;
            st.objects.insert(HeapObject {
                value: as_any,
                edges,
                roots: 1,
                marked: false,
            })
        };
        Root {
            heap: self.clone(),
            id,
            value,
        }
    }

    /// Root the object behind `gc`, if it is still live.
    pub fn root<T: 'static>(&self, gc: Gc<T>) -> Option<Root<T>> {
        self.root_id(gc.id)
    }

    fn root_id<T: 'static>(&self, id: ObjectId) -> Option<Root<T>> {
        let value = {
            let mut st = self.state_mut();
            let obj = st.objects.get_mut(id)?;
            let value = obj.value.clone().downcast::<T>().ok()?;
            obj.roots += 1;
            value
        };
        Some(Root {
            heap: self.clone(),
            id,
            value,
        })
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.state().objects.contains_key(id)
    }

    pub fn stats(&self) -> HeapStats {
        let st = self.state();
        HeapStats {
            objects: st.objects.len(),
            notifiers: st.notifiers.len(),
            pinned_regions: st.regions.len(),
            collections: st.collections,
        }
    }

    /// Run a full collection.
    pub fn collect(&self) -> Collection {
        let (dead, fired, summary) = {
            let mut guard = self.state_mut();
            let st = &mut *guard;

            // Cleared up front: a trace that panicked during an earlier
            // collection may have left marks behind.
            for obj in st.objects.values_mut() {
                obj.marked = false;
            }

            let mut worklist: Vec<ObjectId> = st
                .objects
                .iter()
                .filter(|(_, o)| o.roots > 0)
                .map(|(id, _)| id)
                .collect();
            for region in st.regions.values() {
                region.trace_roots(&mut |id| worklist.push(id));
            }

            let mut marked = 0;
            while let Some(id) = worklist.pop() {
                let Some(obj) = st.objects.get_mut(id) else {
                    continue;
                };
                if obj.marked {
                    continue;
                }
                obj.marked = true;
                marked += 1;
                let edges = obj.edges.clone();
                let mut tracer = Tracer::new(&mut worklist);
                edges.trace(&mut tracer);
                if tracer.is_deferred() {
                    log::debug!("collection deferred: {id:?} has unreadable edges");
                    return Collection {
                        marked,
                        deferred: true,
                        ..Collection::default()
                    };
                }
            }

            let unmarked: Vec<ObjectId> = st
                .objects
                .iter()
                .filter(|(_, o)| !o.marked)
                .map(|(id, _)| id)
                .collect();
            let mut dead = Vec::with_capacity(unmarked.len());
            let mut fired = Vec::new();
            for id in unmarked {
                if let Some(obj) = st.objects.remove(id) {
                    dead.push(obj);
                }
                for n in st.by_object.remove(&id).unwrap_or_default() {
                    if let Some(reg) = st.notifiers.remove(n) {
                        fired.push((reg.object, reg.callback));
                    }
                }
            }
            st.allocated_since_collect = 0;
            st.collections += 1;

            let summary = Collection {
                marked,
                reclaimed: dead.len(),
                notified: fired.len(),
                deferred: false,
            };
            log::debug!(
                "collection #{}: {} marked, {} reclaimed, {} notifications",
                st.collections,
                summary.marked,
                summary.reclaimed,
                summary.notified
            );
            (dead, fired, summary)
        };

        drop(dead);
        for (id, callback) in fired {
            log::trace!("notifying reclamation of {id:?}");
            callback(id);
        }
        summary
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("stats", &self.stats())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Collector for Heap {
    type Id = ObjectId;
    type Object<T: 'static> = Root<T>;
    type Notifier = NotifierId;
    type PinToken = PinToken;

    fn identity<T: 'static>(&self, obj: &Root<T>) -> ObjectId {
        obj.id
    }

    fn upgrade<T: 'static>(&self, id: ObjectId) -> Option<Root<T>> {
        self.root_id(id)
    }

    fn register_notifier(
        &self,
        id: ObjectId,
        callback: Notification<ObjectId>,
    ) -> Result<NotifierId, CollectorError> {
        let mut st = self.state_mut();
        if let Some(limit) = self.inner.config.max_notifiers {
            if st.notifiers.len() >= limit {
                return Err(CollectorError::NotifierLimit { limit });
            }
        }
        if !st.objects.contains_key(id) {
            return Err(CollectorError::DeadObject);
        }
        let n = st.notifiers.insert(Registration {
            object: id,
            callback,
        });
        st.by_object.entry(id).or_default().push(n);
        Ok(n)
    }

    fn deregister_notifier(&self, notifier: NotifierId) {
        let removed = {
            let mut st = self.state_mut();
            let reg = st.notifiers.remove(notifier);
            if let Some(reg) = &reg {
                if let Some(list) = st.by_object.get_mut(&reg.object) {
                    list.retain(|&n| n != notifier);
                    if list.is_empty() {
                        st.by_object.remove(&reg.object);
                    }
                }
            }
            reg
        };
        // The callback may own roots; drop it outside the borrow.
        drop(removed);
    }

    fn pin_region(&self, region: Rc<dyn RootRegion<ObjectId>>) -> PinToken {
        PinToken(self.state_mut().regions.insert(region))
    }

    fn unpin_region(&self, token: PinToken) {
        let region = self.state_mut().regions.remove(token.0);
        drop(region);
    }
}

/// Rooted strong reference. The object stays live while any `Root` to it
/// exists.
pub struct Root<T: 'static> {
    heap: Heap,
    id: ObjectId,
    value: Rc<T>,
}

impl<T: 'static> Root<T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Unrooted reference for storing inside other managed objects.
    pub fn downgrade(&self) -> Gc<T> {
        Gc::from_id(self.id)
    }
}

impl<T: 'static> Deref for Root<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: 'static> Clone for Root<T> {
    fn clone(&self) -> Self {
        self.heap
            .state_mut()
            .objects
            .get_mut(self.id)
            .expect("rooted object must be live")
            .roots += 1;
        Self {
            heap: self.heap.clone(),
            id: self.id,
            value: self.value.clone(),
        }
    }
}

impl<T: 'static> Drop for Root<T> {
    fn drop(&mut self) {
        if let Some(obj) = self.heap.state_mut().objects.get_mut(self.id) {
            debug_assert!(obj.roots > 0);
            obj.roots -= 1;
        }
    }
}

impl<T: 'static> PartialEq for Root<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: 'static> Eq for Root<T> {}

impl<T: 'static> Hash for Root<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Root<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.id)
            .field("value", &*self.value)
            .finish()
    }
}

/// Unrooted reference to a managed object, traced as a strong edge when
/// stored inside another managed object.
pub struct Gc<T: ?Sized> {
    id: ObjectId,
    _marker: PhantomData<*const T>,
}

impl<T: ?Sized> Gc<T> {
    pub(crate) fn from_id(id: ObjectId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl<T: ?Sized> Copy for Gc<T> {}
impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for Gc<T> {}

impl<T: ?Sized> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gc").field(&self.id).finish()
    }
}

impl<T: ?Sized> Trace for Gc<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.mark(*self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Node {
        label: u32,
        next: Cell<Option<Gc<Node>>>,
    }

    impl Trace for Node {
        fn trace(&self, tracer: &mut Tracer<'_>) {
            self.next.trace(tracer);
        }
    }

    fn node(heap: &Heap, label: u32) -> Root<Node> {
        heap.alloc(Node {
            label,
            next: Cell::new(None),
        })
    }

    fn recorder() -> (Rc<RefCell<Vec<ObjectId>>>, impl Fn() -> Notification<ObjectId>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let make = move || -> Notification<ObjectId> {
            let sink = sink.clone();
            Box::new(move |id| sink.borrow_mut().push(id))
        };
        (log, make)
    }

    #[test]
    fn rooted_objects_survive_and_unrooted_are_reclaimed() {
        let heap = Heap::new();
        let kept = heap.alloc(String::from("kept"));
        let dropped = heap.alloc(String::from("dropped"));
        let dropped_id = dropped.id();
        drop(dropped);

        let c = heap.collect();
        assert_eq!(c.reclaimed, 1);
        assert_eq!(c.marked, 1);
        assert!(heap.is_live(kept.id()));
        assert!(!heap.is_live(dropped_id));
        assert_eq!(*kept, "kept");
        assert_eq!(heap.stats().collections, 1);
    }

    #[test]
    fn cloned_roots_keep_object_alive_until_last_drop() {
        let heap = Heap::new();
        let a = heap.alloc(1u32);
        let b = a.clone();
        assert_eq!(a, b);
        let id = a.id();
        drop(a);
        heap.collect();
        assert!(heap.is_live(id));
        drop(b);
        heap.collect();
        assert!(!heap.is_live(id));
    }

    #[test]
    fn gc_edges_keep_targets_alive() {
        let heap = Heap::new();
        let head = node(&heap, 1);
        let tail = node(&heap, 2);
        head.next.set(Some(tail.downgrade()));
        let tail_gc = tail.downgrade();
        drop(tail);

        heap.collect();
        let tail = heap.root(tail_gc).expect("reachable through head");
        assert_eq!(tail.label, 2);
        drop(tail);

        head.next.set(None);
        heap.collect();
        assert!(heap.root(tail_gc).is_none());
    }

    #[test]
    fn unrooted_cycles_are_reclaimed() {
        let heap = Heap::new();
        let a = node(&heap, 1);
        let b = node(&heap, 2);
        a.next.set(Some(b.downgrade()));
        b.next.set(Some(a.downgrade()));
        drop((a, b));
        assert_eq!(heap.collect().reclaimed, 2);
        assert_eq!(heap.stats().objects, 0);
    }

    #[test]
    fn root_rejects_wrong_type() {
        let heap = Heap::new();
        let s = heap.alloc(String::from("s"));
        let as_u32 = heap.upgrade::<u32>(s.id());
        assert!(as_u32.is_none());
        let as_string = heap.upgrade::<String>(s.id());
        assert_eq!(as_string.as_deref().map(String::as_str), Some("s"));
    }

    #[test]
    fn notification_fires_once_after_reclamation() {
        let heap = Heap::new();
        let (fired, make) = recorder();
        let obj = heap.alloc(7u64);
        let id = obj.id();
        heap.register_notifier(id, make()).unwrap();

        heap.collect();
        assert!(fired.borrow().is_empty(), "still rooted");

        drop(obj);
        let c = heap.collect();
        assert_eq!(c.notified, 1);
        assert_eq!(*fired.borrow(), vec![id]);

        heap.collect();
        assert_eq!(fired.borrow().len(), 1, "at most once");
        assert_eq!(heap.stats().notifiers, 0);
    }

    #[test]
    fn deregistered_notification_never_fires() {
        let heap = Heap::new();
        let (fired, make) = recorder();
        let obj = heap.alloc(());
        let keep = heap.register_notifier(obj.id(), make()).unwrap();
        let cancel = heap.register_notifier(obj.id(), make()).unwrap();
        heap.deregister_notifier(cancel);
        heap.deregister_notifier(cancel);

        drop(obj);
        assert_eq!(heap.collect().notified, 1);
        assert_eq!(fired.borrow().len(), 1);
        // Already fired: deregistering now is a no-op.
        heap.deregister_notifier(keep);
        assert_eq!(heap.stats().notifiers, 0);
    }

    #[test]
    fn register_for_dead_object_fails() {
        let heap = Heap::new();
        let (_fired, make) = recorder();
        let obj = heap.alloc(());
        let id = obj.id();
        drop(obj);
        heap.collect();
        assert_eq!(
            heap.register_notifier(id, make()),
            Err(CollectorError::DeadObject)
        );
    }

    #[test]
    fn notifier_limit_is_enforced() {
        let heap = Heap::with_config(HeapConfig::new().max_notifiers(Some(1)));
        let (_fired, make) = recorder();
        let a = heap.alloc(1u8);
        let b = heap.alloc(2u8);
        let n = heap.register_notifier(a.id(), make()).unwrap();
        assert_eq!(
            heap.register_notifier(b.id(), make()),
            Err(CollectorError::NotifierLimit { limit: 1 })
        );
        heap.deregister_notifier(n);
        assert!(heap.register_notifier(b.id(), make()).is_ok());
    }

    struct FixedRegion(Vec<ObjectId>);

    impl RootRegion<ObjectId> for FixedRegion {
        fn trace_roots(&self, visit: &mut dyn FnMut(ObjectId)) {
            self.0.iter().copied().for_each(visit);
        }
    }

    #[test]
    fn pinned_region_keeps_objects_and_their_edges_alive() {
        let heap = Heap::new();
        let head = node(&heap, 1);
        let tail = node(&heap, 2);
        head.next.set(Some(tail.downgrade()));
        let (head_id, tail_id) = (head.id(), tail.id());
        drop((head, tail));

        let token = heap.pin_region(Rc::new(FixedRegion(vec![head_id])));
        assert_eq!(heap.stats().pinned_regions, 1);
        heap.collect();
        assert!(heap.is_live(head_id) && heap.is_live(tail_id));

        heap.unpin_region(token);
        heap.collect();
        assert!(!heap.is_live(head_id) && !heap.is_live(tail_id));
    }

    #[test]
    fn allocation_safepoint_collects() {
        let heap = Heap::with_config(HeapConfig::new().collect_every(Some(3)));
        let first = heap.alloc(0u32).id();
        let _second = heap.alloc(1u32);
        let _third = heap.alloc(2u32);
        assert_eq!(heap.stats().collections, 0);
        let _fourth = heap.alloc(3u32);
        assert_eq!(heap.stats().collections, 1);
        assert!(!heap.is_live(first), "unrooted at the safepoint");
    }

    #[test]
    fn callbacks_may_use_the_heap() {
        let heap = Heap::new();
        let survivors = Rc::new(RefCell::new(Vec::new()));
        let obj = heap.alloc(());
        let (h, sink) = (heap.clone(), survivors.clone());
        heap.register_notifier(
            obj.id(),
            Box::new(move |_| sink.borrow_mut().push(h.alloc(42u32))),
        )
        .unwrap();
        drop(obj);
        heap.collect();
        assert_eq!(survivors.borrow().len(), 1);
        assert_eq!(*survivors.borrow()[0], 42);
    }

    struct Parent {
        kids: RefCell<Vec<Gc<u32>>>,
    }

    impl Trace for Parent {
        fn trace(&self, tracer: &mut Tracer<'_>) {
            self.kids.trace(tracer);
        }
    }

    #[test]
    fn allocating_while_a_traced_cell_is_borrowed_defers_collection() {
        let heap = Heap::with_config(HeapConfig::new().collect_every(Some(1)));
        let parent = heap.alloc(Parent {
            kids: RefCell::new(Vec::new()),
        });
        let garbage = heap.alloc(0u32).id();
        for n in 1..=4u32 {
            // The receiver is borrowed before the safepoint inside alloc runs.
            parent.kids.borrow_mut().push(heap.alloc(n).downgrade());
        }
        assert!(heap.is_live(garbage), "deferred collections reclaim nothing");

        let held = parent.kids.borrow_mut();
        let c = heap.collect();
        assert!(c.deferred);
        assert_eq!((c.reclaimed, c.notified), (0, 0));
        drop(held);

        let c = heap.collect();
        assert!(!c.deferred);
        assert!(!heap.is_live(garbage));
        for kid in parent.kids.borrow().iter() {
            assert!(heap.is_live(kid.id()), "kid reachable through parent");
        }
        assert_eq!(parent.kids.borrow().len(), 4);
    }

    struct Tripwire {
        armed: Cell<bool>,
        next: Cell<Option<Gc<Tripwire>>>,
    }

    impl Trace for Tripwire {
        fn trace(&self, tracer: &mut Tracer<'_>) {
            self.next.trace(tracer);
            if self.armed.get() {
                panic!("trace tripped");
            }
        }
    }

    #[test]
    fn marks_left_by_a_panicking_trace_do_not_leak_into_the_next_collection() {
        let heap = Heap::new();
        let parent = heap.alloc(Tripwire {
            armed: Cell::new(true),
            next: Cell::new(None),
        });
        let child = heap.alloc(Tripwire {
            armed: Cell::new(false),
            next: Cell::new(None),
        });
        parent.next.set(Some(child.downgrade()));
        let child_id = child.id();
        drop(child);

        // Parent is marked, then panics before its child is popped.
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.collect()));
        assert!(res.is_err());

        parent.armed.set(false);
        let c = heap.collect();
        assert!(heap.is_live(child_id), "child reachable through parent");
        assert_eq!((c.marked, c.reclaimed), (2, 0));
    }

    #[test]
    fn payload_drop_may_use_the_heap() {
        struct Holder(#[allow(dead_code)] Root<u32>);
        impl Trace for Holder {
            fn trace(&self, _tracer: &mut Tracer<'_>) {}
        }
        let heap = Heap::new();
        let inner = heap.alloc(5u32);
        let inner_id = inner.id();
        drop(heap.alloc(Holder(inner)));

        heap.collect();
        // Holder's payload dropped its Root after the sweep released the heap.
        heap.collect();
        assert!(!heap.is_live(inner_id));
    }
}

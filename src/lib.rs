//! gc-weak-set: a single-threaded set of weakly held, garbage-collected
//! objects whose entries disappear when the collector reclaims them.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: a hash set that references managed objects without extending
//!   their lifetime, while keeping `len`, membership and iteration
//!   consistent with what is still alive.
//! - Layers:
//!   - `identity`: `ObjectId` and the identity hash the table probes with.
//!   - `collector`: the `Collector` trait, i.e. the two interfaces a weak
//!     container needs from a GC: finalization notification and root
//!     region pinning.
//!   - `table::WeakSlotTable`: open-addressing table of
//!     `Empty | Occupied(id, notifier) | Tombstone` slots. Knows nothing
//!     about liveness.
//!   - `pin::PinCount`: reentrant pin depth.
//!   - `weak_set::WeakSet`: public API. Brackets every operation in a pin,
//!     registers one notification per entry, and lets the collector
//!     tombstone entries whose referent died.
//!   - `heap::Heap`: a mark-and-sweep collector implementing `Collector`.
//!
//! Constraints
//! - Single-threaded: `!Send`/`!Sync`, no atomics. Sharing one
//!   set between threads has to be layered on top.
//! - The table never resolves an id; only the set does, through the
//!   collector, and only while pinned.
//! - Capacity is 0 or a power of two, grows on insertion pressure (load
//!   factor 3/4), never shrinks.
//!
//! Pinning
//! - The first `lock` registers the whole slot table as a root region; the
//!   last `unlock` releases it. While pinned, every object in the table is
//!   strongly reachable, so no notification for it can run and the
//!   contents only change through the caller's own `add`/`remove`.
//! - Every public operation pins, reads included. Iterators hold their pin
//!   until dropped, including on early exit.
//! - `unlock` without a matching `lock` panics.
//!
//! Notifications
//! - Each entry owns one registration. The callback holds only a weak
//!   reference to the table and finds its slot by id, so resizes move
//!   entries without re-registering.
//! - `remove`, `clear` and dropping the set deregister; a registration
//!   that already fired makes deregistration a no-op.
//!
//! Errors
//! - `add` propagates `CollectorError` from registration unchanged and
//!   leaves the set untouched. Lookups have no failure modes.
//! - Null references are unrepresentable: every operation takes
//!   `&Object<T>`.
//!
//! Notes and non-goals
//! - No ordering guarantees; iteration follows table order.
//! - No strong-reference mode, no persistence.

pub mod collector;
pub mod heap;
pub mod identity;
pub mod pin;
pub mod table;
#[cfg(test)]
mod table_proptest;
pub mod trace;
pub mod weak_set;

// Public surface
pub use collector::{Collector, CollectorError, Notification, RootRegion};
pub use heap::{Collection, Gc, Heap, HeapConfig, HeapStats, NotifierId, PinToken, Root};
pub use identity::{IdentityHash, ObjectId};
pub use pin::PinCount;
pub use trace::{Trace, Tracer};
pub use weak_set::{Iter, PinGuard, WeakSet};

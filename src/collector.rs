//! The two narrow interfaces a weak set consumes from a garbage collector:
//! finalization notification and region pinning.

use crate::identity::IdentityHash;
use core::fmt;
use std::rc::Rc;

/// Callback run by the collector once the object it was registered for has
/// been reclaimed. Receives the id it was registered with.
pub type Notification<Id> = Box<dyn FnOnce(Id)>;

/// A region of memory the collector must scan as strong roots while it is
/// pinned.
///
/// Rust cannot hand a collector a raw address range to scan, so a region
/// instead enumerates the ids it holds on demand. `trace_roots` is called
/// only from within a collection and must not call back into the collector.
pub trait RootRegion<Id> {
    fn trace_roots(&self, visit: &mut dyn FnMut(Id));
}

/// Failures reported by the collector while registering a notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CollectorError {
    /// The collector refuses further notification registrations.
    NotifierLimit { limit: usize },
    /// The id does not name a live object.
    DeadObject,
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::NotifierLimit { limit } => {
                write!(f, "notifier limit of {limit} registrations reached")
            }
            CollectorError::DeadObject => f.write_str("object has already been reclaimed"),
        }
    }
}

impl std::error::Error for CollectorError {}

/// A garbage collector as seen from a weak container.
///
/// Contract:
/// - a notification registered for `id` runs at most once, and only after
///   the object is unreachable from roots and from every pinned region;
/// - `deregister_notifier` cancels a pending notification and is a no-op
///   if it already ran;
/// - while a region is pinned, every id it reports is kept alive, and so
///   no notification registered for such an id can run.
pub trait Collector {
    /// Weak handle and identity of a managed object.
    type Id: IdentityHash + 'static;
    /// Strong reference to a managed object of type `T`.
    type Object<T: 'static>;
    /// Registration handle returned by `register_notifier`.
    type Notifier: Copy + Eq + fmt::Debug + 'static;
    /// Proof of an active region pin, consumed by `unpin_region`.
    type PinToken;

    fn identity<T: 'static>(&self, obj: &Self::Object<T>) -> Self::Id;

    /// Resolve a weak handle. `None` once the object has been reclaimed or
    /// if it is not a `T`.
    fn upgrade<T: 'static>(&self, id: Self::Id) -> Option<Self::Object<T>>;

    fn register_notifier(
        &self,
        id: Self::Id,
        callback: Notification<Self::Id>,
    ) -> Result<Self::Notifier, CollectorError>;

    fn deregister_notifier(&self, notifier: Self::Notifier);

    fn pin_region(&self, region: Rc<dyn RootRegion<Self::Id>>) -> Self::PinToken;

    fn unpin_region(&self, token: Self::PinToken);
}

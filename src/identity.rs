//! Object identity: the key a managed object is known by, and the hash the
//! slot table probes with.

use core::fmt::Debug;
use slotmap::Key;

slotmap::new_key_type! {
    /// Generational identity of a managed object.
    ///
    /// Two ids compare equal iff they name the same allocation; a slot
    /// freed by the collector and reused later gets a new generation, so a
    /// stale id never aliases a newer object.
    pub struct ObjectId;
}

/// Identity hashing for weak handles.
///
/// The slot table never looks at an object's contents; it only needs a
/// stable hash of the handle itself, which must stay valid after the
/// referent has been reclaimed.
pub trait IdentityHash: Copy + Eq + Debug {
    fn identity_hash(&self) -> u64;
}

impl IdentityHash for ObjectId {
    #[inline]
    fn identity_hash(&self) -> u64 {
        mix64(self.data().as_ffi())
    }
}

/// splitmix64 finalizer. Slotmap keys are dense small integers in the low
/// bits, so they have to be spread before masking by capacity.
#[inline]
pub(crate) const fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

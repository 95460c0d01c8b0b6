//! Tagged Resource Handles
//!
//! Every GPU resource in the runtime is referred to by a [`ResourceHandle`]:
//! a 64-bit tagged identifier encoding the resource kind, the owning registry
//! (persistent, or transient with a frame slot), a generation counter, and a
//! slot index. Handles are `Copy` and cheap to pass around; entities never
//! hold pointers to each other, which keeps the ownership graph acyclic and
//! makes stale-handle detection a single integer compare.
//!
//! # Bit layout
//!
//! ```text
//! 63      59    56 55 54    52 51           32 31            0
//! ┌────────┬──────┬──┬────────┬───────────────┬───────────────┐
//! │ unused │ kind │ T│  slot  │  generation   │     index     │
//! │        │ (3b) │  │  (3b)  │    (20b)      │    (32b)      │
//! └────────┴──────┴──┴────────┴───────────────┴───────────────┘
//! ```
//!
//! `T` is the registry tag: 0 = persistent, 1 = transient. `slot` is the
//! in-flight frame slot for transient handles and zero otherwise.

const INDEX_BITS: u64 = 32;
const GENERATION_BITS: u64 = 20;
const SLOT_BITS: u64 = 3;

const GENERATION_SHIFT: u64 = INDEX_BITS;
const SLOT_SHIFT: u64 = GENERATION_SHIFT + GENERATION_BITS;
const REGISTRY_SHIFT: u64 = SLOT_SHIFT + SLOT_BITS;
const KIND_SHIFT: u64 = REGISTRY_SHIFT + 1;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const KIND_MASK: u64 = 0b111;

/// Maximum generation value a slot can reach before wrapping.
pub const MAX_GENERATION: u32 = GENERATION_MASK as u32;

/// The kind of GPU object a handle refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    Buffer = 0,
    Texture = 1,
    ArgumentBuffer = 2,
    Heap = 3,
    Sampler = 4,
    AccelerationStructure = 5,
}

impl ResourceKind {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Buffer,
            1 => Self::Texture,
            2 => Self::ArgumentBuffer,
            3 => Self::Heap,
            4 => Self::Sampler,
            _ => Self::AccelerationStructure,
        }
    }
}

/// Which registry owns a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    /// Lifetime bounded by explicit dispose.
    Persistent,
    /// Lifetime bounded by one frame; the payload is the in-flight frame slot.
    Transient(u8),
}

/// A 64-bit tagged identifier for a GPU resource.
///
/// Identity is `(registry, index, generation)`; two handles to the same slot
/// with different generations are different resources, and using the older
/// one is a hard error ([`WeftError::InvalidHandle`](crate::WeftError)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    /// The never-valid handle pattern.
    #[must_use]
    pub const fn null() -> Self {
        Self(u64::MAX)
    }

    pub(crate) fn new_persistent(kind: ResourceKind, index: u32, generation: u32) -> Self {
        debug_assert!(u64::from(generation) <= GENERATION_MASK);
        Self(
            (kind as u64) << KIND_SHIFT
                | (u64::from(generation) & GENERATION_MASK) << GENERATION_SHIFT
                | u64::from(index),
        )
    }

    pub(crate) fn new_transient(
        kind: ResourceKind,
        frame_slot: u8,
        index: u32,
        generation: u32,
    ) -> Self {
        debug_assert!(u64::from(frame_slot) <= SLOT_MASK);
        debug_assert!(u64::from(generation) <= GENERATION_MASK);
        Self(
            (kind as u64) << KIND_SHIFT
                | 1 << REGISTRY_SHIFT
                | (u64::from(frame_slot) & SLOT_MASK) << SLOT_SHIFT
                | (u64::from(generation) & GENERATION_MASK) << GENERATION_SHIFT
                | u64::from(index),
        )
    }

    /// Returns `true` for the null pattern.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// The kind of resource this handle refers to.
    #[inline]
    #[must_use]
    pub fn kind(self) -> ResourceKind {
        ResourceKind::from_bits((self.0 >> KIND_SHIFT) & KIND_MASK)
    }

    /// The registry that owns this handle.
    #[inline]
    #[must_use]
    pub fn registry(self) -> RegistryKind {
        if (self.0 >> REGISTRY_SHIFT) & 1 == 1 {
            RegistryKind::Transient(((self.0 >> SLOT_SHIFT) & SLOT_MASK) as u8)
        } else {
            RegistryKind::Persistent
        }
    }

    /// `true` for transient-registry handles.
    #[inline]
    #[must_use]
    pub fn is_transient(self) -> bool {
        (self.0 >> REGISTRY_SHIFT) & 1 == 1
    }

    /// Slot index into the owning registry's table.
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    /// Generation recorded when the handle was issued.
    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u32
    }

    /// The raw 64-bit pattern (stable across the process lifetime).
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "ResourceHandle(null)");
        }
        write!(
            f,
            "ResourceHandle({:?}/{:?} #{} g{})",
            self.kind(),
            self.registry(),
            self.index(),
            self.generation()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_handle_round_trips_fields() {
        let h = ResourceHandle::new_persistent(ResourceKind::Texture, 1234, 7);
        assert_eq!(h.kind(), ResourceKind::Texture);
        assert_eq!(h.registry(), RegistryKind::Persistent);
        assert_eq!(h.index(), 1234);
        assert_eq!(h.generation(), 7);
        assert!(!h.is_transient());
    }

    #[test]
    fn transient_handle_round_trips_fields() {
        let h = ResourceHandle::new_transient(ResourceKind::Buffer, 2, u32::MAX, MAX_GENERATION);
        assert_eq!(h.kind(), ResourceKind::Buffer);
        assert_eq!(h.registry(), RegistryKind::Transient(2));
        assert_eq!(h.index(), u32::MAX);
        assert_eq!(h.generation(), MAX_GENERATION);
    }

    #[test]
    fn null_handle_is_never_a_valid_encoding() {
        let h = ResourceHandle::null();
        assert!(h.is_null());
        let real = ResourceHandle::new_persistent(ResourceKind::Heap, 0, 0);
        assert!(!real.is_null());
        assert_ne!(h, real);
    }

    #[test]
    fn generation_distinguishes_reused_slots() {
        let a = ResourceHandle::new_persistent(ResourceKind::Buffer, 5, 1);
        let b = ResourceHandle::new_persistent(ResourceKind::Buffer, 5, 2);
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
    }
}

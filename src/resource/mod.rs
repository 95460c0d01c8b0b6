//! Resource Model
//!
//! Two registries share one handle format: the persistent registry (explicit
//! dispose, reader-writer-locked table) and the transient registry (per-frame
//! arenas with aliasing). Heaps sub-allocate placed resources inside either.

pub mod descriptor;
pub mod heap;
pub mod registry;
pub mod transient;

pub use descriptor::{
    BufferDescriptor, CpuCacheMode, HeapDescriptor, PixelFormat, PurgeableState,
    ResourceDescriptor, StorageMode, TextureDescriptor, TextureType, UsageHint,
};
pub use heap::HeapSuballocator;
pub use registry::{PersistentRegistry, PurgeFlush};
pub use transient::{EncoderInterval, TransientRegistry};

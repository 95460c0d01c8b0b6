//! Resource Descriptors
//!
//! Immutable creation-time descriptions of buffers, textures, and heaps.
//! A descriptor is fixed once the resource is materialized; `replace_backing`
//! verifies the replacement against the original descriptor.

use bitflags::bitflags;

bitflags! {
    /// Creation-time usage hints.
    ///
    /// The backend uses these to pick tiling and residency strategies; the
    /// compactor uses them to derive barrier scopes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UsageHint: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const BLIT_SOURCE = 1 << 3;
        const BLIT_DESTINATION = 1 << 4;
        const INPUT_ATTACHMENT = 1 << 5;
        const PIXEL_FORMAT_VIEW = 1 << 6;
    }
}

/// Where a resource's backing memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StorageMode {
    /// Device-local, not host-visible.
    #[default]
    Private,
    /// Host-visible with explicit synchronization of CPU/GPU copies.
    Managed,
    /// Host-visible, coherent.
    Shared,
    /// No backing memory; tile-local only. Legal only for textures whose
    /// every usage stays within a single render pass on tile-based GPUs.
    Memoryless,
}

/// CPU cache behavior for host-visible storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CpuCacheMode {
    #[default]
    Default,
    WriteCombined,
}

/// Purgeable state of a backing allocation.
///
/// Only the `Empty → NonVolatile` transition can fail (the contents were
/// already discarded); every other transition is unconditional. Transitions
/// are batched and flushed on frame retire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PurgeableState {
    /// Query-only: leaves the state unchanged.
    KeepCurrent,
    /// Contents must be preserved.
    NonVolatile,
    /// The OS may discard the contents under pressure.
    Volatile,
    /// Contents discarded.
    Empty,
}

/// Dimensionality of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    D1,
    #[default]
    D2,
    D2Array,
    D3,
    Cube,
}

/// The subset of pixel formats the runtime sizes and validates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8Unorm,
    Bgra8Unorm,
    Rg16Float,
    Rgba16Float,
    Rgba32Float,
    R32Uint,
    Depth32Float,
    Depth24PlusStencil8,
}

impl PixelFormat {
    /// Bytes per pixel for linear-tiled sizing.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u64 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::Rg16Float | Self::R32Uint => 4,
            Self::Rgba16Float | Self::Depth24PlusStencil8 => 8,
            Self::Rgba32Float => 16,
            Self::Depth32Float => 4,
        }
    }

    /// `true` for depth and depth-stencil formats.
    #[must_use]
    pub const fn is_depth_stencil(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24PlusStencil8)
    }
}

/// Immutable description of a buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    pub length: u64,
    pub storage_mode: StorageMode,
    pub cache_mode: CpuCacheMode,
    pub usage: UsageHint,
}

/// Immutable description of a texture.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub texture_type: TextureType,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_length: u32,
    pub sample_count: u32,
    pub usage: UsageHint,
    pub storage_mode: StorageMode,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            texture_type: TextureType::D2,
            pixel_format: PixelFormat::Rgba8Unorm,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_length: 1,
            sample_count: 1,
            usage: UsageHint::SHADER_READ,
            storage_mode: StorageMode::Private,
        }
    }
}

impl TextureDescriptor {
    /// Conservative linear-layout size estimate, including the full mip chain.
    ///
    /// The backend's `size_and_alignment_for_texture` is authoritative; this
    /// is the fallback used by the headless backend and by validation.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let bpp = self.pixel_format.bytes_per_pixel();
        let mut total = 0u64;
        let mut w = u64::from(self.width.max(1));
        let mut h = u64::from(self.height.max(1));
        let d = u64::from(self.depth.max(1));
        let layers = u64::from(self.array_length.max(1));
        for _ in 0..self.mip_levels.max(1) {
            total += w * h * d * bpp;
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        total * layers * u64::from(self.sample_count.max(1))
    }
}

/// Immutable description of a heap.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct HeapDescriptor {
    pub size: u64,
    pub storage_mode: StorageMode,
    pub cache_mode: CpuCacheMode,
}

/// Descriptor of whichever kind a registry slot holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceDescriptor {
    Buffer(BufferDescriptor),
    Texture(TextureDescriptor),
    Heap(HeapDescriptor),
}

impl ResourceDescriptor {
    /// Storage mode of the underlying descriptor.
    #[must_use]
    pub fn storage_mode(&self) -> StorageMode {
        match self {
            Self::Buffer(d) => d.storage_mode,
            Self::Texture(d) => d.storage_mode,
            Self::Heap(d) => d.storage_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_size_includes_mip_chain() {
        let desc = TextureDescriptor {
            width: 4,
            height: 4,
            mip_levels: 3,
            ..Default::default()
        };
        // 4x4 + 2x2 + 1x1 at 4 bytes per pixel
        assert_eq!(desc.estimated_size(), (16 + 4 + 1) * 4);
    }

    #[test]
    fn depth_formats_are_flagged() {
        assert!(PixelFormat::Depth32Float.is_depth_stencil());
        assert!(PixelFormat::Depth24PlusStencil8.is_depth_stencil());
        assert!(!PixelFormat::Rgba8Unorm.is_depth_stencil());
    }
}

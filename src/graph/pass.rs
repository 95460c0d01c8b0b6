//! Pass Records & Usage Model
//!
//! A *pass* is a user-declared unit of GPU work with fixed inputs and
//! outputs. While its executor runs, every binding and residency call is
//! folded into a per-resource [`Usage`] record; after the executor returns
//! the pass record is immutable and feeds scheduling and dependency analysis.
//!
//! Commands are indexed in a frame-global stream: pass N's commands occupy
//! `command_range` within the stream, so a `(encoder, command_index)` pair
//! totally orders all work in the frame.

use std::ops::Range;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::backend::QueueId;
use crate::handle::ResourceHandle;

bitflags! {
    /// How a pass accesses a resource.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const INPUT_ATTACHMENT = 1 << 3;
        const BLIT_SRC = 1 << 4;
        const BLIT_DST = 1 << 5;
    }
}

impl AccessFlags {
    /// `true` if the access can modify the resource.
    ///
    /// Render-target and blit-destination accesses count as writes for
    /// hazard tracking even when the attachment is load-only.
    #[inline]
    #[must_use]
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE | Self::RENDER_TARGET | Self::BLIT_DST)
    }
}

bitflags! {
    /// Pipeline stages participating in an access.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StageFlags: u8 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const BLIT = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
        const LATE_FRAGMENT_TESTS = 1 << 5;
    }
}

/// Tiling/compression state a texture must be in for a given usage.
///
/// Buffers have no layout; [`ImageLayout::Undefined`] doubles as "don't
/// care" for freshly materialized textures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    RenderTarget,
    DepthStencil,
    ShaderRead,
    ShaderWrite,
    BlitSrc,
    BlitDst,
    Present,
}

impl ImageLayout {
    /// The layout an access requires, given the texture aspect.
    ///
    /// Write-like accesses win over read-like ones when both are present
    /// (a read-write storage image sits in `ShaderWrite`).
    #[must_use]
    pub fn required_for(access: AccessFlags, depth_stencil: bool) -> Self {
        if access.contains(AccessFlags::RENDER_TARGET) {
            if depth_stencil {
                Self::DepthStencil
            } else {
                Self::RenderTarget
            }
        } else if access.contains(AccessFlags::BLIT_DST) {
            Self::BlitDst
        } else if access.contains(AccessFlags::WRITE) {
            Self::ShaderWrite
        } else if access.contains(AccessFlags::BLIT_SRC) {
            Self::BlitSrc
        } else if access.intersects(AccessFlags::READ | AccessFlags::INPUT_ATTACHMENT) {
            Self::ShaderRead
        } else {
            Self::General
        }
    }
}

/// The full-subresource mask (all mips, all layers).
pub const SUBRESOURCE_ALL: u64 = u64::MAX;

bitflags! {
    /// Which GPU caches a scoped barrier flushes and invalidates.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BarrierScope: u8 {
        const BUFFERS = 1 << 0;
        const TEXTURES = 1 << 1;
        const RENDER_TARGETS = 1 << 2;
    }
}

/// What kind of work a pass encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Draw,
    Compute,
    Blit,
    External,
    AccelerationStructure,
}

/// Identifies a pass within one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub u32);

/// A binding path: the stage set plus slot a `set_*` call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindPoint {
    pub stages: StageFlags,
    pub slot: u32,
}

impl BindPoint {
    #[must_use]
    pub const fn new(stages: StageFlags, slot: u32) -> Self {
        Self { stages, slot }
    }
}

/// One pass's collapsed access to one resource.
///
/// Multiple bindings of the same resource within a pass fold into a single
/// record; `first_command_index`/`last_command_index` span the folded range
/// in frame-global command indices.
#[derive(Clone, Debug)]
pub struct Usage {
    pub resource: ResourceHandle,
    pub subresource_mask: u64,
    pub access: AccessFlags,
    pub stages: StageFlags,
    pub first_command_index: u32,
    pub last_command_index: u32,
    /// Access and stages never change across the pass; lets the compactor
    /// hoist the residency call to encoder start.
    pub consistent_usage: bool,
    /// `false` pins the residency declaration to the exact command index
    /// instead of joining the encoder-wide batched set.
    pub allow_reordering: bool,
}

/// A command recorded by a pass executor.
///
/// The runtime only interprets indices and resource references; payloads are
/// carried through to the backend untouched.
#[derive(Clone, Debug)]
pub enum PassCommand {
    SetBuffer {
        path: BindPoint,
        resource: ResourceHandle,
        offset: u64,
    },
    SetTexture {
        path: BindPoint,
        resource: ResourceHandle,
    },
    SetSampler {
        path: BindPoint,
        resource: ResourceHandle,
    },
    SetArgumentBuffer {
        path: BindPoint,
        resource: ResourceHandle,
    },
    /// Inline constants; the bytes live in the frame's side blob.
    SetBytes {
        path: BindPoint,
        blob_offset: u32,
        len: u32,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    Dispatch {
        groups: [u32; 3],
    },
    Blit {
        src: ResourceHandle,
        dst: ResourceHandle,
    },
    BuildAccelerationStructure {
        dst: ResourceHandle,
    },
    /// Marks the point where externally-encoded work (an `External` pass)
    /// executes relative to the declared usages.
    SignalExternal,
}

/// An explicit `memory_barrier` call made by an executor, pinned to the
/// command index it was recorded at.
#[derive(Clone, Debug)]
pub struct ExplicitBarrier {
    /// Frame-global index of the first command the barrier must precede.
    pub index: u32,
    /// Empty when `scope` carries the barrier instead.
    pub resources: SmallVec<[ResourceHandle; 4]>,
    /// Set for scoped barriers; `None` for per-resource ones.
    pub scope: Option<BarrierScope>,
    pub after_stages: StageFlags,
    pub before_stages: StageFlags,
}

/// An immutable record of one pass, produced when its executor returns.
#[derive(Debug)]
pub struct PassRecord {
    pub id: PassId,
    pub kind: PassKind,
    pub queue: QueueId,
    pub name: String,
    pub usages: Vec<Usage>,
    pub command_range: Range<u32>,
    pub explicit_barriers: Vec<ExplicitBarrier>,
    /// Hash of the render-target attachment set; draw passes sharing a key
    /// coalesce into one encoder.
    pub render_target_key: Option<u64>,
    /// Set when the scheduler culls the pass or a backend error disables it.
    pub culled: bool,
}

impl PassRecord {
    /// Looks up this pass's collapsed usage of `resource`.
    #[must_use]
    pub fn usage_of(&self, resource: ResourceHandle) -> Option<&Usage> {
        self.usages.iter().find(|u| u.resource == resource)
    }

    /// `true` if any usage writes.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        self.usages.iter().any(|u| u.access.is_write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_access_is_a_write() {
        assert!(AccessFlags::RENDER_TARGET.is_write());
        assert!(AccessFlags::BLIT_DST.is_write());
        assert!(!AccessFlags::READ.is_write());
        assert!(!(AccessFlags::INPUT_ATTACHMENT | AccessFlags::BLIT_SRC).is_write());
    }

    #[test]
    fn layout_derivation_prefers_writes() {
        let rw = AccessFlags::READ | AccessFlags::WRITE;
        assert_eq!(ImageLayout::required_for(rw, false), ImageLayout::ShaderWrite);
        assert_eq!(
            ImageLayout::required_for(AccessFlags::READ, false),
            ImageLayout::ShaderRead
        );
        assert_eq!(
            ImageLayout::required_for(AccessFlags::RENDER_TARGET, true),
            ImageLayout::DepthStencil
        );
    }
}

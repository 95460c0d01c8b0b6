//! Backend Capability Interface
//!
//! The runtime plans synchronization; a [`Backend`] turns the plan into API
//! calls. This seam is intentionally narrow: materialization, capability
//! queries, queue/fence creation, encoding, and submission. Everything above
//! it (hazard tracking, barrier placement, fencing, aliasing) is
//! backend-agnostic.
//!
//! Vendor-specific hazard semantics are expressed as capability queries
//! (`is_tile_based`, `supports_memoryless_attachments`) rather than platform
//! constants; the compactor branches on the query.

pub mod headless;

pub use headless::HeadlessBackend;

use crate::graph::compact::ResourceCommand;
use crate::graph::pass::{PassCommand, PassKind, StageFlags};
use crate::resource::descriptor::{
    BufferDescriptor, HeapDescriptor, PixelFormat, PurgeableState, TextureDescriptor, UsageHint,
};

/// Opaque identifier of a backing allocation owned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackingId(pub u64);

/// Opaque identifier of a device queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u32);

/// Opaque identifier of a GPU-level sync event (fence/semaphore).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceId(pub u32);

/// Opaque identifier of a recorded command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandBufferId(pub u64);

/// Opaque identifier of a queue submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

/// What a queue is expected to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// Request for [`Backend::make_queue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub kind: QueueKind,
}

/// A fence signal attached to a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceSignalOp {
    pub fence: FenceId,
    pub after_stages: StageFlags,
}

/// A fence wait attached to a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceWaitOp {
    pub fence: FenceId,
    pub before_stages: StageFlags,
}

/// Description of one encoder handed to [`Backend::encode_pass`].
#[derive(Clone, Debug)]
pub struct EncoderDesc<'a> {
    pub kind: PassKind,
    pub queue: QueueId,
    /// Names of the passes in the encoder, for debug grouping.
    pub labels: &'a [&'a str],
    /// Inline-constant bytes referenced by `SetBytes` commands.
    pub bytes_blob: &'a [u8],
}

/// One element of the merged stream a backend replays: either a pass command
/// recorded by an executor or a resource command inserted by the compactor.
#[derive(Clone, Debug)]
pub enum EncodedCommand<'a> {
    Pass(&'a PassCommand),
    Resource(&'a ResourceCommand),
}

/// The graphics-API layer consumed by the runtime.
///
/// Implementations must be `Send + Sync`; the runtime calls capability
/// queries and materialization from multiple recording threads but encodes
/// and submits from a single thread.
pub trait Backend: Send + Sync {
    // ── Materialization ────────────────────────────────────────────────────

    /// Allocates backing memory for a buffer. `None` means out of memory.
    fn materialize_buffer(&self, desc: &BufferDescriptor) -> Option<BackingId>;

    /// Allocates backing memory for a texture. `None` means out of memory.
    fn materialize_texture(&self, desc: &TextureDescriptor) -> Option<BackingId>;

    /// Allocates a heap. `None` means out of memory.
    fn materialize_heap(&self, desc: &HeapDescriptor) -> Option<BackingId>;

    /// Releases a backing allocation. The caller guarantees no submitted
    /// command buffer still references it.
    fn release(&self, backing: BackingId);

    /// Placement size and alignment for a buffer on a heap.
    fn size_and_alignment_for_buffer(&self, desc: &BufferDescriptor) -> (u64, u64);

    /// Placement size and alignment for a texture on a heap.
    fn size_and_alignment_for_texture(&self, desc: &TextureDescriptor) -> (u64, u64);

    /// Transitions a backing's purgeable state, returning the prior state.
    fn set_purgeable(&self, backing: BackingId, state: PurgeableState) -> PurgeableState;

    // ── Capabilities ───────────────────────────────────────────────────────

    fn supports_pixel_format(&self, format: PixelFormat, usage: UsageHint) -> bool;

    fn has_unified_memory(&self) -> bool;

    fn supports_memoryless_attachments(&self) -> bool;

    /// `true` on tile-based GPUs, where render-target scope is not a
    /// distinct barrier scope.
    fn is_tile_based(&self) -> bool;

    /// Soft cap on commands per command buffer; the scheduler closes an
    /// encoder run when appending a pass would exceed it.
    fn command_soft_cap(&self) -> u32;

    // ── Queues & sync objects ──────────────────────────────────────────────

    fn make_queue(&self, spec: QueueSpec) -> QueueId;

    /// Creates a GPU-level sync event usable for cross-queue signaling from
    /// `queue`.
    fn make_sync_event(&self, queue: QueueId) -> FenceId;

    // ── Encoding & submission ──────────────────────────────────────────────

    /// Records one encoder's merged command stream into a command buffer
    /// region, returning the command buffer it landed in.
    fn encode_pass(&self, desc: &EncoderDesc<'_>, commands: &[EncodedCommand<'_>])
    -> CommandBufferId;

    /// Submits a command buffer to its queue with the given fence edges.
    fn submit(
        &self,
        command_buffer: CommandBufferId,
        waits: &[FenceWaitOp],
        signals: &[FenceSignalOp],
    ) -> SubmissionId;

    /// Registers a callback invoked when the submission completes on the
    /// device. May fire on any thread.
    fn completion_callback(&self, submission: SubmissionId, callback: Box<dyn FnOnce() + Send>);
}

//! Weft — a GPU render graph runtime.
//!
//! Weft accepts a declarative description of rendering work — a directed
//! graph of passes reading and writing GPU resources — and turns it, every
//! frame, into a correctly ordered and synchronized sequence of command
//! encoder submissions with minimal barriers, minimal transient memory, and
//! explicit inter-queue signaling.
//!
//! # Quick tour
//!
//! ```ignore
//! let backend = Arc::new(HeadlessBackend::new());
//! let mut graph = RenderGraph::new(backend);
//!
//! let target = graph.create_texture(TextureDescriptor::default())?;
//! let mut frame = graph.begin_frame()?;
//! let scratch = frame.transient_buffer(BufferDescriptor { length: 4 << 20, ..Default::default() })?;
//!
//! frame.add_pass(PassDesc::compute("cull"), move |enc| {
//!     enc.use_resource(scratch, AccessFlags::WRITE, StageFlags::COMPUTE);
//!     enc.dispatch([64, 1, 1]);
//! });
//! frame.add_pass(PassDesc::draw("forward"), move |enc| {
//!     enc.use_resource(scratch, AccessFlags::READ, StageFlags::VERTEX);
//!     enc.use_resource(target, AccessFlags::RENDER_TARGET, StageFlags::FRAGMENT);
//!     enc.draw(0..3, 0..1);
//! });
//!
//! let report = frame.commit()?;
//! ```
//!
//! Pass registration order is the topological order; everything else —
//! encoder batching, hazard barriers, cross-queue fences, transient
//! aliasing, residency batching — is derived.

pub mod backend;
pub mod error;
pub mod graph;
pub mod handle;
pub mod reflect;
pub mod resource;

pub use backend::{
    Backend, BackingId, CommandBufferId, FenceId, HeadlessBackend, QueueId, QueueKind, QueueSpec,
    SubmissionId,
};
pub use error::{Result, WeftError};
pub use graph::{
    AccessFlags, BarrierScope, BindPoint, Frame, FrameReport, GraphOptions, ImageLayout, PassDesc,
    PassEncoder, PassKind, RenderGraph, StageFlags,
};
pub use handle::{RegistryKind, ResourceHandle, ResourceKind};
pub use reflect::{BindingReflection, PipelineReflection, ReflectionCache};
pub use resource::{
    BufferDescriptor, CpuCacheMode, HeapDescriptor, PixelFormat, PurgeableState, StorageMode,
    TextureDescriptor, TextureType, UsageHint,
};

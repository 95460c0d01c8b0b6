//! Render Graph Core
//!
//! The per-frame pipeline, in data-flow order: record ([`encoder`]) →
//! cull/assign ([`schedule`]) → analyze ([`dependency`]) → reduce
//! ([`reduce`]) → plan fences ([`fence`]) → compact ([`compact`]) → submit
//! ([`submit`]). [`frame`] is the front-end that drives the whole chain.

pub mod compact;
pub mod dependency;
pub mod encoder;
pub mod fence;
pub mod frame;
pub mod pass;
pub mod reduce;
pub mod schedule;
pub mod submit;

pub use compact::{BarrierCommand, BarrierForm, CompactedCommand, Order, ResourceCommand};
pub use dependency::{BarrierResource, Dep, DepEndpoint, DepMatrix, DependencyAnalysis};
pub use encoder::PassEncoder;
pub use fence::{FencePlan, FencePool, PlannedFence};
pub use frame::{Frame, FrameReport, GraphOptions, PassDesc, RenderGraph};
pub use pass::{
    AccessFlags, BarrierScope, BindPoint, ImageLayout, PassCommand, PassId, PassKind, PassRecord,
    StageFlags, SUBRESOURCE_ALL, Usage,
};
pub use reduce::ReduceStats;
pub use schedule::EncoderRun;

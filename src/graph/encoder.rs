//! Usage Recorder
//!
//! [`PassEncoder`] is the surface a pass executor records against. Every
//! binding or residency call folds into the pass's per-resource [`Usage`]
//! records; redundant state is elided at record time so the dependency
//! builder sees exactly one collapsed record per `(pass, resource)`.
//!
//! # Collapse rules
//!
//! - A `set_*` call whose `(path, resource, offset)` matches the binding
//!   already open on that path records nothing.
//! - A call that changes the path's resource or offset finalizes the open
//!   range and starts a new one.
//! - Work commands (`draw`, `dispatch`, `blit`) extend the hazard window of
//!   every open binding, so `last_command_index` covers the final command
//!   that could touch the resource.
//!
//! Indices recorded here are pass-local; the frame assembler rebases them
//! into the frame-global command stream in registration order.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::Result;
use crate::handle::{ResourceHandle, ResourceKind};
use crate::resource::{PersistentRegistry, TransientRegistry};

use super::pass::{
    AccessFlags, BarrierScope, BindPoint, ExplicitBarrier, PassCommand, PassKind, StageFlags,
    SUBRESOURCE_ALL, Usage,
};

/// Read-only handle validation shared by all recording threads.
pub(crate) struct HandleValidator<'a> {
    pub persistent: &'a PersistentRegistry,
    pub transient: &'a TransientRegistry,
}

impl HandleValidator<'_> {
    fn validate(&self, handle: ResourceHandle) -> Result<()> {
        if handle.is_transient() {
            self.transient.validate(handle)
        } else {
            self.persistent.validate(handle)
        }
    }
}

/// Everything an executor recorded for one pass, in pass-local indices.
#[derive(Debug, Default)]
pub(crate) struct RecordedPass {
    pub commands: Vec<PassCommand>,
    pub usages: Vec<Usage>,
    pub explicit_barriers: Vec<ExplicitBarrier>,
    pub bytes_blob: Vec<u8>,
    pub render_target_key: Option<u64>,
    /// An invalid handle was used; the pass is skipped in release builds.
    pub poisoned: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct OpenBinding {
    resource: ResourceHandle,
    offset: u64,
}

/// The recording surface handed to a pass executor.
pub struct PassEncoder<'a> {
    validator: HandleValidator<'a>,
    kind: PassKind,
    out: RecordedPass,
    usage_index: FxHashMap<ResourceHandle, usize>,
    open_bindings: FxHashMap<(u8, u32), OpenBinding>,
}

impl<'a> PassEncoder<'a> {
    pub(crate) fn new(
        kind: PassKind,
        persistent: &'a PersistentRegistry,
        transient: &'a TransientRegistry,
    ) -> Self {
        Self {
            validator: HandleValidator {
                persistent,
                transient,
            },
            kind,
            out: RecordedPass::default(),
            usage_index: FxHashMap::default(),
            open_bindings: FxHashMap::default(),
        }
    }

    /// The pass kind this encoder records for.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> PassKind {
        self.kind
    }

    // ── Bindings ───────────────────────────────────────────────────────────

    /// Binds a buffer range at `path`. Identical re-binds collapse.
    pub fn set_buffer(&mut self, path: BindPoint, buffer: ResourceHandle, offset: u64) {
        if !self.check(buffer) {
            return;
        }
        if self.rebind(path, buffer, offset) {
            return;
        }
        let index = self.current_index();
        self.out.commands.push(PassCommand::SetBuffer {
            path,
            resource: buffer,
            offset,
        });
        self.touch(buffer, AccessFlags::READ, path.stages, index);
    }

    /// Binds a texture at `path`.
    pub fn set_texture(&mut self, path: BindPoint, texture: ResourceHandle) {
        if !self.check(texture) {
            return;
        }
        if self.rebind(path, texture, 0) {
            return;
        }
        let index = self.current_index();
        self.out.commands.push(PassCommand::SetTexture {
            path,
            resource: texture,
        });
        self.touch(texture, AccessFlags::READ, path.stages, index);
    }

    /// Binds a sampler at `path`. Samplers carry no hazard state.
    pub fn set_sampler(&mut self, path: BindPoint, sampler: ResourceHandle) {
        if !self.check(sampler) {
            return;
        }
        if self.rebind(path, sampler, 0) {
            return;
        }
        self.out.commands.push(PassCommand::SetSampler {
            path,
            resource: sampler,
        });
    }

    /// Binds an argument buffer at `path`.
    ///
    /// Resources referenced *through* the argument buffer still need their
    /// own `use_resource` declarations.
    pub fn set_argument_buffer(&mut self, path: BindPoint, buffer: ResourceHandle) {
        if !self.check(buffer) {
            return;
        }
        if self.rebind(path, buffer, 0) {
            return;
        }
        let index = self.current_index();
        self.out.commands.push(PassCommand::SetArgumentBuffer {
            path,
            resource: buffer,
        });
        self.touch(buffer, AccessFlags::READ, path.stages, index);
    }

    /// Records inline constants. The bytes are copied into the frame blob.
    pub fn set_bytes(&mut self, path: BindPoint, bytes: &[u8]) {
        let blob_offset = self.out.bytes_blob.len() as u32;
        self.out.bytes_blob.extend_from_slice(bytes);
        self.out.commands.push(PassCommand::SetBytes {
            path,
            blob_offset,
            len: bytes.len() as u32,
        });
    }

    // ── Residency & hazards ────────────────────────────────────────────────

    /// Declares an access so the resource joins the encoder's batched
    /// residency set and participates in hazard tracking.
    pub fn use_resource(&mut self, resource: ResourceHandle, access: AccessFlags, stages: StageFlags) {
        if !self.check(resource) {
            return;
        }
        let index = self.current_index();
        self.touch(resource, access, stages, index);
    }

    /// Like [`use_resource`](Self::use_resource), but the residency call is
    /// pinned to this exact point in the command stream instead of joining
    /// the batched set.
    pub fn use_resource_pinned(
        &mut self,
        resource: ResourceHandle,
        access: AccessFlags,
        stages: StageFlags,
    ) {
        if !self.check(resource) {
            return;
        }
        let index = self.current_index();
        self.touch(resource, access, stages, index);
        if let Some(&slot) = self.usage_index.get(&resource) {
            self.out.usages[slot].allow_reordering = false;
        }
    }

    /// Declares that everything placed in `heap` must be resident.
    pub fn use_heap(&mut self, heap: ResourceHandle, stages: StageFlags) {
        if !self.check(heap) {
            return;
        }
        debug_assert_eq!(heap.kind(), ResourceKind::Heap);
        let index = self.current_index();
        self.touch(heap, AccessFlags::READ, stages, index);
    }

    /// Requests a barrier over the listed resources between `after_stages`
    /// and `before_stages`, at the current position in the command stream.
    pub fn memory_barrier(
        &mut self,
        resources: &[ResourceHandle],
        after_stages: StageFlags,
        before_stages: StageFlags,
    ) {
        let resources: SmallVec<[ResourceHandle; 4]> = resources
            .iter()
            .copied()
            .filter(|&r| self.check(r))
            .collect();
        let index = self.current_index();
        self.out.explicit_barriers.push(ExplicitBarrier {
            index,
            resources,
            scope: None,
            after_stages,
            before_stages,
        });
    }

    /// Requests a scoped barrier (whole buffer/texture/render-target caches).
    pub fn memory_barrier_scope(
        &mut self,
        scope: BarrierScope,
        after_stages: StageFlags,
        before_stages: StageFlags,
    ) {
        let index = self.current_index();
        self.out.explicit_barriers.push(ExplicitBarrier {
            index,
            resources: SmallVec::new(),
            scope: Some(scope),
            after_stages,
            before_stages,
        });
    }

    // ── Work commands ──────────────────────────────────────────────────────

    /// Records a non-indexed draw.
    pub fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        debug_assert_eq!(self.kind, PassKind::Draw);
        let index = self.current_index();
        self.out.commands.push(PassCommand::Draw {
            vertices,
            instances,
        });
        self.extend_open_bindings(index);
    }

    /// Records an indexed draw.
    pub fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        debug_assert_eq!(self.kind, PassKind::Draw);
        let index = self.current_index();
        self.out.commands.push(PassCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
        self.extend_open_bindings(index);
    }

    /// Records a compute dispatch.
    pub fn dispatch(&mut self, groups: [u32; 3]) {
        debug_assert_eq!(self.kind, PassKind::Compute);
        let index = self.current_index();
        self.out.commands.push(PassCommand::Dispatch { groups });
        self.extend_open_bindings(index);
    }

    /// Records a blit and its implied src/dst usages.
    pub fn blit(&mut self, src: ResourceHandle, dst: ResourceHandle) {
        debug_assert_eq!(self.kind, PassKind::Blit);
        if !self.check(src) || !self.check(dst) {
            return;
        }
        let index = self.current_index();
        self.out.commands.push(PassCommand::Blit { src, dst });
        self.touch(src, AccessFlags::BLIT_SRC, StageFlags::BLIT, index);
        self.touch(dst, AccessFlags::BLIT_DST, StageFlags::BLIT, index);
    }

    /// Records the point where an external pass's work executes.
    ///
    /// External passes encode outside the graph (video decode, interop);
    /// this command anchors their declared usages into the frame stream so
    /// barriers and fences order against the right position.
    pub fn signal_external(&mut self) {
        debug_assert_eq!(self.kind, PassKind::External);
        let index = self.current_index();
        self.out.commands.push(PassCommand::SignalExternal);
        self.extend_open_bindings(index);
    }

    /// Records an acceleration-structure build writing `dst`.
    pub fn build_acceleration_structure(&mut self, dst: ResourceHandle) {
        debug_assert_eq!(self.kind, PassKind::AccelerationStructure);
        if !self.check(dst) {
            return;
        }
        let index = self.current_index();
        self.out
            .commands
            .push(PassCommand::BuildAccelerationStructure { dst });
        self.touch(dst, AccessFlags::WRITE, StageFlags::COMPUTE, index);
    }

    // ── Finalization ───────────────────────────────────────────────────────

    pub(crate) fn finish(mut self) -> RecordedPass {
        if self.kind == PassKind::Draw {
            self.out.render_target_key = Some(render_target_key(&self.out.usages));
        }
        self.out
    }

    // ── Internals ──────────────────────────────────────────────────────────

    /// Index the next recorded command will occupy.
    fn current_index(&self) -> u32 {
        self.out.commands.len() as u32
    }

    fn check(&mut self, handle: ResourceHandle) -> bool {
        match self.validator.validate(handle) {
            Ok(()) => true,
            Err(err) => {
                debug_assert!(false, "stale handle recorded into pass: {err}");
                log::error!("invalid handle in pass recording, skipping pass: {err}");
                self.out.poisoned = true;
                false
            }
        }
    }

    /// Returns `true` when the binding collapsed into the one already open.
    fn rebind(&mut self, path: BindPoint, resource: ResourceHandle, offset: u64) -> bool {
        let key = (path.stages.bits(), path.slot);
        let binding = OpenBinding { resource, offset };
        match self.open_bindings.insert(key, binding) {
            Some(previous) if previous == binding => true,
            _ => false,
        }
    }

    fn touch(&mut self, resource: ResourceHandle, access: AccessFlags, stages: StageFlags, index: u32) {
        match self.usage_index.get(&resource) {
            Some(&slot) => {
                let usage = &mut self.out.usages[slot];
                if usage.access != access || usage.stages != stages {
                    usage.consistent_usage = false;
                }
                usage.access |= access;
                usage.stages |= stages;
                usage.first_command_index = usage.first_command_index.min(index);
                usage.last_command_index = usage.last_command_index.max(index);
            }
            None => {
                let slot = self.out.usages.len();
                self.usage_index.insert(resource, slot);
                self.out.usages.push(Usage {
                    resource,
                    subresource_mask: SUBRESOURCE_ALL,
                    access,
                    stages,
                    first_command_index: index,
                    last_command_index: index,
                    consistent_usage: true,
                    allow_reordering: true,
                });
            }
        }
    }

    /// Work commands extend the hazard window of every open binding.
    fn extend_open_bindings(&mut self, index: u32) {
        for binding in self.open_bindings.values() {
            if let Some(&slot) = self.usage_index.get(&binding.resource) {
                let usage = &mut self.out.usages[slot];
                usage.last_command_index = usage.last_command_index.max(index);
            }
        }
    }
}

/// Order-independent key over the render-target attachment set; draw passes
/// sharing a key may coalesce into one encoder.
fn render_target_key(usages: &[Usage]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut attachments: SmallVec<[u64; 8]> = usages
        .iter()
        .filter(|u| u.access.contains(AccessFlags::RENDER_TARGET))
        .map(|u| u.resource.bits())
        .collect();
    attachments.sort_unstable();
    let mut hasher = rustc_hash::FxHasher::default();
    attachments.len().hash(&mut hasher);
    for bits in attachments {
        bits.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resource::BufferDescriptor;
    use std::sync::Arc;

    fn fixtures() -> (Arc<HeadlessBackend>, PersistentRegistry, TransientRegistry) {
        let backend = Arc::new(HeadlessBackend::new());
        let persistent = PersistentRegistry::new(backend.clone());
        let transient = TransientRegistry::new(backend.clone(), 2);
        (backend, persistent, transient)
    }

    #[test]
    fn identical_rebind_records_one_binding() {
        let (_b, persistent, transient) = fixtures();
        let buf = persistent.allocate_buffer(BufferDescriptor::default()).unwrap();
        let mut enc = PassEncoder::new(PassKind::Compute, &persistent, &transient);
        let path = BindPoint::new(StageFlags::COMPUTE, 0);
        enc.set_buffer(path, buf, 0);
        enc.set_buffer(path, buf, 0);
        let recorded = enc.finish();
        assert_eq!(recorded.commands.len(), 1);
        assert_eq!(recorded.usages.len(), 1);
    }

    #[test]
    fn offset_change_opens_a_new_range() {
        let (_b, persistent, transient) = fixtures();
        let buf = persistent.allocate_buffer(BufferDescriptor::default()).unwrap();
        let mut enc = PassEncoder::new(PassKind::Compute, &persistent, &transient);
        let path = BindPoint::new(StageFlags::COMPUTE, 0);
        enc.set_buffer(path, buf, 0);
        enc.set_buffer(path, buf, 256);
        let recorded = enc.finish();
        assert_eq!(recorded.commands.len(), 2);
        // Still one collapsed usage spanning both commands.
        assert_eq!(recorded.usages.len(), 1);
        assert_eq!(recorded.usages[0].first_command_index, 0);
        assert_eq!(recorded.usages[0].last_command_index, 1);
    }

    #[test]
    fn mixed_access_clears_consistent_usage() {
        let (_b, persistent, transient) = fixtures();
        let buf = persistent.allocate_buffer(BufferDescriptor::default()).unwrap();
        let mut enc = PassEncoder::new(PassKind::Compute, &persistent, &transient);
        enc.use_resource(buf, AccessFlags::READ, StageFlags::COMPUTE);
        assert!(enc.finish().usages[0].consistent_usage);

        let mut enc = PassEncoder::new(PassKind::Compute, &persistent, &transient);
        enc.use_resource(buf, AccessFlags::READ, StageFlags::COMPUTE);
        enc.use_resource(buf, AccessFlags::WRITE, StageFlags::COMPUTE);
        let recorded = enc.finish();
        assert!(!recorded.usages[0].consistent_usage);
        assert_eq!(recorded.usages[0].access, AccessFlags::READ | AccessFlags::WRITE);
    }

    #[test]
    fn work_commands_extend_open_binding_windows() {
        let (_b, persistent, transient) = fixtures();
        let buf = persistent.allocate_buffer(BufferDescriptor::default()).unwrap();
        let mut enc = PassEncoder::new(PassKind::Compute, &persistent, &transient);
        enc.set_buffer(BindPoint::new(StageFlags::COMPUTE, 0), buf, 0);
        enc.dispatch([8, 8, 1]);
        enc.dispatch([4, 4, 1]);
        let recorded = enc.finish();
        assert_eq!(recorded.usages[0].first_command_index, 0);
        assert_eq!(recorded.usages[0].last_command_index, 2);
    }

    #[test]
    fn signal_external_anchors_declared_usages() {
        let (_b, persistent, transient) = fixtures();
        let buf = persistent.allocate_buffer(BufferDescriptor::default()).unwrap();
        let mut enc = PassEncoder::new(PassKind::External, &persistent, &transient);
        enc.set_buffer(BindPoint::new(StageFlags::COMPUTE, 0), buf, 0);
        enc.signal_external();
        let recorded = enc.finish();
        assert!(matches!(recorded.commands[1], PassCommand::SignalExternal));
        // The external work extends the binding's hazard window.
        assert_eq!(recorded.usages[0].last_command_index, 1);
    }

    #[test]
    fn stale_handle_poisons_the_pass() {
        let (_b, persistent, transient) = fixtures();
        let buf = persistent.allocate_buffer(BufferDescriptor::default()).unwrap();
        persistent.dispose(buf, 0).unwrap();
        let mut enc = PassEncoder::new(PassKind::Compute, &persistent, &transient);
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            enc.use_resource(buf, AccessFlags::READ, StageFlags::COMPUTE);
            enc.finish().poisoned
        }));
        // Debug builds assert; release builds poison and continue.
        if let Ok(poisoned) = poisoned {
            assert!(cfg!(debug_assertions) || poisoned);
        }
    }
}

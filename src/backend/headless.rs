//! Headless Backend
//!
//! An in-memory [`Backend`] that materializes nothing and records
//! everything: tests and benches drive the full frame pipeline against it
//! and assert on the encoded streams, submissions, and fence traffic.
//!
//! Completion is configurable: `auto_complete` (the default) fires
//! completion callbacks as soon as they are registered, so single-threaded
//! tests never block on frame pacing. With it off, callbacks queue until
//! [`HeadlessBackend::complete_all`] — the knob frame-retire tests use.

use parking_lot::Mutex;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};

use crate::graph::compact::ResourceCommand;
use crate::graph::pass::{PassCommand, PassKind};
use crate::resource::descriptor::{
    BufferDescriptor, HeapDescriptor, PixelFormat, PurgeableState, TextureDescriptor, UsageHint,
};

use super::{
    Backend, BackingId, CommandBufferId, EncodedCommand, EncoderDesc, FenceId, FenceSignalOp,
    FenceWaitOp, QueueId, QueueSpec, SubmissionId,
};

/// An owned copy of one encoded command.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    Pass(PassCommand),
    Resource(ResourceCommand),
}

/// One `encode_pass` call, as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedEncoder {
    pub kind: PassKind,
    pub queue: QueueId,
    pub labels: Vec<String>,
    pub commands: Vec<RecordedCommand>,
    pub command_buffer: CommandBufferId,
}

/// One `submit` call.
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub id: SubmissionId,
    pub command_buffer: CommandBufferId,
    pub waits: Vec<FenceWaitOp>,
    pub signals: Vec<FenceSignalOp>,
}

struct BackingInfo {
    size: u64,
    purgeable: PurgeableState,
}

struct Inner {
    backings: SlotMap<DefaultKey, BackingInfo>,
    used_memory: u64,
    budget: Option<u64>,
    queues: Vec<QueueSpec>,
    sync_events: u32,
    encoders: Vec<RecordedEncoder>,
    submissions: Vec<RecordedSubmission>,
    next_command_buffer: u64,
    next_submission: u64,
    pending: Vec<(SubmissionId, Box<dyn FnOnce() + Send>)>,
    auto_complete: bool,
    tile_based: bool,
    memoryless: bool,
    unified_memory: bool,
    soft_cap: u32,
}

/// Recording in-memory backend.
pub struct HeadlessBackend {
    inner: Mutex<Inner>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                backings: SlotMap::new(),
                used_memory: 0,
                budget: None,
                queues: Vec::new(),
                sync_events: 0,
                encoders: Vec::new(),
                submissions: Vec::new(),
                next_command_buffer: 0,
                next_submission: 0,
                pending: Vec::new(),
                auto_complete: true,
                tile_based: false,
                memoryless: false,
                unified_memory: false,
                soft_cap: 4096,
            }),
        }
    }

    // ── Test configuration ─────────────────────────────────────────────────

    /// Caps total materialized bytes; allocations past it return `None`.
    pub fn set_memory_budget(&self, budget: Option<u64>) {
        self.inner.lock().budget = budget;
    }

    /// Queues completion callbacks instead of firing them at registration.
    pub fn set_auto_complete(&self, auto: bool) {
        self.inner.lock().auto_complete = auto;
    }

    pub fn set_tile_based(&self, tile_based: bool) {
        let mut inner = self.inner.lock();
        inner.tile_based = tile_based;
        inner.memoryless = tile_based;
        inner.unified_memory = tile_based;
    }

    pub fn set_command_soft_cap(&self, cap: u32) {
        self.inner.lock().soft_cap = cap;
    }

    /// Fires every queued completion callback, in submission order.
    pub fn complete_all(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.pending)
        };
        for (_, callback) in pending {
            callback();
        }
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn encoders(&self) -> Vec<RecordedEncoder> {
        self.inner.lock().encoders.clone()
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.inner.lock().submissions.clone()
    }

    /// Total sync events ever created.
    #[must_use]
    pub fn sync_event_count(&self) -> u32 {
        self.inner.lock().sync_events
    }

    /// Currently materialized backing count.
    #[must_use]
    pub fn live_backing_count(&self) -> usize {
        self.inner.lock().backings.len()
    }

    /// Currently materialized bytes.
    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.inner.lock().used_memory
    }

    /// Drops all recorded encoders and submissions (between test frames).
    pub fn clear_recordings(&self) {
        let mut inner = self.inner.lock();
        inner.encoders.clear();
        inner.submissions.clear();
    }

    fn materialize(&self, size: u64) -> Option<BackingId> {
        let mut inner = self.inner.lock();
        if let Some(budget) = inner.budget {
            if inner.used_memory + size > budget {
                return None;
            }
        }
        inner.used_memory += size;
        let key = inner.backings.insert(BackingInfo {
            size,
            purgeable: PurgeableState::NonVolatile,
        });
        Some(BackingId(key.data().as_ffi()))
    }
}

impl Backend for HeadlessBackend {
    fn materialize_buffer(&self, desc: &BufferDescriptor) -> Option<BackingId> {
        self.materialize(desc.length)
    }

    fn materialize_texture(&self, desc: &TextureDescriptor) -> Option<BackingId> {
        self.materialize(desc.estimated_size())
    }

    fn materialize_heap(&self, desc: &HeapDescriptor) -> Option<BackingId> {
        self.materialize(desc.size)
    }

    fn release(&self, backing: BackingId) {
        let mut inner = self.inner.lock();
        let key = DefaultKey::from(KeyData::from_ffi(backing.0));
        if let Some(info) = inner.backings.remove(key) {
            inner.used_memory -= info.size;
        }
    }

    fn size_and_alignment_for_buffer(&self, desc: &BufferDescriptor) -> (u64, u64) {
        (desc.length, 256)
    }

    fn size_and_alignment_for_texture(&self, desc: &TextureDescriptor) -> (u64, u64) {
        (desc.estimated_size(), 1024)
    }

    fn set_purgeable(&self, backing: BackingId, state: PurgeableState) -> PurgeableState {
        let mut inner = self.inner.lock();
        let key = DefaultKey::from(KeyData::from_ffi(backing.0));
        let Some(info) = inner.backings.get_mut(key) else {
            return PurgeableState::Empty;
        };
        let previous = info.purgeable;
        if state != PurgeableState::KeepCurrent {
            info.purgeable = state;
        }
        previous
    }

    fn supports_pixel_format(&self, _format: PixelFormat, _usage: UsageHint) -> bool {
        true
    }

    fn has_unified_memory(&self) -> bool {
        self.inner.lock().unified_memory
    }

    fn supports_memoryless_attachments(&self) -> bool {
        self.inner.lock().memoryless
    }

    fn is_tile_based(&self) -> bool {
        self.inner.lock().tile_based
    }

    fn command_soft_cap(&self) -> u32 {
        self.inner.lock().soft_cap
    }

    fn make_queue(&self, spec: QueueSpec) -> QueueId {
        let mut inner = self.inner.lock();
        let id = QueueId(inner.queues.len() as u32);
        inner.queues.push(spec);
        id
    }

    fn make_sync_event(&self, _queue: QueueId) -> FenceId {
        let mut inner = self.inner.lock();
        let id = FenceId(inner.sync_events);
        inner.sync_events += 1;
        id
    }

    fn encode_pass(
        &self,
        desc: &EncoderDesc<'_>,
        commands: &[EncodedCommand<'_>],
    ) -> CommandBufferId {
        let mut inner = self.inner.lock();
        let command_buffer = CommandBufferId(inner.next_command_buffer);
        inner.next_command_buffer += 1;
        let commands = commands
            .iter()
            .map(|c| match c {
                EncodedCommand::Pass(p) => RecordedCommand::Pass((*p).clone()),
                EncodedCommand::Resource(r) => RecordedCommand::Resource((*r).clone()),
            })
            .collect();
        inner.encoders.push(RecordedEncoder {
            kind: desc.kind,
            queue: desc.queue,
            labels: desc.labels.iter().map(ToString::to_string).collect(),
            commands,
            command_buffer,
        });
        command_buffer
    }

    fn submit(
        &self,
        command_buffer: CommandBufferId,
        waits: &[FenceWaitOp],
        signals: &[FenceSignalOp],
    ) -> SubmissionId {
        let mut inner = self.inner.lock();
        let id = SubmissionId(inner.next_submission);
        inner.next_submission += 1;
        inner.submissions.push(RecordedSubmission {
            id,
            command_buffer,
            waits: waits.to_vec(),
            signals: signals.to_vec(),
        });
        id
    }

    fn completion_callback(&self, submission: SubmissionId, callback: Box<dyn FnOnce() + Send>) {
        let auto = {
            let mut inner = self.inner.lock();
            if inner.auto_complete {
                true
            } else {
                inner.pending.push((submission, callback));
                return;
            }
        };
        if auto {
            callback();
        }
    }
}

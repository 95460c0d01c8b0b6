//! Frame Front-End
//!
//! [`RenderGraph`] is the long-lived runtime object: it owns the registries,
//! the fence pool, and the submission driver. A [`Frame`] is the per-frame
//! builder: declare transient resources, add passes, commit.
//!
//! # Per-frame pipeline
//!
//! ```text
//! begin_frame ─► add_pass* ─► commit
//!                              │ record executors (parallel workers)
//!                              │ assemble & rebase pass records
//!                              │ cull ─► assign encoders ─► validate
//!                              │ build dependencies ─► materialize transients
//!                              │ reduce ─► plan fences ─► compact
//!                              └ submit ─► (completion) ─► retire
//! ```
//!
//! Executors record concurrently on a worker pool; registry reads take the
//! shared lock. Everything from culling onward is single-threaded on the
//! frame thread. A frame either commits fully or is abandoned before
//! submission — no partial state crosses frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::backend::{Backend, BackingId, QueueId, QueueKind, QueueSpec};
use crate::error::{Result, WeftError};
use crate::handle::{ResourceHandle, ResourceKind};
use crate::reflect::ReflectionCache;
use crate::resource::{
    BufferDescriptor, HeapDescriptor, PersistentRegistry, PurgeableState, ResourceDescriptor,
    StorageMode, TextureDescriptor, TransientRegistry,
};

use super::compact::{self, CompactorInput, ResourceCommand};
use super::dependency;
use super::encoder::{PassEncoder, RecordedPass};
use super::fence::{self, FencePool};
use super::pass::{PassCommand, PassId, PassKind, PassRecord};
use super::reduce::{self, ReduceStats};
use super::schedule;
use super::submit::SubmissionDriver;

type Executor = Box<dyn FnOnce(&mut PassEncoder<'_>) + Send>;

/// Tunables for a [`RenderGraph`].
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Frames that may be in flight before `begin_frame` blocks.
    pub max_frames_in_flight: usize,
    /// Let transient resources with disjoint lifetimes share memory.
    pub alias_transients: bool,
    /// Idle time before a transient arena is returned to the OS.
    pub arena_purge_delay: Duration,
    /// Blocking fence-wait budget; exceeding it escalates to `DeviceLost`.
    pub fence_wait_timeout: Duration,
    /// Route compute and acceleration-structure passes to the async compute
    /// queue instead of the graphics queue.
    pub async_compute: bool,
    /// Worker threads for pass recording; `None` uses the host parallelism.
    pub recording_threads: Option<usize>,
    /// Resources a memory barrier may name individually before the compactor
    /// demotes it to the scoped form.
    pub per_resource_barrier_limit: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            alias_transients: true,
            arena_purge_delay: Duration::from_secs(5),
            fence_wait_timeout: Duration::from_secs(2),
            async_compute: false,
            recording_threads: None,
            per_resource_barrier_limit: compact::PER_RESOURCE_BARRIER_LIMIT,
        }
    }
}

/// Creation parameters for one pass.
#[derive(Debug, Clone)]
pub struct PassDesc {
    pub kind: PassKind,
    pub name: String,
    /// Explicit queue; `None` routes by kind.
    pub queue: Option<QueueId>,
}

impl PassDesc {
    #[must_use]
    pub fn new(kind: PassKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            queue: None,
        }
    }

    #[must_use]
    pub fn draw(name: impl Into<String>) -> Self {
        Self::new(PassKind::Draw, name)
    }

    #[must_use]
    pub fn compute(name: impl Into<String>) -> Self {
        Self::new(PassKind::Compute, name)
    }

    #[must_use]
    pub fn blit(name: impl Into<String>) -> Self {
        Self::new(PassKind::Blit, name)
    }

    #[must_use]
    pub fn external(name: impl Into<String>) -> Self {
        Self::new(PassKind::External, name)
    }

    #[must_use]
    pub fn acceleration_structure(name: impl Into<String>) -> Self {
        Self::new(PassKind::AccelerationStructure, name)
    }

    /// Pins the pass to a specific queue.
    #[must_use]
    pub fn on_queue(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }
}

/// What one committed frame did, for logging, tests, and tooling.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame: u64,
    pub pass_count: usize,
    pub culled_passes: Vec<String>,
    pub encoder_count: usize,
    pub submission_count: usize,
    /// Fences allocated for cross-queue edges this frame.
    pub fence_count: usize,
    pub barrier_count: usize,
    pub residency_count: usize,
    pub compacted_command_count: usize,
    pub reduce: ReduceStats,
    pub alias_pair_count: usize,
}

/// The render graph runtime.
pub struct RenderGraph {
    backend: Arc<dyn Backend>,
    options: GraphOptions,
    persistent: PersistentRegistry,
    transient: TransientRegistry,
    fence_pool: FencePool,
    driver: SubmissionDriver,
    reflection: ReflectionCache,
    graphics_queue: QueueId,
    compute_queue: QueueId,
    transfer_queue: QueueId,
    /// Number the next committed frame will carry (1-based).
    next_frame: u64,
    in_flight: usize,
    device_lost: bool,
}

impl RenderGraph {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_options(backend, GraphOptions::default())
    }

    #[must_use]
    pub fn with_options(backend: Arc<dyn Backend>, options: GraphOptions) -> Self {
        let graphics_queue = backend.make_queue(QueueSpec {
            kind: QueueKind::Graphics,
        });
        let compute_queue = backend.make_queue(QueueSpec {
            kind: QueueKind::Compute,
        });
        let transfer_queue = backend.make_queue(QueueSpec {
            kind: QueueKind::Transfer,
        });
        Self {
            persistent: PersistentRegistry::new(backend.clone()),
            transient: TransientRegistry::new(backend.clone(), options.max_frames_in_flight),
            fence_pool: FencePool::new(backend.clone()),
            driver: SubmissionDriver::new(backend.clone()),
            reflection: ReflectionCache::new(),
            graphics_queue,
            compute_queue,
            transfer_queue,
            next_frame: 1,
            in_flight: 0,
            device_lost: false,
            options,
            backend,
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[inline]
    #[must_use]
    pub fn persistent(&self) -> &PersistentRegistry {
        &self.persistent
    }

    #[inline]
    #[must_use]
    pub fn transient(&self) -> &TransientRegistry {
        &self.transient
    }

    #[inline]
    #[must_use]
    pub fn reflection(&self) -> &ReflectionCache {
        &self.reflection
    }

    #[inline]
    #[must_use]
    pub fn graphics_queue(&self) -> QueueId {
        self.graphics_queue
    }

    #[inline]
    #[must_use]
    pub fn compute_queue(&self) -> QueueId {
        self.compute_queue
    }

    #[inline]
    #[must_use]
    pub fn transfer_queue(&self) -> QueueId {
        self.transfer_queue
    }

    /// Frames submitted but not yet retired.
    #[inline]
    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight
    }

    // ── Persistent resources ───────────────────────────────────────────────

    /// Materializes a persistent buffer.
    ///
    /// On out-of-memory the allocation is retried once after a blocking
    /// retire; the second failure surfaces to the caller.
    pub fn create_buffer(&mut self, desc: BufferDescriptor) -> Result<ResourceHandle> {
        match self.persistent.allocate_buffer(desc.clone()) {
            Err(WeftError::OutOfMemory { .. }) => {
                self.wait_one_retire()?;
                self.persistent.allocate_buffer(desc).map_err(promote_oom)
            }
            other => other,
        }
    }

    /// Materializes a persistent texture.
    pub fn create_texture(&mut self, desc: TextureDescriptor) -> Result<ResourceHandle> {
        match self.persistent.allocate_texture(desc.clone()) {
            Err(WeftError::OutOfMemory { .. }) => {
                self.wait_one_retire()?;
                self.persistent.allocate_texture(desc).map_err(promote_oom)
            }
            other => other,
        }
    }

    /// Materializes a heap for sub-allocation.
    pub fn create_heap(&mut self, desc: HeapDescriptor) -> Result<ResourceHandle> {
        match self.persistent.allocate_heap(desc.clone()) {
            Err(WeftError::OutOfMemory { .. }) => {
                self.wait_one_retire()?;
                self.persistent.allocate_heap(desc).map_err(promote_oom)
            }
            other => other,
        }
    }

    /// Creates a sampler.
    #[must_use]
    pub fn create_sampler(&mut self) -> ResourceHandle {
        self.persistent.allocate_sampler()
    }

    /// Places a buffer on `heap`; it borrows the heap's lifetime.
    pub fn place_buffer(
        &mut self,
        heap: ResourceHandle,
        desc: BufferDescriptor,
    ) -> Result<ResourceHandle> {
        self.persistent.place_buffer(heap, desc)
    }

    /// Places a texture on `heap`.
    pub fn place_texture(
        &mut self,
        heap: ResourceHandle,
        desc: TextureDescriptor,
    ) -> Result<ResourceHandle> {
        self.persistent.place_texture(heap, desc)
    }

    /// Wraps an externally-owned buffer (no ownership taken).
    pub fn import_buffer(&mut self, backing: BackingId, desc: BufferDescriptor) -> ResourceHandle {
        self.persistent.import_buffer(backing, desc)
    }

    /// Wraps an externally-owned texture, e.g. a swapchain image.
    pub fn import_texture(
        &mut self,
        backing: BackingId,
        desc: TextureDescriptor,
    ) -> ResourceHandle {
        self.persistent.import_texture(backing, desc)
    }

    /// Atomically swaps a resource's backing, returning the old one.
    pub fn replace_backing(
        &mut self,
        handle: ResourceHandle,
        new: BackingId,
        desc: &ResourceDescriptor,
    ) -> Result<BackingId> {
        self.persistent.replace_backing(handle, new, desc)
    }

    /// Invalidates `handle` now; the backing is released once every frame
    /// that could reference it has completed.
    pub fn dispose(&mut self, handle: ResourceHandle) -> Result<()> {
        self.persistent.dispose(handle, self.next_frame)
    }

    /// Enqueues a purgeability transition, flushed on the next retire.
    pub fn set_purgeable(&mut self, handle: ResourceHandle, state: PurgeableState) -> Result<()> {
        self.persistent.set_purgeable(handle, state)
    }

    // ── Frame lifecycle ────────────────────────────────────────────────────

    /// Opens the next frame, blocking while too many frames are in flight.
    pub fn begin_frame(&mut self) -> Result<Frame<'_>> {
        if self.device_lost {
            self.recover_from_device_loss()?;
        }
        self.retire_completed();
        while self.in_flight >= self.options.max_frames_in_flight {
            self.wait_one_retire()?;
        }
        let number = self.next_frame;
        let slot = (number % self.options.max_frames_in_flight as u64) as u8;
        Ok(Frame {
            graph: self,
            number,
            slot,
            pending: Vec::new(),
        })
    }

    /// Drains the completion channel without blocking.
    pub fn retire_completed(&mut self) {
        while let Ok(msg) = self.driver.receiver().try_recv() {
            self.process_retire(&msg.fences, msg.frame, msg.slot);
        }
    }

    /// Returns transient arena memory idle past the quiescence delay.
    pub fn trim(&mut self) -> u64 {
        self.transient
            .trim(Instant::now(), self.options.arena_purge_delay)
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn process_retire(&mut self, fences: &[crate::backend::FenceId], frame: u64, slot: u8) {
        self.fence_pool.recycle(fences.iter().copied());
        self.transient.cycle(slot);
        self.persistent.release_completed(frame);
        let flushed = self.persistent.flush_purgeables();
        if !flushed.is_empty() {
            log::debug!("frame {frame}: flushed {} purgeability transition(s)", flushed.len());
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        log::trace!("frame {frame} retired (slot {slot})");
    }

    /// Blocks for one retire; escalates to `DeviceLost` on timeout.
    fn wait_one_retire(&mut self) -> Result<()> {
        if self.in_flight == 0 {
            return Ok(());
        }
        match self
            .driver
            .receiver()
            .recv_timeout(self.options.fence_wait_timeout)
        {
            Ok(msg) => {
                self.process_retire(&msg.fences, msg.frame, msg.slot);
                Ok(())
            }
            Err(_) => {
                log::error!(
                    "fence wait exceeded {:?}; treating device as lost",
                    self.options.fence_wait_timeout
                );
                self.device_lost = true;
                // Abandon in-flight bookkeeping; the device will not signal.
                self.in_flight = 0;
                for slot in 0..self.options.max_frames_in_flight {
                    self.transient.cycle(slot as u8);
                }
                Err(WeftError::DeviceLost)
            }
        }
    }

    fn recover_from_device_loss(&mut self) -> Result<()> {
        log::warn!("re-materializing persistent resources after device loss");
        self.persistent.rematerialize_all()?;
        self.device_lost = false;
        Ok(())
    }

    fn default_queue(&self, kind: PassKind) -> QueueId {
        match kind {
            PassKind::Compute | PassKind::AccelerationStructure if self.options.async_compute => {
                self.compute_queue
            }
            PassKind::Blit => self.transfer_queue,
            _ => self.graphics_queue,
        }
    }
}

fn promote_oom(err: WeftError) -> WeftError {
    match err {
        WeftError::OutOfMemory { .. } => WeftError::OutOfMemory { retried: true },
        other => other,
    }
}

struct PendingPass {
    desc: PassDesc,
    executor: Executor,
}

/// Builder for one frame.
pub struct Frame<'g> {
    graph: &'g mut RenderGraph,
    number: u64,
    slot: u8,
    pending: Vec<PendingPass>,
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("number", &self.number)
            .field("slot", &self.slot)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Frame<'_> {
    /// This frame's 1-based number.
    #[inline]
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The in-flight slot this frame occupies.
    #[inline]
    #[must_use]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Declares a transient buffer, alive until this frame retires.
    pub fn transient_buffer(&mut self, desc: BufferDescriptor) -> Result<ResourceHandle> {
        self.graph.transient.create_buffer(self.slot, desc)
    }

    /// Declares a transient texture.
    pub fn transient_texture(&mut self, desc: TextureDescriptor) -> Result<ResourceHandle> {
        self.graph.transient.create_texture(self.slot, desc)
    }

    /// Adds a pass. `executor` runs at commit, possibly on a worker thread.
    pub fn add_pass(
        &mut self,
        desc: PassDesc,
        executor: impl FnOnce(&mut PassEncoder<'_>) + Send + 'static,
    ) {
        self.pending.push(PendingPass {
            desc,
            executor: Box::new(executor),
        });
    }

    /// Runs the whole per-frame pipeline and submits to the backend.
    pub fn commit(self) -> Result<FrameReport> {
        let Frame {
            graph,
            number,
            slot,
            pending,
        } = self;

        let pass_count = pending.len();
        let mut descs = Vec::with_capacity(pass_count);
        let mut executors = Vec::with_capacity(pass_count);
        for pass in pending {
            executors.push((pass.desc.kind, pass.executor));
            descs.push(pass.desc);
        }

        // Record executors on the worker pool.
        let recorded = record_passes(graph, executors);

        // Assemble immutable pass records in the frame-global index space.
        let mut commands: Vec<PassCommand> = Vec::new();
        let mut bytes_blob: Vec<u8> = Vec::new();
        let mut records: Vec<PassRecord> = Vec::with_capacity(pass_count);
        for (i, (desc, mut rec)) in descs.into_iter().zip(recorded).enumerate() {
            let base = commands.len() as u32;
            let blob_base = bytes_blob.len() as u32;
            for command in &mut rec.commands {
                if let PassCommand::SetBytes { blob_offset, .. } = command {
                    *blob_offset += blob_base;
                }
            }
            for usage in &mut rec.usages {
                usage.first_command_index += base;
                usage.last_command_index += base;
            }
            for barrier in &mut rec.explicit_barriers {
                barrier.index += base;
            }
            let command_range = base..base + rec.commands.len() as u32;
            commands.append(&mut rec.commands);
            bytes_blob.append(&mut rec.bytes_blob);
            records.push(PassRecord {
                id: PassId(i as u32),
                kind: desc.kind,
                queue: desc.queue.unwrap_or_else(|| graph.default_queue(desc.kind)),
                name: desc.name,
                usages: rec.usages,
                command_range,
                explicit_barriers: rec.explicit_barriers,
                render_target_key: rec.render_target_key,
                culled: rec.poisoned,
            });
        }

        // Cull, then batch survivors into encoder runs.
        schedule::cull_passes(&mut records, |handle| !handle.is_transient());
        let culled_passes: Vec<String> = records
            .iter()
            .filter(|p| p.culled)
            .map(|p| p.name.clone())
            .collect();
        let runs = schedule::assign_encoders(&records, graph.backend.command_soft_cap());

        validate_memoryless(&records, &runs, &graph.persistent, &graph.transient);

        // Dependency analysis over the usage logs.
        let transient_count = graph.transient.entry_count(slot);
        let analysis = dependency::build(&records, &runs, transient_count, |handle| {
            texture_aspect(&graph.persistent, &graph.transient, handle)
        });

        // Assign transient memory now that lifetimes are known.
        let materialized = graph.transient.materialize(
            slot,
            &analysis.transient_intervals,
            graph.options.alias_transients,
        );
        if let Err(WeftError::OutOfMemory { .. }) = materialized {
            graph.wait_one_retire()?;
            graph
                .transient
                .materialize(slot, &analysis.transient_intervals, graph.options.alias_transients)
                .map_err(promote_oom)?;
        } else {
            materialized?;
        }

        // Minimal edges, then synchronization for each survivor.
        let mut matrix = analysis.matrix;
        let reduce_stats = reduce::reduce(&mut matrix);
        let plan = fence::plan(&matrix, &runs, &mut graph.fence_pool);

        let compacted = compact::compact(&CompactorInput {
            passes: &records,
            runs: &runs,
            plan: &plan,
            intra: &analysis.intra,
            tile_based: graph.backend.is_tile_based(),
            per_resource_limit: graph.options.per_resource_barrier_limit,
        });

        let submission = graph.driver.flush(
            &records,
            &commands,
            &bytes_blob,
            &runs,
            &compacted,
            &plan,
            number,
            slot,
        );

        graph.in_flight += 1;
        graph.next_frame += 1;

        let barrier_count = compacted
            .iter()
            .flatten()
            .filter(|c| matches!(c.command, ResourceCommand::Barrier(_)))
            .count();
        let residency_count = compacted
            .iter()
            .flatten()
            .filter(|c| matches!(c.command, ResourceCommand::UseResources { .. }))
            .count();
        let report = FrameReport {
            frame: number,
            pass_count,
            culled_passes,
            encoder_count: runs.len(),
            submission_count: submission.submissions.len(),
            fence_count: plan.fences.len(),
            barrier_count,
            residency_count,
            compacted_command_count: compacted.iter().map(Vec::len).sum(),
            reduce: reduce_stats,
            alias_pair_count: analysis.alias_pairs.len(),
        };
        log::debug!(
            "frame {number}: {} pass(es), {} encoder(s), {} fence(s), {} barrier(s)",
            report.pass_count,
            report.encoder_count,
            report.fence_count,
            report.barrier_count
        );
        Ok(report)
    }
}

/// Runs pass executors on scoped worker threads.
///
/// Workers pull pass indices from a shared counter; each records into its
/// own encoder, so the only shared state is the registries behind their
/// read lock.
fn record_passes(
    graph: &RenderGraph,
    executors: Vec<(PassKind, Executor)>,
) -> Vec<RecordedPass> {
    let count = executors.len();
    if count == 0 {
        return Vec::new();
    }

    let workers = graph
        .options
        .recording_threads
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
        .clamp(1, count);

    if workers == 1 {
        return executors
            .into_iter()
            .map(|(kind, executor)| {
                let mut encoder = PassEncoder::new(kind, &graph.persistent, &graph.transient);
                executor(&mut encoder);
                encoder.finish()
            })
            .collect();
    }

    let tasks: Vec<Mutex<Option<(PassKind, Executor)>>> = executors
        .into_iter()
        .map(|task| Mutex::new(Some(task)))
        .collect();
    let results: Vec<Mutex<Option<RecordedPass>>> = (0..count).map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, AtomicOrdering::Relaxed);
                    if index >= count {
                        break;
                    }
                    let Some((kind, executor)) = tasks[index].lock().take() else {
                        continue;
                    };
                    let mut encoder =
                        PassEncoder::new(kind, &graph.persistent, &graph.transient);
                    executor(&mut encoder);
                    *results[index].lock() = Some(encoder.finish());
                }
            });
        }
    });

    results
        .into_iter()
        .map(|slot| slot.into_inner().unwrap_or_default())
        .collect()
}

fn texture_aspect(
    persistent: &PersistentRegistry,
    transient: &TransientRegistry,
    handle: ResourceHandle,
) -> Option<bool> {
    if handle.kind() != ResourceKind::Texture {
        return None;
    }
    let descriptor = if handle.is_transient() {
        transient.descriptor_of(handle).ok()?
    } else {
        persistent.descriptor_of(handle).ok()?
    };
    match descriptor {
        ResourceDescriptor::Texture(t) => Some(t.pixel_format.is_depth_stencil()),
        _ => None,
    }
}

/// Memoryless textures are tile-local: every usage must stay inside a single
/// encoder. Violations assert in debug and are logged in release.
fn validate_memoryless(
    records: &[PassRecord],
    runs: &[schedule::EncoderRun],
    persistent: &PersistentRegistry,
    transient: &TransientRegistry,
) {
    let mut encoders_per_resource: FxHashMap<ResourceHandle, FxHashSet<u32>> = FxHashMap::default();
    for run in runs {
        for &pass_index in &run.passes {
            for usage in &records[pass_index as usize].usages {
                encoders_per_resource
                    .entry(usage.resource)
                    .or_default()
                    .insert(run.index);
            }
        }
    }

    for (handle, encoders) in &encoders_per_resource {
        if encoders.len() <= 1 {
            continue;
        }
        let memoryless = if handle.is_transient() {
            transient.is_memoryless(*handle).unwrap_or(false)
        } else {
            matches!(
                persistent.descriptor_of(*handle),
                Ok(ResourceDescriptor::Texture(t)) if t.storage_mode == StorageMode::Memoryless
            )
        };
        if memoryless {
            debug_assert!(
                false,
                "memoryless texture {handle:?} is used across {} encoders",
                encoders.len()
            );
            log::error!(
                "memoryless texture {handle:?} used across {} encoders; contents will not survive",
                encoders.len()
            );
        }
    }
}

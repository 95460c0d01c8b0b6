//! Persistent Resource Registry
//!
//! The registry owns every persistent GPU resource: a slot table indexed by
//! handle, guarded by a single reader-writer lock. Reads (handle resolution
//! during parallel pass recording) take the shared lock; every mutation takes
//! the exclusive lock. Entities never hold references to each other — only
//! handles — so the registry is the single owner and generation checks make
//! stale access detection a table lookup.
//!
//! # Lifecycle
//!
//! - `allocate_*` materializes backing memory immediately; materialization
//!   never partially succeeds.
//! - `dispose` invalidates the handle at once (generation bump) but defers
//!   the backing release until the last command buffer that could reference
//!   the slot has completed.
//! - Purgeability transitions are batched and flushed on frame retire.

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::backend::{Backend, BackingId};
use crate::error::{Result, WeftError};
use crate::handle::{MAX_GENERATION, RegistryKind, ResourceHandle, ResourceKind};
use crate::resource::descriptor::{
    BufferDescriptor, HeapDescriptor, PurgeableState, ResourceDescriptor, StorageMode,
    TextureDescriptor,
};
use crate::resource::heap::HeapSuballocator;

/// How a slot's GPU memory came to be.
#[derive(Debug, Clone)]
enum SlotBacking {
    /// Materialized by this registry; released by it.
    Owned(BackingId),
    /// Wrapped from an externally-owned object; never released here.
    Imported(BackingId),
    /// Placed inside a heap; lifetime borrowed from the heap.
    Placed { heap: ResourceHandle, offset: u64 },
}

#[derive(Debug)]
struct Slot {
    kind: ResourceKind,
    descriptor: Option<ResourceDescriptor>,
    backing: Option<SlotBacking>,
    generation: u32,
    live: bool,
    /// Imported or explicitly marked: a culling sink for the scheduler.
    external_sink: bool,
    /// Placement cursor for heap-kind slots.
    heap: Option<HeapSuballocator>,
}

#[derive(Debug)]
struct DeferredRelease {
    backing: BackingId,
    /// The release may fire once frames up to this number have completed.
    submitted_frame: u64,
}

/// Result of one flushed purgeability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeFlush {
    pub handle: ResourceHandle,
    pub previous: PurgeableState,
    /// `true` when an `Empty → NonVolatile` transition found the contents
    /// already discarded.
    pub was_emptied: bool,
}

#[derive(Default)]
struct Tables {
    slots: Vec<Slot>,
    free: Vec<u32>,
    deferred: Vec<DeferredRelease>,
    pending_purges: Vec<(ResourceHandle, PurgeableState)>,
}

/// Reader-writer-locked table of persistent resources.
pub struct PersistentRegistry {
    backend: Arc<dyn Backend>,
    inner: RwLock<Tables>,
}

impl PersistentRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            inner: RwLock::new(Tables::default()),
        }
    }

    // ── Allocation ─────────────────────────────────────────────────────────

    /// Materializes a buffer. Fails with `OutOfMemory` without partial state.
    pub fn allocate_buffer(&self, desc: BufferDescriptor) -> Result<ResourceHandle> {
        if desc.storage_mode == StorageMode::Memoryless {
            return Err(WeftError::Validation(
                "memoryless storage is legal only for textures".into(),
            ));
        }
        let backing = self
            .backend
            .materialize_buffer(&desc)
            .ok_or(WeftError::OutOfMemory { retried: false })?;
        Ok(self.insert(
            ResourceKind::Buffer,
            Some(ResourceDescriptor::Buffer(desc)),
            SlotBacking::Owned(backing),
            None,
        ))
    }

    /// Materializes a texture.
    pub fn allocate_texture(&self, desc: TextureDescriptor) -> Result<ResourceHandle> {
        self.validate_texture(&desc)?;
        let backing = self
            .backend
            .materialize_texture(&desc)
            .ok_or(WeftError::OutOfMemory { retried: false })?;
        Ok(self.insert(
            ResourceKind::Texture,
            Some(ResourceDescriptor::Texture(desc)),
            SlotBacking::Owned(backing),
            None,
        ))
    }

    /// Materializes a heap for later placement.
    pub fn allocate_heap(&self, desc: HeapDescriptor) -> Result<ResourceHandle> {
        if desc.storage_mode == StorageMode::Memoryless {
            return Err(WeftError::Validation(
                "memoryless storage is legal only for textures".into(),
            ));
        }
        let backing = self
            .backend
            .materialize_heap(&desc)
            .ok_or(WeftError::OutOfMemory { retried: false })?;
        let allocator = HeapSuballocator::new(desc.size);
        Ok(self.insert(
            ResourceKind::Heap,
            Some(ResourceDescriptor::Heap(desc)),
            SlotBacking::Owned(backing),
            Some(allocator),
        ))
    }

    /// Creates a sampler slot. Samplers carry no backing memory of their own.
    pub fn allocate_sampler(&self) -> ResourceHandle {
        self.insert(ResourceKind::Sampler, None, SlotBacking::Imported(BackingId(0)), None)
    }

    /// Places a buffer inside `heap`, borrowing the heap's lifetime.
    pub fn place_buffer(
        &self,
        heap: ResourceHandle,
        desc: BufferDescriptor,
    ) -> Result<ResourceHandle> {
        let (size, align) = self.backend.size_and_alignment_for_buffer(&desc);
        let offset = self.place(heap, size, align)?;
        Ok(self.insert(
            ResourceKind::Buffer,
            Some(ResourceDescriptor::Buffer(desc)),
            SlotBacking::Placed { heap, offset },
            None,
        ))
    }

    /// Places a texture inside `heap`.
    pub fn place_texture(
        &self,
        heap: ResourceHandle,
        desc: TextureDescriptor,
    ) -> Result<ResourceHandle> {
        self.validate_texture(&desc)?;
        let (size, align) = self.backend.size_and_alignment_for_texture(&desc);
        let offset = self.place(heap, size, align)?;
        Ok(self.insert(
            ResourceKind::Texture,
            Some(ResourceDescriptor::Texture(desc)),
            SlotBacking::Placed { heap, offset },
            None,
        ))
    }

    /// Wraps an externally-owned buffer without taking ownership.
    ///
    /// Imported resources are culling sinks: passes writing them are always
    /// considered externally consumed.
    pub fn import_buffer(&self, backing: BackingId, desc: BufferDescriptor) -> ResourceHandle {
        self.insert(
            ResourceKind::Buffer,
            Some(ResourceDescriptor::Buffer(desc)),
            SlotBacking::Imported(backing),
            None,
        )
    }

    /// Wraps an externally-owned texture (swapchain images and the like).
    pub fn import_texture(&self, backing: BackingId, desc: TextureDescriptor) -> ResourceHandle {
        self.insert(
            ResourceKind::Texture,
            Some(ResourceDescriptor::Texture(desc)),
            SlotBacking::Imported(backing),
            None,
        )
    }

    // ── Mutation ───────────────────────────────────────────────────────────

    /// Atomically swaps the slot's backing, returning the previous one.
    ///
    /// The replacement must have been materialized against an equal
    /// descriptor; a mismatch fails without mutating the slot.
    pub fn replace_backing(
        &self,
        handle: ResourceHandle,
        new: BackingId,
        desc: &ResourceDescriptor,
    ) -> Result<BackingId> {
        let mut tables = self.inner.write();
        let slot = resolve_slot_mut(&mut tables.slots, handle)?;
        if slot.descriptor.as_ref() != Some(desc) {
            return Err(WeftError::DescriptorMismatch(format!(
                "slot {:?} was created with a different descriptor",
                handle
            )));
        }
        let old = match slot.backing.replace(SlotBacking::Owned(new)) {
            Some(SlotBacking::Owned(id) | SlotBacking::Imported(id)) => id,
            Some(SlotBacking::Placed { .. }) | None => {
                return Err(WeftError::DescriptorMismatch(
                    "heap-placed resources cannot have their backing replaced".into(),
                ));
            }
        };
        Ok(old)
    }

    /// Marks the slot for deferred release and invalidates the handle now.
    ///
    /// `submitted_frame` is the highest frame number whose command buffers
    /// may still reference the slot; the backing is released only after that
    /// frame completes.
    pub fn dispose(&self, handle: ResourceHandle, submitted_frame: u64) -> Result<()> {
        let mut tables = self.inner.write();
        let index = handle.index();
        let slot = resolve_slot_mut(&mut tables.slots, handle)?;
        slot.live = false;
        let backing = slot.backing.take();
        let recyclable = slot.generation < MAX_GENERATION;
        slot.generation += 1;
        debug_assert!(
            slot.generation <= MAX_GENERATION,
            "generation counter wrapped for slot {index}"
        );

        if let Some(SlotBacking::Owned(id)) = backing {
            tables.deferred.push(DeferredRelease {
                backing: id,
                submitted_frame,
            });
        }
        if recyclable {
            tables.free.push(index);
        }
        Ok(())
    }

    /// Marks a resource as externally consumed (a culling sink) even though
    /// it was allocated rather than imported.
    pub fn mark_external(&self, handle: ResourceHandle) -> Result<()> {
        let mut tables = self.inner.write();
        resolve_slot_mut(&mut tables.slots, handle)?.external_sink = true;
        Ok(())
    }

    // ── Resolution ─────────────────────────────────────────────────────────

    /// Validates `handle` and returns its backing id.
    pub fn backing_of(&self, handle: ResourceHandle) -> Result<BackingId> {
        let tables = self.inner.read();
        let slot = resolve_slot(&tables.slots, handle)?;
        match &slot.backing {
            Some(SlotBacking::Owned(id) | SlotBacking::Imported(id)) => Ok(*id),
            Some(SlotBacking::Placed { heap, .. }) => {
                let heap_slot = resolve_slot(&tables.slots, *heap)?;
                match &heap_slot.backing {
                    Some(SlotBacking::Owned(id) | SlotBacking::Imported(id)) => Ok(*id),
                    _ => Err(WeftError::InvalidHandle(*heap)),
                }
            }
            None => Err(WeftError::InvalidHandle(handle)),
        }
    }

    /// Validates `handle` without resolving the backing.
    pub fn validate(&self, handle: ResourceHandle) -> Result<()> {
        let tables = self.inner.read();
        resolve_slot(&tables.slots, handle).map(|_| ())
    }

    /// Clones the slot's creation descriptor.
    pub fn descriptor_of(&self, handle: ResourceHandle) -> Result<ResourceDescriptor> {
        let tables = self.inner.read();
        resolve_slot(&tables.slots, handle)?
            .descriptor
            .clone()
            .ok_or(WeftError::InvalidHandle(handle))
    }

    /// `true` when writes to the resource must never be culled.
    #[must_use]
    pub fn is_external_sink(&self, handle: ResourceHandle) -> bool {
        let tables = self.inner.read();
        resolve_slot(&tables.slots, handle).is_ok_and(|s| s.external_sink)
    }

    /// Bytes consumed inside a heap slot.
    pub fn heap_used_size(&self, heap: ResourceHandle) -> Result<u64> {
        let tables = self.inner.read();
        let slot = resolve_slot(&tables.slots, heap)?;
        slot.heap
            .as_ref()
            .map(HeapSuballocator::used_size)
            .ok_or(WeftError::InvalidHandle(heap))
    }

    /// Largest placement that still fits in a heap slot at `alignment`.
    pub fn heap_max_available(&self, heap: ResourceHandle, alignment: u64) -> Result<u64> {
        let tables = self.inner.read();
        let slot = resolve_slot(&tables.slots, heap)?;
        slot.heap
            .as_ref()
            .map(|h| h.max_available_size(alignment))
            .ok_or(WeftError::InvalidHandle(heap))
    }

    // ── Purgeability ───────────────────────────────────────────────────────

    /// Enqueues a purgeability transition; applied on the next retire flush.
    pub fn set_purgeable(&self, handle: ResourceHandle, state: PurgeableState) -> Result<()> {
        let mut tables = self.inner.write();
        resolve_slot(&tables.slots, handle)?;
        tables.pending_purges.push((handle, state));
        Ok(())
    }

    /// Applies all batched purgeability transitions.
    pub fn flush_purgeables(&self) -> Vec<PurgeFlush> {
        let pending = {
            let mut tables = self.inner.write();
            std::mem::take(&mut tables.pending_purges)
        };
        let mut flushed = Vec::with_capacity(pending.len());
        for (handle, state) in pending {
            let Ok(backing) = self.backing_of(handle) else {
                // Disposed between enqueue and flush; nothing to transition.
                continue;
            };
            let previous = self.backend.set_purgeable(backing, state);
            let was_emptied =
                previous == PurgeableState::Empty && state == PurgeableState::NonVolatile;
            if was_emptied {
                log::debug!("purgeable restore found {handle:?} already emptied");
            }
            flushed.push(PurgeFlush {
                handle,
                previous,
                was_emptied,
            });
        }
        flushed
    }

    // ── Device-loss recovery ───────────────────────────────────────────────

    /// Re-materializes every owned backing from its stored descriptor.
    ///
    /// Called after `DeviceLost`: the old backings are gone at the API
    /// level, so they are released and replaced wholesale. Handles stay
    /// valid — only the backing objects change.
    pub fn rematerialize_all(&self) -> Result<()> {
        let targets: Vec<(u32, ResourceDescriptor)> = {
            let tables = self.inner.read();
            tables
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| {
                    slot.live && matches!(slot.backing, Some(SlotBacking::Owned(_)))
                })
                .filter_map(|(i, slot)| slot.descriptor.clone().map(|d| (i as u32, d)))
                .collect()
        };

        for (index, descriptor) in targets {
            let fresh = match &descriptor {
                ResourceDescriptor::Buffer(d) => self.backend.materialize_buffer(d),
                ResourceDescriptor::Texture(d) => self.backend.materialize_texture(d),
                ResourceDescriptor::Heap(d) => self.backend.materialize_heap(d),
            }
            .ok_or(WeftError::OutOfMemory { retried: false })?;

            let old = {
                let mut tables = self.inner.write();
                let slot = &mut tables.slots[index as usize];
                slot.backing.replace(SlotBacking::Owned(fresh))
            };
            if let Some(SlotBacking::Owned(old)) = old {
                self.backend.release(old);
            }
        }
        Ok(())
    }

    // ── Retirement ─────────────────────────────────────────────────────────

    /// Releases every deferred backing whose frame has completed.
    pub fn release_completed(&self, completed_frame: u64) {
        let ready: SmallVec<[BackingId; 8]> = {
            let mut tables = self.inner.write();
            let mut ready = SmallVec::new();
            tables.deferred.retain(|d| {
                if d.submitted_frame <= completed_frame {
                    ready.push(d.backing);
                    false
                } else {
                    true
                }
            });
            ready
        };
        for backing in ready {
            self.backend.release(backing);
        }
    }

    /// Number of live slots (diagnostics).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.read().slots.iter().filter(|s| s.live).count()
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn validate_texture(&self, desc: &TextureDescriptor) -> Result<()> {
        if desc.storage_mode == StorageMode::Memoryless
            && !self.backend.supports_memoryless_attachments()
        {
            return Err(WeftError::Validation(
                "backend does not support memoryless attachments".into(),
            ));
        }
        if !self.backend.supports_pixel_format(desc.pixel_format, desc.usage) {
            return Err(WeftError::Validation(format!(
                "pixel format {:?} does not support usage {:?}",
                desc.pixel_format, desc.usage
            )));
        }
        Ok(())
    }

    fn place(&self, heap: ResourceHandle, size: u64, align: u64) -> Result<u64> {
        let mut tables = self.inner.write();
        let slot = resolve_slot_mut(&mut tables.slots, heap)?;
        let allocator = slot
            .heap
            .as_mut()
            .ok_or(WeftError::InvalidHandle(heap))?;
        allocator
            .allocate(size, align)
            .ok_or(WeftError::OutOfMemory { retried: false })
    }

    fn insert(
        &self,
        kind: ResourceKind,
        descriptor: Option<ResourceDescriptor>,
        backing: SlotBacking,
        heap: Option<HeapSuballocator>,
    ) -> ResourceHandle {
        let external_sink = matches!(backing, SlotBacking::Imported(_));
        let mut tables = self.inner.write();
        if let Some(index) = tables.free.pop() {
            let slot = &mut tables.slots[index as usize];
            let generation = slot.generation;
            *slot = Slot {
                kind,
                descriptor,
                backing: Some(backing),
                generation,
                live: true,
                external_sink,
                heap,
            };
            ResourceHandle::new_persistent(kind, index, generation)
        } else {
            let index = tables.slots.len() as u32;
            tables.slots.push(Slot {
                kind,
                descriptor,
                backing: Some(backing),
                generation: 1,
                live: true,
                external_sink,
                heap,
            });
            ResourceHandle::new_persistent(kind, index, 1)
        }
    }
}

fn resolve_slot<'t>(slots: &'t [Slot], handle: ResourceHandle) -> Result<&'t Slot> {
    if handle.is_null() || handle.registry() != RegistryKind::Persistent {
        return Err(WeftError::InvalidHandle(handle));
    }
    let slot = slots
        .get(handle.index() as usize)
        .ok_or(WeftError::InvalidHandle(handle))?;
    if !slot.live || slot.generation != handle.generation() || slot.kind != handle.kind() {
        return Err(WeftError::InvalidHandle(handle));
    }
    Ok(slot)
}

fn resolve_slot_mut<'t>(slots: &'t mut [Slot], handle: ResourceHandle) -> Result<&'t mut Slot> {
    if handle.is_null() || handle.registry() != RegistryKind::Persistent {
        return Err(WeftError::InvalidHandle(handle));
    }
    let index = handle.index() as usize;
    let slot = slots
        .get_mut(index)
        .ok_or(WeftError::InvalidHandle(handle))?;
    if !slot.live || slot.generation != handle.generation() || slot.kind != handle.kind() {
        return Err(WeftError::InvalidHandle(handle));
    }
    Ok(slot)
}

//! Transient Resource Arenas
//!
//! One registry per in-flight frame slot. Transient resources are declared
//! during frame building, receive their memory lazily once the dependency
//! builder has computed encoder lifetime intervals, and die at frame retire.
//!
//! # Memory strategy
//!
//! Each slot owns a single linear arena backing. Placement is a bump with
//! optional *aliasing*: two resources whose `[first_encoder, last_encoder]`
//! intervals do not intersect may share an offset. A shared endpoint counts
//! as an intersection (the earlier resource is still live in that encoder).
//!
//! The arena grows to the frame's high-water mark and is retained across
//! frames for reuse; [`TransientRegistry::trim`] returns memory to the OS
//! once a slot has sat idle past the configured quiescence delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::backend::{Backend, BackingId};
use crate::error::{Result, WeftError};
use crate::handle::{MAX_GENERATION, RegistryKind, ResourceHandle, ResourceKind};
use crate::resource::descriptor::{
    BufferDescriptor, HeapDescriptor, ResourceDescriptor, StorageMode, TextureDescriptor,
};

/// Encoder-index lifetime of a transient resource within one frame.
pub type EncoderInterval = (u32, u32);

#[derive(Debug)]
struct TransientEntry {
    kind: ResourceKind,
    descriptor: ResourceDescriptor,
    size: u64,
    align: u64,
    offset: Option<u64>,
}

#[derive(Debug)]
struct ArenaState {
    backing: Option<BackingId>,
    capacity: u64,
    last_active: Instant,
}

#[derive(Debug)]
struct FrameSlot {
    /// Generation stamped into handles issued this cycle; bumped on retire
    /// so stale handles from previous frames fail resolution.
    epoch: u32,
    entries: Vec<TransientEntry>,
    arena: ArenaState,
}

/// Per-frame-slot transient allocator.
///
/// Single-writer: only the thread driving the frame mutates a slot, per the
/// runtime's concurrency contract. Reads during parallel pass recording go
/// through [`validate`](Self::validate) and [`descriptor_of`](Self::descriptor_of).
pub struct TransientRegistry {
    backend: Arc<dyn Backend>,
    slots: Vec<FrameSlot>,
}

impl TransientRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, in_flight: usize) -> Self {
        let now = Instant::now();
        let slots = (0..in_flight)
            .map(|_| FrameSlot {
                epoch: 1,
                entries: Vec::new(),
                arena: ArenaState {
                    backing: None,
                    capacity: 0,
                    last_active: now,
                },
            })
            .collect();
        Self { backend, slots }
    }

    // ── Declaration ────────────────────────────────────────────────────────

    /// Declares a transient buffer for the frame occupying `slot`.
    ///
    /// No memory is assigned yet; materialization happens at commit once
    /// lifetimes are known.
    pub fn create_buffer(&mut self, slot: u8, desc: BufferDescriptor) -> Result<ResourceHandle> {
        if desc.storage_mode == StorageMode::Memoryless {
            return Err(WeftError::Validation(
                "memoryless storage is legal only for textures".into(),
            ));
        }
        let (size, align) = self.backend.size_and_alignment_for_buffer(&desc);
        Ok(self.push_entry(
            slot,
            ResourceKind::Buffer,
            ResourceDescriptor::Buffer(desc),
            size,
            align,
        ))
    }

    /// Declares a transient texture for the frame occupying `slot`.
    pub fn create_texture(&mut self, slot: u8, desc: TextureDescriptor) -> Result<ResourceHandle> {
        if desc.storage_mode == StorageMode::Memoryless
            && !self.backend.supports_memoryless_attachments()
        {
            return Err(WeftError::Validation(
                "backend does not support memoryless attachments".into(),
            ));
        }
        let (size, align) = self.backend.size_and_alignment_for_texture(&desc);
        // Memoryless textures are tile-local: they occupy no arena bytes.
        let size = if desc.storage_mode == StorageMode::Memoryless { 0 } else { size };
        Ok(self.push_entry(
            slot,
            ResourceKind::Texture,
            ResourceDescriptor::Texture(desc),
            size,
            align,
        ))
    }

    // ── Resolution ─────────────────────────────────────────────────────────

    /// Validates a transient handle against the slot's current epoch.
    pub fn validate(&self, handle: ResourceHandle) -> Result<()> {
        self.entry(handle).map(|_| ())
    }

    /// Clones the creation descriptor.
    pub fn descriptor_of(&self, handle: ResourceHandle) -> Result<ResourceDescriptor> {
        self.entry(handle).map(|e| e.descriptor.clone())
    }

    /// Offset assigned at materialization; `None` for culled resources.
    pub fn offset_of(&self, handle: ResourceHandle) -> Result<Option<u64>> {
        self.entry(handle).map(|e| e.offset)
    }

    /// `true` when the resource's storage mode is memoryless.
    pub fn is_memoryless(&self, handle: ResourceHandle) -> Result<bool> {
        self.entry(handle)
            .map(|e| e.descriptor.storage_mode() == StorageMode::Memoryless)
    }

    // ── Materialization ────────────────────────────────────────────────────

    /// Assigns arena offsets for the frame's used transients.
    ///
    /// `intervals[i]` is the encoder lifetime of entry `i`, or `None` when
    /// the resource went unused (it then gets no memory at all). With
    /// `alias` set, non-overlapping intervals share offsets.
    pub fn materialize(
        &mut self,
        slot: u8,
        intervals: &[Option<EncoderInterval>],
        alias: bool,
    ) -> Result<()> {
        let frame = &mut self.slots[slot as usize];
        debug_assert_eq!(intervals.len(), frame.entries.len());

        // Place in first-use order so earlier lifetimes free blocks for
        // later ones.
        let mut order: SmallVec<[usize; 16]> = (0..frame.entries.len())
            .filter(|&i| intervals[i].is_some())
            .collect();
        order.sort_unstable_by_key(|&i| intervals[i].map(|iv| iv.0));

        // (offset, size, last_use_encoder) of blocks eligible for reuse.
        let mut blocks: Vec<(u64, u64, u32)> = Vec::new();
        let mut cursor = 0u64;

        for &i in &order {
            let Some((first, last)) = intervals[i] else {
                continue;
            };
            let entry = &mut frame.entries[i];
            if entry.size == 0 {
                entry.offset = Some(0);
                continue;
            }

            let reuse = if alias {
                blocks
                    .iter_mut()
                    .find(|(off, size, free_after)| {
                        *free_after < first && *size >= entry.size && off % entry.align == 0
                    })
                    .map(|block| {
                        block.2 = last;
                        block.0
                    })
            } else {
                None
            };

            let offset = match reuse {
                Some(offset) => offset,
                None => {
                    let offset = cursor.next_multiple_of(entry.align.max(1));
                    cursor = offset + entry.size;
                    blocks.push((offset, entry.size, last));
                    offset
                }
            };
            entry.offset = Some(offset);
        }

        self.ensure_capacity(slot, cursor)
    }

    /// Number of transient resources declared this cycle.
    #[must_use]
    pub fn entry_count(&self, slot: u8) -> usize {
        self.slots[slot as usize].entries.len()
    }

    /// Backing of the slot's arena, if any frame has materialized into it.
    #[must_use]
    pub fn arena_backing(&self, slot: u8) -> Option<BackingId> {
        self.slots[slot as usize].arena.backing
    }

    /// Current arena capacity in bytes.
    #[must_use]
    pub fn arena_capacity(&self, slot: u8) -> u64 {
        self.slots[slot as usize].arena.capacity
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    /// Retires the slot after its command buffers complete: invalidates all
    /// handles issued this cycle and resets the placement state.
    ///
    /// The arena backing is retained for reuse; see [`trim`](Self::trim).
    pub fn cycle(&mut self, slot: u8) {
        let frame = &mut self.slots[slot as usize];
        debug_assert!(
            frame.epoch < MAX_GENERATION,
            "transient epoch wrapped for slot {slot}"
        );
        frame.epoch = (frame.epoch % MAX_GENERATION) + 1;
        frame.entries.clear();
        frame.arena.last_active = Instant::now();
    }

    /// Releases arena backings idle for longer than `quiescence`.
    ///
    /// Returns the number of bytes returned to the OS.
    pub fn trim(&mut self, now: Instant, quiescence: Duration) -> u64 {
        let mut released = 0;
        for frame in &mut self.slots {
            if frame.entries.is_empty()
                && frame.arena.backing.is_some()
                && now.duration_since(frame.arena.last_active) >= quiescence
            {
                if let Some(backing) = frame.arena.backing.take() {
                    self.backend.release(backing);
                }
                released += frame.arena.capacity;
                log::debug!(
                    "transient arena released {} bytes after quiescence",
                    frame.arena.capacity
                );
                frame.arena.capacity = 0;
            }
        }
        released
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn push_entry(
        &mut self,
        slot: u8,
        kind: ResourceKind,
        descriptor: ResourceDescriptor,
        size: u64,
        align: u64,
    ) -> ResourceHandle {
        let frame = &mut self.slots[slot as usize];
        let index = frame.entries.len() as u32;
        frame.entries.push(TransientEntry {
            kind,
            descriptor,
            size,
            align: align.max(1),
            offset: None,
        });
        frame.arena.last_active = Instant::now();
        ResourceHandle::new_transient(kind, slot, index, frame.epoch)
    }

    fn entry(&self, handle: ResourceHandle) -> Result<&TransientEntry> {
        let RegistryKind::Transient(slot) = handle.registry() else {
            return Err(WeftError::InvalidHandle(handle));
        };
        let frame = self
            .slots
            .get(slot as usize)
            .ok_or(WeftError::InvalidHandle(handle))?;
        if handle.generation() != frame.epoch {
            return Err(WeftError::InvalidHandle(handle));
        }
        let entry = frame
            .entries
            .get(handle.index() as usize)
            .ok_or(WeftError::InvalidHandle(handle))?;
        if entry.kind != handle.kind() {
            return Err(WeftError::InvalidHandle(handle));
        }
        Ok(entry)
    }

    fn ensure_capacity(&mut self, slot: u8, required: u64) -> Result<()> {
        let frame = &mut self.slots[slot as usize];
        if required > frame.arena.capacity {
            if let Some(old) = frame.arena.backing.take() {
                // The slot was retired before this frame reused it, so no
                // in-flight command buffer can still reference the backing.
                self.backend.release(old);
            }
            let capacity = required.next_power_of_two();
            let backing = self
                .backend
                .materialize_heap(&HeapDescriptor {
                    size: capacity,
                    ..Default::default()
                })
                .ok_or(WeftError::OutOfMemory { retried: false })?;
            log::debug!("transient arena for slot {slot} grown to {capacity} bytes");
            frame.arena.backing = Some(backing);
            frame.arena.capacity = capacity;
        }
        frame.arena.last_active = Instant::now();
        Ok(())
    }
}

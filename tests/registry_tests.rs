//! Resource Registry Tests
//!
//! Tests for:
//! - handle generations: dispose invalidates, slots recycle, no resurrection
//! - deferred release: backings outlive every frame that references them
//! - replace_backing descriptor checks
//! - out-of-memory retry policy
//! - purgeability batching and the Empty → NonVolatile report
//! - heap placement: alignment, accounting, exhaustion
//! - memoryless storage validation

use std::sync::Arc;

use weft::resource::PersistentRegistry;
use weft::{
    AccessFlags, Backend, BufferDescriptor, HeadlessBackend, PassDesc, PixelFormat,
    PurgeableState, RenderGraph, StageFlags, StorageMode, TextureDescriptor, UsageHint, WeftError,
};

fn buffer(length: u64) -> BufferDescriptor {
    BufferDescriptor {
        length,
        ..Default::default()
    }
}

// ============================================================================
// Generations
// ============================================================================

#[test]
fn dispose_invalidates_the_handle_immediately() {
    let backend = Arc::new(HeadlessBackend::new());
    let registry = PersistentRegistry::new(backend);
    let handle = registry.allocate_buffer(buffer(64)).unwrap();

    assert!(registry.validate(handle).is_ok());
    registry.dispose(handle, 0).unwrap();
    assert!(matches!(
        registry.validate(handle),
        Err(WeftError::InvalidHandle(_))
    ));
}

#[test]
fn recycled_slot_gets_a_newer_generation() {
    let backend = Arc::new(HeadlessBackend::new());
    let registry = PersistentRegistry::new(backend);

    let first = registry.allocate_buffer(buffer(64)).unwrap();
    registry.dispose(first, 0).unwrap();
    let second = registry.allocate_buffer(buffer(64)).unwrap();

    assert_eq!(first.index(), second.index(), "slot is recycled");
    assert!(second.generation() > first.generation(), "generation only grows");
    assert!(registry.validate(first).is_err(), "the old handle stays dead");
    assert!(registry.validate(second).is_ok());
}

// ============================================================================
// Deferred release
// ============================================================================

#[test]
fn disposed_backing_survives_until_its_frame_completes() {
    let backend = Arc::new(HeadlessBackend::new());
    let registry = PersistentRegistry::new(backend.clone());
    let handle = registry.allocate_buffer(buffer(4096)).unwrap();
    assert_eq!(backend.live_backing_count(), 1);

    // Frame 3 may still reference the buffer.
    registry.dispose(handle, 3).unwrap();
    registry.release_completed(2);
    assert_eq!(backend.live_backing_count(), 1, "frame 3 has not completed");

    registry.release_completed(3);
    assert_eq!(backend.live_backing_count(), 0);
}

#[test]
fn dispose_through_the_graph_releases_after_retire() {
    let backend = Arc::new(HeadlessBackend::new());
    let mut graph = RenderGraph::new(backend.clone());

    let target = graph.create_buffer(buffer(1024)).unwrap();
    let mut frame = graph.begin_frame().unwrap();
    frame.add_pass(PassDesc::compute("touch"), move |enc| {
        enc.use_resource(target, AccessFlags::WRITE, StageFlags::COMPUTE);
        enc.dispatch([1, 1, 1]);
    });
    frame.commit().unwrap();

    graph.dispose(target).unwrap();
    assert_eq!(backend.live_backing_count(), 1, "release is deferred");

    // Submitting and retiring a later frame carries the release point.
    graph.begin_frame().unwrap().commit().unwrap();
    graph.begin_frame().unwrap();
    assert_eq!(backend.live_backing_count(), 0);
}

// ============================================================================
// replace_backing
// ============================================================================

#[test]
fn replace_backing_swaps_and_returns_the_old() {
    let backend = Arc::new(HeadlessBackend::new());
    let registry = PersistentRegistry::new(backend.clone());

    let desc = buffer(256);
    let handle = registry.allocate_buffer(desc.clone()).unwrap();
    let old = registry.backing_of(handle).unwrap();

    let fresh = backend.materialize_buffer(&desc).unwrap();
    let returned = registry
        .replace_backing(handle, fresh, &weft::resource::ResourceDescriptor::Buffer(desc))
        .unwrap();

    assert_eq!(returned, old);
    assert_eq!(registry.backing_of(handle).unwrap(), fresh);
}

#[test]
fn replace_backing_rejects_descriptor_mismatch() {
    let backend = Arc::new(HeadlessBackend::new());
    let registry = PersistentRegistry::new(backend.clone());

    let handle = registry.allocate_buffer(buffer(256)).unwrap();
    let other = backend.materialize_buffer(&buffer(512)).unwrap();
    let err = registry
        .replace_backing(
            handle,
            other,
            &weft::resource::ResourceDescriptor::Buffer(buffer(512)),
        )
        .unwrap_err();
    assert!(matches!(err, WeftError::DescriptorMismatch(_)));
    // The slot is untouched.
    assert!(registry.validate(handle).is_ok());
}

// ============================================================================
// Out of memory
// ============================================================================

#[test]
fn oom_is_retried_once_then_surfaced() {
    let backend = Arc::new(HeadlessBackend::new());
    backend.set_memory_budget(Some(1024));
    let mut graph = RenderGraph::new(backend);

    assert!(graph.create_buffer(buffer(512)).is_ok());
    let err = graph.create_buffer(buffer(1024)).unwrap_err();
    assert!(
        matches!(err, WeftError::OutOfMemory { retried: true }),
        "the second failure reports the retry"
    );
}

// ============================================================================
// Purgeability
// ============================================================================

#[test]
fn purgeable_restore_reports_emptied_contents() {
    let backend = Arc::new(HeadlessBackend::new());
    let registry = PersistentRegistry::new(backend);
    let handle = registry.allocate_buffer(buffer(64)).unwrap();

    registry.set_purgeable(handle, PurgeableState::Empty).unwrap();
    let first = registry.flush_purgeables();
    assert_eq!(first.len(), 1);
    assert!(!first[0].was_emptied);

    registry
        .set_purgeable(handle, PurgeableState::NonVolatile)
        .unwrap();
    let second = registry.flush_purgeables();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].previous, PurgeableState::Empty);
    assert!(second[0].was_emptied, "restoring emptied contents is reported");

    // The batch is consumed by the flush.
    assert!(registry.flush_purgeables().is_empty());
}

// ============================================================================
// Heaps
// ============================================================================

#[test]
fn heap_placements_are_aligned_and_accounted() {
    let backend = Arc::new(HeadlessBackend::new());
    let mut graph = RenderGraph::new(backend.clone());

    let heap = graph
        .create_heap(weft::HeapDescriptor {
            size: 1 << 20,
            ..Default::default()
        })
        .unwrap();
    let before = backend.live_backing_count();

    let a = graph.place_buffer(heap, buffer(1000)).unwrap();
    let b = graph.place_buffer(heap, buffer(1000)).unwrap();
    assert!(graph.persistent().validate(a).is_ok());
    assert!(graph.persistent().validate(b).is_ok());

    // Placed resources share the heap's backing: no new device allocations.
    assert_eq!(backend.live_backing_count(), before);

    // Two 1000-byte placements at 256-byte alignment.
    assert_eq!(graph.persistent().heap_used_size(heap).unwrap(), 1024 + 1000);
    let available = graph.persistent().heap_max_available(heap, 256).unwrap();
    assert!(available < (1 << 20) - 2000);

    // Placed resources resolve to the heap's backing.
    assert_eq!(
        graph.persistent().backing_of(a).unwrap(),
        graph.persistent().backing_of(heap).unwrap()
    );
}

#[test]
fn heap_exhaustion_fails_without_partial_placement() {
    let backend = Arc::new(HeadlessBackend::new());
    let mut graph = RenderGraph::new(backend);

    let heap = graph
        .create_heap(weft::HeapDescriptor {
            size: 1024,
            ..Default::default()
        })
        .unwrap();
    let used_before = graph.persistent().heap_used_size(heap).unwrap();
    let err = graph.place_buffer(heap, buffer(4096)).unwrap_err();
    assert!(matches!(err, WeftError::OutOfMemory { .. }));
    assert_eq!(graph.persistent().heap_used_size(heap).unwrap(), used_before);
}

// ============================================================================
// Memoryless storage
// ============================================================================

fn memoryless_texture() -> TextureDescriptor {
    TextureDescriptor {
        storage_mode: StorageMode::Memoryless,
        pixel_format: PixelFormat::Depth32Float,
        usage: UsageHint::RENDER_TARGET,
        width: 128,
        height: 128,
        ..Default::default()
    }
}

#[test]
fn memoryless_requires_backend_support() {
    let backend = Arc::new(HeadlessBackend::new());
    let mut graph = RenderGraph::new(backend);
    let err = graph.create_texture(memoryless_texture()).unwrap_err();
    assert!(matches!(err, WeftError::Validation(_)));
}

#[test]
fn memoryless_transient_occupies_no_arena_bytes() {
    let backend = Arc::new(HeadlessBackend::new());
    backend.set_tile_based(true);
    let mut graph = RenderGraph::new(backend.clone());

    let color = graph.create_texture(TextureDescriptor {
        usage: UsageHint::RENDER_TARGET,
        ..Default::default()
    })
    .unwrap();

    let mut frame = graph.begin_frame().unwrap();
    let depth = frame.transient_texture(memoryless_texture()).unwrap();
    frame.add_pass(PassDesc::draw("forward"), move |enc| {
        enc.use_resource(depth, AccessFlags::RENDER_TARGET, StageFlags::EARLY_FRAGMENT_TESTS);
        enc.use_resource(color, AccessFlags::RENDER_TARGET, StageFlags::FRAGMENT);
        enc.draw(0..3, 0..1);
    });
    let report = frame.commit().unwrap();

    assert_eq!(report.encoder_count, 1);
    assert_eq!(
        graph.transient().arena_capacity(1),
        0,
        "tile-local storage allocates nothing"
    );
}

#[test]
fn memoryless_buffers_are_rejected() {
    let backend = Arc::new(HeadlessBackend::new());
    let mut graph = RenderGraph::new(backend);
    let err = graph
        .create_buffer(BufferDescriptor {
            length: 64,
            storage_mode: StorageMode::Memoryless,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, WeftError::Validation(_)));
}

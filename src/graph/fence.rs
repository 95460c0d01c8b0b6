//! Fence & Semaphore Planning
//!
//! Walks the reduced dependency matrix and turns every surviving edge into
//! the cheapest legal synchronization:
//!
//! - **Same queue** — a barrier spanning `signal.stages → wait.stages`,
//!   inserted at the destination encoder's wait index. No fence object.
//! - **Cross queue** — a pooled fence: an update ordered after the source's
//!   signal index, a wait ordered before the destination's wait index.
//!
//! One fence per source encoder suffices while all of its outgoing edges
//! signal the same stage set; a second stage set allocates a second fence.
//! Fences are recycled once the frame that used them retires.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::backend::{Backend, FenceId, QueueId};

use super::dependency::{BarrierResource, DepMatrix};
use super::pass::StageFlags;
use super::schedule::EncoderRun;

/// A pooled fence in use this frame.
#[derive(Debug, Clone, Copy)]
pub struct PlannedFence {
    pub fence: FenceId,
    /// The greater of the source and destination command-buffer indices;
    /// the fence may be recycled no earlier than that buffer's completion.
    pub command_buffer_index: u32,
}

/// `update_fence` record: ordered after `at_index` in `encoder`.
#[derive(Debug, Clone, Copy)]
pub struct FenceSignal {
    pub fence: FenceId,
    pub encoder: u32,
    pub after_stages: StageFlags,
    pub at_index: u32,
}

/// `wait_fence` record: ordered before `at_index` in `encoder`.
#[derive(Debug, Clone, Copy)]
pub struct FenceWait {
    pub fence: FenceId,
    pub encoder: u32,
    pub before_stages: StageFlags,
    pub at_index: u32,
}

/// A same-queue edge, handed to the compactor as a barrier.
#[derive(Debug, Clone)]
pub struct PlannedBarrier {
    pub encoder: u32,
    pub wait_index: u32,
    pub after_stages: StageFlags,
    pub before_stages: StageFlags,
    pub resources: SmallVec<[BarrierResource; 4]>,
}

/// Output of the planner for one frame.
#[derive(Debug, Default)]
pub struct FencePlan {
    pub fences: Vec<PlannedFence>,
    pub signals: Vec<FenceSignal>,
    pub waits: Vec<FenceWait>,
    pub barriers: Vec<PlannedBarrier>,
}

/// Recycling pool of backend sync events.
///
/// Acquisition and recycling both happen on the frame thread (planning and
/// retire respectively), so plain vectors suffice.
pub struct FencePool {
    backend: Arc<dyn Backend>,
    free: Vec<FenceId>,
    created: usize,
}

impl FencePool {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            free: Vec::new(),
            created: 0,
        }
    }

    fn acquire(&mut self, queue: QueueId) -> FenceId {
        self.free.pop().unwrap_or_else(|| {
            self.created += 1;
            self.backend.make_sync_event(queue)
        })
    }

    /// Returns fences whose command buffers have completed.
    pub fn recycle(&mut self, fences: impl IntoIterator<Item = FenceId>) {
        self.free.extend(fences);
    }

    /// Total sync events ever created (diagnostics).
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created
    }
}

/// Assigns synchronization to every edge of the reduced matrix.
pub fn plan(matrix: &DepMatrix, runs: &[EncoderRun], pool: &mut FencePool) -> FencePlan {
    let mut out = FencePlan::default();
    // (source encoder, signal stage bits) -> index into out.fences
    let mut fence_by_source: FxHashMap<(u32, u8), usize> = FxHashMap::default();

    for (dst, src, dep) in matrix.iter() {
        let src_run = &runs[src as usize];
        let dst_run = &runs[dst as usize];

        if src_run.queue == dst_run.queue {
            out.barriers.push(PlannedBarrier {
                encoder: dst,
                wait_index: dep.wait.index,
                after_stages: dep.signal.stages,
                before_stages: dep.wait.stages,
                resources: dep.resources.clone(),
            });
            continue;
        }

        let key = (src, dep.signal.stages.bits());
        let fence_slot = match fence_by_source.get(&key) {
            Some(&slot) => {
                // Reused fence: it must not retire before this consumer.
                out.fences[slot].command_buffer_index = out.fences[slot]
                    .command_buffer_index
                    .max(dst_run.command_buffer_index);
                slot
            }
            None => {
                let fence = pool.acquire(src_run.queue);
                let slot = out.fences.len();
                out.fences.push(PlannedFence {
                    fence,
                    command_buffer_index: src_run
                        .command_buffer_index
                        .max(dst_run.command_buffer_index),
                });
                fence_by_source.insert(key, slot);
                out.signals.push(FenceSignal {
                    fence,
                    encoder: src,
                    after_stages: dep.signal.stages,
                    at_index: dep.signal.index,
                });
                slot
            }
        };
        let fence = out.fences[fence_slot].fence;

        // A fence shared by several consumers must be updated after the
        // latest producing command among them.
        if let Some(signal) = out.signals.iter_mut().find(|s| s.fence == fence) {
            signal.at_index = signal.at_index.max(dep.signal.index);
        }

        out.waits.push(FenceWait {
            fence,
            encoder: dst,
            before_stages: dep.wait.stages,
            at_index: dep.wait.index,
        });
    }

    out
}

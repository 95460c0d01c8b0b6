//! Resource Command Compaction
//!
//! Turns the frame's synchronization plan into concrete resource commands
//! interleaved with the pass streams, batched to the coarsest legal
//! granularity:
//!
//! - **Residency** — one `use_resources` per `(stages, access)` group per
//!   encoder, inserted at the earliest contributing index (or hoisted to the
//!   encoder head when every contributor declared consistent usage).
//!   Pinned declarations bypass batching.
//! - **Barriers** — accumulated while the staged window stays legal; flushed
//!   as a per-resource barrier for eight or fewer resources with no
//!   render-target scope, otherwise as a scoped barrier over the union of
//!   implied scopes. Layout transitions ride on whichever form is emitted.
//! - **Fences** — update/wait records pinned after/before their anchor
//!   commands.
//!
//! The final stream is stably sorted by `(index, order)` with
//! `Before < PassCommand < After`.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::backend::FenceId;
use crate::handle::{ResourceHandle, ResourceKind};

use super::dependency::{BarrierResource, IntraHazard};
use super::fence::FencePlan;
use super::pass::{AccessFlags, BarrierScope, PassRecord, StageFlags};
use super::schedule::EncoderRun;

/// Where a compacted command sits relative to the pass command at the same
/// index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Order {
    Before,
    After,
}

/// The payload of a barrier: either an explicit resource list or a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierForm {
    /// Eight or fewer resources, named individually.
    PerResource(SmallVec<[ResourceHandle; 8]>),
    /// Coarse form over whole cache domains.
    Scoped(BarrierScope),
}

/// A memory barrier with its layout transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierCommand {
    pub after_stages: StageFlags,
    pub before_stages: StageFlags,
    pub form: BarrierForm,
    /// Texture layout changes that ride on this barrier (`old != new` only).
    pub transitions: SmallVec<[BarrierResource; 4]>,
}

/// A resource command inserted by the compactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceCommand {
    /// Declares residency for a batch of resources.
    UseResources {
        resources: Vec<ResourceHandle>,
        stages: StageFlags,
        access: AccessFlags,
    },
    Barrier(BarrierCommand),
    UpdateFence {
        fence: FenceId,
        after_stages: StageFlags,
    },
    WaitFence {
        fence: FenceId,
        before_stages: StageFlags,
    },
}

/// One compacted command, anchored into the frame command stream.
#[derive(Debug, Clone)]
pub struct CompactedCommand {
    pub index: u32,
    pub order: Order,
    pub command: ResourceCommand,
}

/// Default per-resource barrier limit before demotion to the scoped form.
pub const PER_RESOURCE_BARRIER_LIMIT: usize = 8;

/// Inputs gathered from the earlier phases.
pub struct CompactorInput<'a> {
    pub passes: &'a [PassRecord],
    pub runs: &'a [EncoderRun],
    pub plan: &'a FencePlan,
    pub intra: &'a [IntraHazard],
    /// On tile-based GPUs render-target scope is not distinct; it folds into
    /// the texture scope.
    pub tile_based: bool,
    /// Resources a barrier may name individually before demoting to the
    /// scoped form. [`PER_RESOURCE_BARRIER_LIMIT`] unless overridden via
    /// `GraphOptions`.
    pub per_resource_limit: usize,
}

/// Produces the ordered resource-command list for every encoder.
pub fn compact(input: &CompactorInput<'_>) -> Vec<Vec<CompactedCommand>> {
    let mut per_encoder: Vec<Vec<CompactedCommand>> = vec![Vec::new(); input.runs.len()];

    for run in input.runs {
        let out = &mut per_encoder[run.index as usize];
        push_fences(input.plan, run.index, out);
        push_residency(input.passes, run, out);
        push_barriers(input, run, out);
        // Stable: commands staged at equal (index, order) keep their
        // emission order, which is itself deterministic.
        out.sort_by_key(|c| (c.index, c.order));
    }
    per_encoder
}

// ── Fences ─────────────────────────────────────────────────────────────────

fn push_fences(plan: &FencePlan, encoder: u32, out: &mut Vec<CompactedCommand>) {
    for wait in plan.waits.iter().filter(|w| w.encoder == encoder) {
        out.push(CompactedCommand {
            index: wait.at_index,
            order: Order::Before,
            command: ResourceCommand::WaitFence {
                fence: wait.fence,
                before_stages: wait.before_stages,
            },
        });
    }
    for signal in plan.signals.iter().filter(|s| s.encoder == encoder) {
        out.push(CompactedCommand {
            index: signal.at_index,
            order: Order::After,
            command: ResourceCommand::UpdateFence {
                fence: signal.fence,
                after_stages: signal.after_stages,
            },
        });
    }
}

// ── Residency ──────────────────────────────────────────────────────────────

struct ResidencyBatch {
    stages: StageFlags,
    access: AccessFlags,
    resources: Vec<ResourceHandle>,
    seen: FxHashSet<ResourceHandle>,
    earliest: u32,
    all_consistent: bool,
}

fn push_residency(passes: &[PassRecord], run: &EncoderRun, out: &mut Vec<CompactedCommand>) {
    let mut batches: Vec<ResidencyBatch> = Vec::new();
    let mut batch_index: FxHashMap<(u8, u8), usize> = FxHashMap::default();

    for &pass_index in &run.passes {
        for usage in &passes[pass_index as usize].usages {
            if !usage.allow_reordering {
                // Pinned: emitted alone at its exact index.
                out.push(CompactedCommand {
                    index: usage.first_command_index,
                    order: Order::Before,
                    command: ResourceCommand::UseResources {
                        resources: vec![usage.resource],
                        stages: usage.stages,
                        access: usage.access,
                    },
                });
                continue;
            }
            let key = (usage.stages.bits(), usage.access.bits());
            let slot = *batch_index.entry(key).or_insert_with(|| {
                batches.push(ResidencyBatch {
                    stages: usage.stages,
                    access: usage.access,
                    resources: Vec::new(),
                    seen: FxHashSet::default(),
                    earliest: u32::MAX,
                    all_consistent: true,
                });
                batches.len() - 1
            });
            let batch = &mut batches[slot];
            if batch.seen.insert(usage.resource) {
                batch.resources.push(usage.resource);
            }
            batch.earliest = batch.earliest.min(usage.first_command_index);
            batch.all_consistent &= usage.consistent_usage;
        }
    }

    for batch in batches {
        let index = if batch.all_consistent {
            run.command_range.start
        } else {
            batch.earliest
        };
        out.push(CompactedCommand {
            index,
            order: Order::Before,
            command: ResourceCommand::UseResources {
                resources: batch.resources,
                stages: batch.stages,
                access: batch.access,
            },
        });
    }
}

// ── Barriers ───────────────────────────────────────────────────────────────

/// One barrier request with its legal placement window `[floor, ceil]`.
struct BarrierEntry {
    floor: u32,
    ceil: u32,
    after_stages: StageFlags,
    before_stages: StageFlags,
    scope: Option<BarrierScope>,
    resources: SmallVec<[BarrierResource; 4]>,
}

fn push_barriers(input: &CompactorInput<'_>, run: &EncoderRun, out: &mut Vec<CompactedCommand>) {
    let mut entries: Vec<BarrierEntry> = Vec::new();

    // Cross-encoder same-queue edges: no producer inside this encoder, so
    // the window opens at the encoder head.
    for planned in input.plan.barriers.iter().filter(|b| b.encoder == run.index) {
        entries.push(BarrierEntry {
            floor: run.command_range.start,
            ceil: planned.wait_index,
            after_stages: planned.after_stages,
            before_stages: planned.before_stages,
            scope: None,
            resources: planned.resources.clone(),
        });
    }

    // Intra-encoder hazards.
    for hazard in input.intra.iter().filter(|h| h.encoder == run.index) {
        entries.push(BarrierEntry {
            floor: hazard.floor_index,
            ceil: hazard.wait_index,
            after_stages: hazard.after_stages,
            before_stages: hazard.before_stages,
            scope: None,
            resources: hazard.resources.clone(),
        });
    }

    // Explicit executor-requested barriers are pinned to their index.
    for &pass_index in &run.passes {
        for barrier in &input.passes[pass_index as usize].explicit_barriers {
            entries.push(BarrierEntry {
                floor: barrier.index,
                ceil: barrier.index,
                after_stages: barrier.after_stages,
                before_stages: barrier.before_stages,
                scope: barrier.scope,
                resources: barrier
                    .resources
                    .iter()
                    .map(|&handle| BarrierResource {
                        handle,
                        old_layout: super::pass::ImageLayout::Undefined,
                        new_layout: super::pass::ImageLayout::Undefined,
                    })
                    .collect(),
            });
        }
    }

    entries.sort_by_key(|e| (e.ceil, e.floor));

    let mut staged: Option<BarrierEntry> = None;
    for entry in entries {
        match staged {
            Some(ref mut current)
                if entry.floor <= current.ceil.min(entry.ceil)
                    && current.floor <= current.ceil.min(entry.ceil) =>
            {
                // The merged window stays legal: extend the staged barrier.
                current.floor = current.floor.max(entry.floor);
                current.ceil = current.ceil.min(entry.ceil);
                current.after_stages |= entry.after_stages;
                current.before_stages |= entry.before_stages;
                current.scope = match (current.scope, entry.scope) {
                    (Some(a), Some(b)) => Some(a | b),
                    (a, b) => a.or(b),
                };
                for resource in entry.resources {
                    merge_barrier_resource(&mut current.resources, resource);
                }
            }
            ref mut slot => {
                // The new request's window cannot extend the staged barrier
                // without moving it illegally: flush and restart.
                if let Some(current) = slot.replace(entry) {
                    out.push(flush_barrier(current, input.tile_based, input.per_resource_limit));
                }
            }
        }
    }
    if let Some(current) = staged.take() {
        out.push(flush_barrier(current, input.tile_based, input.per_resource_limit));
    }
}

fn merge_barrier_resource(
    resources: &mut SmallVec<[BarrierResource; 4]>,
    incoming: BarrierResource,
) {
    if let Some(existing) = resources.iter_mut().find(|r| r.handle == incoming.handle) {
        existing.new_layout = incoming.new_layout;
    } else {
        resources.push(incoming);
    }
}

fn flush_barrier(entry: BarrierEntry, tile_based: bool, per_resource_limit: usize) -> CompactedCommand {
    let render_target_involved = entry.resources.iter().any(|r| {
        matches!(
            r.new_layout,
            super::pass::ImageLayout::RenderTarget | super::pass::ImageLayout::DepthStencil
        ) || matches!(
            r.old_layout,
            super::pass::ImageLayout::RenderTarget | super::pass::ImageLayout::DepthStencil
        )
    }) || entry
        .scope
        .is_some_and(|s| s.contains(BarrierScope::RENDER_TARGETS));

    let transitions: SmallVec<[BarrierResource; 4]> = entry
        .resources
        .iter()
        .filter(|r| r.old_layout != r.new_layout)
        .copied()
        .collect();

    let per_resource_legal = entry.scope.is_none()
        && entry.resources.len() <= per_resource_limit
        && !render_target_involved;

    let form = if per_resource_legal {
        BarrierForm::PerResource(entry.resources.iter().map(|r| r.handle).collect())
    } else {
        let mut scope = entry.scope.unwrap_or_default();
        for resource in &entry.resources {
            scope |= match resource.handle.kind() {
                ResourceKind::Buffer | ResourceKind::ArgumentBuffer => BarrierScope::BUFFERS,
                ResourceKind::Texture => {
                    if render_target_involved {
                        BarrierScope::TEXTURES | BarrierScope::RENDER_TARGETS
                    } else {
                        BarrierScope::TEXTURES
                    }
                }
                _ => BarrierScope::empty(),
            };
        }
        if tile_based {
            // Render-target scope is only distinct on discrete GPUs.
            if scope.contains(BarrierScope::RENDER_TARGETS) {
                scope.remove(BarrierScope::RENDER_TARGETS);
                scope |= BarrierScope::TEXTURES;
            }
        }
        BarrierForm::Scoped(scope)
    };

    CompactedCommand {
        // The staged window is `[floor, ceil]`; the wait index is the
        // earliest consumer, which by construction is `ceil`.
        index: entry.ceil,
        order: Order::Before,
        command: ResourceCommand::Barrier(BarrierCommand {
            after_stages: entry.after_stages,
            before_stages: entry.before_stages,
            form,
            transitions,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueId;
    use crate::graph::fence::PlannedBarrier;
    use crate::graph::pass::{ImageLayout, PassId, PassKind, SUBRESOURCE_ALL, Usage};

    fn handle(index: u32) -> ResourceHandle {
        ResourceHandle::new_persistent(ResourceKind::Buffer, index, 1)
    }

    fn run(range: std::ops::Range<u32>, passes: Vec<u32>) -> EncoderRun {
        EncoderRun {
            index: 0,
            kind: PassKind::Compute,
            queue: QueueId(0),
            command_buffer_index: 0,
            passes,
            command_range: range,
        }
    }

    fn pass_with_usages(usages: Vec<Usage>, range: std::ops::Range<u32>) -> PassRecord {
        PassRecord {
            id: PassId(0),
            kind: PassKind::Compute,
            queue: QueueId(0),
            name: "p".into(),
            usages,
            command_range: range,
            explicit_barriers: Vec::new(),
            render_target_key: None,
            culled: false,
        }
    }

    fn usage(resource: ResourceHandle, first: u32) -> Usage {
        Usage {
            resource,
            subresource_mask: SUBRESOURCE_ALL,
            access: AccessFlags::READ,
            stages: StageFlags::COMPUTE,
            first_command_index: first,
            last_command_index: first,
            consistent_usage: false,
            allow_reordering: true,
        }
    }

    fn planned(resources: Vec<ResourceHandle>, wait_index: u32) -> PlannedBarrier {
        PlannedBarrier {
            encoder: 0,
            wait_index,
            after_stages: StageFlags::COMPUTE,
            before_stages: StageFlags::COMPUTE,
            resources: resources
                .into_iter()
                .map(|handle| BarrierResource {
                    handle,
                    old_layout: ImageLayout::Undefined,
                    new_layout: ImageLayout::Undefined,
                })
                .collect(),
        }
    }

    fn compact_with(plan: FencePlan, passes: Vec<PassRecord>, run: EncoderRun) -> Vec<CompactedCommand> {
        let input = CompactorInput {
            passes: &passes,
            runs: std::slice::from_ref(&run),
            plan: &plan,
            intra: &[],
            tile_based: false,
            per_resource_limit: PER_RESOURCE_BARRIER_LIMIT,
        };
        compact(&input).remove(0)
    }

    #[test]
    fn residency_batches_share_one_call() {
        let a = handle(0);
        let b = handle(1);
        let passes = vec![pass_with_usages(vec![usage(a, 2), usage(b, 1)], 0..4)];
        let commands = compact_with(FencePlan::default(), passes, run(0..4, vec![0]));
        let residency: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c.command, ResourceCommand::UseResources { .. }))
            .collect();
        assert_eq!(residency.len(), 1);
        assert_eq!(residency[0].index, 1, "earliest contributing index");
    }

    #[test]
    fn consistent_batches_hoist_to_encoder_head() {
        let a = handle(0);
        let mut u = usage(a, 3);
        u.consistent_usage = true;
        let passes = vec![pass_with_usages(vec![u], 2..5)];
        let commands = compact_with(FencePlan::default(), passes, run(2..5, vec![0]));
        assert_eq!(commands[0].index, 2, "hoisted to encoder start");
    }

    #[test]
    fn pinned_usage_bypasses_batching() {
        let a = handle(0);
        let b = handle(1);
        let mut pinned = usage(a, 2);
        pinned.allow_reordering = false;
        let passes = vec![pass_with_usages(vec![pinned, usage(b, 1)], 0..4)];
        let commands = compact_with(FencePlan::default(), passes, run(0..4, vec![0]));
        let residency: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c.command, ResourceCommand::UseResources { .. }))
            .collect();
        assert_eq!(residency.len(), 2);
    }

    #[test]
    fn eight_resources_stay_per_resource() {
        let resources: Vec<_> = (0..8).map(handle).collect();
        let plan = FencePlan {
            barriers: vec![planned(resources, 1)],
            ..FencePlan::default()
        };
        let commands = compact_with(plan, vec![pass_with_usages(vec![], 0..2)], run(0..2, vec![0]));
        let barrier = commands
            .iter()
            .find_map(|c| match &c.command {
                ResourceCommand::Barrier(b) => Some(b),
                _ => None,
            })
            .unwrap();
        assert!(matches!(&barrier.form, BarrierForm::PerResource(r) if r.len() == 8));
    }

    #[test]
    fn nine_resources_demote_to_scoped() {
        let resources: Vec<_> = (0..9).map(handle).collect();
        let plan = FencePlan {
            barriers: vec![planned(resources, 1)],
            ..FencePlan::default()
        };
        let commands = compact_with(plan, vec![pass_with_usages(vec![], 0..2)], run(0..2, vec![0]));
        let barrier = commands
            .iter()
            .find_map(|c| match &c.command {
                ResourceCommand::Barrier(b) => Some(b),
                _ => None,
            })
            .unwrap();
        assert_eq!(barrier.form, BarrierForm::Scoped(BarrierScope::BUFFERS));
    }

    #[test]
    fn lowered_limit_demotes_smaller_sets() {
        let resources: Vec<_> = (0..3).map(handle).collect();
        let plan = FencePlan {
            barriers: vec![planned(resources, 1)],
            ..FencePlan::default()
        };
        let passes = vec![pass_with_usages(vec![], 0..2)];
        let run = run(0..2, vec![0]);
        let input = CompactorInput {
            passes: &passes,
            runs: std::slice::from_ref(&run),
            plan: &plan,
            intra: &[],
            tile_based: false,
            per_resource_limit: 2,
        };
        let commands = compact(&input).remove(0);
        let barrier = commands
            .iter()
            .find_map(|c| match &c.command {
                ResourceCommand::Barrier(b) => Some(b),
                _ => None,
            })
            .unwrap();
        assert_eq!(barrier.form, BarrierForm::Scoped(BarrierScope::BUFFERS));
    }

    #[test]
    fn disjoint_windows_flush_separately() {
        let a = handle(0);
        let b = handle(1);
        let plan = FencePlan {
            barriers: vec![planned(vec![a], 1), planned(vec![b], 3)],
            ..FencePlan::default()
        };
        let mut hazard_pass = pass_with_usages(vec![], 0..4);
        hazard_pass.culled = false;
        let input_intra = vec![IntraHazard {
            encoder: 0,
            // A producer at command 2 forbids hoisting this barrier to the
            // staged window ending at 1.
            floor_index: 2,
            wait_index: 3,
            after_stages: StageFlags::COMPUTE,
            before_stages: StageFlags::COMPUTE,
            resources: SmallVec::from_elem(
                BarrierResource {
                    handle: b,
                    old_layout: ImageLayout::Undefined,
                    new_layout: ImageLayout::Undefined,
                },
                1,
            ),
        }];
        let passes = vec![hazard_pass];
        let run = run(0..4, vec![0]);
        let input = CompactorInput {
            passes: &passes,
            runs: std::slice::from_ref(&run),
            plan: &plan,
            intra: &input_intra,
            tile_based: false,
            per_resource_limit: PER_RESOURCE_BARRIER_LIMIT,
        };
        let commands = compact(&input).remove(0);
        let barriers = commands
            .iter()
            .filter(|c| matches!(c.command, ResourceCommand::Barrier(_)))
            .count();
        assert_eq!(barriers, 2);
    }
}

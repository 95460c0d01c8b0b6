//! Dependency Analysis
//!
//! Consumes the per-resource usage logs accumulated by the recorder and
//! produces, per frame:
//!
//! - an encoder-pair dependency matrix (`D[dst][src]`) covering RAW, WAR,
//!   WAW, and layout hazards between encoders,
//! - intra-encoder hazards that become plain barriers inside one encoder,
//! - transient lifetime intervals and memory-reuse pairs surfaced back to
//!   the transient registry.
//!
//! The scan keeps, per resource, the last write event and the set of reads
//! since it: a read synchronizes against the last write (RAW), a write
//! against every read since the last write (WAR) or, absent readers, the
//! last write itself (WAW). A required layout change is a write-like hazard
//! even between two reads.
//!
//! Multiple hazards on one encoder pair merge: the signal index is the
//! latest producing command, the wait index the earliest consuming command,
//! and stages union.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::handle::ResourceHandle;
use crate::resource::EncoderInterval;

use super::pass::{AccessFlags, ImageLayout, PassRecord, StageFlags, Usage};
use super::schedule::EncoderRun;

/// One endpoint of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEndpoint {
    /// Frame-global command index.
    pub index: u32,
    pub stages: StageFlags,
}

/// A resource carried on an edge, with its required layout transition.
///
/// `old == new` means no transition is needed (buffers always satisfy this).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierResource {
    pub handle: ResourceHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// A dependency between two encoders.
#[derive(Debug, Clone)]
pub struct Dep {
    /// Last command in the source encoder producing the hazard.
    pub signal: DepEndpoint,
    /// First command in the destination encoder consuming it.
    pub wait: DepEndpoint,
    /// Participating resources, deduplicated by handle.
    pub resources: SmallVec<[BarrierResource; 4]>,
}

/// Dense encoder-pair matrix; `get(dst, src)` is `Some` when `dst` must wait
/// on `src`.
#[derive(Debug)]
pub struct DepMatrix {
    n: usize,
    edges: Vec<Option<Dep>>,
}

impl DepMatrix {
    #[must_use]
    pub fn new(encoder_count: usize) -> Self {
        Self {
            n: encoder_count,
            edges: vec![None; encoder_count * encoder_count],
        }
    }

    #[inline]
    #[must_use]
    pub fn encoder_count(&self) -> usize {
        self.n
    }

    #[inline]
    #[must_use]
    pub fn get(&self, dst: u32, src: u32) -> Option<&Dep> {
        self.edges[dst as usize * self.n + src as usize].as_ref()
    }

    pub(crate) fn take(&mut self, dst: u32, src: u32) -> Option<Dep> {
        self.edges[dst as usize * self.n + src as usize].take()
    }

    /// Iterates `(dst, src, dep)` over present edges.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &Dep)> {
        self.edges.iter().enumerate().filter_map(|(i, dep)| {
            dep.as_ref()
                .map(|d| ((i / self.n) as u32, (i % self.n) as u32, d))
        })
    }

    /// Number of present edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().filter(|e| e.is_some()).count()
    }

    /// Merges a hazard into the `(dst, src)` cell.
    pub fn merge(&mut self, dst: u32, src: u32, signal: DepEndpoint, wait: DepEndpoint, resource: BarrierResource) {
        debug_assert!(src < dst, "dependency edges must point forward");
        let cell = &mut self.edges[dst as usize * self.n + src as usize];
        match cell {
            Some(dep) => {
                dep.signal.index = dep.signal.index.max(signal.index);
                dep.signal.stages |= signal.stages;
                dep.wait.index = dep.wait.index.min(wait.index);
                dep.wait.stages |= wait.stages;
                if let Some(existing) =
                    dep.resources.iter_mut().find(|r| r.handle == resource.handle)
                {
                    existing.new_layout = resource.new_layout;
                } else {
                    dep.resources.push(resource);
                }
            }
            None => {
                *cell = Some(Dep {
                    signal,
                    wait,
                    resources: SmallVec::from_elem(resource, 1),
                });
            }
        }
    }
}

/// A hazard between passes inside one encoder, resolved by a barrier.
#[derive(Debug, Clone)]
pub struct IntraHazard {
    pub encoder: u32,
    /// Earliest frame-global index the barrier may be placed at (it must
    /// stay after the producing command).
    pub floor_index: u32,
    /// Frame-global index of the first consuming command.
    pub wait_index: u32,
    pub after_stages: StageFlags,
    pub before_stages: StageFlags,
    pub resources: SmallVec<[BarrierResource; 4]>,
}

/// Everything the builder hands downstream.
#[derive(Debug)]
pub struct DependencyAnalysis {
    pub matrix: DepMatrix,
    pub intra: Vec<IntraHazard>,
    /// Encoder lifetime per transient-registry entry, `None` when unused.
    pub transient_intervals: Vec<Option<EncoderInterval>>,
    /// Memory-reuse hints `(earlier, later)` with disjoint lifetimes.
    pub alias_pairs: Vec<(ResourceHandle, ResourceHandle)>,
}

struct Event<'p> {
    encoder: u32,
    usage: &'p Usage,
}

/// Per-resource scan state.
struct Tracker<'p> {
    last_write: Option<Event<'p>>,
    reads_since_write: SmallVec<[Event<'p>; 4]>,
    layout: ImageLayout,
}

/// Builds the frame's dependency analysis.
///
/// `texture_aspect` reports `Some(is_depth_stencil)` for texture handles and
/// `None` for everything without a layout. `transient_count` sizes the
/// interval table for the active frame slot.
pub fn build(
    passes: &[PassRecord],
    runs: &[EncoderRun],
    transient_count: usize,
    texture_aspect: impl Fn(ResourceHandle) -> Option<bool>,
) -> DependencyAnalysis {
    let mut matrix = DepMatrix::new(runs.len());
    let mut intra: Vec<IntraHazard> = Vec::new();
    let mut intervals: Vec<Option<EncoderInterval>> = vec![None; transient_count];

    // Events per resource in (encoder, first_command_index) order; passes
    // inside a run are already registration-ordered, runs are index-ordered.
    // Resources are scanned in first-touch order so the output is
    // deterministic across identical frames.
    let mut log_order: Vec<ResourceHandle> = Vec::new();
    let mut logs: FxHashMap<ResourceHandle, Vec<Event<'_>>> = FxHashMap::default();
    for run in runs {
        for &pass_index in &run.passes {
            let pass = &passes[pass_index as usize];
            for usage in &pass.usages {
                let events = logs.entry(usage.resource).or_default();
                if events.is_empty() {
                    log_order.push(usage.resource);
                }
                events.push(Event {
                    encoder: run.index,
                    usage,
                });

                if usage.resource.is_transient() {
                    let entry = usage.resource.index() as usize;
                    if let Some(slot) = intervals.get_mut(entry) {
                        *slot = Some(match *slot {
                            Some((first, last)) => (first.min(run.index), last.max(run.index)),
                            None => (run.index, run.index),
                        });
                    }
                }

                // A collapsed read+write usage is a pass depending on itself
                // through the resource: an intra-pass barrier.
                if usage.access.contains(AccessFlags::READ | AccessFlags::WRITE) {
                    intra.push(IntraHazard {
                        encoder: run.index,
                        floor_index: usage.first_command_index,
                        wait_index: usage.first_command_index,
                        after_stages: usage.stages,
                        before_stages: usage.stages,
                        resources: SmallVec::from_elem(
                            BarrierResource {
                                handle: usage.resource,
                                old_layout: ImageLayout::Undefined,
                                new_layout: ImageLayout::Undefined,
                            },
                            1,
                        ),
                    });
                }
            }
        }
    }

    for resource in &log_order {
        let events = &logs[resource];
        let aspect = texture_aspect(*resource);
        let mut tracker = Tracker {
            last_write: None,
            reads_since_write: SmallVec::new(),
            layout: ImageLayout::Undefined,
        };

        for event in events {
            let required_layout = aspect
                .map(|depth| ImageLayout::required_for(event.usage.access, depth))
                .unwrap_or(ImageLayout::Undefined);
            let needs_transition =
                aspect.is_some() && tracker.layout != required_layout;
            let is_write = event.usage.access.is_write() || needs_transition;

            let old_layout = tracker.layout;
            let barrier_resource = BarrierResource {
                handle: *resource,
                old_layout: if aspect.is_some() { old_layout } else { ImageLayout::Undefined },
                new_layout: if aspect.is_some() { required_layout } else { ImageLayout::Undefined },
            };

            if is_write {
                // Synchronize against every read since the last write, or
                // the last write itself when no reads intervened.
                if tracker.reads_since_write.is_empty() {
                    if let Some(writer) = &tracker.last_write {
                        emit(
                            &mut matrix,
                            &mut intra,
                            writer,
                            event,
                            barrier_resource,
                        );
                    } else if needs_transition && old_layout != required_layout {
                        // First touch of a texture: a bare transition with no
                        // producer, handled as an intra hazard at the
                        // consuming command.
                        intra.push(IntraHazard {
                            encoder: event.encoder,
                            // No producer: the transition may float to the
                            // encoder head.
                            floor_index: 0,
                            wait_index: event.usage.first_command_index,
                            after_stages: StageFlags::empty(),
                            before_stages: event.usage.stages,
                            resources: SmallVec::from_elem(barrier_resource, 1),
                        });
                    }
                } else {
                    let readers = std::mem::take(&mut tracker.reads_since_write);
                    for reader in &readers {
                        emit(&mut matrix, &mut intra, reader, event, barrier_resource);
                    }
                }
                tracker.last_write = Some(Event {
                    encoder: event.encoder,
                    usage: event.usage,
                });
            } else {
                if let Some(writer) = &tracker.last_write {
                    emit(&mut matrix, &mut intra, writer, event, barrier_resource);
                } else if aspect.is_some() && old_layout != required_layout {
                    intra.push(IntraHazard {
                        encoder: event.encoder,
                        floor_index: 0,
                        wait_index: event.usage.first_command_index,
                        after_stages: StageFlags::empty(),
                        before_stages: event.usage.stages,
                        resources: SmallVec::from_elem(barrier_resource, 1),
                    });
                }
                tracker.reads_since_write.push(Event {
                    encoder: event.encoder,
                    usage: event.usage,
                });
            }

            if aspect.is_some() {
                tracker.layout = required_layout;
            }
        }
    }

    // Memory-reuse pairs: transient lifetimes that do not intersect. A
    // shared endpoint is an intersection (both live in that encoder).
    let mut alias_pairs = Vec::new();
    let mut placed: Vec<(ResourceHandle, EncoderInterval)> = Vec::new();
    for run in runs {
        for &pass_index in &run.passes {
            for usage in &passes[pass_index as usize].usages {
                let handle = usage.resource;
                if !handle.is_transient() {
                    continue;
                }
                let Some(interval) = intervals
                    .get(handle.index() as usize)
                    .copied()
                    .flatten()
                else {
                    continue;
                };
                if placed.iter().any(|(h, _)| *h == handle) {
                    continue;
                }
                for (earlier, earlier_interval) in &placed {
                    if earlier_interval.1 < interval.0 {
                        alias_pairs.push((*earlier, handle));
                    }
                }
                placed.push((handle, interval));
            }
        }
    }

    DependencyAnalysis {
        matrix,
        intra,
        transient_intervals: intervals,
        alias_pairs,
    }
}

/// Routes one hazard to the matrix (cross-encoder) or the intra list.
fn emit(
    matrix: &mut DepMatrix,
    intra: &mut Vec<IntraHazard>,
    producer: &Event<'_>,
    consumer: &Event<'_>,
    resource: BarrierResource,
) {
    let signal = DepEndpoint {
        index: producer.usage.last_command_index,
        stages: producer.usage.stages,
    };
    let wait = DepEndpoint {
        index: consumer.usage.first_command_index,
        stages: consumer.usage.stages,
    };
    if producer.encoder == consumer.encoder {
        intra.push(IntraHazard {
            encoder: consumer.encoder,
            // The barrier must stay after the producing command.
            floor_index: signal.index + 1,
            wait_index: wait.index,
            after_stages: signal.stages,
            before_stages: wait.stages,
            resources: SmallVec::from_elem(resource, 1),
        });
    } else {
        matrix.merge(consumer.encoder, producer.encoder, signal, wait, resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueId;
    use crate::graph::pass::{PassId, PassKind, SUBRESOURCE_ALL};
    use crate::handle::ResourceKind;

    fn buffer_handle(index: u32) -> ResourceHandle {
        ResourceHandle::new_persistent(ResourceKind::Buffer, index, 1)
    }

    fn transient_buffer(index: u32) -> ResourceHandle {
        ResourceHandle::new_transient(ResourceKind::Buffer, 0, index, 1)
    }

    fn usage(resource: ResourceHandle, access: AccessFlags, first: u32, last: u32) -> Usage {
        Usage {
            resource,
            subresource_mask: SUBRESOURCE_ALL,
            access,
            stages: StageFlags::COMPUTE,
            first_command_index: first,
            last_command_index: last,
            consistent_usage: true,
            allow_reordering: true,
        }
    }

    fn pass(id: u32, usages: Vec<Usage>, range: std::ops::Range<u32>) -> PassRecord {
        PassRecord {
            id: PassId(id),
            kind: PassKind::Compute,
            queue: QueueId(0),
            name: format!("p{id}"),
            usages,
            command_range: range,
            explicit_barriers: Vec::new(),
            render_target_key: None,
            culled: false,
        }
    }

    fn run(index: u32, passes: Vec<u32>, range: std::ops::Range<u32>) -> EncoderRun {
        EncoderRun {
            index,
            kind: PassKind::Compute,
            queue: QueueId(0),
            command_buffer_index: 0,
            passes,
            command_range: range,
        }
    }

    #[test]
    fn raw_produces_one_forward_edge() {
        let r = buffer_handle(0);
        let passes = vec![
            pass(0, vec![usage(r, AccessFlags::WRITE, 0, 2)], 0..3),
            pass(1, vec![usage(r, AccessFlags::READ, 3, 4)], 3..5),
        ];
        let runs = vec![run(0, vec![0], 0..3), run(1, vec![1], 3..5)];
        let analysis = build(&passes, &runs, 0, |_| None);
        let dep = analysis.matrix.get(1, 0).expect("RAW edge");
        assert_eq!(dep.signal.index, 2);
        assert_eq!(dep.wait.index, 3);
        assert!(analysis.intra.is_empty());
    }

    #[test]
    fn second_reader_also_syncs_with_the_writer() {
        let r = buffer_handle(0);
        let passes = vec![
            pass(0, vec![usage(r, AccessFlags::WRITE, 0, 0)], 0..1),
            pass(1, vec![usage(r, AccessFlags::READ, 1, 1)], 1..2),
            pass(2, vec![usage(r, AccessFlags::READ, 2, 2)], 2..3),
        ];
        let runs = vec![
            run(0, vec![0], 0..1),
            run(1, vec![1], 1..2),
            run(2, vec![2], 2..3),
        ];
        let analysis = build(&passes, &runs, 0, |_| None);
        assert!(analysis.matrix.get(1, 0).is_some());
        assert!(analysis.matrix.get(2, 0).is_some(), "read-read must not hide the writer");
        assert!(analysis.matrix.get(2, 1).is_none());
    }

    #[test]
    fn war_syncs_writer_with_every_prior_reader() {
        let r = buffer_handle(0);
        let passes = vec![
            pass(0, vec![usage(r, AccessFlags::WRITE, 0, 0)], 0..1),
            pass(1, vec![usage(r, AccessFlags::READ, 1, 1)], 1..2),
            pass(2, vec![usage(r, AccessFlags::WRITE, 2, 2)], 2..3),
        ];
        let runs = vec![
            run(0, vec![0], 0..1),
            run(1, vec![1], 1..2),
            run(2, vec![2], 2..3),
        ];
        let analysis = build(&passes, &runs, 0, |_| None);
        assert!(analysis.matrix.get(2, 1).is_some(), "WAR edge");
        assert!(analysis.matrix.get(2, 0).is_none(), "reader shields the writer");
    }

    #[test]
    fn hazards_on_one_pair_merge() {
        let a = buffer_handle(0);
        let b = buffer_handle(1);
        let passes = vec![
            pass(
                0,
                vec![
                    usage(a, AccessFlags::WRITE, 0, 1),
                    usage(b, AccessFlags::WRITE, 2, 3),
                ],
                0..4,
            ),
            pass(
                1,
                vec![
                    usage(a, AccessFlags::READ, 4, 5),
                    usage(b, AccessFlags::READ, 6, 7),
                ],
                4..8,
            ),
        ];
        let runs = vec![run(0, vec![0], 0..4), run(1, vec![1], 4..8)];
        let analysis = build(&passes, &runs, 0, |_| None);
        assert_eq!(analysis.matrix.edge_count(), 1);
        let dep = analysis.matrix.get(1, 0).unwrap();
        assert_eq!(dep.signal.index, 3, "latest producing command");
        assert_eq!(dep.wait.index, 4, "earliest consuming command");
        assert_eq!(dep.resources.len(), 2);
    }

    #[test]
    fn same_encoder_hazard_is_intra() {
        let r = buffer_handle(0);
        let passes = vec![
            pass(0, vec![usage(r, AccessFlags::WRITE, 0, 0)], 0..1),
            pass(1, vec![usage(r, AccessFlags::READ, 1, 1)], 1..2),
        ];
        let runs = vec![run(0, vec![0, 1], 0..2)];
        let analysis = build(&passes, &runs, 0, |_| None);
        assert_eq!(analysis.matrix.edge_count(), 0);
        assert_eq!(analysis.intra.len(), 1);
        assert_eq!(analysis.intra[0].wait_index, 1);
    }

    #[test]
    fn layout_change_between_reads_is_a_hazard() {
        let t = ResourceHandle::new_persistent(ResourceKind::Texture, 0, 1);
        let passes = vec![
            pass(0, vec![usage(t, AccessFlags::BLIT_SRC, 0, 0)], 0..1),
            pass(1, vec![usage(t, AccessFlags::READ, 1, 1)], 1..2),
        ];
        let runs = vec![run(0, vec![0], 0..1), run(1, vec![1], 1..2)];
        let analysis = build(&passes, &runs, 0, |_| Some(false));
        // First touch transitions Undefined -> BlitSrc (intra), then the
        // read needs BlitSrc -> ShaderRead: an edge despite both being reads.
        let dep = analysis.matrix.get(1, 0).expect("layout edge");
        assert_eq!(dep.resources[0].old_layout, ImageLayout::BlitSrc);
        assert_eq!(dep.resources[0].new_layout, ImageLayout::ShaderRead);
    }

    #[test]
    fn transient_intervals_and_alias_pairs() {
        let t1 = transient_buffer(0);
        let t2 = transient_buffer(1);
        let passes = vec![
            pass(0, vec![usage(t1, AccessFlags::WRITE, 0, 0)], 0..1),
            pass(1, vec![usage(t1, AccessFlags::READ, 1, 1)], 1..2),
            pass(2, vec![usage(t2, AccessFlags::WRITE, 2, 2)], 2..3),
        ];
        let runs = vec![
            run(0, vec![0], 0..1),
            run(1, vec![1], 1..2),
            run(2, vec![2], 2..3),
        ];
        let analysis = build(&passes, &runs, 2, |_| None);
        assert_eq!(analysis.transient_intervals[0], Some((0, 1)));
        assert_eq!(analysis.transient_intervals[1], Some((2, 2)));
        assert_eq!(analysis.alias_pairs, vec![(t1, t2)]);
    }
}

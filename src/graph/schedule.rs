//! Pass Scheduling
//!
//! Two jobs, run back to back once all executors have recorded:
//!
//! 1. **Culling** — reverse reachability from passes whose writes land in an
//!    externally consumed resource (persistent, imported, or explicitly
//!    marked). A pass none of whose writes transitively reach such a sink
//!    contributes nothing observable and is dropped before any encoder is
//!    opened.
//! 2. **Encoder assignment** — passes are walked in registration order
//!    (registration order is the topological order by contract) and batched
//!    into maximal runs of the same kind and queue. Draw runs additionally
//!    require an identical render-target attachment set and split when an
//!    intra-run hazard would demand a mid-render-pass barrier. A run also
//!    closes when its command count would exceed the backend's soft cap.

use std::ops::Range;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::backend::QueueId;
use crate::handle::ResourceHandle;

use super::pass::{PassKind, PassRecord};

/// A maximal run of consecutive passes sharing kind and queue; the unit of
/// dependency analysis and fencing.
#[derive(Debug, Clone)]
pub struct EncoderRun {
    pub index: u32,
    pub kind: PassKind,
    pub queue: QueueId,
    /// Encoders submitted back to back on one queue share a command buffer.
    pub command_buffer_index: u32,
    /// Registration indices of the passes in this run.
    pub passes: Vec<u32>,
    /// Frame-global command indices covered by the run.
    pub command_range: Range<u32>,
}

/// Marks unreachable passes culled; returns how many were dropped.
///
/// `is_sink` answers whether writes to a resource are externally observable.
/// All earlier writers of a resource a live pass reads are kept: partial
/// writes chain, so dropping any of them could change the consumed value.
pub fn cull_passes(
    passes: &mut [PassRecord],
    is_sink: impl Fn(ResourceHandle) -> bool,
) -> usize {
    // Writers per resource, in registration order.
    let mut writers: FxHashMap<ResourceHandle, Vec<u32>> = FxHashMap::default();
    for (i, pass) in passes.iter().enumerate() {
        for usage in &pass.usages {
            if usage.access.is_write() {
                writers.entry(usage.resource).or_default().push(i as u32);
            }
        }
    }

    let mut live: FxHashSet<u32> = FxHashSet::default();
    let mut work: Vec<u32> = Vec::new();
    for (i, pass) in passes.iter().enumerate() {
        let root = match pass.kind {
            // External passes do work the runtime cannot observe; never cull.
            PassKind::External => !pass.culled,
            _ => {
                // A pass with no writes at all only observes — its effect
                // (present, readback) is outside the graph, so it is a root.
                !pass.culled
                    && (!pass.has_writes()
                        || pass
                            .usages
                            .iter()
                            .any(|u| u.access.is_write() && is_sink(u.resource)))
            }
        };
        if root {
            live.insert(i as u32);
            work.push(i as u32);
        }
    }

    // Walk consumption edges backwards: a live reader keeps every earlier
    // writer of the resources it touches.
    while let Some(reader) = work.pop() {
        for usage in &passes[reader as usize].usages {
            let Some(producers) = writers.get(&usage.resource) else {
                continue;
            };
            for &producer in producers {
                if producer < reader && live.insert(producer) {
                    work.push(producer);
                }
            }
        }
    }

    let mut culled = 0;
    for (i, pass) in passes.iter_mut().enumerate() {
        if !live.contains(&(i as u32)) && !pass.culled {
            log::debug!("culled pass `{}` (no externally observable writes)", pass.name);
            pass.culled = true;
        }
        if pass.culled {
            culled += 1;
        }
    }
    culled
}

/// Batches live passes into encoder runs.
pub fn assign_encoders(passes: &[PassRecord], command_soft_cap: u32) -> Vec<EncoderRun> {
    let mut runs: Vec<EncoderRun> = Vec::new();
    let mut open: Option<OpenRun> = None;

    for (i, pass) in passes.iter().enumerate() {
        if pass.culled {
            continue;
        }
        let pass_commands = pass.command_range.end - pass.command_range.start;

        let fits = open.as_ref().is_some_and(|run| {
            run.kind == pass.kind
                && run.queue == pass.queue
                && run.render_target_key == pass.render_target_key
                && run.command_count + pass_commands <= command_soft_cap
                && !(run.kind == PassKind::Draw && draw_run_hazard(passes, &run.passes, pass))
        });

        match open {
            Some(ref mut run) if fits => {
                run.passes.push(i as u32);
                run.command_count += pass_commands;
                run.command_range.end = pass.command_range.end;
            }
            ref mut slot => {
                if let Some(run) = slot.take() {
                    let index = runs.len() as u32;
                    let run = run.close(index, &runs);
                    runs.push(run);
                }
                *slot = Some(OpenRun {
                    kind: pass.kind,
                    queue: pass.queue,
                    render_target_key: pass.render_target_key,
                    passes: vec![i as u32],
                    command_count: pass_commands,
                    command_range: pass.command_range.clone(),
                });
            }
        }
    }
    if let Some(run) = open.take() {
        let index = runs.len() as u32;
        let run = run.close(index, &runs);
        runs.push(run);
    }
    runs
}

struct OpenRun {
    kind: PassKind,
    queue: QueueId,
    render_target_key: Option<u64>,
    passes: Vec<u32>,
    command_count: u32,
    command_range: Range<u32>,
}

impl OpenRun {
    fn close(self, index: u32, previous: &[EncoderRun]) -> EncoderRun {
        // Back-to-back runs on one queue share a command buffer.
        let command_buffer_index = match previous.last() {
            Some(prev) if prev.queue == self.queue => prev.command_buffer_index,
            Some(prev) => prev.command_buffer_index + 1,
            None => 0,
        };
        EncoderRun {
            index,
            kind: self.kind,
            queue: self.queue,
            command_buffer_index,
            passes: self.passes,
            command_range: self.command_range,
        }
    }
}

/// A draw pass cannot take a mid-render-pass barrier: if the incoming pass
/// reads anything a pass already in the run wrote outside the attachment
/// set, the run must close (barrier demotion to a pass boundary).
fn draw_run_hazard(passes: &[PassRecord], run_passes: &[u32], incoming: &PassRecord) -> bool {
    incoming.usages.iter().any(|read| {
        run_passes.iter().any(|&p| {
            passes[p as usize].usages.iter().any(|w| {
                w.resource == read.resource
                    && w.access.is_write()
                    && !w.access.contains(super::pass::AccessFlags::RENDER_TARGET)
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueId;
    use crate::graph::pass::{AccessFlags, PassId, StageFlags, SUBRESOURCE_ALL, Usage};
    use crate::handle::{ResourceHandle, ResourceKind};

    fn handle(index: u32, transient: bool) -> ResourceHandle {
        if transient {
            ResourceHandle::new_transient(ResourceKind::Buffer, 0, index, 1)
        } else {
            ResourceHandle::new_persistent(ResourceKind::Buffer, index, 1)
        }
    }

    fn usage(resource: ResourceHandle, access: AccessFlags, range: Range<u32>) -> Usage {
        Usage {
            resource,
            subresource_mask: SUBRESOURCE_ALL,
            access,
            stages: StageFlags::COMPUTE,
            first_command_index: range.start,
            last_command_index: range.end - 1,
            consistent_usage: true,
            allow_reordering: true,
        }
    }

    fn pass(id: u32, kind: PassKind, usages: Vec<Usage>, commands: Range<u32>) -> PassRecord {
        PassRecord {
            id: PassId(id),
            kind,
            queue: QueueId(0),
            name: format!("pass-{id}"),
            usages,
            command_range: commands,
            explicit_barriers: Vec::new(),
            render_target_key: None,
            culled: false,
        }
    }

    #[test]
    fn unconsumed_transient_write_is_culled() {
        let dead = handle(0, true);
        let mut passes = vec![pass(
            0,
            PassKind::Compute,
            vec![usage(dead, AccessFlags::WRITE, 0..1)],
            0..1,
        )];
        assert_eq!(cull_passes(&mut passes, |_| false), 1);
        assert!(passes[0].culled);
    }

    #[test]
    fn read_only_consumer_keeps_its_producer_alive() {
        let mid = handle(0, true);
        let mut passes = vec![
            pass(0, PassKind::Compute, vec![usage(mid, AccessFlags::WRITE, 0..1)], 0..1),
            // Draws from `mid` without writing anything the graph can see.
            pass(1, PassKind::Draw, vec![usage(mid, AccessFlags::READ, 1..2)], 1..2),
        ];
        assert_eq!(cull_passes(&mut passes, |_| false), 0);
        assert!(!passes[0].culled, "the observed write must survive");
    }

    #[test]
    fn chain_to_sink_stays_live() {
        let mid = handle(0, true);
        let out = handle(1, false);
        let mut passes = vec![
            pass(0, PassKind::Compute, vec![usage(mid, AccessFlags::WRITE, 0..1)], 0..1),
            pass(
                1,
                PassKind::Compute,
                vec![
                    usage(mid, AccessFlags::READ, 1..2),
                    usage(out, AccessFlags::WRITE, 1..2),
                ],
                1..2,
            ),
        ];
        assert_eq!(cull_passes(&mut passes, |h| h == out), 0);
        assert!(!passes[0].culled && !passes[1].culled);
    }

    #[test]
    fn same_kind_same_queue_coalesces() {
        let sink = handle(0, false);
        let mut passes = vec![
            pass(0, PassKind::Compute, vec![usage(sink, AccessFlags::WRITE, 0..2)], 0..2),
            pass(1, PassKind::Compute, vec![usage(sink, AccessFlags::WRITE, 2..3)], 2..3),
            pass(2, PassKind::Blit, vec![usage(sink, AccessFlags::BLIT_DST, 3..4)], 3..4),
        ];
        cull_passes(&mut passes, |_| true);
        let runs = assign_encoders(&passes, 1 << 16);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].passes, vec![0, 1]);
        assert_eq!(runs[0].command_range, 0..3);
        assert_eq!(runs[1].kind, PassKind::Blit);
        // Same queue throughout: a single command buffer.
        assert_eq!(runs[1].command_buffer_index, runs[0].command_buffer_index);
    }

    #[test]
    fn soft_cap_splits_runs() {
        let sink = handle(0, false);
        let mut passes = vec![
            pass(0, PassKind::Compute, vec![usage(sink, AccessFlags::WRITE, 0..3)], 0..3),
            pass(1, PassKind::Compute, vec![usage(sink, AccessFlags::WRITE, 3..6)], 3..6),
        ];
        cull_passes(&mut passes, |_| true);
        let runs = assign_encoders(&passes, 4);
        assert_eq!(runs.len(), 2);
    }

    #[test]
    fn draw_runs_split_on_changed_attachments() {
        let sink = handle(0, false);
        let mut a = pass(0, PassKind::Draw, vec![usage(sink, AccessFlags::RENDER_TARGET, 0..1)], 0..1);
        a.render_target_key = Some(1);
        let mut b = pass(1, PassKind::Draw, vec![usage(sink, AccessFlags::RENDER_TARGET, 1..2)], 1..2);
        b.render_target_key = Some(2);
        let mut passes = vec![a, b];
        cull_passes(&mut passes, |_| true);
        let runs = assign_encoders(&passes, 1 << 16);
        assert_eq!(runs.len(), 2);
    }
}

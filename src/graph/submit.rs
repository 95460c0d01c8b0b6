//! Submission Driver
//!
//! Walks the compacted per-encoder streams, merges them with the recorded
//! pass commands, and drives the backend: encode, submit, and wire up
//! completion. Completion callbacks hop from the backend's thread onto the
//! frame thread over a channel; the last submission of a frame posts the
//! frame's retire message.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use crate::backend::{
    Backend, EncodedCommand, EncoderDesc, FenceId, FenceSignalOp, FenceWaitOp, SubmissionId,
};

use super::compact::{CompactedCommand, Order};
use super::fence::FencePlan;
use super::pass::{PassCommand, PassRecord};
use super::schedule::EncoderRun;

/// Posted on the completion channel when a frame's last submission finishes.
#[derive(Debug)]
pub(crate) struct RetireMsg {
    pub frame: u64,
    pub slot: u8,
    /// Fences used by the frame, now recyclable.
    pub fences: Vec<FenceId>,
}

/// What one frame's flush produced.
#[derive(Debug, Default)]
pub(crate) struct FrameSubmission {
    pub submissions: Vec<SubmissionId>,
}

pub(crate) struct SubmissionDriver {
    backend: Arc<dyn Backend>,
    tx: flume::Sender<RetireMsg>,
    rx: flume::Receiver<RetireMsg>,
}

impl SubmissionDriver {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self { backend, tx, rx }
    }

    /// The retire channel the frame loop drains.
    pub fn receiver(&self) -> &flume::Receiver<RetireMsg> {
        &self.rx
    }

    /// Encodes and submits every encoder of the frame.
    ///
    /// A frame with no encoders performs no backend calls at all; its retire
    /// message is posted immediately so the slot still cycles.
    pub fn flush(
        &self,
        passes: &[PassRecord],
        commands: &[PassCommand],
        bytes_blob: &[u8],
        runs: &[EncoderRun],
        compacted: &[Vec<CompactedCommand>],
        plan: &FencePlan,
        frame: u64,
        slot: u8,
    ) -> FrameSubmission {
        let fences: Vec<FenceId> = plan.fences.iter().map(|f| f.fence).collect();

        if runs.is_empty() {
            let _ = self.tx.send(RetireMsg {
                frame,
                slot,
                fences,
            });
            return FrameSubmission::default();
        }

        let mut out = FrameSubmission::default();
        let pending = Arc::new(AtomicUsize::new(runs.len()));
        let retire = Arc::new(Mutex::new(Some(RetireMsg {
            frame,
            slot,
            fences,
        })));

        for run in runs {
            let stream = merge_stream(passes, commands, run, &compacted[run.index as usize]);
            let labels: Vec<&str> = run
                .passes
                .iter()
                .map(|&p| passes[p as usize].name.as_str())
                .collect();
            let desc = EncoderDesc {
                kind: run.kind,
                queue: run.queue,
                labels: &labels,
                bytes_blob,
            };
            let command_buffer = self.backend.encode_pass(&desc, &stream);

            let waits: Vec<FenceWaitOp> = plan
                .waits
                .iter()
                .filter(|w| w.encoder == run.index)
                .map(|w| FenceWaitOp {
                    fence: w.fence,
                    before_stages: w.before_stages,
                })
                .collect();
            let signals: Vec<FenceSignalOp> = plan
                .signals
                .iter()
                .filter(|s| s.encoder == run.index)
                .map(|s| FenceSignalOp {
                    fence: s.fence,
                    after_stages: s.after_stages,
                })
                .collect();

            let submission = self.backend.submit(command_buffer, &waits, &signals);
            out.submissions.push(submission);

            let pending = pending.clone();
            let retire = retire.clone();
            let tx = self.tx.clone();
            self.backend.completion_callback(
                submission,
                Box::new(move || {
                    if pending.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
                        if let Some(msg) = retire.lock().take() {
                            let _ = tx.send(msg);
                        }
                    }
                }),
            );
        }

        log::trace!(
            "frame {frame}: submitted {} command buffer(s), {} fence(s)",
            out.submissions.len(),
            plan.fences.len()
        );
        out
    }
}

/// Interleaves one encoder's compacted commands with its pass commands.
///
/// Walks the run's live passes (a culled pass between coalesced neighbors
/// leaves a hole in the run's command range that must not be replayed).
/// `compacted` is already `(index, order)`-sorted; `Before` entries land
/// ahead of the pass command at their index, `After` entries behind it.
fn merge_stream<'a>(
    passes: &[PassRecord],
    commands: &'a [PassCommand],
    run: &EncoderRun,
    compacted: &'a [CompactedCommand],
) -> Vec<EncodedCommand<'a>> {
    let mut stream = Vec::with_capacity(
        (run.command_range.end - run.command_range.start) as usize + compacted.len(),
    );
    let mut cursor = 0usize;

    for &pass_index in &run.passes {
        for index in passes[pass_index as usize].command_range.clone() {
            while cursor < compacted.len()
                && (compacted[cursor].index < index
                    || (compacted[cursor].index == index
                        && compacted[cursor].order == Order::Before))
            {
                stream.push(EncodedCommand::Resource(&compacted[cursor].command));
                cursor += 1;
            }
            stream.push(EncodedCommand::Pass(&commands[index as usize]));
            while cursor < compacted.len()
                && compacted[cursor].index == index
                && compacted[cursor].order == Order::After
            {
                stream.push(EncodedCommand::Resource(&compacted[cursor].command));
                cursor += 1;
            }
        }
    }
    // Anything anchored past the final pass command.
    while cursor < compacted.len() {
        stream.push(EncodedCommand::Resource(&compacted[cursor].command));
        cursor += 1;
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueId;
    use crate::graph::compact::ResourceCommand;
    use crate::graph::pass::{AccessFlags, PassKind, StageFlags};
    use crate::handle::{ResourceHandle, ResourceKind};

    fn resource_cmd() -> ResourceCommand {
        ResourceCommand::UseResources {
            resources: vec![ResourceHandle::new_persistent(ResourceKind::Buffer, 0, 1)],
            stages: StageFlags::COMPUTE,
            access: AccessFlags::READ,
        }
    }

    fn pass_record(range: std::ops::Range<u32>) -> PassRecord {
        PassRecord {
            id: crate::graph::pass::PassId(0),
            kind: PassKind::Compute,
            queue: QueueId(0),
            name: "p".into(),
            usages: Vec::new(),
            command_range: range,
            explicit_barriers: Vec::new(),
            render_target_key: None,
            culled: false,
        }
    }

    #[test]
    fn merge_respects_before_and_after_anchors() {
        let commands = vec![
            PassCommand::Dispatch { groups: [1, 1, 1] },
            PassCommand::Dispatch { groups: [2, 2, 2] },
        ];
        let passes = vec![pass_record(0..2)];
        let run = EncoderRun {
            index: 0,
            kind: PassKind::Compute,
            queue: QueueId(0),
            command_buffer_index: 0,
            passes: vec![0],
            command_range: 0..2,
        };
        let compacted = vec![
            CompactedCommand {
                index: 0,
                order: Order::Before,
                command: resource_cmd(),
            },
            CompactedCommand {
                index: 1,
                order: Order::After,
                command: resource_cmd(),
            },
        ];
        let stream = merge_stream(&passes, &commands, &run, &compacted);
        assert_eq!(stream.len(), 4);
        assert!(matches!(stream[0], EncodedCommand::Resource(_)));
        assert!(matches!(stream[1], EncodedCommand::Pass(_)));
        assert!(matches!(stream[2], EncodedCommand::Pass(_)));
        assert!(matches!(stream[3], EncodedCommand::Resource(_)));
    }

    #[test]
    fn culled_hole_between_coalesced_passes_is_not_replayed() {
        // Three commands; the middle one belongs to a culled pass and is
        // absent from the run's pass list even though the run's command
        // range spans it.
        let commands = vec![
            PassCommand::Dispatch { groups: [1, 1, 1] },
            PassCommand::Dispatch { groups: [9, 9, 9] },
            PassCommand::Dispatch { groups: [2, 2, 2] },
        ];
        let passes = vec![pass_record(0..1), pass_record(1..2), pass_record(2..3)];
        let run = EncoderRun {
            index: 0,
            kind: PassKind::Compute,
            queue: QueueId(0),
            command_buffer_index: 0,
            passes: vec![0, 2],
            command_range: 0..3,
        };
        let stream = merge_stream(&passes, &commands, &run, &[]);
        assert_eq!(stream.len(), 2);
        for command in &stream {
            assert!(!matches!(
                command,
                EncodedCommand::Pass(PassCommand::Dispatch { groups: [9, 9, 9] })
            ));
        }
    }
}

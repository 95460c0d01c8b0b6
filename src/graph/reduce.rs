//! Transitive Reduction
//!
//! Removes every dependency edge already implied by a chain of surviving
//! edges, so each producer→consumer relationship costs at most one fence.
//! Encoder indices are processed in registration order, which is topological
//! by construction; reachability is tracked per encoder as an ancestor
//! bitset, giving `O(E · V / w)` overall.
//!
//! An edge is *not* removable just because a path exists: the retained
//! path's first hop out of the source must signal a superset of the removed
//! edge's signal stages, otherwise the hazard window would silently widen.
//! Such edges are kept.

use super::dependency::DepMatrix;

/// Fixed-capacity ancestor set over encoder indices.
#[derive(Clone, Debug)]
pub(crate) struct EncoderSet {
    words: Vec<u64>,
}

impl EncoderSet {
    fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    #[inline]
    fn insert(&mut self, index: u32) {
        self.words[index as usize / 64] |= 1 << (index % 64);
    }

    #[inline]
    fn contains(&self, index: u32) -> bool {
        self.words[index as usize / 64] & (1 << (index % 64)) != 0
    }

    fn union_with(&mut self, other: &Self) {
        for (word, other_word) in self.words.iter_mut().zip(&other.words) {
            *word |= other_word;
        }
    }
}

/// Outcome counters for diagnostics and the frame report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReduceStats {
    pub edges_before: usize,
    pub edges_removed: usize,
    /// Edges a chain covered but whose signal stages it could not.
    pub retained_for_stages: usize,
}

/// Reduces `matrix` in place to a minimal-edge equivalent.
pub fn reduce(matrix: &mut DepMatrix) -> ReduceStats {
    let n = matrix.encoder_count();
    let mut stats = ReduceStats {
        edges_before: matrix.edge_count(),
        ..ReduceStats::default()
    };

    // reach[i] = encoders with a surviving path into i.
    let mut reach: Vec<EncoderSet> = (0..n).map(|_| EncoderSet::new(n)).collect();

    for dst in 0..n as u32 {
        // In-edge sources, largest first: an ancestor always has a smaller
        // index, so every chain head is decided before its tail.
        let mut sources: Vec<u32> = (0..dst).filter(|&s| matrix.get(dst, s).is_some()).collect();
        sources.sort_unstable_by(|a, b| b.cmp(a));

        let mut kept: Vec<u32> = Vec::with_capacity(sources.len());
        for src in sources {
            // Encoders reachable from dst's kept in-edges, through which an
            // indirect src → … → dst chain could run.
            let mut via = EncoderSet::new(n);
            let mut any = false;
            for &m in &kept {
                if reach[m as usize].contains(src) {
                    via.union_with(&reach[m as usize]);
                    via.insert(m);
                    any = true;
                }
            }

            if any {
                let direct_stages = matrix
                    .get(dst, src)
                    .map(|d| d.signal.stages)
                    .unwrap_or_default();
                // The chain's first hop out of src must signal at least the
                // stages the direct edge would have.
                let covered = (src + 1..dst).any(|x| {
                    via.contains(x)
                        && matrix
                            .get(x, src)
                            .is_some_and(|hop| hop.signal.stages.contains(direct_stages))
                });
                if covered {
                    matrix.take(dst, src);
                    stats.edges_removed += 1;
                    continue;
                }
                stats.retained_for_stages += 1;
            }
            kept.push(src);
        }

        let mut dst_reach = EncoderSet::new(n);
        for &m in &kept {
            dst_reach.union_with(&reach[m as usize]);
            dst_reach.insert(m);
        }
        reach[dst as usize] = dst_reach;
    }

    if stats.edges_removed > 0 {
        log::trace!(
            "transitive reduction removed {}/{} edges",
            stats.edges_removed,
            stats.edges_before
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dependency::{BarrierResource, DepEndpoint, DepMatrix};
    use crate::graph::pass::{ImageLayout, StageFlags};
    use crate::handle::{ResourceHandle, ResourceKind};

    fn add_edge(matrix: &mut DepMatrix, dst: u32, src: u32, signal_stages: StageFlags) {
        matrix.merge(
            dst,
            src,
            DepEndpoint {
                index: src,
                stages: signal_stages,
            },
            DepEndpoint {
                index: dst,
                stages: StageFlags::COMPUTE,
            },
            BarrierResource {
                handle: ResourceHandle::new_persistent(ResourceKind::Buffer, dst * 97 + src, 1),
                old_layout: ImageLayout::Undefined,
                new_layout: ImageLayout::Undefined,
            },
        );
    }

    /// Brute-force reachability closure for comparison.
    fn closure(matrix: &DepMatrix) -> Vec<Vec<bool>> {
        let n = matrix.encoder_count();
        let mut reach = vec![vec![false; n]; n];
        for (dst, src, _) in matrix.iter() {
            reach[src as usize][dst as usize] = true;
        }
        for k in 0..n {
            for i in 0..n {
                for j in 0..n {
                    if reach[i][k] && reach[k][j] {
                        reach[i][j] = true;
                    }
                }
            }
        }
        reach
    }

    #[test]
    fn triangle_chain_drops_the_direct_edge() {
        let mut matrix = DepMatrix::new(3);
        add_edge(&mut matrix, 1, 0, StageFlags::COMPUTE);
        add_edge(&mut matrix, 2, 1, StageFlags::COMPUTE);
        add_edge(&mut matrix, 2, 0, StageFlags::COMPUTE);
        let stats = reduce(&mut matrix);
        assert_eq!(stats.edges_removed, 1);
        assert!(matrix.get(2, 0).is_none());
        assert!(matrix.get(1, 0).is_some());
        assert!(matrix.get(2, 1).is_some());
    }

    #[test]
    fn stage_mismatch_retains_the_direct_edge() {
        let mut matrix = DepMatrix::new(3);
        // The chain's first hop signals only VERTEX; the direct edge needs
        // FRAGMENT, so removing it would narrow the hazard window.
        add_edge(&mut matrix, 1, 0, StageFlags::VERTEX);
        add_edge(&mut matrix, 2, 1, StageFlags::COMPUTE);
        add_edge(&mut matrix, 2, 0, StageFlags::FRAGMENT);
        let stats = reduce(&mut matrix);
        assert_eq!(stats.edges_removed, 0);
        assert_eq!(stats.retained_for_stages, 1);
        assert!(matrix.get(2, 0).is_some());
    }

    #[test]
    fn superset_first_hop_allows_removal() {
        let mut matrix = DepMatrix::new(3);
        add_edge(&mut matrix, 1, 0, StageFlags::VERTEX | StageFlags::FRAGMENT);
        add_edge(&mut matrix, 2, 1, StageFlags::COMPUTE);
        add_edge(&mut matrix, 2, 0, StageFlags::FRAGMENT);
        let stats = reduce(&mut matrix);
        assert_eq!(stats.edges_removed, 1);
        assert!(matrix.get(2, 0).is_none());
    }

    #[test]
    fn reduction_preserves_reachability_on_a_dense_dag() {
        // Deterministic pseudo-random DAG over 24 encoders.
        let n = 24u32;
        let mut matrix = DepMatrix::new(n as usize);
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for dst in 1..n {
            for src in 0..dst {
                if next() % 4 == 0 {
                    add_edge(&mut matrix, dst, src, StageFlags::COMPUTE);
                }
            }
        }
        let before = closure(&matrix);
        let stats = reduce(&mut matrix);
        let after = closure(&matrix);
        assert_eq!(before, after, "reduction must not change reachability");
        assert!(stats.edges_removed > 0, "a dense DAG has redundant edges");
    }

    #[test]
    fn empty_matrix_reduces_to_nothing() {
        let mut matrix = DepMatrix::new(8);
        let stats = reduce(&mut matrix);
        assert_eq!(stats.edges_before, 0);
        assert_eq!(stats.edges_removed, 0);
    }
}

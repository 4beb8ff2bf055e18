//! Order in which a volume's missing frames are requested.

/// Request ordering policy for a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameOrder {
    /// Lowest frame index first.
    Sequential,
    /// Coarse to fine: every 2^k-th missing frame first, then the gaps
    /// between them, halving the stride each pass. A partially loaded volume
    /// then covers its whole extent at decreasing spacing.
    #[default]
    Interleaved,
}

impl FrameOrder {
    /// Reorder `frames` (ascending) according to the policy.
    pub fn apply(self, frames: &[usize]) -> Vec<usize> {
        match self {
            FrameOrder::Sequential => frames.to_vec(),
            FrameOrder::Interleaved => interleaved(frames),
        }
    }
}

fn interleaved(frames: &[usize]) -> Vec<usize> {
    let mut emitted = vec![false; frames.len()];
    let mut order = Vec::with_capacity(frames.len());
    let mut stride = frames.len().next_power_of_two();
    while stride > 0 {
        for position in (0..frames.len()).step_by(stride) {
            if !emitted[position] {
                emitted[position] = true;
                order.push(frames[position]);
            }
        }
        stride /= 2;
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_ten_frames() {
        let frames: Vec<usize> = (0..10).collect();
        assert_eq!(
            FrameOrder::Interleaved.apply(&frames),
            vec![0, 8, 4, 2, 6, 1, 3, 5, 7, 9]
        );
    }

    #[test]
    fn test_interleaved_is_a_permutation() {
        let frames = vec![3, 4, 9, 12, 13, 20, 41];
        let mut order = FrameOrder::Interleaved.apply(&frames);
        assert_eq!(order[0], 3);
        order.sort_unstable();
        assert_eq!(order, frames);
    }

    #[test]
    fn test_edge_sizes() {
        assert!(FrameOrder::Interleaved.apply(&[]).is_empty());
        assert_eq!(FrameOrder::Interleaved.apply(&[5]), vec![5]);
        assert_eq!(FrameOrder::Sequential.apply(&[2, 1]), vec![2, 1]);
    }
}

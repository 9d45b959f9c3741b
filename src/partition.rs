/// Sub-batch partitioning policies.
///
/// Each decode step the channel-resident request lists are split into two or
/// three sub-batches that then rotate across the platforms. Splits are
/// contiguous per channel: requests on one channel stay neighbors so their
/// attention work hits the same DRAM channel back to back. The policies only
/// differ in how per-channel remainders are spread so the sub-batch totals
/// stay within one request of each other.
use crate::stage::SubBatchMode;

/// A partitioning policy over the per-channel request queues.
pub trait SubBatchPartitioner {
    /// Split every channel's queue; returns one id list per sub-batch.
    /// Ids keep their channel-relative order.
    fn partition(&self, channel_queues: &[Vec<u32>]) -> Vec<Vec<u32>>;

    fn name(&self) -> &'static str;
}

/// Select the policy for a scheduling mode.
pub fn partitioner_for(mode: SubBatchMode) -> Box<dyn SubBatchPartitioner> {
    match mode {
        SubBatchMode::TwoWay => Box::new(TwoWayPartitioner),
        SubBatchMode::ThreeWay => Box::new(ThreeWayPartitioner),
    }
}

// ---------------------------------------------------------------------------
// Two-way: contiguous halves, odd remainders alternate sides
// ---------------------------------------------------------------------------

/// Splits each channel's queue into two contiguous halves. Odd-length
/// channels alternate between ceil-first and floor-first so the two
/// sub-batch totals stay balanced across the channel set.
pub struct TwoWayPartitioner;

impl SubBatchPartitioner for TwoWayPartitioner {
    fn partition(&self, channel_queues: &[Vec<u32>]) -> Vec<Vec<u32>> {
        let mut breq1 = Vec::new();
        let mut breq2 = Vec::new();
        let mut ceil_turn = true;

        for queue in channel_queues {
            let n = queue.len();
            let mut sb1 = n / 2;
            if n % 2 != 0 {
                sb1 = if ceil_turn { n.div_ceil(2) } else { n / 2 };
                ceil_turn = !ceil_turn;
            }
            breq1.extend_from_slice(&queue[..sb1]);
            breq2.extend_from_slice(&queue[sb1..]);
        }

        vec![breq1, breq2]
    }

    fn name(&self) -> &'static str {
        "two-way"
    }
}

// ---------------------------------------------------------------------------
// Three-way: contiguous thirds, remainder extras rotate round-robin
// ---------------------------------------------------------------------------

/// Splits each channel's queue into three contiguous parts of `n/3` with the
/// `n mod 3` extras handed to sub-batches `k, k+1 (mod 3)`, where `k`
/// advances by the remainder per channel. Over the channel set this deals
/// extras out strictly round-robin, so over any prefix of channels the three
/// sub-batch totals differ by at most one and the imbalance oscillates
/// instead of accumulating.
pub struct ThreeWayPartitioner;

impl SubBatchPartitioner for ThreeWayPartitioner {
    fn partition(&self, channel_queues: &[Vec<u32>]) -> Vec<Vec<u32>> {
        let mut breqs = vec![Vec::new(), Vec::new(), Vec::new()];
        let mut k = 0usize;

        for queue in channel_queues {
            let n = queue.len();
            let base = n / 3;
            let rem = n % 3;

            let mut sizes = [base; 3];
            for extra in 0..rem {
                sizes[(k + extra) % 3] += 1;
            }
            k = (k + rem) % 3;

            let mut offset = 0;
            for (breq, size) in breqs.iter_mut().zip(sizes) {
                breq.extend_from_slice(&queue[offset..offset + size]);
                offset += size;
            }
        }

        breqs
    }

    fn name(&self) -> &'static str {
        "three-way"
    }
}

//! Part-size policy for multipart transfers.

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Bodies at or below this size go up as one plain put.
pub const SINGLE_PART_THRESHOLD: u64 = 5 * MIB;

/// Chunking parameters for one multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub part_size: u64,
    pub concurrency: usize,
}

impl PartPlan {
    /// Number of parts needed to cover `total` bytes.
    pub fn part_count(&self, total: u64) -> u64 {
        total.div_ceil(self.part_size)
    }
}

/// Picks part size and in-flight part limit for a body of `total` bytes.
/// Part size and concurrency never shrink as the total grows. A total of
/// zero means the size is unknown and gets the smallest tier.
pub fn plan_for_size(total: u64) -> PartPlan {
    let (part_size, concurrency) = if total >= 2 * GIB {
        (100 * MIB, 10)
    } else if total >= 500 * MIB {
        (50 * MIB, 8)
    } else if total >= 100 * MIB {
        (20 * MIB, 6)
    } else if total >= 50 * MIB {
        (10 * MIB, 4)
    } else {
        (5 * MIB, 4)
    };
    PartPlan {
        part_size,
        concurrency,
    }
}

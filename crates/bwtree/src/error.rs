use snafu::prelude::*;

/// Construction-time errors. Once a tree exists, operations never fail
/// fatally: semantic misses are reported through their boolean returns and
/// contention is retried internally.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("mapping table capacity {capacity} is too small (need at least 2 slots)"))]
    MappingTableCapacity { capacity: usize },

    #[snafu(display("delta chain threshold must be at least 1"))]
    DeltaChainThreshold,

    #[snafu(display("leaf size bounds are inverted: lower {lower} must be less than upper {upper}"))]
    LeafSizeBounds { lower: usize, upper: usize },

    #[snafu(display("inner size bounds are inverted: lower {lower} must be less than upper {upper}"))]
    InnerSizeBounds { lower: usize, upper: usize },

    #[snafu(display("leaf split needs an upper bound of at least 2, got {upper}"))]
    LeafUpperTooSmall { upper: usize },

    #[snafu(display("inner split needs an upper bound of at least 2, got {upper}"))]
    InnerUpperTooSmall { upper: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

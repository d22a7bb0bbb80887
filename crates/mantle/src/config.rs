//! Tunable constants for the runtime, grouped the way the upstream ring
//! buffer groups its own `Config`: a validated constructor plus a couple of
//! named presets.

/// Cache-line size assumed for alignment and non-temporal store sizing.
pub const CACHE_LINE_SIZE: usize = 64;

/// Number of [`crate::operation::Operation`]s per
/// [`crate::operation::OperationBatch`] (`CACHE_LINE_SIZE / size_of::<Operation>()`).
pub const OPERATIONS_PER_BATCH: usize = CACHE_LINE_SIZE / 8;

/// Default write-barrier segment capacity, in pointers (~16 Ki).
pub const DEFAULT_SEGMENT_CAPACITY: usize = 16 * 1024;

/// Operation grouper cache size (entries).
pub const OPERATION_GROUPER_CACHE_SIZE: usize = 512;

/// Operation grouper associativity (ways per set).
pub const OPERATION_GROUPER_CACHE_WAYS: usize = 8;

/// Fixed capacity, in messages, of a region/domain [`crate::stream::Stream`].
pub const STREAM_CAPACITY: usize = 4096;

/// History depth of `SequenceRangeHistory` used by the fallback ledger.
pub const TRANSACTION_LOG_HISTORY: usize = 4;

/// Sentinel region id for an unbound object.
pub const INVALID_REGION_ID: u16 = u16::MAX;

/// Maximum operation exponent (weighted-reference magnitude `2^e`).
pub const EXPONENT_MAX: u8 = 7;

/// Runtime configuration for a [`crate::domain::Domain`] and the regions
/// bound to it.
///
/// Mirrors the shape of the upstream ring buffer's `Config`: a handful of
/// named fields, a validating constructor, and a couple of presets tuned
/// for different latency/throughput tradeoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Pointers per write-barrier segment. Must be a power of two and at
    /// least one page's worth of pointers.
    pub segment_capacity: usize,
    /// Whether the operation grouper is enabled. When disabled, every
    /// operation is routed straight through uncached (`flush = true`).
    pub operation_grouper_enabled: bool,
    /// Whether the object grouper bucketing is enabled. When disabled,
    /// `ObjectGrouper::flush` returns objects in encounter order with no
    /// group partitioning (a pure no-op pass-through); finalization
    /// correctness does not depend on this, only its batching efficiency.
    pub object_grouper_enabled: bool,
}

impl Config {
    /// Builds a new configuration, validating `segment_capacity`.
    ///
    /// # Panics
    /// Panics if `segment_capacity` is not a power of two.
    #[must_use]
    pub fn new(segment_capacity: usize, operation_grouper_enabled: bool, object_grouper_enabled: bool) -> Self {
        assert!(
            segment_capacity.is_power_of_two(),
            "segment_capacity must be a power of two, got {segment_capacity}"
        );

        Self {
            segment_capacity,
            operation_grouper_enabled,
            object_grouper_enabled,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_CAPACITY, true, true)
    }
}

/// Smaller segments trade throughput for a tighter barrier cadence: the
/// domain resolves a page fault (and so observes a region's progress) more
/// often.
pub const LOW_LATENCY_CONFIG: Config = Config {
    segment_capacity: 2 * 1024,
    operation_grouper_enabled: true,
    object_grouper_enabled: true,
};

/// Larger segments amortize page-fault handling over more operations at
/// the cost of coarser barrier granularity.
pub const HIGH_THROUGHPUT_CONFIG: Config = Config {
    segment_capacity: 64 * 1024,
    operation_grouper_enabled: true,
    object_grouper_enabled: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.segment_capacity, DEFAULT_SEGMENT_CAPACITY);
        assert!(config.operation_grouper_enabled);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_capacity() {
        Config::new(100, true, true);
    }

    #[test]
    fn presets_are_valid() {
        assert!(LOW_LATENCY_CONFIG.segment_capacity.is_power_of_two());
        assert!(HIGH_THROUGHPUT_CONFIG.segment_capacity.is_power_of_two());
        assert!(LOW_LATENCY_CONFIG.segment_capacity < HIGH_THROUGHPUT_CONFIG.segment_capacity);
    }
}

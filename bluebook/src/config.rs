//! VM-wide tuning values.
//!
//! Built once at startup (from defaults and command line overrides) and
//! handed to the [`Interpreter`](crate::Interpreter), which keeps it for its
//! whole lifetime.

/// Configuration for the object table, the lookup caches and the interrupt
/// polling feedback loop.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of entries in the method lookup cache. Must be a power of two.
    pub method_cache_size: usize,
    /// Number of probes tried before an entry is evicted.
    pub method_cache_probes: usize,
    /// Number of entries in each of the `at:` / `at:put:` caches. Power of two.
    pub at_cache_size: usize,
    /// Initial capacity of the object table.
    pub table_size: usize,
    /// Hard capacity ceiling of the object table.
    pub table_max_size: usize,
    /// Number of slots added when the table grows.
    pub table_grow_size: usize,
    /// Partial compactions attempted before the table grows.
    pub compaction_attempts: usize,
    /// Stack slots in a small context frame.
    pub small_frame_size: usize,
    /// Stack slots in a large context frame.
    pub large_frame_size: usize,
    /// Lower bound for the interrupt countdown reset value.
    pub interrupt_reset_floor: i32,
    /// Added to the reset value when checks run more often than `interrupt_target_ms`.
    pub interrupt_reset_increment: i32,
    /// Subtracted from the reset value otherwise.
    pub interrupt_reset_decrement: i32,
    /// Desired milliseconds between two interrupt checks.
    pub interrupt_target_ms: i64,
    /// Milliseconds between two input polls.
    pub poll_interval_ms: i64,
    /// Keyboard queue depth before further keys are dropped.
    pub typeahead_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            method_cache_size: 1024,
            method_cache_probes: 4,
            at_cache_size: 32,
            table_size: 500_000,
            table_max_size: 1_600_000,
            table_grow_size: 10_000,
            compaction_attempts: 5,
            small_frame_size: 16,
            large_frame_size: 56,
            interrupt_reset_floor: 1000,
            interrupt_reset_increment: 10,
            interrupt_reset_decrement: 12,
            interrupt_target_ms: 3,
            poll_interval_ms: 500,
            typeahead_limit: 8,
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.method_cache_size.is_power_of_two() {
            return Err("method_cache_size must be a power of two");
        }
        if !self.at_cache_size.is_power_of_two() {
            return Err("at_cache_size must be a power of two");
        }
        if self.method_cache_probes == 0 {
            return Err("method_cache_probes must be > 0");
        }
        if self.table_size == 0 || self.table_grow_size == 0 {
            return Err("table sizes must be > 0");
        }
        if self.table_size > self.table_max_size {
            return Err("table_size exceeds table_max_size");
        }
        if self.small_frame_size == 0 || self.large_frame_size < self.small_frame_size {
            return Err("large_frame_size must be >= small_frame_size > 0");
        }
        if self.interrupt_reset_floor <= 0 {
            return Err("interrupt_reset_floor must be > 0");
        }
        Ok(())
    }

    /// A configuration with a small object table, used by tests and benches.
    pub fn compact() -> Self {
        Self {
            table_size: 1024,
            table_max_size: 64 * 1024,
            table_grow_size: 256,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(VmConfig::default().validate().is_ok());
        assert!(VmConfig::compact().validate().is_ok());
    }

    #[test]
    fn rejects_odd_cache_size() {
        let config = VmConfig {
            method_cache_size: 1000,
            ..VmConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

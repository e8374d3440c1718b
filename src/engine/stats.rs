//! Execution counters and the simulated cycle tally

use std::fmt;

use serde::{Deserialize, Serialize};

/// Counters for one batch, or accumulated over an engine session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Operations executed
    pub ops_executed: u64,
    /// Transitions GpuHbm -> SharedMemory
    pub moves_to_shared: u64,
    /// Transitions SharedMemory -> GpuHbm
    pub moves_to_hbm: u64,
    /// Floats carried by tier transitions
    pub floats_transferred: u64,
    /// Floating-point operations performed by compute kernels
    pub flops: u64,
    /// Highest number of floats resident on-chip at any point
    pub peak_on_chip_floats: u64,
    /// Cycles charged by the cost model
    pub simulated_cycles: f64,
}

impl RunStats {
    /// Fold another set of counters into this one
    pub fn merge(&mut self, other: &RunStats) {
        self.ops_executed += other.ops_executed;
        self.moves_to_shared += other.moves_to_shared;
        self.moves_to_hbm += other.moves_to_hbm;
        self.floats_transferred += other.floats_transferred;
        self.flops += other.flops;
        self.peak_on_chip_floats = self.peak_on_chip_floats.max(other.peak_on_chip_floats);
        self.simulated_cycles += other.simulated_cycles;
    }

    /// Total tier transitions in either direction
    #[must_use]
    pub fn transfers(&self) -> u64 {
        self.moves_to_shared + self.moves_to_hbm
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops={} transfers={} (to_shared={}, to_hbm={}) floats_moved={} flops={} peak_on_chip={} cycles={:.1}",
            self.ops_executed,
            self.transfers(),
            self.moves_to_shared,
            self.moves_to_hbm,
            self.floats_transferred,
            self.flops,
            self.peak_on_chip_floats,
            self.simulated_cycles
        )
    }
}

/// Outcome of one successful [`Engine::run`](crate::Engine::run)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Operations drained from the queue
    pub drained: usize,
    /// Counters for this batch
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_and_keeps_peak() {
        let mut total = RunStats {
            ops_executed: 2,
            peak_on_chip_floats: 10,
            simulated_cycles: 1.5,
            ..RunStats::default()
        };
        let batch = RunStats {
            ops_executed: 3,
            moves_to_shared: 1,
            floats_transferred: 4,
            peak_on_chip_floats: 7,
            simulated_cycles: 0.5,
            ..RunStats::default()
        };
        total.merge(&batch);
        assert_eq!(total.ops_executed, 5);
        assert_eq!(total.transfers(), 1);
        assert_eq!(total.peak_on_chip_floats, 10);
        assert_eq!(total.simulated_cycles, 2.0);
    }

    #[test]
    fn test_display() {
        let stats = RunStats {
            ops_executed: 1,
            ..RunStats::default()
        };
        assert!(stats.to_string().starts_with("ops=1 transfers=0"));
    }
}

//! Command-line / environment configuration for the rebalancer.
//!
//! Binaries flatten [`RebalanceArgs`] into their own clap parser and convert
//! it with [`RebalanceArgs::coordinator_config`]. Out-of-range values are
//! clamped here so the core can assume sane limits.

use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::{CoordinatorConfig, LaunchControllerConfig, ScalingMode};
use crate::directory::DEFAULT_DIRECTORY_CAPACITY;
use crate::planner::ClayConfig;
use crate::push::{PushBudget, PushConfig, PushSelection};

#[derive(clap::Args, Clone, Debug)]
pub struct RebalanceArgs {
    /// Partition served by this node.
    #[arg(long, env = "HOLO_CLAY_LOCAL_PARTITION", default_value_t = 0)]
    pub local_partition: usize,

    /// Number of partitions, including one being added or retired by scaling.
    #[arg(long, env = "HOLO_CLAY_NUM_PARTITIONS", default_value_t = 4)]
    pub num_partitions: usize,

    /// Length of one monitoring window (ms).
    #[arg(long, env = "HOLO_CLAY_MONITORING_MS", default_value_t = 5_000)]
    pub monitoring_ms: u64,

    /// Weight of co-access edges that cross partitions.
    #[arg(long, env = "HOLO_CLAY_MULTI_PARTS_COST", default_value_t = 1.0)]
    pub multi_parts_cost: f64,

    /// A partition above `mean * overload_percentage` is overloaded.
    #[arg(long, env = "HOLO_CLAY_OVERLOAD_PERCENTAGE", default_value_t = 1.3)]
    pub overload_percentage: f64,

    #[arg(long, env = "HOLO_CLAY_LOOK_AHEAD_MAX", default_value_t = 5)]
    pub look_ahead_max: usize,

    #[arg(long, env = "HOLO_CLAY_CLUMP_MAX_SIZE", default_value_t = 20)]
    pub clump_max_size: usize,

    #[arg(long, env = "HOLO_CLAY_MAX_CLUMPS", default_value_t = 5_000)]
    pub max_clumps: usize,

    /// Slots in the in-memory tier of the location directory.
    #[arg(long, env = "HOLO_CLAY_DIRECTORY_CAPACITY", default_value_t = DEFAULT_DIRECTORY_CAPACITY)]
    pub directory_capacity: usize,

    #[arg(long, env = "HOLO_CLAY_SCALING", value_enum, default_value_t = ScalingMode::Disabled)]
    pub scaling: ScalingMode,

    /// Migrate predefined range plans first when scaling.
    #[arg(long, env = "HOLO_CLAY_USE_PREDEFINED_PLAN", default_value_t = false)]
    pub use_predefined_plan: bool,

    #[arg(long, env = "HOLO_CLAY_PUSH_COUNT", default_value_t = 1_000)]
    pub push_count: usize,

    #[arg(long, env = "HOLO_CLAY_PUSH_BYTES", default_value_t = 4_000_000)]
    pub push_bytes: usize,

    #[arg(long, env = "HOLO_CLAY_PUSH_SELECTION", value_enum, default_value_t = PushSelection::RoundRobin)]
    pub push_selection: PushSelection,

    #[arg(long, env = "HOLO_CLAY_PUSH_BUDGET", value_enum, default_value_t = PushBudget::Count)]
    pub push_budget: PushBudget,

    /// Background push round interval (ms).
    #[arg(long, env = "HOLO_CLAY_PUSH_INTERVAL_MS", default_value_t = 100)]
    pub push_interval_ms: u64,

    /// Delay before the first Clay launch (ms).
    #[arg(long, env = "HOLO_CLAY_START_DELAY_MS", default_value_t = 10_000)]
    pub start_delay_ms: u64,

    /// Period between Clay launches (ms).
    #[arg(long, env = "HOLO_CLAY_LAUNCH_PERIOD_MS", default_value_t = 60_000)]
    pub launch_period_ms: u64,

    /// Stop launching Clay this long after the first launch (ms).
    #[arg(long, env = "HOLO_CLAY_STOP_AFTER_MS", default_value_t = 600_000)]
    pub stop_after_ms: u64,

    /// Write the access graph of each window as JSON into this directory.
    #[arg(long, env = "HOLO_CLAY_GRAPH_SNAPSHOT_DIR")]
    pub graph_snapshot_dir: Option<PathBuf>,
}

impl RebalanceArgs {
    pub fn clay_config(&self) -> ClayConfig {
        ClayConfig {
            multi_parts_cost: self.multi_parts_cost.max(0.0),
            overload_percentage: self.overload_percentage.max(1.0),
            look_ahead_max: self.look_ahead_max.max(1),
            clump_max_size: self.clump_max_size.max(1),
            max_clumps: self.max_clumps.max(1),
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            pushing_count: self.push_count.max(1),
            pushing_byte_count: self.push_bytes.max(1),
            selection: self.push_selection,
            budget: self.push_budget,
            interval: Duration::from_millis(self.push_interval_ms.max(1)),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let num_partitions = self.num_partitions.max(1);
        CoordinatorConfig {
            local_partition: self.local_partition.min(num_partitions - 1),
            num_partitions,
            monitoring_window: Duration::from_millis(self.monitoring_ms),
            scaling: self.scaling,
            use_predefined_plan: self.use_predefined_plan,
            directory_capacity: self.directory_capacity.max(1),
            clay: self.clay_config(),
            push: self.push_config(),
            graph_snapshot_dir: self.graph_snapshot_dir.clone(),
        }
    }

    pub fn launch_controller_config(&self) -> LaunchControllerConfig {
        LaunchControllerConfig {
            initial_delay: Duration::from_millis(self.start_delay_ms),
            period: Duration::from_millis(self.launch_period_ms.max(1)),
            stop_after: Duration::from_millis(self.stop_after_ms),
            once: self.scaling != ScalingMode::Disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        rebalance: RebalanceArgs,
    }

    #[test]
    fn defaults_match_component_defaults() {
        let cli = TestCli::try_parse_from(["test"]).expect("parse");
        let cfg = cli.rebalance.coordinator_config();
        assert_eq!(cfg.clay, ClayConfig::default());
        assert_eq!(cfg.directory_capacity, DEFAULT_DIRECTORY_CAPACITY);
        assert_eq!(cfg.push.pushing_count, 1000);
        assert_eq!(cfg.push.selection, PushSelection::RoundRobin);
        assert_eq!(cfg.monitoring_window, Duration::from_secs(5));
        assert!(!cli.rebalance.launch_controller_config().once);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cli = TestCli::try_parse_from([
            "test",
            "--num-partitions",
            "0",
            "--local-partition",
            "9",
            "--overload-percentage",
            "0.5",
            "--clump-max-size",
            "0",
            "--push-count",
            "0",
            "--scaling",
            "scale-out",
            "--push-selection",
            "largest-table-first",
        ])
        .expect("parse");
        let cfg = cli.rebalance.coordinator_config();
        assert_eq!(cfg.num_partitions, 1);
        assert_eq!(cfg.local_partition, 0);
        assert_eq!(cfg.clay.overload_percentage, 1.0);
        assert_eq!(cfg.clay.clump_max_size, 1);
        assert_eq!(cfg.push.pushing_count, 1);
        assert_eq!(cfg.scaling, ScalingMode::ScaleOut);
        assert_eq!(cfg.push.selection, PushSelection::LargestTableFirst);
        assert!(cli.rebalance.launch_controller_config().once);
    }
}

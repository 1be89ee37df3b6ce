//! Online data rebalancing for a partitioned OLTP store.
//!
//! The crate watches transaction access sets, builds a weighted co-access
//! graph, and uses the Clay heuristic to carve clumps of hot, co-accessed
//! records off overloaded partitions. [`MigrationCoordinator`] drives the
//! monitor → plan → migrate loop one unit at a time while transactions keep
//! running, and [`PartitionMap`] answers "where does this key live now" from
//! a bounded-memory override directory.
//!
//! Physical data movement, locking and transport belong to the host system;
//! it plugs in through [`PartitionFunction`], [`MigrationExecutor`],
//! [`PushTransport`] and [`ColdMigrationPlanner`].

pub mod clump;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod graph;
pub mod key;
pub mod partition;
pub mod plan;
pub mod planner;
pub mod push;

pub use config::RebalanceArgs;
pub use coordinator::{
    spawn_launch_controller, ControlRequest, CoordinatorConfig, CoordinatorPhase, LaunchControllerConfig,
    MigrationCoordinator, MigrationExecutor, PhaseFlags, ScalingMode,
};
pub use directory::LocationDirectory;
pub use error::{as_invariant_violation, InvariantViolation};
pub use key::{KeyRange, PartitionId, RecordKey};
pub use partition::{ColdMigrationPlanner, PartitionFunction, PartitionMap, RangePartitioner};
pub use plan::{MigrationPayload, MigrationPlan, MigrationRequest, MigrationScope, MigrationUnit};
pub use planner::{ClayConfig, ClayPlanner};
pub use push::{PushBudget, PushCandidates, PushConfig, PushSelection, PushTransport};

//! Clay control loop: monitor → plan → migrate, one unit at a time.
//!
//! The coordinator is owned by the scheduler thread. Everything that other
//! threads may read (the background pusher, the launch controller) goes
//! through [`PhaseFlags`] atomics or the mutex-guarded push candidates.
//!
//! Per-unit bookkeeping differs by role. The source node tags keys it still
//! has to ship (new inserts and keys found by analysis) and flips a tag once
//! the key was pushed in the foreground. Other nodes remember keys confirmed
//! migrated and otherwise compare the current location with the unit's
//! source and destination.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::directory::DEFAULT_DIRECTORY_CAPACITY;
use crate::error::{as_invariant_violation, InvariantViolation};
use crate::key::{PartitionId, RecordKey};
use crate::partition::{ColdMigrationPlanner, PartitionFunction, PartitionMap};
use crate::plan::{MigrationPlan, MigrationRequest, MigrationUnit};
use crate::planner::{ClayConfig, ClayPlanner};
use crate::push::{spawn_background_push, PushCandidates, PushConfig, PushTransport};

/// Lock-free view of the coordinator state for other threads.
#[derive(Debug, Default)]
pub struct PhaseFlags {
    monitoring: AtomicBool,
    analyzing: AtomicBool,
    migrating: AtomicBool,
    migrated: AtomicBool,
    clay_operating: AtomicBool,
    scaled: AtomicBool,
}

impl PhaseFlags {
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    pub fn is_analyzing(&self) -> bool {
        self.analyzing.load(Ordering::Acquire)
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::Acquire)
    }

    /// The last unit finished and no other is in flight.
    pub fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    /// A Clay round is between launch and completion.
    pub fn is_clay_operating(&self) -> bool {
        self.clay_operating.load(Ordering::Acquire)
    }

    pub fn is_scaled(&self) -> bool {
        self.scaled.load(Ordering::Acquire)
    }

    pub(crate) fn set_monitoring(&self, value: bool) {
        self.monitoring.store(value, Ordering::Release);
    }

    pub(crate) fn set_analyzing(&self, value: bool) {
        self.analyzing.store(value, Ordering::Release);
    }

    pub(crate) fn set_migrating(&self, value: bool) {
        self.migrating.store(value, Ordering::Release);
    }

    pub(crate) fn set_migrated(&self, value: bool) {
        self.migrated.store(value, Ordering::Release);
    }

    pub(crate) fn set_clay_operating(&self, value: bool) {
        self.clay_operating.store(value, Ordering::Release);
    }

    pub(crate) fn set_scaled(&self, value: bool) {
        self.scaled.store(value, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Idle,
    Monitoring,
    Planning,
    Migrating,
    /// Round done; the next launch starts monitoring again.
    Completed,
    /// Node scaling done.
    Finished,
    /// A fatal invariant violation was hit; no further work is accepted.
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ScalingMode {
    Disabled,
    /// The newest partition `num_partitions - 1` joins the cluster.
    ScaleOut,
    /// One partition is drained and retired.
    Consolidate,
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Partition served by this node.
    pub local_partition: PartitionId,
    /// Partition count including any partition added or retired by scaling.
    pub num_partitions: usize,
    pub monitoring_window: Duration,
    pub scaling: ScalingMode,
    /// Under scaling, migrate the cold plans before consulting Clay.
    pub use_predefined_plan: bool,
    pub directory_capacity: usize,
    pub clay: ClayConfig,
    pub push: PushConfig,
    /// Write the access graph here as JSON after each monitoring window.
    pub graph_snapshot_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_partition: 0,
            num_partitions: 2,
            monitoring_window: Duration::from_secs(5),
            scaling: ScalingMode::Disabled,
            use_predefined_plan: false,
            directory_capacity: DEFAULT_DIRECTORY_CAPACITY,
            clay: ClayConfig::default(),
            push: PushConfig::default(),
            graph_snapshot_dir: None,
        }
    }
}

/// Where a key stands relative to the unit in flight.
enum KeyState {
    Migrated,
    Pending,
    /// Found on neither side of the unit.
    Diverged {
        found: PartitionId,
        source: PartitionId,
        dest: PartitionId,
    },
}

/// Turns a migration request into an external migration transaction.
pub trait MigrationExecutor: Send + 'static {
    fn submit(&mut self, request: MigrationRequest) -> anyhow::Result<()>;
}

/// Requests delivered to the scheduler by the launch controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    LaunchClay,
}

struct BackgroundPush {
    transport: Arc<dyn PushTransport>,
    runtime: tokio::runtime::Handle,
    task: Option<JoinHandle<()>>,
}

pub struct MigrationCoordinator<P, E> {
    cfg: CoordinatorConfig,
    flags: Arc<PhaseFlags>,
    phase: CoordinatorPhase,
    planner: ClayPlanner,
    partitions: PartitionMap<P>,
    cold_planner: Option<Box<dyn ColdMigrationPlanner>>,
    executor: E,

    round: u64,
    monitor_deadline: Option<Instant>,
    cold_migrated: bool,
    consolidated: bool,

    queued: VecDeque<MigrationUnit>,
    active: Option<MigrationUnit>,
    /// Source node: key → already pushed.
    new_inserted: HashMap<RecordKey, bool>,
    analyzed: HashMap<RecordKey, bool>,
    /// Other nodes: keys confirmed migrated.
    migrated_keys: HashSet<RecordKey>,

    candidates: Arc<PushCandidates>,
    skip_tx: mpsc::UnboundedSender<RecordKey>,
    push: Option<BackgroundPush>,
}

impl<P: PartitionFunction, E: MigrationExecutor> MigrationCoordinator<P, E> {
    pub fn new(cfg: CoordinatorConfig, function: P, executor: E) -> Self {
        let candidates = Arc::new(PushCandidates::new());
        let skip_tx = candidates.skip_sender();
        Self {
            planner: ClayPlanner::new(cfg.clay),
            partitions: PartitionMap::new(function, cfg.directory_capacity),
            cfg,
            flags: Arc::new(PhaseFlags::default()),
            phase: CoordinatorPhase::Idle,
            cold_planner: None,
            executor,
            round: 0,
            monitor_deadline: None,
            cold_migrated: false,
            consolidated: false,
            queued: VecDeque::new(),
            active: None,
            new_inserted: HashMap::new(),
            analyzed: HashMap::new(),
            migrated_keys: HashSet::new(),
            candidates,
            skip_tx,
            push: None,
        }
    }

    /// Source of predefined plans for node scaling.
    pub fn with_cold_planner(mut self, planner: Box<dyn ColdMigrationPlanner>) -> Self {
        self.cold_planner = Some(planner);
        self
    }

    /// Run a background pusher on `runtime` whenever this node is the
    /// source of the unit in flight.
    pub fn with_background_push(mut self, transport: Arc<dyn PushTransport>, runtime: tokio::runtime::Handle) -> Self {
        self.push = Some(BackgroundPush {
            transport,
            runtime,
            task: None,
        });
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    pub fn flags(&self) -> Arc<PhaseFlags> {
        self.flags.clone()
    }

    pub fn planner(&self) -> &ClayPlanner {
        &self.planner
    }

    pub fn partitions(&self) -> &PartitionMap<P> {
        &self.partitions
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn push_candidates(&self) -> &Arc<PushCandidates> {
        &self.candidates
    }

    pub fn active_unit(&self) -> Option<&MigrationUnit> {
        self.active.as_ref()
    }

    pub fn queued_units(&self) -> usize {
        self.queued.len()
    }

    /// Whether a background pusher was started for the unit in flight and
    /// has not exited yet.
    pub fn background_push_running(&self) -> bool {
        self.push
            .as_ref()
            .and_then(|push| push.task.as_ref())
            .is_some_and(|task| !task.is_finished())
    }

    /// Partitions in service: a partition added by scale-out counts once
    /// scaling started, a partition drained by consolidation stops counting.
    pub fn current_num_partitions(&self) -> usize {
        let bound = self.planning_bound();
        bound.saturating_sub(self.planner.retired_count(bound))
    }

    /// Clay plans over `0..planning_bound()`, skipping retired partitions.
    fn planning_bound(&self) -> usize {
        let n = self.cfg.num_partitions;
        if self.cfg.scaling == ScalingMode::ScaleOut && !self.flags.is_scaled() {
            n.saturating_sub(1)
        } else {
            n
        }
    }

    pub fn handle_control(&mut self, request: ControlRequest, now: Instant) -> anyhow::Result<()> {
        match request {
            ControlRequest::LaunchClay => self.launch(now),
        }
    }

    /// Start a Clay round unless one is still running.
    pub fn launch(&mut self, now: Instant) -> anyhow::Result<()> {
        self.ensure_running()?;
        if self.flags.is_clay_operating() {
            tracing::warn!(phase = ?self.phase, "clay is still operating; ignoring launch request");
            return Ok(());
        }
        self.start_monitoring(now);
        Ok(())
    }

    pub fn start_monitoring(&mut self, now: Instant) {
        self.round += 1;
        self.planner.reset();
        self.flags.set_monitoring(true);
        self.flags.set_clay_operating(true);
        self.monitor_deadline = Some(now + self.cfg.monitoring_window);
        self.phase = CoordinatorPhase::Monitoring;
        tracing::info!(
            round = self.round,
            window_ms = self.cfg.monitoring_window.as_millis() as u64,
            "clay monitoring started"
        );
    }

    /// Feed one transaction's access set. Ignored outside monitoring.
    pub fn on_transaction_observed(&mut self, keys: &[RecordKey], now: Instant) -> anyhow::Result<()> {
        self.ensure_running()?;
        if self.phase != CoordinatorPhase::Monitoring {
            return Ok(());
        }
        if let Err(err) = self.planner.monitor_transaction(keys, &self.partitions) {
            return Err(self.abort_on_violation(err));
        }

        let window_elapsed = self.monitor_deadline.map_or(true, |deadline| now >= deadline);
        let predefined_scaling = self.cfg.scaling != ScalingMode::Disabled && self.cfg.use_predefined_plan;
        if window_elapsed || predefined_scaling {
            self.stop_monitoring(now)?;
        }
        Ok(())
    }

    fn stop_monitoring(&mut self, now: Instant) -> anyhow::Result<()> {
        self.flags.set_monitoring(false);
        self.monitor_deadline = None;
        if self.cfg.scaling != ScalingMode::Disabled {
            self.flags.set_scaled(true);
        }
        self.phase = CoordinatorPhase::Planning;
        tracing::info!(
            round = self.round,
            vertices = self.planner.graph().len(),
            "clay monitoring stopped"
        );

        if let Some(dir) = &self.cfg.graph_snapshot_dir {
            let path = dir.join(format!("heatgraph_{}.json", self.round));
            if let Err(err) = self.planner.graph().write_snapshot(&path) {
                tracing::warn!(error = ?err, path = %path.display(), "failed to write access graph snapshot");
            }
        }

        let units = match self.generate_units() {
            Ok(units) => units,
            Err(err) => {
                self.finish_clay();
                return Err(err);
            }
        };
        self.queued = units.into();
        self.trigger_next_migration(now)
    }

    fn generate_units(&mut self) -> anyhow::Result<Vec<MigrationUnit>> {
        let predefined = self.cfg.use_predefined_plan && !self.cold_migrated;
        let n = self.cfg.num_partitions;
        match self.cfg.scaling {
            ScalingMode::ScaleOut if predefined => Ok(self.cold_planner()?.scale_out_plans(n)),
            ScalingMode::Consolidate if predefined => {
                let retiring = n.saturating_sub(1);
                let units = self.cold_planner()?.consolidation_plans(retiring, n);
                self.planner.retire_partition(retiring);
                Ok(units)
            }
            ScalingMode::Consolidate if !self.cfg.use_predefined_plan && !self.consolidated => {
                let Some(retiring) = self.planner.find_least_load_partition(n) else {
                    return Ok(Vec::new());
                };
                tracing::info!(retiring, "consolidating least loaded partition");
                let units = self.cold_planner()?.consolidation_plans(retiring, n);
                self.planner.retire_partition(retiring);
                Ok(units)
            }
            _ => {
                let plan = self.planner.generate_plan(self.planning_bound())?;
                Ok(plan.map(MigrationPlan::into_units).unwrap_or_default())
            }
        }
    }

    fn cold_planner(&self) -> anyhow::Result<&dyn ColdMigrationPlanner> {
        match &self.cold_planner {
            Some(planner) => Ok(planner.as_ref()),
            None => anyhow::bail!("node scaling requires a cold migration planner"),
        }
    }

    /// Dispatch the next queued unit, or wrap up the round.
    fn trigger_next_migration(&mut self, now: Instant) -> anyhow::Result<()> {
        if let Some(unit) = self.queued.pop_front() {
            return self.dispatch(unit);
        }

        match self.cfg.scaling {
            ScalingMode::Disabled => self.finish_clay(),
            ScalingMode::ScaleOut | ScalingMode::Consolidate
                if self.cfg.use_predefined_plan && !self.cold_migrated =>
            {
                self.cold_migrated = true;
                self.finish_clay();
            }
            ScalingMode::Consolidate if !self.cfg.use_predefined_plan && !self.consolidated => {
                self.consolidated = true;
                self.finish_clay();
                // Rebalance what the retired partition left behind.
                self.start_monitoring(now);
            }
            _ => self.finish_clay(),
        }
        Ok(())
    }

    fn dispatch(&mut self, unit: MigrationUnit) -> anyhow::Result<()> {
        self.reset_round_state();
        let request = unit.to_request();
        let is_source = unit.source == self.cfg.local_partition;
        let (source, dest) = (unit.source, unit.dest);
        self.active = Some(unit);
        self.flags.set_analyzing(is_source);
        self.flags.set_migrating(true);
        self.flags.set_migrated(false);
        self.phase = CoordinatorPhase::Migrating;
        tracing::info!(%request, remaining = self.queued.len(), "dispatching migration unit");

        if let Err(err) = self.executor.submit(request) {
            self.flags.set_migrating(false);
            self.flags.set_analyzing(false);
            self.active = None;
            self.queued.clear();
            self.finish_clay();
            return Err(err).context("submit migration request");
        }

        if is_source {
            self.start_background_push(source, dest);
        }
        Ok(())
    }

    fn start_background_push(&mut self, source: PartitionId, dest: PartitionId) {
        let Some(push) = self.push.as_mut() else {
            return;
        };
        let _guard = push.runtime.enter();
        push.task = Some(spawn_background_push(
            self.candidates.clone(),
            self.flags.clone(),
            push.transport.clone(),
            source,
            dest,
            self.cfg.push,
        ));
    }

    /// The migration transaction of the unit in flight committed at `now`.
    pub fn on_unit_committed(&mut self, now: Instant) -> anyhow::Result<()> {
        self.ensure_running()?;
        let Some(unit) = self.active.take() else {
            anyhow::bail!("no migration unit in flight");
        };
        self.flags.set_migrating(false);
        self.flags.set_analyzing(false);
        self.flags.set_migrated(true);
        if let Some(task) = self.push.as_mut().and_then(|push| push.task.take()) {
            // The next unit may start before this pusher's next tick.
            task.abort();
        }
        self.reset_round_state();
        tracing::info!(source = unit.source, dest = unit.dest, keys = unit.key_count(), "migration unit committed");
        self.trigger_next_migration(now)
    }

    /// The keys now live on the destination of the unit in flight.
    pub fn record_relocated(&mut self, keys: &[RecordKey]) -> anyhow::Result<()> {
        self.ensure_running()?;
        let Some((source, dest)) = self.active.as_ref().map(|u| (u.source, u.dest)) else {
            anyhow::bail!("no migration unit in flight");
        };
        let is_source = source == self.cfg.local_partition;
        for key in keys {
            if is_source {
                self.mark_pushed(key);
            }
            self.partitions.set_current_location(key, dest);
        }
        Ok(())
    }

    /// The keys were shipped by a foreground push.
    pub fn record_migrated(&mut self, keys: &[RecordKey]) -> anyhow::Result<()> {
        self.ensure_running()?;
        if self.is_local_source() {
            for key in keys {
                self.mark_pushed(key);
            }
        } else {
            self.migrated_keys.extend(keys.iter().cloned());
        }
        Ok(())
    }

    /// Whether `key` already left the source of the unit in flight.
    ///
    /// On a non-source node a key of the unit found on neither side of it
    /// means the placement metadata diverged; the coordinator aborts.
    pub fn is_record_migrated(&mut self, key: &RecordKey) -> anyhow::Result<bool> {
        self.ensure_running()?;
        match self.key_state(key) {
            KeyState::Migrated => Ok(true),
            KeyState::Pending => Ok(false),
            KeyState::Diverged { found, source, dest } => {
                let violation = InvariantViolation::LocationDiverged {
                    key: key.clone(),
                    found,
                    source_part: source,
                    dest_part: dest,
                };
                Err(self.abort_on_violation(violation.into()))
            }
        }
    }

    /// Non-failing variant of [`is_record_migrated`](Self::is_record_migrated);
    /// a diverged key reads as not migrated.
    pub fn is_key_migrated(&self, key: &RecordKey) -> bool {
        matches!(self.key_state(key), KeyState::Migrated)
    }

    fn key_state(&self, key: &RecordKey) -> KeyState {
        let Some(unit) = &self.active else {
            return KeyState::Pending;
        };

        if unit.source == self.cfg.local_partition {
            let pushed = self
                .new_inserted
                .get(key)
                .or_else(|| self.analyzed.get(key))
                .copied();
            // Untracked on the source: it was never a candidate, so it must
            // have been pushed in the foreground already.
            return match pushed {
                Some(false) => KeyState::Pending,
                Some(true) | None => KeyState::Migrated,
            };
        }

        if self.migrated_keys.contains(key) {
            return KeyState::Migrated;
        }
        if !self.is_key_in_active_migration_range(key) {
            return KeyState::Pending;
        }
        let found = self.partitions.current_location(key);
        if found == unit.dest {
            KeyState::Migrated
        } else if found == unit.source {
            KeyState::Pending
        } else {
            KeyState::Diverged {
                found,
                source: unit.source,
                dest: unit.dest,
            }
        }
    }

    pub fn is_key_in_active_migration_range(&self, key: &RecordKey) -> bool {
        let Some(unit) = &self.active else {
            return false;
        };
        unit.covers(key) || unit.covers(&self.partitions.representative(key))
    }

    pub fn current_location(&self, key: &RecordKey) -> PartitionId {
        self.partitions.current_location(key)
    }

    /// Source node: a key inserted while the unit is in flight still has to
    /// be shipped.
    pub fn add_new_insert_key(&mut self, key: RecordKey) -> anyhow::Result<()> {
        self.ensure_running()?;
        if !self.is_local_source() {
            anyhow::bail!("new insert {key} tracked outside the source partition");
        }
        self.new_inserted.insert(key.clone(), false);
        self.candidates.add(key);
        Ok(())
    }

    /// Source node: analysis found the keys the unit has to move.
    pub fn analysis_complete(&mut self, keys: impl IntoIterator<Item = RecordKey>) -> anyhow::Result<()> {
        self.ensure_running()?;
        if !self.is_local_source() {
            anyhow::bail!("migration analysis completed outside the source partition");
        }
        let mut added = 0usize;
        for key in keys {
            self.analyzed.entry(key.clone()).or_insert(false);
            self.candidates.add(key);
            added += 1;
        }
        self.flags.set_analyzing(false);
        tracing::info!(keys = added, "migration analysis complete");
        Ok(())
    }

    fn is_local_source(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|unit| unit.source == self.cfg.local_partition)
    }

    /// Flip a pending tag to pushed and tell the background pusher to skip
    /// the key.
    fn mark_pushed(&mut self, key: &RecordKey) {
        let flipped = flip_pending(&mut self.new_inserted, key) || flip_pending(&mut self.analyzed, key);
        if flipped {
            // The receiver lives in `self.candidates`, so sending cannot fail.
            let _ = self.skip_tx.send(key.clone());
        }
    }

    fn reset_round_state(&mut self) {
        self.new_inserted.clear();
        self.analyzed.clear();
        self.migrated_keys.clear();
        self.candidates.clear();
    }

    fn finish_clay(&mut self) {
        self.flags.set_clay_operating(false);
        self.phase = match self.cfg.scaling {
            ScalingMode::Disabled => CoordinatorPhase::Completed,
            ScalingMode::ScaleOut | ScalingMode::Consolidate => CoordinatorPhase::Finished,
        };
        tracing::info!(round = self.round, phase = ?self.phase, "clay finished its jobs");
    }

    fn ensure_running(&self) -> anyhow::Result<()> {
        if self.phase == CoordinatorPhase::Aborted {
            anyhow::bail!("migration coordinator aborted after an invariant violation");
        }
        Ok(())
    }

    /// Enter `Aborted` when `err` is an invariant violation; return it either way.
    fn abort_on_violation(&mut self, err: anyhow::Error) -> anyhow::Error {
        if let Some(violation) = as_invariant_violation(&err) {
            tracing::error!(error = %violation, phase = ?self.phase, "migration coordinator aborted");
            self.phase = CoordinatorPhase::Aborted;
            self.flags.set_monitoring(false);
            self.flags.set_analyzing(false);
            self.flags.set_migrating(false);
            self.flags.set_clay_operating(false);
            self.queued.clear();
            self.active = None;
        }
        err
    }
}

fn flip_pending(tags: &mut HashMap<RecordKey, bool>, key: &RecordKey) -> bool {
    match tags.get_mut(key) {
        Some(pushed) if !*pushed => {
            *pushed = true;
            true
        }
        _ => false,
    }
}

/// Configuration for the launch controller.
#[derive(Clone, Copy, Debug)]
pub struct LaunchControllerConfig {
    /// Wait this long before the first launch.
    pub initial_delay: Duration,
    /// Re-launch period while Clay is idle.
    pub period: Duration,
    /// Stop launching this long after the first launch.
    pub stop_after: Duration,
    /// Launch exactly once.
    pub once: bool,
}

/// Spawn the task that periodically asks the scheduler to start Clay.
pub fn spawn_launch_controller(
    flags: Arc<PhaseFlags>,
    requests: mpsc::UnboundedSender<ControlRequest>,
    cfg: LaunchControllerConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(cfg.initial_delay).await;
        if cfg.once {
            if requests.send(ControlRequest::LaunchClay).is_err() {
                tracing::debug!("launch controller receiver closed");
            }
            return;
        }

        let started = Instant::now();
        let mut ticker = tokio::time::interval(cfg.period);
        while started.elapsed() < cfg.stop_after {
            ticker.tick().await;
            if flags.is_clay_operating() {
                tracing::warn!("clay is still operating; skipping this launch");
                continue;
            }
            if requests.send(ControlRequest::LaunchClay).is_err() {
                tracing::debug!("launch controller receiver closed");
                return;
            }
        }
    })
}

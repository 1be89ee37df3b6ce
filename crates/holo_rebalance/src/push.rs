//! Background push of not-yet-migrated records on the source node.
//!
//! Foreground migration moves records as transactions touch them; this task
//! trickles the rest over in bounded batches so the migration eventually
//! completes even for cold data. Keys already pushed in the foreground are
//! reported through the skip queue and dropped before each batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::PhaseFlags;
use crate::key::{PartitionId, RecordKey};

/// Order in which candidate tables are drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum PushSelection {
    /// One key per table per sweep.
    RoundRobin,
    /// Drain the table with the most candidates first.
    LargestTableFirst,
}

/// What a batch is bounded by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum PushBudget {
    Count,
    Bytes,
}

#[derive(Clone, Copy, Debug)]
pub struct PushConfig {
    pub pushing_count: usize,
    pub pushing_byte_count: usize,
    pub selection: PushSelection,
    pub budget: PushBudget,
    /// Delay between two push rounds.
    pub interval: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            pushing_count: 1000,
            pushing_byte_count: 4_000_000,
            selection: PushSelection::RoundRobin,
            budget: PushBudget::Count,
            interval: Duration::from_millis(100),
        }
    }
}

/// Sends one batch of records from the source to the destination partition.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Approximate encoded size of one record of `table`, for byte budgets.
    fn record_size(&self, table: &str) -> usize;

    async fn push(&self, source: PartitionId, dest: PartitionId, keys: Vec<RecordKey>) -> anyhow::Result<()>;
}

struct CandidateState {
    tables: BTreeMap<String, BTreeSet<RecordKey>>,
    skip_rx: mpsc::UnboundedReceiver<RecordKey>,
}

/// Per-table pool of keys still waiting for a background push.
pub struct PushCandidates {
    state: Mutex<CandidateState>,
    skip_tx: mpsc::UnboundedSender<RecordKey>,
}

impl Default for PushCandidates {
    fn default() -> Self {
        Self::new()
    }
}

impl PushCandidates {
    pub fn new() -> Self {
        let (skip_tx, skip_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(CandidateState {
                tables: BTreeMap::new(),
                skip_rx,
            }),
            skip_tx,
        }
    }

    /// Adds a key; duplicates collapse.
    pub fn add(&self, key: RecordKey) {
        let mut state = self.state.lock().expect("push candidates lock");
        state.tables.entry(key.table.clone()).or_default().insert(key);
    }

    /// Producer handle for keys that were pushed in the foreground.
    pub fn skip_sender(&self) -> mpsc::UnboundedSender<RecordKey> {
        self.skip_tx.clone()
    }

    /// Drops every candidate and every pending skip.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("push candidates lock");
        state.tables.clear();
        while state.skip_rx.try_recv().is_ok() {}
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("push candidates lock");
        state.tables.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns the next batch under `cfg`'s budget, after
    /// discarding keys reported on the skip queue.
    pub fn select_batch(&self, cfg: &PushConfig, record_size: impl Fn(&str) -> usize) -> Vec<RecordKey> {
        let mut state = self.state.lock().expect("push candidates lock");
        let state = &mut *state;
        while let Ok(key) = state.skip_rx.try_recv() {
            if let Some(keys) = state.tables.get_mut(&key.table) {
                keys.remove(&key);
            }
        }
        state.tables.retain(|_, keys| !keys.is_empty());

        let mut budget = Budget::new(cfg);
        let mut batch = Vec::new();
        match cfg.selection {
            PushSelection::RoundRobin => {
                'sweeps: while !state.tables.is_empty() {
                    for (table, keys) in state.tables.iter_mut() {
                        if budget.exhausted() {
                            break 'sweeps;
                        }
                        if let Some(key) = keys.pop_first() {
                            budget.charge(record_size(table.as_str()));
                            batch.push(key);
                        }
                    }
                    state.tables.retain(|_, keys| !keys.is_empty());
                }
            }
            PushSelection::LargestTableFirst => {
                let mut order = state
                    .tables
                    .iter()
                    .map(|(table, keys)| (keys.len(), table.clone()))
                    .collect::<Vec<_>>();
                order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                'tables: for (_, table) in order {
                    let size = record_size(table.as_str());
                    let Some(keys) = state.tables.get_mut(&table) else {
                        continue;
                    };
                    while !budget.exhausted() {
                        let Some(key) = keys.pop_first() else {
                            continue 'tables;
                        };
                        budget.charge(size);
                        batch.push(key);
                    }
                    break;
                }
                state.tables.retain(|_, keys| !keys.is_empty());
            }
        }
        batch
    }

    /// Puts back keys whose push failed.
    fn restore(&self, keys: Vec<RecordKey>) {
        let mut state = self.state.lock().expect("push candidates lock");
        for key in keys {
            state.tables.entry(key.table.clone()).or_default().insert(key);
        }
    }
}

struct Budget {
    kind: PushBudget,
    limit: usize,
    used: usize,
}

impl Budget {
    fn new(cfg: &PushConfig) -> Self {
        let limit = match cfg.budget {
            PushBudget::Count => cfg.pushing_count,
            PushBudget::Bytes => cfg.pushing_byte_count,
        };
        Self {
            kind: cfg.budget,
            limit,
            used: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.used >= self.limit
    }

    fn charge(&mut self, record_size: usize) {
        self.used += match self.kind {
            PushBudget::Count => 1,
            // Zero-sized records still count.
            PushBudget::Bytes => record_size.max(1),
        };
    }
}

/// Spawn the background pusher for the `source -> dest` unit in flight.
///
/// The first round runs one interval after the spawn. The task exits once
/// the migrating flag is cleared.
pub fn spawn_background_push(
    candidates: Arc<PushCandidates>,
    flags: Arc<PhaseFlags>,
    transport: Arc<dyn PushTransport>,
    source: PartitionId,
    dest: PartitionId,
    cfg: PushConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(source, dest, "background push started");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + cfg.interval, cfg.interval);
        loop {
            ticker.tick().await;
            if !flags.is_migrating() {
                break;
            }
            let batch = candidates.select_batch(&cfg, |table| transport.record_size(table));
            if batch.is_empty() {
                continue;
            }
            let pushed = batch.len();
            if let Err(err) = transport.push(source, dest, batch.clone()).await {
                tracing::warn!(error = ?err, source, dest, keys = pushed, "background push failed");
                candidates.restore(batch);
                continue;
            }
            tracing::debug!(source, dest, keys = pushed, remaining = candidates.len(), "background push round");
        }
        tracing::info!(source, dest, "background push stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(table: &str, id: u64) -> RecordKey {
        RecordKey::new(table, id)
    }

    fn three_tables() -> PushCandidates {
        let candidates = PushCandidates::new();
        for k in [key("a", 1), key("a", 2), key("b", 1), key("c", 1), key("c", 2)] {
            candidates.add(k);
        }
        candidates
    }

    fn cfg(selection: PushSelection, budget: PushBudget, limit: usize) -> PushConfig {
        PushConfig {
            pushing_count: limit,
            pushing_byte_count: limit,
            selection,
            budget,
            ..PushConfig::default()
        }
    }

    #[test]
    fn round_robin_count_takes_one_key_per_table() {
        let candidates = three_tables();
        let batch = candidates.select_batch(&cfg(PushSelection::RoundRobin, PushBudget::Count, 2), |_| 1);
        assert_eq!(batch, vec![key("a", 1), key("b", 1)]);
        assert_eq!(candidates.len(), 3);

        let rest = candidates.select_batch(&cfg(PushSelection::RoundRobin, PushBudget::Count, 10), |_| 1);
        assert_eq!(rest, vec![key("a", 2), key("c", 1), key("c", 2)]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn round_robin_revisits_tables_in_later_sweeps() {
        let candidates = three_tables();
        let batch = candidates.select_batch(&cfg(PushSelection::RoundRobin, PushBudget::Count, 4), |_| 1);
        assert_eq!(batch, vec![key("a", 1), key("b", 1), key("c", 1), key("a", 2)]);
    }

    #[test]
    fn byte_budget_uses_record_sizes() {
        let candidates = three_tables();
        let size = |table: &str| if table == "c" { 300 } else { 100 };
        let batch = candidates.select_batch(&cfg(PushSelection::RoundRobin, PushBudget::Bytes, 450), size);
        // 100 + 100 + 300 crosses the budget after the third key.
        assert_eq!(batch, vec![key("a", 1), key("b", 1), key("c", 1)]);
    }

    #[test]
    fn largest_table_first_drains_big_tables() {
        let candidates = PushCandidates::new();
        for id in 0..3 {
            candidates.add(key("orders", id));
        }
        candidates.add(key("items", 7));
        candidates.add(key("stock", 1));
        candidates.add(key("stock", 2));

        let batch = candidates.select_batch(
            &cfg(PushSelection::LargestTableFirst, PushBudget::Count, 4),
            |_| 1,
        );
        assert_eq!(
            batch,
            vec![key("orders", 0), key("orders", 1), key("orders", 2), key("stock", 1)]
        );
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn skipped_keys_are_dropped_before_selection() {
        let candidates = three_tables();
        let skip = candidates.skip_sender();
        skip.send(key("a", 1)).expect("skip");
        skip.send(key("b", 1)).expect("skip");
        skip.send(key("zz", 9)).expect("skip");

        let batch = candidates.select_batch(&cfg(PushSelection::RoundRobin, PushBudget::Count, 2), |_| 1);
        assert_eq!(batch, vec![key("a", 2), key("c", 1)]);
    }

    #[test]
    fn clear_discards_candidates_and_pending_skips() {
        let candidates = three_tables();
        candidates.skip_sender().send(key("a", 1)).expect("skip");
        candidates.clear();
        assert!(candidates.is_empty());
        candidates.add(key("a", 1));
        let batch = candidates.select_batch(&PushConfig::default(), |_| 1);
        assert_eq!(batch, vec![key("a", 1)]);
    }

    #[derive(Default)]
    struct RecordingTransport {
        fail_first: std::sync::atomic::AtomicBool,
        pushed: Mutex<Vec<(PartitionId, PartitionId, Vec<RecordKey>)>>,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        fn record_size(&self, _table: &str) -> usize {
            1
        }

        async fn push(&self, source: PartitionId, dest: PartitionId, keys: Vec<RecordKey>) -> anyhow::Result<()> {
            if self.fail_first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("transport unavailable");
            }
            self.pushed.lock().expect("pushed lock").push((source, dest, keys));
            Ok(())
        }
    }

    #[tokio::test]
    async fn background_push_drains_candidates_and_stops_with_migration() {
        let candidates = Arc::new(three_tables());
        let flags = Arc::new(PhaseFlags::default());
        flags.set_migrating(true);
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_first.store(true, std::sync::atomic::Ordering::SeqCst);

        let handle = spawn_background_push(
            candidates.clone(),
            flags.clone(),
            transport.clone(),
            0,
            2,
            PushConfig {
                pushing_count: 2,
                interval: Duration::from_millis(5),
                ..PushConfig::default()
            },
        );

        for _ in 0..200 {
            if candidates.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(candidates.is_empty());
        flags.set_migrating(false);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("push task stops")
            .expect("push task join");

        let pushed = transport.pushed.lock().expect("pushed lock").clone();
        assert!(pushed.iter().all(|(s, d, keys)| *s == 0 && *d == 2 && keys.len() <= 2));
        let mut all = pushed.into_iter().flat_map(|(_, _, keys)| keys).collect::<Vec<_>>();
        all.sort();
        assert_eq!(
            all,
            vec![key("a", 1), key("a", 2), key("b", 1), key("c", 1), key("c", 2)]
        );
    }
}

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{key, keys, BlockPartitioner, RecordingExecutor, RecordingTransport};
use holo_rebalance::{
    CoordinatorConfig, CoordinatorPhase, MigrationCoordinator, MigrationPayload, PushConfig, RangePartitioner,
};

fn config(local_partition: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        local_partition,
        num_partitions: 3,
        monitoring_window: Duration::from_secs(1),
        directory_capacity: 4,
        push: PushConfig {
            pushing_count: 2,
            interval: Duration::from_millis(50),
            ..PushConfig::default()
        },
        ..CoordinatorConfig::default()
    }
}

/// Loads [10, 10, 40] with partition 2 split over four hot keys, then one
/// late access that closes the window.
fn observe_skew<P, E>(coord: &mut MigrationCoordinator<P, E>, ids: [u64; 6], start: Instant)
where
    P: holo_rebalance::PartitionFunction,
    E: holo_rebalance::MigrationExecutor,
{
    for _ in 0..10 {
        for id in ids {
            coord.on_transaction_observed(&keys(&[id]), start).expect("observe");
        }
    }
    coord
        .on_transaction_observed(&keys(&[ids[0]]), start + Duration::from_secs(2))
        .expect("observe");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_node_background_push_skips_foreground_keys() {
    let transport = Arc::new(RecordingTransport::default());
    let executor = RecordingExecutor::default();
    let mut coord = MigrationCoordinator::new(config(2), RangePartitioner::new(3, 100), executor.clone())
        .with_background_push(transport.clone(), tokio::runtime::Handle::current());

    let start = Instant::now();
    coord.launch(start).expect("launch");
    observe_skew(&mut coord, [1, 101, 200, 201, 202, 203], start);
    assert_eq!(coord.phase(), CoordinatorPhase::Migrating);
    assert_eq!(executor.submitted().len(), 1);
    assert!(coord.background_push_running());

    // Analysis found the records behind the migrating key; one of them is
    // pushed in the foreground before the pusher reaches it.
    coord
        .analysis_complete(keys(&[200, 250, 260, 270]))
        .expect("analysis");
    coord.record_migrated(&keys(&[250])).expect("foreground push");

    let deadline = Instant::now() + Duration::from_secs(5);
    while transport.pushed_keys().len() < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.pushed_keys(), keys(&[200, 260, 270]));
    assert!(transport
        .batches()
        .iter()
        .all(|(source, dest, batch)| *source == 2 && *dest == 1 && batch.len() <= 2));

    coord.record_relocated(&keys(&[200, 250, 260, 270])).expect("relocate");
    coord.on_unit_committed(Instant::now()).expect("commit");

    // Key 201 goes 2 -> 0 next; this node is the source again.
    assert_eq!(executor.submitted().len(), 2);
    assert_eq!(coord.active_unit().map(|u| (u.source, u.dest)), Some((2, 0)));
    assert!(coord.background_push_running());
    assert!(coord.push_candidates().is_empty());

    coord.record_relocated(&keys(&[201])).expect("relocate");
    coord.on_unit_committed(Instant::now()).expect("commit");
    assert_eq!(coord.phase(), CoordinatorPhase::Completed);
    assert!(!coord.background_push_running());
    assert_eq!(coord.current_location(&key(250)), 1);
    assert_eq!(coord.current_location(&key(201)), 0);
}

#[test]
fn directory_overflow_keeps_every_relocated_key() {
    let executor = RecordingExecutor::default();
    let mut coord = MigrationCoordinator::new(config(1), RangePartitioner::new(3, 100), executor.clone());
    let start = Instant::now();
    coord.launch(start).expect("launch");
    observe_skew(&mut coord, [1, 101, 200, 201, 202, 203], start);

    let moved = (200..210).collect::<Vec<_>>();
    coord.record_relocated(&keys(&moved)).expect("relocate");
    let directory = coord.partitions().directory();
    assert_eq!(directory.capacity(), 4);
    assert_eq!(directory.len(), moved.len());
    assert_eq!(directory.overflow_len(), moved.len() - 4);
    assert_eq!(directory.count_on(1), 10);
    for &id in &moved {
        assert_eq!(coord.current_location(&key(id)), 1);
    }

    // Only key 200 belongs to the unit in flight.
    assert!(coord.is_record_migrated(&key(200)).expect("oracle"));
    for &id in &moved[1..] {
        assert!(!coord.is_record_migrated(&key(id)).expect("oracle"));
    }
    assert_eq!(coord.phase(), CoordinatorPhase::Migrating);
}

#[test]
fn grouped_keys_migrate_with_their_representative() {
    let executor = RecordingExecutor::default();
    let mut coord = MigrationCoordinator::new(config(0), BlockPartitioner::new(3, 100), executor.clone());
    let start = Instant::now();
    coord.launch(start).expect("launch");
    // Keys 200..=209 collapse into one vertex for 200.
    observe_skew(&mut coord, [1, 101, 200, 215, 227, 239], start);
    assert_eq!(coord.planner().graph().len(), 6);

    let submitted = executor.submitted();
    assert_eq!(submitted[0].payload, MigrationPayload::Keys(keys(&[200])));
    assert!(coord.is_key_in_active_migration_range(&key(200)));
    assert!(coord.is_key_in_active_migration_range(&key(207)));
    assert!(!coord.is_key_in_active_migration_range(&key(215)));

    coord.record_relocated(&keys(&[200, 207])).expect("relocate");
    assert!(coord.is_key_migrated(&key(207)));
    assert!(coord.is_record_migrated(&key(207)).expect("oracle"));
    assert!(!coord.is_key_migrated(&key(215)));
}

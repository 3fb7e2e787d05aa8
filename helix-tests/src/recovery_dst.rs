//! Recovery simulation tests.
//!
//! A sink runs over flaky storage and crashes at a random point. The
//! surviving state is then recovered twice: once cleanly on a fork of the
//! storage, and once by a sequence of recoveries that themselves hit faults
//! and crashes. Both must end with the same committed files and watermark.

// Test-specific lint allowances - these are less critical in test code.
#![allow(clippy::too_many_lines)] // Test functions can be longer for clarity
#![allow(clippy::unreadable_literal)] // Large seed numbers are fine without separators
#![allow(clippy::uninlined_format_args)] // Format string style not critical for tests

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use helix_core::{Offset, TopicPartition};
use helix_sink::{SinkConfig, SinkWriter, WriterState};
use helix_wal::{FaultConfig, SimulatedStorage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::scenarios::{configs, seeds};
use crate::upstream::{Upstream, UpstreamConfig};

/// Faults hit during recovery attempts.
fn recovery_faults() -> FaultConfig {
    FaultConfig::none()
        .with_rename_fail_rate(0.3)
        .with_remove_fail_rate(0.3)
        .with_list_files_fail_rate(0.1)
        .with_fsync_fail_rate(0.1)
}

/// Runs a sink over flaky storage for a random number of deliveries, then
/// crashes it.
async fn crashed_state(seed: u64, config: &SinkConfig) -> (SimulatedStorage, Vec<TopicPartition>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let storage = SimulatedStorage::with_faults(seed, FaultConfig::flaky());
    let shared = Arc::new(storage.clone());
    let mut upstream = Upstream::new(seed, UpstreamConfig::new("orders", 2, 80).with_keys(2));
    let tps = upstream.topic_partitions();

    let mut sink = SinkWriter::new(config.clone(), shared).expect("test config should be valid");
    sink.assign(tps.clone(), 0).await;

    let deliveries = rng.gen_range(1..30);
    let mut now = 0;
    for _ in 0..deliveries {
        let batch = upstream.next_batch();
        sink.write(batch, now).await;
        now += rng.gen_range(1..2_000_000);
    }
    sink.stop();
    storage.simulate_crash();
    storage.fault_config().clear();
    (storage, tps)
}

/// Copies every file of `storage` into a fresh storage.
fn fork(storage: &SimulatedStorage, seed: u64) -> SimulatedStorage {
    let forked = SimulatedStorage::new(seed);
    for (path, content) in storage.snapshot() {
        forked.set_raw_content(&path, content);
    }
    forked
}

/// Recovers every topic-partition once and returns the watermarks.
async fn recover_once(
    storage: &SimulatedStorage,
    config: &SinkConfig,
    tps: &[TopicPartition],
) -> (BTreeMap<TopicPartition, Offset>, bool) {
    let mut sink = SinkWriter::new(config.clone(), Arc::new(storage.clone()))
        .expect("test config should be valid");
    sink.assign(tps.iter().cloned(), 0).await;
    let recovered = tps.iter().all(|tp| {
        sink.writer(tp)
            .is_some_and(|w| w.state() == WriterState::Active)
    });
    let offsets = sink.committed_offsets();
    sink.stop();
    (offsets, recovered)
}

/// Returns the files under `root` with their contents.
fn files_under(storage: &SimulatedStorage, root: &Path) -> HashMap<PathBuf, Vec<u8>> {
    storage
        .snapshot()
        .into_iter()
        .filter(|(path, _)| path.starts_with(root))
        .collect()
}

#[tokio::test]
async fn test_dst_recovery_converges_despite_faults() {
    crate::init_test_logging();
    let config = configs::keyed();

    for &seed in seeds::REGRESSION_SEEDS {
        let (storage, tps) = crashed_state(seed, &config).await;

        let clean = fork(&storage, seed);
        let (clean_offsets, clean_ok) = recover_once(&clean, &config, &tps).await;
        assert!(clean_ok, "seed {}: clean recovery did not complete", seed);

        let mut rng = StdRng::seed_from_u64(seed ^ 0xFA17);
        for _ in 0..rng.gen_range(1..5) {
            storage.set_fault_config(recovery_faults());
            recover_once(&storage, &config, &tps).await;
            storage.simulate_crash();
        }
        storage.fault_config().clear();
        let (offsets, ok) = recover_once(&storage, &config, &tps).await;
        assert!(ok, "seed {}: recovery did not complete after faults stopped", seed);

        assert_eq!(offsets, clean_offsets, "seed {}: watermarks diverged", seed);
        assert_eq!(
            files_under(&storage, &config.topics_dir),
            files_under(&clean, &config.topics_dir),
            "seed {}: committed files diverged",
            seed
        );
    }
}

#[tokio::test]
async fn test_dst_recovery_repeat_is_noop() {
    let config = configs::size_rotation();

    for &seed in seeds::REGRESSION_SEEDS {
        let (storage, tps) = crashed_state(seed, &config).await;

        let (first, ok) = recover_once(&storage, &config, &tps).await;
        assert!(ok, "seed {}: first recovery did not complete", seed);
        let after_first = storage.snapshot();

        let (second, ok) = recover_once(&storage, &config, &tps).await;
        assert!(ok, "seed {}: second recovery did not complete", seed);

        assert_eq!(first, second, "seed {}: watermarks changed", seed);
        assert_eq!(after_first, storage.snapshot(), "seed {}: storage changed", seed);
    }
}

#[tokio::test]
async fn test_dst_recovery_leaves_no_temp_files() {
    let config = configs::time_rotation();

    for &seed in seeds::REGRESSION_SEEDS {
        let (storage, tps) = crashed_state(seed, &config).await;
        let (_, ok) = recover_once(&storage, &config, &tps).await;
        assert!(ok, "seed {}: recovery did not complete", seed);

        let temp_root = config.topics_dir.join("+tmp");
        let leftovers: Vec<_> = storage
            .file_paths()
            .into_iter()
            .filter(|p| p.starts_with(&temp_root))
            .collect();
        assert!(leftovers.is_empty(), "seed {}: temp files left: {:?}", seed, leftovers);
    }
}

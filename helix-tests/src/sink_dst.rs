//! End-to-end sink simulation tests.
//!
//! These tests drive a `SinkWriter` over `SimulatedStorage` with random
//! transient faults, random clock steps and random crashes. After each crash
//! the upstream source rewinds to the offsets the restarted sink reports, so
//! records are redelivered exactly the way a consumer group would. Once the
//! source is drained and faults stop, the committed output must hold every
//! produced record exactly once.
//!
//! # Test Categories
//!
//! 1. **Single lane**: Default partitioner, size rotation
//! 2. **Multiple lanes**: Key partitioner, lanes commit independently
//! 3. **Time rotation**: Interval rotation with frequent log compaction
//! 4. **Offset gaps**: Compacted upstream with holes in the offset space

// Test-specific lint allowances - these are less critical in test code.
#![allow(clippy::cast_possible_truncation)] // u64 to usize safe on 64-bit test machines
#![allow(clippy::too_many_lines)] // Test functions can be longer for clarity
#![allow(clippy::unreadable_literal)] // Large seed numbers are fine without separators
#![allow(clippy::doc_markdown)] // Backticks in docs not critical for tests
#![allow(clippy::uninlined_format_args)] // Format string style not critical for tests
#![allow(clippy::needless_pass_by_value)] // Pass by value can improve test clarity

use std::sync::Arc;

use helix_core::{Offset, TopicPartition};
use helix_sink::{SinkConfig, SinkWriter, WriterState};
use helix_wal::{FaultConfig, SimulatedStorage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::properties::{ExactlyOnceChecker, PropertyViolation};
use crate::scenarios::{configs, seeds};
use crate::upstream::{Upstream, UpstreamConfig};

/// Largest simulated clock step between deliveries.
const STEP_US_MAX: u64 = 2_000_000;

/// Chance of a crash after each delivery.
const CRASH_PROBABILITY: f64 = 0.04;

/// Upper bound on deliveries before the run is considered stuck.
const ROUNDS_MAX: u32 = 5_000;

/// Upper bound on settle ticks once faults stop.
const SETTLE_ROUNDS_MAX: u32 = 50;

/// Outcome of one simulated run.
struct SimulationReport {
    crashes: u32,
    deliveries: u32,
    violations: Vec<PropertyViolation>,
    /// Watermark recovered by a fresh sink after close, per topic-partition.
    recovered: Vec<(TopicPartition, Option<Offset>, Option<Offset>)>,
}

fn new_sink(config: &SinkConfig, storage: &Arc<SimulatedStorage>) -> SinkWriter<SimulatedStorage> {
    SinkWriter::new(config.clone(), storage.clone()).expect("test config should be valid")
}

/// Runs one seeded simulation to completion and checks the output.
async fn run_simulation(
    seed: u64,
    config: SinkConfig,
    upstream_config: UpstreamConfig,
) -> SimulationReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let storage = SimulatedStorage::with_faults(seed, FaultConfig::flaky());
    let shared = Arc::new(storage.clone());

    let mut upstream = Upstream::new(seed, upstream_config);
    let tps = upstream.topic_partitions();
    let mut checker = ExactlyOnceChecker::new();

    let mut now = 0u64;
    let mut crashes = 0;
    let mut deliveries = 0;

    let mut sink = new_sink(&config, &shared);
    sink.assign(tps.clone(), now).await;

    while !upstream.is_drained() {
        deliveries += 1;
        assert!(deliveries < ROUNDS_MAX, "seed {}: upstream never drained", seed);

        let batch = upstream.next_batch();
        checker.record_produced(&batch);
        let summary = sink.write(batch, now).await;
        assert!(
            summary.fatal.is_empty(),
            "seed {}: transient faults made {:?} fatal",
            seed,
            summary.fatal
        );
        now += rng.gen_range(1..STEP_US_MAX);

        if rng.gen_bool(CRASH_PROBABILITY) {
            sink.stop();
            storage.simulate_crash();
            crashes += 1;

            sink = new_sink(&config, &shared);
            sink.assign(tps.clone(), now).await;
            upstream.rewind(&sink.next_offsets());
        }
    }

    storage.fault_config().clear();
    for _ in 0..SETTLE_ROUNDS_MAX {
        let summary = sink.tick(now).await;
        assert!(summary.fatal.is_empty(), "seed {}: fatal after faults stopped", seed);
        let settled = tps.iter().all(|tp| {
            sink.writer(tp)
                .is_some_and(|w| w.state() == WriterState::Active)
        });
        if settled && summary.pause.is_none() {
            break;
        }
        now += config.retry_backoff_us();
    }
    sink.close(now).await;

    // A fresh sink recovers the final state; its watermark is what upstream
    // would resume from.
    let mut verify = new_sink(&config, &shared);
    verify.assign(tps.clone(), now).await;
    let recovered_offsets = verify.committed_offsets();

    let mut violations = Vec::new();
    let mut recovered = Vec::new();
    for tp in &tps {
        let last = checker.last_produced(tp);
        violations.extend(checker.check(&storage, verify.naming(), tp, last));
        recovered.push((tp.clone(), recovered_offsets.get(tp).copied(), last));
    }

    info!(seed, crashes, deliveries, violations = violations.len(), "Simulation finished");
    SimulationReport {
        crashes,
        deliveries,
        violations,
        recovered,
    }
}

fn assert_no_violations(seed: u64, report: &SimulationReport) {
    assert!(
        report.violations.is_empty(),
        "seed {} ({} crashes, {} deliveries): {}",
        seed,
        report.crashes,
        report.deliveries,
        report
            .violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    );
}

// ============================================================================
// DST Test 1: Single Lane
// ============================================================================

/// With one encoded partition the recovered watermark is exactly the last
/// produced offset.
#[tokio::test]
async fn test_dst_sink_exactly_once_single_lane() {
    crate::init_test_logging();
    for &seed in seeds::REGRESSION_SEEDS {
        let upstream = UpstreamConfig::new("orders", 2, 60);
        let report = run_simulation(seed, configs::size_rotation(), upstream).await;

        assert_no_violations(seed, &report);
        for (tp, recovered, last) in &report.recovered {
            assert_eq!(recovered, last, "seed {}: {} watermark", seed, tp);
        }
    }
}

#[tokio::test]
async fn test_dst_sink_exactly_once_many_seeds() {
    for seed in 0..u64::from(seeds::CI_SEED_COUNT) {
        let seed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let upstream = UpstreamConfig::new("orders", 1, 40).with_max_batch(8);
        let report = run_simulation(seed, configs::size_rotation(), upstream).await;
        assert_no_violations(seed, &report);
    }
}

// ============================================================================
// DST Test 2: Multiple Lanes
// ============================================================================

/// Lanes commit out of offset order; the recovered watermark never runs
/// ahead of the produced data and nothing is duplicated across restarts.
#[tokio::test]
async fn test_dst_sink_exactly_once_keyed_lanes() {
    crate::init_test_logging();
    for &seed in seeds::REGRESSION_SEEDS {
        let upstream = UpstreamConfig::new("clicks", 2, 60).with_keys(3);
        let report = run_simulation(seed, configs::keyed(), upstream).await;

        assert_no_violations(seed, &report);
        for (tp, recovered, last) in &report.recovered {
            assert!(
                recovered.is_some() && recovered <= last,
                "seed {}: {} recovered {:?}, produced up to {:?}",
                seed,
                tp,
                recovered,
                last
            );
        }
    }
}

// ============================================================================
// DST Test 3: Time Rotation
// ============================================================================

#[tokio::test]
async fn test_dst_sink_exactly_once_time_rotation() {
    for &seed in seeds::REGRESSION_SEEDS {
        let upstream = UpstreamConfig::new("events", 2, 50).with_max_batch(3);
        let report = run_simulation(seed, configs::time_rotation(), upstream).await;

        assert_no_violations(seed, &report);
        for (tp, recovered, last) in &report.recovered {
            assert_eq!(recovered, last, "seed {}: {} watermark", seed, tp);
        }
    }
}

// ============================================================================
// DST Test 4: Offset Gaps
// ============================================================================

/// File names carry the first and last offset actually held, so gaps never
/// show up as missing records.
#[tokio::test]
async fn test_dst_sink_exactly_once_with_offset_gaps() {
    for &seed in seeds::REGRESSION_SEEDS {
        let upstream = UpstreamConfig::new("orders", 1, 60).with_gaps(0.2);
        let report = run_simulation(seed, configs::size_rotation(), upstream).await;

        assert_no_violations(seed, &report);
        for (tp, recovered, last) in &report.recovered {
            assert_eq!(recovered, last, "seed {}: {} watermark", seed, tp);
        }
    }
}

//! Reusable test scenarios for sink simulation.
//!
//! Scenarios define common fault patterns and sink configurations
//! that can be composed to create comprehensive tests.

/// Standard sink configurations.
pub mod configs {
    use helix_sink::{PartitionerKind, SinkConfig};

    /// Small record-count rotation.
    #[must_use]
    pub fn size_rotation() -> SinkConfig {
        SinkConfig::for_testing().with_flush_size(4)
    }

    /// One lane per record key.
    #[must_use]
    pub fn keyed() -> SinkConfig {
        SinkConfig::for_testing()
            .with_flush_size(3)
            .with_partitioner(PartitionerKind::Key {
                field: "key".to_string(),
            })
    }

    /// Time rotation with a commit log that compacts often.
    #[must_use]
    pub fn time_rotation() -> SinkConfig {
        SinkConfig::for_testing()
            .with_flush_size(1_000)
            .with_rotate_interval_ms(1_500)
            .with_wal_compaction_bytes(512)
    }
}

/// Common fault injection patterns.
pub mod faults {
    use helix_wal::FaultConfig;

    /// Every write to a temp file fails.
    #[must_use]
    pub fn temp_writes_fail() -> FaultConfig {
        FaultConfig::none()
            .with_write_fail_rate(1.0)
            .with_path_filter("+tmp")
    }

    /// Every commit log write fails.
    #[must_use]
    pub fn commit_log_fails() -> FaultConfig {
        FaultConfig::none()
            .with_write_fail_rate(1.0)
            .with_path_filter("/logs")
    }

    /// The next rename fails once.
    #[must_use]
    pub fn rename_once() -> FaultConfig {
        FaultConfig::none().with_force_rename_fail()
    }

    /// Every rename fails.
    #[must_use]
    pub fn renames_fail() -> FaultConfig {
        FaultConfig::none().with_rename_fail_rate(1.0)
    }

    /// Random transient faults on every operation.
    #[must_use]
    pub fn flaky_disk() -> FaultConfig {
        FaultConfig::flaky()
    }
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard test seeds that have historically found bugs.
    pub const REGRESSION_SEEDS: &[u64] = &[
        42,
        12345,
        0xDEAD_BEEF,
        999,
        7777,
        0x1337,
        0xCAFE_BABE,
        1,
        u64::MAX,
        0,
    ];

    /// Number of random seeds to test in CI.
    pub const CI_SEED_COUNT: u32 = 100;
}

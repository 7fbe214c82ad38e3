//! Metrics module for reelforge
//!
//! Provides the metrics snapshot served by the HTTP surface: queue counters
//! plus process uptime and system memory.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::queue::QueueStatus;

/// Memory figures in megabytes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryMetrics {
    pub used_mb: u64,
    pub total_mb: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub queue_length: usize,
    pub active_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub uptime_seconds: u64,
    pub memory_usage_mb: u64,
    pub total_memory_mb: u64,
}

impl MetricsSnapshot {
    pub fn new(queue: &QueueStatus, started_at: Instant, memory: MemoryMetrics) -> Self {
        Self {
            timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
            queue_length: queue.queue_length,
            active_jobs: queue.running_count,
            completed_jobs: queue.completed_jobs,
            failed_jobs: queue.failed_jobs,
            uptime_seconds: started_at.elapsed().as_secs(),
            memory_usage_mb: memory.used_mb,
            total_memory_mb: memory.total_mb,
        }
    }
}

/// Collects current memory usage using sysinfo
pub fn collect_memory_metrics() -> MemoryMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();

    const MB: u64 = 1024 * 1024;
    MemoryMetrics {
        used_mb: sys.used_memory() / MB,
        total_mb: sys.total_memory() / MB,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status(queue_length: usize, running_count: usize, completed: u64, failed: u64) -> QueueStatus {
        QueueStatus {
            queue_length,
            running_count,
            concurrency_limit: 2,
            healthy: true,
            completed_jobs: completed,
            failed_jobs: failed,
        }
    }

    #[test]
    fn test_snapshot_from_queue_status() {
        let memory = MemoryMetrics {
            used_mb: 512,
            total_mb: 4096,
        };
        let snapshot = MetricsSnapshot::new(&status(3, 2, 40, 1), Instant::now(), memory);

        assert_eq!(snapshot.queue_length, 3);
        assert_eq!(snapshot.active_jobs, 2);
        assert_eq!(snapshot.completed_jobs, 40);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.memory_usage_mb, 512);
        assert_eq!(snapshot.total_memory_mb, 4096);
        assert!(snapshot.timestamp_unix_ms > 1577836800000);
    }

    #[test]
    fn test_collect_memory_metrics() {
        let memory = collect_memory_metrics();
        assert!(memory.used_mb <= memory.total_mb);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_snapshot_field_names_are_stable(
            queue_length in 0usize..1000,
            running in 0usize..16,
            completed in any::<u32>(),
            failed in any::<u32>(),
        ) {
            let snapshot = MetricsSnapshot::new(
                &status(queue_length, running, completed as u64, failed as u64),
                Instant::now(),
                MemoryMetrics::default(),
            );
            let json = serde_json::to_value(&snapshot).unwrap();

            prop_assert_eq!(json["queue_length"].as_u64(), Some(queue_length as u64));
            prop_assert_eq!(json["active_jobs"].as_u64(), Some(running as u64));
            prop_assert_eq!(json["completed_jobs"].as_u64(), Some(completed as u64));
            prop_assert_eq!(json["failed_jobs"].as_u64(), Some(failed as u64));
            prop_assert!(json.get("uptime_seconds").is_some());
            prop_assert!(json.get("memory_usage_mb").is_some());
            prop_assert!(json.get("total_memory_mb").is_some());
        }
    }
}

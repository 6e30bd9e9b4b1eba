//! Status module for the lofi streamer
//!
//! Provides the stream status snapshot and system metrics with JSON
//! serialization support.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where the stream loop currently is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Restarting,
    Stopping,
    Finished,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot: loop state, current session, counters, system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamStatus {
    pub timestamp_unix_ms: i64,
    pub state: LoopState,
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub track_count: usize,
    pub playlist_duration_secs: f64,
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub crashes: u64,
    pub launch_failures: u64,
    pub elapsed_secs: u64,
    pub max_duration_secs: u64,
    pub system: SystemMetrics,
}

/// Shared status state for concurrent access between the loop and the server
pub type SharedStatus = Arc<RwLock<StreamStatus>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StreamStatus::default()))
}

/// Get current timestamp in milliseconds
pub fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

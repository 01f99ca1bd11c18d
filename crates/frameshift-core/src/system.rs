//! Node system status for the cluster dashboard (`/worker/system-status`).

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::System;

/// One CPU/memory snapshot. Field names match the wire protocol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub node_id: String,
    pub cpu_usage_percent: f32,
    pub cpu_cores: usize,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_usage_percent: f64,
    /// UNIX timestamp in milliseconds.
    pub timestamp: u64,
}

/// Sample CPU and memory. CPU utilization needs two refreshes a short
/// interval apart, so this takes ~200ms.
pub async fn sample(node_id: &str) -> SystemStatus {
    let mut sys = System::new();
    sys.refresh_cpu();
    tokio::time::sleep(Duration::from_millis(200)).await;
    sys.refresh_cpu();
    sys.refresh_memory();

    let total = sys.total_memory();
    let used = sys.used_memory();
    let memory_usage_percent = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };

    SystemStatus {
        node_id: node_id.to_string(),
        cpu_usage_percent: sys.global_cpu_info().cpu_usage(),
        cpu_cores: sys.cpus().len(),
        memory_used_bytes: used,
        memory_total_bytes: total,
        memory_usage_percent,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
    }
}

/// Live metrics and persisted statistics.
///
/// The simulator writes a JSON snapshot to METRICS_PATH whenever a stage
/// turns over (and periodically in between). The viz binary polls this file
/// and re-renders the dashboard. Writes are atomic (write to .tmp then
/// rename) to avoid torn reads.
///
/// Finished stage programs also persist per-operation statistics to the
/// configured log directory, one file per (platform, stage) program, plus a
/// cumulative per-stage cycle file at the end of a run.
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const METRICS_PATH: &str = "/tmp/pimflow_live.json";

/// Final record of one operation's execution.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OperationStat {
    pub op_id: u32,
    pub name: String,
    pub op_type: String,
    pub start_cycle: u64,
    pub finish_cycle: u64,
    pub total_tiles: u32,
}

/// Snapshot of one platform's dispatch state.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct PlatformSnapshot {
    /// Platform name, e.g. "SA1"
    pub name: String,
    /// Operation currently feeding the tile queue (if any)
    pub current_op: Option<String>,
    /// Tiles still queued for dispatch
    pub queue_depth: usize,
    /// Tiles handed to cores so far for the current operation
    pub launched: u32,
    /// Tiles not yet finished for the current operation
    pub remain: u32,
    /// Total tiles of the current operation
    pub total: u32,
}

/// Snapshot of one DRAM channel's KV occupancy.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct ChannelSnapshot {
    pub available_tiles: u64,
    pub active_requests: usize,
    pub accum_latency: u64,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    /// "idle" | "running" | "complete"
    pub status: String,
    /// "two-way" | "three-way"
    pub mode: String,
    /// Current stage name
    pub stage: String,
    pub cycles: u64,
    pub pending_requests: usize,
    pub active_requests: u32,
    pub completed_requests: usize,
    pub platforms: Vec<PlatformSnapshot>,
    pub channels: Vec<ChannelSnapshot>,
    /// (stage name, cumulative cycles) in completion order
    pub stage_cycles: Vec<(String, u64)>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write metrics to METRICS_PATH.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_metrics(metrics: &LiveMetrics) {
    if let Ok(json) = serde_json::to_string(metrics) {
        let tmp = format!("{}.tmp", METRICS_PATH);
        if std::fs::write(&tmp, &json).is_ok() {
            let _ = std::fs::rename(&tmp, METRICS_PATH);
        }
    }
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no simulation has run yet).
pub fn read_metrics() -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(METRICS_PATH).ok()?;
    serde_json::from_str(&data).ok()
}

/// Persist one finished program's operation stats as
/// `{log_dir}/{platform}_stage_{stage}`.
pub fn write_operation_stats(
    log_dir: &Path,
    program_name: &str,
    stats: &[OperationStat],
) -> io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(program_name);
    let json = serde_json::to_string_pretty(stats)?;
    std::fs::write(path, json)
}

/// Persist the cumulative per-stage cycle counts.
pub fn write_stage_stats(log_dir: &Path, stats: &[(String, u64)]) -> io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join("stage_cycles.json");
    let json = serde_json::to_string_pretty(stats)?;
    std::fs::write(path, json)
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

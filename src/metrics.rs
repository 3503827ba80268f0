/// Live metrics for the TUI monitor.
///
/// The device writes a JSON snapshot to METRICS_PATH at a fixed cycle
/// interval and at every status change. The viz binary polls this file and
/// re-renders the dashboard. Writes are atomic (write to .tmp then rename)
/// to avoid torn reads.
use serde::{Deserialize, Serialize};

pub const METRICS_PATH: &str = "/tmp/gcnsim_live.json";

/// Progress of one dispatcher slot.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct DispatcherSnapshot {
    pub name: String,
    /// Whether a kernel is bound to this dispatcher right now
    pub active: bool,
    /// Work-groups in the bound kernel
    pub wgs_total: usize,
    pub wgs_dispatched: usize,
    pub wgs_completed: usize,
}

/// State of the drain/flush/shootdown/restart sequencer.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct ProtocolSnapshot {
    pub shootdown_active: bool,
    pub flush_active: bool,
    /// Outstanding acknowledgments per phase counter
    pub cu_acks: usize,
    pub at_acks: usize,
    pub cache_acks: usize,
    pub tlb_acks: usize,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    /// "idle" | "running" | "draining" | "complete"
    pub status: String,
    /// Placement policy driving the dispatchers
    pub placement_policy: String,
    /// Current simulation cycle
    pub cycle: u64,
    /// One entry per dispatcher slot
    pub dispatchers: Vec<DispatcherSnapshot>,
    /// Wavefront slots in use per compute unit; index = CU id
    pub cu_wf_slots_used: Vec<usize>,
    /// Wavefront-pool capacity of one compute unit
    pub cu_wf_slots_total: usize,
    /// Drain-protocol state
    pub protocol: ProtocolSnapshot,
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

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

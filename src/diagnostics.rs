//! Runtime diagnostics snapshot, collected on demand.

use serde::Serialize;

use crate::mac::RadioStats;

/// Point-in-time counters of a running node, serializable for telemetry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiagnosticsSnapshot {
    pub node_id: u8,
    pub send_total: u32,
    pub send_errors: u32,
    pub recv_total: u32,
    pub recv_errors: u32,
    pub pending_smes: usize,
    pub master_trusted: bool,
}

impl DiagnosticsSnapshot {
    pub fn new(
        node_id: u8,
        stats: RadioStats,
        pending_smes: usize,
        master_trusted: bool,
    ) -> Self {
        Self {
            node_id,
            send_total: stats.send_total,
            send_errors: stats.send_errors,
            recv_total: stats.recv_total,
            recv_errors: stats.recv_errors,
            pending_smes,
            master_trusted,
        }
    }

    /// Error ratio of the receive path, for link health reporting.
    pub fn recv_error_ratio(&self) -> f32 {
        if self.recv_total == 0 {
            0.0
        } else {
            self.recv_errors as f32 / self.recv_total as f32
        }
    }
}

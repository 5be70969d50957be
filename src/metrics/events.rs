//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the backup
//! pipeline. Events implement the `InternalEvent` trait which emits the
//! corresponding Prometheus metric.

use metrics::{counter, gauge};
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a candidate page is pulled from the catalog.
pub struct CandidatesDiscovered {
    pub count: u64,
}

impl InternalEvent for CandidatesDiscovered {
    fn emit(self) {
        trace!(count = self.count, "Candidates discovered");
        counter!("permafrost_candidates_discovered_total").increment(self.count);
    }
}

/// Terminal status of a processed candidate.
#[derive(Debug, Clone, Copy)]
pub enum BackupStatus {
    Success,
    Skipped,
    Failed,
}

impl BackupStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Skipped => "skipped",
            BackupStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a candidate reaches a terminal state.
pub struct BackupCompleted {
    pub status: BackupStatus,
}

impl InternalEvent for BackupCompleted {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Backup completed");
        counter!("permafrost_backups_total", "status" => self.status.as_str()).increment(1);
        gauge!("permafrost_active_backups").decrement(1.0);
    }
}

/// Event emitted when a backup fails, labeled by failure code.
pub struct BackupFailed {
    pub code: &'static str,
}

impl InternalEvent for BackupFailed {
    fn emit(self) {
        trace!(code = self.code, "Backup failed");
        counter!("permafrost_backup_failures_total", "code" => self.code).increment(1);
    }
}

/// Event emitted when CAR bytes land in the object store.
pub struct BytesUploaded {
    pub bytes: u64,
}

impl InternalEvent for BytesUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes uploaded");
        counter!("permafrost_bytes_uploaded_total").increment(self.bytes);
    }
}

/// Event emitted after a repo GC pass between batches.
pub struct GcCompleted {
    pub reclaimed: u64,
}

impl InternalEvent for GcCompleted {
    fn emit(self) {
        trace!(reclaimed = self.reclaimed, "Repo GC completed");
        counter!("permafrost_gc_objects_reclaimed_total").increment(self.reclaimed);
    }
}

/// Event emitted when a candidate begins processing.
///
/// Paired with [`BackupCompleted`]: the increment here and the decrement
/// there keep `permafrost_active_backups` at the in-flight task count.
pub struct BackupStarted;

impl InternalEvent for BackupStarted {
    fn emit(self) {
        gauge!("permafrost_active_backups").increment(1.0);
    }
}

/// Gauge of peers the IPFS daemon is currently connected to.
pub struct PeersConnected {
    pub count: usize,
}

impl InternalEvent for PeersConnected {
    fn emit(self) {
        gauge!("permafrost_peers_connected").set(self.count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::server::{MetricsController, init_test};

    #[test]
    fn test_backup_events_are_recorded() {
        init_test();

        crate::emit!(BackupStarted);
        crate::emit!(BackupCompleted {
            status: BackupStatus::Success,
        });
        crate::emit!(BackupFailed { code: "ERR_TOO_BIG" });
        crate::emit!(BytesUploaded { bytes: 512 });

        let output = MetricsController::get().unwrap().render();
        assert!(output.contains("permafrost_backups_total"));
        assert!(output.contains("permafrost_backup_failures_total"));
        assert!(output.contains("permafrost_bytes_uploaded_total"));
        assert!(output.contains("permafrost_active_backups"));
    }
}

//! Replication bookkeeping exposed through association status

use super::SyncReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    /// Completion time of the last clean sync
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sync_count: u64,
    pub error_count: u64,
    /// Failed runs since the last clean one
    pub consecutive_errors: u32,
    pub last_files_copied: usize,
    pub bytes_copied_total: u64,
    pub last_sync_duration_ms: Option<u64>,
    /// Set while replication is frozen by failover or destroy
    pub stopped: bool,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_success(&mut self, at: DateTime<Utc>, report: &SyncReport, duration_ms: u64) {
        self.last_sync = Some(at);
        self.last_error = None;
        self.consecutive_errors = 0;
        self.sync_count += 1;
        self.last_files_copied = report.files_copied;
        self.bytes_copied_total += report.bytes_copied;
        self.last_sync_duration_ms = Some(duration_ms);
    }

    pub fn mark_error(&mut self, error: String) {
        self.last_error = Some(error);
        self.error_count += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
    }
}

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Safety margins observed by every destructive maintenance action.
///
/// Deleting an object younger than the relevant margin is forbidden even
/// when it appears unreferenced, because a racing writer could still be
/// in the process of publishing an index that references it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SafetyParameters {
    /// Minimum age (seconds) before an unreferenced blob may be deleted.
    pub blob_delete_min_age: i64,
    /// Extra margin before a deleted entry is dropped from the index.
    pub drop_content_from_index_extra_margin: i64,
    /// Delay between rewriting a short pack and deleting the orphan.
    pub min_rewrite_to_orphan_deletion_delay: i64,
    /// Margin added when extending object-lock retention.
    pub extend_object_locks_margin: i64,
}

impl SafetyParameters {
    /// Production margins, sized for concurrent writers with skewed clocks.
    pub fn full() -> Self {
        Self {
            blob_delete_min_age: 24 * 3600,
            drop_content_from_index_extra_margin: 3600,
            min_rewrite_to_orphan_deletion_delay: 2 * 3600,
            extend_object_locks_margin: 24 * 3600,
        }
    }

    /// No safety margins at all. Only valid when no other writer can
    /// possibly be active, e.g. in tests against a private store.
    pub fn none() -> Self {
        Self {
            blob_delete_min_age: 0,
            drop_content_from_index_extra_margin: 0,
            min_rewrite_to_orphan_deletion_delay: 0,
            extend_object_locks_margin: 0,
        }
    }
}

impl Default for SafetyParameters {
    fn default() -> Self {
        Self::full()
    }
}

/// Maintenance cycle selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaintenanceCycle {
    /// Index compaction, log rotation, lock extension.
    Quick,
    /// Everything in quick, plus pack rewriting and blob GC.
    Full,
}

impl Display for MaintenanceCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceCycle::Quick => f.write_str("quick"),
            MaintenanceCycle::Full => f.write_str("full"),
        }
    }
}

/// Retention policy for uploaded task log blobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogRetention {
    pub max_count: usize,
    pub max_age: i64,
    pub max_total_bytes: u64,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            max_count: 1000,
            max_age: 30 * 24 * 3600,
            max_total_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// One completed maintenance run, kept in the params history.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MaintenanceRun {
    pub cycle: MaintenanceCycle,
    pub start: i64,
    pub end: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Maintenance schedule and ownership, persisted in the maintenance blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MaintenanceParams {
    /// `user@host` of the participant holding the maintenance lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Last lease check-in of the owner (epoch seconds).
    #[serde(default)]
    pub owner_checkin: i64,
    pub quick_enabled: bool,
    pub full_enabled: bool,
    /// Seconds between quick cycles.
    pub quick_interval: i64,
    /// Seconds between full cycles.
    pub full_interval: i64,
    /// Do not run any cycle before this time (epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_until: Option<i64>,
    #[serde(default)]
    pub log_retention: LogRetention,
    /// Extend object-lock retention on pack and index blobs.
    #[serde(default)]
    pub extend_object_locks: bool,
    /// Bounded history of completed runs, newest last.
    #[serde(default)]
    pub runs: Vec<MaintenanceRun>,
}

impl Default for MaintenanceParams {
    fn default() -> Self {
        Self {
            owner: None,
            owner_checkin: 0,
            quick_enabled: true,
            full_enabled: true,
            quick_interval: 3600,
            full_interval: 24 * 3600,
            pause_until: None,
            log_retention: LogRetention::default(),
            extend_object_locks: false,
            runs: Vec::new(),
        }
    }
}

impl MaintenanceParams {
    /// Number of history entries kept per cycle kind.
    pub const MAX_RUN_HISTORY: usize = 50;

    pub fn last_run(&self, cycle: MaintenanceCycle) -> Option<&MaintenanceRun> {
        self.runs.iter().rev().find(|run| run.cycle == cycle)
    }

    pub fn record_run(&mut self, run: MaintenanceRun) {
        self.runs.push(run);
        if self.runs.len() > Self::MAX_RUN_HISTORY {
            let excess = self.runs.len() - Self::MAX_RUN_HISTORY;
            self.runs.drain(0..excess);
        }
    }

    /// Whether the given cycle is due at `now`.
    pub fn due(&self, cycle: MaintenanceCycle, now: i64) -> bool {
        if let Some(pause_until) = self.pause_until {
            if now < pause_until {
                return false;
            }
        }
        let (enabled, interval) = match cycle {
            MaintenanceCycle::Quick => (self.quick_enabled, self.quick_interval),
            MaintenanceCycle::Full => (self.full_enabled, self.full_interval),
        };
        if !enabled {
            return false;
        }
        match self.last_run(cycle) {
            Some(run) => now >= run.end + interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schedule_due() {
        let mut params = MaintenanceParams::default();
        assert!(params.due(MaintenanceCycle::Quick, 1000));
        assert!(params.due(MaintenanceCycle::Full, 1000));

        params.record_run(MaintenanceRun {
            cycle: MaintenanceCycle::Quick,
            start: 900,
            end: 1000,
            success: true,
            message: None,
        });
        assert!(!params.due(MaintenanceCycle::Quick, 1000 + 10));
        assert!(params.due(MaintenanceCycle::Quick, 1000 + 3600));
        assert!(params.due(MaintenanceCycle::Full, 1000 + 10));

        params.pause_until = Some(20_000);
        assert!(!params.due(MaintenanceCycle::Quick, 10_000));
        assert!(params.due(MaintenanceCycle::Quick, 30_000));
    }

    #[test]
    fn run_history_bounded() {
        let mut params = MaintenanceParams::default();
        for i in 0..(MaintenanceParams::MAX_RUN_HISTORY + 7) {
            params.record_run(MaintenanceRun {
                cycle: MaintenanceCycle::Quick,
                start: i as i64,
                end: i as i64 + 1,
                success: true,
                message: None,
            });
        }
        assert_eq!(params.runs.len(), MaintenanceParams::MAX_RUN_HISTORY);
        assert_eq!(params.runs.last().unwrap().start, 56);
    }
}

//! Persistent alert history
//!
//! A flat JSON array of `{alert, timestamp}` entries, bounded to 30 days.
//! Saving rotates the previous file to `.backup`, and loading falls back to
//! the backup when the main file is unreadable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Alert;

pub const MAX_HISTORY_DAYS: i64 = 30;
const HISTORY_FILE: &str = "alert-history.json";
const HISTORY_BACKUP_FILE: &str = "alert-history.backup.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub alert: Alert,
    pub timestamp: DateTime<Utc>,
}

pub struct AlertHistory {
    entries: Mutex<Vec<HistoryEntry>>,
    history_file: PathBuf,
    backup_file: PathBuf,
}

impl AlertHistory {
    /// Open the history in `dir`, loading existing entries when present
    pub fn new(dir: &Path) -> Self {
        let history = Self {
            entries: Mutex::new(Vec::new()),
            history_file: dir.join(HISTORY_FILE),
            backup_file: dir.join(HISTORY_BACKUP_FILE),
        };

        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "failed to create alerts directory");
        }

        history.load();
        history
    }

    pub fn add(&self, alert: Alert) {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        debug!(alert_id = %alert.id, "added alert to history");
        entries.push(HistoryEntry {
            alert,
            timestamp: Utc::now(),
        });
    }

    /// Newest-first history, up to `limit` entries (0 = all)
    pub fn all(&self, limit: usize) -> Vec<Alert> {
        let entries = self.entries.lock().expect("history lock poisoned");
        let take = if limit == 0 || limit > entries.len() {
            entries.len()
        } else {
            limit
        };
        entries
            .iter()
            .rev()
            .take(take)
            .map(|e| e.alert.clone())
            .collect()
    }

    fn load(&self) {
        let data = match std::fs::read(&self.history_file) {
            Ok(data) => data,
            Err(_) => match std::fs::read(&self.backup_file) {
                Ok(data) => {
                    info!("loaded alert history from backup file");
                    data
                }
                Err(_) => return,
            },
        };

        match serde_json::from_slice::<Vec<HistoryEntry>>(&data) {
            Ok(loaded) => {
                info!(count = loaded.len(), "loaded alert history");
                *self.entries.lock().expect("history lock poisoned") = loaded;
                self.prune_old();
            }
            Err(e) => warn!(error = %e, "failed to parse alert history"),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let data = {
            let entries = self.entries.lock().expect("history lock poisoned");
            serde_json::to_vec_pretty(&*entries)?
        };

        // Keep the previous generation around as the fallback
        if self.history_file.exists() {
            if let Err(e) = std::fs::rename(&self.history_file, &self.backup_file) {
                warn!(error = %e, "failed to rotate history backup");
            }
        }

        std::fs::write(&self.history_file, data)
    }

    /// Drop entries older than [`MAX_HISTORY_DAYS`]
    pub fn prune_old(&self) {
        let cutoff = Utc::now() - Duration::days(MAX_HISTORY_DAYS);
        let mut entries = self.entries.lock().expect("history lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.timestamp > cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "pruned old alert history entries");
        }
    }

    pub fn clear(&self) -> std::io::Result<()> {
        self.entries.lock().expect("history lock poisoned").clear();
        let _ = std::fs::remove_file(&self.history_file);
        let _ = std::fs::remove_file(&self.backup_file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLevel;

    fn alert(id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            kind: "cpu".to_string(),
            level: AlertLevel::Warning,
            resource_id: "lab-px1-100".to_string(),
            resource_name: "web01".to_string(),
            node: "px1".to_string(),
            instance: "lab".to_string(),
            message: "VM cpu at 90.0%".to_string(),
            value: 90.0,
            threshold: 80.0,
            start_time: Utc::now(),
            last_seen: Utc::now(),
            acknowledged: false,
            ack_time: None,
            ack_user: None,
            metadata: Default::default(),
            last_escalation: 0,
            escalation_times: vec![],
        }
    }

    #[test]
    fn save_load_round_trip_with_backup_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let history = AlertHistory::new(dir.path());
        history.add(alert("a-cpu"));
        history.save().unwrap();

        // A second save rotates the first file into the backup slot
        history.add(alert("b-cpu"));
        history.save().unwrap();
        assert!(dir.path().join(HISTORY_BACKUP_FILE).exists());

        let reloaded = AlertHistory::new(dir.path());
        let alerts = reloaded.all(0);
        assert_eq!(alerts.len(), 2);
        // Newest first
        assert_eq!(alerts[0].id, "b-cpu");
    }

    #[test]
    fn falls_back_to_backup_when_main_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let history = AlertHistory::new(dir.path());
        history.add(alert("a-cpu"));
        history.save().unwrap();
        history.save().unwrap();

        std::fs::write(dir.path().join(HISTORY_FILE), b"{not json").unwrap();

        let reloaded = AlertHistory::new(dir.path());
        // Main file is unreadable JSON; entries come from the backup
        assert_eq!(reloaded.all(0).len(), 1);
    }

    #[test]
    fn limit_caps_returned_entries() {
        let dir = tempfile::tempdir().unwrap();
        let history = AlertHistory::new(dir.path());
        for i in 0..5 {
            history.add(alert(&format!("a{i}-cpu")));
        }
        assert_eq!(history.all(2).len(), 2);
        assert_eq!(history.all(0).len(), 5);
    }

    #[test]
    fn prune_drops_entries_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let history = AlertHistory::new(dir.path());
        {
            let mut entries = history.entries.lock().unwrap();
            entries.push(HistoryEntry {
                alert: alert("old-cpu"),
                timestamp: Utc::now() - Duration::days(MAX_HISTORY_DAYS + 1),
            });
            entries.push(HistoryEntry {
                alert: alert("new-cpu"),
                timestamp: Utc::now(),
            });
        }

        history.prune_old();
        let alerts = history.all(0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, "new-cpu");
    }
}

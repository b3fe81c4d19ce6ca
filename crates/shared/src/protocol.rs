use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

/// Point-in-time status of the server-side import job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    #[serde(default)]
    pub current_town: Option<String>,
    #[serde(default)]
    pub current_season: Option<String>,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub total_meetings: u64,
    #[serde(default)]
    pub processed_meetings: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.total_meetings > 0 && self.processed_meetings > self.total_meetings {
            return Err(SnapshotError::ProgressOverflow {
                processed: self.processed_meetings,
                total: self.total_meetings,
            });
        }
        Ok(())
    }

    /// Fraction of meetings processed, `None` while the total is unknown.
    pub fn progress(&self) -> Option<f64> {
        if self.total_meetings == 0 {
            return None;
        }
        Some(self.processed_meetings as f64 / self.total_meetings as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
    #[serde(other)]
    Other,
}

/// One record of the job's event log, in the order the server emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: EventLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub town: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Summary of the most recently completed run, including its retained event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRunSummary {
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub town: Option<String>,
    #[serde(default)]
    pub processed_meetings: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub events: Vec<SyncEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: i64,
    pub town_ref: String,
    #[serde(default)]
    pub season_ref: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
    pub operation: String,
    pub source: String,
    pub success: bool,
    pub record_count: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRow {
    pub town: String,
    pub season: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSummary {
    #[serde(default)]
    pub seasons: Vec<DataSourceRow>,
    #[serde(default)]
    pub meetings: Vec<DataSourceRow>,
    #[serde(default)]
    pub members: Vec<DataSourceRow>,
    #[serde(default)]
    pub polls: Vec<DataSourceRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_decodes_camel_case_payload() {
        let snapshot: StatusSnapshot = serde_json::from_str(
            r#"{
                "running": true,
                "currentTown": "trnava",
                "currentSeason": "2022-2026",
                "currentPhase": "polls",
                "totalMeetings": 12,
                "processedMeetings": 3,
                "startedAt": "2024-05-01T08:00:00Z",
                "lastCompletedAt": null
            }"#,
        )
        .expect("decode");

        assert!(snapshot.running);
        assert_eq!(snapshot.current_town.as_deref(), Some("trnava"));
        assert_eq!(snapshot.processed_meetings, 3);
        assert!(snapshot.last_completed_at.is_none());
        assert_eq!(snapshot.progress(), Some(0.25));
    }

    #[test]
    fn snapshot_rejects_processed_above_total() {
        let snapshot = StatusSnapshot {
            total_meetings: 4,
            processed_meetings: 5,
            ..StatusSnapshot::default()
        };
        assert_eq!(
            snapshot.validate(),
            Err(SnapshotError::ProgressOverflow {
                processed: 5,
                total: 4
            })
        );
    }

    #[test]
    fn snapshot_without_total_is_valid_and_has_no_progress() {
        let snapshot = StatusSnapshot {
            processed_meetings: 7,
            ..StatusSnapshot::default()
        };
        assert!(snapshot.validate().is_ok());
        assert_eq!(snapshot.progress(), None);
    }

    #[test]
    fn unknown_event_level_is_preserved_as_other() {
        let event: SyncEvent = serde_json::from_str(
            r#"{"timestamp":"2024-05-01T08:00:00Z","level":"trace","message":"x"}"#,
        )
        .expect("decode");
        assert_eq!(event.level, EventLevel::Other);

        let event: SyncEvent = serde_json::from_str(
            r#"{"timestamp":"2024-05-01T08:00:00Z","level":"warning","message":"y"}"#,
        )
        .expect("decode");
        assert_eq!(event.level, EventLevel::Warn);
    }
}

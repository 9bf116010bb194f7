//! Persisted report artifacts.
//!
//! A report is stored as one JSON payload under its key. `put` is a single
//! upsert, so a reader sees either the old payload or the new one.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::{Report, ReportKey, ReportKind, TimeRange};
use chrono::NaiveDate;
use serde::Serialize;

/// Summary of a stored report, without the payload.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredReportInfo {
    pub id: i64,
    pub tracker_id: i64,
    pub kind: String,
    pub subject: String,
    pub range_start: String,
    pub range_end: String,
    pub generated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ReportStore {
    pool: DbPool,
}

/// Range columns use '' for "no range" so the unique key stays comparable.
fn range_columns(range: Option<TimeRange>) -> (String, String) {
    match range {
        Some(r) => (r.start.to_string(), r.end.to_string()),
        None => (String::new(), String::new()),
    }
}

impl ReportStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &ReportKey) -> Result<Option<Report>, AppError> {
        let (start, end) = range_columns(key.time_range);

        let payload: Option<String> = sqlx::query_scalar(
            r#"
            SELECT payload FROM reports
            WHERE tracker_id = ? AND kind = ? AND subject = ? AND range_start = ? AND range_end = ?
            "#,
        )
        .bind(key.tracker_id)
        .bind(key.kind.as_str())
        .bind(&key.subject)
        .bind(&start)
        .bind(&end)
        .fetch_optional(&self.pool)
        .await?;

        match payload {
            Some(json) => match serde_json::from_str(&json) {
                Ok(report) => Ok(Some(report)),
                Err(e) => {
                    // Unreadable payloads (e.g. from an older format) count as a miss
                    log::warn!("Discarding unreadable report {:?}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Insert or replace the report stored under `report.key`.
    pub async fn put(&self, report: &Report) -> Result<(), AppError> {
        let key = &report.key;
        let (start, end) = range_columns(key.time_range);
        let payload = serde_json::to_string(report)?;

        sqlx::query(
            r#"
            INSERT INTO reports (tracker_id, kind, subject, range_start, range_end, payload, generated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tracker_id, kind, subject, range_start, range_end) DO UPDATE SET
                payload = excluded.payload,
                generated_at = excluded.generated_at
            "#,
        )
        .bind(key.tracker_id)
        .bind(key.kind.as_str())
        .bind(&key.subject)
        .bind(&start)
        .bind(&end)
        .bind(&payload)
        .bind(report.generated_at.timestamp())
        .execute(&self.pool)
        .await?;

        log::debug!(
            "Stored {} report {} for tracker {}",
            key.kind,
            key.subject,
            key.tracker_id
        );
        Ok(())
    }

    /// Remove a stored report. Returns whether one existed.
    pub async fn invalidate(&self, key: &ReportKey) -> Result<bool, AppError> {
        let (start, end) = range_columns(key.time_range);

        let result = sqlx::query(
            r#"
            DELETE FROM reports
            WHERE tracker_id = ? AND kind = ? AND subject = ? AND range_start = ? AND range_end = ?
            "#,
        )
        .bind(key.tracker_id)
        .bind(key.kind.as_str())
        .bind(&key.subject)
        .bind(&start)
        .bind(&end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop the stored reports of one subject across all time ranges.
    pub async fn invalidate_subject(
        &self,
        tracker_id: i64,
        kind: ReportKind,
        subject: &str,
    ) -> Result<u64, AppError> {
        let result =
            sqlx::query("DELETE FROM reports WHERE tracker_id = ? AND kind = ? AND subject = ?")
                .bind(tracker_id)
                .bind(kind.as_str())
                .bind(subject)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Drop every stored report of a tracker, e.g. after remapping identities.
    pub async fn invalidate_tracker(&self, tracker_id: i64) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM reports WHERE tracker_id = ?")
            .bind(tracker_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            log::info!(
                "Invalidated {} stored reports for tracker {}",
                result.rows_affected(),
                tracker_id
            );
        }
        Ok(result.rows_affected())
    }

    /// Newest first.
    pub async fn list_for_tracker(
        &self,
        tracker_id: i64,
        kind: Option<ReportKind>,
    ) -> Result<Vec<StoredReportInfo>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, tracker_id, kind, subject, range_start, range_end, generated_at
            FROM reports
            WHERE tracker_id = ? AND (? IS NULL OR kind = ?)
            ORDER BY generated_at DESC, id DESC
            "#,
        )
        .bind(tracker_id)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

impl StoredReportInfo {
    pub fn time_range(&self) -> Option<TimeRange> {
        let start = NaiveDate::parse_from_str(&self.range_start, "%Y-%m-%d").ok()?;
        let end = NaiveDate::parse_from_str(&self.range_end, "%Y-%m-%d").ok()?;
        Some(TimeRange::new(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metrics;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_range_columns() {
        assert_eq!(range_columns(None), (String::new(), String::new()));

        let range = TimeRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 14).unwrap(),
        );
        assert_eq!(
            range_columns(Some(range)),
            ("2024-01-01".to_string(), "2024-01-14".to_string())
        );
    }

    #[test]
    fn test_stored_info_time_range() {
        let mut info = StoredReportInfo {
            id: 1,
            tracker_id: 1,
            kind: "team".to_string(),
            subject: "team:1".to_string(),
            range_start: "2024-01-01".to_string(),
            range_end: "2024-01-14".to_string(),
            generated_at: 0,
        };
        assert!(info.time_range().is_some());

        info.range_start.clear();
        info.range_end.clear();
        assert!(info.time_range().is_none());
    }

    #[test]
    fn test_report_payload_is_stable_json() {
        let report = Report {
            key: ReportKey {
                tracker_id: 1,
                kind: ReportKind::Sprint,
                subject: "sprint:9".to_string(),
                time_range: None,
            },
            title: "Sprint 9".to_string(),
            period: None,
            sprint_ids: vec!["9".to_string()],
            rows: vec![],
            totals: Metrics::default(),
            unmapped_identities: vec![],
            comparison: None,
            generated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        let first = serde_json::to_string(&report).unwrap();
        let back: Report = serde_json::from_str(&first).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), first);
    }
}

//! Report request, key and artifact models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of generated report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Sprint,
    Team,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sprint => "sprint",
            Self::Team => "team",
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

/// What a report is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReportSubject {
    /// One sprint, optionally narrowed to a single local user's issues.
    Sprint {
        sprint_id: String,
        for_user: Option<i64>,
    },
    /// All members of a team over a time range.
    Team { team_id: i64 },
}

impl ReportSubject {
    pub fn kind(&self) -> ReportKind {
        match self {
            Self::Sprint { .. } => ReportKind::Sprint,
            Self::Team { .. } => ReportKind::Team,
        }
    }

    /// Stable string used in the cache key.
    pub fn key_string(&self) -> String {
        match self {
            Self::Sprint {
                sprint_id,
                for_user: None,
            } => format!("sprint:{}", sprint_id),
            Self::Sprint {
                sprint_id,
                for_user: Some(user_id),
            } => format!("sprint:{}:user:{}", sprint_id, user_id),
            Self::Team { team_id } => format!("team:{}", team_id),
        }
    }
}

/// A request to generate (or fetch) a report.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub tracker_id: i64,
    pub subject: ReportSubject,
    pub time_range: Option<TimeRange>,
    pub force_refresh: bool,
    /// Local user id of whoever is asking.
    pub actor: i64,
}

impl ReportRequest {
    pub fn key(&self) -> ReportKey {
        ReportKey {
            tracker_id: self.tracker_id,
            kind: self.subject.kind(),
            subject: self.subject.key_string(),
            time_range: self.time_range,
        }
    }
}

/// Cache key: (tracker id, report kind, subject, time range).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportKey {
    pub tracker_id: i64,
    pub kind: ReportKind,
    pub subject: String,
    pub time_range: Option<TimeRange>,
}

/// Aggregated metrics for one row or for the whole report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub issues: u32,
    pub issues_by_status: BTreeMap<String, u32>,
    pub points: f64,
    pub completed: u32,
    pub completed_points: f64,
    /// Completed vs planned, in `[0, 1]`.
    pub completion_ratio: f64,
    pub avg_cycle_time_hours: Option<f64>,
    pub deadlines_missed: u32,
}

/// Who a metric row belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowSubject {
    #[serde(rename_all = "camelCase")]
    User { user_id: i64, display_name: String },
    /// Assignees the registry could not resolve.
    Unmapped,
    /// Issues with no assignee at all.
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRow {
    pub subject: RowSubject,
    pub metrics: Metrics,
}

/// A metric compared with its value in the previous sprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub current: f64,
    pub previous: f64,
    pub change_percent: f64,
}

impl MetricComparison {
    pub fn new(current: f64, previous: f64) -> Self {
        Self {
            current,
            previous,
            change_percent: percent_change(current, previous),
        }
    }
}

/// Percent change from `previous` to `current`.
pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        if current > 0.0 {
            100.0
        } else {
            0.0
        }
    } else {
        (current - previous) / previous * 100.0
    }
}

/// Totals of this sprint against the preceding sprint's stored report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsComparison {
    pub previous_sprint_id: String,
    pub points: MetricComparison,
    pub completed_points: MetricComparison,
    pub completed: MetricComparison,
    pub deadlines_missed: MetricComparison,
    /// Absent unless both sprints completed issues with a known cycle time.
    #[serde(default)]
    pub avg_cycle_time_hours: Option<MetricComparison>,
}

/// A generated report. Never edited in place; regeneration replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub key: ReportKey,
    /// Sprint or team name.
    pub title: String,
    /// Dates the report covers.
    pub period: Option<TimeRange>,
    pub sprint_ids: Vec<String>,
    pub rows: Vec<MetricRow>,
    pub totals: Metrics,
    /// External ids of assignees with no local account.
    pub unmapped_identities: Vec<String>,
    pub comparison: Option<TotalsComparison>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn row_for_user(&self, user_id: i64) -> Option<&MetricRow> {
        self.rows.iter().find(|r| {
            matches!(&r.subject, RowSubject::User { user_id: id, .. } if *id == user_id)
        })
    }

    pub fn unmapped_row(&self) -> Option<&MetricRow> {
        self.rows
            .iter()
            .find(|r| r.subject == RowSubject::Unmapped)
    }
}

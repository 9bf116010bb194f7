//! Tracker data snapshots: issues, sprints and tracker users.
//!
//! These are immutable views of what the tracker returned for one fetch.
//! They are never written back or cached as a source of truth.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Status keys that count as finished work.
const COMPLETED_STATUS_KEYS: &[&str] = &["done", "closed", "resolved"];

/// An issue as fetched from the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerIssue {
    /// Tracker-internal id.
    pub id: String,

    /// Human-facing key (e.g. `TEAM-42`).
    pub key: String,

    /// Status key as reported by the tracker (e.g. `open`, `inProgress`, `done`).
    pub status: String,

    /// External id of the assignee, if any.
    pub assignee: Option<String>,

    /// Estimate in story points.
    pub story_points: Option<f64>,

    /// All sprints the tracker lists for this issue.
    pub sprint_ids: Vec<String>,

    pub created_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,

    pub deadline: Option<NaiveDate>,
}

impl TrackerIssue {
    /// Whether the issue is in a finished state.
    pub fn is_completed(&self) -> bool {
        COMPLETED_STATUS_KEYS
            .iter()
            .any(|k| self.status.eq_ignore_ascii_case(k))
    }

    /// Hours from creation to resolution, for completed issues only.
    pub fn cycle_time_hours(&self) -> Option<f64> {
        if !self.is_completed() {
            return None;
        }
        let resolved = self.resolved_at?;
        let secs = (resolved - self.created_at).num_seconds().max(0);
        Some(secs as f64 / 3600.0)
    }

    /// Whether the deadline was missed as of `today`.
    ///
    /// Completed issues miss when resolved after the deadline day; open
    /// issues miss once the deadline has passed.
    pub fn missed_deadline(&self, today: NaiveDate) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        match (self.is_completed(), self.resolved_at) {
            (true, Some(resolved)) => resolved.date_naive() > deadline,
            (true, None) => false,
            (false, _) => deadline < today,
        }
    }
}

/// A time-boxed iteration on the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Issue ids, when the tracker includes them in sprint listings.
    #[serde(default)]
    pub issue_ids: Vec<String>,
}

impl Sprint {
    /// Whether the sprint shares at least one day with `[start, end]`.
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && self.end_date >= start
    }
}

/// A user as listed by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerIdentity {
    pub external_id: String,
    pub login: Option<String>,
    pub display_name: Option<String>,
}

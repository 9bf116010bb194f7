//! Metric aggregation over a snapshot of tracker issues.
//!
//! Pure functions: no I/O, no clock. The caller supplies the issues, the
//! identity mapping and the date used for deadline checks.

use crate::models::{LocalUser, MetricRow, Metrics, RowSubject, TrackerIssue};
use crate::services::registry::IdentityMap;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Which rows a report contains.
#[derive(Debug, Clone, Copy)]
pub enum RowScope<'a> {
    /// Every resolved assignee plus the unmapped and unassigned buckets.
    Everyone,
    /// Only the given users, each with a row even without issues.
    Members {
        users: &'a [LocalUser],
        include_unmapped: bool,
    },
}

/// Result of aggregating one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub rows: Vec<MetricRow>,
    pub totals: Metrics,
    pub unmapped_identities: Vec<String>,
}

/// Running sums for one row.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    metrics: Metrics,
    cycle_hours_total: f64,
    cycle_samples: u32,
}

impl MetricsAccumulator {
    pub fn add(&mut self, issue: &TrackerIssue, today: NaiveDate) {
        let points = issue.story_points.unwrap_or(0.0);
        let m = &mut self.metrics;

        m.issues += 1;
        *m.issues_by_status.entry(issue.status.clone()).or_insert(0) += 1;
        m.points += points;

        if issue.is_completed() {
            m.completed += 1;
            m.completed_points += points;
        }
        if let Some(hours) = issue.cycle_time_hours() {
            self.cycle_hours_total += hours;
            self.cycle_samples += 1;
        }
        if issue.missed_deadline(today) {
            m.deadlines_missed += 1;
        }
    }

    pub fn merge(&mut self, other: &MetricsAccumulator) {
        let m = &mut self.metrics;
        m.issues += other.metrics.issues;
        for (status, count) in &other.metrics.issues_by_status {
            *m.issues_by_status.entry(status.clone()).or_insert(0) += count;
        }
        m.points += other.metrics.points;
        m.completed += other.metrics.completed;
        m.completed_points += other.metrics.completed_points;
        m.deadlines_missed += other.metrics.deadlines_missed;

        self.cycle_hours_total += other.cycle_hours_total;
        self.cycle_samples += other.cycle_samples;
    }

    pub fn finish(self) -> Metrics {
        let mut metrics = self.metrics;

        metrics.completion_ratio = if metrics.points > 0.0 {
            metrics.completed_points / metrics.points
        } else if metrics.issues > 0 {
            metrics.completed as f64 / metrics.issues as f64
        } else {
            0.0
        };
        metrics.avg_cycle_time_hours = (self.cycle_samples > 0)
            .then(|| self.cycle_hours_total / self.cycle_samples as f64);

        metrics
    }
}

/// Group `issues` by assignee and compute per-row and total metrics.
pub fn aggregate(
    issues: &[TrackerIssue],
    identities: &IdentityMap,
    scope: RowScope<'_>,
    today: NaiveDate,
) -> Aggregation {
    let mut users: HashMap<i64, (String, MetricsAccumulator)> = HashMap::new();
    let mut unmapped = MetricsAccumulator::default();
    let mut unassigned = MetricsAccumulator::default();
    let mut unmapped_ids = BTreeSet::new();

    let (include_unmapped, include_unassigned) = match scope {
        RowScope::Everyone => (true, true),
        RowScope::Members {
            users: members,
            include_unmapped,
        } => {
            for member in members {
                users.insert(
                    member.id,
                    (member.display_name.clone(), MetricsAccumulator::default()),
                );
            }
            (include_unmapped, false)
        }
    };

    for issue in issues {
        let Some(external_id) = issue.assignee.as_deref() else {
            if include_unassigned {
                unassigned.add(issue, today);
            }
            continue;
        };

        match identities.get(external_id) {
            Some(user) => match scope {
                RowScope::Everyone => users
                    .entry(user.id)
                    .or_insert_with(|| (user.display_name.clone(), MetricsAccumulator::default()))
                    .1
                    .add(issue, today),
                RowScope::Members { .. } => {
                    // Mapped to someone outside the scope
                    if let Some((_, acc)) = users.get_mut(&user.id) {
                        acc.add(issue, today);
                    }
                }
            },
            None if include_unmapped => {
                unmapped.add(issue, today);
                unmapped_ids.insert(external_id.to_string());
            }
            None => {}
        }
    }

    let mut totals = MetricsAccumulator::default();
    let mut user_rows: Vec<(i64, String, Metrics)> = users
        .into_iter()
        .map(|(id, (name, acc))| {
            totals.merge(&acc);
            (id, name, acc.finish())
        })
        .collect();

    user_rows.sort_by(|a, b| {
        b.2.points
            .partial_cmp(&a.2.points)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut rows: Vec<MetricRow> = user_rows
        .into_iter()
        .map(|(user_id, display_name, metrics)| MetricRow {
            subject: RowSubject::User {
                user_id,
                display_name,
            },
            metrics,
        })
        .collect();

    for (subject, acc) in [
        (RowSubject::Unmapped, unmapped),
        (RowSubject::Unassigned, unassigned),
    ] {
        if acc.metrics.issues > 0 {
            totals.merge(&acc);
            rows.push(MetricRow {
                subject,
                metrics: acc.finish(),
            });
        }
    }

    Aggregation {
        rows,
        totals: totals.finish(),
        unmapped_identities: unmapped_ids.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::{TimeZone, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 30).unwrap()
    }

    fn user(id: i64, name: &str) -> LocalUser {
        LocalUser {
            id,
            display_name: name.to_string(),
            email: None,
            role: Role::Member,
            identities: vec![],
        }
    }

    fn issue(id: &str, assignee: Option<&str>, points: Option<f64>, status: &str) -> TrackerIssue {
        let done = matches!(status, "done" | "closed" | "resolved");
        TrackerIssue {
            id: id.to_string(),
            key: format!("T-{}", id),
            status: status.to_string(),
            assignee: assignee.map(str::to_string),
            story_points: points,
            sprint_ids: vec!["1".to_string()],
            created_at: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            resolved_at: done.then(|| Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap()),
            deadline: None,
        }
    }

    fn identities() -> IdentityMap {
        vec![
            ("ext-a".to_string(), user(1, "Alice")),
            ("ext-c".to_string(), user(3, "Carol")),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_mapped_and_unmapped_rows() {
        let issues = vec![
            issue("1", Some("ext-a"), Some(5.0), "done"),
            issue("2", Some("ext-a"), Some(3.0), "open"),
            issue("3", Some("ext-b"), Some(2.0), "done"),
        ];

        let agg = aggregate(&issues, &identities(), RowScope::Everyone, today());

        assert_eq!(agg.rows.len(), 2);
        let alice = &agg.rows[0];
        assert!(matches!(alice.subject, RowSubject::User { user_id: 1, .. }));
        assert_eq!(alice.metrics.issues, 2);
        assert_eq!(alice.metrics.points, 8.0);
        assert_eq!(alice.metrics.completed, 1);
        assert_eq!(alice.metrics.completion_ratio, 5.0 / 8.0);
        assert_eq!(alice.metrics.avg_cycle_time_hours, Some(24.0));

        let unmapped = &agg.rows[1];
        assert_eq!(unmapped.subject, RowSubject::Unmapped);
        assert_eq!(unmapped.metrics.issues, 1);
        assert_eq!(unmapped.metrics.points, 2.0);
        assert_eq!(unmapped.metrics.completed, 1);

        assert_eq!(agg.totals.points, 10.0);
        assert_eq!(agg.totals.issues, 3);
        assert_eq!(agg.unmapped_identities, vec!["ext-b".to_string()]);
    }

    #[test]
    fn test_row_issue_counts_sum_to_total() {
        let issues = vec![
            issue("1", Some("ext-a"), Some(1.0), "done"),
            issue("2", Some("ext-c"), None, "open"),
            issue("3", None, Some(2.0), "open"),
            issue("4", Some("ext-x"), None, "closed"),
        ];

        let agg = aggregate(&issues, &identities(), RowScope::Everyone, today());
        let sum: u32 = agg.rows.iter().map(|r| r.metrics.issues).sum();

        assert_eq!(sum, agg.totals.issues);
        assert_eq!(agg.totals.issues, issues.len() as u32);
        assert_eq!(agg.rows.last().unwrap().subject, RowSubject::Unassigned);
    }

    #[test]
    fn test_rows_sorted_by_points_then_name() {
        let ids: IdentityMap = vec![
            ("z".to_string(), user(1, "Zed")),
            ("a".to_string(), user(2, "Amy")),
            ("b".to_string(), user(3, "Bob")),
        ]
        .into_iter()
        .collect();
        let issues = vec![
            issue("1", Some("z"), Some(3.0), "open"),
            issue("2", Some("a"), Some(3.0), "open"),
            issue("3", Some("b"), Some(8.0), "open"),
        ];

        let agg = aggregate(&issues, &ids, RowScope::Everyone, today());
        let names: Vec<_> = agg
            .rows
            .iter()
            .filter_map(|r| match &r.subject {
                RowSubject::User { display_name, .. } => Some(display_name.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(names, vec!["Bob", "Amy", "Zed"]);
    }

    #[test]
    fn test_completion_ratio_falls_back_to_counts() {
        let issues = vec![
            issue("1", Some("ext-a"), None, "done"),
            issue("2", Some("ext-a"), None, "open"),
        ];

        let agg = aggregate(&issues, &identities(), RowScope::Everyone, today());
        assert_eq!(agg.rows[0].metrics.points, 0.0);
        assert_eq!(agg.rows[0].metrics.completion_ratio, 0.5);
    }

    #[test]
    fn test_members_scope_gives_zero_rows_and_skips_outsiders() {
        let members = vec![user(1, "Alice"), user(2, "Dave")];
        let issues = vec![
            issue("1", Some("ext-a"), Some(2.0), "open"),
            issue("2", Some("ext-c"), Some(5.0), "open"),
            issue("3", Some("ext-b"), Some(1.0), "open"),
            issue("4", None, Some(1.0), "open"),
        ];

        let agg = aggregate(
            &issues,
            &identities(),
            RowScope::Members {
                users: &members,
                include_unmapped: true,
            },
            today(),
        );

        assert_eq!(agg.rows.len(), 3);
        assert!(matches!(agg.rows[0].subject, RowSubject::User { user_id: 1, .. }));
        assert!(matches!(agg.rows[1].subject, RowSubject::User { user_id: 2, .. }));
        assert_eq!(agg.rows[1].metrics, Metrics::default());
        assert_eq!(agg.rows[2].subject, RowSubject::Unmapped);
        assert_eq!(agg.totals.points, 3.0);
    }

    #[test]
    fn test_self_scope_excludes_buckets() {
        let me = vec![user(3, "Carol")];
        let issues = vec![
            issue("1", Some("ext-a"), Some(2.0), "open"),
            issue("2", Some("ext-c"), Some(5.0), "done"),
            issue("3", Some("ext-b"), Some(1.0), "open"),
        ];

        let agg = aggregate(
            &issues,
            &identities(),
            RowScope::Members {
                users: &me,
                include_unmapped: false,
            },
            today(),
        );

        assert_eq!(agg.rows.len(), 1);
        assert_eq!(agg.totals.issues, 1);
        assert!(agg.unmapped_identities.is_empty());
    }

    #[test]
    fn test_deadlines_missed_counted() {
        let mut late = issue("1", Some("ext-a"), Some(1.0), "open");
        late.deadline = NaiveDate::from_ymd_opt(2024, 4, 15);

        let agg = aggregate(&[late], &identities(), RowScope::Everyone, today());
        assert_eq!(agg.totals.deadlines_missed, 1);
    }
}

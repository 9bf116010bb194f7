//! Shared fixtures for integration tests.
//!
//! `FakeTracker` serves canned sprints and issues and counts every call, so
//! tests can assert how often the tracker was actually hit.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use sprint_reports::error::AppError;
use sprint_reports::models::{
    LocalUser, NewLocalUser, NewTracker, ReportRequest, ReportSubject, Role, Sprint, TimeRange,
    TrackerIdentity, TrackerIssue,
};
use sprint_reports::services::{ReportEngine, TrackerApi};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
pub struct FakeTracker {
    pub sprints: Mutex<Vec<Sprint>>,
    pub issues: Mutex<HashMap<String, Vec<TrackerIssue>>>,
    pub users: Mutex<Vec<TrackerIdentity>>,
    pub fail_with: Mutex<Option<AppError>>,
    pub delay: Mutex<Duration>,
    calls: AtomicU32,
}

impl FakeTracker {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_issues(&self, sprint_id: &str, issues: Vec<TrackerIssue>) {
        self.issues
            .lock()
            .unwrap()
            .insert(sprint_id.to_string(), issues);
    }

    pub fn fail_with(&self, err: AppError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn enter(&self) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.fail_with.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrackerApi for FakeTracker {
    async fn list_sprints(&self, _tracker_id: i64) -> Result<Vec<Sprint>, AppError> {
        self.enter().await?;
        Ok(self.sprints.lock().unwrap().clone())
    }

    async fn list_issues(
        &self,
        _tracker_id: i64,
        sprint_id: &str,
    ) -> Result<Vec<TrackerIssue>, AppError> {
        self.enter().await?;
        Ok(self
            .issues
            .lock()
            .unwrap()
            .get(sprint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_users(&self, _tracker_id: i64) -> Result<Vec<TrackerIdentity>, AppError> {
        self.enter().await?;
        Ok(self.users.lock().unwrap().clone())
    }
}

pub fn day(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, month, day).unwrap()
}

pub fn sprint(id: &str, start: NaiveDate, end: NaiveDate) -> Sprint {
    Sprint {
        id: id.to_string(),
        name: format!("Sprint {}", id),
        start_date: start,
        end_date: end,
        issue_ids: vec![],
    }
}

pub fn issue(
    id: &str,
    sprint_id: &str,
    assignee: Option<&str>,
    points: Option<f64>,
    status: &str,
) -> TrackerIssue {
    let done = matches!(status, "done" | "closed" | "resolved");
    TrackerIssue {
        id: id.to_string(),
        key: format!("TEAM-{}", id),
        status: status.to_string(),
        assignee: assignee.map(str::to_string),
        story_points: points,
        sprint_ids: vec![sprint_id.to_string()],
        created_at: Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(),
        resolved_at: done.then(|| Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap()),
        deadline: None,
    }
}

/// An engine over a fresh database with one tracker and three users:
/// an admin, a lead and a member linked to tracker identity `ext-a`.
pub struct Fixture {
    pub _dir: TempDir,
    pub engine: Arc<ReportEngine>,
    pub tracker: Arc<FakeTracker>,
    pub tracker_id: i64,
    pub admin: LocalUser,
    pub lead: LocalUser,
    pub member: LocalUser,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = sprint_reports::db::initialize(&db_path).await.unwrap();

        let tracker = Arc::new(FakeTracker::default());
        let engine = Arc::new(sprint_reports::build_engine(pool, tracker.clone()));
        let registry = engine.registry();

        let tracker_id = registry
            .create_tracker(&NewTracker {
                name: "Main".to_string(),
                tracker_type: "yandex".to_string(),
                base_url: "https://tracker.example.com".to_string(),
                org_id: Some("42".to_string()),
                token: "token".to_string(),
            })
            .await
            .unwrap()
            .id;

        let admin = registry.ensure_admin("Root").await.unwrap();
        let lead = create_user(&engine, "Bob", Role::Lead).await;
        let member = create_user(&engine, "Alice", Role::Member).await;
        registry
            .link_identity(member.id, tracker_id, "ext-a")
            .await
            .unwrap();

        Self {
            _dir: dir,
            engine,
            tracker,
            tracker_id,
            admin,
            lead,
            member,
        }
    }

    /// Two consecutive sprints; `s1` holds the canonical scenario:
    /// Alice 5 points done plus 3 open, unmapped `ext-b` 2 points done.
    pub fn seed_sprints(&self) {
        *self.tracker.sprints.lock().unwrap() = vec![
            sprint("s0", day(2, 19), day(3, 3)),
            sprint("s1", day(3, 4), day(3, 17)),
        ];
        self.tracker.set_issues(
            "s1",
            vec![
                issue("1", "s1", Some("ext-a"), Some(5.0), "done"),
                issue("2", "s1", Some("ext-a"), Some(3.0), "open"),
                issue("3", "s1", Some("ext-b"), Some(2.0), "done"),
            ],
        );
    }

    pub fn sprint_request(&self, actor: i64, sprint_id: &str, for_user: Option<i64>) -> ReportRequest {
        ReportRequest {
            tracker_id: self.tracker_id,
            subject: ReportSubject::Sprint {
                sprint_id: sprint_id.to_string(),
                for_user,
            },
            time_range: None,
            force_refresh: false,
            actor,
        }
    }

    pub fn team_request(&self, actor: i64, team_id: i64, range: TimeRange) -> ReportRequest {
        ReportRequest {
            tracker_id: self.tracker_id,
            subject: ReportSubject::Team { team_id },
            time_range: Some(range),
            force_refresh: false,
            actor,
        }
    }
}

pub async fn create_user(engine: &ReportEngine, name: &str, role: Role) -> LocalUser {
    engine
        .registry()
        .create_user(&NewLocalUser {
            display_name: name.to_string(),
            email: None,
            role,
        })
        .await
        .unwrap()
}

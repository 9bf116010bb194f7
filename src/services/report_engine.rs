//! Report generation.
//!
//! Validates and authorizes a request, serves it from the store when
//! possible, and otherwise fetches a fresh tracker snapshot, aggregates it
//! and persists the result. Concurrent identical requests share one
//! generation.
//!
//! Registry changes that alter attribution (identity links, team
//! membership) go through the engine so the affected stored reports are
//! dropped. Each tracker carries an attribution epoch; a generation that
//! overlaps a change removes the report it just stored instead of leaving a
//! stale one behind.

use crate::error::AppError;
use crate::models::{
    LinkedIdentity, LocalUser, MetricComparison, Metrics, NewTracker, Report, ReportKey,
    ReportKind, ReportRequest, ReportSubject, Sprint, Team, TimeRange, TotalsComparison,
    TrackerIdentity, TrackerInstance, TrackerIssue,
};
use crate::services::aggregation::{aggregate, RowScope};
use crate::services::registry::{Action, Registry};
use crate::services::report_store::ReportStore;
use crate::services::single_flight::SingleFlight;
use crate::services::tracker_client::TrackerApi;
use chrono::Utc;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct ReportEngine {
    tracker: Arc<dyn TrackerApi>,
    registry: Registry,
    store: ReportStore,
    flights: SingleFlight<ReportKey, Result<Report, AppError>>,
    /// Per tracker, bumped after every registry change that moves issues
    /// between rows.
    attribution: Mutex<HashMap<i64, u64>>,
}

impl ReportEngine {
    pub fn new(tracker: Arc<dyn TrackerApi>, registry: Registry, store: ReportStore) -> Self {
        Self {
            tracker,
            registry,
            store,
            flights: SingleFlight::new(),
            attribution: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    /// Store a new tracker connection and make it reachable.
    pub async fn add_tracker(
        &self,
        actor: i64,
        new: &NewTracker,
    ) -> Result<TrackerInstance, AppError> {
        self.registry
            .ensure_authorized(actor, Action::ManageRegistry)
            .await?;

        let tracker = self.registry.create_tracker(new).await?;
        self.tracker.connect(&tracker)?;
        log::info!("Connected tracker {} ({})", tracker.id, tracker.name);
        Ok(tracker)
    }

    /// Generate (or fetch from the store) the report a request describes.
    pub async fn generate(&self, request: &ReportRequest) -> Result<Report, AppError> {
        match request.subject {
            ReportSubject::Sprint { .. } => self.generate_sprint_report(request).await,
            ReportSubject::Team { .. } => self.generate_team_report(request).await,
        }
    }

    pub async fn generate_sprint_report(&self, request: &ReportRequest) -> Result<Report, AppError> {
        let ReportSubject::Sprint {
            sprint_id,
            for_user,
        } = &request.subject
        else {
            return Err(AppError::validation_field("Expected a sprint subject", "subject"));
        };

        if sprint_id.trim().is_empty() {
            return Err(AppError::validation_field("Sprint id is required", "subject"));
        }
        if request.time_range.is_some() {
            return Err(AppError::validation_field(
                "Sprint reports cover the sprint's own dates; omit the time range",
                "timeRange",
            ));
        }

        self.registry
            .ensure_authorized(request.actor, Action::ViewReport(&request.subject))
            .await?;
        self.registry.get_tracker(request.tracker_id).await?;

        // Resolved before touching the tracker so a bad user id costs nothing
        let scoped_user = match for_user {
            Some(user_id) => Some(self.registry.require_user(*user_id).await?),
            None => None,
        };

        self.cached_or_generate(request, || {
            self.build_sprint_report(request, sprint_id, scoped_user)
        })
        .await
    }

    pub async fn generate_team_report(&self, request: &ReportRequest) -> Result<Report, AppError> {
        let ReportSubject::Team { team_id } = request.subject else {
            return Err(AppError::validation_field("Expected a team subject", "subject"));
        };

        let range = match request.time_range {
            Some(range) if range.is_valid() => range,
            Some(_) => {
                return Err(AppError::validation_field(
                    "Time range start must not be after its end",
                    "timeRange",
                ))
            }
            None => {
                return Err(AppError::validation_field(
                    "Team reports require a time range",
                    "timeRange",
                ))
            }
        };

        self.registry
            .ensure_authorized(request.actor, Action::ViewReport(&request.subject))
            .await?;

        let team = self.registry.get_team(team_id).await?;
        if team.tracker_id != request.tracker_id {
            return Err(AppError::validation_field(
                format!("Team {} does not belong to tracker {}", team_id, request.tracker_id),
                "subject",
            ));
        }

        self.cached_or_generate(request, || async move {
            let members = self.registry.team_members(team_id).await?;
            let (sprint_ids, issues) = self.fetch_range(request.tracker_id, range).await?;
            let identities = self.registry.identity_map(request.tracker_id).await?;

            let agg = aggregate(
                &issues,
                &identities,
                RowScope::Members {
                    users: &members,
                    include_unmapped: true,
                },
                Utc::now().date_naive(),
            );

            Ok(Report {
                key: request.key(),
                title: team.name.clone(),
                period: Some(range),
                sprint_ids,
                rows: agg.rows,
                totals: agg.totals,
                unmapped_identities: agg.unmapped_identities,
                comparison: None,
                generated_at: Utc::now(),
            })
        })
        .await
    }

    /// Serve from the store unless a refresh is forced, else generate once
    /// per key and persist before returning.
    async fn cached_or_generate<F, Fut>(
        &self,
        request: &ReportRequest,
        build: F,
    ) -> Result<Report, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Report, AppError>>,
    {
        let key = request.key();
        let use_stored = !request.force_refresh;

        if use_stored {
            if let Some(report) = self.store.get(&key).await? {
                log::debug!("Serving stored report {}", key.subject);
                return Ok(report);
            }
        }

        self.flights
            .run(key.clone(), move || async move {
                // A previous leader may have stored it after our first look
                if use_stored {
                    if let Some(report) = self.store.get(&key).await? {
                        return Ok(report);
                    }
                }

                let epoch = self.attribution_epoch(key.tracker_id);
                let started = Instant::now();
                let report = build().await?;
                self.store.put(&report).await?;

                if self.attribution_epoch(key.tracker_id) != epoch {
                    log::info!(
                        "Registry changed while generating {}; not keeping it stored",
                        key.subject
                    );
                    self.store.invalidate(&key).await?;
                }

                log::info!(
                    "Generated {} report {} for tracker {} ({} rows) in {:?}",
                    key.kind,
                    key.subject,
                    key.tracker_id,
                    report.rows.len(),
                    started.elapsed()
                );
                Ok(report)
            })
            .await
    }

    async fn build_sprint_report(
        &self,
        request: &ReportRequest,
        sprint_id: &str,
        scoped_user: Option<LocalUser>,
    ) -> Result<Report, AppError> {
        let sprints = self.tracker.list_sprints(request.tracker_id).await?;
        let sprint = sprints
            .iter()
            .find(|s| s.id == sprint_id)
            .ok_or_else(|| {
                AppError::validation_field(format!("Unknown sprint '{}'", sprint_id), "subject")
            })?;

        let issues = self.tracker.list_issues(request.tracker_id, sprint_id).await?;
        let identities = self.registry.identity_map(request.tracker_id).await?;

        let scoped = scoped_user.map(|u| vec![u]);
        let scope = match &scoped {
            Some(users) => RowScope::Members {
                users,
                include_unmapped: false,
            },
            None => RowScope::Everyone,
        };
        let agg = aggregate(&issues, &identities, scope, Utc::now().date_naive());

        let comparison = self
            .compare_with_previous(request, &sprints, sprint, &agg.totals)
            .await?;

        Ok(Report {
            key: request.key(),
            title: sprint.name.clone(),
            period: Some(TimeRange::new(sprint.start_date, sprint.end_date)),
            sprint_ids: vec![sprint.id.clone()],
            rows: agg.rows,
            totals: agg.totals,
            unmapped_identities: agg.unmapped_identities,
            comparison,
            generated_at: Utc::now(),
        })
    }

    /// Compare with the stored report of the sprint that started last before
    /// this one, for the same scope. No stored report means no comparison.
    async fn compare_with_previous(
        &self,
        request: &ReportRequest,
        sprints: &[Sprint],
        current: &Sprint,
        totals: &Metrics,
    ) -> Result<Option<TotalsComparison>, AppError> {
        let Some(previous) = sprints
            .iter()
            .filter(|s| s.start_date < current.start_date)
            .max_by_key(|s| s.start_date)
        else {
            return Ok(None);
        };

        let for_user = match &request.subject {
            ReportSubject::Sprint { for_user, .. } => *for_user,
            ReportSubject::Team { .. } => None,
        };
        let previous_request = ReportRequest {
            subject: ReportSubject::Sprint {
                sprint_id: previous.id.clone(),
                for_user,
            },
            ..request.clone()
        };

        let Some(stored) = self.store.get(&previous_request.key()).await? else {
            return Ok(None);
        };
        let prev = &stored.totals;

        Ok(Some(TotalsComparison {
            previous_sprint_id: previous.id.clone(),
            points: MetricComparison::new(totals.points, prev.points),
            completed_points: MetricComparison::new(totals.completed_points, prev.completed_points),
            completed: MetricComparison::new(totals.completed as f64, prev.completed as f64),
            deadlines_missed: MetricComparison::new(
                totals.deadlines_missed as f64,
                prev.deadlines_missed as f64,
            ),
            avg_cycle_time_hours: totals
                .avg_cycle_time_hours
                .zip(prev.avg_cycle_time_hours)
                .map(|(cur, prev)| MetricComparison::new(cur, prev)),
        }))
    }

    /// Issues of every sprint overlapping `range`, each issue once.
    async fn fetch_range(
        &self,
        tracker_id: i64,
        range: TimeRange,
    ) -> Result<(Vec<String>, Vec<TrackerIssue>), AppError> {
        let mut sprints: Vec<Sprint> = self
            .tracker
            .list_sprints(tracker_id)
            .await?
            .into_iter()
            .filter(|s| s.overlaps(range.start, range.end))
            .collect();
        sprints.sort_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id)));

        let batches = try_join_all(
            sprints
                .iter()
                .map(|s| self.tracker.list_issues(tracker_id, &s.id)),
        )
        .await?;

        let mut seen = HashSet::new();
        let issues = batches
            .into_iter()
            .flatten()
            .filter(|issue| seen.insert(issue.id.clone()))
            .collect();

        Ok((sprints.into_iter().map(|s| s.id).collect(), issues))
    }

    /// Drop the stored report a request would be served from. Returns
    /// whether one existed.
    pub async fn invalidate(&self, request: &ReportRequest) -> Result<bool, AppError> {
        self.registry
            .ensure_authorized(request.actor, Action::InvalidateReport(&request.subject))
            .await?;
        self.store.invalidate(&request.key()).await
    }

    pub async fn list_sprints(&self, actor: i64, tracker_id: i64) -> Result<Vec<Sprint>, AppError> {
        self.registry.ensure_authorized(actor, Action::BrowseTrackers).await?;
        self.registry.get_tracker(tracker_id).await?;

        let mut sprints = self.tracker.list_sprints(tracker_id).await?;
        sprints.sort_by(|a, b| b.start_date.cmp(&a.start_date));

        let batches = try_join_all(
            sprints
                .iter()
                .map(|s| self.tracker.list_issues(tracker_id, &s.id)),
        )
        .await?;
        for (sprint, issues) in sprints.iter_mut().zip(batches) {
            sprint.issue_ids = issues.into_iter().map(|i| i.id).collect();
        }
        Ok(sprints)
    }

    /// Tracker users that no local account is linked to.
    pub async fn unmapped_users(
        &self,
        actor: i64,
        tracker_id: i64,
    ) -> Result<Vec<TrackerIdentity>, AppError> {
        self.registry
            .ensure_authorized(actor, Action::ListTrackerUsers)
            .await?;
        self.registry.get_tracker(tracker_id).await?;

        let identities = self.registry.identity_map(tracker_id).await?;
        let users = self.tracker.list_users(tracker_id).await?;

        Ok(users
            .into_iter()
            .filter(|u| identities.get(&u.external_id).is_none())
            .collect())
    }

    // ── Registry changes that affect stored reports ──────────────────────────

    /// Link a tracker identity to a user and drop the tracker's stored
    /// reports. Returns the link and how many reports were dropped.
    pub async fn link_identity(
        &self,
        actor: i64,
        user_id: i64,
        tracker_id: i64,
        external_id: &str,
    ) -> Result<(LinkedIdentity, u64), AppError> {
        self.registry
            .ensure_authorized(actor, Action::ManageRegistry)
            .await?;

        let identity = self
            .registry
            .link_identity(user_id, tracker_id, external_id)
            .await?;
        let dropped = self.attribution_changed(tracker_id).await?;
        Ok((identity, dropped))
    }

    /// Remove one of a user's identity links and drop the tracker's stored
    /// reports. An identity the user does not hold is `NotFound`.
    pub async fn unlink_identity(
        &self,
        actor: i64,
        user_id: i64,
        tracker_id: i64,
        external_id: &str,
    ) -> Result<(LinkedIdentity, u64), AppError> {
        self.registry
            .ensure_authorized(actor, Action::ManageRegistry)
            .await?;

        let user = self.registry.require_user(user_id).await?;
        let identity = LinkedIdentity {
            tracker_id,
            external_id: external_id.trim().to_string(),
        };
        if !user.identities.contains(&identity) {
            return Err(AppError::not_found_with_id("identity", &identity.external_id));
        }

        self.registry
            .unlink_identity(tracker_id, &identity.external_id)
            .await?;
        let dropped = self.attribution_changed(tracker_id).await?;
        Ok((identity, dropped))
    }

    /// Add (`member = true`) or remove a team member, dropping the team's
    /// stored reports for every time range.
    pub async fn set_team_membership(
        &self,
        actor: i64,
        team_id: i64,
        user_id: i64,
        member: bool,
    ) -> Result<Team, AppError> {
        self.registry
            .ensure_authorized(actor, Action::ManageRegistry)
            .await?;

        let team = if member {
            self.registry.add_team_member(team_id, user_id).await?
        } else {
            self.registry.remove_team_member(team_id, user_id).await?
        };

        self.bump_attribution(team.tracker_id);
        let subject = ReportSubject::Team { team_id }.key_string();
        let dropped = self
            .store
            .invalidate_subject(team.tracker_id, ReportKind::Team, &subject)
            .await?;
        log::info!(
            "Team {} membership changed; dropped {} stored reports",
            team_id,
            dropped
        );
        Ok(team)
    }

    /// Bump the tracker's epoch, then drop its stored reports. A generation
    /// that stores after this runs sees the new epoch.
    async fn attribution_changed(&self, tracker_id: i64) -> Result<u64, AppError> {
        self.bump_attribution(tracker_id);
        self.store.invalidate_tracker(tracker_id).await
    }

    fn attribution_epoch(&self, tracker_id: i64) -> u64 {
        let epochs = self.attribution.lock().unwrap_or_else(|e| e.into_inner());
        epochs.get(&tracker_id).copied().unwrap_or(0)
    }

    fn bump_attribution(&self, tracker_id: i64) {
        let mut epochs = self.attribution.lock().unwrap_or_else(|e| e.into_inner());
        *epochs.entry(tracker_id).or_insert(0) += 1;
    }
}

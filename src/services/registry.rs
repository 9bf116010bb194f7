//! User/role registry.
//!
//! Maps `(tracker id, external id)` identities to local users, stores roles,
//! tracker connections and teams, and decides who may see which report.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::{
    LinkedIdentity, LocalUser, NewLocalUser, NewTracker, ReportSubject, Role, Team,
    TrackerInstance,
};
use std::collections::HashMap;

/// Outcome of resolving a tracker identity.
#[derive(Debug, Clone)]
pub enum Resolution {
    Mapped(LocalUser),
    /// No local account is linked. A data-quality signal, not an error.
    Unmapped,
}

/// Something an actor wants to do.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    ViewReport(&'a ReportSubject),
    InvalidateReport(&'a ReportSubject),
    /// See connected trackers and their sprints.
    BrowseTrackers,
    /// See which reports are stored for a tracker.
    ListReports,
    /// Browse tracker users, including unmapped ones.
    ListTrackerUsers,
    /// Create trackers, users, teams; change roles and mappings.
    ManageRegistry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Access policy, given what the registry knows about the actor.
///
/// `member_of_team` only matters for team report subjects.
pub fn policy(actor: &LocalUser, action: &Action<'_>, member_of_team: bool) -> Decision {
    if actor.role == Role::Admin {
        return Decision::Allow;
    }

    match action {
        Action::ViewReport(subject) | Action::InvalidateReport(subject) => match subject {
            ReportSubject::Sprint {
                for_user: Some(user_id),
                ..
            } if *user_id == actor.id => Decision::Allow,
            ReportSubject::Sprint { .. } if actor.role >= Role::Lead => Decision::Allow,
            ReportSubject::Sprint { .. } => {
                Decision::Deny("members may only request reports scoped to themselves".to_string())
            }
            ReportSubject::Team { .. } if actor.role >= Role::Lead && member_of_team => {
                Decision::Allow
            }
            ReportSubject::Team { team_id } if actor.role >= Role::Lead => {
                Decision::Deny(format!("lead is not a member of team {}", team_id))
            }
            ReportSubject::Team { .. } => {
                Decision::Deny("team reports require the lead or admin role".to_string())
            }
        },
        Action::BrowseTrackers => Decision::Allow,
        Action::ListTrackerUsers | Action::ListReports if actor.role >= Role::Lead => {
            Decision::Allow
        }
        Action::ListTrackerUsers | Action::ListReports => {
            Decision::Deny("this listing requires the lead role".to_string())
        }
        Action::ManageRegistry => Decision::Deny("registry changes require the admin role".to_string()),
    }
}

/// Snapshot of all identity mappings for one tracker.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    by_external_id: HashMap<String, LocalUser>,
}

impl IdentityMap {
    pub fn get(&self, external_id: &str) -> Option<&LocalUser> {
        self.by_external_id.get(external_id)
    }

    pub fn len(&self) -> usize {
        self.by_external_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_external_id.is_empty()
    }
}

impl FromIterator<(String, LocalUser)> for IdentityMap {
    fn from_iter<I: IntoIterator<Item = (String, LocalUser)>>(iter: I) -> Self {
        Self {
            by_external_id: iter.into_iter().collect(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    external_id: String,
    #[sqlx(flatten)]
    user: LocalUser,
}

/// Registry backed by the local SQLite database.
#[derive(Debug, Clone)]
pub struct Registry {
    pool: DbPool,
}

impl Registry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // ── Trackers ─────────────────────────────────────────────────────────────

    pub async fn create_tracker(&self, new: &NewTracker) -> Result<TrackerInstance, AppError> {
        if new.name.trim().is_empty() {
            return Err(AppError::validation_field("Tracker name is required", "name"));
        }
        if !new.base_url.starts_with("http://") && !new.base_url.starts_with("https://") {
            return Err(AppError::validation_field("Base URL must be http(s)", "baseUrl"));
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO trackers (name, tracker_type, base_url, org_id, token)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(new.name.trim())
        .bind(&new.tracker_type)
        .bind(TrackerInstance::normalize_url(&new.base_url))
        .bind(&new.org_id)
        .bind(&new.token)
        .fetch_one(&self.pool)
        .await?;

        self.get_tracker(id).await
    }

    pub async fn get_tracker(&self, tracker_id: i64) -> Result<TrackerInstance, AppError> {
        sqlx::query_as(
            "SELECT id, name, tracker_type, base_url, org_id, token, is_active, created_at FROM trackers WHERE id = ?",
        )
        .bind(tracker_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("tracker", tracker_id))
    }

    pub async fn list_trackers(&self, active_only: bool) -> Result<Vec<TrackerInstance>, AppError> {
        let trackers = sqlx::query_as(
            r#"
            SELECT id, name, tracker_type, base_url, org_id, token, is_active, created_at
            FROM trackers
            WHERE is_active = 1 OR ? = 0
            ORDER BY id
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(trackers)
    }

    // ── Users and roles ──────────────────────────────────────────────────────

    pub async fn create_user(&self, new: &NewLocalUser) -> Result<LocalUser, AppError> {
        if new.display_name.trim().is_empty() {
            return Err(AppError::validation_field(
                "Display name is required",
                "displayName",
            ));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO local_users (display_name, email, role) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(new.display_name.trim())
        .bind(new.email.as_deref().map(str::to_lowercase))
        .bind(new.role.to_string())
        .fetch_one(&self.pool)
        .await?;

        self.require_user(id).await
    }

    /// Look up a user with all linked identities.
    pub async fn get_user(&self, user_id: i64) -> Result<Option<LocalUser>, AppError> {
        let user: Option<LocalUser> = sqlx::query_as(
            "SELECT id, display_name, email, role FROM local_users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut user) = user else {
            return Ok(None);
        };

        user.identities = sqlx::query_as(
            "SELECT tracker_id, external_id FROM tracker_identities WHERE user_id = ? ORDER BY tracker_id, external_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(user))
    }

    pub async fn require_user(&self, user_id: i64) -> Result<LocalUser, AppError> {
        self.get_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found_with_id("user", user_id))
    }

    pub async fn set_role(&self, user_id: i64, role: Role) -> Result<LocalUser, AppError> {
        let result = sqlx::query("UPDATE local_users SET role = ? WHERE id = ?")
            .bind(role.to_string())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found_with_id("user", user_id));
        }

        log::info!("User {} is now {}", user_id, role);
        self.require_user(user_id).await
    }

    /// Create an admin with the given name unless an admin already exists.
    pub async fn ensure_admin(&self, display_name: &str) -> Result<LocalUser, AppError> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM local_users WHERE role = 'admin' ORDER BY id LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        if let Some((id,)) = existing {
            return self.require_user(id).await;
        }

        log::info!("Bootstrapping admin user '{}'", display_name);
        self.create_user(&NewLocalUser {
            display_name: display_name.to_string(),
            email: None,
            role: Role::Admin,
        })
        .await
    }

    // ── Identity mapping ─────────────────────────────────────────────────────

    /// Link a tracker identity to a user. Relinking moves the identity.
    ///
    /// Stored reports are left alone; `ReportEngine::link_identity` also
    /// drops the ones this change makes stale.
    pub async fn link_identity(
        &self,
        user_id: i64,
        tracker_id: i64,
        external_id: &str,
    ) -> Result<LinkedIdentity, AppError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(AppError::validation_field(
                "External id is required",
                "externalId",
            ));
        }

        self.require_user(user_id).await?;
        self.get_tracker(tracker_id).await?;

        sqlx::query(
            r#"
            INSERT INTO tracker_identities (tracker_id, external_id, user_id)
            VALUES (?, ?, ?)
            ON CONFLICT (tracker_id, external_id) DO UPDATE SET user_id = excluded.user_id
            "#,
        )
        .bind(tracker_id)
        .bind(external_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(LinkedIdentity {
            tracker_id,
            external_id: external_id.to_string(),
        })
    }

    /// Remove a mapping. Unlinking an unknown identity is not an error.
    /// See `ReportEngine::unlink_identity` for the variant that drops stored
    /// reports.
    pub async fn unlink_identity(&self, tracker_id: i64, external_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM tracker_identities WHERE tracker_id = ? AND external_id = ?")
            .bind(tracker_id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn resolve(&self, tracker_id: i64, external_id: &str) -> Result<Resolution, AppError> {
        let row: Option<IdentityRow> = sqlx::query_as(
            r#"
            SELECT ti.external_id, u.id, u.display_name, u.email, u.role
            FROM tracker_identities ti
            JOIN local_users u ON u.id = ti.user_id
            WHERE ti.tracker_id = ? AND ti.external_id = ?
            "#,
        )
        .bind(tracker_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Resolution::Mapped(row.user),
            None => Resolution::Unmapped,
        })
    }

    /// Load every mapping for a tracker in one query.
    pub async fn identity_map(&self, tracker_id: i64) -> Result<IdentityMap, AppError> {
        let rows: Vec<IdentityRow> = sqlx::query_as(
            r#"
            SELECT ti.external_id, u.id, u.display_name, u.email, u.role
            FROM tracker_identities ti
            JOIN local_users u ON u.id = ti.user_id
            WHERE ti.tracker_id = ?
            "#,
        )
        .bind(tracker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.external_id, r.user)).collect())
    }

    // ── Teams ────────────────────────────────────────────────────────────────

    pub async fn create_team(&self, tracker_id: i64, name: &str) -> Result<Team, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation_field("Team name is required", "name"));
        }
        self.get_tracker(tracker_id).await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO teams (tracker_id, name) VALUES (?, ?) RETURNING id",
        )
        .bind(tracker_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::validation_field(
                format!("Team '{}' already exists on tracker {}", name, tracker_id),
                "name",
            ),
            _ => AppError::from(e),
        })?;

        self.get_team(id).await
    }

    pub async fn get_team(&self, team_id: i64) -> Result<Team, AppError> {
        let mut team: Team = sqlx::query_as("SELECT id, tracker_id, name FROM teams WHERE id = ?")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found_with_id("team", team_id))?;

        team.member_ids = sqlx::query_scalar(
            "SELECT user_id FROM team_members WHERE team_id = ? ORDER BY user_id",
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(team)
    }

    pub async fn add_team_member(&self, team_id: i64, user_id: i64) -> Result<Team, AppError> {
        self.get_team(team_id).await?;
        self.require_user(user_id).await?;

        sqlx::query("INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?, ?)")
            .bind(team_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        self.get_team(team_id).await
    }

    pub async fn remove_team_member(&self, team_id: i64, user_id: i64) -> Result<Team, AppError> {
        sqlx::query("DELETE FROM team_members WHERE team_id = ? AND user_id = ?")
            .bind(team_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        self.get_team(team_id).await
    }

    pub async fn team_members(&self, team_id: i64) -> Result<Vec<LocalUser>, AppError> {
        let members = sqlx::query_as(
            r#"
            SELECT u.id, u.display_name, u.email, u.role
            FROM team_members tm
            JOIN local_users u ON u.id = tm.user_id
            WHERE tm.team_id = ?
            ORDER BY u.display_name, u.id
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }

    async fn is_team_member(&self, team_id: i64, user_id: i64) -> Result<bool, AppError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM team_members WHERE team_id = ? AND user_id = ?")
                .bind(team_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    // ── Authorization ────────────────────────────────────────────────────────

    /// Decide whether `actor_id` may perform `action`. Unknown actors are denied.
    pub async fn authorize(&self, actor_id: i64, action: Action<'_>) -> Result<Decision, AppError> {
        let Some(actor) = self.get_user(actor_id).await? else {
            return Ok(Decision::Deny(format!("unknown actor {}", actor_id)));
        };

        let member_of_team = match action {
            Action::ViewReport(ReportSubject::Team { team_id })
            | Action::InvalidateReport(ReportSubject::Team { team_id }) => {
                self.is_team_member(*team_id, actor.id).await?
            }
            _ => false,
        };

        Ok(policy(&actor, &action, member_of_team))
    }

    /// Like [`Registry::authorize`], but a denial becomes [`AppError::Forbidden`].
    pub async fn ensure_authorized(&self, actor_id: i64, action: Action<'_>) -> Result<(), AppError> {
        match self.authorize(actor_id, action).await? {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => {
                log::warn!("Denied actor {}: {}", actor_id, reason);
                Err(AppError::forbidden(reason))
            }
        }
    }
}

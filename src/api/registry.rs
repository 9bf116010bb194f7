//! Tracker, user and team administration routes.

use super::{Actor, ApiErr, AppState};
use crate::error::AppError;
use crate::models::{
    LinkedIdentity, LocalUser, NewLocalUser, NewTracker, Role, Sprint, Team, TrackerIdentity,
    TrackerInstance,
};
use crate::services::registry::{Action, Registry};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct RoleBody {
    role: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityBody {
    tracker_id: i64,
    external_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewTeamBody {
    tracker_id: i64,
    name: String,
}

/// Identity change result; stored reports of the tracker are dropped since
/// their rows may now be attributed differently.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    identity: LinkedIdentity,
    invalidated_reports: u64,
}

pub fn registry_routes() -> Router<AppState> {
    Router::new()
        .route("/api/trackers", get(list_trackers).post(create_tracker))
        .route("/api/trackers/{id}/sprints", get(list_sprints))
        .route("/api/trackers/{id}/unmapped-users", get(unmapped_users))
        .route("/api/users", post(create_user))
        .route("/api/users/{id}/role", put(set_role))
        .route(
            "/api/users/{id}/identities",
            post(link_identity).delete(unlink_identity),
        )
        .route("/api/teams", post(create_team))
        .route(
            "/api/teams/{id}/members/{user_id}",
            post(add_member).delete(remove_member),
        )
}

async fn require_admin(registry: &Registry, actor: i64) -> Result<(), AppError> {
    registry.ensure_authorized(actor, Action::ManageRegistry).await
}

// ── Trackers ─────────────────────────────────────────────────────────────────

/// GET /api/trackers: connected trackers (tokens omitted).
async fn list_trackers(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
) -> Result<Json<Vec<TrackerInstance>>, ApiErr> {
    let registry = state.engine.registry();
    registry
        .ensure_authorized(actor, Action::BrowseTrackers)
        .await?;
    Ok(Json(registry.list_trackers(false).await?))
}

/// POST /api/trackers: store and connect a tracker.
async fn create_tracker(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Json(body): Json<NewTracker>,
) -> Result<(StatusCode, Json<TrackerInstance>), ApiErr> {
    let tracker = state.engine.add_tracker(actor, &body).await?;
    Ok((StatusCode::CREATED, Json(tracker)))
}

/// GET /api/trackers/:id/sprints: newest first.
async fn list_sprints(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(tracker_id): Path<i64>,
) -> Result<Json<Vec<Sprint>>, ApiErr> {
    Ok(Json(state.engine.list_sprints(actor, tracker_id).await?))
}

/// GET /api/trackers/:id/unmapped-users
async fn unmapped_users(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(tracker_id): Path<i64>,
) -> Result<Json<Vec<TrackerIdentity>>, ApiErr> {
    Ok(Json(state.engine.unmapped_users(actor, tracker_id).await?))
}

// ── Users ────────────────────────────────────────────────────────────────────

/// POST /api/users
async fn create_user(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Json(body): Json<NewLocalUser>,
) -> Result<(StatusCode, Json<LocalUser>), ApiErr> {
    let registry = state.engine.registry();
    require_admin(registry, actor).await?;

    let user = registry.create_user(&body).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// PUT /api/users/:id/role
async fn set_role(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(user_id): Path<i64>,
    Json(body): Json<RoleBody>,
) -> Result<Json<LocalUser>, ApiErr> {
    let registry = state.engine.registry();
    require_admin(registry, actor).await?;

    let role = Role::parse(&body.role).ok_or_else(|| {
        AppError::validation_field(format!("Unknown role '{}'", body.role), "role")
    })?;
    Ok(Json(registry.set_role(user_id, role).await?))
}

/// POST /api/users/:id/identities
async fn link_identity(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(user_id): Path<i64>,
    Json(body): Json<IdentityBody>,
) -> Result<Json<IdentityResponse>, ApiErr> {
    let (identity, invalidated_reports) = state
        .engine
        .link_identity(actor, user_id, body.tracker_id, &body.external_id)
        .await?;

    Ok(Json(IdentityResponse {
        identity,
        invalidated_reports,
    }))
}

/// DELETE /api/users/:id/identities
async fn unlink_identity(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(user_id): Path<i64>,
    Json(body): Json<IdentityBody>,
) -> Result<Json<IdentityResponse>, ApiErr> {
    let (identity, invalidated_reports) = state
        .engine
        .unlink_identity(actor, user_id, body.tracker_id, &body.external_id)
        .await?;

    Ok(Json(IdentityResponse {
        identity,
        invalidated_reports,
    }))
}

// ── Teams ────────────────────────────────────────────────────────────────────

/// POST /api/teams
async fn create_team(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Json(body): Json<NewTeamBody>,
) -> Result<(StatusCode, Json<Team>), ApiErr> {
    let registry = state.engine.registry();
    require_admin(registry, actor).await?;

    let team = registry.create_team(body.tracker_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

/// POST /api/teams/:id/members/:user_id
async fn add_member(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path((team_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<Team>, ApiErr> {
    let team = state
        .engine
        .set_team_membership(actor, team_id, user_id, true)
        .await?;
    Ok(Json(team))
}

/// DELETE /api/teams/:id/members/:user_id
async fn remove_member(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path((team_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<Team>, ApiErr> {
    let team = state
        .engine
        .set_team_membership(actor, team_id, user_id, false)
        .await?;
    Ok(Json(team))
}

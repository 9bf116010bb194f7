//! Report routes.

use super::{Actor, ApiErr, AppState};
use crate::error::AppError;
use crate::models::{Report, ReportKind, ReportRequest, ReportSubject, TimeRange};
use crate::services::registry::Action;
use crate::services::StoredReportInfo;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/reports` and `DELETE /api/reports`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQuery {
    pub tracker_id: i64,
    pub kind: ReportKind,
    /// Sprint id for sprint reports, team id for team reports.
    pub subject: String,
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub force_refresh: bool,
    /// Narrow a sprint report to one local user.
    pub for_user: Option<i64>,
}

impl ReportQuery {
    fn into_request(self, actor: i64) -> Result<ReportRequest, AppError> {
        let subject = match self.kind {
            ReportKind::Sprint => ReportSubject::Sprint {
                sprint_id: self.subject.trim().to_string(),
                for_user: self.for_user,
            },
            ReportKind::Team => {
                if self.for_user.is_some() {
                    return Err(AppError::validation_field(
                        "forUser only applies to sprint reports",
                        "forUser",
                    ));
                }
                let team_id = self.subject.trim().parse::<i64>().map_err(|_| {
                    AppError::validation_field("Team subject must be a team id", "subject")
                })?;
                ReportSubject::Team { team_id }
            }
        };

        Ok(ReportRequest {
            tracker_id: self.tracker_id,
            subject,
            time_range: self.time_range,
            force_refresh: self.force_refresh,
            actor,
        })
    }
}

#[derive(Deserialize)]
struct ListQuery {
    kind: Option<ReportKind>,
}

#[derive(Serialize)]
struct InvalidateResponse {
    invalidated: bool,
}

pub fn report_routes() -> Router<AppState> {
    Router::new()
        .route("/api/reports", post(generate_report).delete(invalidate_report))
        .route("/api/trackers/{id}/reports", get(list_reports))
}

/// POST /api/reports: generate or fetch a stored report.
async fn generate_report(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Json(query): Json<ReportQuery>,
) -> Result<Json<Report>, ApiErr> {
    let request = query.into_request(actor)?;
    let report = state.engine.generate(&request).await?;
    Ok(Json(report))
}

/// DELETE /api/reports: drop one stored report.
async fn invalidate_report(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Json(query): Json<ReportQuery>,
) -> Result<Json<InvalidateResponse>, ApiErr> {
    let request = query.into_request(actor)?;
    let invalidated = state.engine.invalidate(&request).await?;
    Ok(Json(InvalidateResponse { invalidated }))
}

/// GET /api/trackers/:id/reports: stored reports, newest first, optionally by `kind`.
async fn list_reports(
    State(state): State<AppState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(tracker_id): Path<i64>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<StoredReportInfo>>, ApiErr> {
    let registry = state.engine.registry();
    registry.ensure_authorized(actor, Action::ListReports).await?;
    registry.get_tracker(tracker_id).await?;

    let reports = state
        .engine
        .store()
        .list_for_tracker(tracker_id, params.kind)
        .await?;
    Ok(Json(reports))
}

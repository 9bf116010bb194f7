//! Tracker API client.
//!
//! Typed facade over the tracker's REST API (Yandex Tracker flavoured):
//!
//! - `GET /v2/sprints`: sprints visible to the organization
//! - `GET /v2/sprints/{id}/issues`: issues planned into a sprint
//! - `GET /v2/users`: tracker users
//!
//! Lists are paginated with `page`/`perPage` query parameters and
//! `X-Total-Pages`/`X-Next-Page` response headers. Callers always receive
//! the full result set. Each page request is retried with backoff on
//! transient failures; credentials are scoped per registered tracker.

use crate::error::AppError;
use crate::models::{Sprint, TrackerIdentity, TrackerInstance, TrackerIssue};
use crate::services::retry::{AttemptError, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Upper bound on pages fetched for one listing.
pub const MAX_PAGES: u32 = 500;

/// Read access to tracker data, per connected tracker instance.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    /// All sprints of the tracker.
    async fn list_sprints(&self, tracker_id: i64) -> Result<Vec<Sprint>, AppError>;

    /// All issues planned into one sprint.
    async fn list_issues(&self, tracker_id: i64, sprint_id: &str)
        -> Result<Vec<TrackerIssue>, AppError>;

    /// All users known to the tracker.
    async fn list_users(&self, tracker_id: i64) -> Result<Vec<TrackerIdentity>, AppError>;

    /// Make a newly stored tracker reachable. Implementations without
    /// per-tracker state can ignore it.
    fn connect(&self, _tracker: &TrackerInstance) -> Result<(), AppError> {
        Ok(())
    }
}

/// Tracker client configuration.
#[derive(Debug, Clone)]
pub struct TrackerClientConfig {
    /// Per-request timeout. A request exceeding it counts as a transient failure.
    pub timeout: Duration,

    /// Items requested per page.
    pub page_size: u32,

    pub retry: RetryPolicy,
}

impl Default for TrackerClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            page_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Pagination information from response headers.
#[derive(Debug, Clone, Default)]
pub struct PaginationInfo {
    pub page: Option<u32>,
    pub total_pages: Option<u32>,
    pub next_page: Option<u32>,
}

impl PaginationInfo {
    /// Page to request after `current`, if any.
    /// `X-Next-Page` wins over counting, but never past `X-Total-Pages`.
    pub fn next_after(&self, current: u32) -> Option<u32> {
        let next = match (self.next_page, self.total_pages) {
            (Some(next), _) if next > current => next,
            (Some(_), _) => return None,
            (None, Some(total)) if current < total => current + 1,
            (None, _) => return None,
        };
        match self.total_pages {
            Some(total) if next > total => None,
            _ => Some(next),
        }
    }
}

/// One registered tracker connection.
#[derive(Clone)]
struct Connection {
    http: Client,
    base_url: String,
}

/// HTTP tracker client holding one connection per registered tracker.
pub struct TrackerClient {
    config: TrackerClientConfig,
    connections: RwLock<HashMap<i64, Connection>>,
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSprint {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(deserialize_with = "id_string")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiIssue {
    id: String,
    key: String,
    status: ApiStatus,
    assignee: Option<ApiRef>,
    story_points: Option<f64>,
    #[serde(default)]
    sprint: Vec<ApiRef>,
    #[serde(deserialize_with = "timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    resolved_at: Option<DateTime<Utc>>,
    deadline: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    #[serde(alias = "id", deserialize_with = "id_string")]
    uid: String,
    login: Option<String>,
    display: Option<String>,
}

/// Accept ids sent either as numbers or strings.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Num(i64),
        Str(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Num(n) => n.to_string(),
        Id::Str(s) => s,
    })
}

/// Parse RFC 3339 or the tracker's `+0000` offset style.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_timestamp(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s)))
}

fn optional_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s))),
        None => Ok(None),
    }
}

impl From<ApiSprint> for Sprint {
    fn from(s: ApiSprint) -> Self {
        Self {
            id: s.id,
            name: s.name,
            start_date: s.start_date,
            end_date: s.end_date,
            issue_ids: Vec::new(),
        }
    }
}

impl From<ApiIssue> for TrackerIssue {
    fn from(i: ApiIssue) -> Self {
        Self {
            id: i.id,
            key: i.key,
            status: i.status.key,
            assignee: i.assignee.map(|a| a.id),
            story_points: i.story_points,
            sprint_ids: i.sprint.into_iter().map(|s| s.id).collect(),
            created_at: i.created_at,
            resolved_at: i.resolved_at,
            deadline: i.deadline,
        }
    }
}

impl From<ApiUser> for TrackerIdentity {
    fn from(u: ApiUser) -> Self {
        Self {
            external_id: u.uid,
            login: u.login,
            display_name: u.display,
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

impl TrackerClient {
    /// Create a client with no registered trackers.
    pub fn new(config: TrackerClientConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the connection for a tracker instance.
    pub fn register(&self, tracker: &TrackerInstance) -> Result<(), AppError> {
        let token = tracker
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::tracker_auth_for("Tracker has no token configured", tracker.id))?;

        let mut headers = header::HeaderMap::new();
        let auth_value = header::HeaderValue::from_str(&format!("OAuth {}", token))
            .map_err(|_| AppError::tracker_auth_for("Invalid token format", tracker.id))?;
        headers.insert(header::AUTHORIZATION, auth_value);

        if let Some(org_id) = tracker.org_id.as_deref() {
            let org_value = header::HeaderValue::from_str(org_id)
                .map_err(|_| AppError::validation_field("Invalid organization id", "orgId"))?;
            headers.insert("X-Org-ID", org_value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(self.config.timeout)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        let connection = Connection {
            http,
            base_url: TrackerInstance::normalize_url(&tracker.base_url),
        };

        self.connections
            .write()
            .map_err(|_| AppError::internal("Tracker connection table poisoned"))?
            .insert(tracker.id, connection);

        log::info!("Registered tracker {} ({})", tracker.id, tracker.name);
        Ok(())
    }

    /// Drop the connection for a tracker instance.
    pub fn unregister(&self, tracker_id: i64) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(&tracker_id);
        }
    }

    pub fn is_registered(&self, tracker_id: i64) -> bool {
        self.connections
            .read()
            .map(|c| c.contains_key(&tracker_id))
            .unwrap_or(false)
    }

    fn connection(&self, tracker_id: i64) -> Result<Connection, AppError> {
        self.connections
            .read()
            .map_err(|_| AppError::internal("Tracker connection table poisoned"))?
            .get(&tracker_id)
            .cloned()
            .ok_or_else(|| AppError::not_found_with_id("tracker", tracker_id))
    }

    /// Parse pagination headers from response.
    fn parse_pagination(response: &Response) -> PaginationInfo {
        let headers = response.headers();

        let get_header = |name: &str| -> Option<u32> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        };

        PaginationInfo {
            page: get_header("x-page"),
            total_pages: get_header("x-total-pages"),
            next_page: get_header("x-next-page"),
        }
    }

    /// Classify a failed response for the retry loop.
    async fn classify_failure(response: Response, tracker_id: i64, endpoint: &str) -> AttemptError {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return AttemptError::Permanent(AppError::tracker_auth_for(
                format!(
                    "Tracker rejected credentials ({}). Please re-authorize the connection.",
                    status.as_u16()
                ),
                tracker_id,
            ));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return AttemptError::Transient {
                message: "Rate limit exceeded".to_string(),
                retry_after,
            };
        }

        if status.is_server_error() {
            return AttemptError::transient(format!("Server error ({})", status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        let body_message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                // Trackers report errors as {"errorMessages": [...]} or {"message": "..."}
                v.get("errorMessages")
                    .and_then(|m| m.as_array())
                    .and_then(|a| a.first())
                    .and_then(|m| m.as_str())
                    .or_else(|| v.get("message").and_then(|m| m.as_str()))
                    .map(String::from)
            });

        let message = match (status, body_message) {
            (StatusCode::NOT_FOUND, _) => "Resource not found".to_string(),
            (_, Some(msg)) => msg,
            _ => format!("Request failed ({}): {}", status.as_u16(), body),
        };

        AttemptError::Permanent(AppError::tracker_api(message, status.as_u16(), endpoint))
    }

    /// Fetch and decode one page. Single attempt, no retry.
    async fn fetch_page<T: DeserializeOwned>(
        &self,
        connection: &Connection,
        tracker_id: i64,
        endpoint: &str,
        page: u32,
    ) -> Result<(Vec<T>, PaginationInfo), AttemptError> {
        let url = format!("{}{}", connection.base_url, endpoint);

        let response = connection
            .http
            .get(&url)
            .query(&[
                ("page", page.to_string()),
                ("perPage", self.config.page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptError::transient("Request timed out")
                } else if e.is_connect() {
                    AttemptError::transient("Failed to connect to tracker")
                } else {
                    AttemptError::transient(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response, tracker_id, endpoint).await);
        }

        let pagination = Self::parse_pagination(&response);
        let data = response.json::<Vec<T>>().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::transient("Timed out reading response")
            } else {
                AttemptError::Permanent(AppError::internal(format!(
                    "Failed to parse response from {}: {}",
                    endpoint, e
                )))
            }
        })?;

        Ok((data, pagination))
    }

    /// Fetch all pages of a paginated endpoint.
    pub async fn get_all_pages<T: DeserializeOwned>(
        &self,
        tracker_id: i64,
        endpoint: &str,
    ) -> Result<Vec<T>, AppError> {
        let connection = self.connection(tracker_id)?;
        let operation = format!("GET {}", endpoint);
        let mut all_data = Vec::new();
        let mut page = 1u32;
        let mut fetched_pages = 0u32;

        loop {
            let (data, pagination) = self
                .config
                .retry
                .run(&operation, |_| {
                    self.fetch_page::<T>(&connection, tracker_id, endpoint, page)
                })
                .await?;

            all_data.extend(data);
            fetched_pages += 1;

            match pagination.next_after(page) {
                Some(_) if fetched_pages >= MAX_PAGES => {
                    return Err(AppError::tracker_api(
                        format!("Pagination did not end after {} pages", MAX_PAGES),
                        502,
                        endpoint,
                    ));
                }
                Some(next) => page = next,
                None => break,
            }
        }

        log::debug!(
            "Fetched {} items from {} ({} pages)",
            all_data.len(),
            endpoint,
            fetched_pages
        );
        Ok(all_data)
    }
}

#[async_trait]
impl TrackerApi for TrackerClient {
    async fn list_sprints(&self, tracker_id: i64) -> Result<Vec<Sprint>, AppError> {
        let sprints: Vec<ApiSprint> = self.get_all_pages(tracker_id, "/v2/sprints").await?;
        Ok(sprints.into_iter().map(Sprint::from).collect())
    }

    async fn list_issues(
        &self,
        tracker_id: i64,
        sprint_id: &str,
    ) -> Result<Vec<TrackerIssue>, AppError> {
        let endpoint = format!("/v2/sprints/{}/issues", urlencoding::encode(sprint_id));
        let issues: Vec<ApiIssue> = self.get_all_pages(tracker_id, &endpoint).await?;
        Ok(issues.into_iter().map(TrackerIssue::from).collect())
    }

    async fn list_users(&self, tracker_id: i64) -> Result<Vec<TrackerIdentity>, AppError> {
        let users: Vec<ApiUser> = self.get_all_pages(tracker_id, "/v2/users").await?;
        Ok(users.into_iter().map(TrackerIdentity::from).collect())
    }

    fn connect(&self, tracker: &TrackerInstance) -> Result<(), AppError> {
        self.register(tracker)
    }
}

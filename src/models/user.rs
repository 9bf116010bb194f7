//! Local user, role and team models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Capability level controlling which reports a user may request.
///
/// Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May only view reports scoped to themselves.
    Member,
    /// May view whole-sprint reports and reports of teams they belong to.
    Lead,
    /// Unrestricted.
    Admin,
}

impl Role {
    /// Strict parse, used for user input.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "member" | "employee" => Some(Self::Member),
            "lead" | "manager" => Some(Self::Lead),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        // Unknown values from storage get the least privilege
        Self::parse(s).unwrap_or(Self::Member)
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Member => write!(f, "member"),
            Self::Lead => write!(f, "lead"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// A tracker identity linked to a local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LinkedIdentity {
    pub tracker_id: i64,
    pub external_id: String,
}

/// A locally known account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    /// Local database ID.
    pub id: i64,

    pub display_name: String,

    pub email: Option<String>,

    #[sqlx(try_from = "String")]
    pub role: Role,

    /// Identities across all connected trackers. Loaded separately.
    #[sqlx(skip)]
    pub identities: Vec<LinkedIdentity>,
}

/// Data required to create a local user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLocalUser {
    pub display_name: String,
    pub email: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Member
}

/// A named group of local users on one tracker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: i64,
    pub tracker_id: i64,
    pub name: String,
    #[sqlx(skip)]
    pub member_ids: Vec<i64>,
}

//! Data models for the application.
//!
//! Registry entities derive `FromRow` for SQLx queries; tracker snapshots and
//! reports are plain serde types.

pub mod issue;
pub mod report;
pub mod tracker;
pub mod user;

// Re-exports for convenient access
pub use issue::{Sprint, TrackerIdentity, TrackerIssue};
pub use report::{
    MetricComparison, MetricRow, Metrics, Report, ReportKey, ReportKind, ReportRequest,
    ReportSubject, RowSubject, TimeRange, TotalsComparison,
};
pub use tracker::{NewTracker, TrackerInstance};
pub use user::{LinkedIdentity, LocalUser, NewLocalUser, Role, Team};

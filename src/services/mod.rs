//! Business logic services.
//!
//! Tracker access, the user/role registry, report generation and the report
//! store. Nothing here depends on the HTTP layer.

pub mod aggregation;
pub mod registry;
pub mod report_engine;
pub mod report_store;
pub mod retry;
pub mod single_flight;
pub mod tracker_client;

pub use registry::{Action, Decision, IdentityMap, Registry, Resolution};
pub use report_engine::ReportEngine;
pub use report_store::{ReportStore, StoredReportInfo};
pub use retry::RetryPolicy;
pub use tracker_client::{TrackerApi, TrackerClient, TrackerClientConfig};

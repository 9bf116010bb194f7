//! Sprint Reports - sprint and team productivity reports over issue tracker data.
//!
//! Fetches sprints, issues and users from a tracker, attributes work to local
//! users through an explicit identity mapping, and persists the generated
//! reports in SQLite. The HTTP API in [`api`] is a thin layer over
//! [`services::ReportEngine`].

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod server;
pub mod services;

use services::{Registry, ReportEngine, ReportStore, TrackerApi};
use std::sync::Arc;

/// Wire the engine over an initialized database and a tracker implementation.
pub fn build_engine(pool: db::pool::DbPool, tracker: Arc<dyn TrackerApi>) -> ReportEngine {
    ReportEngine::new(
        tracker,
        Registry::new(pool.clone()),
        ReportStore::new(pool),
    )
}

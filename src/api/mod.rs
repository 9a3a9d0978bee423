//! HTTP surface
//!
//! Thin axum layer over the grading engine and the record stores. Every
//! request runs on its own task; dropping a request future (client gone)
//! drops the in-flight run, which kills its process group.

mod auth;
mod error;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::languages::LanguageRegistry;
use crate::runner::{RunLimits, Runner};
use crate::storage::{Catalog, ProgressStore, SubmissionStore};

pub use auth::AuthUser;
pub use error::ApiError;

/// Shared state handed to every handler
pub struct AppState {
    pub runner: Arc<dyn Runner>,
    pub registry: &'static LanguageRegistry,
    pub catalog: Catalog,
    pub submissions: SubmissionStore,
    pub progress: ProgressStore,
    /// Base limits, before the per-language adjustment
    pub limits: RunLimits,
}

impl AppState {
    pub fn new(
        runner: Arc<dyn Runner>,
        registry: &'static LanguageRegistry,
        catalog: Catalog,
        limits: RunLimits,
    ) -> Self {
        Self {
            runner,
            registry,
            catalog,
            submissions: SubmissionStore::default(),
            progress: ProgressStore::default(),
            limits,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tests", get(handlers::list_tests))
        .route("/tests/execute", post(handlers::execute_code))
        .route("/tests/{id}", get(handlers::get_test))
        .route("/tests/{id}/testcases", get(handlers::list_test_cases))
        .route("/tests/{id}/submit", post(handlers::submit))
        .route("/tests/{id}/save", post(handlers::save_progress))
        .route("/tests/{id}/saved", get(handlers::saved_progress))
        .route("/submissions", get(handlers::list_submissions))
        .route("/languages", get(handlers::list_languages))
        .with_state(state)
}

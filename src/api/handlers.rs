use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::auth::AuthUser;
use super::error::ApiError;
use super::AppState;
use crate::judger::{self, CaseResult};
use crate::playground::{self, PlaygroundResult};
use crate::storage::{CodeProgress, Submission, SubmissionStatus, Test, TestCase, TestId};

const DEFAULT_LANGUAGE: &str = "python";

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submission_id: i64,
    pub score: u8,
    pub status: SubmissionStatus,
    pub results: Vec<CaseResult>,
}

fn parse_body(payload: Result<Json<CodeRequest>, JsonRejection>) -> Result<CodeRequest, ApiError> {
    payload
        .map(|Json(request)| request)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn find_test(state: &AppState, id: TestId) -> Result<&Test, ApiError> {
    state.catalog.get(id).ok_or(ApiError::NotFound("Test"))
}

pub async fn list_tests(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
) -> Json<Vec<Test>> {
    Json(state.catalog.list().cloned().collect())
}

pub async fn get_test(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(id): Path<TestId>,
) -> Result<Json<Test>, ApiError> {
    find_test(&state, id).cloned().map(Json)
}

pub async fn list_test_cases(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(id): Path<TestId>,
) -> Result<Json<Vec<TestCase>>, ApiError> {
    Ok(Json(find_test(&state, id)?.test_cases.clone()))
}

/// Grade the submission against every case of the test and record it
pub async fn submit(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<TestId>,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let request = parse_body(payload)?;
    let test = find_test(&state, id)?;
    let code = request.code.unwrap_or_default();

    info!(
        "User {} submitted {} solution for test {}",
        user, request.language, test.id
    );

    // Dropped unfinished (client gone, system fault) it closes as failed
    let pending = state.submissions.open(user, test, &code, &request.language);

    let outcome = judger::grade(
        state.runner.as_ref(),
        state.registry,
        &code,
        &request.language,
        &test.test_cases,
        &state.limits,
    )
    .await?;

    let submission = pending
        .finish(&outcome)
        .ok_or(ApiError::NotFound("Submission"))?;

    Ok(Json(SubmitResponse {
        submission_id: submission.id,
        score: submission.score,
        status: submission.status,
        results: outcome.case_results,
    }))
}

pub async fn save_progress(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<TestId>,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<Json<CodeProgress>, ApiError> {
    let request = parse_body(payload)?;
    let test = find_test(&state, id)?;
    let code = request.code.unwrap_or_default();

    let progress = state
        .progress
        .upsert(user, test.id, &code, &request.language);
    Ok(Json(progress))
}

/// The caller's saved code, or an empty python template with 404
pub async fn saved_progress(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<TestId>,
) -> Response {
    match state.progress.get(user, id) {
        Some(progress) => Json(progress).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": "", "language": DEFAULT_LANGUAGE })),
        )
            .into_response(),
    }
}

pub async fn execute_code(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<Json<PlaygroundResult>, ApiError> {
    let request = parse_body(payload)?;
    info!("User {} executes {} code", user, request.language);

    let result = playground::execute(
        state.runner.as_ref(),
        state.registry,
        request.code.as_deref(),
        &request.language,
        &state.limits,
    )
    .await?;
    Ok(Json(result))
}

pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Json<Vec<Submission>> {
    Json(state.submissions.for_user(user))
}

/// Public: the language table is not tied to a caller
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.registry.supported())
}

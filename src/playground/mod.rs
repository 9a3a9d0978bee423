//! Ad-hoc code execution
//!
//! Runs a snippet once with empty stdin and returns whatever it printed.
//! No comparison, no scoring, nothing is recorded.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::languages::LanguageRegistry;
use crate::runner::{RunLimits, RunStatus, Runner};

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("No code provided")]
    MissingCode,

    #[error("Language not supported yet: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution timeout ({} seconds)", whole_seconds(.time_ms))]
    Timeout { time_ms: u32 },

    #[error("Failed to launch program: {0}")]
    LaunchFailed(String),

    #[error(transparent)]
    System(#[from] anyhow::Error),
}

fn whole_seconds(time_ms: &u32) -> u32 {
    time_ms.div_ceil(1000)
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaygroundResult {
    pub output: String,
    pub error: String,
}

/// Execute `code` once. A non-zero exit is not an error: its stderr comes
/// back in `error`.
pub async fn execute(
    runner: &dyn Runner,
    registry: &LanguageRegistry,
    code: Option<&str>,
    language: &str,
    limits: &RunLimits,
) -> Result<PlaygroundResult, ExecuteError> {
    let code = match code {
        Some(code) if !code.trim().is_empty() => code,
        _ => return Err(ExecuteError::MissingCode),
    };

    let recipe = registry
        .resolve(language)
        .map_err(|_| ExecuteError::UnsupportedLanguage(language.to_string()))?;
    let limits = limits.for_language(recipe);

    let outcome = runner.run(recipe, code, "", &limits).await?;

    match outcome.status {
        RunStatus::TimedOut => {
            info!("Playground execution timed out after {}ms", limits.time_ms);
            Err(ExecuteError::Timeout {
                time_ms: limits.time_ms,
            })
        }
        RunStatus::LaunchFailed(reason) => {
            error!("Playground launch failed: {}", reason);
            Err(ExecuteError::LaunchFailed(reason))
        }
        status => {
            info!(
                "Playground {} run finished: {:?} in {}ms",
                recipe.name, status, outcome.time_ms
            );
            Ok(PlaygroundResult {
                output: outcome.stdout,
                error: outcome.stderr,
            })
        }
    }
}

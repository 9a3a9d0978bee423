//! Grading orchestrator
//!
//! Runs one submission against every test case of a test, in catalog order,
//! derives the observed output of each run, and aggregates the score.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checker::compare_output;
use crate::core::{score, Verdict};
use crate::languages::LanguageRegistry;
use crate::runner::{RunLimits, RunOutcome, RunStatus, Runner};
use crate::storage::TestCase;

/// Observed output recorded for every case when the language has no recipe
pub const UNSUPPORTED_LANGUAGE_OUTPUT: &str = "Language not supported yet";

#[derive(Debug, Error)]
pub enum GradeError {
    /// The program could not be started (missing interpreter, sandbox setup)
    #[error("Failed to launch program: {0}")]
    LaunchFailed(String),

    #[error(transparent)]
    System(#[from] anyhow::Error),
}

/// Result of one test case
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub passed: bool,
}

/// Aggregated result of grading a submission
#[derive(Debug, Clone, Serialize)]
pub struct GradingOutcome {
    pub score: u8,
    pub verdict: Verdict,
    pub case_results: Vec<CaseResult>,
}

impl GradingOutcome {
    pub fn from_cases(case_results: Vec<CaseResult>) -> Self {
        let passed = case_results.iter().filter(|r| r.passed).count();
        let score = score(passed, case_results.len());
        Self {
            score,
            verdict: Verdict::from_score(score),
            case_results,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.case_results.iter().filter(|r| r.passed).count()
    }
}

/// Grade `code` against `test_cases`.
///
/// Cases run sequentially, each in a fresh process. An unsupported language
/// fails every case without launching anything. A launch failure aborts the
/// whole grading, since it says nothing about the submission itself.
pub async fn grade(
    runner: &dyn Runner,
    registry: &LanguageRegistry,
    code: &str,
    language: &str,
    test_cases: &[TestCase],
    limits: &RunLimits,
) -> Result<GradingOutcome, GradeError> {
    let recipe = match registry.resolve(language) {
        Ok(recipe) => recipe,
        Err(e) => {
            warn!("{}", e);
            let case_results = test_cases
                .iter()
                .map(|tc| CaseResult {
                    input: tc.input_data.clone(),
                    expected_output: tc.expected_output.clone(),
                    actual_output: UNSUPPORTED_LANGUAGE_OUTPUT.to_string(),
                    passed: false,
                })
                .collect();
            return Ok(GradingOutcome::from_cases(case_results));
        }
    };

    let limits = limits.for_language(recipe);
    let mut case_results = Vec::with_capacity(test_cases.len());

    for tc in test_cases {
        let outcome = runner.run(recipe, code, &tc.input_data, &limits).await?;

        if let RunStatus::LaunchFailed(reason) = outcome.status {
            return Err(GradeError::LaunchFailed(reason));
        }

        let actual_output = observed_output(&outcome);
        let passed = compare_output(&actual_output, &tc.expected_output);
        debug!(
            "Test case {}: {:?} in {}ms, passed={}",
            tc.id, outcome.status, outcome.time_ms, passed
        );

        case_results.push(CaseResult {
            input: tc.input_data.clone(),
            expected_output: tc.expected_output.clone(),
            actual_output,
            passed,
        });
    }

    let outcome = GradingOutcome::from_cases(case_results);
    info!(
        "Graded {} submission: {}/{} passed, score {} ({})",
        recipe.name,
        outcome.passed_count(),
        outcome.case_results.len(),
        outcome.score,
        outcome.verdict
    );
    Ok(outcome)
}

/// What the program is considered to have printed.
///
/// Anything on stderr counts as an error, even when the exit code is 0.
pub fn observed_output(outcome: &RunOutcome) -> String {
    match &outcome.status {
        RunStatus::TimedOut => "Error: Execution timeout".to_string(),
        _ if !outcome.stderr.is_empty() => format!("Error: {}", outcome.stderr),
        RunStatus::Signaled(sig) => format!("Error: Process killed by signal {}", sig),
        _ => outcome.stdout.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const TABLE: &str = r#"
[python]
source_file = "main.py"
run_command = "python3 main.py"
aliases = ["py"]
"#;

    /// Answers each stdin with a scripted outcome and records the order of calls
    struct ScriptedRunner {
        script: HashMap<String, RunOutcome>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<(&str, RunOutcome)>) -> Self {
            Self {
                script: script
                    .into_iter()
                    .map(|(stdin, outcome)| (stdin.to_string(), outcome))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        async fn run(
            &self,
            _language: &LanguageConfig,
            _source: &str,
            stdin: &str,
            _limits: &RunLimits,
        ) -> anyhow::Result<RunOutcome> {
            self.calls.lock().unwrap().push(stdin.to_string());
            self.script
                .get(stdin)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unscripted input {:?}", stdin))
        }
    }

    fn outcome(stdout: &str, stderr: &str, status: RunStatus) -> RunOutcome {
        RunOutcome {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
            time_ms: 1,
        }
    }

    fn case(id: i64, input: &str, expected: &str) -> TestCase {
        TestCase {
            id,
            input_data: input.to_string(),
            expected_output: expected.to_string(),
            is_sample: false,
        }
    }

    fn registry() -> LanguageRegistry {
        LanguageRegistry::from_toml(TABLE).unwrap()
    }

    #[tokio::test]
    async fn test_all_cases_pass() {
        let runner = ScriptedRunner::new(vec![
            ("[2, 7, 11, 15]\n9", outcome("[0, 1]\n", "", RunStatus::Success)),
            ("[3, 2, 4]\n6", outcome("[1, 2]\n", "", RunStatus::Success)),
        ]);
        let cases = vec![
            case(1, "[2, 7, 11, 15]\n9", "[0, 1]"),
            case(2, "[3, 2, 4]\n6", "[1, 2]"),
        ];

        let result = grade(&runner, &registry(), "code", "python", &cases, &RunLimits::default())
            .await
            .unwrap();

        assert_eq!(result.score, 100);
        assert_eq!(result.verdict, Verdict::Passed);
        assert!(result.case_results.iter().all(|r| r.passed));
        assert_eq!(result.case_results[0].actual_output, "[0, 1]\n");
    }

    #[tokio::test]
    async fn test_results_keep_case_order() {
        let runner = ScriptedRunner::new(vec![
            ("a", outcome("1", "", RunStatus::Success)),
            ("b", outcome("2", "", RunStatus::Success)),
            ("c", outcome("3", "", RunStatus::Success)),
        ]);
        let cases = vec![case(3, "c", "3"), case(1, "a", "x"), case(2, "b", "2")];

        let result = grade(&runner, &registry(), "code", "py", &cases, &RunLimits::default())
            .await
            .unwrap();

        assert_eq!(runner.calls(), vec!["c", "a", "b"]);
        let inputs: Vec<_> = result.case_results.iter().map(|r| r.input.as_str()).collect();
        assert_eq!(inputs, vec!["c", "a", "b"]);
        assert_eq!(
            result.case_results.iter().map(|r| r.passed).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(result.score, 67);
        assert_eq!(result.verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn test_seven_of_ten_passes() {
        let mut script = Vec::new();
        let mut cases = Vec::new();
        let inputs: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        for (i, input) in inputs.iter().enumerate() {
            let stdout = if i < 7 { "ok" } else { "wrong" };
            script.push((input.as_str(), outcome(stdout, "", RunStatus::Success)));
            cases.push(case(i as i64, input, "ok"));
        }
        let runner = ScriptedRunner::new(script);

        let result = grade(&runner, &registry(), "code", "python", &cases, &RunLimits::default())
            .await
            .unwrap();

        assert_eq!(result.score, 70);
        assert_eq!(result.verdict, Verdict::Passed);
    }

    #[tokio::test]
    async fn test_no_cases_scores_zero() {
        let runner = ScriptedRunner::new(Vec::new());

        let result = grade(&runner, &registry(), "code", "python", &[], &RunLimits::default())
            .await
            .unwrap();

        assert_eq!(result.score, 0);
        assert_eq!(result.verdict, Verdict::Failed);
        assert!(result.case_results.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_error_reported_as_error_text() {
        let runner = ScriptedRunner::new(vec![(
            "5",
            outcome(
                "",
                "Traceback (most recent call last):\nNameError: name 'x' is not defined\n",
                RunStatus::NonZeroExit(1),
            ),
        )]);
        let cases = vec![case(1, "5", "5")];

        let result = grade(&runner, &registry(), "code", "python", &cases, &RunLimits::default())
            .await
            .unwrap();

        let actual = &result.case_results[0].actual_output;
        assert!(actual.starts_with("Error: Traceback"));
        assert!(!result.case_results[0].passed);
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn test_stderr_fails_even_with_correct_stdout() {
        let runner = ScriptedRunner::new(vec![(
            "5",
            outcome("5\n", "DeprecationWarning: old api\n", RunStatus::Success),
        )]);
        let cases = vec![case(1, "5", "5")];

        let result = grade(&runner, &registry(), "code", "python", &cases, &RunLimits::default())
            .await
            .unwrap();

        assert!(!result.case_results[0].passed);
        assert!(result.case_results[0].actual_output.starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_timeout_fails_case_and_grading_continues() {
        let runner = ScriptedRunner::new(vec![
            ("slow", outcome("", "", RunStatus::TimedOut)),
            ("fast", outcome("done", "", RunStatus::Success)),
        ]);
        let cases = vec![case(1, "slow", "done"), case(2, "fast", "done")];

        let result = grade(&runner, &registry(), "code", "python", &cases, &RunLimits::default())
            .await
            .unwrap();

        assert_eq!(result.case_results[0].actual_output, "Error: Execution timeout");
        assert!(!result.case_results[0].passed);
        assert!(result.case_results[1].passed);
        assert_eq!(result.score, 50);
    }

    #[tokio::test]
    async fn test_unsupported_language_fails_every_case() {
        let runner = ScriptedRunner::new(Vec::new());
        let cases = vec![case(1, "a", "1"), case(2, "b", "2")];

        let result = grade(&runner, &registry(), "code", "cobol", &cases, &RunLimits::default())
            .await
            .unwrap();

        assert!(runner.calls().is_empty());
        assert_eq!(result.score, 0);
        for r in &result.case_results {
            assert_eq!(r.actual_output, UNSUPPORTED_LANGUAGE_OUTPUT);
            assert!(!r.passed);
        }
    }

    #[tokio::test]
    async fn test_launch_failure_aborts_grading() {
        let runner = ScriptedRunner::new(vec![
            ("a", RunOutcome::launch_failed("python3: not found")),
            ("b", outcome("2", "", RunStatus::Success)),
        ]);
        let cases = vec![case(1, "a", "1"), case(2, "b", "2")];

        let err = grade(&runner, &registry(), "code", "python", &cases, &RunLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GradeError::LaunchFailed(_)));
        assert_eq!(runner.calls(), vec!["a"]);
    }

    #[test]
    fn test_observed_output_precedence() {
        assert_eq!(
            observed_output(&outcome("partial", "boom", RunStatus::TimedOut)),
            "Error: Execution timeout"
        );
        assert_eq!(
            observed_output(&outcome("", "", RunStatus::Signaled(9))),
            "Error: Process killed by signal 9"
        );
        assert_eq!(
            observed_output(&outcome("out", "", RunStatus::NonZeroExit(2))),
            "out"
        );
    }
}

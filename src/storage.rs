//! Record stores backing the HTTP surface
//!
//! - `Catalog`: read-only coding tests and their test cases, loaded at start
//! - `SubmissionStore`: append-only log of graded attempts
//! - `ProgressStore`: one saved snapshot per (user, test), upserted atomically

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::Verdict;
use crate::judger::GradingOutcome;

pub type UserId = i64;
pub type TestId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

/// One (input, expected output) pair of a test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub input_data: String,
    pub expected_output: String,
    /// Whether to show as sample
    #[serde(default)]
    pub is_sample: bool,
}

/// A coding problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub name: String,
    pub description: String,
    /// Time limit in minutes
    pub time_limit: u32,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tests: Vec<Test>,
}

/// Read-only test catalog
#[derive(Debug, Default)]
pub struct Catalog {
    tests: BTreeMap<TestId, Test>,
}

impl Catalog {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = toml::from_str(content).context("Invalid catalog")?;

        let mut tests = BTreeMap::new();
        for test in file.tests {
            let id = test.id;
            if tests.insert(id, test).is_some() {
                anyhow::bail!("Duplicate test id {} in catalog", id);
            }
        }
        Ok(Self { tests })
    }

    /// Load the catalog from `path`, or the sample catalog embedded at build time
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let catalog = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read catalog {}", path))?;
                Self::from_toml(&content)?
            }
            None => Self::from_toml(include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/files/catalog.toml"
            )))?,
        };
        info!("Loaded {} tests into the catalog", catalog.tests.len());
        Ok(catalog)
    }

    pub fn get(&self, id: TestId) -> Option<&Test> {
        self.tests.get(&id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Test> {
        self.tests.values()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Passed,
    Failed,
}

impl From<Verdict> for SubmissionStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Passed => SubmissionStatus::Passed,
            Verdict::Failed => SubmissionStatus::Failed,
        }
    }
}

/// A graded attempt
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: i64,
    pub user: UserId,
    pub test: TestId,
    pub test_name: String,
    pub code: String,
    pub language: String,
    pub status: SubmissionStatus,
    pub score: u8,
    pub submitted_at: DateTime<Utc>,
}

/// Append-only submission log
#[derive(Debug, Default)]
pub struct SubmissionStore {
    submissions: DashMap<i64, Submission>,
    next_id: AtomicI64,
}

impl SubmissionStore {
    /// Record a new attempt as pending.
    ///
    /// The returned guard must be finished with the grading outcome; if it
    /// is dropped first (client gone, grading fault) the attempt is closed
    /// as failed instead of staying pending forever.
    pub fn open(
        &self,
        user: UserId,
        test: &Test,
        code: &str,
        language: &str,
    ) -> PendingSubmission<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.submissions.insert(
            id,
            Submission {
                id,
                user,
                test: test.id,
                test_name: test.name.clone(),
                code: code.to_string(),
                language: language.to_string(),
                status: SubmissionStatus::Pending,
                score: 0,
                submitted_at: Utc::now(),
            },
        );
        PendingSubmission {
            store: self,
            id,
            settled: false,
        }
    }

    fn settle(&self, id: i64, status: SubmissionStatus, score: u8) -> Option<Submission> {
        let mut submission = self.submissions.get_mut(&id)?;
        submission.status = status;
        submission.score = score;
        Some(submission.clone())
    }

    /// Submissions of one user, newest first
    pub fn for_user(&self, user: UserId) -> Vec<Submission> {
        let mut submissions: Vec<Submission> = self
            .submissions
            .iter()
            .filter(|entry| entry.user == user)
            .map(|entry| entry.value().clone())
            .collect();
        submissions.sort_by(|a, b| b.id.cmp(&a.id));
        submissions
    }
}

/// An attempt that is still being graded
#[derive(Debug)]
pub struct PendingSubmission<'a> {
    store: &'a SubmissionStore,
    id: i64,
    settled: bool,
}

impl PendingSubmission<'_> {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Store the grading result
    pub fn finish(mut self, outcome: &GradingOutcome) -> Option<Submission> {
        self.settled = true;
        self.store.settle(self.id, outcome.verdict.into(), outcome.score)
    }
}

impl Drop for PendingSubmission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Submission {} abandoned before grading finished", self.id);
            self.store.settle(self.id, SubmissionStatus::Failed, 0);
        }
    }
}

/// Saved, ungraded work in progress
#[derive(Debug, Clone, Serialize)]
pub struct CodeProgress {
    pub id: i64,
    pub user: UserId,
    pub test: TestId,
    pub code: String,
    pub language: String,
    pub updated_at: DateTime<Utc>,
}

/// Progress snapshots keyed by (user, test)
#[derive(Debug, Default)]
pub struct ProgressStore {
    records: DashMap<(UserId, TestId), CodeProgress>,
    next_id: AtomicI64,
}

impl ProgressStore {
    /// Insert or update the snapshot for (user, test).
    ///
    /// The map shard stays locked for the whole read-modify-write, so
    /// concurrent saves from the same user never produce two records.
    pub fn upsert(&self, user: UserId, test: TestId, code: &str, language: &str) -> CodeProgress {
        match self.records.entry((user, test)) {
            Entry::Occupied(mut entry) => {
                let progress = entry.get_mut();
                progress.code = code.to_string();
                progress.language = language.to_string();
                progress.updated_at = Utc::now();
                progress.clone()
            }
            Entry::Vacant(entry) => {
                let progress = CodeProgress {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                    user,
                    test,
                    code: code.to_string(),
                    language: language.to_string(),
                    updated_at: Utc::now(),
                };
                entry.insert(progress.clone());
                progress
            }
        }
    }

    pub fn get(&self, user: UserId, test: TestId) -> Option<CodeProgress> {
        self.records.get(&(user, test)).map(|entry| entry.value().clone())
    }

    #[cfg(test)]
    pub fn count_for(&self, user: UserId, test: TestId) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.user == user && entry.test == test)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_embedded_catalog_loads() {
        let catalog = Catalog::load(None).unwrap();

        let two_sum = catalog.get(1).unwrap();
        assert_eq!(two_sum.name, "Two Sum");
        assert_eq!(two_sum.difficulty, Difficulty::Easy);
        assert_eq!(two_sum.test_cases[0].input_data, "[2, 7, 11, 15]\n9");
        assert_eq!(two_sum.test_cases[0].expected_output, "[0, 1]");
        assert!(two_sum.test_cases[0].is_sample);
        assert_eq!(catalog.list().count(), 5);
    }

    #[test]
    fn test_duplicate_test_id_rejected() {
        let content = r#"
[[tests]]
id = 1
name = "a"
description = ""
time_limit = 1

[[tests]]
id = 1
name = "b"
description = ""
time_limit = 1
"#;
        assert!(Catalog::from_toml(content).is_err());
    }

    #[test]
    fn test_progress_upsert_keeps_one_record() {
        let store = ProgressStore::default();

        let first = store.upsert(1, 10, "initial code", "python");
        let second = store.upsert(1, 10, "updated code", "javascript");

        assert_eq!(first.id, second.id);
        assert_eq!(store.count_for(1, 10), 1);
        let saved = store.get(1, 10).unwrap();
        assert_eq!(saved.code, "updated code");
        assert_eq!(saved.language, "javascript");
        assert!(store.get(2, 10).is_none());
    }

    #[test]
    fn test_concurrent_upserts_single_record() {
        let store = Arc::new(ProgressStore::default());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.upsert(7, 3, &format!("code {}", i), "python");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.count_for(7, 3), 1);
        assert_eq!(store.get(7, 3).unwrap().id, 1);
    }

    #[test]
    fn test_submissions_are_appended_per_user() {
        let catalog = Catalog::load(None).unwrap();
        let test = catalog.get(1).unwrap();
        let store = SubmissionStore::default();
        let outcome = GradingOutcome::from_cases(Vec::new());

        let first = store.open(1, test, "a", "python");
        let second = store.open(1, test, "b", "python");
        let other = store.open(2, test, "c", "python");

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(store.for_user(1)[1].status, SubmissionStatus::Pending);

        let finished = first.finish(&outcome).unwrap();
        assert_eq!(finished.status, SubmissionStatus::Failed);
        second.finish(&outcome).unwrap();
        other.finish(&outcome).unwrap();

        let mine = store.for_user(1);
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].code, "b");
        assert_eq!(store.for_user(2).len(), 1);
    }

    #[test]
    fn test_abandoned_submission_is_closed() {
        let catalog = Catalog::load(None).unwrap();
        let test = catalog.get(1).unwrap();
        let store = SubmissionStore::default();

        let pending = store.open(1, test, "print(1)", "python");
        assert_eq!(store.for_user(1)[0].status, SubmissionStatus::Pending);
        drop(pending);

        let closed = &store.for_user(1)[0];
        assert_eq!(closed.status, SubmissionStatus::Failed);
        assert_eq!(closed.score, 0);
    }
}

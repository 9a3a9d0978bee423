use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum score for a submission to pass
pub const PASSING_SCORE: u8 = 70;

/// Overall verdict of a graded submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
}

impl Verdict {
    pub fn from_score(score: u8) -> Self {
        if score >= PASSING_SCORE {
            Verdict::Passed
        } else {
            Verdict::Failed
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Percentage of passed cases, rounded half up. Zero when there are no cases.
pub fn score(passed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let passed = passed.min(total);
    ((200 * passed + total) / (2 * total)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_rounding() {
        assert_eq!(score(0, 0), 0);
        assert_eq!(score(0, 3), 0);
        assert_eq!(score(1, 3), 33);
        assert_eq!(score(2, 3), 67);
        assert_eq!(score(1, 8), 13);
        assert_eq!(score(7, 10), 70);
        assert_eq!(score(5, 5), 100);
    }

    #[test]
    fn test_score_bounds() {
        for total in 0..50 {
            for passed in 0..=total {
                assert!(score(passed, total) <= 100);
            }
        }
    }

    #[test]
    fn test_verdict_threshold() {
        assert_eq!(Verdict::from_score(69), Verdict::Failed);
        assert_eq!(Verdict::from_score(70), Verdict::Passed);
        assert_eq!(Verdict::from_score(0), Verdict::Failed);
        assert_eq!(Verdict::Passed.to_string(), "passed");
    }
}

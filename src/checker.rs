//! Output comparison for graded test cases
//!
//! A case passes when the program output equals the expected output after
//! stripping leading and trailing whitespace from both sides. There is no
//! numeric tolerance and no case folding.

/// Compare program output with expected output
pub fn compare_output(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_newline_ignored() {
        assert!(compare_output("[0, 1]\n", "[0, 1]"));
        assert!(compare_output("  42\r\n", "42"));
        assert!(compare_output("", "\n\n"));
    }

    #[test]
    fn test_inner_whitespace_is_significant() {
        assert!(!compare_output("[0,1]", "[0, 1]"));
        assert!(!compare_output("a\n\nb", "a\nb"));
    }

    #[test]
    fn test_case_sensitive() {
        assert!(!compare_output("true", "True"));
    }

    #[test]
    fn test_symmetric() {
        let pairs = [("5\n", "5"), ("x", " x "), ("1 2", "1  2")];
        for (a, b) in pairs {
            assert_eq!(compare_output(a, b), compare_output(b, a));
            assert_eq!(compare_output(a, b), compare_output(a, b));
        }
    }
}

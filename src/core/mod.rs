pub mod verdict;

pub use verdict::{score, Verdict};

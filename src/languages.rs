//! Language configuration for sandboxed execution
//!
//! Maps a language tag (and its aliases) to the recipe the runner uses:
//! the file name the submitted source is written to and the command that
//! executes it. The table is loaded once at startup and never mutated.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::runner::CommandSpec;

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Canonical language name (table key)
    pub name: String,
    /// Name of the source file (e.g., "main.py")
    pub source_file: String,
    /// Run command template
    pub run_command: Vec<String>,
    /// Extra environment variables (key=value)
    pub env: Vec<String>,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    pub memory_limit: Option<(u32, u32)>,
}

impl LanguageConfig {
    /// Calculate actual time limit based on base time limit in milliseconds
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_seconds.saturating_mul(1000)),
            None => base_time_ms,
        }
    }

    /// Calculate actual memory limit based on base memory limit in MB
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> u32 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb,
        }
    }

    /// Command that runs the source file from inside the scratch directory
    pub fn command(&self) -> CommandSpec {
        CommandSpec::from_vec(&self.run_command).with_env(self.env.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LanguageError {
    #[error("Language not supported yet: {0}")]
    Unsupported(String),
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    run_command: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    time_limit: Vec<u32>,
    #[serde(default)]
    memory_limit: Vec<u32>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Immutable lookup table from language tag to recipe
#[derive(Debug, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageConfig>,
}

impl LanguageRegistry {
    /// Build a registry from the TOML language table
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> =
            toml::from_str(content).context("Invalid language table")?;

        let mut languages = HashMap::new();

        for (name, raw) in raw_configs {
            let parse_limit = |raw_limit: &[u32], kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                match raw_limit {
                    [] => Ok(None),
                    [multiplier, bonus] => Ok(Some((*multiplier, *bonus))),
                    _ => anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit),
                }
            };

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }

            let config = LanguageConfig {
                name: name.to_lowercase(),
                source_file: raw.source_file,
                run_command,
                env: raw.env,
                time_limit: parse_limit(&raw.time_limit, "time")?,
                memory_limit: parse_limit(&raw.memory_limit, "memory")?,
            };

            for alias in &raw.aliases {
                languages.insert(alias.to_lowercase(), config.clone());
            }
            languages.insert(name.to_lowercase(), config);
        }

        Ok(Self { languages })
    }

    /// Resolve a language tag to its recipe
    pub fn resolve(&self, language: &str) -> Result<&LanguageConfig, LanguageError> {
        self.languages
            .get(&language.trim().to_lowercase())
            .ok_or_else(|| LanguageError::Unsupported(language.to_string()))
    }

    /// All accepted language tags, aliases included
    pub fn supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.languages.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Global language configurations
static LANGUAGES: OnceLock<LanguageRegistry> = OnceLock::new();

/// Initialize language configurations.
///
/// Reads the table from `path` when given, otherwise uses the table
/// embedded at build time.
pub fn init_languages(path: Option<&str>) -> anyhow::Result<&'static LanguageRegistry> {
    let registry = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read language table {}", path))?;
            LanguageRegistry::from_toml(&content)?
        }
        None => LanguageRegistry::from_toml(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))?,
    };

    LANGUAGES
        .set(registry)
        .map_err(|_| anyhow::anyhow!("Languages already initialized"))?;

    LANGUAGES
        .get()
        .ok_or_else(|| anyhow::anyhow!("Languages not initialized"))
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
[python]
source_file = "main.py"
run_command = "python3 main.py"
env = ["PYTHONDONTWRITEBYTECODE=1"]
time_limit = [2, 1]
aliases = ["py", "python3"]

[shell]
source_file = "main.sh"
run_command = "sh main.sh"
"#;

    #[test]
    fn test_resolve_by_name_and_alias() {
        let registry = LanguageRegistry::from_toml(TABLE).unwrap();

        let python = registry.resolve("python").unwrap();
        assert_eq!(python.source_file, "main.py");
        assert_eq!(python.run_command, vec!["python3", "main.py"]);
        assert_eq!(registry.resolve("PY").unwrap().name, "python");
        assert_eq!(registry.resolve("python3").unwrap().name, "python");
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let registry = LanguageRegistry::from_toml(TABLE).unwrap();

        assert_eq!(
            registry.resolve("cobol").unwrap_err(),
            LanguageError::Unsupported("cobol".to_string())
        );
    }

    #[test]
    fn test_limit_adjustment() {
        let registry = LanguageRegistry::from_toml(TABLE).unwrap();

        assert_eq!(registry.resolve("python").unwrap().calculate_time_limit(1000), 3000);
        assert_eq!(registry.resolve("shell").unwrap().calculate_time_limit(1000), 1000);
        assert_eq!(registry.resolve("shell").unwrap().calculate_memory_limit(256), 256);
    }

    #[test]
    fn test_malformed_limit_rejected() {
        let table = r#"
[c]
source_file = "main.c"
run_command = "./main"
time_limit = [1, 2, 3]
"#;
        assert!(LanguageRegistry::from_toml(table).is_err());
    }

    #[test]
    fn test_embedded_table_has_python() {
        let registry = LanguageRegistry::from_toml(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))
        .unwrap();

        assert!(registry.supported().contains(&"python".to_string()));
        let command = registry.resolve("python").unwrap().command();
        assert_eq!(command.program, "python3");
        assert!(command.env.iter().any(|e| e.starts_with("PYTHONDONTWRITEBYTECODE")));
    }
}

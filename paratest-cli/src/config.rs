//! Configuration loading from paratest.toml
//!
//! paratest configuration can be specified in a `paratest.toml` file in the
//! project root. The configuration is automatically discovered by walking up
//! from the current directory. Environment variables override the file, and
//! command-line flags override both.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override for the worker cap
pub const WORKERS_ENV: &str = "PARATEST_WORKERS";

/// Environment override for the timing key prefix
pub const TIMINGS_PREFIX_ENV: &str = "PARATEST_TIMINGS_PREFIX";

/// Config file name searched for during discovery
pub const CONFIG_FILE: &str = "paratest.toml";

/// paratest configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParatestConfig {
    /// Runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Timing store configuration
    #[serde(default)]
    pub timings: TimingsConfig,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Run name; timing history is kept per run name
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of worker processes (defaults from the core count)
    #[serde(default)]
    pub workers: Option<usize>,
    /// Show a progress bar on an interactive terminal
    #[serde(default = "default_progress")]
    pub progress: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: None,
            progress: default_progress(),
        }
    }
}

fn default_name() -> String {
    "default".to_string()
}
fn default_progress() -> bool {
    true
}

/// Timing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingsConfig {
    /// JSON file holding suite duration history
    #[serde(default = "default_timings_path")]
    pub path: PathBuf,
    /// Key prefix, shared by every run that should see the same history
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            path: default_timings_path(),
            prefix: default_prefix(),
        }
    }
}

fn default_timings_path() -> PathBuf {
    PathBuf::from("target/paratest/timings.json")
}
fn default_prefix() -> String {
    "default".to_string()
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format: "human" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
        }
    }
}

fn default_format() -> String {
    "human".to_string()
}

impl ParatestConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let dir = std::env::current_dir().ok()?;
        Self::discover_from(dir)
    }

    /// Walk up from `dir` looking for `paratest.toml`
    pub fn discover_from(mut dir: PathBuf) -> Option<Self> {
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!(path = %config_path.display(), error = %e, "ignoring unreadable config");
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Apply `PARATEST_WORKERS` and `PARATEST_TIMINGS_PREFIX` from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(WORKERS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.runner.workers = Some(n),
                _ => tracing::warn!(value = %value, "ignoring invalid {}", WORKERS_ENV),
            }
        }
        if let Some(prefix) = lookup(TIMINGS_PREFIX_ENV) {
            if !prefix.is_empty() {
                self.timings.prefix = prefix;
            }
        }
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# paratest Configuration

[runner]
# Run name; timing history is kept per run name
name = "default"
# Maximum worker processes (uncomment to override the core-count default)
# workers = 4
# Show a progress bar on an interactive terminal
progress = true

[timings]
# JSON file holding recent suite durations
path = "target/paratest/timings.json"
# Key prefix shared by runs that should see the same history
prefix = "default"

[output]
# Default output format: human, json
format = "human"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ParatestConfig::default();
        assert_eq!(config.runner.name, "default");
        assert_eq!(config.runner.workers, None);
        assert!(config.runner.progress);
        assert_eq!(config.timings.prefix, "default");
        assert_eq!(config.output.format, "human");
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [runner]
            name = "nightly"
            workers = 6

            [timings]
            prefix = "ci"
        "#;

        let config: ParatestConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runner.name, "nightly");
        assert_eq!(config.runner.workers, Some(6));
        assert_eq!(config.timings.prefix, "ci");
        // Defaults should still apply
        assert_eq!(config.output.format, "human");
        assert_eq!(config.timings.path, PathBuf::from("target/paratest/timings.json"));
    }

    #[test]
    fn test_default_toml_parses() {
        let config: ParatestConfig = toml::from_str(&ParatestConfig::default_toml()).unwrap();
        assert_eq!(config.runner.name, "default");
        assert!(config.runner.progress);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: ParatestConfig = toml::from_str("[runner]\nworkers = 2\n").unwrap();
        let env: HashMap<&str, &str> =
            HashMap::from([(WORKERS_ENV, "7"), (TIMINGS_PREFIX_ENV, "branch-a")]);
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.runner.workers, Some(7));
        assert_eq!(config.timings.prefix, "branch-a");
    }

    #[test]
    fn test_invalid_env_is_ignored() {
        let mut config = ParatestConfig::default();
        config.apply_env_from(|key| (key == WORKERS_ENV).then(|| "zero".to_string()));
        assert_eq!(config.runner.workers, None);

        config.apply_env_from(|key| (key == WORKERS_ENV).then(|| "0".to_string()));
        assert_eq!(config.runner.workers, None);
    }

    #[test]
    fn test_discover_walks_up() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE),
            "[runner]\nname = \"found\"\n",
        )
        .unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = ParatestConfig::discover_from(nested).unwrap();
        assert_eq!(config.runner.name, "found");
    }
}

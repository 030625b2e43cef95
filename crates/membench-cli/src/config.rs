//! Configuration loading from TOML files.
//!
//! Lookup order:
//! 1. `$MEMBENCH_CONFIG` environment variable
//! 2. `~/.config/membench/config.toml`
//! 3. Built-in defaults (everything is optional)
//!
//! `MEM0_BASE_URL`, `OPENAI_BASE_URL` and `MODEL` override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use membench_core::BackoffPolicy;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub memory: MemoryConfig,
    pub oracle: OracleConfig,
    pub retry: RetryConfig,
    pub run: RunDefaults,
}

/// Memory service endpoint.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Messages per add request.
    pub add_batch_size: usize,
}

/// Answering and judging LLM endpoint.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    /// Judge model. Defaults to `model` when unset.
    pub judge_model: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

/// Defaults for `membench run`, overridable by flags.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub workers: usize,
    pub checkpoint_every: usize,
    pub output_dir: String,
    pub technique: String,
    /// Highest n-gram order for BLEU (1 = BLEU-1).
    pub bleu_max_n: usize,
}

// --- Defaults ---

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7000".into(),
            timeout_secs: 300,
            add_batch_size: 2,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            model: "gpt-4o-mini".into(),
            judge_model: None,
            max_tokens: 256,
            timeout_secs: 120,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            workers: 4,
            checkpoint_every: 10,
            output_dir: "results".into(),
            technique: "mem0".into(),
            bleu_max_n: 1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

impl OracleConfig {
    pub fn judge_model(&self) -> &str {
        self.judge_model.as_deref().unwrap_or(&self.model)
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

impl Config {
    /// Apply environment overrides given as `(name, value)` pairs.
    pub fn apply_env<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let value = value.into();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "MEM0_BASE_URL" => self.memory.base_url = value,
                "OPENAI_BASE_URL" => self.oracle.base_url = value,
                "MODEL" => self.oracle.model = value,
                _ => {}
            }
        }
    }
}

/// Load config from disk, then apply environment overrides.
pub fn load_config() -> Result<Config> {
    let mut config = Config::default();
    if let Some(p) = config_path() {
        if p.exists() {
            let content =
                std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
            config = toml::from_str(&content).with_context(|| format!("parsing {}", p.display()))?;
        }
    }
    config.apply_env(std::env::vars());
    Ok(config)
}

/// Resolve the config file path.
fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MEMBENCH_CONFIG") {
        return Some(PathBuf::from(p));
    }
    directories::BaseDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(".config")
            .join("membench")
            .join("config.toml")
    })
}

/// Show the active config path (for `membench config`).
pub fn show_config_path() -> String {
    match config_path() {
        Some(p) if p.exists() => format!("{} (loaded)", p.display()),
        Some(p) => format!("{} (not found, using defaults)", p.display()),
        None => "no config path resolved (using defaults)".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.memory.add_batch_size, 2);
        assert_eq!(config.run.workers, 4);
        assert_eq!(config.run.checkpoint_every, 10);
        assert_eq!(config.oracle.judge_model(), "gpt-4o-mini");
        assert_eq!(config.retry.policy().max_attempts, 3);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[run]
workers = 8
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.run.workers, 8);
        // Other fields should be defaults
        assert_eq!(config.run.technique, "mem0");
        assert_eq!(config.memory.base_url, "http://127.0.0.1:7000");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[memory]
base_url = "http://mem0.internal:8000"
timeout_secs = 60
add_batch_size = 4

[oracle]
base_url = "http://localhost:11434/v1"
api_key_env = "LOCAL_KEY"
model = "llama3"
judge_model = "gpt-4o"
max_tokens = 128
timeout_secs = 30

[retry]
max_attempts = 5
base_delay_ms = 200
max_delay_ms = 5000
multiplier = 3.0
jitter = false

[run]
workers = 2
checkpoint_every = 25
output_dir = "/tmp/runs"
technique = "mem0-graph"
bleu_max_n = 4
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.memory.add_batch_size, 4);
        assert_eq!(config.oracle.judge_model(), "gpt-4o");
        assert_eq!(config.run.bleu_max_n, 4);

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert!(!policy.jitter);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env([
            ("MEM0_BASE_URL", "http://10.0.0.5:7000"),
            ("MODEL", "gpt-4.1-mini"),
            ("OPENAI_BASE_URL", ""),
            ("UNRELATED", "x"),
        ]);
        assert_eq!(config.memory.base_url, "http://10.0.0.5:7000");
        assert_eq!(config.oracle.model, "gpt-4.1-mini");
        assert_eq!(config.oracle.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let bad = "[run]\nworkers = \"many\"\n";
        assert!(toml::from_str::<Config>(bad).is_err());
    }
}

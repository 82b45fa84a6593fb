use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::normalize::url_host;

const APP_DIR: &str = "security-digest";
const CONFIG_FILE: &str = "digest.toml";
/// Ten years; longer windows are clamped.
pub const MAX_WINDOW_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

/// Settings every pipeline stage reads. Passed in explicitly, never global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub window_days: i64,
    pub similarity_threshold: f64,
    pub notable_score_threshold: f64,
    /// Maximum number of groups in the digest, unlimited when unset
    pub max_items: Option<usize>,
    pub trusted_sources: Vec<String>,
    pub interest_keywords: Vec<String>,
    pub feeds: Vec<FeedConfig>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            window_days: 3,
            similarity_threshold: 0.75,
            notable_score_threshold: 3.0,
            max_items: None,
            trusted_sources: Vec::new(),
            interest_keywords: Vec::new(),
            feeds: Vec::new(),
        }
    }
}

impl DigestConfig {
    pub fn is_trusted(&self, source: &str) -> bool {
        self.trusted_sources
            .iter()
            .any(|t| t.eq_ignore_ascii_case(source.trim()))
    }

    /// Hosts of the configured feeds, without `www.`.
    pub fn feed_hosts(&self) -> Vec<String> {
        self.feeds.iter().filter_map(|f| url_host(&f.url)).collect()
    }

    /// Replaces out-of-range values with defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            warn!(
                value = self.similarity_threshold,
                "similarity_threshold out of range, using default"
            );
            self.similarity_threshold = defaults.similarity_threshold;
        }
        if self.window_days < 1 {
            warn!(value = self.window_days, "window_days must be positive, using default");
            self.window_days = defaults.window_days;
        } else if self.window_days > MAX_WINDOW_DAYS {
            warn!(
                value = self.window_days,
                max = MAX_WINDOW_DAYS,
                "window_days too large, clamping"
            );
            self.window_days = MAX_WINDOW_DAYS;
        }
        if !self.notable_score_threshold.is_finite() {
            self.notable_score_threshold = defaults.notable_score_threshold;
        }
        self.interest_keywords.retain(|k| !k.trim().is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmEndpoint {
    pub api_base: String,
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub primary: LlmEndpoint,
    pub fallback: Option<LlmEndpoint>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub filename_template: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            filename_template: "digest_{date}.md".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub output: OutputConfig,
    pub llm: Option<LlmConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        // API keys live in the environment; .env files are a convenience
        Self::try_load_dotenv();

        let content = fs::read_to_string(path).with_context(|| {
            format!(
                "Config file not found: {}\n\n\
                Create it with at least one feed, e.g.:\n  \
                [[digest.feeds]]\n  \
                name = \"BleepingComputer\"\n  \
                url = \"https://www.bleepingcomputer.com/feed/\"",
                path.display()
            )
        })?;

        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.digest = config.digest.sanitized();

        info!(
            path = %path.display(),
            feeds = config.digest.feeds.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    fn try_load_dotenv() {
        // 1. Current directory (for development)
        if dotenvy::dotenv().is_ok() {
            return;
        }

        // 2. ~/.config/security-digest/.env
        if let Some(config_dir) = dirs::config_dir() {
            let env_path = config_dir.join(APP_DIR).join(".env");
            if env_path.exists() && dotenvy::from_path(&env_path).is_ok() {
                return;
            }
        }

        // 3. ~/.env
        if let Some(home_dir) = dirs::home_dir() {
            let home_path = home_dir.join(".env");
            if home_path.exists() {
                let _ = dotenvy::from_path(&home_path);
            }
        }
    }
}

/// `./digest.toml` when present, else the per-user config location.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
        .unwrap_or(local)
}

/// Reads a plain feed list: one `url[,lang[,name]]` per line, `#` starts a comment.
pub fn load_feeds_file(path: &Path) -> Result<Vec<FeedConfig>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read feeds file {}", path.display()))?;
    Ok(parse_feeds_list(&content))
}

pub fn parse_feeds_list(content: &str) -> Vec<FeedConfig> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let mut parts = line.splitn(3, ',').map(str::trim);
            let url = parts.next().unwrap_or_default().to_string();
            let lang = parts
                .next()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(default_lang);
            let name = parts
                .next()
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .or_else(|| url_host(&url))
                .unwrap_or_else(|| url.clone());
            FeedConfig { name, url, lang }
        })
        .collect()
}

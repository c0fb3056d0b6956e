use crate::cache::{DEFAULT_REFRESH_INTERVAL, DEFAULT_TTL};
use crate::extract::ExtractorConfig;
use crate::models::SubscriptionEntry;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_PORT: u16 = 3456;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Deadline for one aggregation cycle, e.g. "10s"
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
}

fn default_timeout() -> String {
    "10s".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_cache_ttl() -> String {
    format!("{}s", DEFAULT_TTL.as_secs())
}

fn default_refresh_interval() -> String {
    format!("{}s", DEFAULT_REFRESH_INTERVAL.as_secs())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            api_port: default_api_port(),
            cache_ttl: default_cache_ttl(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Settings {
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.timeout).context("invalid settings.timeout")
    }

    pub fn cache_ttl(&self) -> Result<Duration> {
        parse_duration(&self.cache_ttl).context("invalid settings.cache_ttl")
    }

    pub fn refresh_interval(&self) -> Result<Duration> {
        parse_duration(&self.refresh_interval).context("invalid settings.refresh_interval")
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sub-mon")
            .join("config.toml")
    }

    /// Loads `path` (or the default location). A missing file yields the
    /// defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Structural checks that need no provider knowledge
    pub fn validate(&self) -> Result<()> {
        self.settings.timeout()?;
        self.settings.cache_ttl()?;
        self.settings.refresh_interval()?;
        for (idx, sub) in self.subscriptions.iter().enumerate() {
            if sub.provider_id.trim().is_empty() {
                bail!("subscriptions[{}] has no provider", idx);
            }
        }
        Ok(())
    }

    /// Subscriptions matching the optional provider id and name filters
    pub fn filter_subscriptions(
        &self,
        provider: Option<&str>,
        name: Option<&str>,
    ) -> Vec<SubscriptionEntry> {
        self.subscriptions
            .iter()
            .filter(|s| provider.is_none_or(|p| s.provider_id == p))
            .filter(|s| name.is_none_or(|n| s.display_name == n))
            .cloned()
            .collect()
    }

    fn expand_env(&mut self) {
        for sub in &mut self.subscriptions {
            sub.auth.key = expand_env_vars(&sub.auth.key);
            for value in sub.auth.extra.values_mut() {
                *value = expand_env_vars(value);
            }
        }
    }
}

/// Replaces `$VAR` and `${VAR}` with environment values; unset variables
/// expand to nothing.
pub fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&lookup(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, next)) if next.is_ascii_alphanumeric() || *next == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Parses durations like "500ms", "90s", "5m", "1h". A bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| anyhow!("invalid duration {:?}", input))?;

    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => bail!("unknown duration unit {:?} in {:?}", other, input),
    };
    if duration.is_zero() {
        bail!("duration must be positive: {:?}", input);
    }
    Ok(duration)
}

// src/config/sources.rs
//! Per-source limits and the global spend ceiling.
//!
//! Resolution order: baked-in defaults, then the optional TOML file, then
//! environment variables. Read once at startup; later changes go through
//! `RateLimiterService::update_config`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const AI_EXTRACTOR: &str = "ai-extractor";
pub const CRAWL_SERVICE: &str = "crawl-service";
pub const HEADLESS_BROWSER: &str = "headless-browser";
pub const CATALOG_API: &str = "catalog-api";

pub const DEFAULT_CONFIG_PATH: &str = "config/sources.toml";
pub const ENV_CONFIG_PATH: &str = "EXTRACT_CONFIG_PATH";
pub const ENV_MAX_DAILY_COST: &str = "MAX_DAILY_COST";

const DEFAULT_MAX_DAILY_COST: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub max_concurrent: u32,
    pub timeout_ms: u64,
    /// Total attempts allowed per request, including the first one.
    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
    /// Estimated spend per dispatched request, in USD.
    pub cost_per_request: f64,
    pub enabled: bool,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn defaults_for(name: &str) -> Self {
        match name {
            AI_EXTRACTOR => Self {
                max_requests_per_minute: 15,
                max_requests_per_hour: 900,
                max_concurrent: 3,
                timeout_ms: 30_000,
                max_retries: 3,
                circuit_breaker_threshold: 5,
                cost_per_request: 0.000_35,
                enabled: true,
            },
            CRAWL_SERVICE => Self {
                max_requests_per_minute: 10,
                max_requests_per_hour: 300,
                max_concurrent: 2,
                timeout_ms: 45_000,
                max_retries: 2,
                circuit_breaker_threshold: 3,
                cost_per_request: 0.001,
                enabled: true,
            },
            HEADLESS_BROWSER => Self {
                max_requests_per_minute: 6,
                max_requests_per_hour: 120,
                max_concurrent: 1,
                timeout_ms: 60_000,
                max_retries: 2,
                circuit_breaker_threshold: 3,
                cost_per_request: 0.002,
                enabled: true,
            },
            CATALOG_API => Self {
                max_requests_per_minute: 60,
                max_requests_per_hour: 2_000,
                max_concurrent: 5,
                timeout_ms: 10_000,
                max_retries: 2,
                circuit_breaker_threshold: 5,
                cost_per_request: 0.0,
                enabled: true,
            },
            _ => Self::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            max_requests_per_hour: 1_000,
            max_concurrent: 2,
            timeout_ms: 30_000,
            max_retries: 3,
            circuit_breaker_threshold: 5,
            cost_per_request: 0.0,
            enabled: true,
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfigPatch {
    pub max_requests_per_minute: Option<u32>,
    pub max_requests_per_hour: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub circuit_breaker_threshold: Option<u32>,
    pub cost_per_request: Option<f64>,
    pub enabled: Option<bool>,
}

impl SourceConfigPatch {
    pub fn apply(&self, cfg: &mut SourceConfig) {
        if let Some(v) = self.max_requests_per_minute {
            cfg.max_requests_per_minute = v;
        }
        if let Some(v) = self.max_requests_per_hour {
            cfg.max_requests_per_hour = v;
        }
        if let Some(v) = self.max_concurrent {
            cfg.max_concurrent = v.max(1);
        }
        if let Some(v) = self.timeout_ms {
            cfg.timeout_ms = v;
        }
        if let Some(v) = self.max_retries {
            cfg.max_retries = v.max(1);
        }
        if let Some(v) = self.circuit_breaker_threshold {
            cfg.circuit_breaker_threshold = v.max(1);
        }
        if let Some(v) = self.cost_per_request {
            if v.is_finite() && v >= 0.0 {
                cfg.cost_per_request = v;
            }
        }
        if let Some(v) = self.enabled {
            cfg.enabled = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sources: BTreeMap<String, SourceConfig>,
    /// Aggregate spend ceiling per UTC day; crossing it trips the emergency stop.
    pub max_daily_cost: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let sources = [AI_EXTRACTOR, CRAWL_SERVICE, HEADLESS_BROWSER, CATALOG_API]
            .into_iter()
            .map(|name| (name.to_string(), SourceConfig::defaults_for(name)))
            .collect();
        Self {
            sources,
            max_daily_cost: DEFAULT_MAX_DAILY_COST,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    max_daily_cost: Option<f64>,
    #[serde(default)]
    sources: BTreeMap<String, SourceConfigPatch>,
}

impl PipelineConfig {
    /// Defaults, then `$EXTRACT_CONFIG_PATH` or `config/sources.toml` (if present),
    /// then environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        if path.exists() {
            cfg.merge_file(&path)?;
            info!(path = %path.display(), "source config file loaded");
        } else if std::env::var(ENV_CONFIG_PATH).is_ok() {
            anyhow::bail!("{ENV_CONFIG_PATH} points to non-existent path {}", path.display());
        }

        cfg.apply_overrides_from(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        cfg.merge_file(path.as_ref())?;
        Ok(cfg)
    }

    fn merge_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading source config from {}", path.display()))?;
        let file: FileConfig = toml::from_str(&content)
            .with_context(|| format!("parsing source config {}", path.display()))?;

        if let Some(v) = file.max_daily_cost {
            self.max_daily_cost = v;
        }
        for (name, patch) in file.sources {
            let entry = self
                .sources
                .entry(name.clone())
                .or_insert_with(|| SourceConfig::defaults_for(&name));
            patch.apply(entry);
        }
        Ok(())
    }

    /// Apply `<PREFIX>_*` overrides using `lookup` (the process env in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<f64, _>(&lookup, ENV_MAX_DAILY_COST) {
            self.max_daily_cost = v;
        }

        for (name, prefix) in [
            (AI_EXTRACTOR, "GEMINI"),
            (CRAWL_SERVICE, "CRAWL"),
            (HEADLESS_BROWSER, "BROWSER"),
            (CATALOG_API, "CATALOG"),
        ] {
            let patch = SourceConfigPatch {
                max_requests_per_minute: parse_var(&lookup, &format!("{prefix}_MAX_PER_MINUTE")),
                max_requests_per_hour: parse_var(&lookup, &format!("{prefix}_MAX_PER_HOUR")),
                max_concurrent: parse_var(&lookup, &format!("{prefix}_MAX_CONCURRENT")),
                timeout_ms: parse_var(&lookup, &format!("{prefix}_TIMEOUT_MS")),
                max_retries: parse_var(&lookup, &format!("{prefix}_MAX_RETRIES")),
                circuit_breaker_threshold: parse_var(
                    &lookup,
                    &format!("{prefix}_CIRCUIT_THRESHOLD"),
                ),
                cost_per_request: parse_var(&lookup, &format!("{prefix}_COST_PER_REQUEST")),
                enabled: lookup(&format!("{prefix}_ENABLED")).map(|v| parse_flag(&v)),
            };
            if patch == SourceConfigPatch::default() {
                continue;
            }
            let entry = self
                .sources
                .entry(name.to_string())
                .or_insert_with(|| SourceConfig::defaults_for(name));
            patch.apply(entry);
        }
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.get(name)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

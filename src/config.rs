use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PASSING_SCORE: f64 = 75.0;

const ENV_WORKSPACE: &str = "LMSD_WORKSPACE";
const ENV_PASSING_SCORE: &str = "LMSD_DEFAULT_PASSING_SCORE";
const ENV_LOG: &str = "LMSD_LOG";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("LMSD_DEFAULT_PASSING_SCORE must be a number between 0 and 100, got {0:?}")]
    PassingScore(String),
    #[error("LMSD_WORKSPACE must not be empty")]
    EmptyWorkspace,
    #[error("LMSD_LOG is not a valid log filter: {0:?}")]
    LogFilter(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Workspace opened before the first request, if any.
    pub workspace: Option<PathBuf>,
    pub default_passing_score: f64,
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            default_passing_score: DEFAULT_PASSING_SCORE,
            log_filter: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Some(raw) = lookup(ENV_WORKSPACE) {
            let t = raw.trim();
            if t.is_empty() {
                return Err(ConfigError::EmptyWorkspace);
            }
            cfg.workspace = Some(PathBuf::from(t));
        }

        if let Some(raw) = lookup(ENV_PASSING_SCORE) {
            let score = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && (0.0..=100.0).contains(v))
                .ok_or_else(|| ConfigError::PassingScore(raw.clone()))?;
            cfg.default_passing_score = score;
        }

        cfg.log_filter = lookup(ENV_LOG)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(filter) = cfg.log_filter.as_deref() {
            EnvFilter::try_new(filter).map_err(|_| ConfigError::LogFilter(filter.to_string()))?;
        }

        Ok(cfg)
    }
}

pub fn default_log_filter() -> &'static str {
    "info"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = from_pairs(&[]).expect("config");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.default_passing_score, 75.0);
    }

    #[test]
    fn reads_all_variables() {
        let cfg = from_pairs(&[
            ("LMSD_WORKSPACE", " /tmp/lms "),
            ("LMSD_DEFAULT_PASSING_SCORE", "60"),
            ("LMSD_LOG", "lmsd=debug"),
        ])
        .expect("config");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/lms")));
        assert_eq!(cfg.default_passing_score, 60.0);
        assert_eq!(cfg.log_filter.as_deref(), Some("lmsd=debug"));
    }

    #[test]
    fn rejects_out_of_range_passing_score() {
        assert_eq!(
            from_pairs(&[("LMSD_DEFAULT_PASSING_SCORE", "120")]),
            Err(ConfigError::PassingScore("120".to_string()))
        );
        assert!(from_pairs(&[("LMSD_DEFAULT_PASSING_SCORE", "abc")]).is_err());
        assert_eq!(
            from_pairs(&[("LMSD_WORKSPACE", "  ")]),
            Err(ConfigError::EmptyWorkspace)
        );
    }

    #[test]
    fn rejects_malformed_log_filter() {
        for bad in ["lmsd=[", "lmsd=notalevel", "=====", "a[b"] {
            assert_eq!(
                from_pairs(&[("LMSD_LOG", bad)]),
                Err(ConfigError::LogFilter(bad.to_string())),
                "{bad}"
            );
        }
        let cfg = from_pairs(&[("LMSD_LOG", "warn,lmsd=debug")]).expect("config");
        assert_eq!(cfg.log_filter.as_deref(), Some("warn,lmsd=debug"));
        let blank = from_pairs(&[("LMSD_LOG", "  ")]).expect("config");
        assert_eq!(blank.log_filter, None);
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root holding `<book_id>/source_raw/*.html` and `<book_id>/meta.json`.
    pub books_root: PathBuf,
    /// Immutable run artifacts land under `<runs_root>/<run_id>/<book_id>/`.
    pub runs_root: PathBuf,
    /// Canonical corpus: registry, chunks_by_book, topics, special zones.
    pub corpus_root: PathBuf,
    /// Oracle cache directory (survives runs).
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Supervision fixtures: must_not_heading.jsonl, splits/{train,holdout}.jsonl.
    #[serde(default = "default_fixtures_root")]
    pub fixtures_root: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}
fn default_fixtures_root() -> PathBuf {
    PathBuf::from("fixtures")
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Token-bucket refill rate, requests per second.
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,
    /// Token-bucket burst capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum ambiguous candidates sent to the oracle per run under the
    /// `balanced` profile. The `max` profile lifts this cap.
    #[serde(default = "default_budget")]
    pub budget: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_model(),
            endpoint: default_endpoint(),
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            budget: default_budget(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com".to_string()
}
fn default_rate_per_sec() -> f64 {
    2.0
}
fn default_burst() -> u32 {
    4
}
fn default_max_retries() -> u32 {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_budget() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Score at or above which a candidate is suggested as a heading.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,
    /// Score at or below which a candidate is suggested as not-a-heading.
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            reject_threshold: default_reject_threshold(),
        }
    }
}

fn default_accept_threshold() -> f64 {
    0.75
}
fn default_reject_threshold() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlacementConfig {
    /// Confidence floor below which placement is review-gated.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Top-1 vs top-2 margin below which placement is ambiguous.
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            ambiguity_margin: default_ambiguity_margin(),
            max_candidates: default_max_candidates(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.85
}
fn default_ambiguity_margin() -> f64 {
    0.08
}
fn default_max_candidates() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// Anchor-miss relative reduction below which the run report fails its
    /// guardrails (and the commit stage refuses to proceed).
    #[serde(default = "default_minimum_relative_reduction")]
    pub minimum_relative_reduction: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            minimum_relative_reduction: default_minimum_relative_reduction(),
        }
    }
}

fn default_minimum_relative_reduction() -> f64 {
    0.0
}

/// Oracle budget profile, from `IBP_AI_PROFILE` (`max` or `balanced`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AiProfile {
    Max,
    #[default]
    Balanced,
}

impl OracleConfig {
    /// Model name, with the `OPENAI_MODEL` environment override applied.
    pub fn resolved_model(&self) -> String {
        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| self.model.clone())
    }

    /// Effective per-run oracle budget for the given profile.
    pub fn effective_budget(&self, profile: AiProfile) -> usize {
        match profile {
            AiProfile::Max => usize::MAX,
            AiProfile::Balanced => self.budget,
        }
    }
}

/// Read `IBP_AI_PROFILE` from the environment; unknown values fail.
pub fn ai_profile_from_env() -> Result<AiProfile> {
    match std::env::var("IBP_AI_PROFILE") {
        Ok(v) if v == "max" => Ok(AiProfile::Max),
        Ok(v) if v == "balanced" => Ok(AiProfile::Balanced),
        Ok(other) => anyhow::bail!("IBP_AI_PROFILE must be 'max' or 'balanced', got '{other}'"),
        Err(_) => Ok(AiProfile::Balanced),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.scoring.reject_threshold >= config.scoring.accept_threshold {
        anyhow::bail!(
            "scoring.reject_threshold ({}) must be below scoring.accept_threshold ({})",
            config.scoring.reject_threshold,
            config.scoring.accept_threshold
        );
    }
    for (name, v) in [
        ("scoring.accept_threshold", config.scoring.accept_threshold),
        ("scoring.reject_threshold", config.scoring.reject_threshold),
        ("placement.min_confidence", config.placement.min_confidence),
        (
            "report.minimum_relative_reduction",
            config.report.minimum_relative_reduction,
        ),
    ] {
        if !(0.0..=1.0).contains(&v) {
            anyhow::bail!("{name} must be in [0.0, 1.0]");
        }
    }

    if config.oracle.enabled {
        if config.oracle.rate_per_sec <= 0.0 {
            anyhow::bail!("oracle.rate_per_sec must be > 0 when the oracle is enabled");
        }
        if config.oracle.burst == 0 {
            anyhow::bail!("oracle.burst must be >= 1 when the oracle is enabled");
        }
        // The key itself is only read at request time, never from disk.
        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set (oracle is enabled)");
        }
    }

    Ok(config)
}

impl Config {
    /// Minimal config for tests and oracle-free runs, rooted at `root`.
    pub fn minimal(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                books_root: root.join("books"),
                runs_root: root.join("runs"),
                corpus_root: root.join("corpus"),
                cache_dir: root.join("cache"),
                fixtures_root: root.join("fixtures"),
            },
            oracle: OracleConfig::default(),
            scoring: ScoringConfig::default(),
            placement: PlacementConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ibp.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (tmp, path)
    }

    #[test]
    fn loads_minimal_config() {
        let (_tmp, path) = write_config(
            r#"
[paths]
books_root = "books"
runs_root = "runs"
corpus_root = "corpus"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert!(!cfg.oracle.enabled);
        assert_eq!(cfg.scoring.accept_threshold, 0.75);
        assert_eq!(cfg.placement.max_candidates, 3);
        assert_eq!(cfg.report.minimum_relative_reduction, 0.0);
    }

    #[test]
    fn report_minimum_is_configurable_and_range_checked() {
        let (_tmp, path) = write_config(
            r#"
[paths]
books_root = "books"
runs_root = "runs"
corpus_root = "corpus"

[report]
minimum_relative_reduction = 0.4
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.report.minimum_relative_reduction, 0.4);

        let (_tmp, path) = write_config(
            r#"
[paths]
books_root = "books"
runs_root = "runs"
corpus_root = "corpus"

[report]
minimum_relative_reduction = 1.5
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let (_tmp, path) = write_config(
            r#"
[paths]
books_root = "books"
runs_root = "runs"
corpus_root = "corpus"

[scoring]
accept_threshold = 0.2
reject_threshold = 0.8
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn balanced_profile_caps_budget() {
        let oracle = OracleConfig {
            budget: 50,
            ..OracleConfig::default()
        };
        assert_eq!(oracle.effective_budget(AiProfile::Balanced), 50);
        assert_eq!(oracle.effective_budget(AiProfile::Max), usize::MAX);
    }
}

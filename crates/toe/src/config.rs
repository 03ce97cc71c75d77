use anyhow::{Context, Result, bail};
use assess::{ModelConfig, RetryConfig};
use evidence::{BudgetConfig, OcrConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub model: ModelConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub budget: BudgetConfig,
    pub ocr: OcrConfig,
    /// Folder holding one evidence sub-folder per control.
    pub evidence_root: PathBuf,
    /// Call the model even when a control has no usable evidence.
    pub assess_without_evidence: bool,
    pub usd_per_million_tokens: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,     // More parallelism, fewer retries, shorter timeouts
    Accurate, // Less parallelism, more retries and re-prompts
    Balanced, // Default
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_controls: usize,
    pub max_concurrent_model_calls: usize,
    pub request_timeout_secs: u64,
    /// Whole-batch limit; controls not yet started when it expires are reported cancelled.
    pub batch_timeout_secs: Option<u64>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        AppConfig::default().concurrency
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Balanced,
            model: ModelConfig::default(),
            concurrency: ConcurrencyConfig {
                max_concurrent_controls: 4,
                max_concurrent_model_calls: 3,
                request_timeout_secs: 120,
                batch_timeout_secs: None,
            },
            retry: RetryConfig::default(),
            budget: BudgetConfig::default(),
            ocr: OcrConfig::default(),
            evidence_root: PathBuf::from("Evidence"),
            assess_without_evidence: false,
            usd_per_million_tokens: 15.0,
        }
    }
}

impl AppConfig {
    pub fn fast_mode() -> Self {
        let base = Self::default();
        Self {
            mode: OperationMode::Fast,
            concurrency: ConcurrencyConfig {
                max_concurrent_controls: 10,
                max_concurrent_model_calls: 8,
                request_timeout_secs: 60,
                batch_timeout_secs: None,
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 500,
                max_backoff_ms: 10_000,
                max_rate_limit_wait_ms: 30_000,
                corrective_retries: 1,
            },
            ..base
        }
    }

    pub fn accurate_mode() -> Self {
        let base = Self::default();
        Self {
            mode: OperationMode::Accurate,
            concurrency: ConcurrencyConfig {
                max_concurrent_controls: 2,
                max_concurrent_model_calls: 2,
                request_timeout_secs: 180,
                batch_timeout_secs: None,
            },
            retry: RetryConfig {
                max_attempts: 7,
                initial_backoff_ms: 2000,
                max_backoff_ms: 60_000,
                max_rate_limit_wait_ms: 180_000,
                corrective_retries: 2,
            },
            ..base
        }
    }

    pub fn preset(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Fast => Self::fast_mode(),
            OperationMode::Accurate => Self::accurate_mode(),
            OperationMode::Balanced => Self::default(),
        }
    }

    /// Read a TOML file. Settings it leaves out come from the preset named by
    /// `mode_override`, else by the file's own `mode`, else balanced.
    pub fn load(path: &Path, mode_override: Option<OperationMode>) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text, mode_override).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str, mode_override: Option<OperationMode>) -> Result<Self> {
        let overlay: toml::Table = toml::from_str(text).context("Failed to parse TOML")?;

        let mode = match mode_override {
            Some(mode) => mode,
            None => match overlay.get("mode") {
                Some(value) => value.clone().try_into().context("Invalid mode")?,
                None => OperationMode::Balanced,
            },
        };

        let mut merged = toml::Value::try_from(Self::preset(mode)).context("Failed to serialise preset")?;
        merge(&mut merged, toml::Value::Table(overlay));
        if let toml::Value::Table(table) = &mut merged {
            table.insert("mode".to_string(), toml::Value::try_from(mode)?);
        }

        merged.try_into().context("Failed to read configuration")
    }

    /// Apply `OPENAI_API_KEY`, `TOE_MODEL` and `TOE_BASE_URL` from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.model.api_key = Some(key);
        }
        if let Some(model) = lookup("TOE_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model.model = model;
        }
        if let Some(url) = lookup("TOE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.model.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency.max_concurrent_controls == 0 || self.concurrency.max_concurrent_model_calls == 0 {
            bail!("concurrency limits must be at least 1");
        }
        if self.concurrency.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.budget.max_file_chars == 0 || self.budget.max_bundle_chars == 0 {
            bail!("evidence budgets must be positive");
        }
        if self.budget.max_request_chars < self.budget.max_bundle_chars {
            bail!(
                "budget.max_request_chars ({}) must not be below budget.max_bundle_chars ({})",
                self.budget.max_request_chars,
                self.budget.max_bundle_chars
            );
        }
        if !(0.0..=1.0).contains(&self.ocr.low_confidence_threshold) {
            bail!("ocr.low_confidence_threshold must be between 0 and 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.concurrency.request_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.concurrency.batch_timeout_secs.map(Duration::from_secs)
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, other values replace.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: Storage,
    pub pinning: Pinning,
    #[serde(default)]
    pub executor: Executor,
    #[serde(default)]
    pub timers: Timers,
    #[serde(default)]
    pub moderation: Moderation,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pinning {
    /// Token that proof-of-burn transactions must consume.
    pub token_id: String,
    /// Objects of this size or larger are never pinned.
    #[serde(default = "default_max_pin_size")]
    pub max_pin_size: u64,
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
    /// Pause before looking up freshly broadcast transactions.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Tokens per MB used when the price oracle cannot be reached.
    #[serde(default = "default_fallback_write_price")]
    pub fallback_write_price: String,
    #[serde(default = "default_max_approval_candidates")]
    pub max_approval_candidates: usize,
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Executor {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Timers {
    #[serde(default = "default_first_sweep_delay")]
    pub first_sweep_delay_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_amnesty_interval")]
    pub amnesty_interval_secs: u64,
    #[serde(default = "default_moderation_interval")]
    pub moderation_interval_secs: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Moderation {
    #[serde(default)]
    pub enabled: bool,
    /// Object ids or filenames that must not be retained.
    #[serde(default)]
    pub blocked: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_max_pin_size() -> u64 { 100_000_000 }       // 100 MB
fn default_retry_cap() -> u32 { 5 }
fn default_sweep_batch() -> usize { 30 }
fn default_settle_delay_ms() -> u64 { 3_000 }
fn default_fallback_write_price() -> String { "0.03570889".into() }
fn default_max_approval_candidates() -> usize { 10 }
fn default_dispatch_queue() -> usize { 1_024 }
fn default_concurrency() -> usize { 20 }
fn default_timeout_secs() -> u64 { 5 * 60 }
fn default_first_sweep_delay() -> u64 { 4 * 60 }
fn default_sweep_interval() -> u64 { 10 * 60 }
fn default_amnesty_interval() -> u64 { 330 * 60 }     // 5.5 hours
fn default_moderation_interval() -> u64 { 60 * 60 }
fn default_report_interval() -> u64 { 2 * 60 }
fn default_bind() -> String { "0.0.0.0:9100".into() }

impl Default for Executor {
    fn default() -> Self {
        Self { concurrency: default_concurrency(), timeout_secs: default_timeout_secs() }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            first_sweep_delay_secs: default_first_sweep_delay(),
            sweep_interval_secs: default_sweep_interval(),
            amnesty_interval_secs: default_amnesty_interval(),
            moderation_interval_secs: default_moderation_interval(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Pinning {
    /// Defaults for everything except the token id.
    pub fn with_token(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            max_pin_size: default_max_pin_size(),
            retry_cap: default_retry_cap(),
            sweep_batch: default_sweep_batch(),
            settle_delay_ms: default_settle_delay_ms(),
            fallback_write_price: default_fallback_write_price(),
            max_approval_candidates: default_max_approval_candidates(),
            dispatch_queue: default_dispatch_queue(),
        }
    }

    pub fn fallback_price(&self) -> Result<crate::amount::TokenAmount> {
        self.fallback_write_price
            .parse()
            .with_context(|| format!("invalid pinning.fallback_write_price `{}`", self.fallback_write_price))
    }
}

impl Config {
    fn check(self) -> Result<Self> {
        if self.pinning.token_id.trim().is_empty() {
            anyhow::bail!("pinning.token_id must not be empty");
        }
        self.pinning.fallback_price()?;
        if self.executor.concurrency == 0 {
            anyhow::bail!("executor.concurrency must be at least 1");
        }
        Ok(self)
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read, parsed, or fails
///   the basic sanity checks.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).with_context(|| "invalid TOML in config file".to_string())?;
    cfg.check()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_observed_defaults() {
        let cfg = load_from_str(
            r#"
            [storage]
            path = "/tmp/pins"

            [pinning]
            token_id = "38e97c5d"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pinning.retry_cap, 5);
        assert_eq!(cfg.pinning.sweep_batch, 30);
        assert_eq!(cfg.executor.concurrency, 20);
        assert_eq!(cfg.executor.timeout_secs, 300);
        assert_eq!(cfg.timers.sweep_interval_secs, 600);
        assert_eq!(cfg.pinning.fallback_price().unwrap().units(), 3_570_889);
        assert!(!cfg.moderation.enabled);
    }

    #[test]
    fn rejects_bad_values() {
        let empty_token = r#"
            [storage]
            path = "x"
            [pinning]
            token_id = ""
        "#;
        assert!(load_from_str(empty_token).is_err());

        let bad_price = r#"
            [storage]
            path = "x"
            [pinning]
            token_id = "t"
            fallback_write_price = "cheap"
        "#;
        assert!(load_from_str(bad_price).is_err());
    }
}

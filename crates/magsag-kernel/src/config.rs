use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use magsag_approval::ApprovalConfig;
use magsag_protocol::PolicyDocument;
use serde::{Deserialize, Serialize};

/// Gateway settings, loaded from a JSON file. Every section has defaults,
/// so `{}` is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub policy: PolicyDocument,
    pub rate_limit: RateLimitConfig,
    pub approval: ApprovalSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.rate_limit.qps > 0, "rate_limit.qps must be at least 1");
        ensure!(
            self.rate_limit.idle_evict_ms > 0,
            "rate_limit.idle_evict_ms must be at least 1"
        );
        ensure!(
            self.approval.poll_initial_ms > 0,
            "approval.poll_initial_ms must be at least 1"
        );
        ensure!(
            self.approval.poll_max_ms >= self.approval.poll_initial_ms,
            "approval.poll_max_ms must not be below poll_initial_ms"
        );
        ensure!(
            self.approval.sweep_interval_ms > 0,
            "approval.sweep_interval_ms must be at least 1"
        );
        ensure!(
            chrono::Duration::from_std(self.approval.gate_config().default_timeout).is_ok(),
            "approval.default_timeout_ms is out of range: {}",
            self.approval.default_timeout_ms
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second allowed for each client key.
    pub qps: u32,
    pub backend: RateLimitBackend,
    /// Per-key limiter state untouched this long is dropped by the sweeper.
    pub idle_evict_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            qps: 10,
            backend: RateLimitBackend::default(),
            idle_evict_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn idle_evict(&self) -> Duration {
        Duration::from_millis(self.idle_evict_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitBackend {
    /// Token buckets local to this process.
    #[default]
    Memory,
    /// Sliding-window log shared by every limiter in this process.
    LocalShared,
    /// Sliding-window log in Redis, shared across processes. Needs the
    /// `redis` feature.
    Redis { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    pub default_timeout_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            poll_initial_ms: 10,
            poll_max_ms: 250,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ApprovalSettings {
    pub fn gate_config(&self) -> ApprovalConfig {
        ApprovalConfig {
            poll_initial: Duration::from_millis(self.poll_initial_ms),
            poll_max: Duration::from_millis(self.poll_max_ms),
            default_timeout: Duration::from_millis(self.default_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

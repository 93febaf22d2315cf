//! Environment-driven configuration.
//!
//! Every setting has a typed default except `LEDGER_GATEWAY_URL`. Values are
//! read from the process environment after layering any `.env` files found
//! next to the working directory.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use swarmrouter_core::{RetryPolicy, ValidatorUpdate};
use swarmrouter_selection::{ScoringWeights, SelectionConfig};

use crate::audit::AnchorConfig;
use crate::jobs::JobStoreConfig;
use crate::workers::dispatcher::DispatcherConfig;
use crate::workers::refund_reconciler::RefundReconcilerConfig;
use crate::workers::state_sync::StateSyncConfig;
use crate::workers::timeout_supervisor::TimeoutSupervisorConfig;

const ENDPOINT_OVERRIDE_PREFIX: &str = "VALIDATOR_ENDPOINT_";
const ENDPOINT_TEMPLATE_KEY: &str = "VALIDATOR_ENDPOINT_TEMPLATE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(String),
    #[error("invalid {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl ToString) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    /// `None` runs on in-memory stores.
    pub database_url: Option<String>,

    pub job_processing_timeout: Duration,
    pub max_retries: u32,
    pub job_requeue_base_delay: Duration,

    pub validator_sync_interval: Duration,
    pub monitor_interval: Duration,
    pub refund_reconcile_interval: Duration,
    pub dispatch_interval: Duration,

    pub refund_exec_attempts: u32,
    pub refund_exec_backoff: Duration,
    pub refund_retry_max: u32,
    pub refund_retry_interval: Duration,
    pub refund_alert_throttle: Duration,
    pub refund_audit_log_path: PathBuf,

    pub ipfs_api_url: Option<String>,
    pub ipfs_api_token: Option<String>,
    pub ipfs_pin_attempts: u32,
    pub ipfs_pin_backoff: Duration,

    pub anchor_attempts: u32,
    pub anchor_backoff: Duration,
    pub anchor_confirm_timeout: Duration,
    pub anchor_confirm_poll: Duration,

    pub governance_webhook_url: Option<String>,
    pub governance_logger_url: Option<String>,
    pub governance_service_token: Option<String>,
    pub governance_persist_attempts: u32,
    pub governance_persist_backoff: Duration,

    pub ledger_gateway_url: String,
    pub solana_rpc_url: String,
    pub ledger_rpc_timeout: Duration,

    pub slack_alert_webhook: Option<String>,

    pub http_timeout: Duration,
    pub validator_probe_timeout: Duration,

    pub selection: SelectionConfig,

    pub validator_endpoint_template: String,
    /// Keyed by validator id.
    pub validator_endpoint_overrides: HashMap<String, String>,
    pub validator_degraded_latency_ms: u64,
    pub initial_validators: Vec<ValidatorUpdate>,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv_layers();
        Self::from_vars(env::vars())
    }

    /// Build from an explicit set of variables instead of the process env.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars = Vars(vars.into_iter().collect());

        let ledger_gateway_url = vars.required("LEDGER_GATEWAY_URL")?;

        let weights = ScoringWeights::new(
            vars.f64_or("SELECTION_WEIGHT_STAKE", 0.4)?,
            vars.f64_or("SELECTION_WEIGHT_REPUTATION", 0.3)?,
            vars.f64_or("SELECTION_WEIGHT_CAPACITY", 0.2)?,
            vars.f64_or("SELECTION_WEIGHT_SPEED", 0.1)?,
        )
        .map_err(|e| ConfigError::invalid("SELECTION_WEIGHT_*", e))?;

        let selection = SelectionConfig {
            weights,
            max_stake: vars.u64_or("SELECTION_MAX_STAKE", 100_000)?,
            max_latency_ms: vars.u64_or("SELECTION_MAX_LATENCY_MS", 2_000)?,
            liveness_window: vars.secs_or("SELECTION_LIVENESS_SECONDS", 60)?,
            top_n: vars.u64_or("SELECTION_TOP_N", 3)? as usize,
        };

        let initial_validators = match vars.optional("ROUTER_INITIAL_VALIDATORS") {
            Some(raw) => serde_json::from_str::<Vec<ValidatorUpdate>>(&raw)
                .map_err(|e| ConfigError::invalid("ROUTER_INITIAL_VALIDATORS", e))?,
            None => Vec::new(),
        };

        let validator_endpoint_overrides = vars
            .0
            .iter()
            .filter(|(k, v)| {
                k.starts_with(ENDPOINT_OVERRIDE_PREFIX) && k.as_str() != ENDPOINT_TEMPLATE_KEY && !v.is_empty()
            })
            .map(|(k, v)| (k[ENDPOINT_OVERRIDE_PREFIX.len()..].to_string(), v.clone()))
            .collect();

        let solana_rpc_url = vars
            .optional("SOLANA_RPC_URL")
            .unwrap_or_else(|| ledger_gateway_url.clone());

        Ok(Self {
            host: vars.string_or("ROUTER_HOST", "0.0.0.0"),
            port: vars.parse_or("ROUTER_PORT", 3000u16)?,
            database_url: vars.optional("DATABASE_URL"),

            job_processing_timeout: vars.secs_or("JOB_PROCESSING_TIMEOUT_SECONDS", 60)?,
            max_retries: vars.u32_or("ROUTER_MAX_RETRIES", 3)?,
            job_requeue_base_delay: vars.secs_or("JOB_REQUEUE_BASE_DELAY_SECONDS", 60)?,

            validator_sync_interval: vars.secs_or("VALIDATOR_SYNC_INTERVAL", 15)?,
            monitor_interval: vars.secs_or("ROUTER_MONITOR_INTERVAL", 30)?,
            refund_reconcile_interval: vars.secs_or("REFUND_RECONCILE_INTERVAL", 120)?,
            dispatch_interval: vars.secs_or("JOB_DISPATCH_INTERVAL", 5)?,

            refund_exec_attempts: vars.u32_or("REFUND_EXEC_ATTEMPTS", 3)?,
            refund_exec_backoff: vars.millis_or("REFUND_EXEC_BACKOFF_MS", 500)?,
            refund_retry_max: vars.u32_or("REFUND_RETRY_MAX", 3)?,
            refund_retry_interval: vars.secs_or("REFUND_RETRY_INTERVAL_SECONDS", 300)?,
            refund_alert_throttle: vars.secs_or("REFUND_ALERT_THROTTLE_SECONDS", 3_600)?,
            refund_audit_log_path: PathBuf::from(vars.string_or("REFUND_AUDIT_LOG_PATH", "data/refund-audit.jsonl")),

            ipfs_api_url: vars.optional("IPFS_API_URL"),
            ipfs_api_token: vars.optional("IPFS_API_TOKEN"),
            ipfs_pin_attempts: vars.u32_or("IPFS_PIN_ATTEMPTS", 3)?,
            ipfs_pin_backoff: vars.millis_or("IPFS_PIN_BACKOFF_MS", 200)?,

            anchor_attempts: vars.u32_or("SOLANA_ANCHOR_ATTEMPTS", 5)?,
            anchor_backoff: vars.millis_or("SOLANA_ANCHOR_BACKOFF_MS", 1_000)?,
            anchor_confirm_timeout: vars.millis_or("SOLANA_ANCHOR_CONFIRM_TIMEOUT_MS", 60_000)?,
            anchor_confirm_poll: vars.millis_or("SOLANA_ANCHOR_CONFIRM_POLL_MS", 1_000)?,

            governance_webhook_url: vars.optional("GOVERNANCE_WEBHOOK_URL"),
            governance_logger_url: vars.optional("GOVERNANCE_LOGGER_URL"),
            governance_service_token: vars.optional("GOVERNANCE_SERVICE_TOKEN"),
            governance_persist_attempts: vars.u32_or("GOVERNANCE_PERSIST_ATTEMPTS", 5)?,
            governance_persist_backoff: vars.millis_or("GOVERNANCE_PERSIST_BACKOFF_MS", 1_000)?,

            ledger_gateway_url,
            solana_rpc_url,
            ledger_rpc_timeout: vars.millis_or("LEDGER_RPC_TIMEOUT_MS", 10_000)?,

            slack_alert_webhook: vars.optional("SLACK_ALERT_WEBHOOK"),

            http_timeout: vars.millis_or("HTTP_TIMEOUT_MS", 15_000)?,
            validator_probe_timeout: vars.millis_or("VALIDATOR_PROBE_TIMEOUT_MS", 2_000)?,

            selection,

            validator_endpoint_template: vars.string_or(ENDPOINT_TEMPLATE_KEY, "https://{id}.neuroswarm.io"),
            validator_endpoint_overrides,
            validator_degraded_latency_ms: vars.u64_or("VALIDATOR_DEGRADED_LATENCY_MS", 2_000)?,
            initial_validators,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn job_store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            processing_timeout: self.job_processing_timeout,
            // Requeue windows grow 1x, 2x, 4x ... the base, capped at one hour.
            requeue: RetryPolicy::exponential(
                self.max_retries,
                self.job_requeue_base_delay,
                Duration::from_secs(3_600).max(self.job_requeue_base_delay),
            ),
        }
    }

    pub fn refund_exec_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.refund_exec_attempts,
            self.refund_exec_backoff,
            self.refund_exec_backoff.saturating_mul(16),
        )
    }

    pub fn anchor_config(&self) -> AnchorConfig {
        AnchorConfig {
            pin: RetryPolicy::exponential(
                self.ipfs_pin_attempts,
                self.ipfs_pin_backoff,
                self.ipfs_pin_backoff.saturating_mul(16),
            ),
            chain: RetryPolicy::exponential(
                self.anchor_attempts,
                self.anchor_backoff,
                self.anchor_backoff.saturating_mul(16),
            ),
            confirm_timeout: self.anchor_confirm_timeout,
            confirm_poll: self.anchor_confirm_poll,
            timeline: RetryPolicy::exponential(
                self.governance_persist_attempts,
                self.governance_persist_backoff,
                self.governance_persist_backoff.saturating_mul(16),
            ),
        }
    }

    pub fn state_sync_config(&self) -> StateSyncConfig {
        StateSyncConfig {
            interval: self.validator_sync_interval,
            endpoint_template: self.validator_endpoint_template.clone(),
            endpoint_overrides: self.validator_endpoint_overrides.clone(),
            degraded_latency_ms: self.validator_degraded_latency_ms,
            ..StateSyncConfig::default()
        }
    }

    pub fn timeout_supervisor_config(&self) -> TimeoutSupervisorConfig {
        TimeoutSupervisorConfig {
            interval: self.monitor_interval,
            max_retries: self.max_retries,
        }
    }

    pub fn refund_reconciler_config(&self) -> RefundReconcilerConfig {
        RefundReconcilerConfig {
            interval: self.refund_reconcile_interval,
            alert_throttle: self.refund_alert_throttle,
            retry_max: self.refund_retry_max,
            retry_interval: self.refund_retry_interval,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            interval: self.dispatch_interval,
            ..DispatcherConfig::default()
        }
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    /// Unset and empty are the same thing.
    fn optional(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(v) => v.trim().parse::<T>().map_err(|e| ConfigError::invalid(key, e)),
            None => Ok(default),
        }
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        self.parse_or(key, default)
    }

    fn u64_or(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        self.parse_or(key, default)
    }

    fn f64_or(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        self.parse_or(key, default)
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.u64_or(key, default).map(Duration::from_secs)
    }

    fn millis_or(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.u64_or(key, default).map(Duration::from_millis)
    }
}

fn load_dotenv_layers() {
    for path in [".env", "../.env", "../../.env"] {
        let _ = dotenvy::from_path(path);
    }
}

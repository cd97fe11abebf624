//! Configuration types.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Lease and reconciliation settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a claim stays valid without renewal.
    pub lock: Duration,
    /// Renewal interval. Must be shorter than `lock`.
    pub heartbeat: Duration,
    /// Attempts before a stale or failing job is forced to `failed`.
    pub max_attempts: u32,
    /// Staleness threshold for legacy jobs that carry no `locked_until`.
    pub legacy_stale_threshold: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(60),
            heartbeat: Duration::from_secs(15),
            max_attempts: 3,
            legacy_stale_threshold: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Backoff settings for a single model.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in [0.8, 1.2].
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

/// Model selection and generation settings.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub primary: String,
    /// Tried in order after the primary exhausts its retries.
    pub fallbacks: Vec<String>,
    pub system_prompt: String,
    /// Model turns per job before giving up on tool calls.
    pub max_tool_iterations: usize,
    pub max_output_tokens: u32,
    pub tool_timeout: Duration,
    /// Stream replies and publish deltas as worker activity.
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary: "claude-sonnet-4-20250514".to_string(),
            fallbacks: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tool_iterations: 10,
            max_output_tokens: 4096,
            tool_timeout: Duration::from_secs(60),
            stream: false,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant replying to a user in an \
ongoing chat. Answer concisely. Use the available tools when they help.";

/// Context window compaction settings.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Token budget of the model context.
    pub context_window: usize,
    /// Compact when the history has more messages than this.
    pub message_threshold: usize,
    /// Share of the window kept verbatim as the recent tail.
    pub recent_ratio: f64,
    /// Share of the window per summarization chunk.
    pub chunk_ratio: f64,
    /// Share of the window the compacted history must fit into.
    pub target_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            message_threshold: 50,
            recent_ratio: 0.3,
            chunk_ratio: 0.4,
            target_ratio: 0.9,
        }
    }
}

/// Human approval settings for high-risk tools.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub high_risk_tools: BTreeSet<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            high_risk_tools: BTreeSet::new(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written into `processor_id` on claimed jobs.
    pub processor_id: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Pending jobs fetched per poll.
    pub batch_size: usize,
    /// How often the stale-job reconciliation pass runs.
    pub reconcile_interval: Duration,
    pub max_delegation_depth: u32,
    pub database_path: String,
    pub lease: LeaseConfig,
    pub retry: RetryConfig,
    pub model: ModelConfig,
    pub compaction: CompactionConfig,
    pub approval: ApprovalConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            processor_id: format!("worker-{}", &id[..8]),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            reconcile_interval: Duration::from_secs(30),
            max_delegation_depth: 2,
            database_path: "./data/reply-worker.db".to_string(),
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            model: ModelConfig::default(),
            compaction: CompactionConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Build from `WORKER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let d = Self::default();

        let config = Self {
            processor_id: env.string("WORKER_PROCESSOR_ID").unwrap_or(d.processor_id),
            poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", d.poll_interval)?,
            batch_size: env.parse("WORKER_BATCH_SIZE", d.batch_size)?,
            reconcile_interval: env.millis("WORKER_RECONCILE_INTERVAL_MS", d.reconcile_interval)?,
            max_delegation_depth: env.parse("WORKER_MAX_DELEGATION_DEPTH", d.max_delegation_depth)?,
            database_path: env.string("WORKER_DB_PATH").unwrap_or(d.database_path),
            lease: LeaseConfig {
                lock: env.millis("WORKER_LOCK_MS", d.lease.lock)?,
                heartbeat: env.millis("WORKER_HEARTBEAT_MS", d.lease.heartbeat)?,
                max_attempts: env.parse("WORKER_MAX_ATTEMPTS", d.lease.max_attempts)?,
                legacy_stale_threshold: d.lease.legacy_stale_threshold,
            },
            retry: RetryConfig {
                max_retries: env.parse("WORKER_MAX_RETRIES", d.retry.max_retries)?,
                base_delay: env.millis("WORKER_RETRY_BASE_DELAY_MS", d.retry.base_delay)?,
                max_delay: env.millis("WORKER_RETRY_MAX_DELAY_MS", d.retry.max_delay)?,
                jitter: env.parse("WORKER_RETRY_JITTER", d.retry.jitter)?,
            },
            model: ModelConfig {
                primary: env.string("WORKER_PRIMARY_MODEL").unwrap_or(d.model.primary),
                fallbacks: env.list("WORKER_FALLBACK_MODELS"),
                system_prompt: env.string("WORKER_SYSTEM_PROMPT").unwrap_or(d.model.system_prompt),
                max_tool_iterations: env
                    .parse("WORKER_MAX_TOOL_ITERATIONS", d.model.max_tool_iterations)?,
                max_output_tokens: env.parse("WORKER_MAX_OUTPUT_TOKENS", d.model.max_output_tokens)?,
                tool_timeout: env.millis("WORKER_TOOL_TIMEOUT_MS", d.model.tool_timeout)?,
                stream: env.parse("WORKER_STREAM", d.model.stream)?,
            },
            compaction: CompactionConfig {
                context_window: env.parse("WORKER_CONTEXT_WINDOW", d.compaction.context_window)?,
                message_threshold: env
                    .parse("WORKER_COMPACTION_THRESHOLD", d.compaction.message_threshold)?,
                ..d.compaction
            },
            approval: ApprovalConfig {
                poll_interval: env.millis("WORKER_APPROVAL_POLL_MS", d.approval.poll_interval)?,
                timeout: env.millis("WORKER_APPROVAL_TIMEOUT_MS", d.approval.timeout)?,
                high_risk_tools: env.list("WORKER_HIGH_RISK_TOOLS").into_iter().collect(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.heartbeat >= self.lease.lock {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_HEARTBEAT_MS".to_string(),
                message: format!(
                    "heartbeat ({:?}) must be shorter than the lease ({:?})",
                    self.lease.heartbeat, self.lease.lock
                ),
            });
        }
        if self.lease.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.compaction.context_window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_CONTEXT_WINDOW".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.model.max_tool_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_MAX_TOOL_ITERATIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_carry_documented_constants() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease.lock, Duration::from_secs(60));
        assert_eq!(config.lease.heartbeat, Duration::from_secs(15));
        assert_eq!(config.lease.max_attempts, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.compaction.message_threshold, 50);
        assert_eq!(config.approval.timeout, Duration::from_secs(300));
        assert!(config.processor_id.starts_with("worker-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides_and_lists() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_PROCESSOR_ID", "w-1"),
            ("WORKER_LOCK_MS", "20000"),
            ("WORKER_HEARTBEAT_MS", "5000"),
            ("WORKER_FALLBACK_MODELS", " gpt-4o, ,claude-haiku "),
            ("WORKER_HIGH_RISK_TOOLS", "send_payment,delete_note"),
            ("WORKER_RETRY_JITTER", "false"),
        ]))
        .unwrap();

        assert_eq!(config.processor_id, "w-1");
        assert_eq!(config.lease.lock, Duration::from_secs(20));
        assert_eq!(config.model.fallbacks, vec!["gpt-4o", "claude-haiku"]);
        assert!(config.approval.high_risk_tools.contains("send_payment"));
        assert!(!config.retry.jitter);
    }

    #[test]
    fn rejects_unparsable_values() {
        let err = WorkerConfig::from_lookup(lookup(&[("WORKER_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "WORKER_BATCH_SIZE"));
    }

    #[test]
    fn heartbeat_must_be_shorter_than_lease() {
        let err = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_LOCK_MS", "1000"),
            ("WORKER_HEARTBEAT_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat"));
    }
}

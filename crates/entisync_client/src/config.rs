//! Configuration for the sync controller.

use entisync_protocol::SessionToken;
use std::time::Duration;

/// Configuration for a sync controller.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server URL.
    pub server_url: String,
    /// Opaque session handle attached to every request.
    pub session: Option<SessionToken>,
    /// Maximum reconciliation attempts before a conflict is surfaced.
    pub max_reconcile_attempts: u32,
    /// Retry configuration for idempotent reads.
    pub retry: RetryConfig,
    /// Request timeout.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given server.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session: None,
            max_reconcile_attempts: 3,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Attaches a session token.
    #[must_use]
    pub fn with_session(mut self, session: SessionToken) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the maximum reconciliation attempts.
    #[must_use]
    pub fn with_max_reconcile_attempts(mut self, attempts: u32) -> Self {
        self.max_reconcile_attempts = attempts;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8080")
    }
}

/// Configuration for read-retry behavior.
///
/// Retries apply to idempotent reads only; commits are surfaced on the
/// first transport failure with their pending record intact.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    ///
    /// The budget counts the initial attempt, so it is clamped to at
    /// least one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter.
            let jitter = capped * 0.25 * pseudo_jitter();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Cheap time-derived jitter, good enough for backoff spreading.
fn pseudo_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

use std::env;
use std::time::Duration;

const DEFAULT_PARALLELISM: usize = 4;
const DEFAULT_BATCH_SIZE: i64 = 32;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
const DEFAULT_DB_POOL_SIZE: u32 = 10;

/// Process-level configuration for the resolver daemon, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub database_url: String,
    pub db_pool_size: u32,

    /// Number of concurrent poll loops fanned out by the iteration driver.
    pub parallelism: usize,
    /// Max advisory messages claimed per poll, capped at 32 per the queue's contract.
    pub batch_size: i64,
    /// How long a claimed advisory message stays invisible to other pollers.
    pub visibility_timeout: Duration,
    /// Sleep between polls when a poll returns no messages.
    pub poll_interval: Duration,
    /// Retries of the load-modify-CAS loop before giving up on a single message.
    pub max_cas_attempts: u32,
    /// Consecutive poll failures before the driver escalates to a fatal alert and exits.
    pub max_consecutive_failures: u32,

    pub webhook_url: Option<String>,
    pub webhook_signing_secret: Option<String>,
}

impl ResolverConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let db_pool_size = env::var("DB_POOL_SIZE")
            .unwrap_or_else(|_| DEFAULT_DB_POOL_SIZE.to_string())
            .parse()
            .unwrap_or(DEFAULT_DB_POOL_SIZE);

        let parallelism = env::var("RESOLVER_PARALLELISM")
            .unwrap_or_else(|_| DEFAULT_PARALLELISM.to_string())
            .parse()
            .unwrap_or(DEFAULT_PARALLELISM);

        let batch_size = env::var("RESOLVER_BATCH_SIZE")
            .unwrap_or_else(|_| DEFAULT_BATCH_SIZE.to_string())
            .parse()
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .min(32);

        let visibility_timeout_secs = env::var("RESOLVER_VISIBILITY_TIMEOUT_SECS")
            .unwrap_or_else(|_| DEFAULT_VISIBILITY_TIMEOUT_SECS.to_string())
            .parse()
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS);

        let poll_interval_ms = env::var("RESOLVER_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| DEFAULT_POLL_INTERVAL_MS.to_string())
            .parse()
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let max_cas_attempts = env::var("RESOLVER_MAX_CAS_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_MAX_CAS_ATTEMPTS.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_CAS_ATTEMPTS);

        let max_consecutive_failures = env::var("RESOLVER_MAX_CONSECUTIVE_FAILURES")
            .unwrap_or_else(|_| DEFAULT_MAX_CONSECUTIVE_FAILURES.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES);

        let webhook_url = env::var("RESOLVER_WEBHOOK_URL").ok();
        let webhook_signing_secret = env::var("RESOLVER_WEBHOOK_SIGNING_SECRET").ok();

        Ok(Self {
            database_url,
            db_pool_size,
            parallelism,
            batch_size,
            visibility_timeout: Duration::from_secs(visibility_timeout_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_cas_attempts,
            max_consecutive_failures,
            webhook_url,
            webhook_signing_secret,
        })
    }
}

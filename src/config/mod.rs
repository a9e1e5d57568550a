use serde::Deserialize;
use std::time::Duration;

/// Which background-removal backend S2 talks to.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundRemovalProvider {
    /// Self-hosted rembg service, falling back to Remove.bg when
    /// `REMOVEBG_API_KEY` is set.
    Rembg,
    /// Remove.bg hosted API.
    RemoveBg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Worker admin surface (health registry, manual resets, metrics)
    #[serde(default = "default_worker_admin_addr")]
    pub worker_admin_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the work queue
    pub redis_url: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// How long a dequeued item stays invisible to other workers
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,

    #[serde(default = "default_stalled_interval_secs")]
    pub stalled_interval_secs: u64,

    /// Redeliveries allowed before a stalled item is failed for good
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    #[serde(default = "default_enqueue_attempts")]
    pub enqueue_attempts: u32,

    #[serde(default = "default_enqueue_backoff_ms")]
    pub enqueue_backoff_ms: u64,

    /// Idle sleep between empty dequeues
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_external_call_timeout_secs")]
    pub external_call_timeout_secs: u64,

    /// Google Gemini API key
    pub gemini_api_key: String,

    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Overrides the built-in extraction prompt
    pub extraction_prompt: Option<String>,

    #[serde(default = "default_background_removal_provider")]
    pub background_removal_provider: BackgroundRemovalProvider,

    #[serde(default = "default_rembg_endpoint")]
    pub rembg_endpoint: String,

    pub removebg_api_key: Option<String>,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Shorter edge of the normalized artwork, in pixels
    #[serde(default = "default_min_output_px")]
    pub min_output_px: u32,

    #[serde(default = "default_target_dpi")]
    pub target_dpi: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_admin_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_queue_name() -> String {
    "artwork-extraction".to_string()
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_lock_duration_secs() -> u64 {
    30
}

fn default_stalled_interval_secs() -> u64 {
    30
}

fn default_max_stalled_count() -> u32 {
    2
}

fn default_enqueue_attempts() -> u32 {
    3
}

fn default_enqueue_backoff_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_external_call_timeout_secs() -> u64 {
    60
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash-image-preview".to_string()
}

fn default_background_removal_provider() -> BackgroundRemovalProvider {
    BackgroundRemovalProvider::Rembg
}

fn default_rembg_endpoint() -> String {
    "http://localhost:5000".to_string()
}

fn default_min_output_px() -> u32 {
    3000
}

fn default_target_dpi() -> u32 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("WORKER_CONCURRENCY must be at least 1".into()));
        }
        if self.enqueue_attempts == 0 {
            return Err(ConfigError::Invalid("ENQUEUE_ATTEMPTS must be at least 1".into()));
        }
        if self.lock_duration_secs == 0 {
            return Err(ConfigError::Invalid("LOCK_DURATION_SECS must be at least 1".into()));
        }
        if self.background_removal_provider == BackgroundRemovalProvider::RemoveBg
            && self.removebg_key().is_none()
        {
            return Err(ConfigError::Invalid(
                "REMOVEBG_API_KEY is required when BACKGROUND_REMOVAL_PROVIDER=remove_bg".into(),
            ));
        }
        Ok(())
    }

    /// Remove.bg key, ignoring an empty value.
    pub fn removebg_key(&self) -> Option<&str> {
        self.removebg_api_key.as_deref().filter(|key| !key.is_empty())
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_secs(self.stalled_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }

    pub fn enqueue_backoff(&self) -> Duration {
        Duration::from_millis(self.enqueue_backoff_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

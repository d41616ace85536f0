use docflow::OrchestratorConfig;
use fetch::DownloadPolicy;
use guard::GuardConfig;
use queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use webhook::{RetryConfig, WebhookConfig};

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix for all API routes
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum request body size in MB
    #[serde(default = "default_max_body_size_mb")]
    pub max_body_size_mb: usize,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON log lines instead of the human-readable format
    #[serde(default = "default_true")]
    pub log_json: bool,

    /// Worker tasks in the job pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Shared secret for webhook signatures; unset disables signing
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,

    #[serde(default = "default_webhook_min_wait_ms")]
    pub webhook_min_wait_ms: u64,

    #[serde(default = "default_webhook_max_wait_ms")]
    pub webhook_max_wait_ms: u64,

    /// Hostnames outbound URLs may target; empty allows any public host
    #[serde(default)]
    pub allowed_url_domains: Vec<String>,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_download_max_bytes")]
    pub download_max_bytes: u64,

    #[serde(default = "default_download_max_redirects")]
    pub download_max_redirects: u32,

    /// redb file for results and idempotency records; unset keeps them in memory
    #[serde(default)]
    pub result_store_path: Option<String>,

    /// Job retention, retry and batch polling settings
    #[serde(flatten)]
    pub jobs: OrchestratorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            api_prefix: default_api_prefix(),
            timeout_secs: default_timeout_secs(),
            max_body_size_mb: default_max_body_size_mb(),
            enable_cors: default_true(),
            log_level: default_log_level(),
            log_json: default_true(),
            workers: default_workers(),
            webhook_secret: None,
            webhook_max_attempts: default_webhook_max_attempts(),
            webhook_min_wait_ms: default_webhook_min_wait_ms(),
            webhook_max_wait_ms: default_webhook_max_wait_ms(),
            allowed_url_domains: Vec::new(),
            download_timeout_secs: default_download_timeout_secs(),
            download_max_bytes: default_download_max_bytes(),
            download_max_redirects: default_download_max_redirects(),
            result_store_path: None,
            jobs: OrchestratorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `.env`, an optional `docflow` config file and
    /// `DOCFLOW__*` environment variables, in increasing precedence.
    pub fn load() -> anyhow::Result<Self> {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("docflow").required(false))
            .add_source(
                config::Environment::with_prefix("DOCFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("allowed_url_domains")
                    .try_parsing(true),
            );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.jobs.validate()?;
        Ok(config)
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.bind_addr, self.port);
        Ok(addr_str.parse()?)
    }

    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get max body size in bytes
    pub fn max_body_size(&self) -> usize {
        self.max_body_size_mb * 1024 * 1024
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig::default().with_allowed_domains(self.allowed_url_domains.iter().cloned())
    }

    pub fn download_policy(&self) -> DownloadPolicy {
        DownloadPolicy::default()
            .with_timeout(Duration::from_secs(self.download_timeout_secs))
            .with_max_bytes(self.download_max_bytes)
            .with_max_redirects(self.download_max_redirects)
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        let retry = RetryConfig::default()
            .with_max_attempts(self.webhook_max_attempts)
            .with_min_delay(Duration::from_millis(self.webhook_min_wait_ms))
            .with_max_delay(Duration::from_millis(self.webhook_max_wait_ms));
        let config = WebhookConfig::default().with_retry(retry);
        match &self.webhook_secret {
            Some(secret) => config.with_secret(secret.clone()),
            None => config,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_workers(self.workers)
            .with_status_ttl(self.jobs.result_ttl())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_body_size_mb() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_min_wait_ms() -> u64 {
    1_000
}

fn default_webhook_max_wait_ms() -> u64 {
    30_000
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_download_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_download_max_redirects() -> u32 {
    5
}

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Configuration for the video guide client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API endpoint settings
    pub api: ApiConfig,

    /// Progress stream settings
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the analysis service
    pub base_url: String,

    /// Host serving step screenshots (defaults to the API host)
    pub image_host: Option<String>,

    /// Timeout for the blocking fallback request (seconds)
    pub request_timeout_secs: u64,

    /// Timeout for establishing connections (seconds)
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum subscription attempts before giving up
    pub reconnect_attempts: u32,

    /// Delay between subscription attempts (seconds)
    pub reconnect_delay_secs: u64,

    /// Deadline after which the fallback request takes over (seconds)
    pub fallback_deadline_secs: u64,
}

impl Config {
    /// Load configuration from file, falling back to environment variables
    pub fn load() -> Result<Self> {
        let config_paths = [
            "vidguide.toml",
            "config/vidguide.toml",
            "~/.config/vidguide/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Ok(Self::from_env())
    }

    /// Build configuration from environment variables over the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("VIDGUIDE_API_URL") {
            config.api.base_url = base_url;
        }

        if let Ok(image_host) = std::env::var("VIDGUIDE_IMAGE_HOST") {
            config.api.image_host = Some(image_host);
        }

        if let Ok(timeout) = std::env::var("VIDGUIDE_REQUEST_TIMEOUT_SECS") {
            config.api.request_timeout_secs = timeout.parse().unwrap_or(300);
        }

        if let Ok(deadline) = std::env::var("VIDGUIDE_FALLBACK_DEADLINE_SECS") {
            config.stream.fallback_deadline_secs = deadline.parse().unwrap_or(600);
        }

        if let Ok(attempts) = std::env::var("VIDGUIDE_RECONNECT_ATTEMPTS") {
            config.stream.reconnect_attempts = attempts.parse().unwrap_or(5);
        }

        config
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api.base_url)
            .map_err(|e| anyhow!("Invalid API base URL '{}': {}", self.api.base_url, e))?;

        if let Some(host) = &self.api.image_host {
            Url::parse(host).map_err(|e| anyhow!("Invalid image host '{}': {}", host, e))?;
        }

        if self.api.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than 0"));
        }

        if self.stream.reconnect_attempts == 0 {
            return Err(anyhow!("reconnect_attempts must be greater than 0"));
        }

        if self.stream.fallback_deadline_secs == 0 {
            return Err(anyhow!("fallback_deadline_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Video Guide Client Configuration:\n\
            - API URL: {}\n\
            - Image Host: {}\n\
            - Request Timeout: {}s\n\
            - Reconnect Attempts: {}\n\
            - Fallback Deadline: {}s",
            self.api.base_url,
            self.api.image_host.as_deref().unwrap_or("(same as API)"),
            self.api.request_timeout_secs,
            self.stream.reconnect_attempts,
            self.stream.fallback_deadline_secs
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "https://compaasgold06.evl.uic.edu/api-vnava22".to_string(),
                image_host: Some("https://compaasgold06.evl.uic.edu".to_string()),
                request_timeout_secs: 300, // 5 minutes for the blocking fallback
                connect_timeout_secs: 30,
            },
            stream: StreamConfig {
                reconnect_attempts: 5,
                reconnect_delay_secs: 3,
                fallback_deadline_secs: 600, // 10 minutes
            },
        }
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.api.base_url = base_url.into();
        self
    }

    pub fn with_image_host(mut self, host: impl Into<String>) -> Self {
        self.config.api.image_host = Some(host.into());
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.config.api.request_timeout_secs = secs;
        self
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.stream.reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, secs: u64) -> Self {
        self.config.stream.reconnect_delay_secs = secs;
        self
    }

    pub fn with_fallback_deadline(mut self, secs: u64) -> Self {
        self.config.stream.fallback_deadline_secs = secs;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

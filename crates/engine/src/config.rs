//! Engine wide tuning knobs.
//!
//! ```
//! use std::time::Duration;
//! use micro_engine::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .send_buffer_limit(128 * 1024)
//!     .http_idle_timeout(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.send_buffer_limit(), 128 * 1024);
//! ```

use std::time::Duration;

use crate::codec::DEFAULT_MAX_HEADER_BYTES;
use crate::protocol::ConfigError;
use crate::utils::ensure;

pub const DEFAULT_SEND_BUFFER_LIMIT: usize = 64 * 1024;
pub const DEFAULT_CORK_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_PENDING_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    send_buffer_limit: usize,
    cork_buffer_size: usize,
    http_idle_timeout: Duration,
    sweep_interval: Duration,
    max_header_bytes: usize,
    max_pending_body: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_buffer_limit: DEFAULT_SEND_BUFFER_LIMIT,
            cork_buffer_size: DEFAULT_CORK_BUFFER_SIZE,
            http_idle_timeout: DEFAULT_HTTP_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_pending_body: DEFAULT_MAX_PENDING_BODY,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// bytes an http response may queue before `write` reports backpressure
    pub fn send_buffer_limit(&self) -> usize {
        self.send_buffer_limit
    }

    pub fn cork_buffer_size(&self) -> usize {
        self.cork_buffer_size
    }

    /// how long a keep-alive connection may sit between requests
    pub fn http_idle_timeout(&self) -> Duration {
        self.http_idle_timeout
    }

    /// granularity of websocket idle and lifetime deadlines
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    /// request body bytes buffered for a handler that hasn't consumed them yet
    pub fn max_pending_body(&self) -> usize {
        self.max_pending_body
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    send_buffer_limit: Option<usize>,
    cork_buffer_size: Option<usize>,
    http_idle_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    max_header_bytes: Option<usize>,
    max_pending_body: Option<usize>,
}

impl EngineConfigBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn send_buffer_limit(mut self, send_buffer_limit: usize) -> Self {
        self.send_buffer_limit = Some(send_buffer_limit);
        self
    }

    pub fn cork_buffer_size(mut self, cork_buffer_size: usize) -> Self {
        self.cork_buffer_size = Some(cork_buffer_size);
        self
    }

    pub fn http_idle_timeout(mut self, http_idle_timeout: Duration) -> Self {
        self.http_idle_timeout = Some(http_idle_timeout);
        self
    }

    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = Some(sweep_interval);
        self
    }

    pub fn max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.max_header_bytes = Some(max_header_bytes);
        self
    }

    pub fn max_pending_body(mut self, max_pending_body: usize) -> Self {
        self.max_pending_body = Some(max_pending_body);
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let default = EngineConfig::default();
        let config = EngineConfig {
            send_buffer_limit: self.send_buffer_limit.unwrap_or(default.send_buffer_limit),
            cork_buffer_size: self.cork_buffer_size.unwrap_or(default.cork_buffer_size),
            http_idle_timeout: self.http_idle_timeout.unwrap_or(default.http_idle_timeout),
            sweep_interval: self.sweep_interval.unwrap_or(default.sweep_interval),
            max_header_bytes: self.max_header_bytes.unwrap_or(default.max_header_bytes),
            max_pending_body: self.max_pending_body.unwrap_or(default.max_pending_body),
        };

        ensure!(config.send_buffer_limit > 0, ConfigError::Zero { name: "send_buffer_limit" });
        ensure!(config.cork_buffer_size > 0, ConfigError::Zero { name: "cork_buffer_size" });
        ensure!(!config.sweep_interval.is_zero(), ConfigError::Zero { name: "sweep_interval" });
        ensure!(!config.http_idle_timeout.is_zero(), ConfigError::Zero { name: "http_idle_timeout" });
        ensure!(config.max_header_bytes > 0, ConfigError::Zero { name: "max_header_bytes" });
        ensure!(
            config.cork_buffer_size <= config.send_buffer_limit,
            ConfigError::CorkExceedsLimit { cork: config.cork_buffer_size, limit: config.send_buffer_limit }
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        assert_eq!(EngineConfig::builder().build().unwrap(), EngineConfig::default());
    }

    #[test]
    fn builder_validates() {
        assert_eq!(EngineConfig::builder().send_buffer_limit(0).build(), Err(ConfigError::Zero { name: "send_buffer_limit" }));
        assert_eq!(
            EngineConfig::builder().send_buffer_limit(1024).build(),
            Err(ConfigError::CorkExceedsLimit { cork: DEFAULT_CORK_BUFFER_SIZE, limit: 1024 })
        );
        assert_eq!(
            EngineConfig::builder().sweep_interval(Duration::ZERO).build(),
            Err(ConfigError::Zero { name: "sweep_interval" })
        );
    }
}

//! App level configuration.
//!
//! ```
//! use micro_app::AppConfig;
//! use tracing::Level;
//!
//! let config = AppConfig::builder().log_level(Some(Level::DEBUG)).build();
//! assert_eq!(config.log_level(), Some(Level::DEBUG));
//! ```

use micro_engine::EngineConfig;
use tracing::Level;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    engine: EngineConfig,
    log_level: Option<Level>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { engine: EngineConfig::default(), log_level: Some(Level::INFO) }
    }
}

impl AppConfig {
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// max level of the subscriber installed by `run`, `None` installs none
    pub fn log_level(&self) -> Option<Level> {
        self.log_level
    }
}

#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    engine: Option<EngineConfig>,
    log_level: Option<Option<Level>>,
}

impl AppConfigBuilder {
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn log_level(mut self, log_level: Option<Level>) -> Self {
        self.log_level = Some(log_level);
        self
    }

    pub fn build(self) -> AppConfig {
        let default = AppConfig::default();
        AppConfig {
            engine: self.engine.unwrap_or(default.engine),
            log_level: self.log_level.unwrap_or(default.log_level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_log_at_info() {
        let config = AppConfig::builder().build();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.log_level(), Some(Level::INFO));
    }

    #[test]
    fn overrides() {
        let engine = EngineConfig::builder().sweep_interval(Duration::from_millis(50)).build().unwrap();
        let config = AppConfig::builder().engine(engine.clone()).log_level(None).build();
        assert_eq!(config.engine(), &engine);
        assert_eq!(config.log_level(), None);
    }
}

pub mod logging;
pub mod multi;

pub use logging::LoggingConfig;
pub use multi::MultiConfig;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub multi: MultiConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_str = std::fs::read_to_string("config.toml").unwrap_or_else(|_| "".to_string());
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.multi.enabled);
        assert_eq!(config.multi.max_clients, 32);
        assert_eq!(config.multi.buffer_periods, 16);
        assert!(config.logging.is_none());
    }

    #[test]
    fn partial_multi_section() {
        let config: Config = toml::from_str(
            r#"
            [multi]
            max_clients = 4
            drain_settle_ns = 50000000
            "#,
        )
        .unwrap();
        assert_eq!(config.multi.max_clients, 4);
        assert_eq!(config.multi.drain_settle_ns, 50_000_000);
        assert_eq!(config.multi.mix_threshold, 3);
    }
}

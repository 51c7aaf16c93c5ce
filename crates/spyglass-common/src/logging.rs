//! Logging setup for Spyglass
//!
//! The engine runs inside a host process that owns stdout, so the default
//! sink for an injected build is a per-PID log file next to the host's
//! working directory. Console output is used by test harnesses.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable console (stderr) logging
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Enable file logging
    #[serde(default)]
    pub file_enabled: bool,

    /// Log file path
    #[serde(default)]
    pub file_path: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: String::new(),
            timestamps: true,
            show_target: true,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Configuration for the injected agent: file only, PID-suffixed path.
    pub fn injected() -> Self {
        let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        path.push(format!("spyglass-{}.log", std::process::id()));
        Self {
            console_enabled: false,
            file_enabled: true,
            file_path: path.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Load from a TOML file with a `[logging]` table.
    pub fn from_file(path: &str) -> Result<Self, String> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            logging: Option<LogConfig>,
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let wrapper: Wrapper =
            toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        Ok(wrapper.logging.unwrap_or_default())
    }
}

/// Initialize the global subscriber from a configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.file_enabled && !config.file_path.is_empty() {
        if let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)
        {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_target(config.show_target)
                .with_writer(std::sync::Arc::new(file));
            let _ = if config.timestamps {
                builder.try_init()
            } else {
                builder.without_time().try_init()
            };
            return;
        }
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.show_target)
        .with_writer(std::io::stderr);
    let _ = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
}

/// Initialize logging for the injected agent.
pub fn init_agent_logging() {
    init_logging(&LogConfig::injected());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert!(config.timestamps);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_log_config_injected() {
        let config = LogConfig::injected();
        assert!(!config.console_enabled);
        assert!(config.file_enabled);
        assert!(config.file_path.contains("spyglass-"));
    }

    #[test]
    fn test_get_level() {
        assert_eq!(LogConfig::default().get_level(), Level::INFO);
        assert_eq!(
            LogConfig::default().with_level("trace").get_level(),
            Level::TRACE
        );
        assert_eq!(
            LogConfig::default().with_level("warning").get_level(),
            Level::WARN
        );
        assert_eq!(
            LogConfig::default().with_level("nonsense").get_level(),
            Level::INFO
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = LogConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.console_enabled, config.console_enabled);
        assert_eq!(parsed.level, config.level);
    }
}

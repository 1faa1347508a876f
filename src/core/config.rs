//! Configuration management

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use config::builder::DefaultState;
use clap::Parser;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid bridge configuration: {0}")]
    InvalidBridge(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        // Config file (medium priority)
        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(
                    config_path.display().to_string()
                ));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Environment variables are prefixed with RUNNER_BRIDGE_ and use __ for nesting
        // Example: RUNNER_BRIDGE_BRIDGE__CALL_TIMEOUT_MS=5000
        builder = builder.add_source(
            Environment::with_prefix("RUNNER_BRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
        );

        // CLI arguments (highest priority)
        if let Some(runner_dir) = &cli_args.runner_dir {
            builder = builder.set_override("bridge.runner_dir", runner_dir.display().to_string())?;
        }
        if let Some(timeout) = cli_args.call_timeout_ms {
            builder = builder.set_override("bridge.call_timeout_ms", timeout)?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = Self::defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Result<Builder<DefaultState>, ConfigError> {
        Ok(ConfigBuilder::builder()
            .set_default("bridge.runner_dir", "./runners")?
            .set_default("bridge.call_timeout_ms", 30_000)?
            .set_default("bridge.ready_timeout_ms", 15_000)?
            .set_default("bridge.network_timeout_secs", 30)?
            .set_default("bridge.user_agent", concat!("runner-bridge/", env!("CARGO_PKG_VERSION")))?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stdout")?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments for configuration override
#[derive(Debug, Parser)]
#[command(name = "runner-bridge")]
#[command(about = "Load a runner bundle and call into it", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Runner directory path
    #[arg(long, value_name = "DIR")]
    pub runner_dir: Option<PathBuf>,

    /// Per-call timeout in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    pub call_timeout_ms: Option<u64>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Runner bundle directory to load (defaults to every runner in the runner directory)
    #[arg(short, long, value_name = "DIR")]
    pub bundle: Option<PathBuf>,

    /// Runner method to call after loading
    #[arg(long, value_name = "METHOD", requires = "bundle")]
    pub call: Option<String>,

    /// JSON array of positional arguments for --call
    #[arg(long, value_name = "JSON", default_value = "[]")]
    pub args: String,

    /// Use the synchronous call path (direct runners only)
    #[arg(long)]
    pub sync: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub runner_dir: PathBuf,
    /// Replaces the built-in shared runtime shims
    pub commons_path: Option<PathBuf>,
    /// Replaces the built-in page bridging shim
    pub bridge_shim_path: Option<PathBuf>,
    pub call_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub network_timeout_secs: u64,
    pub user_agent: String,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidBridge("runner_dir cannot be empty".to_string()));
        }

        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::InvalidBridge("ready_timeout_ms must be greater than 0".to_string()));
        }

        if self.network_timeout_secs == 0 {
            return Err(ConfigError::InvalidBridge("network_timeout_secs must be greater than 0".to_string()));
        }

        for path in [&self.commons_path, &self.bridge_shim_path].into_iter().flatten() {
            if !path.is_file() {
                return Err(ConfigError::InvalidBridge(
                    format!("script override {} does not exist", path.display())
                ));
            }
        }

        Ok(())
    }

    /// Per-call timeout; `None` when disabled
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_environment_overrides_defaults_and_cli_wins() {
        std::env::set_var("RUNNER_BRIDGE_BRIDGE__CALL_TIMEOUT_MS", "5000");
        std::env::set_var("RUNNER_BRIDGE_LOGGING__LEVEL", "debug");
        let from_env = Config::load(&CliArgs::parse_from(["runner-bridge"]));
        let from_cli = Config::load(&CliArgs::parse_from(["runner-bridge", "--call-timeout-ms", "250"]));
        std::env::remove_var("RUNNER_BRIDGE_BRIDGE__CALL_TIMEOUT_MS");
        std::env::remove_var("RUNNER_BRIDGE_LOGGING__LEVEL");

        let from_env = from_env.unwrap();
        assert_eq!(from_env.bridge.call_timeout_ms, 5000);
        assert_eq!(from_env.logging.level, "debug");
        assert_eq!(from_env.bridge.ready_timeout_ms, 15_000);

        assert_eq!(from_cli.unwrap().bridge.call_timeout_ms, 250);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[bridge]\ncall_timeout_ms = 0\nrunner_dir = \"/srv/runners\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.bridge.runner_dir, PathBuf::from("/srv/runners"));
        assert_eq!(config.bridge.call_timeout(), None);
        assert_eq!(config.bridge.ready_timeout(), Duration::from_millis(15_000));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_logging_validation() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "json".to_string(),
            output: "file".to_string(),
            log_file: None,
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLogging(_))));

        let config = LoggingConfig { level: "verbose".to_string(), output: "stdout".to_string(), ..config };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_script_override_is_rejected() {
        let config = BridgeConfig {
            runner_dir: PathBuf::from("./runners"),
            commons_path: Some(PathBuf::from("/definitely/not/commons.js")),
            bridge_shim_path: None,
            call_timeout_ms: 1000,
            ready_timeout_ms: 1000,
            network_timeout_secs: 5,
            user_agent: "test".to_string(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBridge(_))));
    }
}

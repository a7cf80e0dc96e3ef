use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerSettings;

const ENV_PREFIX: &str = "APPSPACE_MIGRATOR_";
const CONFIG_FILE: &str = "config.toml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub migrator: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const MIGRATOR_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            migrator: Self::MIGRATOR_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.migrator.clone();
        self.migrator = self.migrator.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.migrator.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::MIGRATOR_LEVEL
            );
            self.migrator = Self::MIGRATOR_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// 0 waits for the sandbox indefinitely
    pub migration_timeout_secs: u64,
    pub subscriber_buffer: usize,
}

impl SchedulerConfig {
    const TICK_INTERVAL_SECS: u64 = 60;
    const MIGRATION_TIMEOUT_SECS: u64 = 600;
    const SUBSCRIBER_BUFFER: usize = 64;

    fn default() -> Self {
        SchedulerConfig {
            tick_interval_secs: Self::TICK_INTERVAL_SECS,
            migration_timeout_secs: Self::MIGRATION_TIMEOUT_SECS,
            subscriber_buffer: Self::SUBSCRIBER_BUFFER,
        }
    }

    fn ensure_valid(&mut self) {
        if self.tick_interval_secs == 0 {
            eprintln!(
                "Config error: tick_interval_secs must be positive - using default of {}",
                Self::TICK_INTERVAL_SECS
            );
            self.tick_interval_secs = Self::TICK_INTERVAL_SECS;
        }
        if self.subscriber_buffer == 0 {
            eprintln!(
                "Config error: subscriber_buffer must be positive - using default of {}",
                Self::SUBSCRIBER_BUFFER
            );
            self.subscriber_buffer = Self::SUBSCRIBER_BUFFER;
        }
    }

    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            migration_timeout: match self.migration_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            subscriber_buffer: self.subscriber_buffer,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            command: "appspace-sandbox".to_owned(),
            args: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupConfig {
    pub enabled: bool,
    pub directory: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub backup: BackupConfig,
}

impl Config {
    /// Defaults, with the database and backups kept under `data_dir`
    pub fn defaults(data_dir: &Path) -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig {
                path: data_dir.join("migrator.db").to_string_lossy().into_owned(),
            },
            scheduler: SchedulerConfig::default(),
            sandbox: SandboxConfig::default(),
            backup: BackupConfig {
                enabled: true,
                directory: data_dir.join("backups").to_string_lossy().into_owned(),
            },
        }
    }

    /// Loads the configuration from `config_path`, or from `config.toml` in
    /// `data_dir` when no path is given, then applies `APPSPACE_MIGRATOR_`
    /// environment overrides. A missing file is created with the defaults; a
    /// file that fails to parse is reported and the defaults are used.
    pub fn load_config(data_dir: &Path, config_path: Option<&Path>) -> Self {
        let config_path: PathBuf = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
        let default_config = Self::defaults(data_dir);

        if !config_path.exists() {
            Self::write_default(&config_path, &default_config);
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }

        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.scheduler.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_writes_defaults() {
        Jail::expect_with(|jail| {
            let data_dir = jail.directory().join("data");
            let config = Config::load_config(&data_dir, None);

            assert_eq!(config, Config::defaults(&data_dir));
            assert!(data_dir.join(CONFIG_FILE).exists());

            // The written file round-trips to the same configuration
            let reloaded = Config::load_config(&data_dir, None);
            assert_eq!(reloaded, config);
            Ok(())
        });
    }

    #[test]
    fn test_file_values_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                [server]
                port = 9100

                [scheduler]
                migration_timeout_secs = 0

                [sandbox]
                command = "/usr/local/bin/ds-sandbox"
                args = ["--migrate"]
                "#,
            )?;

            let data_dir = jail.directory().to_path_buf();
            let config = Config::load_config(&data_dir, Some(&data_dir.join("custom.toml")));

            assert_eq!(config.server.port, 9100);
            assert_eq!(config.server.host, "127.0.0.1");
            assert_eq!(config.sandbox.command, "/usr/local/bin/ds-sandbox");
            assert_eq!(config.sandbox.args, vec!["--migrate".to_string()]);
            assert_eq!(config.scheduler.settings().migration_timeout, None);
            assert_eq!(
                config.scheduler.settings().tick_interval,
                Duration::from_secs(60)
            );
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, "[server]\nport = 9100\n")?;
            jail.set_env("APPSPACE_MIGRATOR_SERVER__PORT", "9200");
            jail.set_env("APPSPACE_MIGRATOR_BACKUP__ENABLED", "false");

            let config = Config::load_config(jail.directory(), None);
            assert_eq!(config.server.port, 9200);
            assert!(!config.backup.enabled);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [logging]
                migrator = " LOUD "

                [scheduler]
                tick_interval_secs = 0
                subscriber_buffer = 0
                "#,
            )?;

            let config = Config::load_config(jail.directory(), None);
            assert_eq!(config.logging.migrator, "info");
            assert_eq!(config.scheduler.tick_interval_secs, 60);
            assert_eq!(config.scheduler.subscriber_buffer, 64);
            Ok(())
        });
    }

    #[test]
    fn test_log_level_is_normalized() {
        let mut logging = LoggingConfig {
            migrator: " Debug ".into(),
        };
        logging.ensure_valid();
        assert_eq!(logging.migrator, "debug");
    }

    #[test]
    fn test_unparseable_file_uses_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, "[server]\nport = \"not a port\"\n")?;
            let config = Config::load_config(jail.directory(), None);
            assert_eq!(config, Config::defaults(jail.directory()));
            Ok(())
        });
    }
}

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::fs;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read config file: {}", source))]
    FileRead { source: std::io::Error },

    #[snafu(display("Failed to parse YAML config: {}", source))]
    YamlParse { source: serde_yaml::Error },

    #[snafu(display("Config file {} lists no databases", path))]
    EmptyConfig { path: String },
}

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Connection parameters of one inspected instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

type Result<T, E = ConfigError> = std::result::Result<T, E>;

impl DbConfig {
    pub fn from_connection_params(
        host: String,
        port: u16,
        database: String,
        username: String,
        password: String,
    ) -> Self {
        Self {
            host,
            port,
            database,
            username,
            password,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn from_config_file(path: &str) -> Result<Vec<Self>> {
        let content = fs::read_to_string(path).context(FileReadSnafu)?;
        let configs: Vec<DbConfig> = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        if configs.is_empty() {
            return EmptyConfigSnafu { path }.fail();
        }
        Ok(configs)
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

//! Pipeline configuration
//!
//! Resolved once per process at startup: an optional YAML file, then
//! environment overrides, then validation. Every field has a default, so an
//! empty file (or no file) yields a runnable SQLite pipeline.

use crate::article::Stage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Postgres,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(ConfigError::Invalid(format!("unknown backend '{}'", other))),
        }
    }
}

/// Server connection settings (PostgreSQL backend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub connect_timeout_secs: u64,
    pub max_connections: u32,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            connect_timeout_secs: 3,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// SQLite database file
    pub path: PathBuf,
    pub connection: ConnectionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: default_db_path(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Get the default database path (~/.local/share/newswire/newswire.db)
pub fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    data_dir.join("newswire").join("newswire.db")
}

/// Scheduling and retry settings for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_limit: usize,
    /// Independent polling loops for this stage
    pub workers: usize,
    /// Records of one batch processed at the same time
    pub concurrency: usize,
    /// Failed attempts before a record is quarantined (0 = retry forever)
    pub max_attempts: u32,
    pub lease_secs: u64,
    pub process_timeout_secs: u64,
}

impl StageSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    fn validate(&self, stage: Stage) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::Invalid(format!("{}: {} must be > 0", stage, what)));
        if self.interval_secs == 0 {
            return invalid("interval_secs");
        }
        if self.batch_limit == 0 {
            return invalid("batch_limit");
        }
        if self.workers == 0 {
            return invalid("workers");
        }
        if self.concurrency == 0 {
            return invalid("concurrency");
        }
        if self.process_timeout_secs == 0 {
            return invalid("process_timeout_secs");
        }
        if self.lease_secs <= self.process_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "{}: lease_secs ({}) must exceed process_timeout_secs ({})",
                stage, self.lease_secs, self.process_timeout_secs
            )));
        }
        Ok(())
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_limit: 10,
            workers: 1,
            concurrency: 1,
            max_attempts: 5,
            lease_secs: 300,
            process_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub ingest: StageSettings,
    pub parse: StageSettings,
    pub categorize: StageSettings,
    pub comment: StageSettings,
}

impl StagesConfig {
    pub fn get(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Ingest => &self.ingest,
            Stage::Parse => &self.parse,
            Stage::Categorize => &self.categorize,
            Stage::Comment => &self.comment,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageSettings {
        match stage {
            Stage::Ingest => &mut self.ingest,
            Stage::Parse => &mut self.parse,
            Stage::Categorize => &mut self.categorize,
            Stage::Comment => &mut self.comment,
        }
    }
}

/// An external command speaking prompt-on-stdin, answer-on-stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorsConfig {
    /// Directory the ingest stage reads documents from
    pub spool_dir: PathBuf,
    /// Model used by the categorizer; keyword rules when absent
    pub categorizer_model: Option<ModelCommand>,
    /// Model used for commentary; lead-sentence commentary when absent
    pub commentary_model: Option<ModelCommand>,
    /// Categories offered to the categorizer model
    pub categories: Vec<String>,
}

impl Default for ProcessorsConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("spool"),
            categorizer_model: None,
            commentary_model: None,
            categories: [
                "politics",
                "business",
                "technology",
                "science",
                "health",
                "sports",
                "entertainment",
                "world",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub stages: StagesConfig,
    pub processors: ProcessorsConfig,
}

impl PipelineConfig {
    /// Read the optional YAML file, apply process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Override fields from environment-style variables.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let conn = &mut self.store.connection;
        if let Some(v) = lookup("POSTGRES_HOST") {
            conn.host = v;
        }
        if let Some(v) = lookup("POSTGRES_PORT") {
            conn.port = parse_var("POSTGRES_PORT", &v)?;
        }
        if let Some(v) = lookup("POSTGRES_DB") {
            conn.database = v;
        }
        if let Some(v) = lookup("POSTGRES_USER") {
            conn.user = v;
        }
        if let Some(v) = lookup("POSTGRES_PASSWORD") {
            conn.password = v;
        }
        if let Some(v) = lookup("NEWSWIRE_CONNECT_TIMEOUT_SECS") {
            conn.connect_timeout_secs = parse_var("NEWSWIRE_CONNECT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("NEWSWIRE_BACKEND") {
            self.store.backend = v.parse()?;
        }
        if let Some(v) = lookup("NEWSWIRE_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("NEWSWIRE_SPOOL_DIR") {
            self.processors.spool_dir = PathBuf::from(v);
        }

        for stage in Stage::ALL {
            let prefix = format!("NEWSWIRE_{}", stage.as_str().to_ascii_uppercase());
            let settings = self.stages.get_mut(stage);
            if let Some(v) = lookup(&format!("{}_INTERVAL_SECS", prefix)) {
                settings.interval_secs = parse_var(&format!("{}_INTERVAL_SECS", prefix), &v)?;
            }
            if let Some(v) = lookup(&format!("{}_BATCH_LIMIT", prefix)) {
                settings.batch_limit = parse_var(&format!("{}_BATCH_LIMIT", prefix), &v)?;
            }
            if let Some(v) = lookup(&format!("{}_WORKERS", prefix)) {
                settings.workers = parse_var(&format!("{}_WORKERS", prefix), &v)?;
            }
            if let Some(v) = lookup(&format!("{}_MAX_ATTEMPTS", prefix)) {
                settings.max_attempts = parse_var(&format!("{}_MAX_ATTEMPTS", prefix), &v)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in Stage::ALL {
            self.stages.get(stage).validate(stage)?;
        }
        if self.store.connection.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}: cannot parse '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_observed_deployment() {
        let config = PipelineConfig::default();
        assert_eq!(config.store.backend, Backend::Sqlite);
        assert_eq!(config.store.connection.host, "localhost");
        assert_eq!(config.store.connection.database, "postgres");
        assert_eq!(config.store.connection.connect_timeout(), Duration::from_secs(3));
        for stage in Stage::ALL {
            assert_eq!(config.stages.get(stage).interval(), Duration::from_secs(60));
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(PipelineConfig::from_yaml("").unwrap(), PipelineConfig::default());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = PipelineConfig::from_yaml(
            r#"
store:
  backend: postgres
  connection:
    host: db.internal
stages:
  parse:
    interval_secs: 5
    workers: 2
processors:
  categorizer_model:
    program: ollama
    args: ["run", "llama3"]
"#,
        )
        .unwrap();
        assert_eq!(config.store.backend, Backend::Postgres);
        assert_eq!(config.store.connection.host, "db.internal");
        assert_eq!(config.store.connection.user, "postgres");
        assert_eq!(config.stages.parse.interval_secs, 5);
        assert_eq!(config.stages.parse.workers, 2);
        assert_eq!(config.stages.parse.batch_limit, 10);
        assert_eq!(config.stages.comment.interval_secs, 60);
        let model = config.processors.categorizer_model.unwrap();
        assert_eq!(model.program, "ollama");
        assert_eq!(model.args, vec!["run", "llama3"]);
    }

    #[test]
    fn env_overrides_connection_and_stage_settings() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[
                ("POSTGRES_HOST", "pg"),
                ("POSTGRES_DB", "news"),
                ("POSTGRES_PASSWORD", "secret"),
                ("NEWSWIRE_BACKEND", "postgres"),
                ("NEWSWIRE_CATEGORIZE_INTERVAL_SECS", "15"),
                ("NEWSWIRE_PARSE_MAX_ATTEMPTS", "0"),
            ]))
            .unwrap();
        assert_eq!(config.store.connection.host, "pg");
        assert_eq!(config.store.connection.database, "news");
        assert_eq!(config.store.connection.password, "secret");
        assert_eq!(config.store.backend, Backend::Postgres);
        assert_eq!(config.stages.categorize.interval_secs, 15);
        assert_eq!(config.stages.parse.max_attempts, 0);
    }

    #[test]
    fn env_with_bad_number_is_rejected() {
        let mut config = PipelineConfig::default();
        let err = config.apply_env(env(&[("NEWSWIRE_INGEST_BATCH_LIMIT", "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validation_rejects_zero_interval_and_short_lease() {
        let mut config = PipelineConfig::default();
        config.stages.comment.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.stages.parse.lease_secs = 10;
        config.stages.parse.process_timeout_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/newswire.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

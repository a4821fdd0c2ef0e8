use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
}

/// Database connection settings. The SQLite deployment only uses `name`
/// (as the database filename under the data dir); host/port/user/password
/// are accepted for server-database parity and flagged at startup when set.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: String,
}

/// Immutable process-wide configuration, constructed once at startup from
/// the environment (plus `.env` via dotenvy) and passed to components.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DatabaseConfig,
    pub http_listen_addr: String,
    /// When set and different from `http_listen_addr`, a second listener
    /// serving only `/ws` is bound there.
    pub ws_listen_addr: Option<String>,
    pub data_dir: PathBuf,
    pub worktree_base_dir: PathBuf,
    pub max_concurrent_tasks_default: i64,
    pub planning_timeout: Duration,
    pub implementation_timeout: Duration,
    pub log_batch_size: usize,
    pub log_batch_interval: Duration,
    pub log_retention_days: i64,
    pub max_logs_per_execution: i64,
    pub pr_poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub grace_period: Duration,
    pub process_sample_interval: Duration,
    pub worktree_retention: Duration,
    pub ai_planner_command: String,
    pub ai_implementer_command: String,
    pub repo_provider_token: Option<String>,
    pub repo_provider_base_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: DatabaseConfig {
                name: "autodev".to_string(),
                ..Default::default()
            },
            http_listen_addr: "127.0.0.1:8080".to_string(),
            ws_listen_addr: None,
            data_dir: PathBuf::from("./data"),
            worktree_base_dir: PathBuf::from("./data/worktrees"),
            max_concurrent_tasks_default: 3,
            planning_timeout: Duration::from_secs(30 * 60),
            implementation_timeout: Duration::from_secs(60 * 60),
            log_batch_size: 100,
            log_batch_interval: Duration::from_millis(250),
            log_retention_days: 30,
            max_logs_per_execution: 10_000,
            pr_poll_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(10),
            process_sample_interval: Duration::from_secs(5),
            worktree_retention: Duration::from_secs(7 * 24 * 3600),
            ai_planner_command: "autodev-planner".to_string(),
            ai_implementer_command: "autodev-implementer".to_string(),
            repo_provider_token: None,
            repo_provider_base_url: None,
            webhook_secret: None,
        }
    }
}

impl Config {
    /// Load from `AUTODEV_*` environment variables, falling back to the
    /// defaults above. `.env` files are honored when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let db = DatabaseConfig {
            host: opt("AUTODEV_DB_HOST"),
            port: parse_opt("AUTODEV_DB_PORT")?,
            user: opt("AUTODEV_DB_USER"),
            password: opt("AUTODEV_DB_PASSWORD"),
            name: opt("AUTODEV_DB_NAME").unwrap_or(defaults.db.name),
        };
        if db.host.is_some() || db.port.is_some() || db.user.is_some() {
            tracing::warn!(
                "AUTODEV_DB_HOST/PORT/USER are set but the SQLite backend only uses AUTODEV_DB_NAME"
            );
        }

        let config = Self {
            db,
            http_listen_addr: opt("AUTODEV_HTTP_LISTEN_ADDR").unwrap_or(defaults.http_listen_addr),
            ws_listen_addr: opt("AUTODEV_WS_LISTEN_ADDR"),
            data_dir: opt("AUTODEV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            worktree_base_dir: opt("AUTODEV_WORKTREE_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.worktree_base_dir),
            max_concurrent_tasks_default: parse_opt("AUTODEV_MAX_CONCURRENT_TASKS_DEFAULT")?
                .unwrap_or(defaults.max_concurrent_tasks_default),
            planning_timeout: mins("AUTODEV_PLANNING_TIMEOUT_MINS")?
                .unwrap_or(defaults.planning_timeout),
            implementation_timeout: mins("AUTODEV_IMPLEMENTATION_TIMEOUT_MINS")?
                .unwrap_or(defaults.implementation_timeout),
            log_batch_size: parse_opt("AUTODEV_LOG_BATCH_SIZE")?.unwrap_or(defaults.log_batch_size),
            log_batch_interval: parse_opt("AUTODEV_LOG_BATCH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.log_batch_interval),
            log_retention_days: parse_opt("AUTODEV_LOG_RETENTION_DAYS")?
                .unwrap_or(defaults.log_retention_days),
            max_logs_per_execution: parse_opt("AUTODEV_MAX_LOGS_PER_EXECUTION")?
                .unwrap_or(defaults.max_logs_per_execution),
            pr_poll_interval: secs("AUTODEV_PR_POLL_INTERVAL_SECS")?
                .unwrap_or(defaults.pr_poll_interval),
            shutdown_timeout: secs("AUTODEV_SHUTDOWN_TIMEOUT_SECS")?
                .unwrap_or(defaults.shutdown_timeout),
            grace_period: secs("AUTODEV_GRACE_PERIOD_SECS")?.unwrap_or(defaults.grace_period),
            process_sample_interval: secs("AUTODEV_PROCESS_SAMPLE_INTERVAL_SECS")?
                .unwrap_or(defaults.process_sample_interval),
            worktree_retention: secs("AUTODEV_WORKTREE_RETENTION_SECS")?
                .unwrap_or(defaults.worktree_retention),
            ai_planner_command: opt("AUTODEV_AI_PLANNER_COMMAND")
                .unwrap_or(defaults.ai_planner_command),
            ai_implementer_command: opt("AUTODEV_AI_IMPLEMENTER_COMMAND")
                .unwrap_or(defaults.ai_implementer_command),
            repo_provider_token: opt("AUTODEV_REPO_PROVIDER_TOKEN"),
            repo_provider_base_url: opt("AUTODEV_REPO_PROVIDER_BASE_URL"),
            webhook_secret: opt("AUTODEV_WEBHOOK_SECRET"),
        };

        if config.max_concurrent_tasks_default < 1 {
            return Err(ConfigError::Invalid {
                key: "AUTODEV_MAX_CONCURRENT_TASKS_DEFAULT",
                value: config.max_concurrent_tasks_default.to_string(),
                reason: "must be >= 1".to_string(),
            });
        }
        if config.log_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "AUTODEV_LOG_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", self.db.name))
    }
}

fn opt(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_opt<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match opt(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn secs(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_opt::<u64>(key)?.map(Duration::from_secs))
}

fn mins(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_opt::<u64>(key)?.map(|m| Duration::from_secs(m * 60)))
}

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

// Import logging macros
use crate::{log_system_event, log_validation};

/// Complete application configuration loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LLMConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tasks: TaskConfig,
    pub logging: LoggingConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Local chat-completion endpoint configuration.
///
/// These values seed the settings document on first start; afterwards the
/// settings document is the source of truth for URL and model.
#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub api_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// On-disk locations for JSON documents, caches and uploads
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub knowledge_base_file: PathBuf,
    pub exam_template_file: PathBuf,
    pub courses_dir: PathBuf,
    pub default_course: String,
    pub max_upload_bytes: usize,
}

/// Background task pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub workers: usize,
    pub max_age_hours: i64,
    pub sweep_interval_secs: u64,
    pub batch_delay_ms: u64,
}

/// Logging system configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub log_directory: String,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Result<Self> {
        log_system_event!(config, "Loading application configuration from environment variables");

        let config = Config {
            database: DatabaseConfig::from_env()?,
            llm: LLMConfig::from_env()?,
            server: ServerConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            tasks: TaskConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        };

        log_system_event!(config, "Configuration loaded successfully");

        Ok(config)
    }

    /// Log a summary of loaded configuration (without sensitive data)
    pub fn log_summary(&self) {
        info!(
            database_url = %self.database.url,
            llm_api_url = %self.llm.api_url,
            llm_model = %self.llm.model,
            llm_api_key = %self.llm.api_key.as_deref().map(mask_sensitive_data).unwrap_or_else(|| "<none>".to_string()),
            server_address = %format!("{}:{}", self.server.host, self.server.port),
            data_dir = %self.storage.data_dir.display(),
            task_workers = self.tasks.workers,
            log_level = %self.logging.level,
            "Configuration summary"
        );
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("sqlite:") {
            return Err(anyhow!("DATABASE_URL must start with 'sqlite:'"));
        }

        if self.server.port == 0 {
            return Err(anyhow!("Server port must be greater than 0"));
        }

        if !self.llm.api_url.starts_with("http://") && !self.llm.api_url.starts_with("https://") {
            return Err(anyhow!("OLLAMA_API_URL must be an http(s) URL"));
        }

        if self.llm.max_retries == 0 {
            return Err(anyhow!("LLM_MAX_RETRIES must be at least 1"));
        }

        if self.tasks.workers == 0 {
            return Err(anyhow!("TASK_WORKERS must be at least 1"));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(anyhow!("MAX_UPLOAD_BYTES must be greater than 0"));
        }

        if !["trace", "debug", "info", "warn", "error"]
            .iter()
            .any(|level| self.logging.level.to_lowercase().starts_with(level))
        {
            warn!("Invalid log level '{}', using 'info' as fallback", self.logging.level);
        }

        log_validation!(success, "configuration", "Configuration validation completed successfully");
        Ok(())
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/database.db".to_string());

        Ok(DatabaseConfig { url })
    }
}

impl LLMConfig {
    fn from_env() -> Result<Self> {
        let api_url = env::var("OLLAMA_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:11434/api/chat".to_string());

        let model = env::var("OLLAMA_MODEL")
            .unwrap_or_else(|_| "qwen3:14b".to_string());

        let api_key = env::var("LLM_API_KEY").ok().filter(|key| !key.is_empty());

        let timeout_secs = parse_env("LLM_TIMEOUT_SECS", 60)?;
        let max_retries = parse_env("LLM_MAX_RETRIES", 3)?;

        Ok(LLMConfig {
            api_url,
            model,
            api_key,
            timeout_secs,
            max_retries,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        let port_str = env::var("PORT")
            .unwrap_or_else(|_| "5000".to_string());

        let port = port_str.parse::<u16>()
            .map_err(|_| anyhow!("Invalid PORT value: '{}'. Must be a number between 1-65535", port_str))?;

        let host = env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        Ok(ServerConfig { port, host })
    }
}

impl StorageConfig {
    fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));

        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("static/uploads"));

        let knowledge_base_file = env::var("KNOWLEDGE_BASE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("knowledge_base.json"));

        let exam_template_file = env::var("EXAM_TEMPLATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("exam_template.json"));

        let courses_dir = env::var("COURSES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("courses"));

        let default_course = env::var("DEFAULT_COURSE")
            .unwrap_or_else(|_| "Database Systems".to_string());

        let max_upload_bytes = parse_env("MAX_UPLOAD_BYTES", 16 * 1024 * 1024)?;

        Ok(StorageConfig {
            data_dir,
            upload_dir,
            knowledge_base_file,
            exam_template_file,
            courses_dir,
            default_course,
            max_upload_bytes,
        })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn explanation_cache_dir(&self) -> PathBuf {
        self.data_dir.join("explanations")
    }
}

impl TaskConfig {
    fn from_env() -> Result<Self> {
        Ok(TaskConfig {
            workers: parse_env("TASK_WORKERS", 4)?,
            max_age_hours: parse_env("TASK_MAX_AGE_HOURS", 24)?,
            sweep_interval_secs: parse_env("TASK_SWEEP_INTERVAL_SECS", 3600)?,
            batch_delay_ms: parse_env("BATCH_DELAY_MS", 1000)?,
        })
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_age_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl LoggingConfig {
    fn from_env() -> Result<Self> {
        let level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info,learning_assistant=debug".to_string());

        let file_enabled = env::var("LOG_FILE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let console_enabled = env::var("LOG_CONSOLE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let log_directory = env::var("LOG_DIRECTORY")
            .unwrap_or_else(|_| "logs".to_string());

        Ok(LoggingConfig {
            level,
            file_enabled,
            console_enabled,
            log_directory,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("Invalid {} value: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Mask sensitive data in configuration for safe logging
fn mask_sensitive_data(data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}***{}", head, tail)
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/default.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// `None` selects the process-spawn strategy
    pub redis: Option<RedisConfig>,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
    pub request_timeout_ms: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Full connection URL; overrides host/port when set
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub queue_name: String,
    pub poll_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub result_ttl_secs: u64,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("redis://{}:{}/", self.host, self.port))
    }

    /// `host:port` for log lines and status reports
    pub fn endpoint(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(100))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_ms: u64,
    pub max_concurrent: usize,
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// On-disk layout, e.g. config/default.json:
// { "api": { "port", "corsOrigins", "requestTimeout" }, "redis": { "host", "port", "queueName" } }
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    #[serde(default)]
    api: ApiSection,
    redis: Option<RedisSection>,
    #[serde(default)]
    worker: WorkerSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSection {
    port: Option<u16>,
    host: Option<String>,
    cors_origins: Option<Origins>,
    request_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Origins {
    One(String),
    Many(Vec<String>),
}

impl Origins {
    fn into_vec(self) -> Vec<String> {
        match self {
            Origins::One(origin) => vec![origin],
            Origins::Many(origins) => origins,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedisSection {
    host: Option<String>,
    port: Option<u16>,
    queue_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerSection {
    program: Option<String>,
    args: Option<Vec<String>>,
    timeout: Option<u64>,
    max_concurrent: Option<usize>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

impl Config {
    /// Defaults, then the JSON config file, then environment variables.
    ///
    /// An explicit `path` (or `GATEWAY_CONFIG`) must exist; the default
    /// `config/default.json` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("GATEWAY_CONFIG").ok().map(PathBuf::from));

        let file = match explicit {
            Some(path) => FileConfig::read(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                FileConfig::read(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => FileConfig::default(),
        };

        Self::resolve(file, |key| env::var(key).ok())
    }

    fn resolve(file: FileConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server = ServerConfig {
            port: parse_or(&lookup, "PORT", file.api.port.unwrap_or(3000))?,
            host: lookup("HOST")
                .or(file.api.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            cors_allowed_origins: match lookup("ALLOWED_ORIGINS") {
                Some(raw) => split_list(&raw, ','),
                None => file.api.cors_origins.map(Origins::into_vec).unwrap_or_else(|| {
                    vec![
                        "http://localhost:3000".to_string(),
                        "http://localhost:5173".to_string(),
                    ]
                }),
            },
            request_timeout_ms: parse_or(
                &lookup,
                "REQUEST_TIMEOUT_MS",
                file.api.request_timeout.unwrap_or(30_000),
            )?,
        };

        let url = lookup("REDIS_URL");
        let configured = file.redis.is_some() || url.is_some() || lookup("REDIS_HOST").is_some();
        let use_queue = match lookup("USE_JOB_QUEUE") {
            Some(raw) => raw
                .trim()
                .parse::<bool>()
                .with_context(|| format!("Invalid value for USE_JOB_QUEUE: {}", raw))?,
            None => configured,
        };

        let redis = if use_queue {
            let section = file.redis.unwrap_or_default();
            Some(RedisConfig {
                url,
                host: lookup("REDIS_HOST")
                    .or(section.host)
                    .unwrap_or_else(|| "localhost".to_string()),
                port: parse_or(&lookup, "REDIS_PORT", section.port.unwrap_or(6379))?,
                queue_name: lookup("REDIS_QUEUE_NAME")
                    .or(section.queue_name)
                    .unwrap_or_else(|| "adlm_queue".to_string()),
                poll_interval_ms: parse_or(&lookup, "REDIS_POLL_INTERVAL_MS", 100)?,
                health_check_interval_ms: parse_or(&lookup, "REDIS_HEALTH_CHECK_INTERVAL_MS", 5_000)?,
                result_ttl_secs: parse_or(&lookup, "REDIS_RESULT_TTL_SECS", 300)?,
            })
        } else {
            None
        };

        let worker = WorkerConfig {
            program: lookup("WORKER_PROGRAM")
                .or(file.worker.program)
                .unwrap_or_else(|| "python3".to_string()),
            args: match lookup("WORKER_ARGS") {
                Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
                None => file
                    .worker
                    .args
                    .unwrap_or_else(|| vec!["axiom_model/axiom_model_handler.py".to_string()]),
            },
            timeout_ms: parse_or(&lookup, "WORKER_TIMEOUT_MS", file.worker.timeout.unwrap_or(120_000))?,
            max_concurrent: parse_or(
                &lookup,
                "WORKER_MAX_CONCURRENT",
                file.worker.max_concurrent.unwrap_or(4),
            )?,
        };

        Ok(Self {
            server,
            redis,
            worker,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, fallback: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        None => Ok(fallback),
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

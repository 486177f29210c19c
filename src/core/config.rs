use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SEARCH_URL: &str =
    "http://eid.csrc.gov.cn/fund/disclose/advanced_search_xbrl.do";
pub const DEFAULT_INSTANCE_URL: &str =
    "http://eid.csrc.gov.cn/fund/disclose/instance_html_view.do";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub database_url: String,
    /// Portal list endpoint (DataTables-style aoData GET).
    pub search_url: String,
    /// Instance view endpoint; the only valid download entry point.
    pub instance_url: String,
    pub user_agent: String,
    /// Where downloaded artifacts land by default.
    pub data_dir: PathBuf,
    /// Root of the taxonomy trees, one subdirectory per version.
    pub taxonomy_dir: PathBuf,
    /// Directory of per-version concept mapping JSON files.
    pub mapping_dir: PathBuf,
    /// Version used when a report's schemaRef matches no known stem.
    pub default_taxonomy_version: String,
    pub worker_pool_size: usize,
    pub batch_cap: usize,
    pub download_timeout: Duration,
    pub parse_timeout: Duration,
    pub persist_timeout: Duration,
    /// Minimum spacing between portal list requests.
    pub portal_min_interval: Duration,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow!("DATABASE_URL environment variable not set"))?;

        Ok(Self {
            database_url,
            search_url: env_or("FUND_SEARCH_URL", DEFAULT_SEARCH_URL),
            instance_url: env_or("FUND_INSTANCE_URL", DEFAULT_INSTANCE_URL),
            user_agent: env_or("FUND_USER_AGENT", DEFAULT_USER_AGENT),
            data_dir: PathBuf::from(env_or("FUND_DATA_DIR", "data/reports")),
            taxonomy_dir: PathBuf::from(env_or("FUND_TAXONOMY_DIR", "data/taxonomies")),
            mapping_dir: PathBuf::from(env_or("FUND_MAPPING_DIR", "config/taxonomy")),
            default_taxonomy_version: env_or("FUND_DEFAULT_TAXONOMY", "default"),
            worker_pool_size: env_parse("FUND_WORKER_POOL", 10)?,
            batch_cap: env_parse("FUND_BATCH_CAP", 500)?,
            download_timeout: Duration::from_secs(env_parse("FUND_DOWNLOAD_TIMEOUT_SECS", 120)?),
            parse_timeout: Duration::from_secs(env_parse("FUND_PARSE_TIMEOUT_SECS", 60)?),
            persist_timeout: Duration::from_secs(env_parse("FUND_PERSIST_TIMEOUT_SECS", 30)?),
            portal_min_interval: Duration::from_millis(env_parse(
                "FUND_PORTAL_MIN_INTERVAL_MS",
                500,
            )?),
        })
    }

    /// Config for tests and embedded use; no environment required.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            instance_url: DEFAULT_INSTANCE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            data_dir: PathBuf::from("data/reports"),
            taxonomy_dir: PathBuf::from("data/taxonomies"),
            mapping_dir: PathBuf::from("config/taxonomy"),
            default_taxonomy_version: "default".to_string(),
            worker_pool_size: 10,
            batch_cap: 500,
            download_timeout: Duration::from_secs(120),
            parse_timeout: Duration::from_secs(60),
            persist_timeout: Duration::from_secs(30),
            portal_min_interval: Duration::from_millis(500),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid value for {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

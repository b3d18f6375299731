use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CROSSREF_BASE: &str = "https://api.crossref.org";
pub const DEFAULT_UNPAYWALL_BASE: &str = "https://api.unpaywall.org";

/// Run configuration, loaded from YAML. Every key except `input` may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workbook (`.xlsx` and friends) or CSV file holding the identifiers.
    #[serde(alias = "input_excel")]
    pub input: PathBuf,
    pub doi_column: String,
    /// Contact address sent to the open-access service.
    pub email: String,
    pub batch_size: usize,
    /// Maximum simultaneous Stage 1 tasks within a batch.
    pub concurrency: usize,
    pub write_after_each_batch: bool,
    /// Target substrings searched for in each PDF.
    pub strings: Vec<String>,
    pub output_dir: PathBuf,
    pub folders: FolderConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            doi_column: "doi".to_owned(),
            email: String::new(),
            batch_size: 5,
            concurrency: 5,
            write_after_each_batch: true,
            strings: Vec::new(),
            output_dir: PathBuf::from("output"),
            folders: FolderConfig::default(),
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub downloads: String,
    pub found: String,
    pub notfound: String,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            downloads: "downloads".to_owned(),
            found: "output_found".to_owned(),
            notfound: "output_notfound".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub force_refresh: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_refresh: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub max_keepalive: usize,
    pub max_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "pdfharvest/1.0".to_owned(),
            max_keepalive: 20,
            max_connections: 20,
        }
    }
}

/// Client-wide timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read: f64,
    pub connect: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read: 30.0,
            connect: 15.0,
        }
    }
}

impl TimeoutConfig {
    pub fn read_timeout(&self) -> Duration {
        seconds(self.read)
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// File name under `{output_dir}/logs`.
    pub file: String,
    pub rotate_bytes: u64,
    pub backup_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_owned(),
            file: "harvest.log".to_owned(),
            rotate_bytes: 10_485_760,
            backup_count: 5,
        }
    }
}

/// Base URLs of the metadata and open-access services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub crossref: String,
    pub unpaywall: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            crossref: DEFAULT_CROSSREF_BASE.to_owned(),
            unpaywall: DEFAULT_UNPAYWALL_BASE.to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        // An empty document deserializes to `null`, which serde_yaml rejects for structs.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml).context("deserialize config yaml")?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.input.as_os_str().is_empty() {
            anyhow::bail!("config must set `input` (the identifier workbook or CSV file)");
        }
        if self.doi_column.trim().is_empty() {
            anyhow::bail!("config `doi_column` must not be empty");
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Stage 1 admission limit: the configured concurrency, never above the
    /// connection limit of the HTTP sessions.
    pub fn stage_one_concurrency(&self) -> usize {
        let limit = match self.http.max_connections {
            0 => self.concurrency,
            max => self.concurrency.min(max),
        };
        limit.max(1)
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ABOUTME: Process configuration loaded from environment variables and an optional TOML file
// ABOUTME: Maps environment names to connection strings and holds dump, queue, and table policy settings

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PRODUCTION: &str = "production";
pub const ENV_STAGING: &str = "staging";
pub const ENV_DEV: &str = "dev";
pub const ENV_LOCALHOST: &str = "localhost";

/// Well-known environments and the variables holding their connection strings
const KNOWN_ENVIRONMENTS: [(&str, &str); 4] = [
    (ENV_PRODUCTION, "PRODUCTION_DATABASE_URL"),
    (ENV_STAGING, "STAGING_DATABASE_URL"),
    (ENV_DEV, "DEV_DATABASE_URL"),
    (ENV_LOCALHOST, "LOCALHOST_DATABASE_URL"),
];

const DEFAULT_INCLUDE_TABLES: [&str; 9] = [
    "Part",
    "Component",
    "Attribute",
    "AttributeValue",
    "Categories",
    "Pack",
    "Tag",
    "Image",
    "Option",
];

const DEFAULT_EXCLUDE_TABLES: [&str; 5] = [
    "Profile",
    "ProfileMeta",
    "List",
    "ListPart",
    "_prisma_migrations",
];

/// Named database environments, immutable once loaded
#[derive(Debug, Clone, Default)]
pub struct Environments {
    urls: BTreeMap<String, String>,
}

impl Environments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection string; empty strings leave the environment unconfigured
    pub fn insert(&mut self, name: impl Into<String>, url: impl Into<String>) {
        let url = url.into();
        if url.trim().is_empty() {
            return;
        }
        self.urls.insert(name.into(), url);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.urls.get(name).map(String::as_str)
    }

    /// Configured names: well-known environments first in fixed order, then extras sorted
    pub fn list_configured(&self) -> Vec<String> {
        let mut out: Vec<String> = KNOWN_ENVIRONMENTS
            .iter()
            .filter(|(name, _)| self.urls.contains_key(*name))
            .map(|(name, _)| name.to_string())
            .collect();
        out.extend(
            self.urls
                .keys()
                .filter(|name| !is_known_environment(name))
                .cloned(),
        );
        out
    }
}

pub fn is_known_environment(name: &str) -> bool {
    KNOWN_ENVIRONMENTS.iter().any(|(known, _)| *known == name)
}

/// Connection pool limits applied to every environment
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 25,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Which tables may cross environments
#[derive(Debug, Clone)]
pub struct TablePolicy {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for TablePolicy {
    fn default() -> Self {
        Self {
            include: DEFAULT_INCLUDE_TABLES.iter().map(|s| s.to_string()).collect(),
            exclude: DEFAULT_EXCLUDE_TABLES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Import safety settings
#[derive(Debug, Clone)]
pub struct ImportSettings {
    /// The only environment imports may write into
    pub target: String,
    pub backup_before_import: bool,
    pub backup_retention: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            target: ENV_LOCALHOST.to_string(),
            backup_before_import: true,
            backup_retention: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environments: Environments,
    pub dump_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub queue_path: PathBuf,
    pub workers: usize,
    pub pool: PoolSettings,
    pub tables: TablePolicy,
    pub import: ImportSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environments: Environments::new(),
            dump_dir: PathBuf::from("dumps"),
            backup_dir: PathBuf::from("dumps/backups"),
            queue_path: PathBuf::from("dumps/queue.sqlite3"),
            workers: 5,
            pool: PoolSettings::default(),
            tables: TablePolicy::default(),
            import: ImportSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from environment variables, then apply an optional TOML file on top
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = config_path {
            let file = load_config_file(path)?;
            config.apply_file(file)?;
        }
        Ok(config)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        for (name, var) in KNOWN_ENVIRONMENTS {
            if let Some(url) = lookup(var) {
                config.environments.insert(name, url);
            }
        }

        if let Some(dir) = lookup("SYNC_DUMP_DIR").filter(|v| !v.is_empty()) {
            config.dump_dir = PathBuf::from(dir);
            config.backup_dir = config.dump_dir.join("backups");
            config.queue_path = config.dump_dir.join("queue.sqlite3");
        }
        if let Some(dir) = lookup("SYNC_BACKUP_DIR").filter(|v| !v.is_empty()) {
            config.backup_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("SYNC_QUEUE_PATH").filter(|v| !v.is_empty()) {
            config.queue_path = PathBuf::from(path);
        }
        if let Some(workers) = lookup("SYNC_WORKERS").filter(|v| !v.is_empty()) {
            let workers: usize = workers
                .parse()
                .with_context(|| format!("Invalid SYNC_WORKERS value '{}'", workers))?;
            if workers == 0 {
                bail!("SYNC_WORKERS must be at least 1");
            }
            config.workers = workers;
        }

        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) -> Result<()> {
        for (name, url) in file.environments {
            self.environments.insert(name, url);
        }
        if let Some(dir) = file.dump_dir {
            self.dump_dir = dir;
        }
        if let Some(dir) = file.backup_dir {
            self.backup_dir = dir;
        }
        if let Some(path) = file.queue_path {
            self.queue_path = path;
        }
        if let Some(workers) = file.workers {
            if workers == 0 {
                bail!("workers must be at least 1");
            }
            self.workers = workers;
        }
        if let Some(pool) = file.pool {
            if let Some(max) = pool.max_connections {
                self.pool.max_connections = max;
            }
            if let Some(secs) = pool.connect_timeout_secs {
                self.pool.connect_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(tables) = file.tables {
            if let Some(include) = tables.include {
                self.tables.include = include;
            }
            if let Some(exclude) = tables.exclude {
                self.tables.exclude = exclude;
            }
        }
        if let Some(import) = file.import {
            if let Some(target) = import.target {
                self.import.target = target;
            }
            if let Some(backup) = import.backup_before_import {
                self.import.backup_before_import = backup;
            }
            if let Some(retention) = import.backup_retention {
                self.import.backup_retention = retention;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    environments: BTreeMap<String, String>,
    dump_dir: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    queue_path: Option<PathBuf>,
    workers: Option<usize>,
    pool: Option<PoolSection>,
    tables: Option<TablesSection>,
    import: Option<ImportSection>,
}

#[derive(Debug, Deserialize)]
struct PoolSection {
    max_connections: Option<usize>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TablesSection {
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ImportSection {
    target: Option<String>,
    backup_before_import: Option<bool>,
    backup_retention: Option<usize>,
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config_file(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_config_file(raw: &str) -> Result<ConfigFile> {
    toml::from_str(raw).context("Invalid TOML configuration")
}

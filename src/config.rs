//! Configuration for stagectl.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGECTL_HOME, STAGECTL_STORE)
//! 2. Config file (.stagectl/config.yaml)
//! 3. Defaults (~/.stagectl, file store)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stagectl/config.yaml
//! - Relative paths in the config file are resolved against its .stagectl/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::ExecutorSettings;
use crate::core::DeclaredKind;
use crate::store::StoreBackend;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const HOME_ENV: &str = "STAGECTL_HOME";
pub const STORE_ENV: &str = "STAGECTL_STORE";

const CONFIG_DIR: &str = ".stagectl";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: Option<ExecutorSettings>,
    /// Extra stage kinds on top of the built-in ones
    #[serde(default)]
    pub stage_types: Vec<DeclaredKind>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .stagectl/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub backend: Option<StoreBackend>,
    /// Store directory (file) or database file (sqlite)
    pub path: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    pub store_backend: StoreBackend,
    /// Store directory or database file
    pub store_path: PathBuf,
    pub executor: ExecutorSettings,
    pub stage_types: Vec<DeclaredKind>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Values read from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub store: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var_os(HOME_ENV).map(PathBuf::from),
            store: std::env::var(STORE_ENV).ok(),
        }
    }
}

/// Default store location for a backend
pub fn default_store_path(home: &Path, backend: StoreBackend) -> PathBuf {
    match backend {
        StoreBackend::Sqlite => home.join("pipelines.db"),
        StoreBackend::File | StoreBackend::Memory => home.join("pipelines"),
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine all sources into a resolved configuration
pub fn resolve(
    env: &EnvOverrides,
    file: Option<(&Path, &ConfigFile)>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    // Relative paths are anchored at the .stagectl/ directory
    let base = file.map(|(path, _)| path.parent().unwrap_or(Path::new(".")));
    let config = file.map(|(_, config)| config);

    let home = if let Some(ref env_home) = env.home {
        env_home.clone()
    } else if let (Some(base), Some(home)) = (base, config.and_then(|c| c.paths.home.as_deref())) {
        resolve_path(base, home)
    } else {
        default_home
    };

    let store_backend = match env.store.as_deref() {
        Some(name) => name
            .parse::<StoreBackend>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid {}", STORE_ENV))?,
        None => config.and_then(|c| c.store.backend).unwrap_or_default(),
    };

    let store_path = match (base, config.and_then(|c| c.store.path.as_deref())) {
        (Some(base), Some(path)) => resolve_path(base, path),
        _ => default_store_path(&home, store_backend),
    };

    let executor = config
        .and_then(|c| c.executor.clone())
        .unwrap_or_default();

    let stage_types = config.map(|c| c.stage_types.clone()).unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        store_backend,
        store_path,
        executor,
        stage_types,
        config_file: file.map(|(path, _)| path.to_path_buf()),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_path = find_config_file_from(&cwd);
    let config = config_path
        .as_deref()
        .map(load_config_file)
        .transpose()?;

    let file = config_path.as_deref().zip(config.as_ref());
    resolve(&EnvOverrides::from_env(), file, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

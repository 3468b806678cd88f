//! Configuration for conveyor paths and pipeline defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONVEYOR_HOME, CONVEYOR_ARTIFACTS)
//! 2. Config file (.conveyor/config.yaml)
//! 3. Defaults (~/.conveyor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conveyor/config.yaml
//! - `paths.home` is relative to the .conveyor/ directory, `paths.artifacts`
//!   to the project root (the parent of .conveyor/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

use crate::core::pipeline::{yaml_error, ConfigError, ConfigOverrides};

/// Global cached configuration. Only a successful load is cached, so a
/// failed one is reported again on the next call.
static CONFIG: OnceLock<ResolvedConfig> = OnceLock::new();

pub const CONFIG_DIR: &str = ".conveyor";
pub const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Pipeline overrides layered over the compiled-in defaults
    #[serde(default)]
    pub pipeline: ConfigOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// State and lock directory (relative to .conveyor/)
    pub home: Option<String>,
    /// Artifact directory (relative to the project root)
    pub artifacts: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Holds `state/` and `locks/`
    pub home: PathBuf,
    /// Root of the per-work-item artifact directories
    pub artifacts: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Pipeline section of the config file
    pub pipeline: ConfigOverrides,
}

impl ResolvedConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }
}

/// Path overrides from the environment
#[derive(Debug, Clone, Default)]
struct EnvPaths {
    home: Option<PathBuf>,
    artifacts: Option<PathBuf>,
}

impl EnvPaths {
    fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            home: var("CONVEYOR_HOME"),
            artifacts: var("CONVEYOR_ARTIFACTS"),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
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
pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    serde_yaml::from_str(&content).map_err(|e| yaml_error(&path.display().to_string(), &e))
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

fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env: EnvPaths,
    default_home: Option<PathBuf>,
) -> Result<ResolvedConfig, ConfigError> {
    let missing_home = || ConfigError::MissingField {
        field: "paths.home".to_string(),
    };

    match config_file {
        Some((config_path, file)) => {
            let conveyor_dir = config_path.parent().unwrap_or(Path::new("."));
            let project_root = conveyor_dir.parent().unwrap_or(Path::new("."));

            let home = match (env.home, &file.paths.home) {
                (Some(home), _) => home,
                (None, Some(home)) => resolve_path(conveyor_dir, home),
                (None, None) => default_home.ok_or_else(missing_home)?,
            };
            let artifacts = match (env.artifacts, &file.paths.artifacts) {
                (Some(artifacts), _) => artifacts,
                (None, Some(artifacts)) => resolve_path(project_root, artifacts),
                (None, None) => home.join("artifacts"),
            };

            Ok(ResolvedConfig {
                home,
                artifacts,
                config_file: Some(config_path),
                pipeline: file.pipeline,
            })
        }
        None => {
            let home = match env.home {
                Some(home) => home,
                None => default_home.ok_or_else(missing_home)?,
            };
            let artifacts = env.artifacts.unwrap_or_else(|| home.join("artifacts"));

            Ok(ResolvedConfig {
                home,
                artifacts,
                config_file: None,
                pipeline: ConfigOverrides::default(),
            })
        }
    }
}

/// Load configuration from all sources, starting discovery at `start`
pub fn load_config_from(start: &Path) -> Result<ResolvedConfig, ConfigError> {
    let config_file = match find_config_file(start) {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };
    let default_home = dirs::home_dir().map(|home| home.join(CONFIG_DIR));
    resolve(config_file, EnvPaths::from_env(), default_home)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    load_config_from(&cwd)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig, ConfigError> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let loaded = load_config()?;
    Ok(CONFIG.get_or_init(|| loaded))
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig, ConfigError> {
    load_config()
}

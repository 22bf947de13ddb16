// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Environment variable naming the install root; relative job-store paths
/// resolve against it when set.
pub const HOME_ENV: &str = "FLOWSCHED_HOME";

/// Environment variable overriding `[config].log_dir`.
pub const LOG_DIR_ENV: &str = "FLOWSCHED_LOG_DIR";

/// Load a workspace file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (dependency cycles, etc.). Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a workspace file, resolve its relative paths and validate it.
///
/// Relative paths are taken relative to the directory holding the file, so a
/// workspace behaves the same wherever the CLI is started from.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let mut raw_config = load_from_path(path)?;
    let base = config_root_dir(path);
    resolve_paths(
        &mut raw_config,
        &base,
        std::env::var_os(HOME_ENV).map(PathBuf::from),
        std::env::var_os(LOG_DIR_ENV).map(PathBuf::from),
    );
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Make every relative path of the workspace absolute.
pub fn resolve_paths(
    raw: &mut RawConfigFile,
    base: &Path,
    home: Option<PathBuf>,
    log_dir_override: Option<PathBuf>,
) {
    let anchor = |p: &Path, root: &Path| -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };

    let store_root = home.as_deref().unwrap_or(base);
    raw.config.job_store = anchor(&raw.config.job_store, store_root);

    raw.config.log_dir = match log_dir_override {
        Some(dir) => anchor(&dir, base),
        None => anchor(&raw.config.log_dir, base),
    };
    raw.config.result_root = anchor(&raw.config.result_root, base);

    for unit in &mut raw.unit {
        for task in &mut unit.task {
            for action in task.action.values_mut() {
                action.path = Some(match &action.path {
                    Some(p) => anchor(p, base),
                    None => base.to_path_buf(),
                });
            }
        }
    }
}

/// Figure out the directory relative paths are anchored to.
///
/// - If the config path has a non-empty parent (e.g. "flows/flowsched.toml"),
///   we use that directory.
/// - If it's just a bare filename (parent = ""), we fall back to the current
///   working directory.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Default workspace file: `flowsched.toml` in the current directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("flowsched.toml")
}

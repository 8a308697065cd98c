//! Pre-launch edits to a node directory: `tahoe.cfg` values and the
//! introducer list under `private/`.

mod ini;
pub mod introducers;

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

pub use introducers::{IntroducerEntry, IntroducersFile};

pub const CONFIG_FILENAME: &str = "tahoe.cfg";
pub const INTRODUCERS_FILENAME: &str = "private/introducers.yaml";

#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error("node directory {path} does not exist")]
    MissingNodeDir { path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialize {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

fn ensure_node_dir(node_dir: &Path) -> Result<(), ConfigWriteError> {
    if node_dir.is_dir() {
        Ok(())
    } else {
        Err(ConfigWriteError::MissingNodeDir {
            path: node_dir.to_path_buf(),
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigWriteError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigWriteError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write only when the contents differ, so repeated identical edits leave
/// the file untouched.
fn write_if_changed(path: &Path, previous: Option<&str>, next: &str) -> Result<(), ConfigWriteError> {
    if previous == Some(next) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigWriteError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, next).map_err(|source| ConfigWriteError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Set `key = value` under `[section]` in the node's `tahoe.cfg`.
pub fn set_config_value(
    node_dir: &Path,
    section: &str,
    key: &str,
    value: &str,
) -> Result<(), ConfigWriteError> {
    ensure_node_dir(node_dir)?;
    let path = node_dir.join(CONFIG_FILENAME);
    let previous = read_optional(&path)?;
    let next = ini::set_value(previous.as_deref().unwrap_or_default(), section, key, value);

    debug!(config = %path.display(), section, key, value, "setting node config value");
    write_if_changed(&path, previous.as_deref(), &next)
}

/// Read `key` under `[section]` from the node's `tahoe.cfg`.
pub fn get_config_value(
    node_dir: &Path,
    section: &str,
    key: &str,
) -> Result<Option<String>, ConfigWriteError> {
    ensure_node_dir(node_dir)?;
    let path = node_dir.join(CONFIG_FILENAME);
    Ok(read_optional(&path)?.and_then(|contents| ini::get_value(&contents, section, key)))
}

/// Register an introducer fURL under `name` in `private/introducers.yaml`,
/// keeping any other entries.
pub fn write_introducer_reference(
    node_dir: &Path,
    name: &str,
    furl: &str,
) -> Result<(), ConfigWriteError> {
    ensure_node_dir(node_dir)?;
    let path = node_dir.join(INTRODUCERS_FILENAME);
    let previous = read_optional(&path)?;

    let mut file = match previous.as_deref() {
        Some(contents) if !contents.trim().is_empty() => serde_yaml::from_str(contents)
            .map_err(|source| ConfigWriteError::Decode {
                path: path.clone(),
                source,
            })?,
        _ => IntroducersFile::default(),
    };
    if !file.upsert(name, furl.trim()) {
        return Ok(());
    }

    let next = serde_yaml::to_string(&file).map_err(|source| ConfigWriteError::Encode {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), name, "writing introducer reference");
    write_if_changed(&path, previous.as_deref(), &next)
}

/// Read back the introducer list, mainly for inspection and tests.
pub fn read_introducers(node_dir: &Path) -> Result<IntroducersFile, ConfigWriteError> {
    ensure_node_dir(node_dir)?;
    let path = node_dir.join(INTRODUCERS_FILENAME);
    match read_optional(&path)? {
        Some(contents) if !contents.trim().is_empty() => {
            serde_yaml::from_str(&contents).map_err(|source| ConfigWriteError::Decode { path, source })
        }
        _ => Ok(IntroducersFile::default()),
    }
}

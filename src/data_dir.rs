//! Data directory resolution.
//!
//! All collection files live under a single directory, chosen once per
//! process: the operator-mounted volume at `/data` when a write probe
//! succeeds there, otherwise a `data/` directory created under the process
//! working directory. The deployment environment does not change
//! mid-process, so the choice is cached for the process lifetime.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Preferred data directory, an operator-mounted persistent volume.
const PREFERRED_DATA_DIR: &str = "/data";

/// Name of the fallback directory created under the working directory.
const FALLBACK_DIR_NAME: &str = "data";

/// Environment variable to override the data directory location.
const DATA_DIR_ENV: &str = "JSONDB_DATA_DIR";

static RESOLVED_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Resolve the data directory, creating it if needed.
///
/// Prefers the production volume mount when writable, otherwise falls back
/// to a local directory. The first successful resolution is cached and
/// returned for every subsequent call in the process; failures are not
/// cached.
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Some(dir) = RESOLVED_DIR.get() {
        return Ok(dir.clone());
    }
    let dir = compute_data_dir()?;
    Ok(RESOLVED_DIR.get_or_init(|| dir).clone())
}

fn compute_data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        let dir = PathBuf::from(override_path);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory at {}", dir.display()))?;
        return Ok(dir);
    }
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    select_data_dir(Path::new(PREFERRED_DATA_DIR), &cwd.join(FALLBACK_DIR_NAME))
}

/// Pick the preferred directory when it passes the write probe, otherwise
/// create the fallback and select it unconditionally.
fn select_data_dir(preferred: &Path, fallback: &Path) -> Result<PathBuf> {
    if probe_writable(preferred) {
        return Ok(preferred.to_path_buf());
    }
    log::info!(
        "data directory {} not writable, using {}",
        preferred.display(),
        fallback.display()
    );
    fs::create_dir_all(fallback)
        .with_context(|| format!("Failed to create data directory at {}", fallback.display()))?;
    Ok(fallback.to_path_buf())
}

/// Probe a directory for writability with a real write-then-delete of a
/// throwaway file. A probe file that cannot be removed again counts as a
/// failed probe.
fn probe_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe = dir.join(format!(".writable-probe-{}", std::process::id()));
    if fs::write(&probe, b"probe").is_err() {
        return false;
    }
    fs::remove_file(&probe).is_ok()
}

/// Absolute path of a named collection file: `<data_dir>/<name>.json`.
pub fn collection_path(name: &str) -> Result<PathBuf> {
    Ok(resolve_data_dir()?.join(format!("{name}.json")))
}

/// Sibling subdirectory under the data root (e.g. `uploads/`).
/// Creates the directory if it doesn't exist.
pub fn data_subdir(name: &str) -> Result<PathBuf> {
    let dir = resolve_data_dir()?.join(name);
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data subdirectory at {}", dir.display()))?;
    }
    Ok(dir)
}

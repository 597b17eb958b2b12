//! Per-user locations for config and logs.
//!
//! `SHELF_CONFIG_DIR` / `SHELF_DATA_DIR` override the platform defaults,
//! which follow XDG on unix (`~/.config/shelf`, `~/.local/share/shelf`).

use std::path::PathBuf;

const APP_DIR: &str = "shelf";

fn override_dir(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn config_dir() -> PathBuf {
    if let Some(dir) = override_dir("SHELF_CONFIG_DIR") {
        return dir;
    }
    #[cfg(unix)]
    let base = dirs::home_dir().map(|h| h.join(".config"));
    #[cfg(not(unix))]
    let base = dirs::config_dir();
    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = override_dir("SHELF_DATA_DIR") {
        return dir;
    }
    #[cfg(unix)]
    let base = dirs::home_dir().map(|h| h.join(".local").join("share"));
    #[cfg(not(unix))]
    let base = dirs::data_local_dir();
    base.unwrap_or_else(std::env::temp_dir).join(APP_DIR)
}

pub fn log_path() -> PathBuf {
    data_dir().join("shelf.log")
}

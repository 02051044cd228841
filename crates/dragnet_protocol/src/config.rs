//! Path resolution for Dragnet state.
//!
//! Everything lives under `~/.dragnet/` unless overridden via environment.

use std::path::PathBuf;

/// Get the Dragnet home directory: `~/.dragnet`, or `DRAGNET_HOME`.
pub fn dragnet_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("DRAGNET_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".dragnet")
}

/// Ensure the home directory exists.
pub fn ensure_dragnet_home() -> std::io::Result<PathBuf> {
    let home = dragnet_home();
    std::fs::create_dir_all(&home)?;
    Ok(home)
}

/// Resolve the SQLite database URL.
///
/// `DRAGNET_DB` takes precedence (any sqlx-compatible sqlite URL, including
/// `sqlite::memory:`); otherwise `~/.dragnet/dragnet.sqlite3`.
pub fn database_url() -> String {
    if let Ok(url) = std::env::var("DRAGNET_DB") {
        return url;
    }
    let home = dragnet_home();
    let _ = std::fs::create_dir_all(&home);
    format!("sqlite:{}?mode=rwc", home.join("dragnet.sqlite3").display())
}

/// Directory for rolling log files.
pub fn logs_dir() -> PathBuf {
    dragnet_home().join("logs")
}

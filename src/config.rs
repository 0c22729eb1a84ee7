use std::io;
use std::path::{Path, PathBuf};

/// Resolve the writable data root for server state:
/// `${XDG_DATA_HOME:-~/.local/share}/termihui` on Linux,
/// `~/Library/Application Support/termihui` on macOS,
/// `%APPDATA%/termihui` on Windows.
pub fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
        })
        .join("termihui")
}

/// Create the data root if missing and return it.
pub fn initialize() -> io::Result<PathBuf> {
    let root = data_root();
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn server_db_path(root: &Path) -> PathBuf {
    root.join("server_state.sqlite")
}

pub fn session_db_path(root: &Path, session_id: u64) -> PathBuf {
    root.join(format!("session_{}.sqlite", session_id))
}

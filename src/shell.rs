//! Generated bash shell integration.
//!
//! The startup file makes bash bracket every command with OSC 133 markers:
//! `133;A` from a DEBUG-trap preexec, `133;B` (with exit code and cwd) from
//! `PROMPT_COMMAND`. The guard variable suppresses the spurious `133;A` the
//! DEBUG trap would fire for the precmd wrapper itself. The prompt is
//! emptied; markers provide all the structure the client needs.

use std::io;
use std::path::PathBuf;

use uuid::Uuid;

pub const INTEGRATION_SCRIPT: &str = concat!(
    "export PS1=\"\"\n",
    "__termihui_precmd() { local ec=$?; printf '\\033]133;B;exit=%s;cwd=%s\\007' \"$ec\" \"$PWD\"; }\n",
    "__termihui_precmd_wrapper() { local ec=$?; __TERMIHUI_IN_PRECMD=1; __termihui_precmd \"$ec\"; unset __TERMIHUI_IN_PRECMD; }\n",
    "__termihui_preexec() { if [[ -n \"$__TERMIHUI_IN_PRECMD\" ]]; then return; fi; if [[ \"$BASH_COMMAND\" == \"__termihui_precmd_wrapper\" || \"$BASH_COMMAND\" == \"__termihui_precmd\" ]]; then return; fi; printf '\\033]133;A;cwd=%s\\007' \"$PWD\"; }\n",
    "trap '__termihui_preexec' DEBUG\n",
    "PROMPT_COMMAND='__termihui_precmd_wrapper'\n",
);

/// A startup file written to a unique temp directory, removed when the
/// owning session terminates.
pub struct StartupFile {
    pub dir: PathBuf,
    pub path: PathBuf,
}

/// Write the integration script under a fresh
/// `$TMPDIR/termihui-bash-<uuid>/bashrc`.
pub fn write_startup_file() -> io::Result<StartupFile> {
    let dir = std::env::temp_dir().join(format!("termihui-bash-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("bashrc");
    std::fs::write(&path, INTEGRATION_SCRIPT)?;
    Ok(StartupFile { dir, path })
}

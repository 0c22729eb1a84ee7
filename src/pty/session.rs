use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::shell;

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;
type SharedExitCode = Arc<Mutex<Option<i32>>>;

/// One pseudo-terminal pair with an interactive bash inside.
///
/// A reader thread drains the master side into an ordered byte channel;
/// the tick loop polls that channel, so reads never block. Writes happen
/// only from the tick loop.
pub struct PtySession {
    master: Option<Box<dyn MasterPty + Send>>,
    child: SharedChild,
    child_pid: Option<u32>,
    writer: Box<dyn Write + Send>,
    output_rx: Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    prev_running: bool,
    exit_code: SharedExitCode,
    reader_handle: Option<std::thread::JoinHandle<()>>,
    startup_dir: Option<PathBuf>,
}

impl PtySession {
    /// Fork a new interactive bash under a PTY with shell integration.
    pub fn spawn(session_id: u64, rows: u16, cols: u16) -> anyhow::Result<Self> {
        let startup = shell::write_startup_file().context("write shell integration file")?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("open pty")?;

        #[cfg(unix)]
        disable_echo(pair.master.as_ref());

        let mut cmd = CommandBuilder::new("/bin/bash");
        cmd.arg("--noprofile");
        cmd.arg("--rcfile");
        cmd.arg(&startup.path);
        cmd.arg("-i");
        cmd.env("LANG", "en_US.UTF-8");
        cmd.env("LC_ALL", "en_US.UTF-8");
        // Prompt suppressed: the OSC 133 markers provide the structure
        cmd.env("PS1", "");
        cmd.env("BASH_SILENCE_DEPRECATION_WARNING", "1");
        cmd.env("TERM", "xterm-256color");
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        let child = pair.slave.spawn_command(cmd).context("spawn bash")?;
        drop(pair.slave);

        let child_pid = child.process_id();
        let reader = pair.master.try_clone_reader().context("clone pty reader")?;
        let writer = pair.master.take_writer().context("take pty writer")?;

        let child: SharedChild = Arc::new(Mutex::new(child));
        let running = Arc::new(AtomicBool::new(true));
        let exit_code: SharedExitCode = Arc::new(Mutex::new(None));
        let (tx, rx) = unbounded();

        let reader_handle = spawn_reader(
            session_id,
            reader,
            tx,
            Arc::clone(&child),
            Arc::clone(&running),
            Arc::clone(&exit_code),
        );

        tracing::info!(session_id, pid = ?child_pid, "spawned interactive bash session");

        Ok(Self {
            master: Some(pair.master),
            child,
            child_pid,
            writer,
            output_rx: rx,
            running,
            prev_running: true,
            exit_code,
            reader_handle: Some(reader_handle),
            startup_dir: Some(startup.dir),
        })
    }

    /// Whether output is waiting to be read.
    pub fn has_data(&self) -> bool {
        !self.output_rx.is_empty()
    }

    /// Drain all pending output in arrival order.
    pub fn read_output(&mut self) -> Vec<u8> {
        let mut output = Vec::new();
        while let Ok(chunk) = self.output_rx.try_recv() {
            output.extend_from_slice(&chunk);
        }
        output
    }

    /// Send a command line to the shell. Returns bytes written.
    pub fn execute_command(&mut self, command: &str) -> std::io::Result<usize> {
        if !self.is_running() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session is not running",
            ));
        }
        let line = format!("{}\n", command);
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(line.len())
    }

    /// Send raw bytes (keystrokes for TUI programs).
    pub fn send_input(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        if !self.is_running() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session is not running",
            ));
        }
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(bytes.len())
    }

    /// Resize the PTY window; delivers SIGWINCH to the child.
    pub fn set_window_size(&mut self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.master
            .as_ref()
            .context("pty master already closed")?
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One-shot edge detector: true exactly once, on the tick where the
    /// running flag transitions from true to false.
    pub fn did_just_finish_running(&mut self) -> bool {
        let currently_running = self.is_running();
        let just_finished = self.prev_running && !currently_running;
        self.prev_running = currently_running;
        just_finished
    }

    /// Exit code captured by the reader thread at EOF, if any.
    pub fn take_exit_code(&self) -> Option<i32> {
        self.exit_code.lock().take()
    }

    /// Working directory of the shell process; platform-specific probing,
    /// used only when no cwd marker has been seen yet.
    pub fn current_working_directory(&self) -> Option<String> {
        let pid = self.child_pid?;
        probe_cwd(pid)
    }

    /// Graceful stop: SIGTERM, a short grace period, then SIGKILL. Reaps
    /// the child and removes the startup temp dir.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        if self.is_running() {
            if let Some(pid) = self.child_pid {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                std::thread::sleep(Duration::from_millis(100));
                if self.is_running() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.lock().kill();
        }

        self.running.store(false, Ordering::Release);

        // Dropping the master closes the fd so the reader thread sees EOF
        drop(self.master.take());
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }

        // Blocking wait reaps the child after the kill escalation
        let _ = self.child.lock().wait();
        self.child_pid = None;

        if let Some(dir) = self.startup_dir.take() {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_reader(
    session_id: u64,
    mut reader: Box<dyn Read + Send>,
    tx: Sender<Vec<u8>>,
    child: SharedChild,
    running: Arc<AtomicBool>,
    exit_code: SharedExitCode,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", session_id))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::info!(session_id, "pty reader EOF, shell exited");
                        if let Ok(Some(status)) = child.lock().try_wait() {
                            *exit_code.lock() = Some(status.exit_code() as i32);
                        }
                        running.store(false, Ordering::Release);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if running.load(Ordering::Acquire) {
                            tracing::warn!(session_id, error = %e, "pty read error");
                        }
                        if let Ok(Some(status)) = child.lock().try_wait() {
                            *exit_code.lock() = Some(status.exit_code() as i32);
                        }
                        running.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn pty reader thread")
}

/// Clear local echo on the PTY so executed commands are not duplicated in
/// the output. Canonical mode is kept.
#[cfg(unix)]
fn disable_echo(master: &dyn MasterPty) {
    let Some(fd) = master.as_raw_fd() else {
        return;
    };
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) == 0 {
            tio.c_lflag &= !(libc::ECHO as libc::tcflag_t);
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                tracing::warn!("failed to clear ECHO on pty");
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn probe_cwd(pid: u32) -> Option<String> {
    let path = std::fs::read_link(format!("/proc/{}/cwd", pid)).ok()?;
    Some(path.to_string_lossy().into_owned())
}

#[cfg(target_os = "macos")]
fn probe_cwd(pid: u32) -> Option<String> {
    use std::process::Command;

    // The spawned pid may be a wrapper; prefer a direct bash child.
    let bash_pid = Command::new("sh")
        .arg("-c")
        .arg(format!("pgrep -P {} bash 2>/dev/null | head -1", pid))
        .output()
        .ok()
        .and_then(|out| {
            String::from_utf8_lossy(&out.stdout)
                .trim()
                .parse::<u32>()
                .ok()
        })
        .unwrap_or(pid);

    let output = Command::new("sh")
        .arg("-c")
        .arg(format!(
            "lsof -p {} -d cwd -Fn 2>/dev/null | grep '^n' | cut -c2-",
            bash_pid
        ))
        .output()
        .ok()?;
    let cwd = String::from_utf8_lossy(&output.stdout)
        .trim()
        .to_string();
    if cwd.is_empty() || cwd == "/" {
        return dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
    }
    Some(cwd)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn probe_cwd(_pid: u32) -> Option<String> {
    None
}

use log::debug;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_DIR: &str = "procclamp";
const LOG_FILE: &str = "monitor.log";

/// Append-only text log of lifecycle and per-process events.
///
/// Writing never fails from the caller's point of view; I/O errors are
/// dropped after a debug message.
pub struct AuditLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    /// `$XDG_STATE_HOME/procclamp/monitor.log`, or the local data dir when
    /// the platform has no state dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|dir| dir.join(LOG_DIR).join(LOG_FILE))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{}] {}\n", timestamp, message);

        let _guard = self.lock.lock();
        if let Err(e) = write_line(path, &line) {
            debug!("Dropped audit line for {}: {}", path.display(), e);
        }
    }
}

fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

use anyhow::Context;
use log::{debug, error, info, warn};
use nix::unistd::{Uid, User};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

pub const DEFAULT_PROCESSES: &[&str] = &["SGuardSvc64.exe", "SGuard64.exe"];
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

const CONFIG_DIR: &str = "procclamp";
const CONFIG_FILE: &str = "config.toml";

/// On-disk representation of the target list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub processes: Vec<String>,

    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            processes: DEFAULT_PROCESSES.iter().map(|s| s.to_string()).collect(),
            interval: DEFAULT_INTERVAL_SECS,
        }
    }
}

/// What the supervisor reads at the start of every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub names: Vec<String>,
    pub interval_secs: u64,
}

impl TargetSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Source of target names and poll interval, read fresh each cycle.
pub trait TargetSource: Send + Sync {
    fn targets(&self) -> anyhow::Result<TargetSpec>;
}

/// TOML-backed target list that falls back to the last good contents.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl ConfigStore {
    /// `$XDG_CONFIG_HOME/procclamp/config.toml`, of the invoking user when
    /// elevated through pkexec or sudo.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        debug!("Locating configuration directory");
        let config_dir = match original_user_home() {
            Some(home) => home.join(".config"),
            None => dirs::config_dir().ok_or_else(|| {
                error!("Could not find system config directory");
                anyhow::anyhow!("Could not find config directory")
            })?,
        };

        Ok(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn load_default() -> anyhow::Result<Self> {
        Ok(Self::load(Self::default_path()?))
    }

    /// Load from `path`. A missing or broken file yields the built-in
    /// defaults rather than an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("Loading configuration from: {}", path.display());

        let settings = match read_settings(&path, DEFAULT_INTERVAL_SECS) {
            Ok(settings) => {
                debug!("Configuration parsed successfully");
                debug!("  Target processes: {}", settings.processes.len());
                debug!("  Check interval: {}s", settings.interval);
                settings
            }
            Err(e) => {
                warn!("Using default configuration: {:#}", e);
                Settings::default()
            }
        };

        Self {
            path,
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached settings, without touching the file.
    pub fn settings(&self) -> Settings {
        self.current
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Re-read the file, keeping the last good settings when it can't be used.
    pub fn reload(&self) -> Settings {
        let previous = self.settings();

        let settings = match read_settings(&self.path, previous.interval) {
            Ok(settings) => settings,
            Err(e) => {
                if is_not_found(&e) {
                    debug!("No configuration file at {}", self.path.display());
                } else {
                    warn!("Keeping last good configuration: {:#}", e);
                }
                return previous;
            }
        };

        if let Ok(mut current) = self.current.write() {
            *current = settings.clone();
        }
        settings
    }

    pub fn target_names(&self) -> Vec<String> {
        self.reload().processes
    }

    pub fn interval_secs(&self) -> u64 {
        self.reload().interval
    }

    /// Persist a new target list. Names are trimmed and blanks dropped; a zero
    /// interval is rejected.
    pub fn update(&self, names: &[String], interval: u64) -> bool {
        if interval == 0 {
            error!("Check interval must be greater than zero");
            return false;
        }

        let settings = Settings {
            processes: normalize_names(names),
            interval,
        };

        match write_settings(&self.path, &settings) {
            Ok(()) => {
                info!("Saved configuration to {}", self.path.display());
                if let Ok(mut current) = self.current.write() {
                    *current = settings;
                }
                true
            }
            Err(e) => {
                error!("Failed to save configuration: {:#}", e);
                false
            }
        }
    }
}

impl TargetSource for ConfigStore {
    fn targets(&self) -> anyhow::Result<TargetSpec> {
        let settings = self.reload();
        Ok(TargetSpec {
            names: settings.processes,
            interval_secs: settings.interval,
        })
    }
}

fn original_user_home() -> Option<PathBuf> {
    // Check for original user when running under pkexec
    if let Ok(pkexec_uid) = env::var("PKEXEC_UID") {
        let uid = pkexec_uid.parse::<u32>().ok()?;
        let user = User::from_uid(Uid::from_raw(uid)).ok()??;
        return Some(user.dir);
    }

    // Check for original user when running under sudo
    if let Ok(sudo_user) = env::var("SUDO_USER") {
        let user = User::from_name(&sudo_user).ok()??;
        return Some(user.dir);
    }

    None
}

fn normalize_names(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the file at `path`. A zero interval is replaced by `fallback_interval`.
fn read_settings(path: &Path, fallback_interval: u64) -> anyhow::Result<Settings> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

    debug!("Configuration file size: {} bytes", config_str.len());

    let mut settings: Settings = toml::from_str(&config_str).map_err(|e| {
        error!("Failed to parse TOML configuration: {}", e);
        e
    })?;

    settings.processes = normalize_names(&settings.processes);

    if settings.interval == 0 {
        warn!(
            "Ignoring non-positive check interval, using {}s",
            fallback_interval
        );
        settings.interval = fallback_interval;
    }

    Ok(settings)
}

fn write_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write config file '{}'", path.display()))?;

    Ok(())
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(dir.path().join("config.toml"));

        assert_eq!(store.settings(), Settings::default());
        assert_eq!(store.target_names(), names(DEFAULT_PROCESSES));
        assert_eq!(store.interval_secs(), DEFAULT_INTERVAL_SECS);
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "processes = [unterminated").unwrap();

        let store = ConfigStore::load(&path);
        assert_eq!(store.settings(), Settings::default());
    }

    #[test]
    fn test_update_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let store = ConfigStore::load(&path);

        let wanted = names(&["  Foo.exe ", "", "Bar.exe", "Foo.exe", "   "]);
        assert!(store.update(&wanted, 12));
        assert!(path.exists());

        let reopened = ConfigStore::load(&path);
        assert_eq!(
            reopened.target_names(),
            names(&["Foo.exe", "Bar.exe", "Foo.exe"])
        );
        assert_eq!(reopened.interval_secs(), 12);
    }

    #[test]
    fn test_update_rejects_zero_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let store = ConfigStore::load(&path);

        assert!(!store.update(&names(&["Foo.exe"]), 0));
        assert!(!path.exists());
        assert_eq!(store.settings(), Settings::default());
    }

    #[test]
    fn test_targets_pick_up_external_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let store = ConfigStore::load(&path);

        fs::write(&path, "processes = [\"Game.exe\"]\ninterval = 3\n").unwrap();
        let spec = store.targets().unwrap();
        assert_eq!(spec.names, names(&["Game.exe"]));
        assert_eq!(spec.interval_secs, 3);
        assert_eq!(spec.interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_broken_edit_keeps_last_good() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let store = ConfigStore::load(&path);
        assert!(store.update(&names(&["Game.exe"]), 8));

        fs::write(&path, "interval = \"soon\"").unwrap();
        let spec = store.targets().unwrap();
        assert_eq!(spec.names, names(&["Game.exe"]));
        assert_eq!(spec.interval_secs, 8);
    }

    #[test]
    fn test_zero_interval_in_file_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let store = ConfigStore::load(&path);
        assert!(store.update(&names(&["Game.exe"]), 9));

        fs::write(&path, "processes = [\"Other.exe\"]\ninterval = 0\n").unwrap();
        let settings = store.reload();
        assert_eq!(settings.processes, names(&["Other.exe"]));
        assert_eq!(settings.interval, 9);
    }

    #[test]
    fn test_zero_interval_at_load_uses_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "processes = [\"Game.exe\"]\ninterval = 0\n").unwrap();

        let store = ConfigStore::load(&path);
        assert_eq!(store.settings().interval, DEFAULT_INTERVAL_SECS);
        assert_eq!(store.interval_secs(), DEFAULT_INTERVAL_SECS);

        let spec = store.targets().unwrap();
        assert_eq!(spec.names, names(&["Game.exe"]));
        assert_eq!(spec.interval_secs, DEFAULT_INTERVAL_SECS);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "processes = [\"Only.exe\"]\n").unwrap();

        let store = ConfigStore::load(&path);
        assert_eq!(store.settings().processes, names(&["Only.exe"]));
        assert_eq!(store.settings().interval, DEFAULT_INTERVAL_SECS);
    }
}

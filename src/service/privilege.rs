use log::{debug, info};
use std::env;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Set in the re-executed daemon so a declined prompt is not repeated.
const ELEVATED_MARKER: &str = "PROCCLAMP_ELEVATED";

/// Why the daemon carries on without root. Priority raises and other users'
/// processes then fail with `AccessDenied`.
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("elevation was already attempted and did not grant root")]
    AlreadyAttempted,

    #[error("could not locate own executable: {0}")]
    NoExecutable(#[source] std::io::Error),

    #[error("could not run pkexec: {0}")]
    Pkexec(#[source] std::io::Error),
}

pub struct Privilege;

impl Privilege {
    /// Re-exec through pkexec unless already root. Only returns when root
    /// is already held (`Ok`) or elevation is not possible (`Err`).
    pub fn elevate() -> Result<(), ElevationError> {
        if Self::is_root() {
            debug!("Already running with elevated privileges");
            return Ok(());
        }

        if env::var_os(ELEVATED_MARKER).is_some() {
            return Err(ElevationError::AlreadyAttempted);
        }

        let exe = env::current_exe().map_err(ElevationError::NoExecutable)?;
        let args: Vec<String> = env::args().skip(1).collect();

        info!("Re-executing with pkexec to adjust other users' processes");
        debug!("Current exe: {:?}, args: {:?}", exe, args);

        // pkexec drops the environment, so pass the marker through env(1)
        let error = Self::pkexec_command(&exe, &args).exec();
        Err(ElevationError::Pkexec(error))
    }

    pub fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn pkexec_command(exe: &std::path::Path, args: &[String]) -> Command {
        let mut command = Command::new("pkexec");
        command
            .arg("env")
            .arg(format!("{}=1", ELEVATED_MARKER))
            .arg(exe)
            .args(args);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_is_root_matches_euid() {
        let euid = unsafe { libc::geteuid() };
        assert_eq!(Privilege::is_root(), euid == 0);
    }

    #[test]
    fn test_pkexec_command_carries_marker_and_args() {
        let args = vec!["--config".to_string(), "/tmp/x.toml".to_string()];
        let command = Privilege::pkexec_command(Path::new("/usr/bin/procclamp-sys"), &args);

        assert_eq!(command.get_program(), "pkexec");
        let got: Vec<_> = command.get_args().collect();
        assert_eq!(
            got,
            vec![
                "env",
                "PROCCLAMP_ELEVATED=1",
                "/usr/bin/procclamp-sys",
                "--config",
                "/tmp/x.toml",
            ]
        );
    }

    #[test]
    fn test_second_attempt_reports_reason() {
        if Privilege::is_root() {
            assert!(Privilege::elevate().is_ok());
            return;
        }

        // Pretend this process is the re-executed daemon
        unsafe {
            env::set_var(ELEVATED_MARKER, "1");
        }
        let err = Privilege::elevate().unwrap_err();
        assert!(matches!(err, ElevationError::AlreadyAttempted));
        assert!(err.to_string().contains("already attempted"));
    }
}

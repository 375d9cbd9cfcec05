use crate::service::policy::{CpuSelector, Priority};
use log::{debug, trace};
use nix::errno::Errno;
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use procfs::ProcError;
use procfs::process::{ProcState, Process, all_processes_with_root};
use std::path::PathBuf;

/// The kernel truncates `comm` to this many bytes.
const COMM_LEN: usize = 15;

/// A live process as seen at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
}

impl ProcessHandle {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("process {0} has exited")]
    Exited(u32),

    #[error("access denied for process {0}")]
    AccessDenied(u32),

    #[error("process {0} is a zombie")]
    Zombie(u32),

    #[error("unexpected OS error for process {pid}: {errno}")]
    Os { pid: u32, errno: Errno },

    #[error("failed to inspect process {pid}: {source}")]
    Procfs {
        pid: u32,
        #[source]
        source: ProcError,
    },
}

impl MutationError {
    pub fn from_errno(pid: u32, errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => MutationError::Exited(pid),
            Errno::EPERM | Errno::EACCES => MutationError::AccessDenied(pid),
            errno => MutationError::Os { pid, errno },
        }
    }

    pub fn from_proc_error(pid: u32, err: ProcError) -> Self {
        if let ProcError::Io(e, _) = &err {
            if let Some(code) = e.raw_os_error() {
                return MutationError::from_errno(pid, Errno::from_raw(code));
            }
        }

        match err {
            // Incomplete means the entry vanished while being read
            ProcError::NotFound(_) | ProcError::Incomplete(_) => MutationError::Exited(pid),
            ProcError::PermissionDenied(_) => MutationError::AccessDenied(pid),
            source => MutationError::Procfs { pid, source },
        }
    }

    /// Exited, denied and zombie processes are part of normal operation.
    /// Anything else points at a real fault.
    pub fn is_tolerated(&self) -> bool {
        !matches!(
            self,
            MutationError::Os { .. } | MutationError::Procfs { .. }
        )
    }
}

/// Finds processes by name and adjusts their scheduling.
pub trait ProcessInspector: Send + Sync {
    fn core_count(&self) -> usize;

    fn last_core_index(&self) -> usize {
        self.core_count().saturating_sub(1)
    }

    /// Every live process whose name equals `name` exactly.
    fn find(&self, name: &str) -> Vec<ProcessHandle>;

    fn set_priority(&self, handle: &ProcessHandle, level: Priority) -> Result<(), MutationError>;

    /// Applies the resolved core set and returns it.
    fn set_affinity(
        &self,
        handle: &ProcessHandle,
        selector: CpuSelector,
    ) -> Result<Vec<usize>, MutationError>;
}

/// Host inspector backed by procfs and the scheduler syscalls.
pub struct ProcfsInspector {
    proc_root: PathBuf,
    core_count: usize,
}

impl ProcfsInspector {
    pub fn new() -> Self {
        Self::with_core_count(host_core_count())
    }

    pub fn with_core_count(core_count: usize) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            core_count: core_count.max(1),
        }
    }

    /// Scan an alternative procfs tree.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Check that `handle` still names the process it was discovered as.
    fn ensure_alive(&self, handle: &ProcessHandle) -> Result<(), MutationError> {
        let pid = handle.pid;
        let lost = |e: ProcError| MutationError::from_proc_error(pid, e);

        let process = Process::new_with_root(self.proc_root.join(pid.to_string())).map_err(lost)?;
        let stat = process.stat().map_err(lost)?;

        if stat.state().map_err(lost)? == ProcState::Zombie {
            return Err(MutationError::Zombie(pid));
        }

        // A recycled PID belongs to somebody else
        if display_name(&process, stat.comm) != handle.name {
            return Err(MutationError::Exited(pid));
        }
        Ok(())
    }
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for ProcfsInspector {
    fn core_count(&self) -> usize {
        self.core_count
    }

    fn find(&self, name: &str) -> Vec<ProcessHandle> {
        let processes = match all_processes_with_root(&self.proc_root) {
            Ok(processes) => processes,
            Err(e) => {
                debug!("Failed to read {}: {}", self.proc_root.display(), e);
                return Vec::new();
            }
        };

        let mut found: Vec<ProcessHandle> = processes
            .flatten()
            .filter_map(|process| {
                let pid = u32::try_from(process.pid).ok()?;
                // Gone or unreadable entries simply don't match
                let comm = process.stat().ok()?.comm;
                let proc_name = display_name(&process, comm);
                (proc_name == name).then(|| ProcessHandle::new(pid, proc_name))
            })
            .collect();

        found.sort_by_key(|handle| handle.pid);
        trace!("Scan for '{}' matched {} processes", name, found.len());
        found
    }

    fn set_priority(&self, handle: &ProcessHandle, level: Priority) -> Result<(), MutationError> {
        self.ensure_alive(handle)?;

        let nice = level.nice();
        debug!("Setting nice {} ({}) on PID {}", nice, level, handle.pid);

        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, handle.pid as libc::id_t, nice) };
        if ret == -1 {
            return Err(MutationError::from_errno(handle.pid, Errno::last()));
        }

        Ok(())
    }

    fn set_affinity(
        &self,
        handle: &ProcessHandle,
        selector: CpuSelector,
    ) -> Result<Vec<usize>, MutationError> {
        self.ensure_alive(handle)?;

        let cores = selector.resolve(self.core_count);
        debug!("Pinning PID {} to cores {:?}", handle.pid, cores);

        let mut cpu_set = CpuSet::new();
        for &core in &cores {
            cpu_set
                .set(core)
                .map_err(|errno| MutationError::from_errno(handle.pid, errno))?;
        }

        sched_setaffinity(Pid::from_raw(handle.pid as i32), &cpu_set)
            .map_err(|errno| MutationError::from_errno(handle.pid, errno))?;

        Ok(cores)
    }
}

/// Number of online cores, never less than one.
pub fn host_core_count() -> usize {
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 {
        return online as usize;
    }

    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Process name the way `ps` tools report it: `comm`, extended from
/// `argv[0]` when the kernel truncated it.
fn display_name(process: &Process, comm: String) -> String {
    if comm.len() < COMM_LEN {
        return comm;
    }

    let argv0 = process
        .cmdline()
        .ok()
        .and_then(|args| args.into_iter().next())
        .unwrap_or_default();

    // Wine passes Windows paths through argv[0]
    let base = argv0
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    if base.len() > comm.len() && base.starts_with(&comm) {
        base.to_string()
    } else {
        comm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// A full `stat` line: pid, comm, state, then ppid and 48 zeroed fields.
    fn stat_line(pid: u32, comm: &str, state: char) -> String {
        format!("{} ({}) {} 1{}\n", pid, comm, state, " 0".repeat(48))
    }

    fn fake_process_in_state(root: &Path, pid: u32, comm: &str, cmdline: &[&str], state: char) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
        let mut args = cmdline.join("\0");
        if !args.is_empty() {
            args.push('\0');
        }
        fs::write(dir.join("cmdline"), args).unwrap();
        fs::write(dir.join("stat"), stat_line(pid, comm, state)).unwrap();
    }

    fn fake_process(root: &Path, pid: u32, comm: &str, cmdline: &[&str]) {
        fake_process_in_state(root, pid, comm, cmdline, 'S');
    }

    fn fake_proc() -> TempDir {
        let root = TempDir::new().unwrap();
        fake_process(root.path(), 102, "Foo.exe", &["Foo.exe"]);
        fake_process(root.path(), 100, "Foo.exe", &["C:\\Games\\Foo.exe"]);
        fake_process(root.path(), 101, "foo.exe", &["foo.exe"]);
        fake_process(
            root.path(),
            200,
            "SomeLongProcess",
            &["C:\\Program Files\\SomeLongProcessName.exe", "-silent"],
        );
        fake_process(root.path(), 201, "kworker/0:1-eve", &[]);

        // Entry without a stat file, as if the process vanished mid-scan
        fs::create_dir_all(root.path().join("300")).unwrap();
        fs::create_dir_all(root.path().join("self")).unwrap();
        root
    }

    #[test]
    fn test_find_exact_case_sensitive_match() {
        let root = fake_proc();
        let inspector = ProcfsInspector::with_core_count(4).with_proc_root(root.path());

        let found = inspector.find("Foo.exe");
        let pids: Vec<u32> = found.iter().map(|h| h.pid).collect();
        assert_eq!(pids, vec![100, 102]);
        assert!(found.iter().all(|h| h.name == "Foo.exe"));

        assert!(inspector.find("Foo").is_empty());
        assert!(inspector.find("oo.exe").is_empty());
        assert!(inspector.find("Missing.exe").is_empty());
    }

    #[test]
    fn test_find_expands_truncated_comm() {
        let root = fake_proc();
        let inspector = ProcfsInspector::with_core_count(4).with_proc_root(root.path());

        let found = inspector.find("SomeLongProcessName.exe");
        assert_eq!(found, vec![ProcessHandle::new(200, "SomeLongProcessName.exe")]);
        assert!(inspector.find("SomeLongProcess").is_empty());

        // Kernel threads have an empty cmdline and keep their comm
        assert_eq!(inspector.find("kworker/0:1-eve").len(), 1);
    }

    #[test]
    fn test_find_with_missing_proc_root() {
        let inspector = ProcfsInspector::with_core_count(2).with_proc_root("/nonexistent/proc");
        assert!(inspector.find("anything").is_empty());
    }

    #[test]
    fn test_core_count_derivations() {
        let inspector = ProcfsInspector::with_core_count(8);
        assert_eq!(inspector.core_count(), 8);
        assert_eq!(inspector.last_core_index(), 7);

        let inspector = ProcfsInspector::with_core_count(0);
        assert_eq!(inspector.core_count(), 1);
        assert_eq!(inspector.last_core_index(), 0);

        assert!(host_core_count() >= 1);
    }

    #[test]
    fn test_fake_zombie_and_vanished_entries() {
        let root = fake_proc();
        fake_process_in_state(root.path(), 400, "Foo.exe", &["Foo.exe"], 'Z');
        let inspector = ProcfsInspector::with_core_count(4).with_proc_root(root.path());

        let zombie = ProcessHandle::new(400, "Foo.exe");
        assert!(matches!(
            inspector.set_priority(&zombie, Priority::Idle),
            Err(MutationError::Zombie(400))
        ));

        // Directory present but its files are gone
        let vanished = ProcessHandle::new(300, "Foo.exe");
        let err = inspector.set_priority(&vanished, Priority::Idle).unwrap_err();
        assert!(matches!(err, MutationError::Exited(300)));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            MutationError::from_errno(1, Errno::ESRCH),
            MutationError::Exited(1)
        ));
        assert!(matches!(
            MutationError::from_errno(1, Errno::EPERM),
            MutationError::AccessDenied(1)
        ));
        assert!(MutationError::from_errno(1, Errno::EACCES).is_tolerated());
        assert!(MutationError::Zombie(1).is_tolerated());

        assert!(matches!(
            MutationError::from_proc_error(1, ProcError::NotFound(None)),
            MutationError::Exited(1)
        ));
        assert!(matches!(
            MutationError::from_proc_error(1, ProcError::PermissionDenied(None)),
            MutationError::AccessDenied(1)
        ));
        let odd = MutationError::from_proc_error(1, ProcError::Other("bad stat".into()));
        assert!(!odd.is_tolerated());

        let fault = MutationError::from_errno(1, Errno::EINVAL);
        assert!(!fault.is_tolerated());
    }

    #[test]
    fn test_stale_handle_reports_exited() {
        let root = fake_proc();
        let inspector = ProcfsInspector::with_core_count(4).with_proc_root(root.path());

        let gone = ProcessHandle::new(999_999, "Foo.exe");
        assert!(matches!(
            inspector.set_priority(&gone, Priority::Idle),
            Err(MutationError::Exited(999_999))
        ));
        assert!(inspector.set_affinity(&gone, CpuSelector::Unset).is_err());

        // Same PID, different name: the PID was recycled
        let recycled = ProcessHandle::new(101, "Foo.exe");
        assert!(matches!(
            inspector.set_affinity(&recycled, CpuSelector::All),
            Err(MutationError::Exited(101))
        ));
    }

    #[test]
    fn test_mutates_live_child_process() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();

        let inspector = ProcfsInspector::new();
        let handle = inspector
            .find("sleep")
            .into_iter()
            .find(|h| h.pid == pid)
            .expect("spawned child should be discoverable");

        // Raising nice and widening affinity need no privileges
        assert!(inspector.set_priority(&handle, Priority::Idle).is_ok());
        let cores = inspector.set_affinity(&handle, CpuSelector::All).unwrap();
        assert_eq!(cores.len(), inspector.core_count());

        child.kill().unwrap();
        child.wait().unwrap();

        let err = inspector.set_priority(&handle, Priority::Idle).unwrap_err();
        assert!(matches!(err, MutationError::Exited(_)));
        assert!(err.is_tolerated());
    }

    #[test]
    fn test_zombie_process_is_rejected() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let state = Process::new(pid as i32)
                .and_then(|p| p.stat())
                .and_then(|stat| stat.state());
            if matches!(state, Ok(ProcState::Zombie)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let inspector = ProcfsInspector::new();
        let handle = ProcessHandle::new(pid, "true");
        let result = inspector.set_priority(&handle, Priority::Idle);
        assert!(matches!(result, Err(MutationError::Zombie(p)) if p == pid));

        child.wait().unwrap();
    }
}

//! OS-level process helpers: console suppression, liveness probing,
//! graceful signalling and process-tree teardown.

use crate::error::TerminationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Extension trait for launching game and helper processes
pub trait KilnCommandExt {
    /// Hides the console window on Windows. No-op on other platforms.
    fn suppress_console(&mut self) -> &mut Self;

    /// Routes stdin/stdout/stderr to null so the child never blocks on a pipe
    /// nobody drains.
    fn null_stdio(&mut self) -> &mut Self;
}

impl KilnCommandExt for tokio::process::Command {
    fn suppress_console(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }

    fn null_stdio(&mut self) -> &mut Self {
        use std::process::Stdio;
        self.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
    }
}

/// Result of probing a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Dead,
    /// The OS refused to answer (e.g. permission denied). Callers treat this
    /// as alive and re-check later.
    Unknown,
}

/// What distinguishes one process from a later one that reused its pid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIdentity {
    /// Seconds since the epoch, as reported by the OS
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
}

impl ProcessIdentity {
    /// Start times must agree. Executables are only compared when both sides
    /// could read one.
    pub fn matches(&self, current: &ProcessIdentity) -> bool {
        if self.start_time != current.start_time {
            return false;
        }
        match (&self.executable, &current.executable) {
            (Some(recorded), Some(now)) => recorded == now,
            _ => true,
        }
    }
}

/// Read the identity of a live pid. `None` if it is gone or unreadable.
pub fn process_identity(pid: u32) -> Option<ProcessIdentity> {
    let mut system = System::new();
    let spid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[spid]),
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::Always),
    );
    system.process(spid).map(|process| ProcessIdentity {
        start_time: process.start_time(),
        executable: process.exe().map(|path| path.to_path_buf()),
    })
}

#[cfg(unix)]
pub fn pid_liveness(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    // pid 0 and anything above i32::MAX would address process groups
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Liveness::Dead,
    };

    match kill(NixPid::from_raw(raw), None) {
        Ok(()) if is_zombie(pid) => Liveness::Dead,
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(err) => {
            log::debug!("Liveness check for pid {} inconclusive: {}", pid, err);
            Liveness::Unknown
        }
    }
}

// An exited-but-unreaped child still answers signal 0
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    let mut system = System::new();
    let spid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
    matches!(
        system.process(spid).map(|p| p.status()),
        Some(sysinfo::ProcessStatus::Zombie) | Some(sysinfo::ProcessStatus::Dead)
    )
}

#[cfg(not(unix))]
pub fn pid_liveness(pid: u32) -> Liveness {
    let mut system = System::new();
    let spid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
    if system.process(spid).is_some() {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}

/// Ask a process to shut itself down (SIGTERM / WM_CLOSE)
pub async fn terminate_pid(pid: u32) -> Result<(), TerminationError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        let raw = i32::try_from(pid).map_err(|_| TerminationError::Signal {
            pid,
            message: "pid out of range".to_string(),
        })?;
        kill(NixPid::from_raw(raw), Signal::SIGTERM).map_err(|e| TerminationError::Signal {
            pid,
            message: e.to_string(),
        })
    }

    #[cfg(windows)]
    {
        // Without /F taskkill posts WM_CLOSE to the process windows
        let output = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .suppress_console()
            .output()
            .await
            .map_err(|e| TerminationError::Helper {
                pid,
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TerminationError::Helper {
                pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(TerminationError::Signal {
            pid,
            message: "graceful termination unsupported on this platform".to_string(),
        })
    }
}

/// Force-kill a single pid
pub fn kill_pid(pid: u32) -> Result<(), TerminationError> {
    let mut system = System::new();
    let spid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
    match system.process(spid) {
        // Already gone: nothing to kill
        None => Ok(()),
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(TerminationError::Signal {
            pid,
            message: "kill request was rejected".to_string(),
        }),
    }
}

/// Force-kill every descendant of `root`, deepest first. The root itself is
/// left alone; its owner kills it through the child handle.
///
/// Returns how many descendants were killed.
pub fn kill_descendants(root: u32) -> Result<usize, TerminationError> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    // Breadth-first walk, then reverse so leaves go first
    let mut order = Vec::new();
    let mut frontier = vec![Pid::from_u32(root)];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                order.push(*kid);
                frontier.push(*kid);
            }
        }
    }
    order.reverse();

    let mut killed = 0;
    let mut failed = Vec::new();
    for pid in order {
        match system.process(pid) {
            Some(process) if process.kill() => killed += 1,
            Some(_) => failed.push(pid.as_u32()),
            None => {}
        }
    }

    if failed.is_empty() {
        Ok(killed)
    } else {
        Err(TerminationError::Signal {
            pid: root,
            message: format!("could not kill descendants {:?}", failed),
        })
    }
}

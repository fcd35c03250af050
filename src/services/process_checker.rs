use sysinfo::{Pid, ProcessStatus as OsProcessStatus, ProcessesToUpdate, System};

/// 检查进程是否存活
///
/// On Unix a zero signal confirms the pid exists (`EPERM` still means it does).
/// sysinfo then rules out zombies, which answer signals until they are reaped.
pub fn probe_liveness(pid: u32) -> Result<(), String> {
    #[cfg(unix)]
    signal_probe(pid)?;

    let mut sys = System::new();
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);

    match sys.process(sysinfo_pid) {
        Some(process) => match process.status() {
            OsProcessStatus::Zombie | OsProcessStatus::Dead => {
                Err(format!("PID {} is {}", pid, process.status()))
            }
            _ => Ok(()),
        },
        // the signal already confirmed existence; sysinfo may lack visibility
        None if cfg!(unix) => Ok(()),
        None => Err(format!("PID {} not found", pid)),
    }
}

#[cfg(unix)]
fn signal_probe(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid).map_err(|_| format!("PID {} out of range", pid))?;

    match kill(NixPid::from_raw(raw), None::<Signal>) {
        Ok(()) | Err(Errno::EPERM) => Ok(()),
        Err(errno) => Err(format!("signal 0 to PID {} failed: {}", pid, errno)),
    }
}

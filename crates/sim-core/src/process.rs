use sysinfo::{Pid, ProcessStatus, Signal, System};

/// Liveness of an OS process by pid. Zombies count as dead: they hold no
/// work, only an exit status nobody has collected yet.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return false;
    }
    match sys.process(pid) {
        Some(p) => !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Sends SIGTERM (or the platform's closest equivalent). Returns whether a
/// signal was delivered.
pub fn terminate_pid(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return false;
    }
    match sys.process(pid) {
        Some(p) => p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()),
        None => false,
    }
}

//! Process-table helpers built on `sysinfo`.
//!
//! Liveness is answered from the OS process table. Cancellation kills the
//! whole tree, including workers forked by the inference toolchain.

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Whether `pid` names a live (non-zombie) process.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// All descendants of `root`, parents before children.
fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.thread_kind().is_some() || *pid == root {
                continue;
            }
            if process.parent() == Some(parent) && !found.contains(pid) {
                found.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    found
}

/// Forcefully kill `pid` and every process below it, deepest first.
///
/// Returns the number of processes a kill was delivered to. A pid that no
/// longer exists is not an error.
pub fn kill_process_tree(pid: u32) -> usize {
    let root = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    if system.process(root).is_none() {
        debug!(pid, "Process already gone, nothing to kill");
        return 0;
    }

    let mut killed = 0;
    for child in descendants(&system, root).iter().rev() {
        if system.process(*child).is_some_and(|p| p.kill()) {
            killed += 1;
        }
    }
    if system.process(root).is_some_and(|p| p.kill()) {
        killed += 1;
    }
    debug!(pid, killed, "Killed process tree");
    killed
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_kill_missing_pid_is_noop() {
        // pid_max on Linux is at most 2^22
        assert_eq!(kill_process_tree(u32::MAX - 7), 0);
    }

    #[test]
    fn test_kill_tree_reaches_grandchildren() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id();

        let mut system = System::new();
        assert!(wait_until(Duration::from_secs(5), || {
            system.refresh_processes(ProcessesToUpdate::All, true);
            descendants(&system, Pid::from_u32(pid)).len() >= 2
        }));
        let grandchildren = descendants(&system, Pid::from_u32(pid));

        assert!(kill_process_tree(pid) >= 3);
        child.wait().unwrap();
        assert!(!process_alive(pid));
        for gc in grandchildren {
            assert!(wait_until(Duration::from_secs(5), || !process_alive(gc.as_u32())));
        }
    }
}

//! OS-level process probes and signalling.

/// Signals the supervisor sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Whether `pid` refers to a live, non-zombie process.
///
/// `kill(pid, 0)` failing with `EPERM` means the process exists but belongs to
/// someone else, which still counts as alive. A zombie has exited and is only
/// waiting to be reaped, so it counts as dead.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    let result = unsafe { libc::kill(raw, 0) };
    if result != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }

    !is_zombie(pid)
}

/// Reads the state field of `/proc/<pid>/stat`. Always `false` where procfs
/// is unavailable.
pub fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name is parenthesised and may itself contain spaces or ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Send `signal` to every process in group `pgid`. Returns whether the
/// signal was delivered.
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    match libc::pid_t::try_from(pgid) {
        Ok(raw) if raw > 1 => unsafe { libc::killpg(raw, signal.raw()) == 0 },
        _ => false,
    }
}

pub fn signal_pid(pid: u32, signal: Signal) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => unsafe { libc::kill(raw, signal.raw()) == 0 },
        _ => false,
    }
}

/// Signal the group, falling back to the bare pid when the group is gone or
/// was never recorded.
pub fn terminate(pid: u32, pgid: Option<u32>, signal: Signal) -> bool {
    if let Some(pgid) = pgid {
        if signal_group(pgid, signal) {
            return true;
        }
    }
    signal_pid(pid, signal)
}

/// Conventional name for a terminating signal number.
pub fn signal_name(signo: i32) -> String {
    match signo {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGUSR1 => "SIGUSR1".to_string(),
        libc::SIGUSR2 => "SIGUSR2".to_string(),
        other => format!("SIG{}", other),
    }
}

use std::io;
use std::path::Path;

/// Fields of interest from /proc/[pid]/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Scheduler state (field 3); `Z` is a zombie awaiting its parent.
    pub state: char,
    /// Process start time in clock ticks since boot (field 22).
    pub starttime: u64,
    /// User-mode CPU time in clock ticks (field 14).
    pub utime: u64,
    /// Kernel-mode CPU time in clock ticks (field 15).
    pub stime: u64,
}

impl ProcStat {
    pub fn cpu_ticks(&self) -> u64 {
        self.utime.saturating_add(self.stime)
    }
}

/// Parse the content of /proc/[pid]/stat.
///
/// The command name (field 2) may contain spaces and parentheses, so parsing
/// starts after the last `)`.
pub fn parse_proc_stat(content: &str) -> io::Result<ProcStat> {
    let after_comm = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| invalid("missing command terminator in stat"))?;
    // Index 0 here is field 3 (state).
    let parts: Vec<&str> = after_comm.split_whitespace().collect();

    let field = |index: usize, name: &str| -> io::Result<u64> {
        parts
            .get(index)
            .ok_or_else(|| invalid(&format!("missing {} field in stat", name)))?
            .parse::<u64>()
            .map_err(|err| invalid(&format!("failed to parse {}: {}", name, err)))
    };

    let state = parts
        .first()
        .and_then(|raw| raw.chars().next())
        .ok_or_else(|| invalid("missing state field in stat"))?;

    Ok(ProcStat {
        state,
        utime: field(11, "utime")?,
        stime: field(12, "stime")?,
        starttime: field(19, "starttime")?,
    })
}

#[cfg(target_family = "unix")]
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let content = std::fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_proc_stat(&content)
}

#[cfg(not(target_family = "unix"))]
pub fn read_proc_stat(_pid: u32) -> io::Result<ProcStat> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "/proc is not available on this platform",
    ))
}

/// Resident set size in kilobytes, from the `VmRSS:` line of /proc/[pid]/status.
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<u64>().ok())
}

#[cfg(target_family = "unix")]
pub fn read_rss_kb(pid: u32) -> io::Result<u64> {
    let content = std::fs::read_to_string(format!("/proc/{}/status", pid))?;
    parse_vm_rss_kb(&content).ok_or_else(|| invalid("VmRSS not reported"))
}

#[cfg(not(target_family = "unix"))]
pub fn read_rss_kb(_pid: u32) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "/proc is not available on this platform",
    ))
}

/// Kernel clock ticks per second (USER_HZ).
#[cfg(target_family = "unix")]
pub fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100
    } else {
        ticks as u64
    }
}

#[cfg(not(target_family = "unix"))]
pub fn clock_ticks_per_second() -> u64 {
    100
}

/// Check if process exists using `/proc`.
#[cfg(target_family = "unix")]
pub fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_family = "unix"))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// True when `pid` is alive and still the process that was recorded with
/// `expected_start_ticks` (guards against PID reuse). A zombie is dead.
pub fn pid_matches(pid: u32, expected_start_ticks: Option<u64>) -> bool {
    if pid == 0 || !process_exists(pid) {
        return false;
    }
    match read_proc_stat(pid) {
        Ok(stat) => {
            stat.state != 'Z' && expected_start_ticks.map_or(true, |ticks| stat.starttime == ticks)
        }
        Err(_) => expected_start_ticks.is_none(),
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_STAT: &str = "4242 (dev server (x)) S 1 4242 4242 0 -1 4194560 1234 0 0 0 \
        250 75 0 0 20 0 4 0 987654 123456789 2048 18446744073709551615";

    #[test]
    fn parses_stat_with_parenthesised_comm() {
        let stat = parse_proc_stat(SAMPLE_STAT).expect("parse stat");
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 75);
        assert_eq!(stat.starttime, 987654);
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.cpu_ticks(), 325);
    }

    #[test]
    fn rejects_truncated_stat() {
        assert!(parse_proc_stat("12 (sh) S 1 2").is_err());
        assert!(parse_proc_stat("garbage").is_err());
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tnode\nVmPeak:\t  900 kB\nVmRSS:\t  51200 kB\nThreads:\t9\n";
        assert_eq!(parse_vm_rss_kb(status), Some(51200));
        assert_eq!(parse_vm_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn current_process_matches_its_own_start_ticks() {
        let pid = std::process::id();
        let stat = read_proc_stat(pid).expect("read own stat");
        assert!(process_exists(pid));
        assert!(pid_matches(pid, Some(stat.starttime)));
        assert!(!pid_matches(pid, Some(stat.starttime + 1)));
        assert!(read_rss_kb(pid).expect("rss") > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreaped_child_does_not_match() {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        let mut zombie = false;
        for _ in 0..100 {
            if read_proc_stat(pid).map(|stat| stat.state == 'Z').unwrap_or(false) {
                zombie = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(zombie, "child never became a zombie");
        assert!(process_exists(pid));
        assert!(!pid_matches(pid, None));
        child.wait().expect("reap");
    }

    #[test]
    fn pid_zero_never_matches() {
        assert!(!pid_matches(0, None));
    }
}

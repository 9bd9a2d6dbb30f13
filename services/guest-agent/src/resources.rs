//! Process memory sampling.
//!
//! The agent watches its own resident set size and exits when it crosses the
//! configured limit, leaving the daemon to relaunch it fresh. Sampling reads
//! `/proc/self/status` directly; there is no cgroup dependency.

use std::io;
use std::time::{Duration, Instant};

/// Resident set size of the current process, in bytes.
#[cfg(target_os = "linux")]
pub fn rss_bytes() -> io::Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    parse_vm_rss(&status).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "VmRSS not present in /proc/self/status",
        )
    })
}

#[cfg(not(target_os = "linux"))]
pub fn rss_bytes() -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "memory sampling requires /proc",
    ))
}

fn parse_vm_rss(content: &str) -> Option<u64> {
    const KB_TO_BYTES: u64 = 1024;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("VmRSS:") {
            return parts.next()?.parse::<u64>().ok().map(|kb| kb * KB_TO_BYTES);
        }
    }
    None
}

/// One RSS measurement against the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    pub fn exceeded(&self) -> bool {
        self.rss_bytes > self.limit_bytes
    }
}

/// Periodic RSS limit check.
///
/// The first check is deferred so a just-launched agent can finish its
/// startup allocations before being judged.
pub struct MemoryCheck {
    limit_bytes: u64,
    period: Duration,
    next_check_at: Instant,
}

impl MemoryCheck {
    pub fn new(limit_bytes: u64, initial_delay: Duration, period: Duration) -> Self {
        Self {
            limit_bytes,
            period,
            next_check_at: Instant::now() + initial_delay,
        }
    }

    /// Samples RSS when a check is due; `None` between checks.
    pub fn poll(&mut self) -> Option<io::Result<MemorySample>> {
        let now = Instant::now();
        if now < self.next_check_at {
            return None;
        }
        self.next_check_at = now + self.period;

        Some(rss_bytes().map(|rss| MemorySample {
            rss_bytes: rss,
            limit_bytes: self.limit_bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let sample = r#"Name:	vega-agent
Umask:	0022
State:	S (sleeping)
VmPeak:	  262144 kB
VmSize:	  131072 kB
VmRSS:	   51200 kB
VmData:	   40960 kB
Threads:	9
"#;
        assert_eq!(parse_vm_rss(sample), Some(51200 * 1024));
    }

    #[test]
    fn test_parse_vm_rss_missing() {
        let sample = "Name:\tvega-agent\nThreads:\t9\n";
        assert_eq!(parse_vm_rss(sample), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_bytes_live() {
        let rss = rss_bytes().unwrap();
        assert!(rss > 0);
    }

    #[test]
    fn test_memory_check_defers_first_sample() {
        let mut check = MemoryCheck::new(
            u64::MAX,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        assert!(check.poll().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_check_period_gates_samples() {
        let mut check = MemoryCheck::new(u64::MAX, Duration::ZERO, Duration::from_secs(3600));

        let sample = check.poll().expect("first check is due").unwrap();
        assert!(!sample.exceeded());
        assert!(check.poll().is_none(), "next check waits out the period");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_check_flags_limit_breach() {
        let mut check = MemoryCheck::new(1, Duration::ZERO, Duration::from_secs(3600));

        let sample = check.poll().expect("check is due").unwrap();
        assert!(sample.exceeded(), "any real process exceeds a one-byte limit");
    }
}

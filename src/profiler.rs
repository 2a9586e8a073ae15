use std::ops::AddAssign;
use std::{fmt, fmt::Display};

use serde::Serialize;

const PROC_SELF_STATUS: &str = "/proc/self/status";

fn clock_ns(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    unsafe { libc::clock_gettime(clock, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Monotonic timestamp in microseconds.
#[must_use]
pub fn timestamp_us() -> i64 {
    clock_ns(libc::CLOCK_MONOTONIC) / 1_000
}

/// Process CPU time (user + system) in nanoseconds.
#[must_use]
pub fn process_cpu_time_ns() -> i64 {
    clock_ns(libc::CLOCK_PROCESS_CPUTIME_ID)
}

/// Reads the leading integer of a `/proc/<pid>/status` line such as
/// `VmHWM:\t  123456 kB`.
#[must_use]
pub fn parse_status_kb(status: &str, key: &str) -> Option<i64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse::<i64>().ok()
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub wall_time_ns: i64,
    pub cpu_time_ns: i64,
    pub vm_size_kb: i64,
    pub vm_rss_kb: i64,
    pub vm_peak_kb: i64,
    pub rss_peak_kb: i64,
    pub user_time_us: i64,
    pub system_time_us: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub vol_ctx_switches: i64,
    pub invol_ctx_switches: i64,
}

impl ResourceSnapshot {
    /// Captures clocks, `/proc/self/status` memory counters and `getrusage`.
    /// Counters that cannot be read stay at zero.
    #[must_use]
    pub fn capture() -> Self {
        let mut snapshot = Self {
            wall_time_ns: clock_ns(libc::CLOCK_MONOTONIC),
            cpu_time_ns: process_cpu_time_ns(),
            ..Self::default()
        };
        if let Ok(status) = std::fs::read_to_string(PROC_SELF_STATUS) {
            snapshot.apply_proc_status(&status);
        }
        snapshot.apply_rusage();
        snapshot
    }

    pub(crate) fn apply_proc_status(&mut self, status: &str) {
        let read = |key| parse_status_kb(status, key).unwrap_or(0);
        self.vm_size_kb = read("VmSize");
        self.vm_rss_kb = read("VmRSS");
        self.vm_peak_kb = read("VmPeak");
        self.rss_peak_kb = read("VmHWM");
    }

    fn apply_rusage(&mut self) {
        // SAFETY: rusage is plain old data; getrusage fills it in.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `usage` is a valid, writable rusage.
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
            return;
        }
        self.user_time_us =
            usage.ru_utime.tv_sec as i64 * 1_000_000 + usage.ru_utime.tv_usec as i64;
        self.system_time_us =
            usage.ru_stime.tv_sec as i64 * 1_000_000 + usage.ru_stime.tv_usec as i64;
        self.minor_faults = usage.ru_minflt as i64;
        self.major_faults = usage.ru_majflt as i64;
        self.vol_ctx_switches = usage.ru_nvcsw as i64;
        self.invol_ctx_switches = usage.ru_nivcsw as i64;
    }

    #[must_use]
    pub fn delta_since(&self, start: &ResourceSnapshot) -> ResourceDelta {
        ResourceDelta {
            wall_time_ms: (self.wall_time_ns - start.wall_time_ns) as f64 / 1_000_000.0,
            cpu_time_ms: (self.cpu_time_ns - start.cpu_time_ns) as f64 / 1_000_000.0,
            user_time_ms: (self.user_time_us - start.user_time_us) / 1_000,
            system_time_ms: (self.system_time_us - start.system_time_us) / 1_000,
            vm_rss_delta_kb: self.vm_rss_kb - start.vm_rss_kb,
            vm_size_delta_kb: self.vm_size_kb - start.vm_size_kb,
            minor_faults: self.minor_faults - start.minor_faults,
            major_faults: self.major_faults - start.major_faults,
            vol_ctx_switches: self.vol_ctx_switches - start.vol_ctx_switches,
            invol_ctx_switches: self.invol_ctx_switches - start.invol_ctx_switches,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceDelta {
    pub wall_time_ms: f64,
    pub cpu_time_ms: f64,
    pub user_time_ms: i64,
    pub system_time_ms: i64,
    pub vm_rss_delta_kb: i64,
    pub vm_size_delta_kb: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub vol_ctx_switches: i64,
    pub invol_ctx_switches: i64,
}

impl ResourceDelta {
    #[must_use]
    pub fn cpu_utilization_percent(&self) -> Option<f64> {
        (self.wall_time_ms > 0.0).then(|| self.cpu_time_ms / self.wall_time_ms * 100.0)
    }
}

impl AddAssign<&ResourceDelta> for ResourceDelta {
    fn add_assign(&mut self, other: &ResourceDelta) {
        self.wall_time_ms += other.wall_time_ms;
        self.cpu_time_ms += other.cpu_time_ms;
        self.user_time_ms += other.user_time_ms;
        self.system_time_ms += other.system_time_ms;
        self.vm_rss_delta_kb += other.vm_rss_delta_kb;
        self.vm_size_delta_kb += other.vm_size_delta_kb;
        self.minor_faults += other.minor_faults;
        self.major_faults += other.major_faults;
        self.vol_ctx_switches += other.vol_ctx_switches;
        self.invol_ctx_switches += other.invol_ctx_switches;
    }
}

impl Display for ResourceDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceDelta(wall_ms={:.2}, cpu_ms={:.2}, util={:.1}%, user_ms={}, sys_ms={}, rss_kb={:+}, vss_kb={:+}, faults={}/{}, ctx_switches={}/{})",
            self.wall_time_ms,
            self.cpu_time_ms,
            self.cpu_utilization_percent().unwrap_or(0.0),
            self.user_time_ms,
            self.system_time_ms,
            self.vm_rss_delta_kb,
            self.vm_size_delta_kb,
            self.minor_faults,
            self.major_faults,
            self.vol_ctx_switches,
            self.invol_ctx_switches
        )
    }
}

/// Snapshot pair covering a scope. `finish` returns the delta and the
/// closing snapshot (whose `rss_peak_kb` is the lifetime peak RSS).
#[derive(Debug)]
pub struct ResourceScope {
    start: ResourceSnapshot,
}

impl ResourceScope {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: ResourceSnapshot::capture(),
        }
    }

    #[must_use]
    pub fn finish(self) -> (ResourceDelta, ResourceSnapshot) {
        let end = ResourceSnapshot::capture();
        (end.delta_since(&self.start), end)
    }
}

/// Per-frame probe: monotonic input timestamp plus process CPU clock.
#[derive(Debug, Clone, Copy)]
pub struct FrameProbe {
    pub input_timestamp_us: i64,
    cpu_start_ns: i64,
}

impl FrameProbe {
    #[must_use]
    pub fn start() -> Self {
        Self {
            input_timestamp_us: timestamp_us(),
            cpu_start_ns: process_cpu_time_ns(),
        }
    }

    /// Returns `(output_timestamp_us, cpu_ms)`.
    #[must_use]
    pub fn finish(&self) -> (i64, f64) {
        let output_timestamp_us = timestamp_us().max(self.input_timestamp_us);
        let cpu_ms = (process_cpu_time_ns() - self.cpu_start_ns).max(0) as f64 / 1_000_000.0;
        (output_timestamp_us, cpu_ms)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const STATUS: &str = "Name:\tanicet\nVmPeak:\t  220000 kB\nVmSize:\t  210000 kB\nVmHWM:\t   9000 kB\nVmRSS:\t    8000 kB\nThreads:\t1\n";

    #[rstest]
    #[case("VmPeak", Some(220000))]
    #[case("VmSize", Some(210000))]
    #[case("VmHWM", Some(9000))]
    #[case("VmRSS", Some(8000))]
    #[case("VmSwap", None)]
    #[case("Threads", Some(1))]
    fn parses_status_fields(#[case] key: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_status_kb(STATUS, key), expected);
    }

    #[test]
    fn status_key_must_match_whole_prefix() {
        assert_eq!(parse_status_kb("VmRSSX:\t 12 kB\n", "VmRSS"), None);
    }

    #[test]
    fn proc_status_fills_memory_fields() {
        let mut snapshot = ResourceSnapshot::default();
        snapshot.apply_proc_status(STATUS);
        assert_eq!(snapshot.vm_size_kb, 210000);
        assert_eq!(snapshot.vm_rss_kb, 8000);
        assert_eq!(snapshot.vm_peak_kb, 220000);
        assert_eq!(snapshot.rss_peak_kb, 9000);
    }

    #[test]
    fn delta_subtracts_counters() {
        let start = ResourceSnapshot {
            wall_time_ns: 1_000_000,
            cpu_time_ns: 500_000,
            vm_rss_kb: 100,
            vm_size_kb: 1000,
            user_time_us: 2_000,
            system_time_us: 1_000,
            minor_faults: 5,
            ..ResourceSnapshot::default()
        };
        let end = ResourceSnapshot {
            wall_time_ns: 11_000_000,
            cpu_time_ns: 5_500_000,
            vm_rss_kb: 80,
            vm_size_kb: 1500,
            user_time_us: 6_500,
            system_time_us: 2_000,
            minor_faults: 9,
            ..ResourceSnapshot::default()
        };
        let delta = end.delta_since(&start);
        assert_eq!(delta.wall_time_ms, 10.0);
        assert_eq!(delta.cpu_time_ms, 5.0);
        assert_eq!(delta.user_time_ms, 4);
        assert_eq!(delta.system_time_ms, 1);
        assert_eq!(delta.vm_rss_delta_kb, -20);
        assert_eq!(delta.vm_size_delta_kb, 500);
        assert_eq!(delta.minor_faults, 4);
        assert_eq!(delta.cpu_utilization_percent(), Some(50.0));
    }

    #[test]
    fn utilization_is_absent_without_wall_time() {
        assert_eq!(ResourceDelta::default().cpu_utilization_percent(), None);
    }

    #[test]
    fn add_assign_sums_every_field() {
        let one = ResourceDelta {
            wall_time_ms: 1.5,
            cpu_time_ms: 1.0,
            user_time_ms: 1,
            system_time_ms: 2,
            vm_rss_delta_kb: 3,
            vm_size_delta_kb: -4,
            minor_faults: 5,
            major_faults: 6,
            vol_ctx_switches: 7,
            invol_ctx_switches: 8,
        };
        let mut total = one;
        total += &one;
        assert_eq!(total.wall_time_ms, 3.0);
        assert_eq!(total.cpu_time_ms, 2.0);
        assert_eq!(total.user_time_ms, 2);
        assert_eq!(total.system_time_ms, 4);
        assert_eq!(total.vm_rss_delta_kb, 6);
        assert_eq!(total.vm_size_delta_kb, -8);
        assert_eq!(total.minor_faults, 10);
        assert_eq!(total.major_faults, 12);
        assert_eq!(total.vol_ctx_switches, 14);
        assert_eq!(total.invol_ctx_switches, 16);
    }

    #[test]
    fn frame_probe_output_never_precedes_input() {
        let probe = FrameProbe::start();
        let (output_us, cpu_ms) = probe.finish();
        assert!(output_us >= probe.input_timestamp_us);
        assert!(cpu_ms >= 0.0);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(b >= a);
    }
}

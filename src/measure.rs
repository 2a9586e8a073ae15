//! Child-process measurement: run a command under a given affinity and
//! niceness, then report wall/user/system time, peak RSS, exit status and
//! optional simpleperf counters.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::profiler::parse_status_kb;

pub const EXIT_TIMEOUT: i32 = 137;
pub const EXIT_EXEC_FAILED: i32 = 127;
pub const EXIT_TOOL_FAILURE: i32 = 2;
pub const DEFAULT_SIMPLEPERF: &str = "simpleperf";
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const RELAYED_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    #[error("no command to run")]
    EmptyCommand,
    #[error("invalid cpu list '{0}'")]
    InvalidCpuList(String),
    #[error("cannot start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("waiting for child {pid} failed: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: io::Error,
    },
}

impl MeasureError {
    /// Process exit code the tool reports for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spawn { source, .. }
                if matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                EXIT_EXEC_FAILED
            }
            _ => EXIT_TOOL_FAILURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleperfConfig {
    pub command: String,
    pub events: Option<String>,
}

impl Default for SimpleperfConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_SIMPLEPERF.to_string(),
            events: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasureConfig {
    pub command: Vec<String>,
    pub tags: Vec<(String, String)>,
    pub cpus: Option<Vec<usize>>,
    pub nice: Option<i32>,
    pub timeout: Option<Duration>,
    pub simpleperf: Option<SimpleperfConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Measurement {
    pub wall_ms: i64,
    pub user_ms: i64,
    pub sys_ms: i64,
    pub vmhwm_kb: i64,
    pub exit_code: i32,
    pub timed_out: bool,
    /// simpleperf counters keyed by event name.
    pub counters: BTreeMap<String, i64>,
}

/// Parses `0,2,4-5` into CPU indices. A reversed range `5-4` is swapped.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, MeasureError> {
    let invalid = || MeasureError::InvalidCpuList(list.to_string());
    let mut cpus = Vec::new();
    for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match item.split_once('-') {
            Some((a, b)) => {
                let a = a.trim().parse::<usize>().map_err(|_| invalid())?;
                let b = b.trim().parse::<usize>().map_err(|_| invalid())?;
                let (lo, hi) = if a > b { (b, a) } else { (a, b) };
                cpus.extend(lo..=hi);
            }
            None => cpus.push(item.parse::<usize>().map_err(|_| invalid())?),
        }
    }
    if cpus.is_empty() {
        return Err(invalid());
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Parses `key=value` tags; the value may contain `=`.
#[must_use]
pub fn parse_tag(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Counter lines look like `  1,234,567  cpu-cycles  # 1.2 GHz (100%)`.
#[must_use]
pub fn parse_simpleperf_output(text: &str) -> BTreeMap<String, i64> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let count = tokens.next()?.replace(',', "").parse::<i64>().ok()?;
            let event = tokens.next()?;
            Some((event.replace('-', "_"), count))
        })
        .collect()
}

/// Adds CPU affinity and niceness to `command`, applied in the child
/// between fork and exec.
pub fn apply_child_limits(command: &mut Command, cpus: Option<&[usize]>, nice: Option<i32>) {
    let mask = cpus.map(cpu_set);
    if mask.is_none() && nice.is_none() {
        return;
    }
    // SAFETY: the closure only issues async-signal-safe syscalls.
    unsafe {
        command.pre_exec(move || {
            if let Some(mask) = &mask {
                if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), mask) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(nice) = nice {
                if libc::setpriority(libc::PRIO_PROCESS, 0, nice) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

fn cpu_set(cpus: &[usize]) -> libc::cpu_set_t {
    // SAFETY: an all-zero cpu_set_t is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus {
        // SAFETY: CPU_SET bounds the index to the set size.
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    set
}

/// Pins and renices the current process.
pub fn apply_self_limits(cpus: Option<&[usize]>, nice: Option<i32>) -> io::Result<()> {
    if let Some(cpus) = cpus {
        let mask = cpu_set(cpus);
        // SAFETY: `mask` is a valid cpu_set_t for the call.
        if unsafe { libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &mask) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(nice) = nice {
        // SAFETY: plain syscall on the calling process.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

extern "C" fn relay_signal(signal: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(pid, signal) };
    }
}

fn install_relay() {
    for signal in RELAYED_SIGNALS {
        // SAFETY: the handler only reads an atomic and calls kill.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = relay_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

fn simpleperf_output_path() -> PathBuf {
    std::env::temp_dir().join(format!("anicet-simpleperf-{}.txt", std::process::id()))
}

/// Command line actually executed: the child itself, or simpleperf
/// wrapping it.
#[must_use]
pub fn wrapped_command(config: &MeasureConfig, stat_output: &std::path::Path) -> Vec<String> {
    let Some(simpleperf) = &config.simpleperf else {
        return config.command.clone();
    };
    let mut argv = simpleperf
        .command
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    argv.push("stat".to_string());
    if let Some(events) = simpleperf.events.as_deref().filter(|events| !events.is_empty()) {
        argv.push("-e".to_string());
        argv.push(events.to_string());
    }
    argv.push("-o".to_string());
    argv.push(stat_output.display().to_string());
    argv.push("--".to_string());
    argv.extend(config.command.iter().cloned());
    argv
}

/// Blocks until `pid` exits without reaping it. Returns whether the
/// deadline forced a SIGKILL.
fn wait_exited(pid: libc::pid_t, deadline: Option<Instant>) -> Result<bool, MeasureError> {
    let mut timed_out = false;
    loop {
        let poll = deadline.is_some() && !timed_out;
        let flags = libc::WEXITED | libc::WNOWAIT | if poll { libc::WNOHANG } else { 0 };
        // SAFETY: a zeroed siginfo_t is valid output storage.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, flags) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(MeasureError::Wait { pid, source: err });
        }
        // SAFETY: waitid filled `info` or left it zeroed.
        if unsafe { info.si_pid() } != 0 {
            return Ok(timed_out);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(pid, "timeout reached, killing child");
            // SAFETY: `pid` is our unreaped child.
            unsafe { libc::kill(pid, libc::SIGKILL) };
            timed_out = true;
            continue;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn reap(pid: libc::pid_t) -> Result<(libc::c_int, libc::rusage), MeasureError> {
    let mut status = 0;
    // SAFETY: a zeroed rusage is valid output storage.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok((status, usage));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(MeasureError::Wait { pid, source: err });
        }
    }
}

fn timeval_ms(tv: libc::timeval) -> i64 {
    tv.tv_sec as i64 * 1_000 + tv.tv_usec as i64 / 1_000
}

fn exit_code_from_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        EXIT_TOOL_FAILURE
    }
}

/// Runs the configured command to completion and measures it.
pub fn measure(config: &MeasureConfig) -> Result<Measurement, MeasureError> {
    if config.command.is_empty() {
        return Err(MeasureError::EmptyCommand);
    }
    let stat_output = simpleperf_output_path();
    let argv = wrapped_command(config, &stat_output);
    let (program, args) = argv.split_first().ok_or(MeasureError::EmptyCommand)?;
    let mut command = Command::new(program);
    command.args(args);
    apply_child_limits(&mut command, config.cpus.as_deref(), config.nice);
    debug!(?argv, cpus = ?config.cpus, nice = ?config.nice, "starting child");

    install_relay();
    let start = Instant::now();
    let child = command.spawn().map_err(|source| MeasureError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id() as libc::pid_t;
    CHILD_PID.store(pid, Ordering::SeqCst);

    let waited = wait_exited(pid, config.timeout.map(|timeout| start + timeout));
    let wall_ms = start.elapsed().as_millis() as i64;
    // Peak RSS is read while the exited child is still unreaped.
    let vmhwm_kb = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| parse_status_kb(&status, "VmHWM"));
    let reaped = waited.and_then(|timed_out| reap(pid).map(|reaped| (timed_out, reaped)));
    CHILD_PID.store(0, Ordering::SeqCst);
    let (timed_out, (status, usage)) = reaped?;

    let counters = if config.simpleperf.is_some() {
        let counters = std::fs::read_to_string(&stat_output)
            .map(|text| parse_simpleperf_output(&text))
            .unwrap_or_else(|err| {
                warn!(path = %stat_output.display(), %err, "no simpleperf output");
                BTreeMap::new()
            });
        let _ = std::fs::remove_file(&stat_output);
        counters
    } else {
        BTreeMap::new()
    };

    let measurement = Measurement {
        wall_ms,
        user_ms: timeval_ms(usage.ru_utime),
        sys_ms: timeval_ms(usage.ru_stime),
        // An exited child may already have dropped its memory map; the
        // kernel's max RSS accounting covers that case.
        vmhwm_kb: vmhwm_kb.unwrap_or(if usage.ru_maxrss > 0 { usage.ru_maxrss as i64 } else { -1 }),
        exit_code: if timed_out { EXIT_TIMEOUT } else { exit_code_from_status(status) },
        timed_out,
        counters,
    };
    debug!(?measurement, "child finished");
    Ok(measurement)
}

fn tag_fields(tags: &[(String, String)]) -> Vec<(String, String)> {
    if tags.is_empty() {
        return vec![("run".to_string(), "na".to_string())];
    }
    tags.to_vec()
}

fn metric_fields(measurement: &Measurement) -> Vec<(String, i64)> {
    let mut fields = vec![
        ("wall_ms".to_string(), measurement.wall_ms),
        ("user_ms".to_string(), measurement.user_ms),
        ("sys_ms".to_string(), measurement.sys_ms),
        ("vmhwm_kb".to_string(), measurement.vmhwm_kb),
        ("exit".to_string(), i64::from(measurement.exit_code)),
    ];
    fields.extend(measurement.counters.iter().map(|(name, value)| (name.clone(), *value)));
    fields
}

/// `k=v,...,wall_ms=..,user_ms=..,sys_ms=..,vmhwm_kb=..,exit=..[,counter=..]`
#[must_use]
pub fn format_csv(tags: &[(String, String)], measurement: &Measurement) -> String {
    tag_fields(tags)
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .chain(
            metric_fields(measurement)
                .into_iter()
                .map(|(key, value)| format!("{key}={value}")),
        )
        .collect::<Vec<_>>()
        .join(",")
}

/// One flat JSON object: tags as strings, then integer metrics.
#[must_use]
pub fn format_json(tags: &[(String, String)], measurement: &Measurement) -> String {
    let mut object = Map::new();
    for (key, value) in tags {
        object.insert(key.clone(), Value::from(value.clone()));
    }
    for (key, value) in metric_fields(measurement) {
        object.insert(key, Value::from(value));
    }
    Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0,2,4-5", vec![0, 2, 4, 5])]
    #[case("5-4", vec![4, 5])]
    #[case(" 3 , 1,1 ", vec![1, 3])]
    fn cpu_lists_expand(#[case] raw: &str, #[case] expected: Vec<usize>) {
        assert_eq!(parse_cpu_list(raw).expect("valid list"), expected);
    }

    #[rstest]
    #[case("")]
    #[case("a")]
    #[case("1-")]
    #[case("-1")]
    fn bad_cpu_lists_fail(#[case] raw: &str) {
        assert!(matches!(parse_cpu_list(raw), Err(MeasureError::InvalidCpuList(_))));
    }

    #[test]
    fn tags_split_on_first_equals() {
        assert_eq!(
            parse_tag("codec=x265:preset=fast"),
            Some(("codec".to_string(), "x265:preset=fast".to_string()))
        );
        assert_eq!(parse_tag("novalue"), None);
        assert_eq!(parse_tag("=x"), None);
    }

    const STAT: &str = "Performance counter statistics:\n\
        \n\
        #         count  event_name                # count / runtime\n\
        \x20 1,234,567  cpu-cycles                # 1.2 GHz (100%)\n\
        \x20     8,910  instructions              # 0.1 ipc\n\
        \n\
        Total test time: 0.012 seconds.\n";

    #[test]
    fn simpleperf_counters_are_renamed_and_sorted() {
        let counters = parse_simpleperf_output(STAT);
        assert_eq!(
            counters.into_iter().collect::<Vec<_>>(),
            vec![
                ("cpu_cycles".to_string(), 1_234_567),
                ("instructions".to_string(), 8_910)
            ]
        );
    }

    #[test]
    fn simpleperf_wraps_the_child() {
        let config = MeasureConfig {
            command: vec!["ls".to_string(), "-l".to_string()],
            simpleperf: Some(SimpleperfConfig {
                command: "/data/simpleperf".to_string(),
                events: Some("cpu-cycles,instructions".to_string()),
            }),
            ..MeasureConfig::default()
        };
        let argv = wrapped_command(&config, std::path::Path::new("/tmp/stat.txt"));
        assert_eq!(
            argv,
            vec![
                "/data/simpleperf",
                "stat",
                "-e",
                "cpu-cycles,instructions",
                "-o",
                "/tmp/stat.txt",
                "--",
                "ls",
                "-l"
            ]
        );
    }

    fn sample() -> Measurement {
        let mut counters = BTreeMap::new();
        counters.insert("cpu_cycles".to_string(), 42);
        Measurement {
            wall_ms: 10,
            user_ms: 4,
            sys_ms: 1,
            vmhwm_kb: 2048,
            exit_code: 0,
            timed_out: false,
            counters,
        }
    }

    #[test]
    fn csv_line_has_tags_then_metrics() {
        let tags = vec![("codec".to_string(), "webp".to_string())];
        assert_eq!(
            format_csv(&tags, &sample()),
            "codec=webp,wall_ms=10,user_ms=4,sys_ms=1,vmhwm_kb=2048,exit=0,cpu_cycles=42"
        );
        assert!(format_csv(&[], &sample()).starts_with("run=na,wall_ms=10"));
    }

    #[test]
    fn json_keeps_field_order() {
        let tags = vec![("codec".to_string(), "webp".to_string())];
        assert_eq!(
            format_json(&tags, &sample()),
            r#"{"codec":"webp","wall_ms":10,"user_ms":4,"sys_ms":1,"vmhwm_kb":2048,"exit":0,"cpu_cycles":42}"#
        );
    }

    #[test]
    fn measures_exit_status() {
        let config = MeasureConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            ..MeasureConfig::default()
        };
        let measurement = measure(&config).expect("sh runs");
        assert_eq!(measurement.exit_code, 3);
        assert!(!measurement.timed_out);
    }

    #[test]
    fn signal_death_maps_to_128_plus_signal() {
        let config = MeasureConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "kill -9 $$".to_string()],
            ..MeasureConfig::default()
        };
        assert_eq!(measure(&config).expect("sh runs").exit_code, 137);
    }

    #[test]
    fn timeout_kills_the_child() {
        let config = MeasureConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            timeout: Some(Duration::from_millis(50)),
            ..MeasureConfig::default()
        };
        let measurement = measure(&config).expect("sh runs");
        assert!(measurement.timed_out);
        assert_eq!(measurement.exit_code, EXIT_TIMEOUT);
        assert!(measurement.wall_ms < 5_000);
    }

    #[test]
    fn missing_program_is_exec_failure() {
        let config = MeasureConfig {
            command: vec!["/nonexistent/anicet-child".to_string()],
            ..MeasureConfig::default()
        };
        let err = measure(&config).expect_err("spawn must fail");
        assert_eq!(err.exit_code(), EXIT_EXEC_FAILED);
        assert!(matches!(measure(&MeasureConfig::default()), Err(MeasureError::EmptyCommand)));
    }
}

use std::process::Command;

fn anicet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_anicet"))
}

#[test]
fn measurement_line_carries_tags_and_exit_code() {
    let output = anicet()
        .args(["--tag", "suite=cli", "--", "/bin/sh", "-c", "exit 3"])
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(3));
    let line = String::from_utf8_lossy(&output.stdout);
    assert!(line.starts_with("suite=cli,wall_ms="), "{line}");
    assert!(line.trim_end().ends_with(",exit=3"), "{line}");
}

#[test]
fn measurement_json_is_one_flat_object() {
    let output = anicet()
        .args(["--json", "--", "/bin/true"])
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(0));
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is one JSON object");
    assert_eq!(value["exit"], 0);
    assert!(value["wall_ms"].is_i64());
}

#[test]
fn timeout_reports_137() {
    let output = anicet()
        .args(["--timeout-ms", "50", "--", "/bin/sh", "-c", "sleep 5"])
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(137));
}

#[test]
fn parameter_help_exits_zero() {
    let output = anicet().args(["--x265", "compact"]).output().expect("binary runs");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("x265 parameters: optimization="));

    let output = anicet().args(["--svtav1", "help"]).output().expect("binary runs");
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("Available parameters for svtav1:"));
}

#[test]
fn parameter_error_exits_one_before_encoding() {
    let dir = tempfile::tempdir().expect("temp dir");
    let image = dir.path().join("gray.yuv");
    std::fs::write(&image, vec![128u8; 384]).expect("write frame");
    let output = anicet()
        .args(["--image"])
        .arg(&image)
        .args([
            "--width",
            "16",
            "--height",
            "16",
            "--color-format",
            "yuv420p",
            "--codec",
            "x265-8bit",
            "--x265",
            "speed=3",
        ])
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown parameter 'speed'"));
    assert!(output.stdout.is_empty());
}

#[test]
fn library_mode_writes_report() {
    let dir = tempfile::tempdir().expect("temp dir");
    let image = dir.path().join("gray.yuv");
    let report = dir.path().join("report.json");
    std::fs::write(&image, vec![128u8; 384]).expect("write frame");
    let status = anicet()
        .args(["--image"])
        .arg(&image)
        .args(["--width", "16", "--height", "16", "--color-format", "yuv420p"])
        .args(["--codec", "webp", "--tag", "run=ci", "-o"])
        .arg(&report)
        .status()
        .expect("binary runs");
    let text = std::fs::read_to_string(&report).expect("report written");
    let value: serde_json::Value = serde_json::from_str(&text).expect("report is JSON");
    assert_eq!(value["input"]["size_bytes"], 384);
    assert_eq!(value["setup"]["run"], "ci");
    let frames = value["output"]["frames"].as_array().expect("frames array");
    // Exit code is the error count: 0 with webp installed, 1 without.
    match status.code() {
        Some(0) => assert_eq!(frames.len(), 1),
        Some(1) => assert!(frames.is_empty()),
        other => panic!("unexpected exit {other:?}"),
    }
}

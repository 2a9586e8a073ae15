//! JSON report written by the command-line tool after an experiment.

use std::process::Command;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::contract::CodecOutput;
use crate::profiler::ResourceDelta;

pub const UNKNOWN_SERIAL: &str = "unknown";

/// Device serial: `ANDROID_SERIAL`, then `ro.serialno` on Android.
#[must_use]
pub fn serial_number() -> String {
    if let Ok(serial) = std::env::var("ANDROID_SERIAL") {
        if !serial.trim().is_empty() {
            return serial.trim().to_string();
        }
    }
    if cfg!(target_os = "android") {
        if let Ok(output) = Command::new("getprop").arg("ro.serialno").output() {
            let serial = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !serial.is_empty() {
                return serial;
            }
        }
    }
    UNKNOWN_SERIAL.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSection {
    pub file: String,
    pub width: i32,
    pub height: i32,
    pub color_format: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupSection {
    pub serial_number: String,
    pub num_runs: usize,
    pub tags: Vec<(String, String)>,
}

impl SetupSection {
    fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("serial_number".into(), self.serial_number.clone().into());
        object.insert("num_runs".into(), self.num_runs.into());
        for (key, value) in &self.tags {
            object.insert(key.clone(), value.clone().into());
        }
        Value::Object(object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct CpuTime {
    total_ms: f64,
    user_time_ms: i64,
    system_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    utilization_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct PageFaults {
    minor: i64,
    major: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct ContextSwitches {
    voluntary: i64,
    involuntary: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct GlobalResources {
    wall_time_ms: f64,
    cpu_time: CpuTime,
    memory_rss_kb: i64,
    memory_vss_kb: i64,
    page_faults: PageFaults,
    context_switches: ContextSwitches,
}

impl From<&ResourceDelta> for GlobalResources {
    fn from(delta: &ResourceDelta) -> Self {
        Self {
            wall_time_ms: delta.wall_time_ms,
            cpu_time: CpuTime {
                total_ms: delta.cpu_time_ms,
                user_time_ms: delta.user_time_ms,
                system_time_ms: delta.system_time_ms,
                utilization_percent: delta.cpu_utilization_percent(),
            },
            memory_rss_kb: delta.vm_rss_delta_kb,
            memory_vss_kb: delta.vm_size_delta_kb,
            page_faults: PageFaults {
                minor: delta.minor_faults,
                major: delta.major_faults,
            },
            context_switches: ContextSwitches {
                voluntary: delta.vol_ctx_switches,
                involuntary: delta.invol_ctx_switches,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct FrameResources {
    frame_index: usize,
    size_bytes: usize,
    input_timestamp_us: i64,
    output_timestamp_us: i64,
    encode_time_us: i64,
    cpu_time_ms: f64,
}

fn output_frames(output: &CodecOutput, result: usize) -> Vec<Value> {
    (0..output.num_frames())
        .map(|index| {
            let mut frame = Map::new();
            if output.dump_output {
                if let Some(file) = output.output_files.get(index) {
                    frame.insert("file".into(), file.clone().into());
                }
            }
            if let Some(codec) = output.frame_codecs.get(index) {
                frame.insert("codec".into(), codec.codec.into());
                for (name, value) in &codec.parameters {
                    frame.insert(name.clone(), value.clone().into());
                }
            }
            frame.insert("exit_code".into(), result.into());
            frame.insert("size_bytes".into(), output.frame_sizes[index].into());
            Value::Object(frame)
        })
        .collect()
}

fn frame_resources(output: &CodecOutput) -> Vec<FrameResources> {
    output
        .timings
        .iter()
        .zip(&output.frame_sizes)
        .enumerate()
        .map(|(frame_index, (timing, &size_bytes))| FrameResources {
            frame_index,
            size_bytes,
            input_timestamp_us: timing.input_timestamp_us,
            output_timestamp_us: timing.output_timestamp_us,
            encode_time_us: timing.encode_time_us(),
            cpu_time_ms: output
                .profile_encode_cpu_ms
                .get(frame_index)
                .copied()
                .unwrap_or(0.0),
        })
        .collect()
}

/// Builds the report; `result` is the experiment's error count.
pub fn build_report(
    input: &InputSection,
    setup: &SetupSection,
    output: &CodecOutput,
    result: usize,
) -> serde_json::Result<Value> {
    let mut report = Map::new();
    report.insert("input".into(), serde_json::to_value(input)?);
    report.insert("setup".into(), setup.to_value());

    let mut out = Map::new();
    out.insert("frames".into(), Value::Array(output_frames(output, result)));
    report.insert("output".into(), Value::Object(out));

    let mut resources = Map::new();
    resources.insert(
        "global".into(),
        serde_json::to_value(GlobalResources::from(&output.resource_delta))?,
    );
    resources.insert("frames".into(), serde_json::to_value(frame_resources(output))?);
    report.insert("resources".into(), Value::Object(resources));
    Ok(Value::Object(report))
}

/// Two-space indented report text with a trailing newline.
pub fn render_report(
    input: &InputSection,
    setup: &SetupSection,
    output: &CodecOutput,
    result: usize,
) -> serde_json::Result<String> {
    let mut text = serde_json::to_string_pretty(&build_report(input, setup, output, result)?)?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FrameCodec, FrameTiming};

    fn sample_output(dump: bool) -> CodecOutput {
        let mut output = CodecOutput::new(dump);
        output.push_frame(
            FrameTiming {
                input_timestamp_us: 100,
                output_timestamp_us: 350,
            },
            &[0; 12],
            0.25,
        );
        output.output_files.push("/tmp/a.webp".to_string());
        output.frame_codecs.push(FrameCodec {
            codec: "webp",
            parameters: vec![
                ("optimization".to_string(), "opt".to_string()),
                ("quality".to_string(), "75".to_string()),
            ],
        });
        output.resource_delta.wall_time_ms = 10.0;
        output.resource_delta.cpu_time_ms = 5.0;
        output.resource_delta.minor_faults = 7;
        output
    }

    fn sections() -> (InputSection, SetupSection) {
        (
            InputSection {
                file: "in.yuv".to_string(),
                width: 4,
                height: 2,
                color_format: "yuv420p".to_string(),
                size_bytes: 12,
            },
            SetupSection {
                serial_number: "unknown".to_string(),
                num_runs: 1,
                tags: vec![("device".to_string(), "bench".to_string())],
            },
        )
    }

    #[test]
    fn report_has_expected_layout() {
        let (input, setup) = sections();
        let report = build_report(&input, &setup, &sample_output(true), 0).expect("serializes");
        assert_eq!(report["input"]["size_bytes"], 12);
        assert_eq!(report["setup"]["device"], "bench");
        let frame = &report["output"]["frames"][0];
        assert_eq!(frame["file"], "/tmp/a.webp");
        assert_eq!(frame["codec"], "webp");
        assert_eq!(frame["quality"], "75");
        assert_eq!(frame["exit_code"], 0);
        let keys = frame.as_object().expect("object").keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys, ["file", "codec", "optimization", "quality", "exit_code", "size_bytes"]);

        let global = &report["resources"]["global"];
        assert_eq!(global["cpu_time"]["utilization_percent"], 50.0);
        assert_eq!(global["page_faults"]["minor"], 7);
        let frame = &report["resources"]["frames"][0];
        assert_eq!(frame["encode_time_us"], 250);
        assert_eq!(frame["cpu_time_ms"], 0.25);
    }

    #[test]
    fn file_is_omitted_without_dump() {
        let (input, setup) = sections();
        let report = build_report(&input, &setup, &sample_output(false), 2).expect("serializes");
        let frame = &report["output"]["frames"][0];
        assert!(frame.get("file").is_none());
        assert_eq!(frame["exit_code"], 2);
    }

    #[test]
    fn utilization_is_omitted_without_wall_time() {
        let (input, setup) = sections();
        let report = build_report(&input, &setup, &CodecOutput::new(false), 0).expect("serializes");
        assert!(report["resources"]["global"]["cpu_time"].get("utilization_percent").is_none());
        assert_eq!(report["output"]["frames"], Value::Array(Vec::new()));
    }

    #[test]
    fn rendered_report_is_indented() {
        let (input, setup) = sections();
        let text = render_report(&input, &setup, &sample_output(false), 0).expect("renders");
        assert!(text.starts_with("{\n  \"input\": {\n    \"file\": \"in.yuv\""));
        assert!(text.ends_with("}\n"));
    }
}

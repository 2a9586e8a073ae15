#!/usr/bin/env -S cargo +nightly -Zscript
---cargo
[package]
edition = "2024"

[dependencies]
anyhow = "1"
clap = { version = "4.5", features = ["derive"] }
serde_json = "1"
---

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(about = "Run anicet once per codec and summarize sizes and encode times")]
struct Args {
    #[arg(long, default_value = "target/release/anicet")]
    binary: PathBuf,
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, value_delimiter = ',', default_value = "webp,libjpegturbo,jpegli,x265-8bit,svtav1")]
    codecs: Vec<String>,
    #[arg(long, default_value_t = 10)]
    num_runs: usize,
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
}

#[derive(Debug)]
struct CodecSummary {
    codec: String,
    exit_code: i32,
    frames: usize,
    median_size: Option<u64>,
    median_encode_us: Option<i64>,
}

fn median<T: Ord + Copy>(mut values: Vec<T>) -> Option<T> {
    values.sort_unstable();
    values.get(values.len() / 2).copied()
}

fn run_codec(args: &Args, codec: &str) -> Result<CodecSummary> {
    let report_path = args.output_dir.join(format!("report-{codec}.json"));
    println!("\n=== {codec} ===");
    let status = Command::new(&args.binary)
        .arg("--image")
        .arg(&args.image)
        .args(["--width", &args.width.to_string()])
        .args(["--height", &args.height.to_string()])
        .args(["--color-format", "yuv420p"])
        .args(["--codec", codec])
        .args(["--num-runs", &args.num_runs.to_string()])
        .arg("-o")
        .arg(&report_path)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("spawn {}", args.binary.display()))?;
    let exit_code = status.code().unwrap_or(-1);
    if exit_code < 0 {
        bail!("{codec}: anicet terminated by signal ({status})");
    }
    summarize(codec, exit_code, &report_path)
}

fn summarize(codec: &str, exit_code: i32, report_path: &Path) -> Result<CodecSummary> {
    let text = fs::read_to_string(report_path)
        .with_context(|| format!("read report {}", report_path.display()))?;
    let report: Value = serde_json::from_str(&text).context("parse report JSON")?;
    let sizes = report["output"]["frames"]
        .as_array()
        .map(|frames| frames.iter().filter_map(|f| f["size_bytes"].as_u64()).collect::<Vec<_>>())
        .unwrap_or_default();
    let encode_us = report["resources"]["frames"]
        .as_array()
        .map(|frames| frames.iter().filter_map(|f| f["encode_time_us"].as_i64()).collect::<Vec<_>>())
        .unwrap_or_default();
    Ok(CodecSummary {
        codec: codec.to_string(),
        exit_code,
        frames: sizes.len(),
        median_size: median(sizes),
        median_encode_us: median(encode_us),
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    fs::create_dir_all(&args.output_dir).context("create output directory")?;

    let mut summaries = Vec::new();
    for codec in &args.codecs {
        summaries.push(run_codec(&args, codec)?);
    }

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH")?
        .as_secs();
    let mut report = String::new();
    writeln!(&mut report, "codec sweep epoch_seconds: {now_secs}")?;
    writeln!(
        &mut report,
        "input: {} ({}x{}), num_runs: {}",
        args.image.display(),
        args.width,
        args.height,
        args.num_runs
    )?;
    writeln!(&mut report)?;
    writeln!(&mut report, "{:<22} {:>4} {:>6} {:>12} {:>12}", "codec", "exit", "frames", "median_B", "median_us")?;
    for summary in &summaries {
        writeln!(
            &mut report,
            "{:<22} {:>4} {:>6} {:>12} {:>12}",
            summary.codec,
            summary.exit_code,
            summary.frames,
            summary.median_size.map_or_else(|| "-".to_string(), |v| v.to_string()),
            summary.median_encode_us.map_or_else(|| "-".to_string(), |v| v.to_string()),
        )?;
    }

    let report_path = args.output_dir.join(format!("codec-sweep-{now_secs}.txt"));
    fs::write(&report_path, &report)
        .with_context(|| format!("write sweep report to {}", report_path.display()))?;
    print!("{report}");
    println!("saved report: {}", report_path.display());
    Ok(())
}

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anicet::{
    CodecFamily, CodecKind, CodecOutput, CodecSetup, ExperimentConfig, HelpVerbosity, InputSection,
    MeasureConfig, SetupSection, SimpleperfConfig, apply_self_limits, binder, format_csv,
    format_json, measure, parse_cpu_list, parse_parameter_string, parse_tag, print_parameter_help,
    render_parameter_help, render_report, run_experiment, serial_number, validate_dependencies,
};
use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "anicet",
    version,
    about = "Encoder benchmark harness and child-process resource meter",
    after_help = "Library mode: --image FILE --width W --height H --color-format yuv420p [--codec LIST]\n\
                  Measurement mode: [options] -- COMMAND [ARGS...]"
)]
struct Args {
    /// Raw yuv420p frame to encode.
    #[arg(long, value_name = "FILE")]
    image: Option<PathBuf>,
    #[arg(long)]
    width: Option<i32>,
    #[arg(long)]
    height: Option<i32>,
    #[arg(long, value_name = "FORMAT")]
    color_format: Option<String>,
    /// Comma-separated codec tags, or `all`.
    #[arg(long, default_value = "all")]
    codec: String,
    #[arg(long, default_value_t = 1)]
    num_runs: usize,
    #[arg(long, overrides_with = "no_dump_output")]
    dump_output: bool,
    #[arg(long, overrides_with = "dump_output")]
    no_dump_output: bool,
    /// Defaults to the executable's directory.
    #[arg(long, value_name = "DIR")]
    dump_output_dir: Option<PathBuf>,
    #[arg(long, default_value = "anicet.output")]
    dump_output_prefix: String,
    /// Report destination, `-` for stdout.
    #[arg(short, long, default_value = "-")]
    output: String,
    #[arg(short, long, action = ArgAction::Count)]
    debug: u8,
    #[arg(short, long)]
    quiet: bool,
    #[arg(long)]
    list_codecs: bool,

    #[arg(long, value_name = "PARAMS")]
    x265: Vec<String>,
    #[arg(long, value_name = "PARAMS")]
    webp: Vec<String>,
    #[arg(long, value_name = "PARAMS")]
    libjpegturbo: Vec<String>,
    #[arg(long, value_name = "PARAMS")]
    svtav1: Vec<String>,
    #[arg(long, value_name = "PARAMS")]
    jpegli: Vec<String>,
    #[arg(long, value_name = "PARAMS")]
    mediacodec: Vec<String>,

    /// `key=value` label added to the report or measurement line.
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    tags: Vec<String>,
    /// CPU affinity such as `0,2,4-5`.
    #[arg(long, value_name = "LIST")]
    cpus: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    nice: Option<i32>,
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
    /// Print the measurement as JSON instead of CSV.
    #[arg(long)]
    json: bool,
    #[arg(long)]
    add_simpleperf: bool,
    #[arg(long, default_value = anicet::DEFAULT_SIMPLEPERF)]
    simpleperf_command: String,
    #[arg(long, value_name = "EVENTS")]
    simpleperf_events: Option<String>,
    #[arg(long, hide = true)]
    no_simpleperf: bool,

    /// Command to measure.
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    fn family_params(&self, family: CodecFamily) -> &[String] {
        match family {
            CodecFamily::X265 => &self.x265,
            CodecFamily::Webp => &self.webp,
            CodecFamily::Libjpegturbo => &self.libjpegturbo,
            CodecFamily::Svtav1 => &self.svtav1,
            CodecFamily::Jpegli => &self.jpegli,
            CodecFamily::Mediacodec => &self.mediacodec,
        }
    }

    fn library_mode(&self) -> bool {
        self.image.is_some()
            && self.width.is_some()
            && self.height.is_some()
            && self.color_format.is_some()
    }
}

fn init_tracing(debug: u8, quiet: bool) {
    let level = match (quiet, debug) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn help_verbosity(value: &str) -> Option<HelpVerbosity> {
    match value.trim() {
        "help" => Some(HelpVerbosity::Concise),
        "compact" => Some(HelpVerbosity::Compact),
        "verbose" => Some(HelpVerbosity::Verbose),
        _ => None,
    }
}

fn print_catalogue() -> Result<()> {
    println!("Available codecs:");
    for kind in CodecKind::ALL {
        let implied = kind
            .implied_parameters()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "  {:<22} family={:<13} ext=.{:<5} {}{}",
            kind.tag(),
            kind.family().name(),
            kind.extension(),
            if kind.in_all() { "in-all" } else { "explicit" },
            if implied.is_empty() { String::new() } else { format!(" implies {implied}") }
        );
    }
    println!();
    for family in CodecFamily::ALL {
        print!(
            "  {}",
            render_parameter_help(family.name(), family.descriptors(), HelpVerbosity::Compact)
        );
    }
    if cfg!(target_os = "android") {
        println!();
        println!("Platform encoders (--mediacodec codec_name=...):");
        for name in anicet::list_encoders(true)? {
            println!("  {name}");
        }
    }
    Ok(())
}

/// Parses every family's parameter strings. Families the user did not
/// mention are left out and run with defaults.
fn parse_family_setups(args: &Args) -> Result<BTreeMap<CodecFamily, CodecSetup>> {
    let mut setups = BTreeMap::new();
    for family in CodecFamily::ALL {
        let raw = args.family_params(family);
        if raw.is_empty() {
            continue;
        }
        let mut setup = CodecSetup::new(args.num_runs);
        for params in raw {
            parse_parameter_string(family.name(), params, family.descriptors(), &mut setup)?;
        }
        validate_dependencies(family.name(), family.descriptors(), &setup)?;
        setups.insert(family, setup);
    }
    Ok(setups)
}

fn parse_tags(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|tag| parse_tag(tag).with_context(|| format!("invalid --tag '{tag}', expected key=value")))
        .collect()
}

fn parse_cpus(args: &Args) -> Result<Option<Vec<usize>>> {
    args.cpus.as_deref().map(parse_cpu_list).transpose().map_err(Into::into)
}

fn default_dump_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn write_report(destination: &str, text: &str) -> Result<()> {
    if destination == "-" {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        return Ok(());
    }
    fs::write(destination, text).with_context(|| format!("failed to write report to {destination}"))
}

fn run_library(args: &Args, setups: BTreeMap<CodecFamily, CodecSetup>) -> Result<ExitCode> {
    let (Some(image), Some(width), Some(height), Some(color_format)) =
        (&args.image, args.width, args.height, &args.color_format)
    else {
        bail!("library mode needs --image, --width, --height and --color-format");
    };
    let tags = parse_tags(&args.tags)?;
    let cpus = parse_cpus(args)?;
    if let Err(err) = apply_self_limits(cpus.as_deref(), args.nice) {
        warn!(%err, "cannot apply cpu affinity or niceness");
    }
    let buffer = fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;

    let mut config = ExperimentConfig::new(&buffer, width, height, &args.codec);
    config.color_format = color_format.clone();
    config.num_runs = args.num_runs;
    config.dump_output = args.dump_output && !args.no_dump_output;
    config.dump_output_dir = args.dump_output_dir.clone().unwrap_or_else(default_dump_dir);
    config.dump_output_prefix = args.dump_output_prefix.clone();
    config.debug_level = u32::from(args.debug);
    config.setups = setups;

    let mut output = CodecOutput::new(config.dump_output);
    let errors = run_experiment(&config, &mut output)?;
    info!(%output, errors, "experiment finished");

    let input = InputSection {
        file: image.display().to_string(),
        width,
        height,
        color_format: color_format.clone(),
        size_bytes: buffer.len(),
    };
    let setup = SetupSection {
        serial_number: serial_number(),
        num_runs: args.num_runs,
        tags,
    };
    write_report(&args.output, &render_report(&input, &setup, &output, errors)?)?;
    binder::flush();
    Ok(ExitCode::from(u8::try_from(errors).unwrap_or(u8::MAX)))
}

fn print_measurement(args: &Args, tags: &[(String, String)], measurement: &anicet::Measurement) {
    if args.json {
        println!("{}", format_json(tags, measurement));
    } else {
        println!("{}", format_csv(tags, measurement));
    }
}

fn measure_command(args: &Args, command: Vec<String>, simpleperf: bool) -> Result<ExitCode> {
    let tags = parse_tags(&args.tags)?;
    let config = MeasureConfig {
        command,
        tags: tags.clone(),
        cpus: parse_cpus(args)?,
        nice: args.nice,
        timeout: args.timeout_ms.map(Duration::from_millis),
        simpleperf: simpleperf.then(|| SimpleperfConfig {
            command: args.simpleperf_command.clone(),
            events: args.simpleperf_events.clone(),
        }),
    };
    match measure(&config) {
        Ok(measurement) => {
            print_measurement(args, &tags, &measurement);
            Ok(ExitCode::from(measurement.exit_code.clamp(0, 255) as u8))
        }
        Err(err) => {
            error!(%err, "measurement failed");
            Ok(ExitCode::from(err.exit_code() as u8))
        }
    }
}

/// Re-runs this binary under simpleperf with the same media options.
fn reexec_under_simpleperf(args: &Args) -> Result<ExitCode> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut command = vec![exe.display().to_string()];
    command.extend(std::env::args().skip(1));
    command.push("--no-simpleperf".to_string());
    measure_command(args, command, true)
}

fn run(args: &Args) -> Result<ExitCode> {
    if args.list_codecs {
        print_catalogue()?;
        return Ok(ExitCode::SUCCESS);
    }
    for family in CodecFamily::ALL {
        if let Some(verbosity) = args
            .family_params(family)
            .iter()
            .find_map(|value| help_verbosity(value))
        {
            print_parameter_help(family.name(), family.descriptors(), verbosity);
            return Ok(ExitCode::SUCCESS);
        }
    }

    if args.library_mode() {
        let setups = match parse_family_setups(args) {
            Ok(setups) => setups,
            Err(err) => {
                eprintln!("Error: {err}");
                return Ok(ExitCode::from(1));
            }
        };
        if args.add_simpleperf && !args.no_simpleperf {
            return reexec_under_simpleperf(args);
        }
        return run_library(args, setups);
    }
    if !args.command.is_empty() {
        return measure_command(args, args.command.clone(), args.add_simpleperf);
    }
    bail!("nothing to do: give --image/--width/--height/--color-format, or a command after --")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug, args.quiet);
    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fmt, fmt::Display};

use tracing::{debug, error, info, warn};

use crate::binder;
use crate::contract::{CodecInput, CodecOutput, CodecSetup, ColorFormat, EncoderRunner, FrameCodec, RunnerError};
use crate::jpegli_backend::{JPEGLI_PARAMETERS, JpegliRunner};
use crate::mediacodec_format::MEDIACODEC_PARAMETERS;
use crate::parameter::{ParameterDescriptor, sorted_parameters, validate_dependencies};
use crate::svtav1_backend::{SVTAV1_PARAMETERS, SvtAv1Runner};
use crate::turbojpeg_backend::{LIBJPEGTURBO_PARAMETERS, TurboJpegRunner};
use crate::webp_backend::{WEBP_PARAMETERS, WebPRunner};
use crate::x265_backend::{X265_PARAMETERS, X265Runner};

/// Backend family; parameter strings are given per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodecFamily {
    Webp,
    Libjpegturbo,
    Jpegli,
    X265,
    Svtav1,
    Mediacodec,
}

impl CodecFamily {
    pub const ALL: [Self; 6] = [
        Self::Webp,
        Self::Libjpegturbo,
        Self::Jpegli,
        Self::X265,
        Self::Svtav1,
        Self::Mediacodec,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Libjpegturbo => "libjpegturbo",
            Self::Jpegli => "jpegli",
            Self::X265 => "x265",
            Self::Svtav1 => "svtav1",
            Self::Mediacodec => "mediacodec",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.name() == value)
    }

    #[must_use]
    pub fn descriptors(self) -> &'static [ParameterDescriptor] {
        match self {
            Self::Webp => WEBP_PARAMETERS,
            Self::Libjpegturbo => LIBJPEGTURBO_PARAMETERS,
            Self::Jpegli => JPEGLI_PARAMETERS,
            Self::X265 => X265_PARAMETERS,
            Self::Svtav1 => SVTAV1_PARAMETERS,
            Self::Mediacodec => MEDIACODEC_PARAMETERS,
        }
    }

    fn run(
        self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        match self {
            Self::Webp => WebPRunner.run(input, setup, output),
            Self::Libjpegturbo => TurboJpegRunner.run(input, setup, output),
            Self::Jpegli => JpegliRunner.run(input, setup, output),
            Self::X265 => X265Runner.run(input, setup, output),
            Self::Svtav1 => SvtAv1Runner.run(input, setup, output),
            #[cfg(target_os = "android")]
            Self::Mediacodec => crate::mediacodec_backend::MediaCodecRunner.run(input, setup, output),
            #[cfg(not(target_os = "android"))]
            Self::Mediacodec => Err(RunnerError::Unsupported(self.name())),
        }
    }
}

impl Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Selectable codec, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodecKind {
    Webp,
    WebpNonopt,
    Libjpegturbo,
    LibjpegturboNonopt,
    Jpegli,
    X265,
    X265Nonopt,
    Svtav1,
    Mediacodec,
}

impl CodecKind {
    pub const ALL: [Self; 9] = [
        Self::Webp,
        Self::WebpNonopt,
        Self::Libjpegturbo,
        Self::LibjpegturboNonopt,
        Self::Jpegli,
        Self::X265,
        Self::X265Nonopt,
        Self::Svtav1,
        Self::Mediacodec,
    ];

    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::WebpNonopt => "webp-nonopt",
            Self::Libjpegturbo => "libjpegturbo",
            Self::LibjpegturboNonopt => "libjpegturbo-nonopt",
            Self::Jpegli => "jpegli",
            Self::X265 => "x265-8bit",
            Self::X265Nonopt => "x265-8bit-nonopt",
            Self::Svtav1 => "svtav1",
            Self::Mediacodec => "mediacodec",
        }
    }

    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    #[must_use]
    pub fn family(self) -> CodecFamily {
        match self {
            Self::Webp | Self::WebpNonopt => CodecFamily::Webp,
            Self::Libjpegturbo | Self::LibjpegturboNonopt => CodecFamily::Libjpegturbo,
            Self::Jpegli => CodecFamily::Jpegli,
            Self::X265 | Self::X265Nonopt => CodecFamily::X265,
            Self::Svtav1 => CodecFamily::Svtav1,
            Self::Mediacodec => CodecFamily::Mediacodec,
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self.family() {
            CodecFamily::Webp => "webp",
            CodecFamily::Libjpegturbo | CodecFamily::Jpegli => "jpeg",
            CodecFamily::X265 => "265",
            CodecFamily::Svtav1 => "av1",
            CodecFamily::Mediacodec => "bin",
        }
    }

    /// Parameters fixed by the tag itself; they override user values.
    #[must_use]
    pub fn implied_parameters(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Webp | Self::Libjpegturbo | Self::X265 => &[("optimization", "opt")],
            Self::WebpNonopt | Self::LibjpegturboNonopt | Self::X265Nonopt => {
                &[("optimization", "nonopt")]
            }
            Self::Jpegli | Self::Svtav1 | Self::Mediacodec => &[],
        }
    }

    /// Whether `all` selects this codec on the current platform.
    #[must_use]
    pub fn in_all(self) -> bool {
        match self {
            Self::WebpNonopt | Self::LibjpegturboNonopt | Self::X265Nonopt => false,
            Self::Mediacodec => cfg!(target_os = "android"),
            _ => true,
        }
    }
}

impl Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Parses a comma-separated codec selector. `all` expands to the stable
/// subset; the result is in dispatch order without duplicates.
pub fn parse_codec_selector(selector: &str) -> Result<Vec<CodecKind>, RunnerError> {
    let mut selected = Vec::new();
    for item in selector.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        if item == "all" {
            selected.extend(CodecKind::ALL.into_iter().filter(|kind| kind.in_all()));
            continue;
        }
        let kind = CodecKind::parse(item).ok_or_else(|| {
            RunnerError::InvalidInput(format!(
                "unknown codec '{item}' (valid: all, {})",
                CodecKind::ALL.map(CodecKind::tag).join(", ")
            ))
        })?;
        selected.push(kind);
    }
    if selected.is_empty() {
        return Err(RunnerError::InvalidInput(format!("empty codec selector '{selector}'")));
    }
    selected.sort();
    selected.dedup();
    Ok(selected)
}

/// `{dir}/{prefix}.{tag}.index_{i}.width_{W}.height_{H}.color_{fmt}.{ext}`
#[must_use]
pub fn output_filename(
    dir: &Path,
    prefix: &str,
    kind: CodecKind,
    index: usize,
    width: i32,
    height: i32,
    color_format: ColorFormat,
) -> String {
    format!(
        "{}/{prefix}.{}.index_{index}.width_{width}.height_{height}.color_{color_format}.{}",
        dir.display(),
        kind.tag(),
        kind.extension()
    )
}

/// Everything one experiment needs.
#[derive(Debug, Clone)]
pub struct ExperimentConfig<'a> {
    pub buffer: &'a [u8],
    pub width: i32,
    pub height: i32,
    pub color_format: String,
    pub codec_selector: String,
    pub num_runs: usize,
    pub dump_output: bool,
    pub dump_output_dir: PathBuf,
    pub dump_output_prefix: String,
    pub debug_level: u32,
    /// User parameters per family; families without an entry use defaults.
    pub setups: BTreeMap<CodecFamily, CodecSetup>,
}

impl<'a> ExperimentConfig<'a> {
    #[must_use]
    pub fn new(buffer: &'a [u8], width: i32, height: i32, codec_selector: &str) -> Self {
        Self {
            buffer,
            width,
            height,
            color_format: ColorFormat::Yuv420p.as_str().to_string(),
            codec_selector: codec_selector.to_string(),
            num_runs: 1,
            dump_output: false,
            dump_output_dir: PathBuf::from("."),
            dump_output_prefix: "anicet.output".to_string(),
            debug_level: 0,
            setups: BTreeMap::new(),
        }
    }

    /// Setup for one selected codec: the family's user parameters, the
    /// run count and the tag-implied parameters.
    fn setup_for(&self, kind: CodecKind) -> CodecSetup {
        let mut setup = self
            .setups
            .get(&kind.family())
            .cloned()
            .unwrap_or_default();
        setup.num_runs = self.num_runs;
        for &(name, value) in kind.implied_parameters() {
            if let Some(previous) = setup.get(name).map(ToString::to_string) {
                if previous != value {
                    warn!(codec = kind.tag(), name, %previous, value, "codec tag overrides parameter");
                }
            }
            setup.set(name, value);
        }
        setup
    }
}

impl Display for ExperimentConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExperimentConfig(input={}x{} {} ({} bytes), codecs={}, num_runs={}, dump_output={}",
            self.width,
            self.height,
            self.color_format,
            self.buffer.len(),
            self.codec_selector,
            self.num_runs,
            self.dump_output
        )?;
        if self.dump_output {
            write!(
                f,
                ", dump={}/{}",
                self.dump_output_dir.display(),
                self.dump_output_prefix
            )?;
        }
        for (family, setup) in &self.setups {
            write!(f, ", {family}={setup}")?;
        }
        f.write_str(")")
    }
}

/// Runs every selected codec on the input and accumulates their outputs
/// into `output`. Invalid inputs or selectors fail before any backend is
/// touched; afterwards each failing codec is logged and counted, and the
/// count is returned.
pub fn run_experiment(config: &ExperimentConfig<'_>, output: &mut CodecOutput) -> Result<usize, RunnerError> {
    *output = CodecOutput::new(config.dump_output);
    let color_format = ColorFormat::parse(&config.color_format).ok_or_else(|| {
        RunnerError::InvalidInput(format!(
            "unsupported color format '{}' (only yuv420p)",
            config.color_format
        ))
    })?;
    if config.num_runs == 0 {
        return Err(RunnerError::InvalidInput("num_runs must be positive".to_string()));
    }
    let mut input = CodecInput::new(config.buffer, config.width, config.height, color_format);
    input.debug_level = config.debug_level;
    input.validate()?;
    let selected = parse_codec_selector(&config.codec_selector)?;
    binder::set_debug_level(config.debug_level);
    info!(%config, "starting experiment");

    let mut errors = 0;
    for kind in selected {
        let family = kind.family();
        let mut setup = config.setup_for(kind);
        if let Err(err) = validate_dependencies(family.name(), family.descriptors(), &setup) {
            error!(codec = kind.tag(), %err, "invalid parameters");
            errors += 1;
            continue;
        }

        let mut local = CodecOutput::new(config.dump_output);
        match family.run(&input, &mut setup, &mut local) {
            Ok(()) if local.num_frames() > 0 => {}
            Ok(()) => {
                error!(codec = kind.tag(), "encoding produced no frames");
                errors += 1;
                continue;
            }
            Err(RunnerError::Unsupported(codec)) => {
                warn!(codec, "skipped: not available on this platform");
                continue;
            }
            Err(err) => {
                error!(codec = kind.tag(), %err, "encoding failed");
                errors += 1;
                continue;
            }
        }

        let parameters = sorted_parameters(family.descriptors(), &setup.parameter_map);
        for index in 0..local.num_frames() {
            let file = output_filename(
                &config.dump_output_dir,
                &config.dump_output_prefix,
                kind,
                index,
                config.width,
                config.height,
                color_format,
            );
            if let Some(bytes) = local.frame_buffers.get(index) {
                match std::fs::write(&file, bytes) {
                    Ok(()) => debug!(codec = kind.tag(), %file, size = bytes.len(), "wrote frame"),
                    Err(err) => error!(codec = kind.tag(), %file, %err, "cannot write frame"),
                }
            }
            local.output_files.push(file);
            local.frame_codecs.push(FrameCodec {
                codec: kind.tag(),
                parameters: parameters.clone(),
            });
        }
        info!(codec = kind.tag(), %setup, frames = local.num_frames(), "codec finished");
        output.append(local);
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::contract::CodecSetupValue;

    #[test]
    fn all_skips_nonopt_variants() {
        let selected = parse_codec_selector("all").expect("all parses");
        assert!(selected.contains(&CodecKind::Webp));
        assert!(selected.contains(&CodecKind::Svtav1));
        assert!(!selected.contains(&CodecKind::WebpNonopt));
        assert!(!selected.contains(&CodecKind::X265Nonopt));
        assert_eq!(selected.contains(&CodecKind::Mediacodec), cfg!(target_os = "android"));
    }

    #[test]
    fn selector_trims_and_keeps_dispatch_order() {
        let selected = parse_codec_selector(" svtav1 , webp-nonopt,webp ,svtav1").expect("selector parses");
        assert_eq!(selected, vec![CodecKind::Webp, CodecKind::WebpNonopt, CodecKind::Svtav1]);
    }

    #[rstest]
    #[case("webp,warp")]
    #[case("")]
    #[case(" , ")]
    fn bad_selectors_are_rejected(#[case] selector: &str) {
        assert!(matches!(parse_codec_selector(selector), Err(RunnerError::InvalidInput(_))));
    }

    #[rstest]
    #[case(CodecKind::Webp, "webp")]
    #[case(CodecKind::LibjpegturboNonopt, "jpeg")]
    #[case(CodecKind::Jpegli, "jpeg")]
    #[case(CodecKind::X265Nonopt, "265")]
    #[case(CodecKind::Svtav1, "av1")]
    #[case(CodecKind::Mediacodec, "bin")]
    fn extensions_follow_family(#[case] kind: CodecKind, #[case] ext: &str) {
        assert_eq!(kind.extension(), ext);
        assert_eq!(CodecKind::parse(kind.tag()), Some(kind));
    }

    #[test]
    fn filename_has_stable_layout() {
        let name = output_filename(
            Path::new("/tmp/out"),
            "anicet.output",
            CodecKind::X265,
            3,
            16,
            16,
            ColorFormat::Yuv420p,
        );
        assert_eq!(
            name,
            "/tmp/out/anicet.output.x265-8bit.index_3.width_16.height_16.color_yuv420p.265"
        );
    }

    #[test]
    fn tag_overrides_user_optimization() {
        let buffer = [0u8; 6];
        let mut config = ExperimentConfig::new(&buffer, 2, 2, "webp-nonopt");
        config.num_runs = 4;
        let mut user = CodecSetup::new(1);
        user.set("optimization", "opt");
        user.set("quality", 90);
        config.setups.insert(CodecFamily::Webp, user);
        let setup = config.setup_for(CodecKind::WebpNonopt);
        assert_eq!(setup.num_runs, 4);
        assert_eq!(setup.get("optimization"), Some(&CodecSetupValue::from("nonopt")));
        assert_eq!(setup.get("quality"), Some(&CodecSetupValue::Int(90)));
        assert!(config.setup_for(CodecKind::Jpegli).parameter_map.is_empty());
    }

    #[test]
    fn non_yuv420p_input_is_rejected_up_front() {
        let buffer = [0u8; 6];
        let mut config = ExperimentConfig::new(&buffer, 2, 2, "webp");
        config.color_format = "nv12".to_string();
        let mut output = CodecOutput::new(false);
        assert!(matches!(
            run_experiment(&config, &mut output),
            Err(RunnerError::InvalidInput(_))
        ));
        assert_eq!(output.num_frames(), 0);
    }

    #[test]
    fn unmet_dependency_counts_as_error() {
        let buffer = [128u8; 16 * 16 * 3 / 2];
        let mut config = ExperimentConfig::new(&buffer, 16, 16, "x265-8bit");
        let mut user = CodecSetup::new(1);
        user.set("qp", 30);
        config.setups.insert(CodecFamily::X265, user);
        let mut output = CodecOutput::new(false);
        assert_eq!(run_experiment(&config, &mut output).expect("valid input"), 1);
        assert_eq!(output.num_frames(), 0);
    }

    #[test]
    fn config_display_lists_family_setups() {
        let buffer = [0u8; 6];
        let mut config = ExperimentConfig::new(&buffer, 2, 2, "jpegli");
        let mut user = CodecSetup::new(1);
        user.set("quality", 60);
        config.setups.insert(CodecFamily::Jpegli, user);
        let text = config.to_string();
        assert!(text.contains("input=2x2 yuv420p (6 bytes)"));
        assert!(text.contains("jpegli=CodecSetup(num_runs=1, quality=60)"));
    }
}

use std::collections::BTreeMap;
use std::{fmt, fmt::Display};

use serde::Serialize;

use crate::parameter::{ParameterDescriptor, ParameterError};
use crate::profiler::ResourceDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Yuv420p,
}

impl ColorFormat {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yuv420p" => Some(Self::Yuv420p),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
        }
    }
}

impl Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw planar YUV 4:2:0 frame, immutable for the duration of a run.
#[derive(Debug, Clone, Copy)]
pub struct CodecInput<'a> {
    pub buffer: &'a [u8],
    pub width: i32,
    pub height: i32,
    pub color_format: ColorFormat,
    pub debug_level: u32,
}

impl<'a> CodecInput<'a> {
    #[must_use]
    pub fn new(buffer: &'a [u8], width: i32, height: i32, color_format: ColorFormat) -> Self {
        Self {
            buffer,
            width,
            height,
            color_format,
            debug_level: 0,
        }
    }

    #[must_use]
    pub fn luma_size(&self) -> usize {
        self.width.max(0) as usize * self.height.max(0) as usize
    }

    #[must_use]
    pub fn chroma_width(&self) -> usize {
        self.width.max(0) as usize / 2
    }

    #[must_use]
    pub fn chroma_height(&self) -> usize {
        self.height.max(0) as usize / 2
    }

    #[must_use]
    pub fn chroma_size(&self) -> usize {
        self.chroma_width() * self.chroma_height()
    }

    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.luma_size() + 2 * self.chroma_size()
    }

    /// Checks the buffer against the declared geometry.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.buffer.is_empty() {
            return Err(RunnerError::InvalidInput("empty input buffer".to_string()));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(RunnerError::InvalidInput(format!(
                "non-positive dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.height % 2 != 0 {
            return Err(RunnerError::InvalidInput(format!(
                "height {} is not even",
                self.height
            )));
        }
        if self.buffer.len() < self.frame_size() {
            return Err(RunnerError::InvalidInput(format!(
                "buffer holds {} bytes, {}x{} {} needs {}",
                self.buffer.len(),
                self.width,
                self.height,
                self.color_format,
                self.frame_size()
            )));
        }
        Ok(())
    }

    /// Y, U and V planes, each row-major and unpadded.
    #[must_use]
    pub fn planes(&self) -> (&'a [u8], &'a [u8], &'a [u8]) {
        let luma = self.luma_size();
        let chroma = self.chroma_size();
        let (y, rest) = self.buffer.split_at(luma.min(self.buffer.len()));
        let (u, rest) = rest.split_at(chroma.min(rest.len()));
        let v = &rest[..chroma.min(rest.len())];
        (y, u, v)
    }
}

impl Display for CodecInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CodecInput({}x{}, color_format={}, size={}, debug_level={})",
            self.width,
            self.height,
            self.color_format,
            self.buffer.len(),
            self.debug_level
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CodecSetupValue {
    Int(i32),
    Double(f64),
    Str(String),
}

impl CodecSetupValue {
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::Str(_) => "string",
        }
    }

    pub fn as_int(&self, name: &str) -> Result<i32, ParameterError> {
        match self {
            Self::Int(value) => Ok(*value),
            other => Err(ParameterError::WrongVariant {
                name: name.to_string(),
                expected: "int",
                actual: other.variant_name(),
            }),
        }
    }

    pub fn as_double(&self, name: &str) -> Result<f64, ParameterError> {
        match self {
            Self::Double(value) => Ok(*value),
            other => Err(ParameterError::WrongVariant {
                name: name.to_string(),
                expected: "double",
                actual: other.variant_name(),
            }),
        }
    }

    pub fn as_str(&self, name: &str) -> Result<&str, ParameterError> {
        match self {
            Self::Str(value) => Ok(value),
            other => Err(ParameterError::WrongVariant {
                name: name.to_string(),
                expected: "string",
                actual: other.variant_name(),
            }),
        }
    }
}

impl Display for CodecSetupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value:.2}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<i32> for CodecSetupValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for CodecSetupValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for CodecSetupValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for CodecSetupValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

pub type ParameterMap = BTreeMap<String, CodecSetupValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecSetup {
    pub num_runs: usize,
    pub parameter_map: ParameterMap,
}

impl CodecSetup {
    #[must_use]
    pub fn new(num_runs: usize) -> Self {
        Self {
            num_runs,
            parameter_map: ParameterMap::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<CodecSetupValue>) {
        self.parameter_map.insert(name.to_string(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CodecSetupValue> {
        self.parameter_map.get(name)
    }

    fn resolve<'s>(
        &'s mut self,
        descriptors: &[ParameterDescriptor],
        name: &str,
    ) -> Result<&'s CodecSetupValue, ParameterError> {
        if !self.parameter_map.contains_key(name) {
            let descriptor = descriptors
                .iter()
                .find(|descriptor| descriptor.name == name)
                .ok_or_else(|| ParameterError::NoDescriptor(name.to_string()))?;
            self.parameter_map
                .insert(name.to_string(), descriptor.default_value());
        }
        self.parameter_map
            .get(name)
            .ok_or_else(|| ParameterError::NoDescriptor(name.to_string()))
    }

    /// Reads an integer parameter, writing the descriptor default back when
    /// the caller did not supply one.
    pub fn int_or_default(
        &mut self,
        descriptors: &[ParameterDescriptor],
        name: &str,
    ) -> Result<i32, ParameterError> {
        self.resolve(descriptors, name)?.as_int(name)
    }

    pub fn double_or_default(
        &mut self,
        descriptors: &[ParameterDescriptor],
        name: &str,
    ) -> Result<f64, ParameterError> {
        self.resolve(descriptors, name)?.as_double(name)
    }

    pub fn str_or_default(
        &mut self,
        descriptors: &[ParameterDescriptor],
        name: &str,
    ) -> Result<String, ParameterError> {
        self.resolve(descriptors, name)?
            .as_str(name)
            .map(str::to_string)
    }
}

impl Display for CodecSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecSetup(num_runs={}", self.num_runs)?;
        for (name, value) in &self.parameter_map {
            write!(f, ", {name}={value}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameTiming {
    pub input_timestamp_us: i64,
    pub output_timestamp_us: i64,
}

impl FrameTiming {
    #[must_use]
    pub fn encode_time_us(&self) -> i64 {
        self.output_timestamp_us - self.input_timestamp_us
    }
}

/// Which codec produced a frame, with its final parameters in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCodec {
    pub codec: &'static str,
    pub parameters: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct CodecOutput {
    pub frame_buffers: Vec<Vec<u8>>,
    pub frame_sizes: Vec<usize>,
    pub timings: Vec<FrameTiming>,
    pub profile_encode_cpu_ms: Vec<f64>,
    pub output_files: Vec<String>,
    pub frame_codecs: Vec<FrameCodec>,
    pub profile_encode_mem_kb: i64,
    pub resource_delta: ResourceDelta,
    pub dump_output: bool,
}

impl CodecOutput {
    #[must_use]
    pub fn new(dump_output: bool) -> Self {
        Self {
            dump_output,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.frame_sizes.len()
    }

    /// Clears the per-frame sequences and reserves room for `num_runs` frames.
    pub fn begin(&mut self, num_runs: usize) {
        self.frame_sizes.clear();
        self.frame_sizes.reserve(num_runs);
        self.frame_buffers.clear();
        if self.dump_output {
            self.frame_buffers.reserve(num_runs);
        }
        self.timings.clear();
        self.timings.reserve(num_runs);
        self.profile_encode_cpu_ms.clear();
        self.profile_encode_cpu_ms.reserve(num_runs);
    }

    /// Records one emitted frame. The bytes are kept only when dumping.
    pub fn push_frame(&mut self, timing: FrameTiming, bytes: &[u8], cpu_ms: f64) {
        self.frame_sizes.push(bytes.len());
        if self.dump_output {
            self.frame_buffers.push(bytes.to_vec());
        }
        self.timings.push(timing);
        self.profile_encode_cpu_ms.push(cpu_ms);
    }

    /// Appends `src` into `self`: sequences concatenate, `dump_output` is
    /// sticky, peak memory takes the maximum and resource deltas add up.
    pub fn append(&mut self, src: CodecOutput) {
        self.frame_buffers.extend(src.frame_buffers);
        self.frame_sizes.extend(src.frame_sizes);
        self.timings.extend(src.timings);
        self.output_files.extend(src.output_files);
        self.profile_encode_cpu_ms.extend(src.profile_encode_cpu_ms);
        self.frame_codecs.extend(src.frame_codecs);
        self.dump_output |= src.dump_output;
        self.profile_encode_mem_kb = self.profile_encode_mem_kb.max(src.profile_encode_mem_kb);
        self.resource_delta += &src.resource_delta;
    }
}

impl Display for CodecOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CodecOutput(frames={}, bytes={}, files={}, mem_kb={}, dump_output={})",
            self.num_frames(),
            self.frame_sizes.iter().sum::<usize>(),
            self.output_files.len(),
            self.profile_encode_mem_kb,
            self.dump_output
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error("{module}: failed to load library: {source}")]
    LoadLibrary {
        module: String,
        #[source]
        source: libloading::Error,
    },
    #[error("{module}: failed to load symbol {symbol}: {source}")]
    MissingSymbol {
        module: String,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
    #[error("{codec}: {message}")]
    Configure { codec: &'static str, message: String },
    #[error("{codec}: encoding failed (run {run}): {message}")]
    Encode {
        codec: &'static str,
        run: usize,
        message: String,
    },
    #[error("{codec}: produced {produced} of {expected} frames")]
    ShortOutput {
        codec: &'static str,
        produced: usize,
        expected: usize,
    },
    #[error("{0}: not available on this platform")]
    Unsupported(&'static str),
}

/// Uniform four-phase contract: setup, input conversion, encode loop,
/// cleanup. Implementations append to `output` and write every consulted
/// parameter back into `setup`.
pub(crate) trait EncoderRunner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn gray_frame(width: usize, height: usize) -> Vec<u8> {
        vec![128u8; width * height * 3 / 2]
    }

    #[test]
    fn planes_split_yuv420p_layout() {
        let mut buffer = vec![0u8; 16 * 16];
        buffer.extend(vec![1u8; 64]);
        buffer.extend(vec![2u8; 64]);
        let input = CodecInput::new(&buffer, 16, 16, ColorFormat::Yuv420p);
        let (y, u, v) = input.planes();
        assert_eq!(y.len(), 256);
        assert_eq!(u.len(), 64);
        assert_eq!(v.len(), 64);
        assert!(u.iter().all(|&b| b == 1));
        assert!(v.iter().all(|&b| b == 2));
        assert_eq!(input.frame_size(), 384);
    }

    #[rstest]
    #[case(0, 16, 384)]
    #[case(16, -2, 384)]
    #[case(16, 15, 384)]
    #[case(16, 16, 383)]
    #[case(16, 16, 0)]
    fn rejects_invalid_input(#[case] width: i32, #[case] height: i32, #[case] size: usize) {
        let buffer = vec![128u8; size];
        let input = CodecInput::new(&buffer, width, height, ColorFormat::Yuv420p);
        assert!(matches!(input.validate(), Err(RunnerError::InvalidInput(_))));
    }

    #[test]
    fn accepts_consistent_input() {
        let buffer = gray_frame(16, 16);
        let input = CodecInput::new(&buffer, 16, 16, ColorFormat::Yuv420p);
        input.validate().expect("16x16 yuv420p should validate");
    }

    #[test]
    fn color_format_only_knows_yuv420p() {
        assert_eq!(ColorFormat::parse("yuv420p"), Some(ColorFormat::Yuv420p));
        assert_eq!(ColorFormat::parse("nv12"), None);
    }

    #[test]
    fn setup_value_reads_fail_on_wrong_variant() {
        let value = CodecSetupValue::from("medium");
        assert_eq!(value.as_str("preset").expect("string read"), "medium");
        let err = value.as_int("preset").expect_err("int read must fail");
        assert!(matches!(
            err,
            ParameterError::WrongVariant {
                expected: "int",
                actual: "string",
                ..
            }
        ));
        assert_eq!(CodecSetupValue::Double(0.5).to_string(), "0.50");
    }

    #[test]
    fn push_frame_keeps_bytes_only_when_dumping() {
        let timing = FrameTiming {
            input_timestamp_us: 10,
            output_timestamp_us: 25,
        };
        let mut kept = CodecOutput::new(true);
        kept.begin(2);
        kept.push_frame(timing, &[1, 2, 3], 0.5);
        assert_eq!(kept.frame_sizes, vec![3]);
        assert_eq!(kept.frame_buffers, vec![vec![1, 2, 3]]);

        let mut dropped = CodecOutput::new(false);
        dropped.begin(2);
        dropped.push_frame(timing, &[1, 2, 3], 0.5);
        assert_eq!(dropped.frame_sizes, vec![3]);
        assert!(dropped.frame_buffers.is_empty());
        assert_eq!(dropped.timings[0].encode_time_us(), 15);
    }

    #[test]
    fn append_accumulates_outputs() {
        let timing = FrameTiming::default();
        let mut first = CodecOutput::new(false);
        first.push_frame(timing, &[0; 4], 1.0);
        first.output_files.push("a.webp".to_string());
        first.profile_encode_mem_kb = 900;
        first.resource_delta.minor_faults = 3;
        first.resource_delta.wall_time_ms = 2.0;

        let mut second = CodecOutput::new(true);
        second.push_frame(timing, &[0; 6], 2.0);
        second.output_files.push("b.jpeg".to_string());
        second.profile_encode_mem_kb = 700;
        second.resource_delta.minor_faults = 4;
        second.resource_delta.wall_time_ms = 3.0;

        let mut total = CodecOutput::new(false);
        total.append(first);
        total.append(second);
        assert_eq!(total.frame_sizes, vec![4, 6]);
        assert_eq!(total.profile_encode_cpu_ms, vec![1.0, 2.0]);
        assert_eq!(total.output_files, vec!["a.webp", "b.jpeg"]);
        assert!(total.dump_output);
        assert_eq!(total.profile_encode_mem_kb, 900);
        assert_eq!(total.resource_delta.minor_faults, 7);
        assert_eq!(total.resource_delta.wall_time_ms, 5.0);
        assert_eq!(total.num_frames(), 2);
    }

    #[test]
    fn dump_output_flag_stays_set() {
        let mut total = CodecOutput::new(true);
        total.append(CodecOutput::new(false));
        assert!(total.dump_output);
    }
}

use std::process::Command;

use crate::contract::{CodecInput, CodecSetup, RunnerError};
use crate::parameter::ParameterDescriptor;

pub(crate) const CODEC: &str = "mediacodec";
const DUMPSYS: &str = "/system/bin/dumpsys";
const FALLBACK_QUALITY: i32 = 80;
pub(crate) const FRAME_RATE: i32 = 30;

pub const COLOR_FORMAT_YUV420_PLANAR: i32 = 19;
pub const COLOR_FORMAT_YUV420_PACKED_PLANAR: i32 = 20;
pub const COLOR_FORMAT_YUV420_SEMI_PLANAR: i32 = 21;
pub const COLOR_FORMAT_YUV420_PACKED_SEMI_PLANAR: i32 = 39;
pub const COLOR_FORMAT_YUV420_FLEXIBLE: i32 = 0x7F42_0888;

pub const MEDIACODEC_PARAMETERS: &[ParameterDescriptor] = &[
    ParameterDescriptor::string_list(
        "codec_name",
        "Encoder name as listed by --list-codecs (empty = default encoder for the type)",
        &[],
        "",
    )
    .with_order(0),
    ParameterDescriptor::integer("quality", "Quality used to derive the bitrate", 0, 100, 75).with_order(1),
    ParameterDescriptor::integer(
        "bitrate",
        "Target bitrate in bps (-1 = derive from quality)",
        -1,
        100_000_000,
        -1,
    )
    .with_order(2),
    ParameterDescriptor::integer("bitrate_mode", "Bitrate mode (0 = CQ, 1 = VBR, 2 = CBR)", 0, 2, 1)
        .with_order(3),
];

/// Media type for an encoder name, by substring; HEVC when nothing matches.
#[must_use]
pub fn mime_type(codec_name: &str) -> &'static str {
    const TABLE: &[(&[&str], &str)] = &[
        (&["heic"], "image/vnd.android.heic"),
        (&["hevc"], "video/hevc"),
        (&["avc", "h264"], "video/avc"),
        (&["vp9"], "video/x-vnd.on2.vp9"),
        (&["vp8"], "video/x-vnd.on2.vp8"),
        (&["av1"], "video/av01"),
    ];
    TABLE
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| codec_name.contains(needle)))
        .map_or("video/hevc", |(_, mime)| mime)
}

/// MediaCodec color-format constant for a color format name.
#[must_use]
pub fn color_format_id(name: &str) -> i32 {
    match name {
        "yuv420p" | "i420" | "iyuv" => COLOR_FORMAT_YUV420_PLANAR,
        "nv12" | "nv21" | "yuv420sp" | "yuv420spsemi" => COLOR_FORMAT_YUV420_SEMI_PLANAR,
        "yuv420packedplanar" => COLOR_FORMAT_YUV420_PACKED_PLANAR,
        "yuv420packedsemiplanar" => COLOR_FORMAT_YUV420_PACKED_SEMI_PLANAR,
        "yuv420flexible" | "flex" | "flexible" => COLOR_FORMAT_YUV420_FLEXIBLE,
        _ => COLOR_FORMAT_YUV420_PLANAR,
    }
}

/// Pixel rate times `0.05 + 0.20 * quality / 100` bits per pixel.
#[must_use]
pub fn bitrate_for_quality(quality: i32, width: i32, height: i32) -> i32 {
    let quality = if (0..=100).contains(&quality) {
        quality
    } else {
        FALLBACK_QUALITY
    };
    let pixels_per_second = i64::from(width) * i64::from(height) * i64::from(FRAME_RATE);
    let bits_per_pixel = 0.05 + f64::from(quality) / 100.0 * 0.20;
    (pixels_per_second as f64 * bits_per_pixel) as i32
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatValue {
    Int(i32),
    Str(&'static str),
}

/// Everything written into the codec's `AMediaFormat`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormatSpec {
    pub codec_name: String,
    pub mime: &'static str,
    pub width: i32,
    pub height: i32,
    pub color_format: i32,
    pub bitrate: i32,
    pub bitrate_mode: i32,
}

impl MediaFormatSpec {
    /// Reads the codec parameters, writing back the defaults used.
    pub fn from_setup(input: &CodecInput<'_>, setup: &mut CodecSetup) -> Result<Self, RunnerError> {
        let codec_name = setup.str_or_default(MEDIACODEC_PARAMETERS, "codec_name")?;
        let quality = setup.int_or_default(MEDIACODEC_PARAMETERS, "quality")?;
        let bitrate = setup.int_or_default(MEDIACODEC_PARAMETERS, "bitrate")?;
        let bitrate_mode = setup.int_or_default(MEDIACODEC_PARAMETERS, "bitrate_mode")?;
        let bitrate = if bitrate < 0 {
            bitrate_for_quality(quality, input.width, input.height)
        } else {
            bitrate
        };
        Ok(Self {
            mime: mime_type(&codec_name),
            codec_name,
            width: input.width,
            height: input.height,
            color_format: color_format_id(input.color_format.as_str()),
            bitrate,
            bitrate_mode,
        })
    }

    /// Format keys in the order they are applied.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, FormatValue)> {
        vec![
            ("mime", FormatValue::Str(self.mime)),
            ("width", FormatValue::Int(self.width)),
            ("height", FormatValue::Int(self.height)),
            ("color-format", FormatValue::Int(self.color_format)),
            ("frame-rate", FormatValue::Int(FRAME_RATE)),
            ("i-frame-interval", FormatValue::Int(0)),
            ("bitrate", FormatValue::Int(self.bitrate)),
            ("bitrate-mode", FormatValue::Int(self.bitrate_mode)),
            ("max-bframes", FormatValue::Int(0)),
        ]
    }
}

fn is_image_codec(name: &str) -> bool {
    ["hevc", "heic", "avc", "h264", "vp9", "av1"]
        .iter()
        .any(|needle| name.contains(needle))
}

/// Encoder names from `dumpsys media.player` lines such as
/// `  Encoder "c2.android.hevc.encoder" supports`.
#[must_use]
pub fn parse_encoder_list(dumpsys: &str, image_only: bool) -> Vec<String> {
    dumpsys
        .lines()
        .filter(|line| line.contains("Encoder \""))
        .filter_map(|line| {
            let start = line.find('"')? + 1;
            let len = line[start..].find('"')?;
            Some(line[start..start + len].to_string())
        })
        .filter(|name| !image_only || is_image_codec(name))
        .collect()
}

/// Runs `dumpsys media.player` and lists the platform encoders.
pub fn list_encoders(image_only: bool) -> Result<Vec<String>, RunnerError> {
    let output = Command::new(DUMPSYS)
        .arg("media.player")
        .output()
        .map_err(|err| RunnerError::Configure {
            codec: CODEC,
            message: format!("cannot run {DUMPSYS}: {err}"),
        })?;
    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout), image_only))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::contract::{CodecSetupValue, ColorFormat};

    #[rstest]
    #[case("c2.android.hevc.encoder", "video/hevc")]
    #[case("c2.qti.heic.encoder", "image/vnd.android.heic")]
    #[case("OMX.google.h264.encoder", "video/avc")]
    #[case("c2.android.avc.encoder", "video/avc")]
    #[case("c2.android.vp9.encoder", "video/x-vnd.on2.vp9")]
    #[case("c2.android.vp8.encoder", "video/x-vnd.on2.vp8")]
    #[case("c2.android.av1.encoder", "video/av01")]
    #[case("", "video/hevc")]
    #[case("c2.vendor.unknown", "video/hevc")]
    fn mime_follows_name(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(mime_type(name), expected);
    }

    #[rstest]
    #[case("yuv420p", 19)]
    #[case("iyuv", 19)]
    #[case("nv21", 21)]
    #[case("yuv420packedplanar", 20)]
    #[case("yuv420packedsemiplanar", 39)]
    #[case("flex", 0x7F42_0888)]
    #[case("rgb24", 19)]
    fn color_formats_map_to_constants(#[case] name: &str, #[case] expected: i32) {
        assert_eq!(color_format_id(name), expected);
    }

    #[test]
    fn bitrate_heuristic_scales_with_quality() {
        // 16x16 at 30 fps = 7680 pixels/s.
        assert_eq!(bitrate_for_quality(0, 16, 16), 384);
        assert_eq!(bitrate_for_quality(100, 16, 16), 1920);
        assert_eq!(bitrate_for_quality(101, 16, 16), bitrate_for_quality(80, 16, 16));
        assert_eq!(bitrate_for_quality(-5, 16, 16), bitrate_for_quality(80, 16, 16));
    }

    #[test]
    fn spec_derives_bitrate_and_writes_back_defaults() {
        let buffer = vec![0u8; 16 * 16 * 3 / 2];
        let input = CodecInput::new(&buffer, 16, 16, ColorFormat::Yuv420p);
        let mut setup = CodecSetup::new(1);
        setup.set("codec_name", "c2.android.avc.encoder");
        let spec = MediaFormatSpec::from_setup(&input, &mut setup).expect("defaults resolve");
        assert_eq!(spec.mime, "video/avc");
        assert_eq!(spec.bitrate, bitrate_for_quality(75, 16, 16));
        assert_eq!(spec.color_format, 19);
        assert_eq!(setup.get("bitrate"), Some(&CodecSetupValue::Int(-1)));
        assert_eq!(setup.get("bitrate_mode"), Some(&CodecSetupValue::Int(1)));

        let keys = spec.entries().into_iter().map(|(key, _)| key).collect::<Vec<_>>();
        assert_eq!(keys.first(), Some(&"mime"));
        assert!(keys.contains(&"i-frame-interval"));
        assert!(keys.contains(&"max-bframes"));
    }

    #[test]
    fn explicit_bitrate_is_kept() {
        let buffer = vec![0u8; 16 * 16 * 3 / 2];
        let input = CodecInput::new(&buffer, 16, 16, ColorFormat::Yuv420p);
        let mut setup = CodecSetup::new(1);
        setup.set("bitrate", 500_000);
        let spec = MediaFormatSpec::from_setup(&input, &mut setup).expect("bitrate resolves");
        assert_eq!(spec.bitrate, 500_000);
    }

    const DUMPSYS_SAMPLE: &str = r#"
Media Codec list (encoders):
  Encoder "c2.android.hevc.encoder" supports
    mime: video/hevc
  Encoder "c2.android.aac.encoder" supports
  Encoder "c2.exynos.h264.encoder" supports
Decoders:
  Decoder "c2.android.hevc.decoder" supports
  Encoder "broken
"#;

    #[test]
    fn encoder_list_reads_quoted_names() {
        assert_eq!(
            parse_encoder_list(DUMPSYS_SAMPLE, false),
            vec![
                "c2.android.hevc.encoder",
                "c2.android.aac.encoder",
                "c2.exynos.h264.encoder"
            ]
        );
    }

    #[test]
    fn image_filter_drops_audio_encoders() {
        assert_eq!(
            parse_encoder_list(DUMPSYS_SAMPLE, true),
            vec!["c2.android.hevc.encoder", "c2.exynos.h264.encoder"]
        );
    }
}

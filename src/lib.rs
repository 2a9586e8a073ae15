//! Encoder benchmarking harness: runs one raw YUV 4:2:0 frame through
//! software and platform encoders, collecting per-frame timings, encoded
//! sizes and process resource usage.

pub mod binder;
mod contract;
mod experiment;
mod jpegli_backend;
mod loader;
mod measure;
#[cfg(target_os = "android")]
mod mediacodec_backend;
mod mediacodec_format;
mod mediacodec_pump;
mod parameter;
mod profiler;
mod report;
mod runner;
mod svtav1_backend;
mod turbojpeg_backend;
mod webp_backend;
mod x265_backend;

pub use contract::{
    CodecInput, CodecOutput, CodecSetup, CodecSetupValue, ColorFormat, FrameCodec, FrameTiming,
    ParameterMap, RunnerError,
};
pub use experiment::{
    CodecFamily, CodecKind, ExperimentConfig, output_filename, parse_codec_selector,
    run_experiment,
};
pub use jpegli_backend::JPEGLI_PARAMETERS;
pub use loader::Optimization;
pub use measure::{
    DEFAULT_SIMPLEPERF, EXIT_EXEC_FAILED, EXIT_TIMEOUT, EXIT_TOOL_FAILURE, MeasureConfig,
    MeasureError, Measurement, SimpleperfConfig, apply_self_limits, format_csv, format_json,
    measure, parse_cpu_list, parse_simpleperf_output, parse_tag,
};
pub use mediacodec_format::{
    COLOR_FORMAT_YUV420_FLEXIBLE, COLOR_FORMAT_YUV420_PACKED_PLANAR,
    COLOR_FORMAT_YUV420_PACKED_SEMI_PLANAR, COLOR_FORMAT_YUV420_PLANAR,
    COLOR_FORMAT_YUV420_SEMI_PLANAR, FormatValue, MEDIACODEC_PARAMETERS, MediaFormatSpec,
    bitrate_for_quality, color_format_id, list_encoders, mime_type, parse_encoder_list,
};
pub use mediacodec_pump::{
    BUFFER_FLAG_CODEC_CONFIG, BUFFER_FLAG_END_OF_STREAM, BUFFER_FLAG_KEY_FRAME,
    BUFFER_FLAG_PARTIAL_FRAME, BufferInfo, CodecQueue, DEQUEUE_TIMEOUT_US, EncodedFrame,
    FRAME_DURATION_US, INFO_OUTPUT_BUFFERS_CHANGED, INFO_OUTPUT_FORMAT_CHANGED,
    INFO_TRY_AGAIN_LATER, InputSlot, OutputSlot, PumpStats, pump,
};
pub use parameter::{
    DEFAULT_ORDER, HelpVerbosity, ParameterDescriptor, ParameterError, ParameterKind,
    ParameterType, format_parameters, parse_parameter_string, print_parameter_help,
    render_parameter_help, sorted_descriptors, sorted_parameters, validate_and_set_parameter,
    validate_dependencies,
};
pub use profiler::{
    FrameProbe, ResourceDelta, ResourceScope, ResourceSnapshot, parse_status_kb,
    process_cpu_time_ns, timestamp_us,
};
pub use report::{InputSection, SetupSection, UNKNOWN_SERIAL, build_report, render_report, serial_number};
pub use svtav1_backend::SVTAV1_PARAMETERS;
pub use turbojpeg_backend::LIBJPEGTURBO_PARAMETERS;
pub use webp_backend::WEBP_PARAMETERS;
pub use x265_backend::X265_PARAMETERS;

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn descriptor_names_are_unique_per_family() {
        for family in CodecFamily::ALL {
            let names = family
                .descriptors()
                .iter()
                .map(|descriptor| descriptor.name)
                .collect::<HashSet<_>>();
            assert_eq!(names.len(), family.descriptors().len(), "{family}");
        }
    }

    #[test]
    fn descriptor_defaults_satisfy_their_own_ranges() {
        for family in CodecFamily::ALL {
            for descriptor in family.descriptors() {
                let mut setup = CodecSetup::new(1);
                let default = descriptor.default_value().to_string();
                // Free-form string lists accept anything, including "".
                if default.is_empty() {
                    continue;
                }
                validate_and_set_parameter(family.name(), descriptor.name, &default, descriptor, &mut setup)
                    .unwrap_or_else(|err| panic!("{family}.{}: {err}", descriptor.name));
            }
        }
    }

    #[test]
    fn every_kind_maps_to_a_family_with_an_optimization_switch_when_implied() {
        for kind in CodecKind::ALL {
            for (name, _) in kind.implied_parameters() {
                assert!(
                    kind.family().descriptors().iter().any(|d| d.name == *name),
                    "{kind} implies unknown parameter {name}"
                );
            }
        }
    }
}

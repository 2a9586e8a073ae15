use anicet::{
    CodecFamily, CodecOutput, CodecSetup, CodecSetupValue, ExperimentConfig, HelpVerbosity,
    ParameterDescriptor, ParameterError, X265_PARAMETERS, format_parameters,
    parse_parameter_string, render_parameter_help, run_experiment, validate_dependencies,
};
use rstest::rstest;

const FAST_MODE_TABLE: &[ParameterDescriptor] = &[
    ParameterDescriptor::string_list("optimization", "Optimization level", &["opt", "nonopt"], "opt")
        .with_order(0),
    ParameterDescriptor::string_list("fast_mode", "Fast path", &["true", "false"], "false")
        .requires("optimization", "opt"),
];

fn gray_frame() -> Vec<u8> {
    vec![128u8; 16 * 16 * 3 / 2]
}

#[test]
fn unknown_key_is_rejected_before_any_encoder_runs() {
    let mut setup = CodecSetup::new(1);
    let err = parse_parameter_string("x265", "speed=3", X265_PARAMETERS, &mut setup)
        .expect_err("unknown key must fail");
    assert!(matches!(err, ParameterError::UnknownParameter { ref key, .. } if key == "speed"));
    assert!(setup.parameter_map.is_empty());
}

#[test]
fn string_list_violation_lists_presets() {
    let mut setup = CodecSetup::new(1);
    let err = parse_parameter_string("x265", "preset=warp", X265_PARAMETERS, &mut setup)
        .expect_err("unknown preset must fail");
    let message = err.to_string();
    assert!(message.starts_with("x265: Invalid preset 'warp'. Valid values are: ultrafast"));
    assert!(message.contains("veryslow, placebo"));
}

#[test]
fn unmet_dependency_cites_required_pair() {
    let mut setup = CodecSetup::new(1);
    parse_parameter_string("demo", "optimization=nonopt:fast_mode=true", FAST_MODE_TABLE, &mut setup)
        .expect("values are individually valid");
    let err = validate_dependencies("demo", FAST_MODE_TABLE, &setup).expect_err("dependency unmet");
    assert!(err.to_string().contains("requires: optimization=opt"), "{err}");

    setup.set("optimization", "opt");
    validate_dependencies("demo", FAST_MODE_TABLE, &setup).expect("dependency met");
}

#[rstest]
#[case("quality=80,method=4")]
#[case("quality=80:method=4")]
fn delimiter_is_detected(#[case] raw: &str) {
    let mut setup = CodecSetup::new(1);
    parse_parameter_string("webp", raw, CodecFamily::Webp.descriptors(), &mut setup)
        .expect("webp parameters parse");
    assert_eq!(setup.get("quality"), Some(&CodecSetupValue::Int(80)));
    assert_eq!(setup.get("method"), Some(&CodecSetupValue::Int(4)));
    assert_eq!(setup.parameter_map.len(), 2);
}

#[rstest]
#[case(CodecFamily::X265, "optimization=nonopt:preset=slow:rate-control=cqp:qp=22")]
#[case(CodecFamily::Svtav1, "preset=4,qp=40,use_cpu_flags=none")]
#[case(CodecFamily::Mediacodec, "codec_name=c2.android.hevc.encoder:bitrate=2000000")]
fn formatted_parameters_round_trip(#[case] family: CodecFamily, #[case] raw: &str) {
    let descriptors = family.descriptors();
    let mut setup = CodecSetup::new(1);
    parse_parameter_string(family.name(), raw, descriptors, &mut setup).expect("parse");
    let rendered = format_parameters(descriptors, &setup.parameter_map);
    let mut reparsed = CodecSetup::new(1);
    parse_parameter_string(family.name(), &rendered, descriptors, &mut reparsed).expect("reparse");
    assert_eq!(reparsed.parameter_map, setup.parameter_map);
}

#[test]
fn compact_help_is_stable_for_every_family() {
    for family in CodecFamily::ALL {
        let first = render_parameter_help(family.name(), family.descriptors(), HelpVerbosity::Compact);
        assert!(first.starts_with(&format!("{} parameters: ", family.name())));
        assert_eq!(
            first,
            render_parameter_help(family.name(), family.descriptors(), HelpVerbosity::Compact)
        );
    }
}

#[test]
fn x265_compact_help_matches_table() {
    assert_eq!(
        render_parameter_help("x265", X265_PARAMETERS, HelpVerbosity::Compact),
        "x265 parameters: optimization={opt|nonopt}, preset={ultrafast|superfast|veryfast|faster|fast|medium|slow|slower|veryslow|placebo}, \
         rate-control={crf|cqp|abr|cbr|2-pass}, tune={psnr|ssim|grain|zerolatency|fastdecode}, bitrate=1-100000000, crf=0-51, qp=0-51\n"
    );
}

#[test]
fn dependency_failure_in_dispatch_acquires_nothing() {
    let frame = gray_frame();
    let mut config = ExperimentConfig::new(&frame, 16, 16, "x265-8bit");
    let mut setup = CodecSetup::new(1);
    parse_parameter_string("x265", "rate-control=crf:qp=30", X265_PARAMETERS, &mut setup)
        .expect("values are individually valid");
    config.setups.insert(CodecFamily::X265, setup);
    let mut output = CodecOutput::new(true);
    let errors = run_experiment(&config, &mut output).expect("input is valid");
    assert_eq!(errors, 1);
    assert!(output.frame_sizes.is_empty());
    assert!(output.frame_buffers.is_empty());
}

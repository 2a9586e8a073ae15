use std::ffi::{c_char, c_int, c_void};
use std::mem::size_of;

use tracing::{debug, warn};

use crate::contract::{CodecInput, CodecOutput, CodecSetup, EncoderRunner, RunnerError};
use crate::loader::backend_api;
use crate::parameter::ParameterDescriptor;
use crate::profiler::FrameProbe;
use crate::runner::{NativeHandle, c_string, optimization, profiled_run, record_frame};

const CODEC: &str = "x265";
const X265_TYPE_IDR: c_int = 1;
const X265_BUILD: c_int = 215;

pub const X265_PARAMETERS: &[ParameterDescriptor] = &[
    ParameterDescriptor::string_list(
        "optimization",
        "Optimization level",
        &["opt", "nonopt"],
        "opt",
    )
    .with_order(0),
    ParameterDescriptor::string_list(
        "preset",
        "Encoding preset",
        &[
            "ultrafast",
            "superfast",
            "veryfast",
            "faster",
            "fast",
            "medium",
            "slow",
            "slower",
            "veryslow",
            "placebo",
        ],
        "medium",
    )
    .with_order(1),
    ParameterDescriptor::string_list(
        "rate-control",
        "Rate control mode",
        &["crf", "cqp", "abr", "cbr", "2-pass"],
        "crf",
    )
    .with_order(2),
    ParameterDescriptor::string_list(
        "tune",
        "Tuning",
        &["psnr", "ssim", "grain", "zerolatency", "fastdecode"],
        "zerolatency",
    )
    .with_order(3),
    ParameterDescriptor::integer("qp", "Quantization parameter", 0, 51, 28)
        .requires("rate-control", "cqp"),
    ParameterDescriptor::integer("crf", "Constant rate factor", 0, 51, 28)
        .requires("rate-control", "crf"),
    ParameterDescriptor::integer("bitrate", "Target bitrate in bps", 1, 100_000_000, 1_000_000)
        .requires("rate-control", "abr"),
];

#[allow(dead_code)]
#[repr(C)]
struct X265Nal {
    nal_type: u32,
    size_bytes: u32,
    payload: *const u8,
}

/// Leading fields of `x265_picture` as declared by x265.h at X265_BUILD
/// 215 (x265 4.1), the build `x265_encoder_open_215` binds to. The library
/// allocates the full structure; only this prefix is written.
#[allow(dead_code)]
#[repr(C)]
struct X265PicturePrefix {
    pts: i64,
    dts: i64,
    user_data: *mut c_void,
    planes: [*mut c_void; 3],
    stride: [c_int; 3],
    bit_depth: c_int,
    slice_type: c_int,
}

/// Leading fields of `x265_api`, which reports the linked build and the
/// structure sizes it was compiled with.
#[allow(dead_code)]
#[repr(C)]
struct X265ApiHeader {
    api_major_version: c_int,
    api_build_number: c_int,
    sizeof_param: c_int,
    sizeof_picture: c_int,
}

backend_api! {
    struct X265Api {
        api_get: unsafe extern "C" fn(c_int) -> *const X265ApiHeader = "x265_api_get_215",
        param_alloc: unsafe extern "C" fn() -> *mut c_void = "x265_param_alloc",
        param_free: unsafe extern "C" fn(*mut c_void) = "x265_param_free",
        param_default_preset: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int = "x265_param_default_preset",
        param_parse: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int = "x265_param_parse",
        encoder_open: unsafe extern "C" fn(*mut c_void) -> *mut c_void = "x265_encoder_open_215",
        encoder_encode: unsafe extern "C" fn(*mut c_void, *mut *mut X265Nal, *mut u32, *mut X265PicturePrefix, *mut c_void) -> c_int = "x265_encoder_encode",
        encoder_close: unsafe extern "C" fn(*mut c_void) = "x265_encoder_close",
        picture_alloc: unsafe extern "C" fn() -> *mut X265PicturePrefix = "x265_picture_alloc",
        picture_init: unsafe extern "C" fn(*mut c_void, *mut X265PicturePrefix) = "x265_picture_init",
        picture_free: unsafe extern "C" fn(*mut X265PicturePrefix) = "x265_picture_free",
    }
}

/// Rate-control settings resolved from the parameter map, in
/// `x265_param_parse` key/value form.
fn rate_control_options(setup: &mut CodecSetup) -> Result<Vec<(&'static str, String)>, RunnerError> {
    let mode = setup.str_or_default(X265_PARAMETERS, "rate-control")?;
    let options = match mode.as_str() {
        "crf" => vec![("crf", setup.int_or_default(X265_PARAMETERS, "crf")?.to_string())],
        "cqp" => vec![("qp", setup.int_or_default(X265_PARAMETERS, "qp")?.to_string())],
        "abr" | "cbr" | "2-pass" => {
            let kbps = (setup.int_or_default(X265_PARAMETERS, "bitrate")? / 1000).max(1);
            let mut options = vec![("bitrate", kbps.to_string())];
            if mode == "cbr" {
                options.push(("vbv-maxrate", kbps.to_string()));
                options.push(("vbv-bufsize", kbps.to_string()));
            }
            if mode == "2-pass" {
                warn!(codec = CODEC, "2-pass needs a stats file; encoding single-pass ABR");
            }
            options
        }
        other => {
            return Err(RunnerError::Configure {
                codec: CODEC,
                message: format!("unsupported rate-control '{other}'"),
            });
        }
    };
    Ok(options)
}

/// Rejects a module whose `x265_picture` cannot hold the prefix written
/// through `X265PicturePrefix`.
fn check_api_header(header: Option<&X265ApiHeader>) -> Result<(), RunnerError> {
    let header = header.ok_or_else(|| RunnerError::Configure {
        codec: CODEC,
        message: "x265_api_get returned no API for 8-bit".to_string(),
    })?;
    let picture_size = usize::try_from(header.sizeof_picture).unwrap_or(0);
    if header.api_build_number != X265_BUILD || picture_size < size_of::<X265PicturePrefix>() {
        return Err(RunnerError::Configure {
            codec: CODEC,
            message: format!(
                "module reports build {} with a {}-byte x265_picture, expected build {X265_BUILD}",
                header.api_build_number, header.sizeof_picture
            ),
        });
    }
    Ok(())
}

fn log_level(debug_level: u32) -> &'static str {
    match debug_level {
        0 => "error",
        1 => "warning",
        2 => "info",
        _ => "debug",
    }
}

#[derive(Debug, Default)]
pub(crate) struct X265Runner;

impl EncoderRunner for X265Runner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        input.validate()?;
        let optimization = optimization(CODEC, X265_PARAMETERS, setup)?;
        let preset = setup.str_or_default(X265_PARAMETERS, "preset")?;
        let tune = setup.str_or_default(X265_PARAMETERS, "tune")?;
        let mut options = vec![
            ("input-res", format!("{}x{}", input.width, input.height)),
            ("fps", "30".to_string()),
            ("input-csp", "i420".to_string()),
            ("keyint", "1".to_string()),
            ("min-keyint", "1".to_string()),
            ("bframes", "0".to_string()),
            ("rc-lookahead", "0".to_string()),
            ("frame-threads", "1".to_string()),
            ("log-level", log_level(input.debug_level).to_string()),
        ];
        options.extend(rate_control_options(setup)?);

        let num_runs = setup.num_runs;
        profiled_run(CODEC, num_runs, output, |output| {
            let module = optimization.module_name("x265-8bit");
            let api = X265Api::load(&module)?;
            // SAFETY: x265_api_get returns null or a static table.
            check_api_header(unsafe { (api.api_get)(8).as_ref() })?;

            // SAFETY: every call below goes through entry points of `api`,
            // which outlives all handles; handles drop in reverse order.
            let param = NativeHandle::new(unsafe { (api.param_alloc)() }, |raw| unsafe {
                (api.param_free)(raw)
            })
            .ok_or_else(|| RunnerError::Configure {
                codec: CODEC,
                message: "failed to allocate parameters".to_string(),
            })?;

            let preset_c = c_string(CODEC, &preset)?;
            let tune_c = c_string(CODEC, &tune)?;
            if unsafe { (api.param_default_preset)(param.as_ptr(), preset_c.as_ptr(), tune_c.as_ptr()) } < 0 {
                return Err(RunnerError::Configure {
                    codec: CODEC,
                    message: format!("invalid preset '{preset}' or tune '{tune}'"),
                });
            }
            for (name, value) in &options {
                let name_c = c_string(CODEC, name)?;
                let value_c = c_string(CODEC, value)?;
                let status = unsafe { (api.param_parse)(param.as_ptr(), name_c.as_ptr(), value_c.as_ptr()) };
                if status != 0 {
                    return Err(RunnerError::Configure {
                        codec: CODEC,
                        message: format!("x265_param_parse({name}={value}) returned {status}"),
                    });
                }
            }
            debug!(codec = CODEC, %module, ?options, "configured encoder");

            let encoder = NativeHandle::new(unsafe { (api.encoder_open)(param.as_ptr()) }, |raw| unsafe {
                (api.encoder_close)(raw)
            })
            .ok_or_else(|| RunnerError::Configure {
                codec: CODEC,
                message: "failed to open encoder".to_string(),
            })?;
            let picture = NativeHandle::new(unsafe { (api.picture_alloc)() }, |raw| unsafe {
                (api.picture_free)(raw)
            })
            .ok_or_else(|| RunnerError::Configure {
                codec: CODEC,
                message: "failed to allocate picture".to_string(),
            })?;
            unsafe { (api.picture_init)(param.as_ptr(), picture.as_ptr()) };

            // Input conversion: the planes are referenced in place.
            let (y, u, v) = input.planes();
            let chroma_stride = input.chroma_width() as c_int;
            {
                // SAFETY: `picture` is a live x265_picture initialized above.
                let pic = unsafe { &mut *picture.as_ptr() };
                pic.bit_depth = 8;
                pic.planes = [
                    y.as_ptr().cast_mut().cast(),
                    u.as_ptr().cast_mut().cast(),
                    v.as_ptr().cast_mut().cast(),
                ];
                pic.stride = [input.width, chroma_stride, chroma_stride];
            }

            let mut frame = Vec::new();
            for run in 0..num_runs {
                let probe = FrameProbe::start();
                // SAFETY: `picture` stays valid; x265 reads the planes only.
                unsafe { (*picture.as_ptr()).slice_type = X265_TYPE_IDR };
                let mut nals: *mut X265Nal = std::ptr::null_mut();
                let mut num_nals: u32 = 0;
                let status = unsafe {
                    (api.encoder_encode)(
                        encoder.as_ptr(),
                        &mut nals,
                        &mut num_nals,
                        picture.as_ptr(),
                        std::ptr::null_mut(),
                    )
                };
                if status <= 0 || nals.is_null() {
                    return Err(RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message: format!("x265_encoder_encode returned {status}"),
                    });
                }
                frame.clear();
                // SAFETY: x265 returns `num_nals` contiguous NAL descriptors
                // valid until the next encode call.
                let nal_units = unsafe { std::slice::from_raw_parts(nals, num_nals as usize) };
                for nal in nal_units {
                    let payload = unsafe { std::slice::from_raw_parts(nal.payload, nal.size_bytes as usize) };
                    frame.extend_from_slice(payload);
                }
                record_frame(output, CODEC, run, &probe, &frame);
            }
            Ok(())
        })
    }
}

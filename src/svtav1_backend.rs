use std::ffi::{c_char, c_void};

use tracing::debug;

use crate::contract::{CodecInput, CodecOutput, CodecSetup, EncoderRunner, RunnerError};
use crate::loader::backend_api;
use crate::parameter::ParameterDescriptor;
use crate::profiler::FrameProbe;
use crate::runner::{NativeHandle, c_string, profiled_run, record_frame};

const CODEC: &str = "svtav1";
const MODULE: &str = "libSvtAv1Enc.so";
const EB_ERROR_NONE: i32 = 0;
const EB_AV1_KEY_PICTURE: u32 = 3;
const EB_BUFFERFLAG_EOS: u32 = 0x0000_0001;
const EB_YUV420: u32 = 1;
const EB_EIGHT_BIT: u32 = 8;
/// Room for `EbSvtAv1EncConfiguration`, which is only touched by the
/// library itself.
const CONFIG_WORDS: usize = 16 * 1024;

pub const SVTAV1_PARAMETERS: &[ParameterDescriptor] = &[
    ParameterDescriptor::integer("preset", "Encoder preset (0 = slowest, 13 = fastest)", 0, 13, 8)
        .with_order(0),
    ParameterDescriptor::string_list(
        "use_cpu_flags",
        "SIMD usage (all = best available, none = C only)",
        &["all", "none"],
        "all",
    )
    .with_order(1),
    ParameterDescriptor::integer("tune", "Tuning (0 = VQ, 1 = PSNR, 2 = SSIM)", 0, 2, 1).with_order(2),
    ParameterDescriptor::integer("qp", "Quantization parameter", 0, 63, 35).with_order(3),
];

#[allow(dead_code)]
#[repr(C)]
struct EbSvtIoFormat {
    luma: *mut u8,
    cb: *mut u8,
    cr: *mut u8,
    y_stride: u32,
    cr_stride: u32,
    cb_stride: u32,
    width: u32,
    height: u32,
    org_x: u32,
    org_y: u32,
    color_fmt: u32,
    bit_depth: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct EbBufferHeaderType {
    size: u32,
    p_buffer: *mut u8,
    n_filled_len: u32,
    n_alloc_len: u32,
    p_app_private: *mut c_void,
    wrapper_ptr: *mut c_void,
    n_tick_count: u32,
    dts: i64,
    pts: i64,
    temporal_layer_index: u8,
    qp: u32,
    avg_qp: u32,
    pic_type: u32,
    luma_sse: u64,
    cr_sse: u64,
    cb_sse: u64,
    flags: u32,
    luma_ssim: f64,
    cr_ssim: f64,
    cb_ssim: f64,
    metadata: *mut c_void,
}

impl EbBufferHeaderType {
    fn zeroed() -> Self {
        // SAFETY: plain data; null pointers and zero counters are valid.
        let mut header: Self = unsafe { std::mem::zeroed() };
        header.size = std::mem::size_of::<Self>() as u32;
        header
    }
}

backend_api! {
    struct SvtAv1Api {
        init_handle: unsafe extern "C" fn(*mut *mut c_void, *mut c_void) -> i32 = "svt_av1_enc_init_handle",
        parse_parameter: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> i32 = "svt_av1_enc_parse_parameter",
        set_parameter: unsafe extern "C" fn(*mut c_void, *mut c_void) -> i32 = "svt_av1_enc_set_parameter",
        init: unsafe extern "C" fn(*mut c_void) -> i32 = "svt_av1_enc_init",
        send_picture: unsafe extern "C" fn(*mut c_void, *mut EbBufferHeaderType) -> i32 = "svt_av1_enc_send_picture",
        get_packet: unsafe extern "C" fn(*mut c_void, *mut *mut EbBufferHeaderType, u8) -> i32 = "svt_av1_enc_get_packet",
        release_out_buffer: unsafe extern "C" fn(*mut *mut EbBufferHeaderType) = "svt_av1_enc_release_out_buffer",
        deinit: unsafe extern "C" fn(*mut c_void) -> i32 = "svt_av1_enc_deinit",
        deinit_handle: unsafe extern "C" fn(*mut c_void) -> i32 = "svt_av1_enc_deinit_handle",
    }
}

/// Settings applied through `svt_av1_enc_parse_parameter`.
fn encoder_options(
    input: &CodecInput<'_>,
    setup: &mut CodecSetup,
) -> Result<Vec<(&'static str, String)>, RunnerError> {
    let preset = setup.int_or_default(SVTAV1_PARAMETERS, "preset")?;
    let asm = match setup.str_or_default(SVTAV1_PARAMETERS, "use_cpu_flags")?.as_str() {
        "none" => "c",
        _ => "max",
    };
    let tune = setup.int_or_default(SVTAV1_PARAMETERS, "tune")?;
    let qp = setup.int_or_default(SVTAV1_PARAMETERS, "qp")?;
    Ok(vec![
        ("width", input.width.to_string()),
        ("height", input.height.to_string()),
        ("fps-num", "30".to_string()),
        ("fps-denom", "1".to_string()),
        ("input-depth", "8".to_string()),
        ("preset", preset.to_string()),
        ("rc", "0".to_string()),
        ("qp", qp.to_string()),
        ("tune", tune.to_string()),
        ("asm", asm.to_string()),
        ("keyint", "-1".to_string()),
        ("irefresh-type", "2".to_string()),
    ])
}

fn check(status: i32, codec_call: &str) -> Result<(), RunnerError> {
    if status == EB_ERROR_NONE {
        return Ok(());
    }
    Err(RunnerError::Configure {
        codec: CODEC,
        message: format!("{codec_call} failed with 0x{status:08x}"),
    })
}

#[derive(Debug, Default)]
pub(crate) struct SvtAv1Runner;

impl EncoderRunner for SvtAv1Runner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        input.validate()?;
        let options = encoder_options(input, setup)?;

        let num_runs = setup.num_runs;
        profiled_run(CODEC, num_runs, output, |output| {
            let api = SvtAv1Api::load(MODULE)?;
            let mut config = vec![0u64; CONFIG_WORDS];
            let config_ptr = config.as_mut_ptr().cast::<c_void>();

            let mut raw_handle: *mut c_void = std::ptr::null_mut();
            // SAFETY: `config` is large enough for the library's
            // configuration struct and outlives the handle.
            let status = unsafe { (api.init_handle)(&mut raw_handle, config_ptr) };
            let handle = NativeHandle::new(raw_handle, |raw| {
                unsafe { (api.deinit_handle)(raw) };
            });
            check(status, "svt_av1_enc_init_handle")?;
            let handle = handle.ok_or_else(|| RunnerError::Configure {
                codec: CODEC,
                message: "svt_av1_enc_init_handle returned no handle".to_string(),
            })?;

            for (name, value) in &options {
                let name_c = c_string(CODEC, name)?;
                let value_c = c_string(CODEC, value)?;
                let status = unsafe { (api.parse_parameter)(config_ptr, name_c.as_ptr(), value_c.as_ptr()) };
                check(status, &format!("svt_av1_enc_parse_parameter({name}={value})"))?;
            }
            check(unsafe { (api.set_parameter)(handle.as_ptr(), config_ptr) }, "svt_av1_enc_set_parameter")?;
            check(unsafe { (api.init)(handle.as_ptr()) }, "svt_av1_enc_init")?;
            // Declared after `handle` so deinit runs before deinit_handle.
            let _encoder = NativeHandle::new(handle.as_ptr(), |raw| {
                unsafe { (api.deinit)(raw) };
            });
            debug!(codec = CODEC, ?options, "configured encoder");

            // Input conversion: plane pointers into the caller's buffer.
            let (y, u, v) = input.planes();
            let chroma_stride = input.chroma_width() as u32;
            let mut picture = EbSvtIoFormat {
                luma: y.as_ptr().cast_mut(),
                cb: u.as_ptr().cast_mut(),
                cr: v.as_ptr().cast_mut(),
                y_stride: input.width as u32,
                cr_stride: chroma_stride,
                cb_stride: chroma_stride,
                width: input.width as u32,
                height: input.height as u32,
                org_x: 0,
                org_y: 0,
                color_fmt: EB_YUV420,
                bit_depth: EB_EIGHT_BIT,
            };
            let mut input_buffer = EbBufferHeaderType::zeroed();
            input_buffer.p_buffer = (&mut picture as *mut EbSvtIoFormat).cast();
            input_buffer.n_filled_len = input.frame_size() as u32;
            input_buffer.n_alloc_len = input.frame_size() as u32;
            input_buffer.pic_type = EB_AV1_KEY_PICTURE;

            // The encoder is pipelined: submit every picture, then EOS, then
            // drain. Per-frame CPU spans submission to retrieval.
            let mut probes = Vec::with_capacity(num_runs);
            for run in 0..num_runs {
                probes.push(FrameProbe::start());
                input_buffer.pts = run as i64;
                let status = unsafe { (api.send_picture)(handle.as_ptr(), &mut input_buffer) };
                if status != EB_ERROR_NONE {
                    return Err(RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message: format!("svt_av1_enc_send_picture failed with 0x{status:08x}"),
                    });
                }
            }
            let mut eos = EbBufferHeaderType::zeroed();
            eos.flags = EB_BUFFERFLAG_EOS;
            let status = unsafe { (api.send_picture)(handle.as_ptr(), &mut eos) };
            check(status, "svt_av1_enc_send_picture(EOS)")?;

            for (run, probe) in probes.iter().enumerate() {
                let mut packet: *mut EbBufferHeaderType = std::ptr::null_mut();
                let status = unsafe { (api.get_packet)(handle.as_ptr(), &mut packet, 1) };
                let packet = NativeHandle::new(packet, |raw| {
                    let mut raw = raw;
                    unsafe { (api.release_out_buffer)(&mut raw) };
                });
                let bytes = match (&packet, status) {
                    (Some(packet), EB_ERROR_NONE) => {
                        // SAFETY: the packet is owned by us until released.
                        let header = unsafe { &*packet.as_ptr() };
                        if header.p_buffer.is_null() || header.n_filled_len == 0 {
                            &[][..]
                        } else {
                            unsafe { std::slice::from_raw_parts(header.p_buffer, header.n_filled_len as usize) }
                        }
                    }
                    _ => &[][..],
                };
                if bytes.is_empty() {
                    return Err(RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message: format!("svt_av1_enc_get_packet returned no data (0x{status:08x})"),
                    });
                }
                record_frame(output, CODEC, run, probe, bytes);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;
    use crate::contract::ColorFormat;

    #[test]
    fn buffer_header_layout_matches_abi() {
        assert_eq!(offset_of!(EbBufferHeaderType, p_buffer), 8);
        assert_eq!(offset_of!(EbBufferHeaderType, p_app_private), 24);
        assert_eq!(offset_of!(EbBufferHeaderType, dts), 48);
        assert_eq!(offset_of!(EbBufferHeaderType, pic_type), 76);
        assert_eq!(offset_of!(EbBufferHeaderType, flags), 104);
        assert_eq!(std::mem::size_of::<EbSvtIoFormat>(), 64);
    }

    #[test]
    fn options_write_back_defaults() {
        let buffer = vec![0u8; 64 * 48 * 3 / 2];
        let input = CodecInput::new(&buffer, 64, 48, ColorFormat::Yuv420p);
        let mut setup = CodecSetup::new(1);
        setup.set("use_cpu_flags", "none");
        let options = encoder_options(&input, &mut setup).expect("defaults resolve");
        assert!(options.contains(&("asm", "c".to_string())));
        assert!(options.contains(&("qp", "35".to_string())));
        assert!(options.contains(&("width", "64".to_string())));
        assert_eq!(setup.parameter_map.len(), 4);
    }
}

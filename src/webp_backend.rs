use std::ffi::{c_float, c_int, c_void};

use tracing::debug;

use crate::contract::{CodecInput, CodecOutput, CodecSetup, EncoderRunner, RunnerError};
use crate::loader::backend_api;
use crate::parameter::ParameterDescriptor;
use crate::profiler::FrameProbe;
use crate::runner::{PaddedPlanes, optimization, profiled_run, record_frame};

const CODEC: &str = "webp";
const WEBP_ENCODER_ABI_VERSION: c_int = 0x020f;
const WEBP_PRESET_DEFAULT: c_int = 0;
const WEBP_YUV420: c_int = 0;

pub const WEBP_PARAMETERS: &[ParameterDescriptor] = &[
    ParameterDescriptor::string_list(
        "optimization",
        "Optimization level",
        &["opt", "nonopt"],
        "opt",
    )
    .with_order(0),
    ParameterDescriptor::integer("quality", "Quality factor", 0, 100, 75),
    ParameterDescriptor::integer("method", "Compression method (speed/quality trade-off)", 0, 6, 4),
];

#[allow(dead_code)]
#[repr(C)]
#[derive(Default)]
struct WebPConfig {
    lossless: c_int,
    quality: c_float,
    method: c_int,
    image_hint: c_int,
    target_size: c_int,
    target_psnr: c_float,
    segments: c_int,
    sns_strength: c_int,
    filter_strength: c_int,
    filter_sharpness: c_int,
    filter_type: c_int,
    autofilter: c_int,
    alpha_compression: c_int,
    alpha_filtering: c_int,
    alpha_quality: c_int,
    pass: c_int,
    show_compressed: c_int,
    preprocessing: c_int,
    partitions: c_int,
    partition_limit: c_int,
    emulate_jpeg_size: c_int,
    thread_level: c_int,
    low_memory: c_int,
    near_lossless: c_int,
    exact: c_int,
    use_delta_palette: c_int,
    use_sharp_yuv: c_int,
    qmin: c_int,
    qmax: c_int,
}

type WebPWriterFunction = unsafe extern "C" fn(*const u8, usize, *const WebPPicture) -> c_int;

#[allow(dead_code)]
#[repr(C)]
struct WebPPicture {
    use_argb: c_int,
    colorspace: c_int,
    width: c_int,
    height: c_int,
    y: *mut u8,
    u: *mut u8,
    v: *mut u8,
    y_stride: c_int,
    uv_stride: c_int,
    a: *mut u8,
    a_stride: c_int,
    pad1: [u32; 2],
    argb: *mut u32,
    argb_stride: c_int,
    pad2: [u32; 3],
    writer: Option<WebPWriterFunction>,
    custom_ptr: *mut c_void,
    extra_info_type: c_int,
    extra_info: *mut u8,
    stats: *mut c_void,
    error_code: c_int,
    progress_hook: *mut c_void,
    user_data: *mut c_void,
    pad3: [u32; 3],
    pad4: *mut u8,
    pad5: *mut u8,
    pad6: [u32; 8],
    memory: *mut c_void,
    memory_argb: *mut c_void,
    pad7: [*mut c_void; 2],
}

#[allow(dead_code)]
#[repr(C)]
struct WebPMemoryWriter {
    mem: *mut u8,
    size: usize,
    max_size: usize,
    pad: [u32; 1],
}

backend_api! {
    struct WebPApi {
        config_init: unsafe extern "C" fn(*mut WebPConfig, c_int, c_float, c_int) -> c_int = "WebPConfigInitInternal",
        validate_config: unsafe extern "C" fn(*const WebPConfig) -> c_int = "WebPValidateConfig",
        picture_init: unsafe extern "C" fn(*mut WebPPicture, c_int) -> c_int = "WebPPictureInitInternal",
        picture_alloc: unsafe extern "C" fn(*mut WebPPicture) -> c_int = "WebPPictureAlloc",
        picture_free: unsafe extern "C" fn(*mut WebPPicture) = "WebPPictureFree",
        encode: unsafe extern "C" fn(*const WebPConfig, *mut WebPPicture) -> c_int = "WebPEncode",
        writer_init: unsafe extern "C" fn(*mut WebPMemoryWriter) = "WebPMemoryWriterInit",
        writer_clear: unsafe extern "C" fn(*mut WebPMemoryWriter) = "WebPMemoryWriterClear",
        memory_write: WebPWriterFunction = "WebPMemoryWrite",
    }
}

/// Picture allocated by the library, freed on drop.
struct Picture<'a> {
    api: &'a WebPApi,
    raw: Box<WebPPicture>,
}

impl<'a> Picture<'a> {
    fn alloc(api: &'a WebPApi, width: c_int, height: c_int) -> Result<Self, RunnerError> {
        // SAFETY: WebPPicture is plain data; PictureInitInternal overwrites it.
        let mut raw: Box<WebPPicture> = Box::new(unsafe { std::mem::zeroed() });
        if unsafe { (api.picture_init)(&mut *raw, WEBP_ENCODER_ABI_VERSION) } == 0 {
            return Err(RunnerError::Configure {
                codec: CODEC,
                message: "WebPPictureInit failed (ABI version mismatch)".to_string(),
            });
        }
        raw.use_argb = 0;
        raw.colorspace = WEBP_YUV420;
        raw.width = width;
        raw.height = height;
        let mut picture = Self { api, raw };
        if unsafe { (api.picture_alloc)(&mut *picture.raw) } == 0 {
            return Err(RunnerError::Configure {
                codec: CODEC,
                message: format!("WebPPictureAlloc failed for {width}x{height}"),
            });
        }
        Ok(picture)
    }

    /// Copies one plane row by row into the picture's strided buffer.
    fn import_plane(dst: *mut u8, dst_stride: c_int, src: &[u8], width: usize, rows: usize) {
        for row in 0..rows {
            let line = &src[row * width..][..width];
            // SAFETY: the picture was allocated with at least `rows` rows of
            // `dst_stride >= width` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    line.as_ptr(),
                    dst.add(row * dst_stride as usize),
                    width,
                );
            }
        }
    }
}

impl Drop for Picture<'_> {
    fn drop(&mut self) {
        // SAFETY: freeing a picture that was initialized (and possibly not
        // allocated) is valid.
        unsafe { (self.api.picture_free)(&mut *self.raw) };
    }
}

/// Memory writer for one encode, cleared on drop.
struct MemoryWriter<'a> {
    api: &'a WebPApi,
    raw: Box<WebPMemoryWriter>,
}

impl<'a> MemoryWriter<'a> {
    fn new(api: &'a WebPApi) -> Self {
        let mut raw = Box::new(WebPMemoryWriter {
            mem: std::ptr::null_mut(),
            size: 0,
            max_size: 0,
            pad: [0],
        });
        // SAFETY: `raw` is a valid writer struct.
        unsafe { (api.writer_init)(&mut *raw) };
        Self { api, raw }
    }

    fn bytes(&self) -> &[u8] {
        if self.raw.mem.is_null() {
            return &[];
        }
        // SAFETY: the writer owns `size` bytes at `mem`.
        unsafe { std::slice::from_raw_parts(self.raw.mem, self.raw.size) }
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.writer_clear)(&mut *self.raw) };
    }
}

/// Planes sized to the picture. libwebp keeps `(width + 1) / 2` chroma
/// columns, so odd widths repeat the last source chroma column.
fn picture_planes(input: &CodecInput<'_>) -> PaddedPlanes {
    let width = input.width.max(0) as usize;
    let height = input.height.max(0) as usize;
    PaddedPlanes::new(input, width, height, width.div_ceil(2), input.chroma_height())
}

#[derive(Debug, Default)]
pub(crate) struct WebPRunner;

impl EncoderRunner for WebPRunner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        input.validate()?;
        let optimization = optimization(CODEC, WEBP_PARAMETERS, setup)?;
        let quality = setup.int_or_default(WEBP_PARAMETERS, "quality")?;
        let method = setup.int_or_default(WEBP_PARAMETERS, "method")?;

        let num_runs = setup.num_runs;
        profiled_run(CODEC, num_runs, output, |output| {
            let module = optimization.module_name("webp");
            let api = WebPApi::load(&module)?;

            let mut config = WebPConfig::default();
            // SAFETY: `config` is a valid, writable WebPConfig.
            let initialized = unsafe {
                (api.config_init)(
                    &mut config,
                    WEBP_PRESET_DEFAULT,
                    quality as c_float,
                    WEBP_ENCODER_ABI_VERSION,
                )
            };
            if initialized == 0 {
                return Err(RunnerError::Configure {
                    codec: CODEC,
                    message: "WebPConfigInit failed (ABI version mismatch)".to_string(),
                });
            }
            config.quality = quality as c_float;
            config.method = method;
            if unsafe { (api.validate_config)(&config) } == 0 {
                return Err(RunnerError::Configure {
                    codec: CODEC,
                    message: format!("invalid config quality={quality} method={method}"),
                });
            }
            debug!(codec = CODEC, %module, quality, method, "configured encoder");

            let mut picture = Picture::alloc(&api, input.width, input.height)?;

            // Input conversion: copy each plane honoring the picture strides.
            let planes = picture_planes(input);
            let raw = &mut *picture.raw;
            let (luma, chroma) = (planes.luma_stride, planes.chroma_stride);
            Picture::import_plane(raw.y, raw.y_stride, &planes.y, luma, planes.luma_rows);
            Picture::import_plane(raw.u, raw.uv_stride, &planes.u, chroma, planes.chroma_rows);
            Picture::import_plane(raw.v, raw.uv_stride, &planes.v, chroma, planes.chroma_rows);

            for run in 0..num_runs {
                let probe = FrameProbe::start();
                let mut writer = MemoryWriter::new(&api);
                picture.raw.writer = Some(api.memory_write);
                picture.raw.custom_ptr = (&mut *writer.raw as *mut WebPMemoryWriter).cast();
                // SAFETY: config and picture are initialized; the writer
                // outlives the call.
                let encoded = unsafe { (api.encode)(&config, &mut *picture.raw) };
                picture.raw.custom_ptr = std::ptr::null_mut();
                if encoded == 0 {
                    return Err(RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message: format!("WebPEncode failed with error code {}", picture.raw.error_code),
                    });
                }
                record_frame(output, CODEC, run, &probe, writer.bytes());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use rstest::rstest;

    use super::*;
    use crate::contract::ColorFormat;

    #[test]
    fn config_layout_matches_abi() {
        assert_eq!(size_of::<WebPConfig>(), 29 * 4);
        assert_eq!(offset_of!(WebPConfig, method), 8);
    }

    #[test]
    fn picture_layout_matches_abi() {
        assert_eq!(offset_of!(WebPPicture, y), 16);
        assert_eq!(offset_of!(WebPPicture, writer), 96);
        assert_eq!(offset_of!(WebPPicture, custom_ptr), 104);
        assert_eq!(size_of::<WebPMemoryWriter>(), 32);
    }

    #[test]
    fn missing_module_fails_before_encoding() {
        let buffer = vec![128u8; 16 * 16 * 3 / 2];
        let input = CodecInput::new(&buffer, 16, 16, crate::contract::ColorFormat::Yuv420p);
        let mut setup = CodecSetup::new(1);
        setup.set("optimization", "nonopt");
        let mut output = CodecOutput::new(false);
        if crate::loader::open_module("libwebp-nonopt.so").is_ok() {
            return;
        }
        let err = WebPRunner.run(&input, &mut setup, &mut output).expect_err("no module");
        assert!(matches!(err, RunnerError::LoadLibrary { .. }));
        assert_eq!(output.num_frames(), 0);
        assert_eq!(setup.get("quality"), Some(&crate::contract::CodecSetupValue::Int(75)));
        assert_eq!(setup.get("method"), Some(&crate::contract::CodecSetupValue::Int(4)));
    }

    #[rstest]
    #[case(16, 8)]
    #[case(15, 8)]
    #[case(3, 2)]
    fn chroma_planes_cover_picture_width(#[case] width: i32, #[case] uv_width: usize) {
        let buffer = vec![0u8; (width * 4 + 2 * (width / 2) * 2) as usize];
        let input = CodecInput::new(&buffer, width, 4, ColorFormat::Yuv420p);
        let planes = picture_planes(&input);
        assert_eq!(planes.luma_stride, width as usize);
        assert_eq!(planes.luma_rows, 4);
        assert_eq!(planes.chroma_stride, uv_width);
        assert_eq!(planes.chroma_rows, 2);
        assert_eq!(planes.u.len(), uv_width * 2);
    }

    #[test]
    fn odd_width_repeats_last_chroma_column() {
        // 15x2: 30 luma bytes, then 7x1 U and 7x1 V.
        let mut buffer = vec![16u8; 30];
        buffer.extend(1..=7);
        buffer.extend(101..=107);
        let input = CodecInput::new(&buffer, 15, 2, ColorFormat::Yuv420p);
        let planes = picture_planes(&input);
        assert_eq!(planes.u, vec![1, 2, 3, 4, 5, 6, 7, 7]);
        assert_eq!(planes.v, vec![101, 102, 103, 104, 105, 106, 107, 107]);
        assert_eq!(planes.y, vec![16u8; 30]);
    }
}

use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_int, c_ulong, c_void};

use tracing::debug;

use crate::contract::{CodecInput, CodecOutput, CodecSetup, EncoderRunner, RunnerError};
use crate::loader::backend_api;
use crate::parameter::ParameterDescriptor;
use crate::profiler::FrameProbe;
use crate::runner::{NativeHandle, PaddedPlanes, optimization, profiled_run, record_frame};

const CODEC: &str = "libjpegturbo";
const TJSAMP_420: c_int = 2;
const TJFLAG_FASTDCT: c_int = 2048;

pub const LIBJPEGTURBO_PARAMETERS: &[ParameterDescriptor] = &[
    ParameterDescriptor::string_list(
        "optimization",
        "Optimization level",
        &["opt", "nonopt"],
        "opt",
    )
    .with_order(0),
    ParameterDescriptor::integer("quality", "JPEG quality", 1, 100, 75),
];

backend_api! {
    struct TurboJpegApi {
        init_compress: unsafe extern "C" fn() -> *mut c_void = "tjInitCompress",
        compress_from_yuv: unsafe extern "C" fn(
            *mut c_void,
            *const u8,
            c_int,
            c_int,
            c_int,
            c_int,
            *mut *mut u8,
            *mut c_ulong,
            c_int,
            c_int,
        ) -> c_int = "tjCompressFromYUV",
        error_str: unsafe extern "C" fn(*mut c_void) -> *mut c_char = "tjGetErrorStr2",
        free: unsafe extern "C" fn(*mut u8) = "tjFree",
        destroy: unsafe extern "C" fn(*mut c_void) -> c_int = "tjDestroy",
    }
}

impl TurboJpegApi {
    fn last_error(&self, handle: *mut c_void) -> String {
        // SAFETY: tjGetErrorStr2 returns a NUL-terminated string owned by the
        // handle (or a static one).
        let message = unsafe { (self.error_str)(handle) };
        if message.is_null() {
            return "unknown error".to_string();
        }
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

/// TurboJPEG sizes 4:2:0 chroma planes with `(width + 1) / 2` columns.
/// Odd widths are repacked to that layout; even widths are used as is.
fn turbojpeg_layout<'a>(input: &CodecInput<'a>) -> Cow<'a, [u8]> {
    let width = input.width as usize;
    if width % 2 == 0 {
        return Cow::Borrowed(&input.buffer[..input.frame_size()]);
    }
    let height = input.height as usize;
    let chroma_width = width.div_ceil(2);
    Cow::Owned(PaddedPlanes::new(input, width, height, chroma_width, height / 2).contiguous())
}

#[derive(Debug, Default)]
pub(crate) struct TurboJpegRunner;

impl EncoderRunner for TurboJpegRunner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        input.validate()?;
        let optimization = optimization(CODEC, LIBJPEGTURBO_PARAMETERS, setup)?;
        let quality = setup.int_or_default(LIBJPEGTURBO_PARAMETERS, "quality")?;

        let num_runs = setup.num_runs;
        profiled_run(CODEC, num_runs, output, |output| {
            let module = optimization.module_name("turbojpeg");
            let api = TurboJpegApi::load(&module)?;
            // SAFETY: the compressor handle is destroyed before `api` drops.
            let handle = NativeHandle::new(unsafe { (api.init_compress)() }, |raw| {
                unsafe { (api.destroy)(raw) };
            })
            .ok_or_else(|| RunnerError::Configure {
                codec: CODEC,
                message: format!("tjInitCompress failed: {}", api.last_error(std::ptr::null_mut())),
            })?;
            debug!(codec = CODEC, %module, quality, "configured compressor");

            let yuv = turbojpeg_layout(input);
            for run in 0..num_runs {
                let probe = FrameProbe::start();
                let mut jpeg: *mut u8 = std::ptr::null_mut();
                let mut jpeg_size: c_ulong = 0;
                // SAFETY: `yuv` holds a full 4:2:0 frame in TurboJPEG's
                // layout with row padding 1; TurboJPEG allocates `jpeg`.
                let status = unsafe {
                    (api.compress_from_yuv)(
                        handle.as_ptr(),
                        yuv.as_ptr(),
                        input.width,
                        1,
                        input.height,
                        TJSAMP_420,
                        &mut jpeg,
                        &mut jpeg_size,
                        quality,
                        TJFLAG_FASTDCT,
                    )
                };
                let encoded = NativeHandle::new(jpeg, |raw| unsafe { (api.free)(raw) });
                if status != 0 {
                    return Err(RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message: api.last_error(handle.as_ptr()),
                    });
                }
                let Some(encoded) = encoded else {
                    return Err(RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message: "tjCompressFromYUV returned no buffer".to_string(),
                    });
                };
                // SAFETY: TurboJPEG wrote `jpeg_size` bytes into `encoded`.
                let bytes = unsafe { std::slice::from_raw_parts(encoded.as_ptr(), jpeg_size as usize) };
                record_frame(output, CODEC, run, &probe, bytes);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ColorFormat;

    #[test]
    fn even_width_is_borrowed() {
        let buffer = vec![7u8; 4 * 2 * 3 / 2];
        let input = CodecInput::new(&buffer, 4, 2, ColorFormat::Yuv420p);
        assert!(matches!(turbojpeg_layout(&input), Cow::Borrowed(_)));
    }

    #[test]
    fn odd_width_widens_chroma_rows() {
        // 3x2 luma, chroma planes 1x1 in the input layout.
        let buffer = [1u8, 2, 3, 4, 5, 6, 8, 9];
        let input = CodecInput::new(&buffer, 3, 2, ColorFormat::Yuv420p);
        let repacked = turbojpeg_layout(&input);
        assert_eq!(&*repacked, &[1, 2, 3, 4, 5, 6, 8, 8, 9, 9]);
    }
}

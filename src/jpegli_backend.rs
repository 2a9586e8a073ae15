use std::any::Any;
use std::ffi::{c_int, c_uint, c_ulong, c_void};
use std::panic::{self, AssertUnwindSafe};

use mozjpeg_sys::{J_COLOR_SPACE, jpeg_common_struct, jpeg_compress_struct, jpeg_error_mgr};
use tracing::debug;

use crate::contract::{CodecInput, CodecOutput, CodecSetup, EncoderRunner, RunnerError};
use crate::loader::{Optimization, backend_api};
use crate::parameter::{ParameterDescriptor, ParameterError};
use crate::profiler::FrameProbe;
use crate::runner::{PaddedPlanes, profiled_run, record_frame};

const CODEC: &str = "jpegli";
const JPEG_LIB_VERSION: c_int = 62;
const LUMA_GROUP_ROWS: usize = 16;
const CHROMA_GROUP_ROWS: usize = 8;
const JMSG_LENGTH_MAX: usize = 200;

pub const JPEGLI_PARAMETERS: &[ParameterDescriptor] = &[
    ParameterDescriptor::integer("quality", "JPEG quality", 0, 100, 75).with_order(0),
    ParameterDescriptor::string_list(
        "highway_target",
        "SIMD dispatch target (all = best available, none = scalar)",
        &["all", "none"],
        "all",
    )
    .with_order(1),
];

type Cinfo = jpeg_compress_struct;

backend_api! {
    struct JpegliApi {
        std_error: unsafe extern "C-unwind" fn(*mut jpeg_error_mgr) -> *mut jpeg_error_mgr = "jpeg_std_error",
        create_compress: unsafe extern "C-unwind" fn(*mut Cinfo, c_int, usize) = "jpeg_CreateCompress",
        set_defaults: unsafe extern "C-unwind" fn(*mut Cinfo) = "jpeg_set_defaults",
        set_colorspace: unsafe extern "C-unwind" fn(*mut Cinfo, J_COLOR_SPACE) = "jpeg_set_colorspace",
        set_quality: unsafe extern "C-unwind" fn(*mut Cinfo, c_int, c_int) = "jpeg_set_quality",
        mem_dest: unsafe extern "C-unwind" fn(*mut Cinfo, *mut *mut u8, *mut c_ulong) = "jpeg_mem_dest",
        start_compress: unsafe extern "C-unwind" fn(*mut Cinfo, c_int) = "jpeg_start_compress",
        write_raw_data: unsafe extern "C-unwind" fn(*mut Cinfo, *const *const *const u8, c_uint) -> c_uint = "jpeg_write_raw_data",
        finish_compress: unsafe extern "C-unwind" fn(*mut Cinfo) = "jpeg_finish_compress",
        destroy_compress: unsafe extern "C-unwind" fn(*mut Cinfo) = "jpeg_destroy_compress",
    }
}

/// Compressor state plus its error manager, destroyed on drop. Both are
/// boxed so the pointers handed to the library stay put.
struct Compressor<'a> {
    api: &'a JpegliApi,
    cinfo: Box<Cinfo>,
    err: Box<jpeg_error_mgr>,
}

impl<'a> Compressor<'a> {
    fn new(api: &'a JpegliApi) -> Result<Self, RunnerError> {
        // SAFETY: both structs are plain data initialized by the library.
        let cinfo: Box<Cinfo> = Box::new(unsafe { std::mem::zeroed() });
        let mut err: Box<jpeg_error_mgr> = Box::new(unsafe { std::mem::zeroed() });
        unsafe { (api.std_error)(&mut *err) };
        err.error_exit = Some(unwind_error_exit);
        let mut compressor = Self {
            api,
            cinfo,
            err,
        };
        compressor.cinfo.common.err = &mut *compressor.err;
        let cinfo = compressor.as_mut_ptr();
        // SAFETY: jpeg_CreateCompress keeps the `err` pointer set above; a
        // zeroed `mem` makes the destroy in `drop` a no-op if it fails.
        catch_library_error(|| unsafe {
            (api.create_compress)(cinfo, JPEG_LIB_VERSION, std::mem::size_of::<Cinfo>())
        })
        .map_err(|message| RunnerError::Configure {
            codec: CODEC,
            message,
        })?;
        Ok(compressor)
    }

    fn as_mut_ptr(&mut self) -> *mut Cinfo {
        &mut *self.cinfo
    }
}

impl Drop for Compressor<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.destroy_compress)(&mut *self.cinfo) };
    }
}

/// Renders the pending library message through `format_message`.
///
/// # Safety
/// `cinfo.err` must be null or point to a live error manager.
unsafe fn library_message(cinfo: &mut jpeg_common_struct) -> String {
    let Some(err) = (unsafe { cinfo.err.as_ref() }) else {
        return "library error".to_string();
    };
    let msg_code = err.msg_code;
    let Some(format_message) = err.format_message else {
        return format!("library error code {msg_code}");
    };
    // libjpeg writes up to JMSG_LENGTH_MAX bytes; the binding declares 80.
    let mut buffer = [0u8; JMSG_LENGTH_MAX];
    unsafe { format_message(cinfo, &*buffer.as_mut_ptr().cast::<[u8; 80]>()) };
    let len = buffer.iter().position(|&byte| byte == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..len]).into_owned()
}

/// Replaces libjpeg's `error_exit`, which would call `exit()`, with an
/// unwind back to `catch_library_error`.
unsafe extern "C-unwind" fn unwind_error_exit(cinfo: &mut jpeg_common_struct) {
    let message = unsafe { library_message(cinfo) };
    panic::resume_unwind(Box::new(message));
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "library error".to_string(), |message| message.to_string()),
    }
}

/// Runs a sequence of library calls, returning the formatted message if
/// one of them raised a library error.
fn catch_library_error<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// Output buffer allocated by `jpeg_mem_dest`, released with `free`.
struct MemDest {
    buffer: *mut u8,
    size: c_ulong,
}

impl MemDest {
    fn bytes(&self) -> &[u8] {
        if self.buffer.is_null() {
            return &[];
        }
        // SAFETY: the library wrote `size` bytes into `buffer`.
        unsafe { std::slice::from_raw_parts(self.buffer, self.size as usize) }
    }
}

impl Drop for MemDest {
    fn drop(&mut self) {
        if !self.buffer.is_null() {
            // SAFETY: jpeg_mem_dest allocates its buffer with malloc.
            unsafe { libc::free(self.buffer.cast::<c_void>()) };
        }
    }
}

fn highway_optimization(value: String) -> Result<Optimization, RunnerError> {
    match value.as_str() {
        "all" => Ok(Optimization::Opt),
        "none" => Ok(Optimization::NonOpt),
        _ => Err(ParameterError::NotInList {
            codec: CODEC.to_string(),
            name: "highway_target".to_string(),
            value,
            valid: vec!["all".to_string(), "none".to_string()],
        }
        .into()),
    }
}

/// Planes padded to whole 16-row MCU groups, luma to a multiple of 16
/// columns and chroma to a multiple of 8.
fn raw_planes(input: &CodecInput<'_>) -> PaddedPlanes {
    let width = input.width as usize;
    let height = input.height as usize;
    let groups = height.div_ceil(LUMA_GROUP_ROWS);
    PaddedPlanes::new(
        input,
        width.next_multiple_of(16),
        groups * LUMA_GROUP_ROWS,
        width.div_ceil(2).next_multiple_of(8),
        groups * CHROMA_GROUP_ROWS,
    )
}

/// Row pointers for MCU row group `group`, one array per component.
fn group_rows(planes: &PaddedPlanes, group: usize) -> [Vec<*const u8>; 3] {
    let luma = (0..LUMA_GROUP_ROWS)
        .map(|row| planes.y[(group * LUMA_GROUP_ROWS + row) * planes.luma_stride..].as_ptr())
        .collect();
    let chroma = |plane: &[u8]| {
        (0..CHROMA_GROUP_ROWS)
            .map(|row| plane[(group * CHROMA_GROUP_ROWS + row) * planes.chroma_stride..].as_ptr())
            .collect::<Vec<_>>()
    };
    [luma, chroma(&planes.u), chroma(&planes.v)]
}

/// Compresses one frame into `dest` from prepared MCU row groups.
fn compress_frame(
    api: &JpegliApi,
    cinfo: *mut Cinfo,
    groups: &[[Vec<*const u8>; 3]],
    dest: &mut MemDest,
) -> Result<(), String> {
    // SAFETY: `cinfo` is a live compressor; each row array holds a full MCU
    // row group of pointers into planes that outlive the call.
    catch_library_error(|| unsafe {
        (api.mem_dest)(cinfo, &mut dest.buffer, &mut dest.size);
        (api.start_compress)(cinfo, 1);
        for rows in groups {
            let image = [rows[0].as_ptr(), rows[1].as_ptr(), rows[2].as_ptr()];
            if (api.write_raw_data)(cinfo, image.as_ptr(), LUMA_GROUP_ROWS as c_uint) == 0 {
                return Err("jpeg_write_raw_data consumed no rows".to_string());
            }
        }
        (api.finish_compress)(cinfo);
        Ok(())
    })?
}

#[derive(Debug, Default)]
pub(crate) struct JpegliRunner;

impl EncoderRunner for JpegliRunner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        input.validate()?;
        let quality = setup.int_or_default(JPEGLI_PARAMETERS, "quality")?;
        let optimization =
            highway_optimization(setup.str_or_default(JPEGLI_PARAMETERS, "highway_target")?)?;

        let num_runs = setup.num_runs;
        profiled_run(CODEC, num_runs, output, |output| {
            let module = optimization.module_name("jpegli");
            let api = JpegliApi::load(&module)?;
            let mut compressor = Compressor::new(&api)?;
            let cinfo = compressor.as_mut_ptr();

            // SAFETY: `cinfo` was created above and is destroyed when
            // `compressor` drops; sampling factors are set after
            // jpeg_set_colorspace, which resets them.
            catch_library_error(|| unsafe {
                (*cinfo).image_width = input.width as c_uint;
                (*cinfo).image_height = input.height as c_uint;
                (*cinfo).input_components = 3;
                (*cinfo).in_color_space = J_COLOR_SPACE::JCS_YCbCr;
                (api.set_defaults)(cinfo);
                (api.set_colorspace)(cinfo, J_COLOR_SPACE::JCS_YCbCr);
                let components = (*cinfo).comp_info;
                for (index, factor) in [2, 1, 1].into_iter().enumerate() {
                    (*components.add(index)).h_samp_factor = factor;
                    (*components.add(index)).v_samp_factor = factor;
                }
                (api.set_quality)(cinfo, quality, 1);
                (*cinfo).raw_data_in = 1 as _;
            })
            .map_err(|message| RunnerError::Configure {
                codec: CODEC,
                message,
            })?;
            debug!(codec = CODEC, %module, quality, "configured compressor");

            // Input conversion: no color conversion, planes padded to MCUs.
            let planes = raw_planes(input);
            let groups = (0..planes.luma_rows / LUMA_GROUP_ROWS)
                .map(|group| group_rows(&planes, group))
                .collect::<Vec<_>>();

            for run in 0..num_runs {
                let probe = FrameProbe::start();
                let mut dest = MemDest {
                    buffer: std::ptr::null_mut(),
                    size: 0,
                };
                compress_frame(&api, cinfo, &groups, &mut dest).map_err(|message| {
                    RunnerError::Encode {
                        codec: CODEC,
                        run,
                        message,
                    }
                })?;
                record_frame(output, CODEC, run, &probe, dest.bytes());
            }
            Ok(())
        })
    }
}

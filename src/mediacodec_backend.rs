use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

use ndk_sys::{
    AMediaCodec, AMediaCodec_configure, AMediaCodec_createCodecByName,
    AMediaCodec_createEncoderByType, AMediaCodec_delete, AMediaCodec_dequeueInputBuffer,
    AMediaCodec_dequeueOutputBuffer, AMediaCodec_getInputBuffer, AMediaCodec_getOutputBuffer,
    AMediaCodec_getOutputFormat, AMediaCodec_queueInputBuffer, AMediaCodec_releaseOutputBuffer,
    AMediaCodec_start, AMediaCodec_stop, AMediaCodecBufferInfo, AMediaFormat,
    AMediaFormat_delete, AMediaFormat_new, AMediaFormat_setInt32, AMediaFormat_setString,
    AMediaFormat_toString, media_status_t,
};
use tracing::{debug, info, warn};

use crate::binder;
use crate::contract::{CodecInput, CodecOutput, CodecSetup, EncoderRunner, RunnerError};
use crate::mediacodec_format::{CODEC, FormatValue, MediaFormatSpec};
use crate::mediacodec_pump::{BufferInfo, CodecQueue, InputSlot, OutputSlot, pump};
use crate::runner::{c_string, profiled_run};

const CONFIGURE_FLAG_ENCODE: u32 = 1;
const CREATE_ATTEMPTS: usize = 3;
const CREATE_BACKOFF: Duration = Duration::from_millis(50);

fn check(status: media_status_t, call: &str) -> Result<(), RunnerError> {
    if status.0 == 0 {
        return Ok(());
    }
    Err(RunnerError::Configure {
        codec: CODEC,
        message: format!("{call} failed with media status {}", status.0),
    })
}

fn describe(format: *mut AMediaFormat) -> String {
    // SAFETY: the string is owned by `format` and copied before it goes.
    let text = unsafe { AMediaFormat_toString(format) };
    if text.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
}

struct MediaFormat(NonNull<AMediaFormat>);

impl MediaFormat {
    fn from_spec(spec: &MediaFormatSpec) -> Result<Self, RunnerError> {
        let raw = NonNull::new(unsafe { AMediaFormat_new() }).ok_or_else(|| RunnerError::Configure {
            codec: CODEC,
            message: "AMediaFormat_new returned null".to_string(),
        })?;
        let format = Self(raw);
        for (key, value) in spec.entries() {
            let key_c = c_string(CODEC, key)?;
            match value {
                FormatValue::Int(value) => unsafe {
                    AMediaFormat_setInt32(format.0.as_ptr(), key_c.as_ptr(), value);
                },
                FormatValue::Str(value) => {
                    let value_c = c_string(CODEC, value)?;
                    unsafe { AMediaFormat_setString(format.0.as_ptr(), key_c.as_ptr(), value_c.as_ptr()) };
                }
            }
        }
        Ok(format)
    }
}

impl Drop for MediaFormat {
    fn drop(&mut self) {
        unsafe { AMediaFormat_delete(self.0.as_ptr()) };
    }
}

/// A created codec; stopped (when started) and deleted on drop.
struct Codec {
    raw: NonNull<AMediaCodec>,
    started: bool,
}

impl Codec {
    fn create(spec: &MediaFormatSpec) -> Result<Self, RunnerError> {
        let name = if spec.codec_name.is_empty() {
            None
        } else {
            Some(c_string(CODEC, &spec.codec_name)?)
        };
        let mime = CString::new(spec.mime).map_err(|_| RunnerError::Unsupported(CODEC))?;
        for attempt in 1..=CREATE_ATTEMPTS {
            // SAFETY: both strings are NUL-terminated and outlive the call.
            let raw = match &name {
                Some(name) => unsafe { AMediaCodec_createCodecByName(name.as_ptr()) },
                None => unsafe { AMediaCodec_createEncoderByType(mime.as_ptr()) },
            };
            if let Some(raw) = NonNull::new(raw) {
                debug!(codec = CODEC, name = %spec.codec_name, attempt, "codec created");
                return Ok(Self { raw, started: false });
            }
            warn!(codec = CODEC, name = %spec.codec_name, attempt, "codec creation failed");
            if attempt < CREATE_ATTEMPTS {
                thread::sleep(CREATE_BACKOFF);
            }
        }
        Err(RunnerError::Configure {
            codec: CODEC,
            message: format!(
                "cannot create codec '{}' ({}) after {CREATE_ATTEMPTS} attempts",
                spec.codec_name, spec.mime
            ),
        })
    }

    fn configure_and_start(&mut self, format: MediaFormat) -> Result<(), RunnerError> {
        let status = unsafe {
            AMediaCodec_configure(
                self.raw.as_ptr(),
                format.0.as_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                CONFIGURE_FLAG_ENCODE,
            )
        };
        drop(format);
        check(status, "AMediaCodec_configure")?;
        check(unsafe { AMediaCodec_start(self.raw.as_ptr()) }, "AMediaCodec_start")?;
        self.started = true;
        Ok(())
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        if self.started {
            unsafe { AMediaCodec_stop(self.raw.as_ptr()) };
        }
        unsafe { AMediaCodec_delete(self.raw.as_ptr()) };
    }
}

impl CodecQueue for Codec {
    fn dequeue_input(&mut self, timeout_us: i64) -> Result<InputSlot, RunnerError> {
        let index = unsafe { AMediaCodec_dequeueInputBuffer(self.raw.as_ptr(), timeout_us) };
        InputSlot::from_raw(index as isize)
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], RunnerError> {
        let mut size = 0usize;
        let data = unsafe { AMediaCodec_getInputBuffer(self.raw.as_ptr(), index, &mut size) };
        if data.is_null() {
            return Err(RunnerError::Configure {
                codec: CODEC,
                message: format!("AMediaCodec_getInputBuffer({index}) returned null"),
            });
        }
        // SAFETY: the slot is owned by us until it is queued back.
        Ok(unsafe { std::slice::from_raw_parts_mut(data, size) })
    }

    fn queue_input(&mut self, index: usize, size: usize, presentation_time_us: u64, flags: u32) -> Result<(), RunnerError> {
        let status = unsafe {
            AMediaCodec_queueInputBuffer(self.raw.as_ptr(), index, 0, size, presentation_time_us, flags)
        };
        check(status, "AMediaCodec_queueInputBuffer")
    }

    fn dequeue_output(&mut self, timeout_us: i64) -> Result<OutputSlot, RunnerError> {
        let mut info = AMediaCodecBufferInfo {
            offset: 0,
            size: 0,
            presentationTimeUs: 0,
            flags: 0,
        };
        let index = unsafe { AMediaCodec_dequeueOutputBuffer(self.raw.as_ptr(), &mut info, timeout_us) };
        OutputSlot::from_raw(
            index as isize,
            BufferInfo {
                offset: info.offset,
                size: info.size,
                presentation_time_us: info.presentationTimeUs,
                flags: info.flags,
            },
        )
    }

    fn output_buffer(&mut self, index: usize) -> Result<&[u8], RunnerError> {
        let mut size = 0usize;
        let data = unsafe { AMediaCodec_getOutputBuffer(self.raw.as_ptr(), index, &mut size) };
        if data.is_null() {
            return Err(RunnerError::Configure {
                codec: CODEC,
                message: format!("AMediaCodec_getOutputBuffer({index}) returned null"),
            });
        }
        // SAFETY: the slot is owned by us until it is released.
        Ok(unsafe { std::slice::from_raw_parts(data, size) })
    }

    fn output_format(&mut self) -> Option<String> {
        let format = NonNull::new(unsafe { AMediaCodec_getOutputFormat(self.raw.as_ptr()) })?;
        let format = MediaFormat(format);
        Some(describe(format.0.as_ptr()))
    }

    fn release_output(&mut self, index: usize) -> Result<(), RunnerError> {
        let status = unsafe { AMediaCodec_releaseOutputBuffer(self.raw.as_ptr(), index, false) };
        check(status, "AMediaCodec_releaseOutputBuffer")
    }
}

#[derive(Debug, Default)]
pub(crate) struct MediaCodecRunner;

impl EncoderRunner for MediaCodecRunner {
    fn run(
        &self,
        input: &CodecInput<'_>,
        setup: &mut CodecSetup,
        output: &mut CodecOutput,
    ) -> Result<(), RunnerError> {
        input.validate()?;
        let spec = MediaFormatSpec::from_setup(input, setup)?;

        let num_runs = setup.num_runs;
        let result = profiled_run(CODEC, num_runs, output, |output| {
            if !binder::init(input.debug_level) {
                warn!(codec = CODEC, "binder callback pool not running; the codec may stall");
            }
            let format = MediaFormat::from_spec(&spec)?;
            debug!(codec = CODEC, format = %describe(format.0.as_ptr()), "configuring codec");
            let mut codec = Codec::create(&spec)?;
            codec.configure_and_start(format)?;

            // Input conversion: none, the codec takes the I420 frame as is.
            let frame = &input.buffer[..input.frame_size()];
            let (frames, stats) = pump(&mut codec, frame, num_runs)?;
            info!(
                codec = CODEC,
                name = %spec.codec_name,
                sent = stats.frames_sent,
                received = stats.frames_received,
                "encode finished"
            );
            // Inputs and outputs overlap, so per-frame CPU is not attributable.
            for encoded in &frames {
                output.push_frame(encoded.timing, &encoded.bytes, 0.0);
            }
            Ok(())
        });
        binder::flush();
        result
    }
}

use std::ffi::CString;
use std::ptr::NonNull;

use tracing::debug;

use crate::contract::{CodecInput, CodecOutput, CodecSetup, FrameTiming, RunnerError};
use crate::loader::Optimization;
use crate::parameter::{ParameterDescriptor, ParameterError};
use crate::profiler::{FrameProbe, ResourceScope};

/// Owns a pointer handed out by a backend and releases it on drop.
pub(crate) struct NativeHandle<T, F: FnMut(*mut T)> {
    ptr: NonNull<T>,
    release: F,
}

impl<T, F: FnMut(*mut T)> NativeHandle<T, F> {
    /// Returns `None` for a null pointer; `release` is then never called.
    pub(crate) fn new(ptr: *mut T, release: F) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, release })
    }

    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T, F: FnMut(*mut T)> Drop for NativeHandle<T, F> {
    fn drop(&mut self) {
        (self.release)(self.ptr.as_ptr());
    }
}

/// Reads the `optimization` parameter.
pub(crate) fn optimization(
    codec: &'static str,
    descriptors: &[ParameterDescriptor],
    setup: &mut CodecSetup,
) -> Result<Optimization, RunnerError> {
    let value = setup.str_or_default(descriptors, "optimization")?;
    Optimization::parse(&value).ok_or_else(|| {
        RunnerError::Parameter(ParameterError::NotInList {
            codec: codec.to_string(),
            name: "optimization".to_string(),
            value,
            valid: vec!["opt".to_string(), "nonopt".to_string()],
        })
    })
}

pub(crate) fn c_string(codec: &'static str, value: &str) -> Result<CString, RunnerError> {
    CString::new(value).map_err(|_| RunnerError::Configure {
        codec,
        message: format!("value '{value}' contains a NUL byte"),
    })
}

/// Wraps a runner body in the process-resource scope. The output is reset
/// first; the delta and peak RSS are recorded whether or not the body
/// succeeds. A body that returns fewer than `num_runs` frames fails.
pub(crate) fn profiled_run<F>(
    codec: &'static str,
    num_runs: usize,
    output: &mut CodecOutput,
    body: F,
) -> Result<(), RunnerError>
where
    F: FnOnce(&mut CodecOutput) -> Result<(), RunnerError>,
{
    output.begin(num_runs);
    let scope = ResourceScope::start();
    let result = body(output);
    let (delta, end) = scope.finish();
    output.resource_delta = delta;
    output.profile_encode_mem_kb = end.rss_peak_kb;
    debug!(codec, frames = output.num_frames(), %delta, "runner finished");
    result?;
    if output.num_frames() < num_runs {
        return Err(RunnerError::ShortOutput {
            codec,
            produced: output.num_frames(),
            expected: num_runs,
        });
    }
    Ok(())
}

/// Closes `probe` and appends one frame.
pub(crate) fn record_frame(
    output: &mut CodecOutput,
    codec: &'static str,
    run: usize,
    probe: &FrameProbe,
    bytes: &[u8],
) {
    let (output_timestamp_us, cpu_ms) = probe.finish();
    let timing = FrameTiming {
        input_timestamp_us: probe.input_timestamp_us,
        output_timestamp_us,
    };
    debug!(
        codec,
        run,
        size = bytes.len(),
        encode_time_us = timing.encode_time_us(),
        cpu_ms,
        "encoded frame"
    );
    output.push_frame(timing, bytes, cpu_ms);
}

/// Copies of the three planes with row strides and row counts of the
/// caller's choosing. Columns and rows past the source edge repeat the
/// last source sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PaddedPlanes {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub luma_stride: usize,
    pub chroma_stride: usize,
    pub luma_rows: usize,
    pub chroma_rows: usize,
}

fn pad_plane(
    src: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    rows: usize,
) -> Vec<u8> {
    let mut plane = Vec::with_capacity(stride * rows);
    if width == 0 || height == 0 {
        plane.resize(stride * rows, 0);
        return plane;
    }
    for row in 0..rows {
        let line = &src[row.min(height - 1) * width..][..width];
        let copied = width.min(stride);
        plane.extend_from_slice(&line[..copied]);
        plane.resize(plane.len() + stride - copied, line[width - 1]);
    }
    plane
}

impl PaddedPlanes {
    pub(crate) fn new(
        input: &CodecInput<'_>,
        luma_stride: usize,
        luma_rows: usize,
        chroma_stride: usize,
        chroma_rows: usize,
    ) -> Self {
        let (y, u, v) = input.planes();
        let width = input.width.max(0) as usize;
        let height = input.height.max(0) as usize;
        let chroma_width = input.chroma_width();
        let chroma_height = input.chroma_height();
        Self {
            y: pad_plane(y, width, height, luma_stride, luma_rows),
            u: pad_plane(u, chroma_width, chroma_height, chroma_stride, chroma_rows),
            v: pad_plane(v, chroma_width, chroma_height, chroma_stride, chroma_rows),
            luma_stride,
            chroma_stride,
            luma_rows,
            chroma_rows,
        }
    }

    /// Planes concatenated into one contiguous buffer.
    pub(crate) fn contiguous(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.y.len() + self.u.len() + self.v.len());
        buffer.extend_from_slice(&self.y);
        buffer.extend_from_slice(&self.u);
        buffer.extend_from_slice(&self.v);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ColorFormat;

    #[test]
    fn padding_repeats_edge_samples() {
        // 2x2 luma [1 2; 3 4], 1x1 chroma.
        let buffer = [1u8, 2, 3, 4, 9, 7];
        let input = CodecInput::new(&buffer, 2, 2, ColorFormat::Yuv420p);
        let planes = PaddedPlanes::new(&input, 4, 3, 2, 2);
        assert_eq!(planes.y, vec![1, 2, 2, 2, 3, 4, 4, 4, 3, 4, 4, 4]);
        assert_eq!(planes.u, vec![9, 9, 9, 9]);
        assert_eq!(planes.v, vec![7, 7, 7, 7]);
        assert_eq!(planes.contiguous().len(), 12 + 4 + 4);
    }

    #[test]
    fn exact_strides_copy_unchanged() {
        let buffer = (0u8..24).collect::<Vec<_>>();
        let input = CodecInput::new(&buffer, 4, 4, ColorFormat::Yuv420p);
        let planes = PaddedPlanes::new(&input, 4, 4, 2, 2);
        assert_eq!(planes.contiguous(), buffer);
    }

    #[test]
    fn profiled_run_flags_short_output() {
        let mut output = CodecOutput::new(false);
        let err = profiled_run("demo", 2, &mut output, |output| {
            output.push_frame(FrameTiming::default(), &[1], 0.0);
            Ok(())
        })
        .expect_err("one of two frames must fail");
        assert!(matches!(
            err,
            RunnerError::ShortOutput {
                produced: 1,
                expected: 2,
                ..
            }
        ));
        assert!(output.resource_delta.wall_time_ms >= 0.0);
    }

    #[test]
    fn profiled_run_keeps_prefix_on_error() {
        let mut output = CodecOutput::new(true);
        let err = profiled_run("demo", 3, &mut output, |output| {
            output.push_frame(FrameTiming::default(), &[1, 2], 0.0);
            Err(RunnerError::Encode {
                codec: "demo",
                run: 1,
                message: "boom".to_string(),
            })
        })
        .expect_err("body error must propagate");
        assert!(matches!(err, RunnerError::Encode { run: 1, .. }));
        assert_eq!(output.frame_sizes, vec![2]);
        assert_eq!(output.frame_buffers, vec![vec![1, 2]]);
    }

    #[test]
    fn profiled_run_records_peak_memory() {
        let mut output = CodecOutput::new(false);
        profiled_run("demo", 1, &mut output, |output| {
            let probe = FrameProbe::start();
            record_frame(output, "demo", 0, &probe, &[0; 8]);
            Ok(())
        })
        .expect("single frame run should succeed");
        assert_eq!(output.frame_sizes, vec![8]);
        assert!(output.timings[0].output_timestamp_us >= output.timings[0].input_timestamp_us);
        assert!(output.profile_encode_mem_kb >= 0);
    }
}

use tracing::{debug, trace};

use crate::contract::{FrameTiming, RunnerError};
use crate::mediacodec_format::CODEC;
use crate::profiler::timestamp_us;

/// Dequeue timeout for both queues.
pub const DEQUEUE_TIMEOUT_US: i64 = 10_000;
/// Presentation-time step between submitted frames.
pub const FRAME_DURATION_US: u64 = 33_000;

pub const BUFFER_FLAG_KEY_FRAME: u32 = 1;
pub const BUFFER_FLAG_CODEC_CONFIG: u32 = 2;
pub const BUFFER_FLAG_END_OF_STREAM: u32 = 4;
pub const BUFFER_FLAG_PARTIAL_FRAME: u32 = 8;

pub const INFO_TRY_AGAIN_LATER: isize = -1;
pub const INFO_OUTPUT_FORMAT_CHANGED: isize = -2;
pub const INFO_OUTPUT_BUFFERS_CHANGED: isize = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    pub offset: i32,
    pub size: i32,
    pub presentation_time_us: i64,
    pub flags: u32,
}

impl BufferInfo {
    fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSlot {
    TryAgainLater,
    Ready(usize),
}

impl InputSlot {
    /// Maps a raw `dequeueInputBuffer` result.
    pub fn from_raw(index: isize) -> Result<Self, RunnerError> {
        match index {
            INFO_TRY_AGAIN_LATER => Ok(Self::TryAgainLater),
            index if index >= 0 => Ok(Self::Ready(index as usize)),
            other => Err(pump_error(format!("dequeueInputBuffer returned {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    TryAgainLater,
    FormatChanged,
    BuffersChanged,
    Ready { index: usize, info: BufferInfo },
}

impl OutputSlot {
    /// Maps a raw `dequeueOutputBuffer` result and its buffer info.
    pub fn from_raw(index: isize, info: BufferInfo) -> Result<Self, RunnerError> {
        match index {
            INFO_TRY_AGAIN_LATER => Ok(Self::TryAgainLater),
            INFO_OUTPUT_FORMAT_CHANGED => Ok(Self::FormatChanged),
            INFO_OUTPUT_BUFFERS_CHANGED => Ok(Self::BuffersChanged),
            index if index >= 0 => Ok(Self::Ready {
                index: index as usize,
                info,
            }),
            other => Err(pump_error(format!("dequeueOutputBuffer returned {other}"))),
        }
    }
}

/// The bounded input and output buffer queues of a started codec.
pub trait CodecQueue {
    fn dequeue_input(&mut self, timeout_us: i64) -> Result<InputSlot, RunnerError>;
    /// Codec-owned memory behind an input slot.
    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], RunnerError>;
    fn queue_input(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: u64,
        flags: u32,
    ) -> Result<(), RunnerError>;
    fn dequeue_output(&mut self, timeout_us: i64) -> Result<OutputSlot, RunnerError>;
    /// Codec-owned memory behind an output slot; `info` selects the bytes.
    fn output_buffer(&mut self, index: usize) -> Result<&[u8], RunnerError>;
    /// Description of the current output format, for logging.
    fn output_format(&mut self) -> Option<String>;
    fn release_output(&mut self, index: usize) -> Result<(), RunnerError>;
}

/// One encoded frame as delivered by the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub timing: FrameTiming,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpStats {
    pub frames_sent: usize,
    pub frames_received: usize,
    pub config_bytes: usize,
}

fn pump_error(message: String) -> RunnerError {
    RunnerError::Configure {
        codec: CODEC,
        message,
    }
}

/// Output-side bookkeeping: config bytes and partial-frame chunks are
/// concatenated onto the frame they belong to.
#[derive(Debug, Default)]
struct FrameAssembler {
    frames: Vec<EncodedFrame>,
    /// Bytes waiting for the next frame boundary.
    pending: Vec<u8>,
    config_bytes: usize,
}

impl FrameAssembler {
    fn config(&mut self, bytes: &[u8]) {
        self.config_bytes += bytes.len();
        match self.frames.last_mut() {
            Some(frame) if self.pending.is_empty() => frame.bytes.extend_from_slice(bytes),
            _ => self.pending.extend_from_slice(bytes),
        }
    }

    fn partial(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn complete(&mut self, bytes: &[u8], input_timestamps: &[i64]) {
        let now = timestamp_us();
        let input_timestamp_us = input_timestamps
            .get(self.frames.len())
            .copied()
            .unwrap_or(now);
        let mut frame = std::mem::take(&mut self.pending);
        frame.extend_from_slice(bytes);
        self.frames.push(EncodedFrame {
            timing: FrameTiming {
                input_timestamp_us,
                output_timestamp_us: now.max(input_timestamp_us),
            },
            bytes: frame,
        });
    }

    /// Pending bytes left at end of stream belong to the last frame.
    fn finish(mut self) -> Vec<EncodedFrame> {
        if !self.pending.is_empty() {
            if let Some(frame) = self.frames.last_mut() {
                frame.bytes.append(&mut self.pending);
            }
        }
        self.frames
    }
}

/// Drives the queues until the codec acknowledges end of stream. `frame`
/// is submitted `num_runs` times, followed by an empty end-of-stream
/// buffer. Fewer output frames than inputs is not an error here.
pub fn pump<Q: CodecQueue + ?Sized>(
    queue: &mut Q,
    frame: &[u8],
    num_runs: usize,
) -> Result<(Vec<EncodedFrame>, PumpStats), RunnerError> {
    let mut input_timestamps = Vec::with_capacity(num_runs);
    let mut assembler = FrameAssembler::default();
    let mut input_eos_sent = false;

    loop {
        if !input_eos_sent {
            match queue.dequeue_input(DEQUEUE_TIMEOUT_US)? {
                InputSlot::TryAgainLater => trace!(codec = CODEC, "input queue full"),
                InputSlot::Ready(index) if input_timestamps.len() < num_runs => {
                    let frames_sent = input_timestamps.len();
                    input_timestamps.push(timestamp_us());
                    let slot = queue.input_buffer(index)?;
                    let available = slot.len();
                    let Some(slot) = slot.get_mut(..frame.len()) else {
                        return Err(RunnerError::Encode {
                            codec: CODEC,
                            run: frames_sent,
                            message: format!(
                                "input buffer {index} holds {available} bytes, frame needs {}",
                                frame.len()
                            ),
                        });
                    };
                    slot.copy_from_slice(frame);
                    let pts = frames_sent as u64 * FRAME_DURATION_US;
                    queue.queue_input(index, frame.len(), pts, 0)?;
                    debug!(codec = CODEC, index, pts, "queued frame {frames_sent}");
                }
                InputSlot::Ready(index) => {
                    queue.queue_input(index, 0, 0, BUFFER_FLAG_END_OF_STREAM)?;
                    input_eos_sent = true;
                    debug!(codec = CODEC, index, "queued end of stream");
                }
            }
        }

        match queue.dequeue_output(DEQUEUE_TIMEOUT_US)? {
            OutputSlot::TryAgainLater => trace!(codec = CODEC, "no output yet"),
            OutputSlot::FormatChanged => {
                let format = queue.output_format().unwrap_or_default();
                debug!(codec = CODEC, %format, "output format changed");
            }
            OutputSlot::BuffersChanged => debug!(codec = CODEC, "output buffers changed"),
            OutputSlot::Ready { index, info } => {
                if info.size > 0 {
                    let buffer = queue.output_buffer(index)?;
                    let start = info.offset.max(0) as usize;
                    let bytes = buffer
                        .get(start..start + info.size as usize)
                        .ok_or_else(|| {
                            pump_error(format!(
                                "output buffer {index} holds {} bytes, info asks for {}+{}",
                                buffer.len(),
                                info.offset,
                                info.size
                            ))
                        })?;
                    if info.has(BUFFER_FLAG_CODEC_CONFIG) {
                        debug!(codec = CODEC, size = info.size, "config data");
                        assembler.config(bytes);
                    } else if info.has(BUFFER_FLAG_PARTIAL_FRAME) {
                        assembler.partial(bytes);
                    } else {
                        debug!(
                            codec = CODEC,
                            size = info.size,
                            pts = info.presentation_time_us,
                            key = info.has(BUFFER_FLAG_KEY_FRAME),
                            "frame {} received",
                            assembler.frames.len()
                        );
                        assembler.complete(bytes, &input_timestamps);
                    }
                }
                queue.release_output(index)?;
                if info.has(BUFFER_FLAG_END_OF_STREAM) {
                    break;
                }
            }
        }
    }

    let stats = PumpStats {
        frames_sent: input_timestamps.len(),
        frames_received: assembler.frames.len(),
        config_bytes: assembler.config_bytes,
    };
    debug!(codec = CODEC, ?stats, "end of stream");
    Ok((assembler.finish(), stats))
}

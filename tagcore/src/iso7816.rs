//! ISO/IEC 7816-3 T=0 contact decoder.
//!
//! Consumes interleaved multichannel logic samples (I/O on channel 0, card
//! clock optionally on channel 1) and recovers asynchronous characters: one
//! start bit, eight data bits LSB first, even parity, at 372 clock cycles per
//! etu. Characters separated by more than a character guard time are grouped
//! into frames, alternating terminal request and card response after the ATR.

use crate::buffer::SignalBuffer;
use crate::frame::{frame_flags, FramePhase, FrameType, RawFrame, TechType};
use log::{debug, info};

/// Default card clock when no CLK channel is wired.
const DEFAULT_CLOCK_FREQUENCY: u32 = 4_000_000;

/// Clock cycles per elementary time unit at the default F/D.
const ETU_CLOCKS: u32 = 372;

/// Inter-character gap that closes a frame, in etus.
const FRAME_GUARD_ETUS: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharState {
    /// Waiting for a falling start edge on I/O
    Idle,
    /// Sampling data and parity bits at half-etu offsets
    Sampling,
}

#[derive(Debug, Default)]
struct FrameAssembly {
    bytes: Vec<u8>,
    parity_error: bool,
    sample_start: u64,
    sample_end: u64,
}

/// ISO-7816 decoder for one logic capture stream.
pub struct IsoDecoder {
    enabled: bool,
    debug_enabled: bool,
    sample_rate: u32,
    stream_time: f64,
    clock_frequency: u32,

    /// Samples per elementary time unit
    etu_samples: f64,
    /// Absolute index of the next inbound sample
    clock: u64,
    /// Last observed I/O level
    io_level: f32,
    state: CharState,
    /// Start edge of the character being sampled
    char_start: u64,
    /// Bits collected for the current character (data then parity)
    char_bits: u32,
    char_data: u8,
    char_parity: u32,
    /// End of the previous character, for frame gap detection
    last_char_end: u64,

    assembly: FrameAssembly,
    /// ATR seen: the first frame of a session comes from the card
    atr_done: bool,
    /// Next frame direction when alternating after the ATR
    request_next: bool,
}

impl IsoDecoder {
    pub fn new() -> Self {
        IsoDecoder {
            enabled: true,
            debug_enabled: false,
            sample_rate: 0,
            stream_time: 0.0,
            clock_frequency: DEFAULT_CLOCK_FREQUENCY,
            etu_samples: 0.0,
            clock: 0,
            io_level: 1.0,
            state: CharState::Idle,
            char_start: 0,
            char_bits: 0,
            char_data: 0,
            char_parity: 0,
            last_char_end: 0,
            assembly: FrameAssembly::default(),
            atr_done: false,
            request_next: false,
        }
    }

    pub fn initialize(&mut self) {
        self.clock = 0;
        self.io_level = 1.0;
        self.state = CharState::Idle;
        self.last_char_end = 0;
        self.assembly = FrameAssembly::default();
        self.atr_done = false;
        self.request_next = false;
        self.update_timing();
        info!(
            "ISO7816 decoder ready: {} sps, etu {:.1} samples",
            self.sample_rate, self.etu_samples
        );
    }

    pub fn cleanup(&mut self) {
        self.state = CharState::Idle;
        self.assembly = FrameAssembly::default();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.update_timing();
    }

    pub fn stream_time(&self) -> f64 {
        self.stream_time
    }

    pub fn set_stream_time(&mut self, time: f64) {
        self.stream_time = time;
    }

    pub fn is_iso7816_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_iso7816_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    pub fn set_debug_enabled(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    pub fn set_clock_frequency(&mut self, frequency: u32) {
        self.clock_frequency = frequency;
        self.update_timing();
    }

    fn update_timing(&mut self) {
        if self.sample_rate > 0 && self.clock_frequency > 0 {
            self.etu_samples = f64::from(self.sample_rate) * f64::from(ETU_CLOCKS)
                / f64::from(self.clock_frequency);
        }
    }

    /// Decode all frames available in the buffer. An invalid buffer flushes
    /// any frame under assembly.
    pub fn next_frames(&mut self, buffer: &mut SignalBuffer) -> Vec<RawFrame> {
        let mut frames = Vec::new();

        if !buffer.is_valid() {
            self.finish_frame(&mut frames, true);
            self.state = CharState::Idle;
            return frames;
        }

        if !self.enabled || self.etu_samples <= 0.0 {
            return frames;
        }

        let stride = buffer.stride().max(1);

        while buffer.remaining() >= stride {
            let mut lanes = [0.0f32; 2];
            let io = if stride == 1 {
                buffer.get().unwrap_or(1.0)
            } else {
                buffer.get_slice(&mut lanes[..stride.min(2)]);
                for _ in 2..stride {
                    let _ = buffer.get();
                }
                lanes[0]
            };

            self.clock += 1;

            match self.state {
                CharState::Idle => {
                    // start bit is a falling edge on a high line
                    if self.io_level > 0.5 && io < 0.5 {
                        self.state = CharState::Sampling;
                        self.char_start = self.clock;
                        self.char_bits = 0;
                        self.char_data = 0;
                        self.char_parity = 0;

                        // a long quiet gap closes the pending frame
                        if !self.assembly.bytes.is_empty()
                            && self.clock - self.last_char_end
                                > FRAME_GUARD_ETUS * self.etu_samples as u64
                        {
                            self.finish_frame(&mut frames, false);
                        }
                    }
                }
                CharState::Sampling => {
                    // bit n is sampled at (n + 1.5) etu after the start edge
                    let position = (f64::from(self.char_bits) + 1.5) * self.etu_samples;
                    if (self.clock - self.char_start) as f64 >= position {
                        let bit = u32::from(io > 0.5);

                        if self.char_bits < 8 {
                            self.char_data |= (bit as u8) << self.char_bits;
                        } else {
                            self.char_parity = bit;
                        }
                        self.char_bits += 1;

                        if self.char_bits == 9 {
                            self.push_character();
                        }
                    }
                }
            }

            self.io_level = io;
        }

        frames
    }

    fn push_character(&mut self) {
        // even parity: data plus parity bit has an even population count
        let even = (self.char_data.count_ones() + self.char_parity) % 2 == 0;

        if self.assembly.bytes.is_empty() {
            self.assembly.sample_start = self.char_start;
            self.assembly.parity_error = false;
        }

        self.assembly.bytes.push(self.char_data);
        self.assembly.parity_error |= !even;
        self.assembly.sample_end = self.clock;

        self.last_char_end = self.clock;
        self.state = CharState::Idle;

        debug!(
            "char {:02X} parity {} at {}",
            self.char_data, self.char_parity, self.char_start
        );
    }

    fn finish_frame(&mut self, frames: &mut Vec<RawFrame>, truncated: bool) {
        if self.assembly.bytes.is_empty() {
            return;
        }

        let assembly = std::mem::take(&mut self.assembly);

        let frame_type = if !self.atr_done {
            self.atr_done = true;
            self.request_next = true;
            FrameType::IsoResponse
        } else if self.request_next {
            self.request_next = false;
            FrameType::IsoRequest
        } else {
            self.request_next = true;
            FrameType::IsoResponse
        };

        let mut frame = RawFrame::new(TechType::Iso7816, frame_type);
        // the ATR (TS 0x3B direct / 0x3F inverse) opens the session
        let atr = frame_type == FrameType::IsoResponse && matches!(assembly.bytes[0], 0x3B | 0x3F);
        frame.set_frame_phase(if atr {
            FramePhase::Selection
        } else {
            FramePhase::Application
        });
        frame.set_frame_rate((f64::from(self.sample_rate) / self.etu_samples) as u32);
        frame.set_sample_rate(self.sample_rate);
        frame.set_sample_start(assembly.sample_start);
        frame.set_sample_end(assembly.sample_end);
        frame.set_time_start(
            assembly.sample_start as f64 / f64::from(self.sample_rate) + self.stream_time,
        );
        frame.set_time_end(
            assembly.sample_end as f64 / f64::from(self.sample_rate) + self.stream_time,
        );

        if assembly.parity_error {
            frame.set_frame_flags(frame_flags::PARITY_ERROR);
        }
        if truncated {
            frame.set_frame_flags(frame_flags::TRUNCATED);
        }

        frame.put_slice(&assembly.bytes);

        frames.push(frame);
    }
}

impl Default for IsoDecoder {
    fn default() -> Self {
        IsoDecoder::new()
    }
}

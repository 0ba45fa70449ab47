//! NFC-A (ISO/IEC 14443 type A) demodulator.
//!
//! Poll frames are ASK / Modified Miller at 106 kbps and up, listen frames are
//! Manchester load modulation at 106 kbps or BPSK at 212/424 kbps. Detection
//! runs one matched correlator per symbol rate over a shared ring of magnitude
//! samples; the rates are staggered by one symbol period each so a frame
//! missed at one rate is still intact in the ring for the next.

use crate::buffer::SignalBuffer;
use crate::crc::{check_frame_crc, check_odd_parity};
use crate::frame::{frame_flags, FramePhase, FrameType, RawFrame, TechType};
use log::{debug, info};

/// NFC carrier frequency (13.56 MHz).
pub const BASE_FREQUENCY: f64 = 13.56e6;

/// Ring length for signal integration, must be a power of two.
pub const SIGNAL_BUFFER_LENGTH: usize = 512;

const BUFFER_MASK: u64 = (SIGNAL_BUFFER_LENGTH as u64) - 1;

/// FSDI to FSD conversion (maximum frame size in bytes).
pub const TABLE_FDS: [usize; 16] = [16, 24, 32, 40, 48, 64, 96, 128, 256, 0, 0, 0, 0, 0, 0, 256];

mod command {
    pub const REQA: u8 = 0x26;
    pub const WUPA: u8 = 0x52;
    pub const HLTA: u8 = 0x50;
    pub const AUTH1: u8 = 0x60;
    pub const AUTH2: u8 = 0x61;
    pub const SEL1: u8 = 0x93;
    pub const SEL2: u8 = 0x95;
    pub const SEL3: u8 = 0x97;
    pub const RATS: u8 = 0xE0;
    pub const PPS: u8 = 0xD0;
    pub const IBLOCK: u8 = 0x02;
    pub const RBLOCK: u8 = 0xA2;
    pub const SBLOCK: u8 = 0xC2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pattern {
    Invalid,
    /// Frame waiting time expired without a symbol
    NoPattern,
    /// Poll: pause in the middle of the bit period (logic 1)
    X,
    /// Poll: no pause (logic 1 after 1, or delimiter)
    Y,
    /// Poll: pause at the start of the bit period (logic 0)
    Z,
    /// Listen ASK: modulation in the first half (logic 1)
    D,
    /// Listen ASK: modulation in the second half (logic 0)
    E,
    /// Listen ASK: end of frame, no modulation
    F,
    /// Listen BPSK: reference phase
    M,
    /// Listen BPSK: inverted phase
    N,
    /// Listen BPSK: end of frame
    O,
}

impl Pattern {
    fn is_symbol(self) -> bool {
        !matches!(self, Pattern::Invalid | Pattern::NoPattern)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateType {
    R106k = 0,
    R212k = 1,
    R424k = 2,
    R848k = 3,
}

/// Static timing constants for one symbol rate, derived from the sample rate.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BitrateParams {
    pub symbols_per_second: u32,
    /// Samples per full symbol
    pub period1: usize,
    /// Samples per half symbol
    pub period2: usize,
    /// Samples per quarter symbol
    pub period4: usize,
    /// Samples per eighth symbol
    pub period8: usize,
    /// Detection delay of this rate behind the live sample stream
    pub symbol_delay_detect: usize,
    pub offset_signal: u64,
    pub offset_filter: u64,
    pub offset_symbol: u64,
    pub offset_detect: u64,
    pub symbol_average_w0: f32,
    pub symbol_average_w1: f32,
}

/// Per-rate modulation search state.
pub(crate) struct ModulationStatus {
    pub search_start_time: u64,
    pub search_end_time: u64,
    pub search_peak_time: u64,
    pub search_pulse_width: u64,
    pub search_deep_value: f32,
    pub search_threshold: f32,

    pub symbol_start_time: u64,
    pub symbol_end_time: u64,
    pub symbol_corr0: f32,
    pub symbol_corr1: f32,
    pub symbol_phase: f32,
    pub symbol_average: f32,

    pub filter_integrate: f32,
    pub phase_integrate: f32,
    pub phase_threshold: f32,

    pub correlated_s0: f32,
    pub correlated_s1: f32,
    pub correlated_sd: f32,
    pub correlation_peek: f32,

    pub integration_data: [f32; SIGNAL_BUFFER_LENGTH],
    pub correlation_data: [f32; SIGNAL_BUFFER_LENGTH],
}

impl Default for ModulationStatus {
    fn default() -> Self {
        ModulationStatus {
            search_start_time: 0,
            search_end_time: 0,
            search_peak_time: 0,
            search_pulse_width: 0,
            search_deep_value: 0.0,
            search_threshold: 0.0,
            symbol_start_time: 0,
            symbol_end_time: 0,
            symbol_corr0: 0.0,
            symbol_corr1: 0.0,
            symbol_phase: 0.0,
            symbol_average: 0.0,
            filter_integrate: 0.0,
            phase_integrate: 0.0,
            phase_threshold: 0.0,
            correlated_s0: 0.0,
            correlated_s1: 0.0,
            correlated_sd: 0.0,
            correlation_peek: 0.0,
            integration_data: [0.0; SIGNAL_BUFFER_LENGTH],
            correlation_data: [0.0; SIGNAL_BUFFER_LENGTH],
        }
    }
}

impl ModulationStatus {
    fn reset_search(&mut self) {
        self.search_start_time = 0;
        self.search_end_time = 0;
        self.search_pulse_width = 0;
        self.search_deep_value = 0.0;
        self.correlation_peek = 0.0;
        self.correlated_sd = 0.0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SymbolStatus {
    pub pattern: Option<Pattern>,
    pub value: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StreamStatus {
    pub previous: Option<Pattern>,
    pub bits: u32,
    pub data: u8,
    pub parity: u32,
    pub flags: u32,
    pub bytes: usize,
    pub buffer: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FrameStatus {
    pub last_command: u8,
    pub frame_type: Option<FrameType>,
    pub symbol_rate: u32,
    pub frame_start: u64,
    pub frame_end: u64,
    pub guard_end: u64,
    pub waiting_end: u64,
    pub frame_guard_time: u64,
    pub frame_waiting_time: u64,
    pub startup_guard_time: u64,
    pub request_guard_time: u64,
}

/// Negotiated protocol parameters, reset by REQA/WUPA/HLTA and updated by
/// RATS / ATS.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ProtocolStatus {
    pub max_frame_size: usize,
    pub frame_guard_time: u64,
    pub frame_waiting_time: u64,
    pub startup_guard_time: u64,
    pub request_guard_time: u64,
}

/// Exponential smoothing weights shared by the whole stream.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SignalParams {
    pub power_average_w0: f32,
    pub power_average_w1: f32,
    pub signal_average_w0: f32,
    pub signal_average_w1: f32,
    pub signal_variance_w0: f32,
    pub signal_variance_w1: f32,
    pub sample_time_unit: f64,
}

/// Running signal statistics and the shared sample ring.
pub(crate) struct SignalStatus {
    pub sample_data: [f32; 2],
    pub signal_value: f32,
    pub power_average: f32,
    pub signal_average: f32,
    pub signal_variance: f32,
    pub signal_data: [f32; SIGNAL_BUFFER_LENGTH],
    pub carrier_off: u64,
    pub carrier_on: u64,
}

impl Default for SignalStatus {
    fn default() -> Self {
        SignalStatus {
            sample_data: [0.0; 2],
            signal_value: 0.0,
            power_average: 0.0,
            signal_average: 0.0,
            signal_variance: 0.0,
            signal_data: [0.0; SIGNAL_BUFFER_LENGTH],
            carrier_off: 0,
            carrier_on: 0,
        }
    }
}

/// Per-stream context shared between the technology decoders.
pub(crate) struct DecoderStatus {
    pub params: SignalParams,
    pub signal: SignalStatus,
    pub sample_rate: u32,
    pub signal_clock: u64,
    pub power_level_threshold: f32,
    pub stream_time: f64,
}

impl Default for DecoderStatus {
    fn default() -> Self {
        DecoderStatus {
            params: SignalParams::default(),
            signal: SignalStatus::default(),
            sample_rate: 0,
            signal_clock: 0,
            power_level_threshold: 0.010,
            stream_time: 0.0,
        }
    }
}

impl DecoderStatus {
    /// Pull one sample from the buffer and update the running statistics.
    /// IQ buffers (stride 2) are collapsed to magnitude on the fly.
    pub fn next_sample(&mut self, buffer: &mut SignalBuffer) -> bool {
        if buffer.remaining() == 0 {
            return false;
        }

        if buffer.stride() == 1 {
            self.signal.signal_value = buffer.get().unwrap_or(0.0);
        } else {
            buffer.get_slice(&mut self.signal.sample_data);
            let i = f64::from(self.signal.sample_data[0]);
            let q = f64::from(self.signal.sample_data[1]);
            self.signal.signal_value = ((i * i + q * q).sqrt()) as f32;
        }

        self.signal_clock += 1;

        let signal = &mut self.signal;
        let params = &self.params;

        signal.power_average =
            signal.power_average * params.power_average_w0 + signal.signal_value * params.power_average_w1;
        signal.signal_average =
            signal.signal_average * params.signal_average_w0 + signal.signal_value * params.signal_average_w1;
        signal.signal_variance = signal.signal_variance * params.signal_variance_w0
            + (signal.signal_value - signal.signal_average).abs() * params.signal_variance_w1;

        signal.signal_data[(self.signal_clock & BUFFER_MASK) as usize] = signal.signal_value;

        true
    }

    fn sample_at(&self, index: u64) -> f32 {
        self.signal.signal_data[(index & BUFFER_MASK) as usize]
    }

    fn time_of(&self, sample: u64) -> f64 {
        sample as f64 / f64::from(self.sample_rate) + self.stream_time
    }
}

/// NFC-A demodulator and frame assembler for one stream.
pub(crate) struct NfcA {
    bitrate_params: [BitrateParams; 3],
    modulation_status: Vec<ModulationStatus>,
    symbol_status: SymbolStatus,
    stream_status: StreamStatus,
    frame_status: FrameStatus,
    protocol_status: ProtocolStatus,
    last_frame_end: u64,
    chained_flags: u32,

    /// Selected `(bitrate, modulation)` while a frame is in progress
    active: Option<usize>,

    pub correlation_threshold: f32,
    pub minimum_modulation_deep: f32,
    pub maximum_modulation_deep: f32,
}

impl NfcA {
    pub fn new() -> Self {
        NfcA {
            bitrate_params: [BitrateParams::default(); 3],
            modulation_status: (0..3).map(|_| ModulationStatus::default()).collect(),
            symbol_status: SymbolStatus::default(),
            stream_status: StreamStatus::default(),
            frame_status: FrameStatus::default(),
            protocol_status: ProtocolStatus::default(),
            last_frame_end: 0,
            chained_flags: 0,
            active: None,
            correlation_threshold: 0.75,
            minimum_modulation_deep: 0.85,
            maximum_modulation_deep: 1.00,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Derive timing constants for 106/212/424 kbps from the stream sample
    /// rate and reset all decoding state.
    pub fn configure(&mut self, decoder: &mut DecoderStatus, sample_rate: u32) {
        info!("initializing NFC-A decoder at {sample_rate} sps");

        decoder.sample_rate = sample_rate;
        decoder.params.sample_time_unit = f64::from(sample_rate) / BASE_FREQUENCY;

        self.symbol_status = SymbolStatus::default();
        self.stream_status = StreamStatus::default();
        self.frame_status = FrameStatus::default();
        self.last_frame_end = 0;
        self.chained_flags = 0;
        self.active = None;

        let stu = decoder.params.sample_time_unit;

        for rate in 0..3 {
            self.modulation_status[rate] = ModulationStatus::default();

            let mut params = BitrateParams {
                symbols_per_second: (BASE_FREQUENCY / f64::from(128 >> rate)) as u32,
                period1: (stu * f64::from(128 >> rate)).round() as usize,
                period2: (stu * f64::from(64 >> rate)).round() as usize,
                period4: (stu * f64::from(32 >> rate)).round() as usize,
                period8: (stu * f64::from(16 >> rate)).round() as usize,
                ..BitrateParams::default()
            };

            // each rate trails the previous one by a full symbol
            params.symbol_delay_detect = if rate > 0 {
                self.bitrate_params[rate - 1].symbol_delay_detect + self.bitrate_params[rate - 1].period1
            } else {
                0
            };

            // ring offsets are taken modulo the buffer length, wrapping is
            // intentional
            let len = SIGNAL_BUFFER_LENGTH as u64;
            params.offset_signal = len.wrapping_sub(params.symbol_delay_detect as u64);
            params.offset_filter =
                len.wrapping_sub((params.symbol_delay_detect + params.period2) as u64);
            params.offset_symbol =
                len.wrapping_sub((params.symbol_delay_detect + params.period1) as u64);
            params.offset_detect =
                len.wrapping_sub((params.symbol_delay_detect + params.period4) as u64);

            params.symbol_average_w0 = 1.0 - 5.0 / params.period1 as f32;
            params.symbol_average_w1 = 1.0 - params.symbol_average_w0;

            debug!(
                "{} kbps: period1 {} period2 {} delay {}",
                params.symbols_per_second / 1000,
                params.period1,
                params.period2,
                params.symbol_delay_detect
            );

            self.bitrate_params[rate] = params;
        }

        // default protocol parameters until RATS negotiates new ones
        self.protocol_status = ProtocolStatus {
            max_frame_size: 256,
            startup_guard_time: (stu * 256.0 * 16.0) as u64,
            frame_waiting_time: (stu * 256.0 * 16.0 * f64::from(1 << 4)) as u64,
            frame_guard_time: (stu * 128.0 * 7.0) as u64,
            request_guard_time: (stu * 7000.0) as u64,
        };

        self.frame_status.startup_guard_time = self.protocol_status.startup_guard_time;
        self.frame_status.frame_waiting_time = self.protocol_status.frame_waiting_time;
        self.frame_status.frame_guard_time = self.protocol_status.frame_guard_time;
        self.frame_status.request_guard_time = self.protocol_status.request_guard_time;

        let fs = f64::from(sample_rate);
        decoder.params.power_average_w0 = (1.0 - 1e3 / fs) as f32;
        decoder.params.power_average_w1 = 1.0 - decoder.params.power_average_w0;
        decoder.params.signal_average_w0 = (1.0 - 1e5 / fs) as f32;
        decoder.params.signal_average_w1 = 1.0 - decoder.params.signal_average_w0;
        decoder.params.signal_variance_w0 = (1.0 - 1e5 / fs) as f32;
        decoder.params.signal_variance_w1 = 1.0 - decoder.params.signal_variance_w0;
    }

    /// Search the current sample for a poll start-of-frame at any rate.
    /// Returns true once a Pattern-Z has been latched and the bitrate chosen.
    pub fn detect_modulation(&mut self, decoder: &mut DecoderStatus) -> bool {
        // ignore low power signals
        if decoder.signal.power_average <= decoder.power_level_threshold {
            return false;
        }

        for rate in 0..3 {
            let bitrate = self.bitrate_params[rate];
            let modulation = &mut self.modulation_status[rate];

            let signal_index = bitrate.offset_signal.wrapping_add(decoder.signal_clock);
            let filter_index = bitrate.offset_filter.wrapping_add(decoder.signal_clock);

            let current_data = decoder.sample_at(signal_index);
            let delayed_data = decoder.sample_at(filter_index);

            // moving sum over half a symbol
            modulation.filter_integrate += current_data;
            modulation.filter_integrate -= delayed_data;

            let point1 = (signal_index % bitrate.period1 as u64) as usize;
            let point2 =
                (signal_index.wrapping_add(bitrate.period2 as u64) % bitrate.period1 as u64) as usize;
            let point3 = (signal_index.wrapping_add(bitrate.period1 as u64 - 1)
                % bitrate.period1 as u64) as usize;

            modulation.correlation_data[point1] = modulation.filter_integrate;

            modulation.correlated_s0 =
                modulation.correlation_data[point1] - modulation.correlation_data[point2];
            modulation.correlated_s1 =
                modulation.correlation_data[point2] - modulation.correlation_data[point3];
            modulation.correlated_sd =
                (modulation.correlated_s0 - modulation.correlated_s1).abs() / bitrate.period2 as f32;

            modulation.symbol_average = modulation.symbol_average * bitrate.symbol_average_w0
                + current_data * bitrate.symbol_average_w1;

            // Pattern-Z candidate in the reader field
            if modulation.correlated_sd > decoder.signal.power_average * self.correlation_threshold {
                let deep = (decoder.signal.power_average - current_data) / decoder.signal.power_average;

                if modulation.search_deep_value < deep {
                    modulation.search_deep_value = deep;
                }

                if modulation.correlated_sd > modulation.correlation_peek {
                    modulation.search_pulse_width += 1;
                    modulation.search_peak_time = decoder.signal_clock;
                    modulation.search_end_time = decoder.signal_clock + bitrate.period4 as u64;
                    modulation.correlation_peek = modulation.correlated_sd;
                }
            }

            if decoder.signal_clock == modulation.search_end_time {
                if modulation.search_deep_value >= self.minimum_modulation_deep
                    && modulation.search_deep_value <= self.maximum_modulation_deep
                {
                    // lower threshold to track the rest of the frame
                    modulation.search_threshold =
                        decoder.signal.power_average * self.correlation_threshold;

                    modulation.symbol_start_time =
                        modulation.search_peak_time.saturating_sub(bitrate.period2 as u64);
                    modulation.symbol_end_time =
                        modulation.search_peak_time + bitrate.period2 as u64;

                    self.frame_status.frame_type = Some(FrameType::Poll);
                    self.frame_status.symbol_rate = bitrate.symbols_per_second;
                    self.frame_status.frame_start = modulation
                        .symbol_start_time
                        .saturating_sub(bitrate.symbol_delay_detect as u64);
                    self.frame_status.frame_end = 0;

                    self.symbol_status = SymbolStatus {
                        pattern: Some(Pattern::Z),
                        value: 0,
                        start: modulation.symbol_start_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                        end: modulation.symbol_end_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                    };

                    modulation.reset_search();

                    self.active = Some(rate);

                    return true;
                }

                modulation.reset_search();
            }
        }

        false
    }

    /// Decode the next poll or listen frame from the sample stream.
    pub fn decode_frame(
        &mut self,
        decoder: &mut DecoderStatus,
        buffer: &mut SignalBuffer,
        frames: &mut Vec<RawFrame>,
    ) {
        match self.frame_status.frame_type {
            Some(FrameType::Poll) => {
                self.decode_poll_frame(decoder, buffer, frames);
            }
            Some(FrameType::Listen) => {
                self.decode_listen_frame(decoder, buffer, frames);
            }
            _ => {
                self.reset_modulation();
            }
        }
    }

    fn decode_poll_frame(
        &mut self,
        decoder: &mut DecoderStatus,
        buffer: &mut SignalBuffer,
        frames: &mut Vec<RawFrame>,
    ) -> bool {
        loop {
            let pattern = self.decode_poll_symbol_ask(decoder, buffer);
            let Some(pattern) = pattern else {
                // buffer exhausted, keep state for the next one
                return false;
            };

            // end of request: Pattern-Y after Pattern-Y or Pattern-Z
            let previous = self.stream_status.previous;
            let at_limit = self.stream_status.bytes == self.protocol_status.max_frame_size;
            if (pattern == Pattern::Y
                && matches!(previous, Some(Pattern::Y) | Some(Pattern::Z)))
                || at_limit
            {
                if self.stream_status.bytes > 0 || self.stream_status.bits == 7 {
                    if self.stream_status.bits >= 7 {
                        let data = self.stream_status.data;
                        self.stream_status.buffer.push(data);
                        self.stream_status.bytes += 1;
                    }

                    let rate = self.active.unwrap_or(0);
                    let bitrate = self.bitrate_params[rate];

                    self.frame_status.frame_end = if previous == Some(Pattern::Z) {
                        self.symbol_status.start.saturating_sub(bitrate.period2 as u64)
                    } else {
                        self.symbol_status.start.saturating_sub(bitrate.period1 as u64)
                    };

                    let mut request = RawFrame::new(TechType::NfcA, FrameType::Poll);
                    request.set_frame_rate(self.frame_status.symbol_rate);
                    request.set_sample_rate(decoder.sample_rate);
                    request.set_sample_start(self.frame_status.frame_start);
                    request.set_sample_end(self.frame_status.frame_end);
                    request.set_time_start(decoder.time_of(self.frame_status.frame_start));
                    request.set_time_end(decoder.time_of(self.frame_status.frame_end));

                    if self.stream_status.flags & frame_flags::PARITY_ERROR != 0 {
                        request.set_frame_flags(frame_flags::PARITY_ERROR);
                    }
                    if at_limit {
                        request.set_frame_flags(frame_flags::TRUNCATED);
                    }
                    if self.stream_status.bytes == 1 && self.stream_status.bits == 7 {
                        request.set_frame_flags(frame_flags::SHORT_FRAME);
                    }

                    request.put_slice(&self.stream_status.buffer);

                    // keep frame sync for the expected response
                    let modulation = &mut self.modulation_status[rate];
                    modulation.symbol_start_time = 0;
                    modulation.symbol_end_time = 0;
                    modulation.filter_integrate = 0.0;
                    modulation.phase_integrate = 0.0;

                    self.stream_status = StreamStatus::default();

                    self.process_frame(decoder, &mut request);

                    frames.push(request);

                    return true;
                }

                self.reset_modulation();
                return false;
            }

            if let Some(previous) = previous.filter(|p| p.is_symbol()) {
                let value = u32::from(previous == Pattern::X);

                if self.stream_status.bits < 8 {
                    self.stream_status.data |= (value as u8) << self.stream_status.bits;
                    self.stream_status.bits += 1;
                } else if self.stream_status.bytes < self.protocol_status.max_frame_size {
                    let data = self.stream_status.data;
                    self.stream_status.buffer.push(data);
                    self.stream_status.bytes += 1;
                    if !check_odd_parity(data, value) {
                        self.stream_status.flags |= frame_flags::PARITY_ERROR;
                    }
                    self.stream_status.data = 0;
                    self.stream_status.bits = 0;
                } else {
                    self.reset_modulation();
                    return false;
                }
            }

            self.stream_status.previous = Some(pattern);
        }
    }

    fn decode_listen_frame(
        &mut self,
        decoder: &mut DecoderStatus,
        buffer: &mut SignalBuffer,
        frames: &mut Vec<RawFrame>,
    ) -> bool {
        let rate = match self.active {
            Some(rate) => rate,
            None => {
                self.reset_modulation();
                return false;
            }
        };

        if rate == RateType::R106k as usize {
            // ASK tag response
            if self.frame_status.frame_start == 0 {
                match self.decode_listen_symbol_ask(decoder, buffer) {
                    Some(Pattern::D) => {
                        self.frame_status.frame_start = self.symbol_status.start;
                    }
                    Some(Pattern::NoPattern) => {
                        self.reset_modulation();
                        return false;
                    }
                    _ => return false,
                }
            }

            loop {
                let Some(pattern) = self.decode_listen_symbol_ask(decoder, buffer) else {
                    return false;
                };
                if !pattern.is_symbol() {
                    self.reset_modulation();
                    return false;
                }

                let at_limit = self.stream_status.bytes == self.protocol_status.max_frame_size;
                if pattern == Pattern::F || at_limit {
                    // a valid response has at least one byte or a 4-bit ACK/NAK
                    if self.stream_status.bytes > 0 || self.stream_status.bits == 4 {
                        if self.stream_status.bits == 4 {
                            let data = self.stream_status.data;
                            self.stream_status.buffer.push(data);
                            self.stream_status.bytes += 1;
                        }

                        self.frame_status.frame_end = self.symbol_status.end;

                        let mut response = RawFrame::new(TechType::NfcA, FrameType::Listen);
                        response.set_frame_rate(self.bitrate_params[rate].symbols_per_second);
                        response.set_sample_rate(decoder.sample_rate);
                        response.set_sample_start(self.frame_status.frame_start);
                        response.set_sample_end(self.frame_status.frame_end);
                        response.set_time_start(decoder.time_of(self.frame_status.frame_start));
                        response.set_time_end(decoder.time_of(self.frame_status.frame_end));

                        if self.stream_status.flags & frame_flags::PARITY_ERROR != 0 {
                            response.set_frame_flags(frame_flags::PARITY_ERROR);
                        }
                        if at_limit {
                            response.set_frame_flags(frame_flags::TRUNCATED);
                        }
                        if self.stream_status.bytes == 1 && self.stream_status.bits == 4 {
                            response.set_frame_flags(frame_flags::SHORT_FRAME);
                        }

                        response.put_slice(&self.stream_status.buffer);

                        self.reset_modulation();
                        self.process_frame(decoder, &mut response);
                        frames.push(response);

                        return true;
                    }

                    // lone Pattern-D was a spurious pulse, look for SoF again
                    self.reset_frame_search();
                    return false;
                }

                let value = self.symbol_status.value;
                if self.stream_status.bits < 8 {
                    self.stream_status.data |= (value as u8) << self.stream_status.bits;
                    self.stream_status.bits += 1;
                } else if self.stream_status.bytes < self.protocol_status.max_frame_size {
                    let data = self.stream_status.data;
                    self.stream_status.buffer.push(data);
                    self.stream_status.bytes += 1;
                    if !check_odd_parity(data, value) {
                        self.stream_status.flags |= frame_flags::PARITY_ERROR;
                    }
                    self.stream_status.data = 0;
                    self.stream_status.bits = 0;
                } else {
                    self.reset_modulation();
                    return false;
                }
            }
        } else {
            // BPSK tag response at 212/424 kbps
            if self.frame_status.frame_start == 0 {
                match self.decode_listen_symbol_bpsk(decoder, buffer) {
                    Some(Pattern::M) => {
                        self.frame_status.frame_start = self.symbol_status.start;
                    }
                    Some(Pattern::NoPattern) => {
                        self.reset_modulation();
                        return false;
                    }
                    _ => return false,
                }
            }

            loop {
                let Some(pattern) = self.decode_listen_symbol_bpsk(decoder, buffer) else {
                    return false;
                };
                if !pattern.is_symbol() {
                    self.reset_modulation();
                    return false;
                }

                if pattern == Pattern::O {
                    if self.stream_status.bits == 9 {
                        // trailing byte closes on its parity bit
                        let data = self.stream_status.data;
                        let parity = self.stream_status.parity;
                        self.stream_status.buffer.push(data);
                        self.stream_status.bytes += 1;
                        if !check_odd_parity(data, parity) {
                            self.stream_status.flags |= frame_flags::PARITY_ERROR;
                        }
                    }

                    if self.stream_status.bytes > 0 {
                        self.frame_status.frame_end = self.symbol_status.start;

                        let mut response = RawFrame::new(TechType::NfcA, FrameType::Listen);
                        response.set_frame_rate(self.bitrate_params[rate].symbols_per_second);
                        response.set_sample_rate(decoder.sample_rate);
                        response.set_sample_start(self.frame_status.frame_start);
                        response.set_sample_end(self.frame_status.frame_end);
                        response.set_time_start(decoder.time_of(self.frame_status.frame_start));
                        response.set_time_end(decoder.time_of(self.frame_status.frame_end));

                        if self.stream_status.flags & frame_flags::PARITY_ERROR != 0 {
                            response.set_frame_flags(frame_flags::PARITY_ERROR);
                        }
                        if self.stream_status.bytes == self.protocol_status.max_frame_size {
                            response.set_frame_flags(frame_flags::TRUNCATED);
                        }

                        response.put_slice(&self.stream_status.buffer);

                        self.reset_modulation();
                        self.process_frame(decoder, &mut response);
                        frames.push(response);

                        return true;
                    }

                    self.reset_modulation();
                    return false;
                }

                let value = self.symbol_status.value;
                if self.stream_status.bits < 8 {
                    self.stream_status.data |= (value as u8) << self.stream_status.bits;
                } else if self.stream_status.bits < 9 {
                    self.stream_status.parity = value;
                } else if self.stream_status.bytes < self.protocol_status.max_frame_size {
                    let data = self.stream_status.data;
                    let parity = self.stream_status.parity;
                    self.stream_status.buffer.push(data);
                    self.stream_status.bytes += 1;
                    if !check_odd_parity(data, parity) {
                        self.stream_status.flags |= frame_flags::PARITY_ERROR;
                    }
                    // current symbol seeds the next byte
                    self.stream_status.data = value as u8;
                    self.stream_status.bits = 0;
                } else {
                    self.reset_modulation();
                    return false;
                }

                self.stream_status.bits += 1;
            }
        }
    }

    /// Decode one ASK poll symbol via the half-symbol correlator.
    fn decode_poll_symbol_ask(
        &mut self,
        decoder: &mut DecoderStatus,
        buffer: &mut SignalBuffer,
    ) -> Option<Pattern> {
        let rate = self.active?;
        let bitrate = self.bitrate_params[rate];

        let mut detected = None;

        while decoder.next_sample(buffer) {
            let modulation = &mut self.modulation_status[rate];

            let signal_index = bitrate.offset_signal.wrapping_add(decoder.signal_clock);
            let filter_index = bitrate.offset_filter.wrapping_add(decoder.signal_clock);

            let current_data = decoder.sample_at(signal_index);
            let delayed_data = decoder.sample_at(filter_index);

            modulation.filter_integrate += current_data;
            modulation.filter_integrate -= delayed_data;

            let point1 = (signal_index % bitrate.period1 as u64) as usize;
            let point2 =
                (signal_index.wrapping_add(bitrate.period2 as u64) % bitrate.period1 as u64) as usize;
            let point3 = (signal_index.wrapping_add(bitrate.period1 as u64 - 1)
                % bitrate.period1 as u64) as usize;

            modulation.correlation_data[point1] = modulation.filter_integrate;

            modulation.correlated_s0 =
                modulation.correlation_data[point1] - modulation.correlation_data[point2];
            modulation.correlated_s1 =
                modulation.correlation_data[point2] - modulation.correlation_data[point3];
            modulation.correlated_sd =
                (modulation.correlated_s0 - modulation.correlated_s1).abs() / bitrate.period2 as f32;

            modulation.symbol_average = modulation.symbol_average * bitrate.symbol_average_w0
                + current_data * bitrate.symbol_average_w1;

            // next search window estimated from the previous symbol
            if modulation.search_start_time == 0 {
                modulation.symbol_start_time = modulation.symbol_end_time;
                modulation.symbol_end_time = modulation.symbol_start_time + bitrate.period1 as u64;
                modulation.search_start_time = modulation.symbol_end_time - bitrate.period8 as u64;
                modulation.search_end_time = modulation.symbol_end_time + bitrate.period8 as u64;
                modulation.symbol_corr0 = 0.0;
                modulation.symbol_corr1 = 0.0;
            }

            if decoder.signal_clock >= modulation.search_start_time
                && decoder.signal_clock <= modulation.search_end_time
                && modulation.correlated_sd > modulation.correlation_peek
            {
                modulation.correlation_peek = modulation.correlated_sd;
                modulation.symbol_corr0 = modulation.correlated_s0;
                modulation.symbol_corr1 = modulation.correlated_s1;
                modulation.symbol_end_time = decoder.signal_clock;
            }

            if decoder.signal_clock == modulation.search_end_time {
                // no modulation in the window means Pattern-Y
                if modulation.correlation_peek < modulation.search_threshold {
                    modulation.symbol_end_time =
                        modulation.symbol_start_time + bitrate.period1 as u64;

                    self.symbol_status = SymbolStatus {
                        pattern: Some(Pattern::Y),
                        value: 1,
                        start: modulation.symbol_start_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                        end: modulation.symbol_end_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                    };
                    detected = Some(Pattern::Y);
                    break;
                }

                let pattern = if modulation.symbol_corr0 > modulation.symbol_corr1 {
                    Pattern::Z
                } else {
                    Pattern::X
                };

                self.symbol_status = SymbolStatus {
                    pattern: Some(pattern),
                    value: u32::from(pattern == Pattern::X),
                    start: modulation.symbol_start_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                    end: modulation.symbol_end_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                };
                detected = Some(pattern);
                break;
            }
        }

        if detected.is_some() {
            self.modulation_status[rate].reset_search();
            self.modulation_status[rate].search_pulse_width = 0;
        }

        detected
    }

    /// Decode one Manchester listen symbol from the squared-signal correlator.
    fn decode_listen_symbol_ask(
        &mut self,
        decoder: &mut DecoderStatus,
        buffer: &mut SignalBuffer,
    ) -> Option<Pattern> {
        let rate = self.active?;
        let bitrate = self.bitrate_params[rate];

        let mut detected = None;

        while decoder.next_sample(buffer) {
            let modulation = &mut self.modulation_status[rate];

            let signal_index = bitrate.offset_signal.wrapping_add(decoder.signal_clock);
            let detect_index = bitrate.offset_detect.wrapping_add(decoder.signal_clock);

            let mut current_data = decoder.sample_at(signal_index);

            modulation.symbol_average = modulation.symbol_average * bitrate.symbol_average_w0
                + current_data * bitrate.symbol_average_w1;

            current_data -= modulation.symbol_average;

            modulation.integration_data[(signal_index & BUFFER_MASK) as usize] =
                current_data * current_data;

            // correlate only once the guard time is nearly over
            if decoder.signal_clock
                > self.frame_status.guard_end.saturating_sub(bitrate.period1 as u64)
            {
                let point1 = (signal_index % bitrate.period1 as u64) as usize;
                let point2 = (signal_index.wrapping_add(bitrate.period2 as u64)
                    % bitrate.period1 as u64) as usize;
                let point3 = (signal_index.wrapping_add(bitrate.period1 as u64 - 1)
                    % bitrate.period1 as u64) as usize;

                modulation.filter_integrate +=
                    modulation.integration_data[(signal_index & BUFFER_MASK) as usize];
                modulation.filter_integrate -=
                    modulation.integration_data[(detect_index & BUFFER_MASK) as usize];

                modulation.correlation_data[point1] = modulation.filter_integrate;

                modulation.correlated_s0 =
                    modulation.correlation_data[point1] - modulation.correlation_data[point2];
                modulation.correlated_s1 =
                    modulation.correlation_data[point2] - modulation.correlation_data[point3];
                modulation.correlated_sd =
                    (modulation.correlated_s0 - modulation.correlated_s1).abs();
            }

            if modulation.symbol_end_time == 0 {
                // start-of-frame search
                if decoder.signal_clock > self.frame_status.guard_end {
                    if modulation.correlated_sd > modulation.search_threshold
                        && modulation.correlated_sd > modulation.correlation_peek
                    {
                        modulation.search_pulse_width += 1;
                        modulation.search_peak_time = decoder.signal_clock;
                        modulation.search_end_time = decoder.signal_clock + bitrate.period4 as u64;
                        modulation.correlation_peek = modulation.correlated_sd;
                    }

                    if decoder.signal_clock == modulation.search_end_time {
                        if modulation.search_pulse_width > bitrate.period8 as u64 {
                            modulation.symbol_start_time =
                                modulation.search_peak_time - bitrate.period2 as u64;
                            modulation.symbol_end_time =
                                modulation.search_peak_time + bitrate.period2 as u64;

                            self.symbol_status = SymbolStatus {
                                pattern: Some(Pattern::D),
                                value: 1,
                                start: modulation
                                    .symbol_start_time
                                    .saturating_sub(bitrate.symbol_delay_detect as u64),
                                end: modulation
                                    .symbol_end_time
                                    .saturating_sub(bitrate.symbol_delay_detect as u64),
                            };
                            detected = Some(Pattern::D);
                            break;
                        }

                        modulation.reset_search();
                    }
                }

                // the noise floor at guard end becomes the lower threshold
                if decoder.signal_clock == self.frame_status.guard_end {
                    modulation.search_threshold = decoder.signal.signal_variance;
                }

                if decoder.signal_clock == self.frame_status.waiting_end {
                    detected = Some(Pattern::NoPattern);
                    break;
                }
            } else {
                // response bit stream
                if modulation.search_start_time == 0 {
                    modulation.symbol_start_time = modulation.symbol_end_time;
                    modulation.symbol_end_time =
                        modulation.symbol_start_time + bitrate.period1 as u64;
                    modulation.search_start_time =
                        modulation.symbol_end_time - bitrate.period8 as u64;
                    modulation.search_end_time =
                        modulation.symbol_end_time + bitrate.period8 as u64;
                    modulation.symbol_corr0 = 0.0;
                    modulation.symbol_corr1 = 0.0;
                }

                if decoder.signal_clock >= modulation.search_start_time
                    && decoder.signal_clock <= modulation.search_end_time
                    && modulation.correlated_sd > modulation.correlation_peek
                {
                    modulation.correlation_peek = modulation.correlated_sd;
                    modulation.symbol_corr0 = modulation.correlated_s0;
                    modulation.symbol_corr1 = modulation.correlated_s1;
                    modulation.symbol_end_time = decoder.signal_clock;
                }

                if decoder.signal_clock == modulation.search_end_time {
                    if modulation.correlation_peek > modulation.search_threshold {
                        let start =
                            modulation.symbol_start_time.saturating_sub(bitrate.symbol_delay_detect as u64);
                        let end = modulation.symbol_end_time.saturating_sub(bitrate.symbol_delay_detect as u64);

                        let pattern = if modulation.symbol_corr0 > modulation.symbol_corr1 {
                            Pattern::E
                        } else {
                            Pattern::D
                        };

                        self.symbol_status = SymbolStatus {
                            pattern: Some(pattern),
                            value: u32::from(pattern == Pattern::D),
                            start,
                            end,
                        };
                        detected = Some(pattern);
                        break;
                    }

                    // no modulation at the expected peak ends the frame
                    detected = Some(Pattern::F);
                    break;
                }
            }
        }

        if detected.is_some() {
            if let Some(pattern) = detected.filter(|p| p.is_symbol()) {
                self.symbol_status.pattern = Some(pattern);
            }
            self.modulation_status[rate].reset_search();
            self.modulation_status[rate].search_pulse_width = 0;
        }

        detected
    }

    /// Decode one BPSK listen symbol for 212/424 kbps responses.
    fn decode_listen_symbol_bpsk(
        &mut self,
        decoder: &mut DecoderStatus,
        buffer: &mut SignalBuffer,
    ) -> Option<Pattern> {
        let rate = self.active?;
        let bitrate = self.bitrate_params[rate];

        let mut detected = None;

        while decoder.next_sample(buffer) {
            let modulation = &mut self.modulation_status[rate];

            let signal_index = bitrate.offset_signal.wrapping_add(decoder.signal_clock);
            let symbol_index = bitrate.offset_symbol.wrapping_add(decoder.signal_clock);
            let detect_index = bitrate.offset_detect.wrapping_add(decoder.signal_clock);

            let current_sample = decoder.sample_at(signal_index);
            let delayed_sample = decoder.sample_at(symbol_index);

            modulation.symbol_average = modulation.symbol_average * bitrate.symbol_average_w0
                + current_sample * bitrate.symbol_average_w1;

            // one-symbol-delayed product exposes phase inversions
            let phase = (current_sample - modulation.symbol_average)
                * (delayed_sample - modulation.symbol_average);

            modulation.integration_data[(signal_index & BUFFER_MASK) as usize] = phase * 10.0;

            if decoder.signal_clock
                > self.frame_status.guard_end.saturating_sub(bitrate.period1 as u64)
            {
                modulation.phase_integrate +=
                    modulation.integration_data[(signal_index & BUFFER_MASK) as usize];
                modulation.phase_integrate -=
                    modulation.integration_data[(detect_index & BUFFER_MASK) as usize];
            }

            if modulation.symbol_end_time == 0 {
                // start-of-frame: first sustained positive phase integral
                if modulation.phase_integrate > 0.00025 {
                    modulation.search_peak_time = decoder.signal_clock;
                    modulation.search_end_time = decoder.signal_clock + bitrate.period2 as u64;
                }

                if decoder.signal_clock == modulation.search_end_time
                    && modulation.search_end_time != 0
                {
                    modulation.symbol_start_time = modulation.search_peak_time;
                    modulation.symbol_end_time =
                        modulation.search_peak_time + bitrate.period1 as u64;
                    modulation.symbol_phase = modulation.phase_integrate;
                    modulation.phase_threshold = (modulation.phase_integrate / 3.0).abs();

                    self.symbol_status = SymbolStatus {
                        pattern: Some(Pattern::M),
                        value: 0,
                        start: modulation.symbol_start_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                        end: modulation.symbol_end_time.saturating_sub(bitrate.symbol_delay_detect as u64),
                    };
                    detected = Some(Pattern::M);
                    break;
                }

                if decoder.signal_clock == self.frame_status.waiting_end {
                    detected = Some(Pattern::NoPattern);
                    break;
                }
            } else {
                // zero-cross against the captured phase re-synchronises the symbol clock
                if (modulation.phase_integrate > 0.0 && modulation.symbol_phase < 0.0)
                    || (modulation.phase_integrate < 0.0 && modulation.symbol_phase > 0.0)
                {
                    modulation.search_peak_time = decoder.signal_clock;
                    modulation.search_end_time = decoder.signal_clock + bitrate.period2 as u64;
                    modulation.symbol_start_time = decoder.signal_clock;
                    modulation.symbol_end_time = decoder.signal_clock + bitrate.period1 as u64;
                    modulation.symbol_phase = modulation.phase_integrate;
                }

                if modulation.search_end_time == 0 {
                    modulation.symbol_start_time = modulation.symbol_end_time;
                    modulation.symbol_end_time =
                        modulation.symbol_start_time + bitrate.period1 as u64;
                    modulation.search_end_time =
                        modulation.symbol_start_time + bitrate.period2 as u64;
                } else if decoder.signal_clock == modulation.search_end_time {
                    modulation.symbol_phase = modulation.phase_integrate;

                    self.symbol_status.start =
                        modulation.symbol_start_time.saturating_sub(bitrate.symbol_delay_detect as u64);
                    self.symbol_status.end =
                        modulation.symbol_end_time.saturating_sub(bitrate.symbol_delay_detect as u64);

                    if modulation.phase_integrate > modulation.phase_threshold {
                        // same phase keeps the previous pattern
                        detected = self.symbol_status.pattern;
                        break;
                    }

                    if modulation.phase_integrate < -modulation.phase_threshold {
                        self.symbol_status.value ^= 1;
                        let pattern = if self.symbol_status.pattern == Some(Pattern::M) {
                            Pattern::N
                        } else {
                            Pattern::M
                        };
                        self.symbol_status.pattern = Some(pattern);
                        detected = Some(pattern);
                        break;
                    }

                    detected = Some(Pattern::O);
                    break;
                }
            }
        }

        if detected.is_some() {
            if let Some(pattern) = detected.filter(|p| p.is_symbol()) {
                self.symbol_status.pattern = Some(pattern);
            }
            self.modulation_status[rate].reset_search();
            self.modulation_status[rate].search_pulse_width = 0;
        }

        detected
    }

    fn reset_frame_search(&mut self) {
        if let Some(rate) = self.active {
            let modulation = &mut self.modulation_status[rate];
            modulation.symbol_end_time = 0;
            modulation.search_peak_time = 0;
            modulation.search_end_time = 0;
            modulation.correlation_peek = 0.0;
        }
        self.frame_status.frame_start = 0;
    }

    /// Drop back into modulation search across all rates.
    pub fn reset_modulation(&mut self) {
        for modulation in &mut self.modulation_status {
            modulation.reset_search();
            modulation.symbol_average = 0.0;
            modulation.symbol_phase = f32::NAN;
        }

        self.stream_status = StreamStatus::default();
        self.symbol_status = SymbolStatus::default();

        self.frame_status.frame_type = None;
        self.frame_status.frame_start = 0;
        self.frame_status.frame_end = 0;

        self.active = None;
    }

    /// Classify an assembled frame and update protocol timing state.
    pub fn process_frame(&mut self, decoder: &DecoderStatus, frame: &mut RawFrame) {
        if frame.is_empty() {
            return;
        }

        if frame.is_poll_frame() {
            self.frame_status.frame_waiting_time = self.protocol_status.frame_waiting_time;
        }

        let handled = self.process_reqa(decoder, frame)
            || self.process_hlta(decoder, frame)
            || (self.chained_flags & frame_flags::ENCRYPTED == 0
                && (self.process_seln(decoder, frame)
                    || self.process_rats(decoder, frame)
                    || self.process_ppsr(frame)
                    || self.process_auth(frame)
                    || self.process_iblock(frame)
                    || self.process_rblock(frame)
                    || self.process_sblock(frame)));

        if !handled {
            if self.chained_flags & frame_flags::ENCRYPTED != 0 {
                // anything under a Mifare session stays opaque
                frame.set_frame_phase(FramePhase::Application);
            } else {
                self.process_other(frame);
            }
        }

        frame.set_frame_flags(self.chained_flags);

        if frame.is_poll_frame() {
            if let Some(rate) = self.active {
                let delay = self.bitrate_params[rate].symbol_delay_detect as u64;

                // response window TR0min .. FWT after the request
                self.frame_status.guard_end =
                    self.frame_status.frame_end + self.frame_status.frame_guard_time + delay;
                self.frame_status.waiting_end =
                    self.frame_status.frame_end + self.frame_status.frame_waiting_time + delay;
                self.frame_status.frame_type = Some(FrameType::Listen);
            }
        } else {
            self.frame_status.frame_type = None;
            self.frame_status.last_command = 0;
        }

        self.last_frame_end = self.frame_status.frame_end;
        self.frame_status.frame_start = 0;
        self.frame_status.frame_end = 0;
    }

    fn process_reqa(&mut self, decoder: &DecoderStatus, frame: &mut RawFrame) -> bool {
        let stu = decoder.params.sample_time_unit;

        if frame.is_poll_frame() {
            if frame.len() == 1
                && (frame.byte(0) == command::REQA || frame.byte(0) == command::WUPA)
            {
                frame.set_frame_phase(FramePhase::Selection);

                self.frame_status.last_command = frame.byte(0);

                // wakeup resets everything negotiated so far
                self.protocol_status.max_frame_size = 256;
                self.protocol_status.frame_guard_time = (stu * 128.0 * 7.0) as u64;
                self.protocol_status.frame_waiting_time =
                    (stu * 256.0 * 16.0 * f64::from(1 << 4)) as u64;

                // response must start at 128*n, n = 9; search n = 7..18
                self.frame_status.frame_guard_time = (stu * 128.0 * 7.0) as u64;
                self.frame_status.frame_waiting_time = (stu * 128.0 * 18.0) as u64;

                self.chained_flags = 0;

                return true;
            }
        }

        if frame.is_listen_frame()
            && (self.frame_status.last_command == command::REQA
                || self.frame_status.last_command == command::WUPA)
        {
            frame.set_frame_phase(FramePhase::Selection);
            return true;
        }

        false
    }

    fn process_hlta(&mut self, decoder: &DecoderStatus, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() && frame.len() == 4 && frame.byte(0) == command::HLTA {
            frame.set_frame_phase(FramePhase::Selection);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }

            self.frame_status.last_command = frame.byte(0);

            let stu = decoder.params.sample_time_unit;
            self.protocol_status.max_frame_size = 256;
            self.protocol_status.frame_guard_time = (stu * 128.0 * 7.0) as u64;
            self.protocol_status.frame_waiting_time =
                (stu * 256.0 * 16.0 * f64::from(1 << 4)) as u64;

            self.chained_flags = 0;

            self.reset_modulation();

            return true;
        }

        false
    }

    fn process_seln(&mut self, decoder: &DecoderStatus, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() {
            if matches!(frame.byte(0), command::SEL1 | command::SEL2 | command::SEL3) {
                frame.set_frame_phase(FramePhase::Selection);

                self.frame_status.last_command = frame.byte(0);

                // selection uses the same response timing as REQ-A
                let stu = decoder.params.sample_time_unit;
                self.frame_status.frame_guard_time = (stu * 128.0 * 7.0) as u64;
                self.frame_status.frame_waiting_time = (stu * 128.0 * 18.0) as u64;

                return true;
            }
        }

        if frame.is_listen_frame()
            && matches!(
                self.frame_status.last_command,
                command::SEL1 | command::SEL2 | command::SEL3
            )
        {
            frame.set_frame_phase(FramePhase::Selection);
            return true;
        }

        false
    }

    fn process_rats(&mut self, decoder: &DecoderStatus, frame: &mut RawFrame) -> bool {
        let stu = decoder.params.sample_time_unit;

        if frame.is_poll_frame() && frame.byte(0) == command::RATS && frame.len() >= 2 {
            let fsdi = ((frame.byte(1) >> 4) & 0x0F) as usize;

            self.frame_status.last_command = frame.byte(0);

            self.protocol_status.max_frame_size = TABLE_FDS[fsdi];

            // ATS activation window, 65536/fc per ISO/IEC 14443-4
            self.frame_status.frame_waiting_time = (stu * 65536.0) as u64;

            info!(
                "RATS: max frame size {} bytes",
                self.protocol_status.max_frame_size
            );

            frame.set_frame_phase(FramePhase::Selection);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }

            return true;
        }

        if frame.is_listen_frame() && self.frame_status.last_command == command::RATS {
            let data = frame.data().to_vec();
            let mut offset = 0;
            let tl = data.first().copied().unwrap_or(0);
            offset += 1;

            if tl > 0 && data.len() > offset {
                let t0 = data[offset];
                offset += 1;

                if t0 & 0x10 != 0 {
                    // TA carries rate capabilities, not needed for timing
                    offset += 1;
                }

                if t0 & 0x20 != 0 && data.len() > offset {
                    let tb = data[offset];

                    let mut sfgi = tb & 0x0F;
                    let mut fwi = (tb >> 4) & 0x0F;

                    // reserved encodings map to the defaults
                    if sfgi == 15 {
                        sfgi = 0;
                    }
                    if fwi == 15 {
                        fwi = 4;
                    }

                    self.protocol_status.startup_guard_time =
                        (stu * 256.0 * 16.0 * f64::from(1u32 << sfgi)) as u64;
                    self.protocol_status.frame_waiting_time =
                        (stu * 256.0 * 16.0 * f64::from(1u32 << fwi)) as u64;
                } else {
                    self.protocol_status.startup_guard_time = (stu * 256.0 * 16.0) as u64;
                    self.protocol_status.frame_waiting_time =
                        (stu * 256.0 * 16.0 * f64::from(1 << 4)) as u64;
                }
            }

            frame.set_frame_phase(FramePhase::Selection);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }

            return true;
        }

        false
    }

    fn process_ppsr(&mut self, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() && frame.byte(0) & 0xF0 == command::PPS {
            self.frame_status.last_command = frame.byte(0) & 0xF0;
            self.frame_status.frame_waiting_time = self.protocol_status.frame_waiting_time;

            frame.set_frame_phase(FramePhase::Selection);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        if frame.is_listen_frame() && self.frame_status.last_command == command::PPS {
            frame.set_frame_phase(FramePhase::Selection);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        false
    }

    fn process_auth(&mut self, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() {
            if frame.byte(0) == command::AUTH1 || frame.byte(0) == command::AUTH2 {
                self.frame_status.last_command = frame.byte(0);

                frame.set_frame_phase(FramePhase::Auth);
                if !check_frame_crc(frame) {
                    frame.set_frame_flags(frame_flags::CRC_ERROR);
                }
                return true;
            }
        }

        if frame.is_listen_frame()
            && (self.frame_status.last_command == command::AUTH1
                || self.frame_status.last_command == command::AUTH2)
        {
            // the crypto handshake is live from here on
            self.chained_flags = frame_flags::ENCRYPTED;

            frame.set_frame_phase(FramePhase::Auth);
            return true;
        }

        false
    }

    fn process_iblock(&mut self, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() && frame.byte(0) & 0xE2 == command::IBLOCK {
            self.frame_status.last_command = frame.byte(0) & 0xE2;
            frame.set_frame_phase(FramePhase::Application);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        if frame.is_listen_frame() && self.frame_status.last_command == command::IBLOCK {
            frame.set_frame_phase(FramePhase::Application);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        false
    }

    fn process_rblock(&mut self, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() && frame.byte(0) & 0xE6 == command::RBLOCK {
            self.frame_status.last_command = frame.byte(0) & 0xE6;
            frame.set_frame_phase(FramePhase::Application);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        if frame.is_listen_frame() && self.frame_status.last_command == command::RBLOCK {
            frame.set_frame_phase(FramePhase::Application);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        false
    }

    fn process_sblock(&mut self, frame: &mut RawFrame) -> bool {
        if frame.is_poll_frame() && frame.byte(0) & 0xC7 == command::SBLOCK {
            self.frame_status.last_command = frame.byte(0) & 0xC7;
            frame.set_frame_phase(FramePhase::Application);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        if frame.is_listen_frame() && self.frame_status.last_command == command::SBLOCK {
            frame.set_frame_phase(FramePhase::Application);
            if !check_frame_crc(frame) {
                frame.set_frame_flags(frame_flags::CRC_ERROR);
            }
            return true;
        }

        false
    }

    fn process_other(&mut self, frame: &mut RawFrame) {
        frame.set_frame_phase(FramePhase::Application);
        if !check_frame_crc(frame) {
            frame.set_frame_flags(frame_flags::CRC_ERROR);
        }
    }

    /// Detect field edges and emit CarrierOn / CarrierOff frames.
    pub fn detect_carrier(&mut self, decoder: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let signal = &mut decoder.signal;
        let edge = (signal.signal_average - signal.power_average).abs();

        if signal.signal_average > edge && signal.power_average > decoder.power_level_threshold {
            if signal.carrier_on == 0 {
                signal.carrier_on = decoder.signal_clock;

                if signal.carrier_off != 0 {
                    let mut silence = RawFrame::new(TechType::None, FrameType::CarrierOff);
                    silence.set_frame_phase(FramePhase::Carrier);
                    silence.set_sample_rate(decoder.sample_rate);
                    silence.set_sample_start(signal.carrier_off);
                    silence.set_sample_end(signal.carrier_on);
                    silence.set_time_start(
                        signal.carrier_off as f64 / f64::from(decoder.sample_rate)
                            + decoder.stream_time,
                    );
                    silence.set_time_end(
                        signal.carrier_on as f64 / f64::from(decoder.sample_rate)
                            + decoder.stream_time,
                    );
                    frames.push(silence);
                }

                signal.carrier_off = 0;
            }
        } else if (signal.signal_average < edge
            || signal.power_average < decoder.power_level_threshold)
            && signal.carrier_off == 0
        {
            signal.carrier_off = decoder.signal_clock;

            if signal.carrier_on != 0 {
                let mut carrier = RawFrame::new(TechType::None, FrameType::CarrierOn);
                carrier.set_frame_phase(FramePhase::Carrier);
                carrier.set_sample_rate(decoder.sample_rate);
                carrier.set_sample_start(signal.carrier_on);
                carrier.set_sample_end(signal.carrier_off);
                carrier.set_time_start(
                    signal.carrier_on as f64 / f64::from(decoder.sample_rate) + decoder.stream_time,
                );
                carrier.set_time_end(
                    signal.carrier_off as f64 / f64::from(decoder.sample_rate)
                        + decoder.stream_time,
                );
                frames.push(carrier);
            }

            signal.carrier_on = 0;
        }
    }

    /// Close any open carrier interval at end of stream.
    pub fn flush_carrier(&mut self, decoder: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let signal = &mut decoder.signal;

        if signal.carrier_on != 0 && decoder.signal_clock > signal.carrier_on {
            let mut carrier = RawFrame::new(TechType::None, FrameType::CarrierOn);
            carrier.set_frame_phase(FramePhase::Carrier);
            carrier.set_sample_rate(decoder.sample_rate);
            carrier.set_sample_start(signal.carrier_on);
            carrier.set_sample_end(decoder.signal_clock);
            carrier.set_time_start(
                signal.carrier_on as f64 / f64::from(decoder.sample_rate) + decoder.stream_time,
            );
            carrier.set_time_end(
                decoder.signal_clock as f64 / f64::from(decoder.sample_rate) + decoder.stream_time,
            );
            frames.push(carrier);
            signal.carrier_on = 0;
        } else if signal.carrier_off != 0 && decoder.signal_clock > signal.carrier_off {
            let mut silence = RawFrame::new(TechType::None, FrameType::CarrierOff);
            silence.set_frame_phase(FramePhase::Carrier);
            silence.set_sample_rate(decoder.sample_rate);
            silence.set_sample_start(signal.carrier_off);
            silence.set_sample_end(decoder.signal_clock);
            silence.set_time_start(
                signal.carrier_off as f64 / f64::from(decoder.sample_rate) + decoder.stream_time,
            );
            silence.set_time_end(
                decoder.signal_clock as f64 / f64::from(decoder.sample_rate) + decoder.stream_time,
            );
            frames.push(silence);
            signal.carrier_off = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn protocol_status(&self) -> &ProtocolStatus {
        &self.protocol_status
    }

    #[cfg(test)]
    pub(crate) fn chained_flags(&self) -> u32 {
        self.chained_flags
    }

    #[cfg(test)]
    pub(crate) fn force_poll_context(&mut self) {
        self.active = Some(0);
        self.frame_status.frame_type = Some(FrameType::Poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder_at(sample_rate: u32) -> (NfcA, DecoderStatus) {
        let mut decoder = DecoderStatus::default();
        let mut nfca = NfcA::new();
        nfca.configure(&mut decoder, sample_rate);
        (nfca, decoder)
    }

    fn poll(nfca: &mut NfcA, decoder: &DecoderStatus, bytes: &[u8]) -> RawFrame {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Poll);
        frame.put_slice(bytes);
        nfca.force_poll_context();
        nfca.process_frame(decoder, &mut frame);
        frame
    }

    fn listen(nfca: &mut NfcA, decoder: &DecoderStatus, bytes: &[u8]) -> RawFrame {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Listen);
        frame.put_slice(bytes);
        nfca.process_frame(decoder, &mut frame);
        frame
    }

    #[test]
    fn bitrate_parameters_at_10msps() {
        let (nfca, _decoder) = decoder_at(10_000_000);
        let p106 = nfca.bitrate_params[0];
        assert_eq!(p106.symbols_per_second, 105_937);
        assert_eq!(p106.period1, 94);
        assert_eq!(p106.period2, 47);
        assert_eq!(p106.symbol_delay_detect, 0);

        let p212 = nfca.bitrate_params[1];
        assert_eq!(p212.period1, 47);
        assert_eq!(p212.symbol_delay_detect, 94);

        let p424 = nfca.bitrate_params[2];
        assert_eq!(p424.period1, 24);
        assert_eq!(p424.symbol_delay_detect, 141);
    }

    #[test]
    fn reqa_resets_protocol_state() {
        let (mut nfca, decoder) = decoder_at(10_000_000);
        nfca.protocol_status.max_frame_size = 64;

        let frame = poll(&mut nfca, &decoder, &[0x26]);

        assert_eq!(frame.frame_phase(), FramePhase::Selection);
        assert_eq!(nfca.protocol_status.max_frame_size, 256);
        assert_eq!(nfca.frame_status.last_command, 0x26);
        // guard 128*7/fc, waiting 128*18/fc at this rate
        assert_eq!(nfca.frame_status.frame_guard_time, 660);
        assert_eq!(nfca.frame_status.frame_waiting_time, 1699);
    }

    #[test]
    fn rats_updates_max_frame_size_and_fwt() {
        let (mut nfca, decoder) = decoder_at(10_000_000);

        // RATS with FSDI=8 (FSD 256), CID 0
        let frame = poll(&mut nfca, &decoder, &[0xE0, 0x80, 0x31, 0x73]);
        assert_eq!(frame.frame_phase(), FramePhase::Selection);
        assert!(!frame.has_frame_flags(frame_flags::CRC_ERROR));
        assert_eq!(nfca.protocol_status.max_frame_size, 256);
        // activation FWT is 65536/fc
        assert_eq!(nfca.frame_status.frame_waiting_time, 48_330);

        // ATS 05 78 80 70 02 + CRC: TL=5, T0=78 (TA+TB, FSCI 8), TB=70 (FWI 7, SFGI 0)
        let mut ats = vec![0x05, 0x78, 0x80, 0x70, 0x02];
        let crc = crate::crc::crc_a(&ats);
        ats.extend_from_slice(&crc.to_le_bytes());
        let response = listen(&mut nfca, &decoder, &ats);

        assert_eq!(response.frame_phase(), FramePhase::Selection);
        assert!(!response.has_frame_flags(frame_flags::CRC_ERROR));

        let stu = decoder.params.sample_time_unit;
        assert_eq!(
            nfca.protocol_status().startup_guard_time,
            (stu * 256.0 * 16.0) as u64
        );
        assert_eq!(
            nfca.protocol_status().frame_waiting_time,
            (stu * 256.0 * 16.0 * 128.0) as u64
        );
    }

    #[test]
    fn rats_reserved_encodings_substitute_defaults() {
        let (mut nfca, decoder) = decoder_at(10_000_000);

        poll(&mut nfca, &decoder, &[0xE0, 0x80, 0x31, 0x73]);

        // TB = 0xFF: FWI 15 -> 4, SFGI 15 -> 0
        let mut ats = vec![0x03, 0x20, 0xFF];
        let crc = crate::crc::crc_a(&ats);
        ats.extend_from_slice(&crc.to_le_bytes());
        listen(&mut nfca, &decoder, &ats);

        let stu = decoder.params.sample_time_unit;
        assert_eq!(
            nfca.protocol_status().startup_guard_time,
            (stu * 256.0 * 16.0) as u64
        );
        assert_eq!(
            nfca.protocol_status().frame_waiting_time,
            (stu * 256.0 * 16.0 * 16.0) as u64
        );
    }

    #[test]
    fn auth_handshake_latches_encrypted_state() {
        let (mut nfca, decoder) = decoder_at(10_000_000);

        // AUTH key A block 0
        let mut auth = vec![0x60, 0x00];
        let crc = crate::crc::crc_a(&auth);
        auth.extend_from_slice(&crc.to_le_bytes());
        let request = poll(&mut nfca, &decoder, &auth);
        assert_eq!(request.frame_phase(), FramePhase::Auth);
        assert_eq!(nfca.chained_flags(), 0);

        // tag nonce
        let nonce = listen(&mut nfca, &decoder, &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(nonce.frame_phase(), FramePhase::Auth);
        assert_eq!(nfca.chained_flags(), frame_flags::ENCRYPTED);

        // everything after the handshake is an opaque application frame
        let encrypted = poll(&mut nfca, &decoder, &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(encrypted.frame_phase(), FramePhase::Application);
        assert!(encrypted.has_frame_flags(frame_flags::ENCRYPTED));

        // until the next sense frame clears the chain
        let reqa = poll(&mut nfca, &decoder, &[0x26]);
        assert!(!reqa.has_frame_flags(frame_flags::ENCRYPTED));
        assert_eq!(nfca.chained_flags(), 0);
    }

    #[test]
    fn fsdi_reserved_range_yields_zero_frame_size() {
        let (mut nfca, decoder) = decoder_at(10_000_000);

        // FSDI 9..14 are RFU and map to zero
        let mut rats = vec![0xE0, 0x90];
        let crc = crate::crc::crc_a(&rats);
        rats.extend_from_slice(&crc.to_le_bytes());
        poll(&mut nfca, &decoder, &rats);
        assert_eq!(nfca.protocol_status().max_frame_size, 0);
    }

    #[test]
    fn block_classification() {
        let (mut nfca, decoder) = decoder_at(10_000_000);

        let mut iblock = vec![0x02, 0xCA, 0xFE];
        let crc = crate::crc::crc_a(&iblock);
        iblock.extend_from_slice(&crc.to_le_bytes());
        let frame = poll(&mut nfca, &decoder, &iblock);
        assert_eq!(frame.frame_phase(), FramePhase::Application);
        assert!(!frame.has_frame_flags(frame_flags::CRC_ERROR));

        let mut rblock = vec![0xA2];
        let crc = crate::crc::crc_a(&rblock);
        rblock.extend_from_slice(&crc.to_le_bytes());
        let frame = poll(&mut nfca, &decoder, &rblock);
        assert_eq!(frame.frame_phase(), FramePhase::Application);
        assert_eq!(nfca.frame_status.last_command, 0xA2);

        let mut sblock = vec![0xC2];
        let crc = crate::crc::crc_a(&sblock);
        sblock.extend_from_slice(&crc.to_le_bytes());
        let frame = poll(&mut nfca, &decoder, &sblock);
        assert_eq!(frame.frame_phase(), FramePhase::Application);
        assert_eq!(nfca.frame_status.last_command, 0xC2);
    }

    #[test]
    fn crc_failure_is_flagged_not_fatal() {
        let (mut nfca, decoder) = decoder_at(10_000_000);
        let frame = poll(&mut nfca, &decoder, &[0x50, 0x00, 0x00, 0x00]);
        assert!(frame.has_frame_flags(frame_flags::CRC_ERROR));
        assert_eq!(frame.frame_phase(), FramePhase::Selection);
    }
}

//! Stream-level NFC decoder: feeds magnitude (or IQ) buffers through carrier
//! detection and the per-technology demodulators, yielding decoded frames.

use crate::buffer::SignalBuffer;
use crate::frame::RawFrame;
use crate::nfca::{DecoderStatus, NfcA};
use log::info;

/// Per-technology detection thresholds, adjustable through configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TechConfig {
    pub enabled: bool,
    pub correlation_threshold: f32,
    pub minimum_modulation_deep: f32,
    pub maximum_modulation_deep: f32,
}

impl Default for TechConfig {
    fn default() -> Self {
        TechConfig {
            enabled: true,
            correlation_threshold: 0.75,
            minimum_modulation_deep: 0.85,
            maximum_modulation_deep: 1.00,
        }
    }
}

/// NFC frame decoder for one sample stream.
///
/// Call [`set_sample_rate`](NfcDecoder::set_sample_rate) before the first
/// buffer, then push buffers through [`next_frames`](NfcDecoder::next_frames).
/// An invalid buffer marks end of stream: partial frames are discarded, any
/// open carrier interval is closed and the decoder returns to idle.
pub struct NfcDecoder {
    status: DecoderStatus,
    nfca: NfcA,
    nfca_config: TechConfig,
    nfcb_config: TechConfig,
    nfcf_config: TechConfig,
    nfcv_config: TechConfig,
    sample_rate: u32,
    debug_enabled: bool,
    configured: bool,
}

impl NfcDecoder {
    pub fn new() -> Self {
        NfcDecoder {
            status: DecoderStatus::default(),
            nfca: NfcA::new(),
            nfca_config: TechConfig::default(),
            nfcb_config: TechConfig { enabled: false, ..TechConfig::default() },
            nfcf_config: TechConfig { enabled: false, ..TechConfig::default() },
            nfcv_config: TechConfig { enabled: false, ..TechConfig::default() },
            sample_rate: 0,
            debug_enabled: false,
            configured: false,
        }
    }

    /// Reset all per-stream state, keeping the configuration.
    pub fn initialize(&mut self) {
        if self.sample_rate > 0 {
            self.status = DecoderStatus {
                power_level_threshold: self.status.power_level_threshold,
                stream_time: self.status.stream_time,
                ..DecoderStatus::default()
            };
            self.nfca.configure(&mut self.status, self.sample_rate);
            self.apply_thresholds();
            self.configured = true;
        }
    }

    pub fn cleanup(&mut self) {
        self.nfca.reset_modulation();
        self.configured = false;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Changing the sample rate re-derives all timing constants, so it must
    /// be applied after every other configuration value.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if self.sample_rate != sample_rate {
            self.sample_rate = sample_rate;
            info!("decoder sample rate {sample_rate} sps");
            self.initialize();
        }
    }

    pub fn stream_time(&self) -> f64 {
        self.status.stream_time
    }

    pub fn set_stream_time(&mut self, time: f64) {
        self.status.stream_time = time;
    }

    pub fn power_level_threshold(&self) -> f32 {
        self.status.power_level_threshold
    }

    pub fn set_power_level_threshold(&mut self, threshold: f32) {
        self.status.power_level_threshold = threshold;
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    pub fn set_debug_enabled(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    pub fn nfca_config(&self) -> TechConfig {
        self.nfca_config
    }

    pub fn nfcb_config(&self) -> TechConfig {
        self.nfcb_config
    }

    pub fn nfcf_config(&self) -> TechConfig {
        self.nfcf_config
    }

    pub fn nfcv_config(&self) -> TechConfig {
        self.nfcv_config
    }

    pub fn set_nfca_config(&mut self, config: TechConfig) {
        self.nfca_config = config;
        self.apply_thresholds();
    }

    pub fn set_nfcb_config(&mut self, config: TechConfig) {
        self.nfcb_config = config;
    }

    pub fn set_nfcf_config(&mut self, config: TechConfig) {
        self.nfcf_config = config;
    }

    pub fn set_nfcv_config(&mut self, config: TechConfig) {
        self.nfcv_config = config;
    }

    fn apply_thresholds(&mut self) {
        self.nfca.correlation_threshold = self.nfca_config.correlation_threshold;
        self.nfca.minimum_modulation_deep = self.nfca_config.minimum_modulation_deep;
        self.nfca.maximum_modulation_deep = self.nfca_config.maximum_modulation_deep;
    }

    /// Decode every frame available in the buffer. An invalid buffer flushes
    /// the stream and returns any closing carrier frame.
    pub fn next_frames(&mut self, buffer: &mut SignalBuffer) -> Vec<RawFrame> {
        let mut frames = Vec::new();

        if !buffer.is_valid() {
            self.nfca.flush_carrier(&mut self.status, &mut frames);
            self.nfca.reset_modulation();
            return frames;
        }

        if !self.configured {
            return frames;
        }

        while buffer.remaining() > 0 {
            if !self.nfca.is_active() {
                // search for start of frame, tracking field on/off as we go
                while self.status.next_sample(buffer) {
                    self.nfca.detect_carrier(&mut self.status, &mut frames);

                    if self.nfca_config.enabled && self.nfca.detect_modulation(&mut self.status) {
                        break;
                    }
                }
            } else {
                self.nfca.decode_frame(&mut self.status, buffer, &mut frames);
            }
        }

        frames
    }
}

impl Default for NfcDecoder {
    fn default() -> Self {
        NfcDecoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SignalType;
    use crate::frame::{frame_flags, FrameType, TechType};

    const FS: u32 = 10_000_000;
    const CARRIER: f32 = 0.5;
    /// Full bit period of 106 kbps at 10 Msps
    const P1: usize = 94;
    const P2: usize = 47;
    /// Reader pause width in samples (~2.8 us)
    const PAUSE: usize = 28;

    fn buffer_from(samples: &[f32]) -> SignalBuffer {
        let mut buffer = SignalBuffer::new(samples.len(), 1, 1, FS, 0, 0, SignalType::RawReal);
        buffer.put_slice(samples);
        buffer.flip();
        buffer
    }

    /// Modified Miller poll sequence: `Z` pauses at the bit start, `X` pauses
    /// mid-bit, `Y` leaves the carrier untouched.
    fn apply_poll_patterns(samples: &mut [f32], start: usize, patterns: &[char]) {
        for (k, pattern) in patterns.iter().enumerate() {
            let begin = match pattern {
                'Z' => start + k * P1,
                'X' => start + k * P1 + P2,
                _ => continue,
            };
            for sample in samples.iter_mut().skip(begin).take(PAUSE) {
                *sample = 0.0;
            }
        }
    }

    /// Manchester listen sequence: `D` modulates the first half bit, `E` the
    /// second, as an 847 kHz square subcarrier over the carrier level.
    fn apply_listen_patterns(samples: &mut [f32], start: usize, patterns: &[char]) {
        for (k, pattern) in patterns.iter().enumerate() {
            let begin = match pattern {
                'D' => start + k * P1,
                'E' => start + k * P1 + P2,
                _ => continue,
            };
            for i in 0..P2 {
                let sub = if (i / 6) % 2 == 0 { 0.1 } else { -0.1 };
                samples[begin + i] = CARRIER + sub;
            }
        }
    }

    fn decoder() -> NfcDecoder {
        let mut decoder = NfcDecoder::new();
        decoder.set_sample_rate(FS);
        decoder.initialize();
        decoder
    }

    #[test]
    fn carrier_only_stream_emits_edge_frames() {
        // 10 ms of silence then 10 ms of carrier
        let mut samples = vec![0.0f32; 200_000];
        for sample in samples.iter_mut().skip(100_000) {
            *sample = CARRIER;
        }

        let mut decoder = decoder();
        let mut frames = decoder.next_frames(&mut buffer_from(&samples));
        frames.extend(decoder.next_frames(&mut SignalBuffer::eof(SignalType::RawReal)));

        assert_eq!(frames.len(), 2);

        let off = &frames[0];
        assert_eq!(off.frame_type(), FrameType::CarrierOff);
        assert!(off.sample_end() >= 100_000 && off.sample_end() < 102_000);

        let on = &frames[1];
        assert_eq!(on.frame_type(), FrameType::CarrierOn);
        assert_eq!(on.sample_start(), off.sample_end());
        assert_eq!(on.sample_end(), 200_000);
    }

    #[test]
    fn empty_buffer_produces_nothing() {
        let mut decoder = decoder();
        let mut empty = SignalBuffer::new(0, 1, 1, FS, 0, 0, SignalType::RawReal);
        empty.flip();
        assert!(decoder.next_frames(&mut empty).is_empty());
    }

    #[test]
    fn reqa_exchange_decodes_poll_and_listen() {
        let mut samples = vec![CARRIER; 120_000];

        // settle the power average before the frame
        let poll_start = 60_000;

        // REQA 0x26 LSB first: 0,1,1,0,0,1,0 -> SoF Z then ZXXYZXY, a Z for
        // the end-of-communication zero and a closing Y
        apply_poll_patterns(
            &mut samples,
            poll_start,
            &['Z', 'Z', 'X', 'X', 'Y', 'Z', 'X', 'Y', 'Z', 'Y'],
        );

        // ATQA 04 00 after the frame delay: SoF D, then each byte LSB first
        // with its odd-parity bit
        let listen_start = poll_start + 10 * P1 + 1000;
        apply_listen_patterns(
            &mut samples,
            listen_start,
            &[
                'D', // SoF
                'E', 'E', 'D', 'E', 'E', 'E', 'E', 'E', 'E', // 0x04, parity 0
                'E', 'E', 'E', 'E', 'E', 'E', 'E', 'E', 'D', // 0x00, parity 1
            ],
        );

        let mut decoder = decoder();
        let mut frames = decoder.next_frames(&mut buffer_from(&samples));
        frames.extend(decoder.next_frames(&mut SignalBuffer::eof(SignalType::RawReal)));

        let poll: Vec<_> = frames.iter().filter(|f| f.frame_type() == FrameType::Poll).collect();
        assert_eq!(poll.len(), 1, "frames: {frames:?}");
        assert_eq!(poll[0].tech_type(), TechType::NfcA);
        assert_eq!(poll[0].data(), &[0x26]);
        assert!(poll[0].has_frame_flags(frame_flags::SHORT_FRAME));
        assert!(!poll[0].has_frame_flags(frame_flags::PARITY_ERROR));
        assert!(poll[0].sample_end() > poll[0].sample_start());

        let listen: Vec<_> =
            frames.iter().filter(|f| f.frame_type() == FrameType::Listen).collect();
        assert_eq!(listen.len(), 1, "frames: {frames:?}");
        assert_eq!(listen[0].data(), &[0x04, 0x00]);
        assert!(!listen[0].has_frame_flags(frame_flags::PARITY_ERROR));
        assert!(listen[0].sample_start() > poll[0].sample_end());
    }

    #[test]
    fn frame_times_follow_stream_time() {
        let mut samples = vec![CARRIER; 80_000];
        apply_poll_patterns(
            &mut samples,
            60_000,
            &['Z', 'Z', 'X', 'X', 'Y', 'Z', 'X', 'Y', 'Z', 'Y'],
        );

        let mut decoder = decoder();
        decoder.set_stream_time(2.0);
        let frames = decoder.next_frames(&mut buffer_from(&samples));

        let poll = frames
            .iter()
            .find(|f| f.frame_type() == FrameType::Poll)
            .expect("poll frame");
        let expected = poll.sample_end() as f64 / f64::from(FS) + 2.0;
        assert!((poll.time_end() - expected).abs() < 1e-9);
        assert!(poll.frame_rate() > 0);
    }
}

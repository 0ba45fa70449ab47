/// Technology that produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TechType {
    None = 0,
    NfcA = 1,
    NfcB = 2,
    NfcF = 3,
    NfcV = 4,
    Iso7816 = 5,
}

impl TechType {
    pub fn from_code(code: u32) -> Option<TechType> {
        match code {
            0 => Some(TechType::None),
            1 => Some(TechType::NfcA),
            2 => Some(TechType::NfcB),
            3 => Some(TechType::NfcF),
            4 => Some(TechType::NfcV),
            5 => Some(TechType::Iso7816),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TechType::None => "None",
            TechType::NfcA => "NfcA",
            TechType::NfcB => "NfcB",
            TechType::NfcF => "NfcF",
            TechType::NfcV => "NfcV",
            TechType::Iso7816 => "Iso7816",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Field switched off, no carrier present
    CarrierOff = 1,
    /// Unmodulated carrier present
    CarrierOn = 2,
    /// Reader to card
    Poll = 3,
    /// Card to reader
    Listen = 4,
    /// Terminal to card over the contact interface
    IsoRequest = 5,
    /// Card to terminal over the contact interface
    IsoResponse = 6,
}

impl FrameType {
    pub fn from_code(code: u32) -> Option<FrameType> {
        match code {
            1 => Some(FrameType::CarrierOff),
            2 => Some(FrameType::CarrierOn),
            3 => Some(FrameType::Poll),
            4 => Some(FrameType::Listen),
            5 => Some(FrameType::IsoRequest),
            6 => Some(FrameType::IsoResponse),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameType::CarrierOff => "CarrierOff",
            FrameType::CarrierOn => "CarrierOn",
            FrameType::Poll => "Poll",
            FrameType::Listen => "Listen",
            FrameType::IsoRequest => "IsoRequest",
            FrameType::IsoResponse => "IsoResponse",
        }
    }
}

/// Protocol stage the frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramePhase {
    Carrier = 0,
    Selection = 1,
    Application = 2,
    Auth = 3,
}

impl FramePhase {
    pub fn from_code(code: u32) -> Option<FramePhase> {
        match code {
            0 => Some(FramePhase::Carrier),
            1 => Some(FramePhase::Selection),
            2 => Some(FramePhase::Application),
            3 => Some(FramePhase::Auth),
            _ => None,
        }
    }
}

/// Bit set of frame conditions, kept as a plain integer so it can travel
/// through JSON unchanged.
pub mod frame_flags {
    pub const SHORT_FRAME: u32 = 0x01;
    pub const CRC_ERROR: u32 = 0x02;
    pub const PARITY_ERROR: u32 = 0x04;
    pub const SYNC_ERROR: u32 = 0x08;
    pub const TRUNCATED: u32 = 0x10;
    pub const ENCRYPTED: u32 = 0x20;
}

/// A decoded frame: payload bytes plus timing and protocol metadata.
///
/// A default-constructed frame is the end-of-stream sentinel published by
/// decoders when they receive an EOF signal buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    valid: bool,
    tech_type: TechType,
    frame_type: FrameType,
    frame_phase: FramePhase,
    frame_flags: u32,
    frame_rate: u32,
    sample_start: u64,
    sample_end: u64,
    sample_rate: u32,
    time_start: f64,
    time_end: f64,
    date_time: f64,
    data: Vec<u8>,
}

impl RawFrame {
    pub fn new(tech_type: TechType, frame_type: FrameType) -> Self {
        RawFrame {
            valid: true,
            tech_type,
            frame_type,
            frame_phase: FramePhase::Carrier,
            frame_flags: 0,
            frame_rate: 0,
            sample_start: 0,
            sample_end: 0,
            sample_rate: 0,
            time_start: 0.0,
            time_end: 0.0,
            date_time: 0.0,
            data: Vec::new(),
        }
    }

    pub fn eof() -> Self {
        let mut frame = RawFrame::new(TechType::None, FrameType::CarrierOff);
        frame.valid = false;
        frame
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn tech_type(&self) -> TechType {
        self.tech_type
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn frame_phase(&self) -> FramePhase {
        self.frame_phase
    }

    pub fn set_frame_phase(&mut self, phase: FramePhase) {
        self.frame_phase = phase;
    }

    pub fn frame_flags(&self) -> u32 {
        self.frame_flags
    }

    /// Or additional flags into the frame.
    pub fn set_frame_flags(&mut self, flags: u32) {
        self.frame_flags |= flags;
    }

    pub fn has_frame_flags(&self, flags: u32) -> bool {
        self.frame_flags & flags != 0
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn set_frame_rate(&mut self, rate: u32) {
        self.frame_rate = rate;
    }

    pub fn sample_start(&self) -> u64 {
        self.sample_start
    }

    pub fn set_sample_start(&mut self, start: u64) {
        self.sample_start = start;
    }

    pub fn sample_end(&self) -> u64 {
        self.sample_end
    }

    pub fn set_sample_end(&mut self, end: u64) {
        self.sample_end = end;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
    }

    pub fn time_start(&self) -> f64 {
        self.time_start
    }

    pub fn set_time_start(&mut self, time: f64) {
        self.time_start = time;
    }

    pub fn time_end(&self) -> f64 {
        self.time_end
    }

    pub fn set_time_end(&mut self, time: f64) {
        self.time_end = time;
    }

    pub fn date_time(&self) -> f64 {
        self.date_time
    }

    pub fn set_date_time(&mut self, time: f64) {
        self.date_time = time;
    }

    pub fn is_poll_frame(&self) -> bool {
        self.frame_type == FrameType::Poll || self.frame_type == FrameType::IsoRequest
    }

    pub fn is_listen_frame(&self) -> bool {
        self.frame_type == FrameType::Listen || self.frame_type == FrameType::IsoResponse
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.data[index]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn put(&mut self, byte: u8) {
        self.data.push(byte);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Payload as an uppercase hex string without separators.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.data.len() * 2);
        for b in &self.data {
            out.push_str(&format!("{b:02X}"));
        }
        out
    }
}

impl Default for RawFrame {
    fn default() -> Self {
        RawFrame::eof()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_frame_is_invalid() {
        assert!(!RawFrame::eof().is_valid());
        assert!(RawFrame::new(TechType::NfcA, FrameType::Poll).is_valid());
    }

    #[test]
    fn flags_accumulate() {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Poll);
        frame.set_frame_flags(frame_flags::SHORT_FRAME);
        frame.set_frame_flags(frame_flags::PARITY_ERROR);
        assert!(frame.has_frame_flags(frame_flags::SHORT_FRAME));
        assert!(frame.has_frame_flags(frame_flags::PARITY_ERROR));
        assert!(!frame.has_frame_flags(frame_flags::CRC_ERROR));
        assert_eq!(frame.frame_flags(), 0x05);
    }

    #[test]
    fn hex_rendering() {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Listen);
        frame.put_slice(&[0x04, 0x00, 0xAB]);
        assert_eq!(frame.to_hex(), "0400AB");
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.byte(2), 0xAB);
    }
}

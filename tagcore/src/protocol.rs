//! Protocol grammar for decoded frames: classifies raw NFC-A frames and
//! builds an annotated tree of named fields per command, suitable for
//! display or export.

use crate::crc::{crc_a, crc_b};
use crate::frame::{frame_flags, RawFrame, TechType};

/// FSDI / FSCI to frame size conversion.
const TABLE_FDS: [usize; 16] = [16, 24, 32, 40, 48, 64, 96, 128, 256, 0, 0, 0, 0, 0, 0, 0];

/// Frame waiting time for an FWI index, seconds: (256 * 16 / fc) * 2^i.
pub fn table_fwt(index: u8) -> f64 {
    256.0 * 16.0 / 13.56e6 * f64::from(1u32 << u32::from(index & 0x0F))
}

/// Start-up frame guard time for an SFGI index, same progression as FWT.
pub fn table_sfgt(index: u8) -> f64 {
    table_fwt(index)
}

pub mod node_flags {
    pub const REQUEST_FRAME: u32 = 0x01;
    pub const RESPONSE_FRAME: u32 = 0x02;
    pub const FRAME_FIELD: u32 = 0x04;
    pub const FIELD_INFO: u32 = 0x08;
    pub const PARITY_ERROR: u32 = 0x10;
    pub const CRC_ERROR: u32 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCategory {
    Other,
    SenseFrame,
    SelectionFrame,
    InformationFrame,
    AuthFrame,
}

/// Payload carried by one tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Empty,
    Bytes(Vec<u8>),
    Number(i64),
    Text(String),
}

/// One node of the annotated frame tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolFrame {
    id: Option<u32>,
    name: Option<String>,
    value: NodeValue,
    rate: Option<u32>,
    time_start: Option<f64>,
    time_end: Option<f64>,
    elapsed: Option<f64>,
    flags: u32,
    category: FrameCategory,
    children: Vec<ProtocolFrame>,
}

impl ProtocolFrame {
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    pub fn rate(&self) -> Option<u32> {
        self.rate
    }

    pub fn time_start(&self) -> Option<f64> {
        self.time_start
    }

    pub fn time_end(&self) -> Option<f64> {
        self.time_end
    }

    pub fn elapsed(&self) -> Option<f64> {
        self.elapsed
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn category(&self) -> FrameCategory {
        self.category
    }

    pub fn is_request(&self) -> bool {
        self.flags & node_flags::REQUEST_FRAME != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & node_flags::RESPONSE_FRAME != 0
    }

    pub fn children(&self) -> &[ProtocolFrame] {
        &self.children
    }

    pub fn append_child(&mut self, child: ProtocolFrame) {
        self.children.push(child);
    }

    pub fn prepend_child(&mut self, child: ProtocolFrame) {
        self.children.insert(0, child);
    }

    /// Depth-first search for a named node.
    pub fn find(&self, name: &str) -> Option<&ProtocolFrame> {
        if self.name.as_deref() == Some(name) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Structural equality ignoring the monotone frame id.
    pub fn same_shape(&self, other: &ProtocolFrame) -> bool {
        self.name == other.name
            && self.value == other.value
            && self.flags == other.flags
            && self.category == other.category
            && self.children.len() == other.children.len()
            && self.children.iter().zip(&other.children).all(|(a, b)| a.same_shape(b))
    }
}

/// Stateful classifier turning raw frames into protocol trees.
///
/// Dispatch is on the first byte for requests and on the pending request
/// command for responses; a Mifare AUTH starts a two-message chain.
pub struct ProtocolParser {
    count: u32,
    chaining: u8,
    request: u8,
    last_time_start: Option<f64>,
}

impl ProtocolParser {
    pub fn new() -> Self {
        ProtocolParser { count: 1, chaining: 0, request: 0, last_time_start: None }
    }

    pub fn reset(&mut self) {
        self.count = 1;
        self.chaining = 0;
        self.request = 0;
        self.last_time_start = None;
    }

    pub fn parse(&mut self, frame: &RawFrame) -> Option<ProtocolFrame> {
        let mut info = if frame.is_poll_frame() {
            if self.chaining == 0 {
                let command = frame.byte(0);
                let info = match command {
                    0x26 => self.parse_request_reqa(frame),
                    0x50 => self.parse_request_hlta(frame),
                    0x52 => self.parse_request_wupa(frame),
                    0x60 | 0x61 => self.parse_request_auth(frame),
                    0x93 | 0x95 | 0x97 => self.parse_request_seln(frame),
                    0xE0 => self.parse_request_rats(frame),
                    c if c & 0xF0 == 0xD0 => self.parse_request_ppsr(frame),
                    c if c & 0xE2 == 0x02 => self.parse_request_iblock(frame),
                    c if c & 0xE6 == 0xA2 => self.parse_request_rblock(frame),
                    c if c & 0xC7 == 0xC2 => self.parse_request_sblock(frame),
                    _ => self.parse_request_unknown(frame),
                };
                self.request = command;
                Some(info)
            } else if self.chaining == 0x60 || self.chaining == 0x61 {
                Some(self.parse_request_auth(frame))
            } else {
                None
            }
        } else {
            let command = self.request;
            let info = match command {
                0x26 | 0x52 => self.parse_response_reqa(frame),
                0x50 => self.parse_response_hlta(frame),
                0x60 | 0x61 => self.parse_response_auth(frame),
                0x93 | 0x95 | 0x97 => self.parse_response_seln(frame),
                0xE0 => self.parse_response_rats(frame),
                c if c & 0xF0 == 0xD0 => self.parse_response_ppsr(frame),
                c if c & 0xE2 == 0x02 => self.parse_response_iblock(frame),
                c if c & 0xE6 == 0xA2 => self.parse_response_generic(frame, FrameCategory::InformationFrame),
                c if c & 0xC7 == 0xC2 => self.parse_response_generic(frame, FrameCategory::InformationFrame),
                _ => self.parse_response_generic(frame, FrameCategory::Other),
            };
            Some(info)
        };

        // inter-frame timing
        if let Some(info) = info.as_mut() {
            if let Some(last) = self.last_time_start {
                if frame.time_start() > last {
                    info.elapsed = Some(frame.time_start() - last);
                }
            }
        }

        self.last_time_start = Some(frame.time_start());

        info
    }

    fn parity_flag(frame: &RawFrame) -> u32 {
        if frame.has_frame_flags(frame_flags::PARITY_ERROR) {
            node_flags::PARITY_ERROR
        } else {
            0
        }
    }

    fn crc_flag(frame: &RawFrame) -> u32 {
        let data = frame.data();
        if data.len() <= 2 {
            return node_flags::CRC_ERROR;
        }
        let computed = match frame.tech_type() {
            TechType::NfcB => crc_b(&data[..data.len() - 2]),
            _ => crc_a(&data[..data.len() - 2]),
        };
        let stored = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
        if stored != computed {
            node_flags::CRC_ERROR
        } else {
            0
        }
    }

    fn frame_info(
        &mut self,
        name: Option<&str>,
        frame: &RawFrame,
        flags: u32,
        category: FrameCategory,
    ) -> ProtocolFrame {
        let direction = if name.is_some() {
            node_flags::REQUEST_FRAME
        } else {
            node_flags::RESPONSE_FRAME
        };
        let id = self.count;
        self.count += 1;
        ProtocolFrame {
            id: Some(id),
            name: name.map(str::to_owned),
            value: NodeValue::Bytes(frame.data().to_vec()),
            rate: (frame.frame_rate() > 0).then(|| frame.frame_rate()),
            time_start: Some(frame.time_start()),
            time_end: Some(frame.time_end()),
            elapsed: None,
            flags: flags | direction,
            category,
            children: Vec::new(),
        }
    }

    fn field(name: &str, value: NodeValue) -> ProtocolFrame {
        ProtocolFrame {
            id: None,
            name: Some(name.to_owned()),
            value,
            rate: None,
            time_start: None,
            time_end: None,
            elapsed: None,
            flags: node_flags::FRAME_FIELD,
            category: FrameCategory::Other,
            children: Vec::new(),
        }
    }

    fn info(text: String) -> ProtocolFrame {
        ProtocolFrame {
            id: None,
            name: None,
            value: NodeValue::Text(text),
            rate: None,
            time_start: None,
            time_end: None,
            elapsed: None,
            flags: node_flags::FIELD_INFO,
            category: FrameCategory::Other,
            children: Vec::new(),
        }
    }

    fn bytes(frame: &RawFrame, start: usize, len: usize) -> NodeValue {
        NodeValue::Bytes(frame.data()[start..start + len].to_vec())
    }

    fn tail(frame: &RawFrame, len: usize) -> NodeValue {
        let data = frame.data();
        NodeValue::Bytes(data[data.len() - len..].to_vec())
    }

    fn parse_request_reqa(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(Some("REQA"), frame, flags, FrameCategory::SenseFrame)
    }

    fn parse_request_wupa(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(Some("WUPA"), frame, flags, FrameCategory::SenseFrame)
    }

    fn parse_request_hlta(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);
        let mut root = self.frame_info(Some("HLTA"), frame, flags, FrameCategory::SenseFrame);
        root.append_child(Self::field("CRC", Self::tail(frame, 2)));
        root
    }

    fn parse_request_seln(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let cmd = frame.byte(0);
        let nvb = frame.byte(1) >> 4;
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let name = match cmd {
            0x93 => "SEL1",
            0x95 => "SEL2",
            0x97 => "SEL3",
            _ => "SEL?",
        };

        let mut root = self.frame_info(Some(name), frame, flags, FrameCategory::SelectionFrame);

        root.append_child(Self::field("NVB", NodeValue::Number(i64::from(nvb))));

        if nvb == 7 && frame.len() >= 9 {
            if frame.byte(2) == 0x88 {
                // cascade tag in front of a partial UID
                root.append_child(Self::field("CT", Self::bytes(frame, 2, 1)));
                root.append_child(Self::field("UID", Self::bytes(frame, 3, 3)));
            } else {
                root.append_child(Self::field("UID", Self::bytes(frame, 2, 4)));
            }
            root.append_child(Self::field("BCC", Self::bytes(frame, 6, 1)));
            root.append_child(Self::field("CRC", Self::tail(frame, 2)));
        }

        root
    }

    fn parse_request_rats(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let cdi = frame.byte(1) & 0x0F;
        let fsdi = (frame.byte(1) >> 4) & 0x0F;
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let mut root = self.frame_info(Some("RATS"), frame, flags, FrameCategory::SelectionFrame);

        let mut param = Self::field("PARAM", Self::bytes(frame, 1, 1));
        param.append_child(Self::info(format!("[....{cdi:04b}] CDI logical channel {cdi}")));
        param.append_child(Self::info(format!(
            "[{fsdi:04b}....] FSD max frame size {}",
            TABLE_FDS[fsdi as usize]
        )));

        root.append_child(param);
        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_request_ppsr(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let pps = frame.byte(0);
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let mut root = self.frame_info(Some("PPS"), frame, flags, FrameCategory::SelectionFrame);

        root.append_child(Self::field("CID", NodeValue::Number(i64::from(pps & 0x0F))));
        root.append_child(Self::field("PPS0", Self::bytes(frame, 1, 1)));

        let pps0 = frame.byte(1);

        if pps0 & 0x10 != 0 && frame.len() > 2 {
            let mut pps1f = Self::field("PPS1", Self::bytes(frame, 2, 1));
            let pps1 = frame.byte(2);

            let listen = match pps1 & 0x0C {
                0x00 => "[....00..] selected 106 kbps PICC to PCD rate",
                0x04 => "[....01..] selected 212 kbps PICC to PCD rate",
                0x08 => "[....10..] selected 424 kbps PICC to PCD rate",
                _ => "[....11..] selected 848 kbps PICC to PCD rate",
            };
            pps1f.append_child(Self::info(listen.to_owned()));

            let poll = match pps1 & 0x03 {
                0x00 => "[......00] selected 106 kbps PCD to PICC rate",
                0x01 => "[......01] selected 212 kbps PCD to PICC rate",
                0x02 => "[......10] selected 424 kbps PCD to PICC rate",
                _ => "[......11] selected 848 kbps PCD to PICC rate",
            };
            pps1f.append_child(Self::info(poll.to_owned()));

            root.append_child(pps1f);
        }

        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_request_auth(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let parity = Self::parity_flag(frame);

        if self.chaining == 0 {
            let cmd = frame.byte(0);
            let block = frame.byte(1);
            let flags = parity | Self::crc_flag(frame);

            let name = if cmd == 0x60 { "AUTH(A)" } else { "AUTH(B)" };
            let mut root = self.frame_info(Some(name), frame, flags, FrameCategory::AuthFrame);

            root.append_child(Self::field("BLOCK", NodeValue::Number(i64::from(block))));
            root.append_child(Self::field("CRC", Self::tail(frame, 2)));

            self.chaining = cmd;

            return root;
        }

        let name = if self.chaining == 0x60 { "AUTH(A)" } else { "AUTH(B)" };
        let mut root = self.frame_info(Some(name), frame, parity, FrameCategory::AuthFrame);

        root.append_child(Self::field("TOKEN", NodeValue::Bytes(frame.data().to_vec())));

        self.chaining = 0;

        root
    }

    fn parse_request_iblock(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let pcb = frame.byte(0);
        let mut offset = 1usize;
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let mut root =
            self.frame_info(Some("I-Block"), frame, flags, FrameCategory::InformationFrame);

        if pcb & 0x08 != 0 {
            root.append_child(Self::field("CID", NodeValue::Number(i64::from(frame.byte(offset) & 0x0F))));
            offset += 1;
        }
        if pcb & 0x04 != 0 {
            root.append_child(Self::field("NAD", NodeValue::Number(i64::from(frame.byte(offset)))));
            offset += 1;
        }

        if offset + 2 < frame.len() {
            root.append_child(Self::field("DATA", Self::bytes(frame, offset, frame.len() - offset - 2)));
        }

        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_request_rblock(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let pcb = frame.byte(0);
        let mut offset = 1usize;
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let name = if pcb & 0x10 != 0 { "R(NACK)" } else { "R(ACK)" };
        let mut root = self.frame_info(Some(name), frame, flags, FrameCategory::InformationFrame);

        if pcb & 0x08 != 0 {
            root.append_child(Self::field("CID", NodeValue::Number(i64::from(frame.byte(offset) & 0x0F))));
            offset += 1;
        }
        if offset + 2 < frame.len() {
            root.append_child(Self::field("INF", Self::bytes(frame, offset, frame.len() - offset - 2)));
        }

        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_request_sblock(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let pcb = frame.byte(0);
        let mut offset = 1usize;
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let mut root =
            self.frame_info(Some("S-Block"), frame, flags, FrameCategory::InformationFrame);

        if pcb & 0x08 != 0 {
            root.append_child(Self::field("CID", NodeValue::Number(i64::from(frame.byte(offset) & 0x0F))));
            offset += 1;
        }
        if offset + 2 < frame.len() {
            root.append_child(Self::field("INF", Self::bytes(frame, offset, frame.len() - offset - 2)));
        }

        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_request_unknown(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(Some("(unk)"), frame, flags, FrameCategory::Other)
    }

    fn parse_response_reqa(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);

        let mut root = self.frame_info(None, frame, flags, FrameCategory::SenseFrame);

        if frame.len() < 2 {
            return root;
        }

        let uids = frame.byte(0);
        let type_bits = frame.byte(1) & 0x0F;

        let mut atqa = Self::field("ATQA", Self::bytes(frame, 0, 2));

        let size = match uids & 0xC0 {
            0x00 => "[00......] single size UID",
            0x40 => "[01......] double size UID",
            0x80 => "[10......] triple size UID",
            _ => "[11......] unknow UID size (reserved)",
        };
        atqa.append_child(Self::info(size.to_owned()));

        let anticollision = match uids & 0x1F {
            0x00 => Some("[...00000] bit frame anticollision (Type 1 Tag)"),
            0x01 => Some("[...00001] bit frame anticollision"),
            0x02 => Some("[...00010] bit frame anticollision"),
            0x04 => Some("[...00100] bit frame anticollision"),
            0x08 => Some("[...01000] bit frame anticollision"),
            0x10 => Some("[...10000] bit frame anticollision"),
            _ => None,
        };
        if let Some(text) = anticollision {
            atqa.append_child(Self::info(text.to_owned()));
        }

        atqa.append_child(Self::info(format!("[....{type_bits:04b}] type {type_bits}")));

        root.append_child(atqa);

        root
    }

    fn parse_response_hlta(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(None, frame, flags, FrameCategory::SenseFrame)
    }

    fn parse_response_seln(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);

        let mut root = self.frame_info(None, frame, flags, FrameCategory::SelectionFrame);

        if frame.len() == 5 {
            if frame.byte(0) == 0x88 {
                root.append_child(Self::field("CT", Self::bytes(frame, 0, 1)));
                root.append_child(Self::field("UID", Self::bytes(frame, 1, 3)));
            } else {
                root.append_child(Self::field("UID", Self::bytes(frame, 0, 4)));
            }
            root.append_child(Self::field("BCC", Self::bytes(frame, 4, 1)));
        } else if frame.len() == 3 {
            let mut sak = Self::field("SAK", Self::bytes(frame, 0, 1));

            if frame.byte(0) & 0x20 != 0 {
                sak.append_child(Self::info("[..1.....] ISO/IEC 14443-4 compliant".to_owned()));
            } else {
                sak.append_child(Self::info(
                    "[..0.....] not compliant with ISO/IEC 14443-4".to_owned(),
                ));
            }
            if frame.byte(0) & 0x04 != 0 {
                sak.append_child(Self::info("[.....1..] UID not complete".to_owned()));
            } else {
                sak.append_child(Self::info("[.....0..] UID complete".to_owned()));
            }

            root.append_child(sak);
            root.append_child(Self::field("CRC", Self::bytes(frame, 1, 2)));
        }

        root
    }

    fn parse_response_rats(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let mut root = self.frame_info(None, frame, flags, FrameCategory::SelectionFrame);

        if frame.len() < 3 {
            return root;
        }

        let tl = frame.byte(0) as usize;
        let mut offset = 1usize;

        let mut ats = Self::field("ATS", Self::bytes(frame, 1, frame.len() - 3));

        if tl > 0 && frame.len() > offset {
            let t0 = frame.byte(offset);
            let fsci = t0 & 0x0F;
            offset += 1;

            let mut t0f = Self::field("T0", Self::bytes(frame, 1, 1));
            t0f.append_child(Self::info(format!(
                "[....{fsci:04b}] max frame size {}",
                TABLE_FDS[fsci as usize]
            )));

            // TA transmitted
            if t0 & 0x10 != 0 && frame.len() > offset + 2 {
                t0f.prepend_child(Self::info("[...1....] TA transmitted".to_owned()));

                let mut taf = Self::field("TA", Self::bytes(frame, offset, 1));
                let ta = frame.byte(offset);
                offset += 1;

                if ta & 0x80 != 0 {
                    taf.append_child(Self::info(
                        "[1.......] only support same rate for both directions".to_owned(),
                    ));
                } else {
                    taf.append_child(Self::info(
                        "[0.......] supported different rates for each direction".to_owned(),
                    ));
                }
                if ta & 0x40 != 0 {
                    taf.append_child(Self::info("[.1......] supported 848 kbps PICC to PCD".to_owned()));
                }
                if ta & 0x20 != 0 {
                    taf.append_child(Self::info("[..1.....] supported 424 kbps PICC to PCD".to_owned()));
                }
                if ta & 0x10 != 0 {
                    taf.append_child(Self::info("[...1....] supported 212 kbps PICC to PCD".to_owned()));
                }
                if ta & 0x04 != 0 {
                    taf.append_child(Self::info("[.....1..] supported 848 kbps PCD to PICC".to_owned()));
                }
                if ta & 0x02 != 0 {
                    taf.append_child(Self::info("[......1.] supported 424 kbps PCD to PICC".to_owned()));
                }
                if ta & 0x01 != 0 {
                    taf.append_child(Self::info("[.......1] supported 212 kbps PCD to PICC".to_owned()));
                }
                if ta & 0x7F == 0 {
                    taf.append_child(Self::info("[.0000000] only 106 kbps supported".to_owned()));
                }

                ats.append_child(taf);
            }

            // TB transmitted
            if t0 & 0x20 != 0 && frame.len() > offset + 2 {
                t0f.prepend_child(Self::info("[..1.....] TB transmitted".to_owned()));

                let mut tbf = Self::field("TB", Self::bytes(frame, offset, 1));
                let tb = frame.byte(offset);
                offset += 1;

                let sfgi = tb & 0x0F;
                let fwi = (tb >> 4) & 0x0F;

                let sfgt = table_sfgt(sfgi) * 1000.0;
                let fwt = table_fwt(fwi) * 1000.0;

                tbf.append_child(Self::info(format!(
                    "[{fwi:04b}....] frame waiting time FWT = {fwt:.2} ms"
                )));
                tbf.append_child(Self::info(format!(
                    "[....{sfgi:04b}] start-up frame guard time SFGT = {sfgt:.2} ms"
                )));

                ats.append_child(tbf);
            }

            // TC transmitted
            if t0 & 0x40 != 0 && frame.len() > offset + 2 {
                t0f.prepend_child(Self::info("[.1......] TC transmitted".to_owned()));

                let mut tcf = Self::field("TC", Self::bytes(frame, offset, 1));
                let tc = frame.byte(offset);
                offset += 1;

                if tc & 0x01 != 0 {
                    tcf.append_child(Self::info("[.......1] NAD supported".to_owned()));
                }
                if tc & 0x02 != 0 {
                    tcf.append_child(Self::info("[......1.] CID supported".to_owned()));
                }

                ats.append_child(tcf);
            }

            ats.prepend_child(t0f);

            if offset < tl && frame.len() >= tl + 2 {
                ats.append_child(Self::field("HIST", Self::bytes(frame, offset, tl - offset)));
            }
        }

        root.append_child(Self::field("TL", NodeValue::Number(tl as i64)));
        root.append_child(ats);
        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_response_ppsr(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(None, frame, flags, FrameCategory::SelectionFrame)
    }

    fn parse_response_auth(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(None, frame, flags, FrameCategory::AuthFrame)
    }

    fn parse_response_iblock(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let pcb = frame.byte(0);
        let mut offset = 1usize;
        let flags = Self::parity_flag(frame) | Self::crc_flag(frame);

        let mut root = self.frame_info(None, frame, flags, FrameCategory::InformationFrame);

        if pcb & 0x08 != 0 {
            root.append_child(Self::field("CID", NodeValue::Number(i64::from(frame.byte(offset) & 0x0F))));
            offset += 1;
        }
        if pcb & 0x04 != 0 {
            root.append_child(Self::field("NAD", NodeValue::Number(i64::from(frame.byte(offset)))));
            offset += 1;
        }
        if offset + 2 < frame.len() {
            root.append_child(Self::field("DATA", Self::bytes(frame, offset, frame.len() - offset - 2)));
        }

        root.append_child(Self::field("CRC", Self::tail(frame, 2)));

        root
    }

    fn parse_response_generic(&mut self, frame: &RawFrame, category: FrameCategory) -> ProtocolFrame {
        let flags = Self::parity_flag(frame);
        self.frame_info(None, frame, flags, category)
    }
}

impl Default for ProtocolParser {
    fn default() -> Self {
        ProtocolParser::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    fn poll_frame(bytes: &[u8], time: f64) -> RawFrame {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Poll);
        frame.put_slice(bytes);
        frame.set_time_start(time);
        frame.set_time_end(time + 0.0001);
        frame.set_frame_rate(105_937);
        frame
    }

    fn listen_frame(bytes: &[u8], time: f64) -> RawFrame {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Listen);
        frame.put_slice(bytes);
        frame.set_time_start(time);
        frame.set_time_end(time + 0.0001);
        frame.set_frame_rate(105_937);
        frame
    }

    fn with_crc(bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        let crc = crc_a(bytes);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    #[test]
    fn reqa_and_atqa() {
        let mut parser = ProtocolParser::new();

        let tree = parser.parse(&poll_frame(&[0x26], 1.0)).unwrap();
        assert_eq!(tree.name(), Some("REQA"));
        assert_eq!(tree.category(), FrameCategory::SenseFrame);
        assert!(tree.is_request());

        let tree = parser.parse(&listen_frame(&[0x04, 0x00], 1.001)).unwrap();
        assert!(tree.is_response());
        let atqa = tree.find("ATQA").expect("ATQA field");
        assert_eq!(atqa.value(), &NodeValue::Bytes(vec![0x04, 0x00]));
        assert!(atqa
            .children()
            .iter()
            .any(|c| matches!(c.value(), NodeValue::Text(t) if t.contains("single size UID"))));
        assert_eq!(tree.elapsed(), Some(1.001 - 1.0));
    }

    #[test]
    fn rats_and_ats_tree() {
        let mut parser = ProtocolParser::new();

        let rats = parser.parse(&poll_frame(&[0xE0, 0x80, 0x31, 0x73], 0.5)).unwrap();
        assert_eq!(rats.name(), Some("RATS"));
        assert_eq!(rats.category(), FrameCategory::SelectionFrame);
        assert_eq!(rats.flags() & node_flags::CRC_ERROR, 0);
        let param = rats.find("PARAM").unwrap();
        assert!(param
            .children()
            .iter()
            .any(|c| matches!(c.value(), NodeValue::Text(t) if t.contains("max frame size 256"))));

        // ATS: TL=5, T0=0x38 (TA+TB, FSCI 8), TA=0x80, TB=0x70 (FWI 7 SFGI 0), HIST=B0
        let ats = parser.parse(&listen_frame(&with_crc(&[0x05, 0x38, 0x80, 0x70, 0xB0]), 0.6)).unwrap();
        assert!(ats.is_response());
        assert_eq!(ats.flags() & node_flags::CRC_ERROR, 0);

        let t0 = ats.find("T0").expect("T0 field");
        assert!(t0
            .children()
            .iter()
            .any(|c| matches!(c.value(), NodeValue::Text(t) if t.contains("TA transmitted"))));
        assert!(t0
            .children()
            .iter()
            .any(|c| matches!(c.value(), NodeValue::Text(t) if t.contains("TB transmitted"))));

        assert!(ats.find("TA").is_some());
        let tb = ats.find("TB").expect("TB field");
        assert!(tb.children().iter().any(
            |c| matches!(c.value(), NodeValue::Text(t) if t.contains("frame waiting time FWT = 38.66 ms"))
        ));
        assert!(tb.children().iter().any(
            |c| matches!(c.value(), NodeValue::Text(t) if t.contains("SFGT = 0.30 ms"))
        ));

        let hist = ats.find("HIST").expect("HIST field");
        assert_eq!(hist.value(), &NodeValue::Bytes(vec![0xB0]));
    }

    #[test]
    fn sel_request_with_full_uid() {
        let mut parser = ProtocolParser::new();

        // SEL1 NVB 70 with UID and BCC
        let bytes = with_crc(&[0x93, 0x70, 0x11, 0x22, 0x33, 0x44, 0x04]);
        let tree = parser.parse(&poll_frame(&bytes, 0.0)).unwrap();

        assert_eq!(tree.name(), Some("SEL1"));
        assert_eq!(tree.find("UID").unwrap().value(), &NodeValue::Bytes(vec![0x11, 0x22, 0x33, 0x44]));
        assert_eq!(tree.find("BCC").unwrap().value(), &NodeValue::Bytes(vec![0x04]));
    }

    #[test]
    fn auth_two_pass_chain() {
        let mut parser = ProtocolParser::new();

        let auth = parser.parse(&poll_frame(&with_crc(&[0x60, 0x00]), 0.0)).unwrap();
        assert_eq!(auth.name(), Some("AUTH(A)"));
        assert_eq!(auth.category(), FrameCategory::AuthFrame);
        assert!(auth.find("BLOCK").is_some());

        // tag nonce
        let nonce = parser.parse(&listen_frame(&[0xAA, 0xBB, 0xCC, 0xDD], 0.001)).unwrap();
        assert_eq!(nonce.category(), FrameCategory::AuthFrame);

        // reader answer arrives as a chained request carrying the token
        let token = parser
            .parse(&poll_frame(&[1, 2, 3, 4, 5, 6, 7, 8], 0.002))
            .unwrap();
        assert_eq!(token.name(), Some("AUTH(A)"));
        assert!(token.find("TOKEN").is_some());

        // chain is closed, next request dispatches normally
        let reqa = parser.parse(&poll_frame(&[0x26], 0.003)).unwrap();
        assert_eq!(reqa.name(), Some("REQA"));
    }

    #[test]
    fn parse_is_idempotent_modulo_id() {
        let mut parser = ProtocolParser::new();
        let frame = poll_frame(&with_crc(&[0xE0, 0x80]), 0.25);

        let first = parser.parse(&frame).unwrap();

        let mut fresh = ProtocolParser::new();
        let second = fresh.parse(&frame).unwrap();

        assert!(first.same_shape(&second));
        assert_eq!(first.id(), Some(1));
    }

    #[test]
    fn parity_error_propagates_to_tree() {
        let mut parser = ProtocolParser::new();
        let mut frame = poll_frame(&[0x26], 0.0);
        frame.set_frame_flags(frame_flags::PARITY_ERROR);

        let tree = parser.parse(&frame).unwrap();
        assert_ne!(tree.flags() & node_flags::PARITY_ERROR, 0);
    }
}

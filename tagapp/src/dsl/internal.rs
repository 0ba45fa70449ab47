//! DSLogic wire protocol: control commands, register map, FPGA arming block
//! and the byte-to-sample expansion used by the capture path.

use std::sync::OnceLock;

/// Vendor control requests.
pub const CMD_CTL_WR: u8 = 0xB0;
pub const CMD_CTL_RD_PRE: u8 = 0xB1;
pub const CMD_CTL_RD: u8 = 0xB2;

/// Bulk endpoints for firmware/setting upload and sample data.
pub const EP_BULK_OUT: u8 = 0x02;
pub const EP_BULK_IN: u8 = 0x86;

pub const USB_INTERFACE: u8 = 0;

/// Hardware status bits.
pub const BM_GPIF_DONE: u8 = 1 << 7;
pub const BM_FPGA_DONE: u8 = 1 << 6;
pub const BM_FPGA_INIT_B: u8 = 1 << 5;
pub const BM_SYS_CLR: u8 = 1 << 3;

/// I2C register map.
pub const VTH_ADDR: u8 = 0x78;
pub const SEC_DATA_ADDR: u8 = 0x75;
pub const SEC_CTRL_ADDR: u8 = 0x73;
pub const CTR0_ADDR: u8 = 0x70;
pub const ADCC_ADDR: u8 = 0x48;
pub const HDL_VERSION_ADDR: u8 = 0x04;

/// Security handshake.
pub const SECU_STEPS: usize = 8;
pub const SECU_START: u16 = 0x0513;
pub const SECU_CHECK: u16 = 0x0219;
pub const SECU_EEP_ADDR: u16 = 0x3C00;
pub const SECU_TRY_CNT: u32 = 8;
pub const BM_SECU_READY: u8 = 1 << 3;
pub const BM_SECU_PASS: u8 = 1 << 4;

/// Register writes share one control block layout.
pub mod ctl {
    pub const FW_VERSION: u8 = 0;
    pub const HW_STATUS: u8 = 2;
    pub const PROG_B: u8 = 3;
    pub const LED: u8 = 5;
    pub const INTRDY: u8 = 6;
    pub const WORDWIDE: u8 = 7;
    pub const START: u8 = 8;
    pub const STOP: u8 = 9;
    pub const BULK_WR: u8 = 10;
    pub const NVM: u8 = 12;
    pub const I2C_REG: u8 = 14;
    pub const I2C_STATUS: u8 = 15;
}

/// Capability flags of a device profile.
pub mod caps {
    pub const VTH: u32 = 1 << 0;
    pub const BUF: u32 = 1 << 1;
    pub const USB30: u32 = 1 << 6;
    pub const ADF4360: u32 = 1 << 8;
    pub const LA_CH32: u32 = 1 << 11;
    pub const MAX25_VTH: u32 = 1 << 13;
    pub const SECURITY: u32 = 1 << 14;
}

/// Samples are captured in 64-sample atoms of 8 bytes per channel.
pub const ATOMIC_BITS: u32 = 6;
pub const ATOMIC_SAMPLES: u64 = 1 << ATOMIC_BITS;
pub const ATOMIC_SIZE: u64 = 1 << (ATOMIC_BITS - 3);
pub const SAMPLES_ALIGN: u64 = 1023;

pub const NUM_TRIGGER_STAGES: usize = 16;
pub const NUM_SIMUL_TRANSFERS: usize = 64;

/// Header transfer payload carries the trigger position report.
pub const TRIG_CHECKID: u32 = 0x5555_5555;

/// Required firmware major version.
pub const REQUIRED_VERSION_MAJOR: u8 = 2;
pub const HDL_VERSION: u8 = 0x0E;

/// Threshold level selects which bitstream is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdLevel {
    Th3v3,
    Th5v0,
}

/// Static description of one supported analyzer model.
#[derive(Debug, Clone, Copy)]
pub struct DslProfile {
    pub vid: u16,
    pub pid: u16,
    pub usb_speed: rusb::Speed,
    pub vendor: &'static str,
    pub model: &'static str,
    pub firmware: &'static str,
    pub fpga_bit33: &'static str,
    pub fpga_bit50: &'static str,
    pub feature_caps: u32,
    pub total_channels: usize,
    pub hw_depth: u64,
    pub max_samplerate: u64,
    pub half_samplerate: u64,
    pub quarter_samplerate: u64,
}

/// Supported hardware, matched on `(vid, pid, speed)`.
pub static DSL_PROFILES: &[DslProfile] = &[DslProfile {
    vid: 0x2A0E,
    pid: 0x0030,
    usb_speed: rusb::Speed::High,
    vendor: "DreamSourceLab",
    model: "DSLogic PLUS",
    firmware: "DSLogicPlus.fw",
    fpga_bit33: "DSLogicPlus.bin",
    fpga_bit50: "DSLogicPlus-pgl12.bin",
    feature_caps: caps::VTH | caps::BUF,
    total_channels: 16,
    hw_depth: 256 * 1024 * 1024,
    max_samplerate: 400_000_000,
    half_samplerate: 200_000_000,
    quarter_samplerate: 100_000_000,
}];

/// One vendor control write: destination register, offset and payload.
#[derive(Debug, Clone)]
pub struct WrCmd {
    pub dest: u8,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl WrCmd {
    pub fn new(dest: u8) -> Self {
        WrCmd { dest, offset: 0, data: Vec::new() }
    }

    pub fn with_offset(mut self, offset: u16) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Wire layout: dest u8, offset u16 LE, size u8, payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.dest);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.push(self.data.len() as u8);
        out.extend_from_slice(&self.data);
        out
    }
}

/// One vendor control read request.
#[derive(Debug, Clone, Copy)]
pub struct RdCmd {
    pub dest: u8,
    pub offset: u16,
    pub size: u8,
}

impl RdCmd {
    pub fn header_bytes(&self) -> [u8; 4] {
        let offset = self.offset.to_le_bytes();
        [self.dest, offset[0], offset[1], self.size]
    }
}

/// Mode bit positions of the FPGA arming block.
pub mod mode_bit {
    pub const TRIG_EN: u16 = 0;
    pub const CLK_TYPE: u16 = 1;
    pub const CLK_EDGE: u16 = 2;
    pub const RLE_MODE: u16 = 3;
    pub const HALF_MODE: u16 = 5;
    pub const QUAR_MODE: u16 = 6;
    pub const FILTER: u16 = 8;
    pub const SLOW_ACQ: u16 = 10;
    pub const STRIG_MODE: u16 = 11;
    pub const STREAM_MODE: u16 = 12;
    pub const LPB_TEST: u16 = 13;
    pub const EXT_TEST: u16 = 14;
    pub const INT_TEST: u16 = 15;
}

pub const SETTING_SYNC: u32 = 0xf5a5_f5a5;
pub const SETTING_END_SYNC: u32 = 0xfa5a_fa5a;

/// FPGA acquisition settings, serialised little-endian in field order.
#[derive(Debug, Clone)]
pub struct FpgaSetting {
    pub mode: u16,
    pub div_l: u16,
    pub div_h: u16,
    pub cnt_l: u16,
    pub cnt_h: u16,
    pub tpos_l: u16,
    pub tpos_h: u16,
    pub trig_glb: u16,
    pub dso_cnt_l: u16,
    pub dso_cnt_h: u16,
    pub ch_en_l: u16,
    pub ch_en_h: u16,
    pub fgain: u16,
    pub trig_mask0: [u16; NUM_TRIGGER_STAGES],
    pub trig_mask1: [u16; NUM_TRIGGER_STAGES],
    pub trig_value0: [u16; NUM_TRIGGER_STAGES],
    pub trig_value1: [u16; NUM_TRIGGER_STAGES],
    pub trig_edge0: [u16; NUM_TRIGGER_STAGES],
    pub trig_edge1: [u16; NUM_TRIGGER_STAGES],
    pub trig_logic0: [u16; NUM_TRIGGER_STAGES],
    pub trig_logic1: [u16; NUM_TRIGGER_STAGES],
    pub trig_count: [u32; NUM_TRIGGER_STAGES],
}

impl Default for FpgaSetting {
    fn default() -> Self {
        // disabled trigger: all stages pass-through
        FpgaSetting {
            mode: 0,
            div_l: 0,
            div_h: 0,
            cnt_l: 0,
            cnt_h: 0,
            tpos_l: 0,
            tpos_h: 0,
            trig_glb: 0,
            dso_cnt_l: 0,
            dso_cnt_h: 0,
            ch_en_l: 0,
            ch_en_h: 0,
            fgain: 0,
            trig_mask0: [0xFFFF; NUM_TRIGGER_STAGES],
            trig_mask1: [0xFFFF; NUM_TRIGGER_STAGES],
            trig_value0: [0; NUM_TRIGGER_STAGES],
            trig_value1: [0; NUM_TRIGGER_STAGES],
            trig_edge0: [0; NUM_TRIGGER_STAGES],
            trig_edge1: [0; NUM_TRIGGER_STAGES],
            trig_logic0: [2; NUM_TRIGGER_STAGES],
            trig_logic1: [2; NUM_TRIGGER_STAGES],
            trig_count: [0; NUM_TRIGGER_STAGES],
        }
    }
}

impl FpgaSetting {
    /// Serialise with the section headers the FPGA expects in front of each
    /// field group.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len());

        let mut push16 = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_le_bytes());

        out.extend_from_slice(&SETTING_SYNC.to_le_bytes());

        push16(&mut out, 0x0001); // mode header
        push16(&mut out, self.mode);
        push16(&mut out, 0x0102); // divider header
        push16(&mut out, self.div_l);
        push16(&mut out, self.div_h);
        push16(&mut out, 0x0302); // count header
        push16(&mut out, self.cnt_l);
        push16(&mut out, self.cnt_h);
        push16(&mut out, 0x0502); // trigger position header
        push16(&mut out, self.tpos_l);
        push16(&mut out, self.tpos_h);
        push16(&mut out, 0x0701); // global trigger header
        push16(&mut out, self.trig_glb);
        push16(&mut out, 0x0802); // dso count header
        push16(&mut out, self.dso_cnt_l);
        push16(&mut out, self.dso_cnt_h);
        push16(&mut out, 0x0a02); // channel enable header
        push16(&mut out, self.ch_en_l);
        push16(&mut out, self.ch_en_h);
        push16(&mut out, 0x0c01); // fgain header
        push16(&mut out, self.fgain);

        push16(&mut out, 0x40a0); // trigger stage block header
        for group in [
            &self.trig_mask0,
            &self.trig_mask1,
            &self.trig_value0,
            &self.trig_value1,
            &self.trig_edge0,
            &self.trig_edge1,
            &self.trig_logic0,
            &self.trig_logic1,
        ] {
            for value in group {
                push16(&mut out, *value);
            }
        }
        for value in &self.trig_count {
            out.extend_from_slice(&value.to_le_bytes());
        }

        out.extend_from_slice(&SETTING_END_SYNC.to_le_bytes());

        out
    }

    pub fn encoded_len() -> usize {
        // sync + 21 header/value words + stage header + stage block +
        // counters + end sync
        4 + 2 * 21 + 2 + 2 * 8 * NUM_TRIGGER_STAGES + 4 * NUM_TRIGGER_STAGES + 4
    }
}

/// Extended trigger block for 32-channel capable hardware.
#[derive(Debug, Clone)]
pub struct FpgaSettingExt32 {
    pub trig_mask0: [u16; NUM_TRIGGER_STAGES],
    pub trig_mask1: [u16; NUM_TRIGGER_STAGES],
    pub trig_value0: [u16; NUM_TRIGGER_STAGES],
    pub trig_value1: [u16; NUM_TRIGGER_STAGES],
    pub trig_edge0: [u16; NUM_TRIGGER_STAGES],
    pub trig_edge1: [u16; NUM_TRIGGER_STAGES],
}

impl Default for FpgaSettingExt32 {
    fn default() -> Self {
        FpgaSettingExt32 {
            trig_mask0: [0xFFFF; NUM_TRIGGER_STAGES],
            trig_mask1: [0xFFFF; NUM_TRIGGER_STAGES],
            trig_value0: [0; NUM_TRIGGER_STAGES],
            trig_value1: [0; NUM_TRIGGER_STAGES],
            trig_edge0: [0; NUM_TRIGGER_STAGES],
            trig_edge1: [0; NUM_TRIGGER_STAGES],
        }
    }
}

impl FpgaSettingExt32 {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&SETTING_SYNC.to_le_bytes());
        out.extend_from_slice(&0x6060u16.to_le_bytes());

        for group in [
            &self.trig_mask0,
            &self.trig_mask1,
            &self.trig_value0,
            &self.trig_value1,
            &self.trig_edge0,
            &self.trig_edge1,
        ] {
            for value in group {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        out.extend_from_slice(&0xFFFFu16.to_le_bytes());
        out.extend_from_slice(&SETTING_END_SYNC.to_le_bytes());

        out
    }
}

/// Expansion table: one raw byte to eight `{0.0, 1.0}` samples, LSB first.
pub fn sample_table() -> &'static [[f32; 8]; 256] {
    static TABLE: OnceLock<[[f32; 8]; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0.0f32; 8]; 256];
        for (byte, row) in table.iter_mut().enumerate() {
            for (bit, sample) in row.iter_mut().enumerate() {
                *sample = f32::from((byte >> bit) as u8 & 1);
            }
        }
        table
    })
}

/// Transpose one 64-sample block: `channels * 8` source bytes laid out as
/// eight bytes per channel, into sample-major interleaved floats.
pub fn transpose_block(target: &mut [f32], channels: usize, block: &[u8]) {
    let table = sample_table();

    for (c, group) in block.chunks_exact(8).enumerate().take(channels) {
        for (j, byte) in group.iter().enumerate() {
            let samples = &table[*byte as usize];
            let mut t = c + (j * 8) * channels;
            for sample in samples {
                target[t] = *sample;
                t += channels;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_table_expands_bits_lsb_first() {
        let table = sample_table();
        assert_eq!(table[0x00], [0.0; 8]);
        assert_eq!(table[0xFF], [1.0; 8]);
        assert_eq!(table[0x01], [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(table[0x80], [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn setting_block_layout() {
        let setting = FpgaSetting {
            mode: 1 << mode_bit::STREAM_MODE,
            div_l: 40,
            ch_en_l: 0x0003,
            ..FpgaSetting::default()
        };
        let bytes = setting.to_bytes();

        assert_eq!(bytes.len(), FpgaSetting::encoded_len());
        assert_eq!(&bytes[0..4], &SETTING_SYNC.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 4..], &SETTING_END_SYNC.to_le_bytes());

        // mode header then mode value
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0x0001);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 1 << mode_bit::STREAM_MODE);
        // divider header then div_l
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), 0x0102);
        assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 40);
    }

    #[test]
    fn ext32_block_is_framed() {
        let bytes = FpgaSettingExt32::default().to_bytes();
        assert_eq!(&bytes[0..4], &SETTING_SYNC.to_le_bytes());
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0x6060);
        assert_eq!(&bytes[bytes.len() - 4..], &SETTING_END_SYNC.to_le_bytes());
        assert_eq!(bytes.len(), 4 + 2 + 2 * 6 * NUM_TRIGGER_STAGES + 2 + 4);
    }

    #[test]
    fn write_command_layout() {
        let cmd = WrCmd::new(ctl::I2C_REG).with_offset(0x0078).with_data(&[0x5A]);
        assert_eq!(cmd.to_bytes(), vec![14, 0x78, 0x00, 1, 0x5A]);

        let rd = RdCmd { dest: ctl::NVM, offset: SECU_EEP_ADDR, size: 16 };
        assert_eq!(rd.header_bytes(), [12, 0x00, 0x3C, 16]);
    }

    #[test]
    fn transpose_block_routes_bytes_to_channels() {
        let channels = 2;
        // channel 0: byte0 = 0x01 -> sample 0 high; channel 1: byte0 = 0x80
        // -> sample 7 high
        let mut block = vec![0u8; channels * 8];
        block[0] = 0x01;
        block[8] = 0x80;

        let mut target = vec![0.0f32; 64 * channels];
        transpose_block(&mut target, channels, &block);

        // sample-major interleave: sample s of channel c at s*channels + c
        assert_eq!(target[0], 1.0); // channel 0, sample 0
        assert_eq!(target[1], 0.0); // channel 1, sample 0
        assert_eq!(target[7 * channels + 1], 1.0); // channel 1, sample 7
        assert_eq!(target[7 * channels], 0.0);
        // byte 1 of channel 0 covers samples 8..16
        assert_eq!(target[8 * channels], 0.0);
    }
}

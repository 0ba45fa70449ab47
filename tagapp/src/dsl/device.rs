//! DSLogic-class USB logic analyzer driver on top of `rusb`.
//!
//! Open performs profile matching, firmware/FPGA bring-up, the NVM-seeded
//! security handshake and threshold programming. Streaming arms the FPGA
//! with a setting block and then runs bulk reads on a dedicated thread,
//! transposing raw channel bytes into interleaved sample buffers.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use rusb::{DeviceHandle, GlobalContext};

use tagcore::buffer::{SignalBuffer, SignalType};

use super::internal::*;
use crate::error::LabError;

const CTRL_TIMEOUT: Duration = Duration::from_millis(1000);
const HEADER_TIMEOUT: Duration = Duration::from_millis(30000);
const DATA_TIMEOUT: Duration = Duration::from_millis(5000);

/// Interleaved floats per emitted buffer, rounded down to whole atoms.
const CHANNEL_BUFFER_SIZE: usize = 1 << 19;

/// Called with each interleaved buffer; returning false aborts the capture.
pub type StreamHandler = Arc<dyn Fn(SignalBuffer) -> bool + Send + Sync>;

mod device_status {
    pub const ABSENT: u8 = 0;
    pub const READY: u8 = 1;
    pub const START: u8 = 2;
    pub const DATA: u8 = 3;
    pub const STOP: u8 = 4;
    pub const PAUSE: u8 = 5;
    pub const ABORT: u8 = 6;
    pub const ERROR: u8 = 7;
}

/// Runtime configuration of one analyzer.
#[derive(Debug, Clone)]
pub struct DslConfig {
    pub sample_rate: u32,
    pub limit_samples: u64,
    pub vth: f32,
    pub channels: Vec<usize>,
    pub firmware_path: PathBuf,
    pub stream: bool,
    pub test_mode: bool,
}

impl Default for DslConfig {
    fn default() -> Self {
        DslConfig {
            sample_rate: 10_000_000,
            limit_samples: u64::MAX / 2,
            vth: 1.65,
            channels: vec![0],
            firmware_path: PathBuf::new(),
            stream: true,
            test_mode: false,
        }
    }
}

pub struct DslDevice {
    handle: Option<Arc<DeviceHandle<GlobalContext>>>,
    profile: Option<&'static DslProfile>,
    config: DslConfig,
    th_level: ThresholdLevel,

    status: Arc<AtomicU8>,
    abort: Arc<AtomicBool>,
    current_samples: Arc<AtomicU64>,
    dropped_samples: Arc<AtomicU64>,

    stream_thread: Option<JoinHandle<()>>,
    fw_version: (u8, u8),
}

impl DslDevice {
    pub fn new(config: DslConfig) -> Self {
        DslDevice {
            handle: None,
            profile: None,
            th_level: if config.vth > 2.5 { ThresholdLevel::Th5v0 } else { ThresholdLevel::Th3v3 },
            config,
            status: Arc::new(AtomicU8::new(device_status::ABSENT)),
            abort: Arc::new(AtomicBool::new(false)),
            current_samples: Arc::new(AtomicU64::new(0)),
            dropped_samples: Arc::new(AtomicU64::new(0)),
            stream_thread: None,
            fw_version: (0, 0),
        }
    }

    /// List attached devices matching a known profile.
    pub fn enumerate() -> Vec<String> {
        let mut found = Vec::new();

        let Ok(devices) = rusb::devices() else {
            return found;
        };

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else { continue };
            for profile in DSL_PROFILES {
                if descriptor.vendor_id() == profile.vid && descriptor.product_id() == profile.pid {
                    found.push(format!(
                        "{}:{:03}:{:03}",
                        profile.model,
                        device.bus_number(),
                        device.address()
                    ));
                }
            }
        }

        found
    }

    pub fn model(&self) -> &'static str {
        self.profile.map(|p| p.model).unwrap_or("unknown")
    }

    pub fn vendor(&self) -> &'static str {
        self.profile.map(|p| p.vendor).unwrap_or("unknown")
    }

    pub fn version(&self) -> String {
        format!("{}.{}", self.fw_version.0, self.fw_version.1)
    }

    pub fn valid_channels(&self) -> usize {
        self.config.channels.len().max(1)
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn samples_read(&self) -> u64 {
        self.current_samples.load(Ordering::SeqCst)
    }

    pub fn samples_lost(&self) -> u64 {
        self.dropped_samples.load(Ordering::SeqCst)
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), LabError> {
        if self.config.test_mode {
            return Err(LabError::TestModePolicy);
        }
        self.config.sample_rate = rate;
        Ok(())
    }

    pub fn set_voltage_threshold(&mut self, vth: f32) {
        self.config.vth = vth;
        self.th_level =
            if vth > 2.5 { ThresholdLevel::Th5v0 } else { ThresholdLevel::Th3v3 };
    }

    pub fn set_channels(&mut self, channels: Vec<usize>) {
        self.config.channels = if channels.is_empty() { vec![0] } else { channels };
    }

    pub fn set_firmware_path(&mut self, path: PathBuf) {
        self.config.firmware_path = path;
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self.status.load(Ordering::SeqCst),
            device_status::START | device_status::DATA
        )
    }

    /// A ready device still answers a firmware version request.
    pub fn is_ready(&self) -> bool {
        self.read_fw_version().is_ok()
    }

    /// Bring the device up for capture.
    pub fn open(&mut self) -> Result<(), LabError> {
        let devices = rusb::devices().map_err(LabError::Usb)?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else { continue };

            let profile = DSL_PROFILES.iter().find(|p| {
                descriptor.vendor_id() == p.vid
                    && descriptor.product_id() == p.pid
                    && device.speed() == p.usb_speed
            });
            let Some(profile) = profile else { continue };

            let handle = device.open().map_err(LabError::Usb)?;

            self.handle = Some(Arc::new(handle));
            self.profile = Some(profile);

            match self.open_sequence() {
                Ok(()) => {
                    self.status.store(device_status::READY, Ordering::SeqCst);
                    info!(
                        "opened {} on bus {:03} device {:03}, firmware {}",
                        profile.model,
                        device.bus_number(),
                        device.address(),
                        self.version()
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.handle = None;
                    self.profile = None;
                    return Err(e);
                }
            }
        }

        Err(LabError::DeviceAbsent)
    }

    fn open_sequence(&mut self) -> Result<(), LabError> {
        let profile = self.profile.ok_or(LabError::DeviceAbsent)?;

        let version = self.read_fw_version()?;
        self.fw_version = version;

        if version.0 != REQUIRED_VERSION_MAJOR {
            return Err(LabError::FirmwareVersion {
                expected: REQUIRED_VERSION_MAJOR,
                found: format!("{}.{}", version.0, version.1),
            });
        }

        {
            let handle = self.handle.as_mut().ok_or(LabError::DeviceAbsent)?;
            let speed = handle.device().speed();
            if !matches!(speed, rusb::Speed::High | rusb::Speed::Super) {
                return Err(LabError::UsbSpeed);
            }
            // the data interface is claimed once, before the handle is shared
            let handle = Arc::get_mut(handle).ok_or(LabError::DeviceAbsent)?;
            handle.claim_interface(USB_INTERFACE).map_err(LabError::Usb)?;
        }

        let hw_status = self.read_hw_status()?;

        if hw_status & BM_FPGA_DONE == 0 {
            let firmware = match self.th_level {
                ThresholdLevel::Th3v3 => profile.fpga_bit33,
                ThresholdLevel::Th5v0 => profile.fpga_bit50,
            };

            self.fpga_upload(firmware)?;

            // deassert clear
            self.i2c_write(CTR0_ADDR, 0)?;
        } else {
            self.i2c_write(CTR0_ADDR, 0)?;

            let fpga_version = self.i2c_read(HDL_VERSION_ADDR)?;
            if fpga_version != HDL_VERSION && fpga_version != 0 {
                error!("incompatible FPGA version {fpga_version}");
                return Err(LabError::DeviceAbsent);
            }

            self.usb_write(&WrCmd::new(ctl::LED).with_data(&[0x01]))?;
        }

        if profile.feature_caps & caps::SECURITY != 0 {
            let mut encryption = [0u16; SECU_STEPS];
            let mut raw = [0u8; SECU_STEPS * 2];
            self.usb_read(RdCmd { dest: ctl::NVM, offset: SECU_EEP_ADDR, size: 16 }, &mut raw)?;
            for (word, bytes) in encryption.iter_mut().zip(raw.chunks_exact(2)) {
                *word = u16::from_le_bytes([bytes[0], bytes[1]]);
            }

            self.security_check(&encryption)?;
        }

        // threshold DAC: full scale maps to 3.3 V, MAX25 parts use a wider
        // input divider
        let vth = self.config.vth;
        let vth_value = if profile.feature_caps & caps::MAX25_VTH != 0 {
            (vth / 3.3 * (1.0 / 2.0) * 255.0) as u8
        } else {
            (vth / 3.3 * (1.5 / 2.5) * 255.0) as u8
        };
        self.i2c_write(VTH_ADDR, vth_value)?;

        if profile.feature_caps & caps::ADF4360 != 0 {
            self.adc_setup()?;
        }

        Ok(())
    }

    pub fn close(&mut self) {
        if self.handle.is_some() {
            self.stop();
            if let Some(mut handle) = self.handle.take() {
                if let Some(handle) = Arc::get_mut(&mut handle) {
                    let _ = handle.release_interface(USB_INTERFACE);
                }
            }
            self.profile = None;
            self.status.store(device_status::ABSENT, Ordering::SeqCst);
        }
    }

    /// Arm the FPGA and start the capture thread.
    pub fn start(&mut self, handler: StreamHandler) -> Result<(), LabError> {
        let profile = self.profile.ok_or(LabError::DeviceAbsent)?;

        self.status.store(device_status::START, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
        self.current_samples.store(0, Ordering::SeqCst);
        self.dropped_samples.store(0, Ordering::SeqCst);

        // stop any previous acquisition before arming
        self.usb_write(&WrCmd::new(ctl::STOP))?;

        self.fpga_setup()?;

        self.usb_write(&WrCmd::new(ctl::START))?;

        let thread_handle = self.handle.as_ref().ok_or(LabError::DeviceAbsent)?.clone();

        let channels = self.valid_channels();
        let sample_rate = self.config.sample_rate;
        let buffer_bytes = self.buffer_size(profile);
        let status = self.status.clone();
        let abort = self.abort.clone();
        let current_samples = self.current_samples.clone();

        self.stream_thread = Some(
            std::thread::Builder::new()
                .name("dsl-stream".to_owned())
                .spawn(move || {
                    stream_loop(
                        thread_handle,
                        channels,
                        sample_rate,
                        buffer_bytes,
                        status,
                        abort,
                        current_samples,
                        handler,
                    );
                })
                .expect("failed to spawn capture thread"),
        );

        debug!("acquisition started");

        Ok(())
    }

    pub fn stop(&mut self) {
        if self.handle.is_some() {
            let _ = self.usb_write(&WrCmd::new(ctl::STOP));
        }

        self.abort.store(true, Ordering::SeqCst);

        if let Some(thread) = self.stream_thread.take() {
            let _ = thread.join();
        }

        self.status.store(device_status::STOP, Ordering::SeqCst);
    }

    pub fn pause(&mut self) -> Result<(), LabError> {
        if self.status.load(Ordering::SeqCst) != device_status::DATA {
            return Err(LabError::DeviceAbsent);
        }
        let _ = self.usb_write(&WrCmd::new(ctl::STOP));
        self.abort.store(true, Ordering::SeqCst);
        if let Some(thread) = self.stream_thread.take() {
            let _ = thread.join();
        }
        self.status.store(device_status::PAUSE, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&mut self, handler: StreamHandler) -> Result<(), LabError> {
        if self.status.load(Ordering::SeqCst) != device_status::PAUSE {
            return Err(LabError::DeviceAbsent);
        }
        self.start(handler)
    }

    /// Samples are captured in aligned atoms; round the budget up.
    pub fn capture_samples(&self) -> u64 {
        (self.config.limit_samples + SAMPLES_ALIGN) & !SAMPLES_ALIGN
    }

    pub fn capture_bytes(&self) -> u64 {
        self.capture_samples() / ATOMIC_SAMPLES * self.valid_channels() as u64 * ATOMIC_SIZE
    }

    fn buffer_size(&self, profile: &DslProfile) -> usize {
        // enough for 10-20 ms of data, rounded to the transfer granularity
        let ms = if profile.usb_speed == rusb::Speed::Super { 10 } else { 20 };
        let size = (ms * self.bytes_per_ms()) as usize;
        let align = if profile.usb_speed == rusb::Speed::Super { 1024 } else { 512 };
        ((size + align - 1) / align) * align
    }

    pub fn bytes_per_ms(&self) -> u64 {
        (u64::from(self.config.sample_rate) * self.valid_channels() as u64).div_ceil(8 * 1000)
    }

    pub fn total_transfers(&self, profile: &DslProfile) -> usize {
        // the transfer pool should cover roughly 100 ms of data
        let total_ms: u64 = if profile.usb_speed == rusb::Speed::Super { 40 } else { 100 };
        let count =
            (total_ms * self.bytes_per_ms()).div_ceil(self.buffer_size(profile) as u64) as usize;
        count.min(NUM_SIMUL_TRANSFERS)
    }

    fn fpga_setup(&mut self) -> Result<(), LabError> {
        let profile = self.profile.ok_or(LabError::DeviceAbsent)?;

        info!("arming FPGA to start acquisition");

        let mut setting = FpgaSetting::default();

        let stream = self.config.stream;
        let sample_rate = u64::from(self.config.sample_rate);

        setting.mode |= u16::from(sample_rate == profile.half_samplerate) << mode_bit::HALF_MODE;
        setting.mode |=
            u16::from(sample_rate == profile.quarter_samplerate) << mode_bit::QUAR_MODE;
        setting.mode |= u16::from(self.bytes_per_ms() < 1024) << mode_bit::SLOW_ACQ;
        setting.mode |= u16::from(stream) << mode_bit::STREAM_MODE;
        setting.mode |= u16::from(self.config.test_mode) << mode_bit::INT_TEST;

        // sample rate divider against the hardware base clock
        let div = (profile.max_samplerate).div_ceil(sample_rate);
        setting.div_l = (div & 0xFFFF) as u16;
        setting.div_h = (div >> 16) as u16;

        // capture counters: hardware units of 16 logic samples
        let capture = self.capture_samples();
        setting.cnt_l = ((capture >> 4) & 0xFFFF) as u16;
        setting.cnt_h = (capture >> 20) as u16;
        setting.dso_cnt_l = (capture & 0xFFFF) as u16;
        setting.dso_cnt_h = (capture >> 16) as u16;

        // trigger position pinned to the first atom in stream mode
        let tpos = ATOMIC_SAMPLES;
        setting.tpos_l = (tpos & 0xFFFF) as u16;
        setting.tpos_h = (tpos >> 16) as u16;

        let valid = self.valid_channels() as u16;
        setting.trig_glb = (valid & 0x1F) << 8;

        for channel in &self.config.channels {
            if *channel < 16 {
                setting.ch_en_l |= 1 << channel;
            } else {
                setting.ch_en_h |= 1 << (channel - 16);
            }
        }

        // announce the bulk setting block
        let arm_words = (FpgaSetting::encoded_len() / 2) as u32;
        self.usb_write(&WrCmd::new(ctl::BULK_WR).with_data(&[
            arm_words as u8,
            (arm_words >> 8) as u8,
            (arm_words >> 16) as u8,
        ]))?;

        self.wait_status(BM_SYS_CLR)?;

        let bytes = setting.to_bytes();
        self.bulk_write(&bytes)?;

        if profile.feature_caps & caps::LA_CH32 != 0 {
            let ext = FpgaSettingExt32::default().to_bytes();
            self.bulk_write(&ext)?;
        }

        self.usb_write(&WrCmd::new(ctl::INTRDY).with_data(&[0x01]))?;

        self.wait_status(BM_GPIF_DONE)?;

        info!("FPGA setup complete");

        Ok(())
    }

    fn fpga_upload(&mut self, firmware: &str) -> Result<(), LabError> {
        let path = if self.config.firmware_path.as_os_str().is_empty() {
            PathBuf::from("./firmware").join(firmware)
        } else {
            self.config.firmware_path.join(firmware)
        };

        info!("uploading bitstream {} to FPGA", path.display());

        let bitstream =
            fs::read(&path).map_err(|e| LabError::FirmwareFile(format!("{}: {e}", path.display())))?;

        // PROG_B low, LEDs off, PROG_B high, wait for INIT_B
        self.usb_write(&WrCmd::new(ctl::PROG_B).with_data(&[0x00]))?;
        self.usb_write(&WrCmd::new(ctl::LED).with_data(&[0x00]))?;
        self.usb_write(&WrCmd::new(ctl::PROG_B).with_data(&[0x01]))?;
        self.wait_status(BM_FPGA_INIT_B)?;

        // announce the stream length, then push the bitstream
        self.usb_write(&WrCmd::new(ctl::INTRDY).with_data(&[0x00]))?;
        self.usb_write(&WrCmd::new(ctl::BULK_WR).with_data(&[
            bitstream.len() as u8,
            (bitstream.len() >> 8) as u8,
            (bitstream.len() >> 16) as u8,
        ]))?;

        self.bulk_write(&bitstream)?;

        self.usb_write(&WrCmd::new(ctl::INTRDY).with_data(&[0x01]))?;
        self.wait_status(BM_GPIF_DONE)?;
        self.usb_write(&WrCmd::new(ctl::INTRDY).with_data(&[0x00]))?;
        self.wait_status(BM_FPGA_DONE)?;

        self.usb_write(&WrCmd::new(ctl::LED).with_data(&[0x01]))?;
        self.usb_write(&WrCmd::new(ctl::WORDWIDE).with_data(&[0x01]))?;

        info!("bitstream upload done, {} bytes sent", bitstream.len());

        Ok(())
    }

    /// Challenge/response against the on-board authenticator: every round
    /// reads a zero word and writes the next NVM-seeded challenge.
    fn security_check(&mut self, encryption: &[u16; SECU_STEPS]) -> Result<(), LabError> {
        info!("performing security check");

        self.security_reset()?;

        if self.security_status(BM_SECU_PASS)? {
            return Err(LabError::SecurityCheck);
        }

        self.security_write(SECU_START, 0)?;

        let mut try_count = SECU_TRY_CNT;

        for step in (0..SECU_STEPS).rev() {
            if self.security_status(BM_SECU_PASS)? {
                return Err(LabError::SecurityCheck);
            }

            while !self.security_status(BM_SECU_READY)? {
                if try_count == 0 {
                    error!("security engine never became ready");
                    return Err(LabError::SecurityCheck);
                }
                try_count -= 1;
            }

            if self.security_read()? != 0 {
                return Err(LabError::SecurityCheck);
            }

            self.security_write(SECU_CHECK, encryption[step])?;
        }

        info!("security check pass");

        Ok(())
    }

    fn security_reset(&mut self) -> Result<(), LabError> {
        self.i2c_write(SEC_CTRL_ADDR, 0)?;
        self.i2c_write(SEC_CTRL_ADDR + 1, 0)?;
        std::thread::sleep(Duration::from_millis(10));
        self.i2c_write(SEC_CTRL_ADDR, 1)?;
        self.i2c_write(SEC_CTRL_ADDR + 1, 0)?;
        Ok(())
    }

    fn security_read(&mut self) -> Result<u16, LabError> {
        let high = self.i2c_read(SEC_DATA_ADDR + 1)?;
        let low = self.i2c_read(SEC_DATA_ADDR)?;
        Ok(u16::from_le_bytes([low, high]))
    }

    fn security_write(&mut self, cmd: u16, data: u16) -> Result<(), LabError> {
        self.i2c_write(SEC_DATA_ADDR, (data & 0xFF) as u8)?;
        self.i2c_write(SEC_DATA_ADDR + 1, (data >> 8) as u8)?;
        self.i2c_write(SEC_CTRL_ADDR, (cmd & 0xFF) as u8)?;
        self.i2c_write(SEC_CTRL_ADDR + 1, (cmd >> 8) as u8)?;
        Ok(())
    }

    fn security_status(&mut self, mask: u8) -> Result<bool, LabError> {
        Ok(self.i2c_read(SEC_CTRL_ADDR)? & mask != 0)
    }

    fn adc_setup(&mut self) -> Result<(), LabError> {
        // fixed 500 MHz clock bring-up sequence
        const ADC_CLK_INIT_500M: &[(u8, u64, &[u8])] =
            &[(ADCC_ADDR, 0, &[0x01, 0x00]), (ADCC_ADDR, 10, &[0x03, 0x2C])];

        info!("configuring ADC clock");

        for (dest, delay, bytes) in ADC_CLK_INIT_500M {
            if *delay > 0 {
                std::thread::sleep(Duration::from_millis(*delay));
            }
            for byte in *bytes {
                self.i2c_write(*dest, *byte)?;
            }
        }

        Ok(())
    }

    fn wait_status(&self, flags: u8) -> Result<(), LabError> {
        let start = std::time::Instant::now();
        loop {
            let status = self.read_hw_status()?;
            if status & flags != 0 {
                return Ok(());
            }
            if start.elapsed() > Duration::from_millis(1000) {
                return Err(LabError::Usb(rusb::Error::Timeout));
            }
        }
    }

    fn read_fw_version(&self) -> Result<(u8, u8), LabError> {
        let mut version = [0u8; 2];
        self.usb_read(RdCmd { dest: ctl::FW_VERSION, offset: 0, size: 2 }, &mut version)?;
        Ok((version[0], version[1]))
    }

    fn read_hw_status(&self) -> Result<u8, LabError> {
        let mut status = [0u8; 1];
        self.usb_read(RdCmd { dest: ctl::HW_STATUS, offset: 0, size: 1 }, &mut status)?;
        Ok(status[0])
    }

    fn i2c_read(&self, addr: u8) -> Result<u8, LabError> {
        let mut value = [0u8; 1];
        self.usb_read(
            RdCmd { dest: ctl::I2C_STATUS, offset: u16::from(addr), size: 1 },
            &mut value,
        )?;
        Ok(value[0])
    }

    fn i2c_write(&self, addr: u8, value: u8) -> Result<(), LabError> {
        debug!("i2c write {addr:#04x} <- {value:#04x}");
        self.usb_write(
            &WrCmd::new(ctl::I2C_REG).with_offset(u16::from(addr)).with_data(&[value]),
        )
    }

    fn usb_write(&self, cmd: &WrCmd) -> Result<(), LabError> {
        let handle = self.handle.as_ref().ok_or(LabError::DeviceAbsent)?;
        let request_type =
            rusb::request_type(rusb::Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Device);
        handle
            .write_control(request_type, CMD_CTL_WR, 0, 0, &cmd.to_bytes(), CTRL_TIMEOUT)
            .map_err(LabError::Usb)?;
        Ok(())
    }

    fn usb_read(&self, cmd: RdCmd, data: &mut [u8]) -> Result<(), LabError> {
        let handle = self.handle.as_ref().ok_or(LabError::DeviceAbsent)?;
        let out_type =
            rusb::request_type(rusb::Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Device);
        let in_type =
            rusb::request_type(rusb::Direction::In, rusb::RequestType::Vendor, rusb::Recipient::Device);

        handle
            .write_control(out_type, CMD_CTL_RD_PRE, 0, 0, &cmd.header_bytes(), CTRL_TIMEOUT)
            .map_err(LabError::Usb)?;
        handle
            .read_control(in_type, CMD_CTL_RD, 0, 0, data, CTRL_TIMEOUT)
            .map_err(LabError::Usb)?;
        Ok(())
    }

    fn bulk_write(&self, data: &[u8]) -> Result<(), LabError> {
        let handle = self.handle.as_ref().ok_or(LabError::DeviceAbsent)?;
        let written = handle.write_bulk(EP_BULK_OUT, data, CTRL_TIMEOUT).map_err(LabError::Usb)?;
        if written != data.len() {
            warn!("short bulk write: {written} of {}", data.len());
            return Err(LabError::Usb(rusb::Error::Io));
        }
        Ok(())
    }
}

impl Drop for DslDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Capture loop: one header read reporting the trigger position, then data
/// reads recycled until the capture aborts or fails.
#[allow(clippy::too_many_arguments)]
fn stream_loop(
    handle: Arc<DeviceHandle<GlobalContext>>,
    channels: usize,
    sample_rate: u32,
    buffer_bytes: usize,
    status: Arc<AtomicU8>,
    abort: Arc<AtomicBool>,
    current_samples: Arc<AtomicU64>,
    handler: StreamHandler,
) {
    let mut header = [0u8; 512];
    match handle.read_bulk(EP_BULK_IN, &mut header, HEADER_TIMEOUT) {
        Ok(n) if n >= 24 => {
            let check_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if check_id == TRIG_CHECKID {
                debug!("capture header confirmed, trigger position report received");
                status.store(device_status::DATA, Ordering::SeqCst);
            } else {
                error!("capture header check id mismatch: {check_id:#010x}");
                status.store(device_status::ERROR, Ordering::SeqCst);
                return;
            }
        }
        Ok(n) => {
            error!("short capture header: {n} bytes");
            status.store(device_status::ERROR, Ordering::SeqCst);
            return;
        }
        Err(rusb::Error::Timeout) => {
            // slow triggers are not fatal, data may still follow
            status.store(device_status::DATA, Ordering::SeqCst);
        }
        Err(e) => {
            error!("capture header transfer failed: {e}");
            status.store(device_status::ERROR, Ordering::SeqCst);
            return;
        }
    }

    let mut interleaver = Interleaver::new(channels, sample_rate);
    let mut raw = vec![0u8; buffer_bytes];

    while !abort.load(Ordering::SeqCst) {
        match handle.read_bulk(EP_BULK_IN, &mut raw, DATA_TIMEOUT) {
            Ok(0) => continue,
            Ok(n) => {
                let buffers = interleaver.push(&raw[..n]);
                current_samples.store(interleaver.total_samples(), Ordering::SeqCst);

                for buffer in buffers {
                    if !handler(buffer) {
                        warn!("capture stopped by handler, aborting");
                        status.store(device_status::ABORT, Ordering::SeqCst);
                        return;
                    }
                }
            }
            // timeouts retry silently while the device gathers data
            Err(rusb::Error::Timeout) => continue,
            Err(rusb::Error::NoDevice) | Err(rusb::Error::Pipe) => {
                error!("device vanished during capture");
                status.store(device_status::ERROR, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                if abort.load(Ordering::SeqCst) {
                    return;
                }
                error!("data transfer failed: {e}");
                status.store(device_status::ERROR, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Converts the raw byte stream into interleaved per-buffer sample blocks.
///
/// Full buffers within one transfer are independent, so they transpose in
/// parallel and are ordered by offset before being handed out. A trailing
/// partial block is carried into the next transfer.
pub struct Interleaver {
    channels: usize,
    sample_rate: u32,
    /// Raw bytes not yet covering a full buffer
    pending: Vec<u8>,
    /// Per-channel sample offset of the next emitted buffer
    total_samples: u64,
}

impl Interleaver {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Interleaver {
            channels: channels.max(1),
            sample_rate,
            pending: Vec::new(),
            total_samples: 0,
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Interleaved floats per emitted buffer: a whole number of 64-sample
    /// atom blocks close to the nominal buffer size.
    fn buffer_floats(&self) -> usize {
        let block = self.channels * 64;
        let size = CHANNEL_BUFFER_SIZE - (CHANNEL_BUFFER_SIZE % block);
        size.max(block)
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<SignalBuffer> {
        self.pending.extend_from_slice(data);

        let floats_per_buffer = self.buffer_floats();
        let bytes_per_buffer = floats_per_buffer / 8;
        let samples_per_buffer = (floats_per_buffer / self.channels) as u64;

        let complete = self.pending.len() / bytes_per_buffer;
        if complete == 0 {
            return Vec::new();
        }

        let channels = self.channels;
        let sample_rate = self.sample_rate;
        let base_offset = self.total_samples;

        let spans: Vec<(usize, &[u8])> = self
            .pending
            .chunks_exact(bytes_per_buffer)
            .take(complete)
            .enumerate()
            .collect();

        let mut buffers: Vec<SignalBuffer> = spans
            .par_iter()
            .map(|(k, span)| {
                let offset = base_offset + *k as u64 * samples_per_buffer;

                let mut buffer = SignalBuffer::new(
                    floats_per_buffer,
                    channels,
                    1,
                    sample_rate,
                    offset,
                    0,
                    SignalType::LogicSamples,
                );

                {
                    let target = buffer.push(floats_per_buffer).expect("buffer sized to fit");
                    let block_bytes = channels * 8;
                    for (b, block) in span.chunks_exact(block_bytes).enumerate() {
                        let start = b * channels * 64;
                        transpose_block(&mut target[start..start + channels * 64], channels, block);
                    }
                }

                buffer.flip();
                buffer
            })
            .collect();

        // parallel interleave preserves order, keep the contract explicit
        buffers.sort_by_key(SignalBuffer::offset);

        self.pending.drain(..complete * bytes_per_buffer);
        self.total_samples += complete as u64 * samples_per_buffer;

        buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_budget_is_atom_aligned() {
        let mut config = DslConfig::default();
        config.limit_samples = 1000;
        let device = DslDevice::new(config);

        assert_eq!(device.capture_samples(), 1024);
        assert_eq!(device.capture_bytes(), 1024 / 64 * 1 * 8);
    }

    #[test]
    fn test_mode_blocks_sample_rate_changes() {
        let mut config = DslConfig::default();
        config.test_mode = true;
        let mut device = DslDevice::new(config);

        assert!(matches!(device.set_sample_rate(1_000_000), Err(LabError::TestModePolicy)));
    }

    #[test]
    fn transfer_sizing_covers_stream_rates() {
        let mut config = DslConfig::default();
        config.sample_rate = 50_000_000;
        config.channels = vec![0, 1];
        let device = DslDevice::new(config);
        let profile = &DSL_PROFILES[0];

        // 50 Msps * 2 ch / 8 = 12.5 MB/s -> 12500 B/ms
        assert_eq!(device.bytes_per_ms(), 12_500);

        let size = device.buffer_size(profile);
        assert_eq!(size % 512, 0);
        assert!(size >= 20 * 12_500);

        let transfers = device.total_transfers(profile);
        assert!(transfers >= 1 && transfers <= NUM_SIMUL_TRANSFERS);
    }

    #[test]
    fn interleaver_emits_ordered_full_buffers() {
        let channels = 2usize;
        let mut interleaver = Interleaver::new(channels, 10_000_000);

        let floats = interleaver.buffer_floats();
        let bytes_per_buffer = floats / 8;

        // three and a half buffers: channel 0 bytes carry 0xAA, channel 1
        // bytes carry 0x55 (eight consecutive bytes per channel per block)
        let raw: Vec<u8> = (0..bytes_per_buffer * 7 / 2)
            .map(|i| if (i % 16) < 8 { 0xAA } else { 0x55 })
            .collect();

        let buffers = interleaver.push(&raw);
        assert_eq!(buffers.len(), 3);

        // offsets are strictly increasing by a whole buffer of samples
        let per_buffer = (floats / channels) as u64;
        for (k, buffer) in buffers.iter().enumerate() {
            assert_eq!(buffer.offset(), k as u64 * per_buffer);
            assert_eq!(buffer.stride(), channels);
            assert_eq!(buffer.elements(), floats);
            assert!(buffer.is_full());
        }

        // channel 0 carries 0xAA (samples 0,1,0,1...), channel 1 carries 0x55
        let first = &buffers[0];
        assert_eq!(first.sample(0), 0.0); // ch0 sample0 = bit0 of 0xAA
        assert_eq!(first.sample(1), 1.0); // ch1 sample0 = bit0 of 0x55
        assert_eq!(first.sample(2), 1.0); // ch0 sample1 = bit1 of 0xAA
        assert_eq!(first.sample(3), 0.0); // ch1 sample1 = bit1 of 0x55

        // remainder carries over; topping it up completes buffer 4
        let missing = bytes_per_buffer / 2;
        let buffers = interleaver.push(&vec![0u8; missing]);
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].offset(), 3 * per_buffer);
        assert_eq!(interleaver.total_samples(), 4 * per_buffer);
    }
}

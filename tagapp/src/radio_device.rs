//! Radio device worker: drives an `rtl_sdr` capture process, converts its
//! raw byte stream into IQ and magnitude buffers and trims receiver gain to
//! the observed signal level.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use tagcore::buffer::{SignalBuffer, SignalType};

use crate::event::BlockingQueue;
use crate::event::{command, reject, Bus, Event, Subject};
use crate::task::TaskContext;
use crate::worker::{wait, Worker};

/// Raw bytes per capture chunk (one byte per I/Q component).
const CHUNK_BYTES: usize = 65536;

/// Auto gain thresholds on the running signal average.
const LOWER_GAIN_THRESHOLD: f32 = 0.05;
const UPPER_GAIN_THRESHOLD: f32 = 0.25;
const MAX_GAIN_STEP: i32 = 6;

mod status {
    pub const IDLE: i32 = 0;
    pub const STREAMING: i32 = 1;
    pub const ABSENT: i32 = 3;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadioConfig {
    enabled: Option<bool>,
    center_freq: Option<u64>,
    sample_rate: Option<u32>,
    tuner_agc: Option<bool>,
    mixer_agc: Option<bool>,
    bias_tee: Option<bool>,
    direct_sampling: Option<u32>,
    gain_value: Option<i32>,
    gain_mode: Option<i32>,
}

#[derive(Debug, Clone)]
struct RadioSettings {
    center_freq: u64,
    sample_rate: u32,
    tuner_agc: bool,
    mixer_agc: bool,
    bias_tee: bool,
    direct_sampling: u32,
    gain_value: i32,
    gain_mode: i32,
}

impl Default for RadioSettings {
    fn default() -> Self {
        RadioSettings {
            center_freq: 13_560_000,
            sample_rate: 10_000_000,
            tuner_agc: false,
            mixer_agc: false,
            bias_tee: false,
            direct_sampling: 0,
            gain_value: 3,
            gain_mode: 0,
        }
    }
}

pub struct RadioDeviceTask {
    task: TaskContext,

    iq_stream: Subject<SignalBuffer>,
    raw_stream: Subject<SignalBuffer>,

    chunk_queue: Arc<BlockingQueue<Vec<u8>>>,

    settings: RadioSettings,
    enabled: bool,
    state: i32,

    capture: Option<Child>,
    sample_offset: u64,

    /// Smoothed magnitude for the gain loop
    signal_average: f32,
    /// Buffers to skip before the next gain adjustment
    gain_lockout: u32,
}

impl RadioDeviceTask {
    pub fn new(bus: &Bus) -> Self {
        RadioDeviceTask {
            task: TaskContext::new(bus, "worker.RadioDevice", "radio.receiver"),
            iq_stream: bus.subject("radio.signal.iq"),
            raw_stream: bus.subject("radio.signal.raw"),
            chunk_queue: Arc::new(BlockingQueue::new()),
            settings: RadioSettings::default(),
            enabled: false,
            state: status::IDLE,
            capture: None,
            sample_offset: 0,
            signal_average: 0.0,
            gain_lockout: 0,
        }
    }

    fn start_device(&mut self, event: &Event) {
        if !self.enabled {
            warn!("receiver is disabled");
            event.reject(reject::TASK_DISABLED, "receiver is disabled");
            return;
        }

        match self.spawn_capture() {
            Ok(()) => {
                event.resolve(None);
                self.update_device_status(status::STREAMING);
            }
            Err(message) => {
                warn!("{message}");
                event.reject(reject::TASK_DISABLED, message);
                self.update_device_status(status::ABSENT);
            }
        }
    }

    fn spawn_capture(&mut self) -> Result<(), String> {
        self.stop_capture();

        let mut args: Vec<String> = vec![
            "-f".to_owned(),
            self.settings.center_freq.to_string(),
            "-s".to_owned(),
            self.settings.sample_rate.to_string(),
        ];

        if self.settings.gain_mode != 0 || self.settings.tuner_agc {
            args.push("-g".to_owned());
            args.push(self.settings.gain_value.to_string());
        }
        if self.settings.bias_tee {
            args.push("-T".to_owned());
        }
        if self.settings.direct_sampling != 0 {
            args.push("-D".to_owned());
            args.push(self.settings.direct_sampling.to_string());
        }

        // stream to stdout
        args.push("-".to_owned());

        let mut child = Command::new("rtl_sdr")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to launch rtl_sdr: {e}"))?;

        let Some(mut stdout) = child.stdout.take() else {
            return Err("rtl_sdr provides no output stream".to_owned());
        };

        info!(
            "capture started at {} Hz, {} sps",
            self.settings.center_freq, self.settings.sample_rate
        );

        let queue = self.chunk_queue.clone();
        std::thread::spawn(move || {
            let mut chunk = vec![0u8; CHUNK_BYTES];
            while let Ok(n) = stdout.read(&mut chunk) {
                if n == 0 {
                    break;
                }
                queue.add(chunk[..n].to_vec());
            }
            // an empty chunk marks the end of the capture
            queue.add(Vec::new());
        });

        self.capture = Some(child);
        self.sample_offset = 0;
        self.signal_average = 0.0;
        self.gain_lockout = 0;

        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(mut child) = self.capture.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn stop_device(&mut self, event: &Event) {
        self.stop_capture();
        self.chunk_queue.clear();

        self.iq_stream.publish(SignalBuffer::eof(SignalType::RawIq));
        self.raw_stream.publish(SignalBuffer::eof(SignalType::RawReal));

        event.resolve(None);
        self.update_device_status(status::IDLE);
    }

    fn configure_device(&mut self, event: &Event) {
        let Some(data) = event.data() else {
            event.reject(reject::INVALID_CONFIG, "invalid config data");
            return;
        };

        let config: RadioConfig = match serde_json::from_str(data) {
            Ok(config) => config,
            Err(_) => {
                event.reject(reject::INVALID_CONFIG, "invalid config data");
                return;
            }
        };

        info!("change config: {data}");

        let old_rate = self.settings.sample_rate;

        if let Some(enabled) = config.enabled {
            self.enabled = enabled;
        }
        if let Some(freq) = config.center_freq {
            self.settings.center_freq = freq;
        }
        if let Some(rate) = config.sample_rate {
            self.settings.sample_rate = rate;
        }
        if let Some(agc) = config.tuner_agc {
            self.settings.tuner_agc = agc;
        }
        if let Some(agc) = config.mixer_agc {
            self.settings.mixer_agc = agc;
        }
        if let Some(bias) = config.bias_tee {
            self.settings.bias_tee = bias;
        }
        if let Some(direct) = config.direct_sampling {
            self.settings.direct_sampling = direct;
        }
        if let Some(gain) = config.gain_value {
            self.settings.gain_value = gain;
        }
        if let Some(mode) = config.gain_mode {
            self.settings.gain_mode = mode;
        }

        // a rate change cannot be applied to a live capture; stop and let
        // the next start pick it up
        if self.capture.is_some() && self.settings.sample_rate != old_rate {
            info!("sample rate changed, stopping capture");
            self.stop_capture();
            self.update_device_status(status::IDLE);
        }

        event.resolve(None);
        self.update_device_status(self.state);
    }

    /// Convert one raw chunk into IQ and magnitude buffers.
    fn process_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            info!("capture stream finished");
            self.iq_stream.publish(SignalBuffer::eof(SignalType::RawIq));
            self.raw_stream.publish(SignalBuffer::eof(SignalType::RawReal));
            self.stop_capture();
            self.update_device_status(status::IDLE);
            return;
        }

        let pairs = chunk.len() / 2;
        if pairs == 0 {
            return;
        }

        let mut iq = SignalBuffer::new(
            pairs * 2,
            2,
            1,
            self.settings.sample_rate,
            self.sample_offset,
            0,
            SignalType::RawIq,
        );
        let mut magnitude = SignalBuffer::new(
            pairs,
            1,
            1,
            self.settings.sample_rate,
            self.sample_offset,
            0,
            SignalType::RawReal,
        );

        let mut level = 0.0f32;

        for pair in chunk.chunks_exact(2) {
            // unsigned 8-bit samples centred on 127.5
            let i = (f32::from(pair[0]) - 127.5) / 127.5;
            let q = (f32::from(pair[1]) - 127.5) / 127.5;
            let value = (i * i + q * q).sqrt();

            iq.put(i).put(q);
            magnitude.put(value);
            level += value;
        }

        iq.flip();
        magnitude.flip();

        self.sample_offset += pairs as u64;
        self.signal_average = level / pairs as f32;

        self.adjust_gain();

        self.iq_stream.publish(iq);
        self.raw_stream.publish(magnitude);
    }

    /// Software gain loop for gainMode 0: step gain towards the usable range,
    /// one step per buffer at most.
    fn adjust_gain(&mut self) {
        if self.settings.gain_mode != 0 {
            return;
        }

        if self.gain_lockout > 0 {
            self.gain_lockout -= 1;
            return;
        }

        if self.signal_average < LOWER_GAIN_THRESHOLD && self.settings.gain_value < MAX_GAIN_STEP
        {
            self.settings.gain_value += 1;
            self.gain_lockout = 1;
            info!("increase gain {}", self.settings.gain_value);
        } else if self.signal_average > UPPER_GAIN_THRESHOLD && self.settings.gain_value > 0 {
            self.settings.gain_value -= 1;
            self.gain_lockout = 1;
            info!("decrease gain {}", self.settings.gain_value);
        }
    }

    fn update_device_status(&mut self, state: i32) {
        self.state = state;

        let data = json!({
            "status": if self.enabled {
                if self.capture.is_some() { "streaming" } else { "idle" }
            } else {
                "disabled"
            },
            "centerFreq": self.settings.center_freq,
            "sampleRate": self.settings.sample_rate,
            "tunerAgc": self.settings.tuner_agc,
            "mixerAgc": self.settings.mixer_agc,
            "biasTee": self.settings.bias_tee,
            "directSampling": self.settings.direct_sampling,
            "gainMode": self.settings.gain_mode,
            "gainValue": self.settings.gain_value,
            "samplesRead": self.sample_offset,
        });

        self.task.update_status(state, data);
    }
}

impl Worker for RadioDeviceTask {
    fn name(&self) -> &str {
        "RadioDeviceTask"
    }

    fn stop(&mut self) {
        self.stop_capture();
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(None) {
            debug!("radio command [{}]", event.code);

            match event.code {
                command::START => self.start_device(&event),
                command::STOP => self.stop_device(&event),
                command::QUERY => {
                    event.resolve(None);
                    self.update_device_status(self.state);
                }
                command::CONFIGURE => self.configure_device(&event),
                _ => {
                    warn!("unknown radio command {}", event.code);
                    event.reject(reject::UNKNOWN_COMMAND, "unknown command");
                }
            }
        }

        if self.capture.is_some() {
            if let Some(chunk) = self.chunk_queue.get(Some(Duration::from_millis(50))) {
                self.process_chunk(&chunk);
            }
        } else {
            wait(100);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn chunks_become_iq_and_magnitude_buffers() {
        let bus = Bus::new();
        let mut task = RadioDeviceTask::new(&bus);

        let iq_seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let raw_seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = iq_seen.clone();
        let _iq = bus
            .subject::<SignalBuffer>("radio.signal.iq")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));
        let sink = raw_seen.clone();
        let _raw = bus
            .subject::<SignalBuffer>("radio.signal.raw")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));

        // I at max, Q centred: magnitude is one
        let chunk = vec![255u8, 128, 255, 128, 255, 128, 255, 128];
        task.process_chunk(&chunk);

        let iq_seen = iq_seen.lock().unwrap();
        let raw_seen = raw_seen.lock().unwrap();

        assert_eq!(iq_seen.len(), 1);
        assert_eq!(iq_seen[0].stride(), 2);
        assert_eq!(iq_seen[0].elements(), 8);

        assert_eq!(raw_seen.len(), 1);
        assert_eq!(raw_seen[0].elements(), 4);
        assert!((raw_seen[0].sample(0) - 1.0).abs() < 0.01);
        assert_eq!(task.sample_offset, 4);
    }

    #[test]
    fn auto_gain_steps_towards_usable_range() {
        let bus = Bus::new();
        let mut task = RadioDeviceTask::new(&bus);

        task.settings.gain_mode = 0;
        task.settings.gain_value = 3;

        // weak signal: gain goes up, then locks out for one buffer
        task.signal_average = 0.01;
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, 4);
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, 4);
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, 5);

        // strong signal: gain steps back down
        task.signal_average = 0.9;
        task.adjust_gain();
        task.adjust_gain(); // lockout
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, 3);

        // manual gain mode never adjusts
        task.settings.gain_mode = 1;
        task.signal_average = 0.01;
        let before = task.settings.gain_value;
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, before);
    }

    #[test]
    fn gain_saturates_at_bounds() {
        let bus = Bus::new();
        let mut task = RadioDeviceTask::new(&bus);

        task.settings.gain_value = MAX_GAIN_STEP;
        task.signal_average = 0.0;
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, MAX_GAIN_STEP);

        task.settings.gain_value = 0;
        task.signal_average = 1.0;
        task.adjust_gain();
        assert_eq!(task.settings.gain_value, 0);
    }
}

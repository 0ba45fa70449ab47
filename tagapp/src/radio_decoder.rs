//! Radio decoder worker: feeds queued magnitude buffers through the NFC
//! decoder and publishes decoded frames, optionally mirroring each frame as
//! one JSON line on stdout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use tagcore::buffer::SignalBuffer;
use tagcore::decoder::{NfcDecoder, TechConfig};
use tagcore::frame::{frame_flags, FrameType, RawFrame, TechType};

use crate::event::BlockingQueue;
use crate::event::{command, reject, Bus, Event, Subject, Subscription};
use crate::task::TaskContext;
use crate::worker::{wait, Worker};

mod status {
    pub const IDLE: i32 = 0;
    pub const STREAMING: i32 = 1;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TechSection {
    enabled: Option<bool>,
    correlation_threshold: Option<f32>,
    minimum_modulation_deep: Option<f32>,
    maximum_modulation_deep: Option<f32>,
}

impl TechSection {
    fn apply(&self, config: &mut TechConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(threshold) = self.correlation_threshold {
            config.correlation_threshold = threshold;
        }
        if let Some(min) = self.minimum_modulation_deep {
            config.minimum_modulation_deep = min;
        }
        if let Some(max) = self.maximum_modulation_deep {
            config.maximum_modulation_deep = max;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolSection {
    nfca: Option<TechSection>,
    nfcb: Option<TechSection>,
    nfcf: Option<TechSection>,
    nfcv: Option<TechSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecoderConfig {
    enabled: Option<bool>,
    stream_time: Option<f64>,
    debug_enabled: Option<bool>,
    power_level_threshold: Option<f32>,
    sample_rate: Option<u32>,
    protocol: Option<ProtocolSection>,
}

pub struct RadioDecoderTask {
    task: TaskContext,

    frame_stream: Subject<RawFrame>,

    signal_queue: Arc<BlockingQueue<SignalBuffer>>,
    streaming: Arc<AtomicBool>,
    _signal_subscription: Subscription<SignalBuffer>,

    decoder: NfcDecoder,
    enabled: bool,
    print_frames: bool,
    state: i32,
}

impl RadioDecoderTask {
    pub fn new(bus: &Bus, print_frames: bool) -> Self {
        let task = TaskContext::new(bus, "worker.RadioDecoder", "radio.decoder");

        let signal_queue = Arc::new(BlockingQueue::new());
        let streaming = Arc::new(AtomicBool::new(false));

        // buffers are only queued while the decoder is streaming
        let queue = signal_queue.clone();
        let gate = streaming.clone();
        let signal_subscription = bus
            .subject::<SignalBuffer>("radio.signal.raw")
            .subscribe(move |buffer: &SignalBuffer| {
                if gate.load(Ordering::SeqCst) {
                    queue.add(buffer.clone());
                }
            });

        if print_frames {
            println!("# Frame printing enabled, NFC frames will be printed here");
            let _ = std::io::stdout().flush();
        }

        RadioDecoderTask {
            task,
            frame_stream: bus.subject("radio.decoder.frame"),
            signal_queue,
            streaming,
            _signal_subscription: signal_subscription,
            decoder: NfcDecoder::new(),
            enabled: false,
            print_frames,
            state: status::IDLE,
        }
    }

    fn start_decoder(&mut self, event: &Event) {
        if !self.enabled {
            warn!("decoder is disabled");
            event.reject(reject::TASK_DISABLED, "decoder is disabled");
            return;
        }

        info!("start frame decoding with {} pending buffers", self.signal_queue.len());

        self.signal_queue.clear();
        self.decoder.initialize();

        event.resolve(None);
        self.set_state(status::STREAMING);
    }

    fn stop_decoder(&mut self, event: &Event) {
        // stop is best effort and always resolves
        info!("stop frame decoding with {} pending buffers", self.signal_queue.len());

        self.signal_queue.clear();

        // flush any partial state before going idle
        let mut eof = SignalBuffer::eof(tagcore::buffer::SignalType::RawReal);
        for frame in self.decoder.next_frames(&mut eof) {
            self.frame_stream.publish(frame);
        }

        event.resolve(None);
        self.set_state(status::IDLE);
    }

    fn configure_decoder(&mut self, event: &Event) {
        let Some(data) = event.data() else {
            warn!("invalid config data");
            event.reject(reject::INVALID_CONFIG, "invalid config data");
            return;
        };

        let config: DecoderConfig = match serde_json::from_str(data) {
            Ok(config) => config,
            Err(_) => {
                warn!("invalid config data");
                event.reject(reject::INVALID_CONFIG, "invalid config data");
                return;
            }
        };

        info!("change config: {data}");

        if let Some(enabled) = config.enabled {
            self.enabled = enabled;
        }
        if let Some(time) = config.stream_time {
            self.decoder.set_stream_time(time);
        }
        if let Some(enabled) = config.debug_enabled {
            self.decoder.set_debug_enabled(enabled);
        }
        if let Some(threshold) = config.power_level_threshold {
            self.decoder.set_power_level_threshold(threshold);
        }

        if let Some(protocol) = &config.protocol {
            if let Some(section) = &protocol.nfca {
                let mut tech = self.decoder.nfca_config();
                section.apply(&mut tech);
                self.decoder.set_nfca_config(tech);
            }
            if let Some(section) = &protocol.nfcb {
                let mut tech = self.decoder.nfcb_config();
                section.apply(&mut tech);
                self.decoder.set_nfcb_config(tech);
            }
            if let Some(section) = &protocol.nfcf {
                let mut tech = self.decoder.nfcf_config();
                section.apply(&mut tech);
                self.decoder.set_nfcf_config(tech);
            }
            if let Some(section) = &protocol.nfcv {
                let mut tech = self.decoder.nfcv_config();
                section.apply(&mut tech);
                self.decoder.set_nfcv_config(tech);
            }
        }

        // the sample rate rebuilds timing tables, apply it last
        if let Some(rate) = config.sample_rate {
            self.decoder.set_sample_rate(rate);
        }

        if !self.enabled && self.state == status::STREAMING {
            self.signal_queue.clear();
            let mut eof = SignalBuffer::eof(tagcore::buffer::SignalType::RawReal);
            for frame in self.decoder.next_frames(&mut eof) {
                self.frame_stream.publish(frame);
            }
            self.state = status::IDLE;
        }

        event.resolve(None);
        self.set_state(self.state);
    }

    fn clear_decoder(&mut self, event: &Event) {
        info!("clear decoder queue with {} pending buffers", self.signal_queue.len());
        self.signal_queue.clear();
        event.resolve(None);
    }

    fn decode_next(&mut self) {
        let Some(mut buffer) = self.signal_queue.get(Some(Duration::from_millis(50))) else {
            return;
        };

        if buffer.is_valid() {
            let date_time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            for mut frame in self.decoder.next_frames(&mut buffer) {
                frame.set_date_time(date_time);

                if self.print_frames {
                    println!("{}", format_frame_json(&frame));
                    let _ = std::io::stdout().flush();
                }

                self.frame_stream.publish(frame);
            }
        } else {
            info!("decoder EOF buffer received, finish");

            for frame in self.decoder.next_frames(&mut buffer) {
                self.frame_stream.publish(frame);
            }
            self.decoder.cleanup();

            self.frame_stream.publish(RawFrame::eof());

            self.set_state(status::IDLE);
        }
    }

    fn set_state(&mut self, state: i32) {
        self.state = state;
        self.streaming.store(state == status::STREAMING, Ordering::SeqCst);

        let tech = self.decoder.nfca_config();
        let data = json!({
            "status": if self.enabled {
                if state == status::STREAMING { "decoding" } else { "idle" }
            } else {
                "disabled"
            },
            "queueSize": self.signal_queue.len(),
            "sampleRate": self.decoder.sample_rate(),
            "streamTime": self.decoder.stream_time(),
            "debugEnabled": self.decoder.is_debug_enabled(),
            "powerLevelThreshold": self.decoder.power_level_threshold(),
            "protocol": {
                "nfca": {
                    "enabled": tech.enabled,
                    "correlationThreshold": tech.correlation_threshold,
                    "minimumModulationDeep": tech.minimum_modulation_deep,
                    "maximumModulationDeep": tech.maximum_modulation_deep,
                },
                "nfcb": { "enabled": self.decoder.nfcb_config().enabled },
                "nfcf": { "enabled": self.decoder.nfcf_config().enabled },
                "nfcv": { "enabled": self.decoder.nfcv_config().enabled },
            },
        });

        self.task.update_status(state, data);
    }
}

impl Worker for RadioDecoderTask {
    fn name(&self) -> &str {
        "RadioDecoderTask"
    }

    fn start(&mut self) {
        self.set_state(status::IDLE);
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(None) {
            debug!("decoder command [{}]", event.code);

            match event.code {
                command::START => self.start_decoder(&event),
                command::STOP => self.stop_decoder(&event),
                command::QUERY => {
                    event.resolve(None);
                    self.set_state(self.state);
                }
                command::CONFIGURE => self.configure_decoder(&event),
                command::CLEAR => self.clear_decoder(&event),
                _ => {
                    warn!("unknown decoder command {}", event.code);
                    event.reject(reject::UNKNOWN_COMMAND, "unknown command");
                }
            }
        }

        if self.enabled && self.state == status::STREAMING {
            self.decode_next();
        } else {
            wait(50);
        }

        true
    }
}

/// Render one decoded frame as the stable single-line JSON document used by
/// the command line front-end.
pub fn format_frame_json(frame: &RawFrame) -> String {
    let tech = match frame.tech_type() {
        TechType::NfcA => "NfcA",
        TechType::NfcB => "NfcB",
        TechType::NfcF => "NfcF",
        TechType::NfcV => "NfcV",
        _ => "UNKNOWN",
    };

    let frame_type = match frame.frame_type() {
        FrameType::CarrierOff => "CarrierOff",
        FrameType::CarrierOn => "CarrierOn",
        FrameType::Poll => "Poll",
        FrameType::Listen => "Listen",
        FrameType::IsoRequest => "IsoRequest",
        FrameType::IsoResponse => "IsoResponse",
    };

    let mut out = String::with_capacity(256);

    out.push_str(&format!(
        "{{\"timestamp\":{:.10},\"tech\":\"{tech}\",\"type\":\"{frame_type}\",\"length\":{},\"data\":\"{}\"",
        frame.time_start(),
        frame.len(),
        frame.to_hex()
    ));

    out.push_str(&format!(
        ",\"time_start\":{:.10},\"time_end\":{:.10}",
        frame.time_start(),
        frame.time_end()
    ));

    if frame.frame_rate() > 0 {
        out.push_str(&format!(",\"rate\":{}", frame.frame_rate()));
    }

    out.push_str(&format!(
        ",\"sample_start\":{},\"sample_end\":{},\"sample_rate\":{}",
        frame.sample_start(),
        frame.sample_end(),
        frame.sample_rate()
    ));

    out.push_str(&format!(
        ",\"tech_type\":{},\"frame_type\":{},\"frame_flags\":{}",
        frame.tech_type() as u32,
        frame.frame_type() as u32,
        frame.frame_flags()
    ));

    if frame.date_time() > 0.0 {
        out.push_str(&format!(",\"date_time\":{:.6}", frame.date_time()));
    }

    let mut flags: Vec<&str> = Vec::new();
    if frame.has_frame_flags(frame_flags::CRC_ERROR) {
        flags.push("crc-error");
    }
    if frame.has_frame_flags(frame_flags::PARITY_ERROR) {
        flags.push("parity-error");
    }
    if frame.has_frame_flags(frame_flags::SYNC_ERROR) {
        flags.push("sync-error");
    }
    if frame.has_frame_flags(frame_flags::TRUNCATED) {
        flags.push("truncated");
    }
    if frame.has_frame_flags(frame_flags::ENCRYPTED) {
        flags.push("encrypted");
    }
    if frame.is_poll_frame() {
        flags.push("request");
    } else if frame.is_listen_frame() {
        flags.push("response");
    }

    if !flags.is_empty() {
        out.push_str(",\"flags\":[");
        for (i, flag) in flags.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("\"{flag}\""));
        }
        out.push(']');
    }

    out.push('}');

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventResponse;
    use std::sync::Mutex;
    use tagcore::buffer::SignalType;
    use tagcore::frame::FramePhase;

    #[test]
    fn frame_json_field_order_and_flags() {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Poll);
        frame.put_slice(&[0x26]);
        frame.set_time_start(0.5);
        frame.set_time_end(0.50009);
        frame.set_frame_rate(105_937);
        frame.set_sample_start(5_000_000);
        frame.set_sample_end(5_000_900);
        frame.set_sample_rate(10_000_000);
        frame.set_frame_phase(FramePhase::Selection);
        frame.set_frame_flags(frame_flags::SHORT_FRAME);

        let line = format_frame_json(&frame);

        assert!(line.starts_with("{\"timestamp\":0.5000000000,\"tech\":\"NfcA\",\"type\":\"Poll\",\"length\":1,\"data\":\"26\""));
        assert!(line.contains("\"time_start\":0.5000000000,\"time_end\":0.5000900000"));
        assert!(line.contains("\"rate\":105937"));
        assert!(line.contains("\"sample_start\":5000000,\"sample_end\":5000900,\"sample_rate\":10000000"));
        assert!(line.contains("\"tech_type\":1,\"frame_type\":3,\"frame_flags\":1"));
        assert!(line.ends_with("\"flags\":[\"request\"]}"));
        // no date_time when unset
        assert!(!line.contains("date_time"));
    }

    #[test]
    fn frame_json_error_flags() {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Listen);
        frame.put_slice(&[0x04, 0x00]);
        frame.set_frame_flags(frame_flags::CRC_ERROR | frame_flags::ENCRYPTED);

        let line = format_frame_json(&frame);
        assert!(line.contains("\"flags\":[\"crc-error\",\"encrypted\",\"response\"]"));
    }

    #[test]
    fn start_requires_enabled_decoder() {
        let bus = Bus::new();
        let mut task = RadioDecoderTask::new(&bus, false);

        let (event, rx) = Event::command(command::START);
        task.start_decoder(&event);
        assert!(matches!(rx.recv().unwrap(), EventResponse::Rejected { .. }));
    }

    #[test]
    fn configure_then_decode_stream() {
        let bus = Bus::new();
        let mut task = RadioDecoderTask::new(&bus, false);

        let frames: Arc<Mutex<Vec<RawFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let _sub = bus
            .subject::<RawFrame>("radio.decoder.frame")
            .subscribe(move |f: &RawFrame| sink.lock().unwrap().push(f.clone()));

        let (event, rx) = Event::command(command::CONFIGURE);
        task.configure_decoder(&event.with_data(
            json!({
                "enabled": true,
                "sampleRate": 10_000_000,
                "powerLevelThreshold": 0.01,
                "protocol": { "nfca": { "enabled": true } }
            })
            .to_string(),
        ));
        assert!(matches!(rx.recv().unwrap(), EventResponse::Resolved(_)));

        let (event, _rx) = Event::command(command::START);
        task.start_decoder(&event);

        // carrier on for a while, published while streaming
        let mut buffer = SignalBuffer::new(40_000, 1, 1, 10_000_000, 0, 0, SignalType::RawReal);
        for _ in 0..40_000 {
            buffer.put(0.5);
        }
        buffer.flip();
        bus.subject::<SignalBuffer>("radio.signal.raw").publish(buffer);
        bus.subject::<SignalBuffer>("radio.signal.raw")
            .publish(SignalBuffer::eof(SignalType::RawReal));

        task.decode_next();
        task.decode_next();

        let frames = frames.lock().unwrap();
        // at least the carrier-on frame from the EOF flush plus the sentinel
        assert!(!frames.is_empty());
        assert!(!frames.last().unwrap().is_valid());
    }
}

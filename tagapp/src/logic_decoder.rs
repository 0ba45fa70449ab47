//! Logic decoder worker: runs the ISO-7816 decoder over queued logic sample
//! buffers and publishes decoded frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use tagcore::buffer::SignalBuffer;
use tagcore::frame::RawFrame;
use tagcore::iso7816::IsoDecoder;

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
struct Iso7816Section {
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolSection {
    iso7816: Option<Iso7816Section>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecoderConfig {
    enabled: Option<bool>,
    stream_time: Option<f64>,
    debug_enabled: Option<bool>,
    sample_rate: Option<u32>,
    protocol: Option<ProtocolSection>,
}

pub struct LogicDecoderTask {
    task: TaskContext,

    frame_stream: Subject<RawFrame>,

    signal_queue: Arc<BlockingQueue<SignalBuffer>>,
    streaming: Arc<AtomicBool>,
    _signal_subscription: Subscription<SignalBuffer>,

    decoder: IsoDecoder,
    enabled: bool,
    state: i32,
}

impl LogicDecoderTask {
    pub fn new(bus: &Bus) -> Self {
        let task = TaskContext::new(bus, "worker.LogicDecoder", "logic.decoder");

        let signal_queue = Arc::new(BlockingQueue::new());
        let streaming = Arc::new(AtomicBool::new(false));

        let queue = signal_queue.clone();
        let gate = streaming.clone();
        let signal_subscription = bus
            .subject::<SignalBuffer>("logic.signal.raw")
            .subscribe(move |buffer: &SignalBuffer| {
                if gate.load(Ordering::SeqCst) {
                    queue.add(buffer.clone());
                }
            });

        LogicDecoderTask {
            task,
            frame_stream: bus.subject("logic.decoder.frame"),
            signal_queue,
            streaming,
            _signal_subscription: signal_subscription,
            decoder: IsoDecoder::new(),
            enabled: false,
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

        let mut eof = SignalBuffer::eof(tagcore::buffer::SignalType::LogicSamples);
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
        if let Some(protocol) = &config.protocol {
            if let Some(section) = &protocol.iso7816 {
                if let Some(enabled) = section.enabled {
                    self.decoder.set_iso7816_enabled(enabled);
                }
            }
        }

        // sample rate last, it re-derives the etu timing
        if let Some(rate) = config.sample_rate {
            self.decoder.set_sample_rate(rate);
        }

        if !self.enabled && self.state == status::STREAMING {
            self.signal_queue.clear();
            let mut eof = SignalBuffer::eof(tagcore::buffer::SignalType::LogicSamples);
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

        debug!(
            "decode buffer {} offset {} with {} samples",
            buffer.id(),
            buffer.offset(),
            buffer.elements()
        );

        for frame in self.decoder.next_frames(&mut buffer) {
            self.frame_stream.publish(frame);
        }

        if !buffer.is_valid() {
            info!("decoder EOF buffer received, finish");

            self.decoder.cleanup();
            self.frame_stream.publish(RawFrame::eof());
            self.set_state(status::IDLE);
        }
    }

    fn set_state(&mut self, state: i32) {
        self.state = state;
        self.streaming.store(state == status::STREAMING, Ordering::SeqCst);

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
            "protocol": {
                "iso7816": { "enabled": self.decoder.is_iso7816_enabled() },
            },
        });

        self.task.update_status(state, data);
    }
}

impl Worker for LogicDecoderTask {
    fn name(&self) -> &str {
        "LogicDecoderTask"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventResponse;
    use std::sync::Mutex;
    use tagcore::buffer::SignalType;
    use tagcore::frame::FrameType;

    fn configure(task: &mut LogicDecoderTask) {
        let (event, rx) = Event::command(command::CONFIGURE);
        task.configure_decoder(&event.with_data(
            json!({
                "enabled": true,
                "sampleRate": 10_000_000,
                "protocol": { "iso7816": { "enabled": true } }
            })
            .to_string(),
        ));
        assert!(matches!(rx.recv().unwrap(), EventResponse::Resolved(_)));
    }

    #[test]
    fn decodes_atr_from_published_buffers() {
        let bus = Bus::new();
        let mut task = LogicDecoderTask::new(&bus);
        configure(&mut task);

        let frames: Arc<Mutex<Vec<RawFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let _sub = bus
            .subject::<RawFrame>("logic.decoder.frame")
            .subscribe(move |f: &RawFrame| sink.lock().unwrap().push(f.clone()));

        let (event, _rx) = Event::command(command::START);
        task.start_decoder(&event);

        // ATR byte 0x3B at 930 samples per etu
        let etu = 930usize;
        let mut samples = vec![1.0f32; 4000];
        samples.extend(std::iter::repeat(0.0).take(etu)); // start bit
        for bit in 0..8 {
            let level = if 0x3Bu8 >> bit & 1 == 1 { 1.0 } else { 0.0 };
            samples.extend(std::iter::repeat(level).take(etu));
        }
        samples.extend(std::iter::repeat(1.0).take(etu)); // parity (even)
        samples.extend(std::iter::repeat(1.0).take(4 * etu));

        let mut buffer =
            SignalBuffer::new(samples.len(), 1, 1, 10_000_000, 0, 0, SignalType::LogicSamples);
        buffer.put_slice(&samples);
        buffer.flip();

        bus.subject::<SignalBuffer>("logic.signal.raw").publish(buffer);
        bus.subject::<SignalBuffer>("logic.signal.raw")
            .publish(SignalBuffer::eof(SignalType::LogicSamples));

        task.decode_next();
        task.decode_next();

        let frames = frames.lock().unwrap();
        let decoded: Vec<_> = frames.iter().filter(|f| f.is_valid()).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].frame_type(), FrameType::IsoResponse);
        assert_eq!(decoded[0].data(), &[0x3B]);
        assert!(!frames.last().unwrap().is_valid());
    }

    #[test]
    fn disabled_decoder_rejects_start() {
        let bus = Bus::new();
        let mut task = LogicDecoderTask::new(&bus);

        let (event, rx) = Event::command(command::START);
        task.start_decoder(&event);
        assert!(matches!(rx.recv().unwrap(), EventResponse::Rejected { .. }));
    }
}

//! Logic device worker: owns the USB analyzer, keeps it configured and
//! publishes its interleaved sample stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use tagcore::buffer::{SignalBuffer, SignalType};

use crate::dsl::{DslConfig, DslDevice};
use crate::event::BlockingQueue;
use crate::event::{command, reject, Bus, Event, Subject};
use crate::task::TaskContext;
use crate::worker::{wait, Worker};

mod status {
    pub const IDLE: i32 = 0;
    pub const STREAMING: i32 = 1;
    pub const FLUSH: i32 = 2;
    pub const ABSENT: i32 = 3;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceConfig {
    enabled: Option<bool>,
    channels: Option<Vec<usize>>,
    sample_rate: Option<u32>,
    v_threshold: Option<f32>,
    firmware_path: Option<String>,
}

pub struct LogicDeviceTask {
    task: TaskContext,

    signal_stream: Subject<SignalBuffer>,
    signal_queue: Arc<BlockingQueue<SignalBuffer>>,

    device: Option<DslDevice>,
    device_config: DslConfig,

    enabled: bool,
    state: i32,
    last_search: Instant,
}

impl LogicDeviceTask {
    pub fn new(bus: &Bus) -> Self {
        LogicDeviceTask {
            task: TaskContext::new(bus, "worker.LogicDevice", "logic.receiver"),
            signal_stream: bus.subject("logic.signal.raw"),
            signal_queue: Arc::new(BlockingQueue::new()),
            device: None,
            device_config: DslConfig::default(),
            enabled: false,
            state: status::IDLE,
            last_search: Instant::now() - Duration::from_secs(10),
        }
    }

    /// Periodic detection: open the first matching analyzer, or notice a
    /// vanished one and report it absent.
    fn refresh(&mut self) {
        if self.device.is_none() {
            for name in DslDevice::enumerate() {
                info!("detected device {name}");

                let mut device = DslDevice::new(self.device_config.clone());

                match device.open() {
                    Ok(()) => {
                        info!("device {name} connected");
                        self.device = Some(device);
                        self.update_device_status(status::IDLE);
                        return;
                    }
                    Err(e) => {
                        warn!("device {name} open failed: {e}");
                    }
                }
            }
        } else if let Some(device) = self.device.as_mut() {
            if !device.is_ready() {
                warn!("device {} disconnected", device.model());

                // downstream learns about the cut stream before the handle goes
                self.signal_stream.publish(SignalBuffer::eof(SignalType::LogicSamples));

                self.device = None;
                self.update_device_status(status::ABSENT);
                return;
            }
        }

        self.update_device_status(self.state);
    }

    fn start_device(&mut self, event: &Event) {
        if !self.enabled {
            warn!("device is disabled");
            event.reject(reject::TASK_DISABLED, "device is disabled");
            return;
        }

        let Some(device) = self.device.as_mut() else {
            event.reject(reject::TASK_DISABLED, "device is not present");
            return;
        };

        info!("start streaming for device {}", device.model());

        let queue = self.signal_queue.clone();
        let handler = Arc::new(move |buffer: SignalBuffer| {
            queue.add(buffer);
            true
        });

        match device.start(handler) {
            Ok(()) => {
                event.resolve(None);
                self.update_device_status(status::STREAMING);
            }
            Err(e) => {
                warn!("failed to start streaming: {e}");
                event.reject(reject::TASK_DISABLED, e.to_string());
            }
        }
    }

    fn stop_device(&mut self, event: &Event) {
        // stop is best effort and always resolves
        if let Some(device) = self.device.as_mut() {
            info!("stop streaming for device {}", device.model());
            device.stop();
        }

        event.resolve(None);

        // keep draining queued buffers before going idle
        self.update_device_status(status::FLUSH);
    }

    fn query_device(&mut self, event: &Event) {
        debug!("query status");
        event.resolve(None);
        self.update_device_status(self.state);
    }

    fn configure_device(&mut self, event: &Event) {
        let Some(data) = event.data() else {
            warn!("invalid config data");
            event.reject(reject::INVALID_CONFIG, "invalid config data");
            return;
        };

        let config: DeviceConfig = match serde_json::from_str(data) {
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
        if let Some(channels) = config.channels {
            self.device_config.channels = if channels.is_empty() { vec![0] } else { channels };
        }
        if let Some(rate) = config.sample_rate {
            self.device_config.sample_rate = rate;
        }
        if let Some(vth) = config.v_threshold {
            self.device_config.vth = vth;
        }
        if let Some(path) = config.firmware_path {
            self.device_config.firmware_path = path.into();
        }

        if let Some(device) = self.device.as_mut() {
            let was_streaming = device.is_streaming();

            device.set_channels(self.device_config.channels.clone());
            device.set_voltage_threshold(self.device_config.vth);
            device.set_firmware_path(self.device_config.firmware_path.clone());
            if let Err(e) = device.set_sample_rate(self.device_config.sample_rate) {
                warn!("{e}");
            }

            // a disabled device stops streaming and flushes its queue
            if !self.enabled && was_streaming {
                info!("stop streaming");
                device.stop();
                self.state = status::FLUSH;
            }
        }

        event.resolve(None);
        self.update_device_status(self.state);
    }

    fn clear_device(&mut self, event: &Event) {
        info!("clear signal queue with {} pending buffers", self.signal_queue.len());
        self.signal_queue.clear();
        event.resolve(None);
    }

    fn pause_device(&mut self, event: &Event) {
        if let Some(device) = self.device.as_mut() {
            match device.pause() {
                Ok(()) => {
                    event.resolve(None);
                    self.update_device_status(status::IDLE);
                    return;
                }
                Err(e) => {
                    event.reject(reject::TASK_DISABLED, e.to_string());
                    return;
                }
            }
        }
        // nothing to pause still succeeds
        event.resolve(None);
    }

    fn resume_device(&mut self, event: &Event) {
        let Some(device) = self.device.as_mut() else {
            event.reject(reject::TASK_DISABLED, "device is not present");
            return;
        };

        let queue = self.signal_queue.clone();
        let handler = Arc::new(move |buffer: SignalBuffer| {
            queue.add(buffer);
            true
        });

        match device.resume(handler) {
            Ok(()) => {
                event.resolve(None);
                self.update_device_status(status::STREAMING);
            }
            Err(e) => {
                event.reject(reject::TASK_DISABLED, e.to_string());
            }
        }
    }

    fn process_queue(&mut self, timeout: Duration) {
        if let Some(buffer) = self.signal_queue.get(Some(timeout)) {
            self.signal_stream.publish(buffer);
        } else if self.state == status::FLUSH {
            // queue drained: signal EOF and go idle
            self.signal_stream.publish(SignalBuffer::eof(SignalType::LogicSamples));
            self.update_device_status(status::IDLE);
        }
    }

    fn update_device_status(&mut self, state: i32) {
        self.state = state;

        let data = if let Some(device) = self.device.as_ref() {
            json!({
                "name": device.model(),
                "vendor": device.vendor(),
                "model": device.model(),
                "version": device.version(),
                "serial": "dslogic",
                "status": if self.enabled {
                    if device.is_streaming() { "streaming" } else { "idle" }
                } else {
                    "disabled"
                },
                "sampleRate": device.sample_rate(),
                "samplesRead": device.samples_read(),
                "samplesLost": device.samples_lost(),
            })
        } else {
            json!({
                "status": if self.enabled { "absent" } else { "disabled" },
            })
        };

        self.task.update_status(state, data);
    }
}

impl Worker for LogicDeviceTask {
    fn name(&self) -> &str {
        "LogicDeviceTask"
    }

    fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            info!("shutdown device {}", device.model());
            device.close();
        }
        self.update_device_status(status::IDLE);
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(None) {
            debug!("device command [{}]", event.code);

            match event.code {
                command::START => self.start_device(&event),
                command::STOP => self.stop_device(&event),
                command::PAUSE => self.pause_device(&event),
                command::RESUME => self.resume_device(&event),
                command::QUERY => self.query_device(&event),
                command::CONFIGURE => self.configure_device(&event),
                command::CLEAR => self.clear_device(&event),
                _ => {
                    warn!("unknown device command {}", event.code);
                    event.reject(reject::UNKNOWN_COMMAND, "unknown command");
                }
            }
        }

        if self.enabled {
            if self.last_search.elapsed() > Duration::from_secs(1) {
                let streaming =
                    self.device.as_ref().map(DslDevice::is_streaming).unwrap_or(false);
                if !streaming {
                    self.refresh();
                }
                self.last_search = Instant::now();
            }

            self.process_queue(Duration::from_millis(50));
        } else {
            wait(100);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventResponse;

    #[test]
    fn start_is_rejected_while_disabled() {
        let bus = Bus::new();
        let mut task = LogicDeviceTask::new(&bus);

        let (event, rx) = Event::command(command::START);
        task.start_device(&event);

        assert!(matches!(rx.recv().unwrap(), EventResponse::Rejected { .. }));
    }

    #[test]
    fn configure_updates_device_settings() {
        let bus = Bus::new();
        let mut task = LogicDeviceTask::new(&bus);

        let (event, rx) = Event::command(command::CONFIGURE);
        let event = event.with_data(
            json!({
                "enabled": true,
                "channels": [0, 1, 2],
                "sampleRate": 25_000_000,
                "vThreshold": 3.1,
                "firmwarePath": "/opt/firmware"
            })
            .to_string(),
        );
        task.configure_device(&event);

        assert!(matches!(rx.recv().unwrap(), EventResponse::Resolved(_)));
        assert!(task.enabled);
        assert_eq!(task.device_config.channels, vec![0, 1, 2]);
        assert_eq!(task.device_config.sample_rate, 25_000_000);
        assert!((task.device_config.vth - 3.1).abs() < 1e-6);
        assert_eq!(task.device_config.firmware_path.to_str(), Some("/opt/firmware"));
    }

    #[test]
    fn malformed_config_is_rejected() {
        let bus = Bus::new();
        let mut task = LogicDeviceTask::new(&bus);

        let (event, rx) = Event::command(command::CONFIGURE);
        task.configure_device(&event.with_data("not json".to_owned()));

        assert!(matches!(rx.recv().unwrap(), EventResponse::Rejected { .. }));
        assert!(!task.enabled);
    }

    #[test]
    fn flush_state_emits_eof_when_queue_drains() {
        let bus = Bus::new();
        let mut task = LogicDeviceTask::new(&bus);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus
            .subject::<SignalBuffer>("logic.signal.raw")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.is_valid()));

        task.state = status::FLUSH;
        task.process_queue(Duration::from_millis(1));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![false]);
        assert_eq!(task.state, status::IDLE);
    }
}

//! Signal storage worker: captures live raw streams into WAV files and plays
//! them back as if a device were streaming.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use tagcore::buffer::{SignalBuffer, SignalType};

use crate::error::StorageError;
use crate::event::{command, Bus, Event, Subject, Subscription};
use crate::event::BlockingQueue;
use crate::task::TaskContext;
use crate::worker::{wait, Worker};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Samples per replay chunk.
const CHUNK_SAMPLES: usize = 65536;

/// Scale between f32 samples and the 16-bit container.
const SAMPLE_SCALE: f32 = 32767.0;

mod status {
    pub const IDLE: i32 = 0;
    pub const READING: i32 = 1;
    pub const WRITING: i32 = 2;
    pub const ERROR: i32 = 5;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteConfig {
    storage_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadConfig {
    file_name: PathBuf,
}

struct Replay {
    reader: WavReader<BufReader<File>>,
    logic: bool,
    offset: u64,
}

/// Worker recording and replaying raw capture files.
pub struct SignalStorageTask {
    task: TaskContext,

    radio_iq_stream: Subject<SignalBuffer>,
    radio_raw_stream: Subject<SignalBuffer>,
    logic_raw_stream: Subject<SignalBuffer>,

    radio_queue: Arc<BlockingQueue<SignalBuffer>>,
    logic_queue: Arc<BlockingQueue<SignalBuffer>>,

    _radio_subscription: Subscription<SignalBuffer>,
    _logic_subscription: Subscription<SignalBuffer>,

    state: Arc<AtomicI32>,
    storage_path: PathBuf,

    radio_writer: Option<WavWriter<BufWriter<File>>>,
    logic_writer: Option<WavWriter<BufWriter<File>>>,
    replay: Option<Replay>,
}

impl SignalStorageTask {
    pub fn new(bus: &Bus) -> Self {
        let task = TaskContext::new(bus, "worker.SignalStorage", "recorder");

        let radio_queue = Arc::new(BlockingQueue::new());
        let logic_queue = Arc::new(BlockingQueue::new());
        let state = Arc::new(AtomicI32::new(status::IDLE));

        // live streams are only captured while a write is in progress
        let queue = radio_queue.clone();
        let gate = state.clone();
        let radio_subscription =
            bus.subject::<SignalBuffer>("radio.signal.raw").subscribe(move |buffer: &SignalBuffer| {
                if gate.load(Ordering::SeqCst) == status::WRITING {
                    queue.add(buffer.clone());
                }
            });

        let queue = logic_queue.clone();
        let gate = state.clone();
        let logic_subscription =
            bus.subject::<SignalBuffer>("logic.signal.raw").subscribe(move |buffer: &SignalBuffer| {
                if gate.load(Ordering::SeqCst) == status::WRITING {
                    queue.add(buffer.clone());
                }
            });

        SignalStorageTask {
            task,
            radio_iq_stream: bus.subject("radio.signal.iq"),
            radio_raw_stream: bus.subject("radio.signal.raw"),
            logic_raw_stream: bus.subject("logic.signal.raw"),
            radio_queue,
            logic_queue,
            _radio_subscription: radio_subscription,
            _logic_subscription: logic_subscription,
            state,
            storage_path: PathBuf::new(),
            radio_writer: None,
            logic_writer: None,
            replay: None,
        }
    }

    fn begin_write(&mut self, event: &Event) {
        let Some(data) = event.data() else {
            event.reject(StorageError::MissingParameters.code(), "Missing parameters");
            return;
        };

        let config: WriteConfig = match serde_json::from_str(data) {
            Ok(config) => config,
            Err(_) => {
                event.reject(StorageError::MissingParameters.code(), "Missing parameters");
                return;
            }
        };

        self.storage_path = config.storage_path;
        info!("capture storage path: {}", self.storage_path.display());

        self.radio_queue.clear();
        self.logic_queue.clear();

        event.resolve(None);
        self.set_state(status::WRITING, None);
    }

    fn begin_read(&mut self, event: &Event) {
        let Some(data) = event.data() else {
            event.reject(StorageError::MissingParameters.code(), "Missing parameters");
            return;
        };

        let config: ReadConfig = match serde_json::from_str(data) {
            Ok(config) => config,
            Err(_) => {
                event.reject(StorageError::MissingFileName.code(), "Missing file name");
                return;
            }
        };

        let reader = match WavReader::open(&config.file_name) {
            Ok(reader) => reader,
            Err(_) => {
                event.reject(StorageError::FileOpenFailed.code(), "File open failed");
                self.set_state(status::IDLE, None);
                return;
            }
        };

        let spec = reader.spec();
        info!(
            "replaying {}: {} ch, {} bit, {} sps",
            config.file_name.display(),
            spec.channels,
            spec.bits_per_sample,
            spec.sample_rate
        );

        let logic = spec.bits_per_sample == 8;

        if !logic && spec.channels != 1 && spec.channels != 2 {
            event.reject(StorageError::InvalidStorageFormat.code(), "Invalid storage format");
            self.set_state(status::IDLE, None);
            return;
        }

        self.replay = Some(Replay { reader, logic, offset: 0 });

        event.resolve(None);
        self.set_state(status::READING, None);
    }

    fn close_storage(&mut self, event: &Event) {
        if let Some(writer) = self.radio_writer.take() {
            let _ = writer.finalize();
        }
        if let Some(writer) = self.logic_writer.take() {
            let _ = writer.finalize();
        }
        self.replay = None;

        event.resolve(None);
        self.set_state(status::IDLE, None);
    }

    fn file_name(&self, prefix: &str) -> PathBuf {
        let stamp =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        self.storage_path.join(format!("{prefix}-{stamp}.wav"))
    }

    fn write_radio(&mut self, buffer: &SignalBuffer) {
        if !buffer.is_valid() {
            if let Some(writer) = self.radio_writer.take() {
                info!("closing radio capture");
                let _ = writer.finalize();
            }
            return;
        }

        if buffer.signal_type() != SignalType::RawReal && buffer.signal_type() != SignalType::RawIq
        {
            return;
        }

        if self.radio_writer.is_none() {
            let spec = WavSpec {
                channels: buffer.stride() as u16,
                sample_rate: buffer.sample_rate(),
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            };
            let path = self.file_name("radio");
            match WavWriter::create(&path, spec) {
                Ok(writer) => {
                    info!("created capture file {}", path.display());
                    self.radio_writer = Some(writer);
                }
                Err(e) => {
                    warn!("failed to create capture file: {e}");
                    self.set_state(status::ERROR, Some("Write data failed".to_owned()));
                    return;
                }
            }
        }

        if let Some(writer) = self.radio_writer.as_mut() {
            for sample in buffer.as_slice() {
                let value = (sample * SAMPLE_SCALE).clamp(-32768.0, 32767.0) as i16;
                if writer.write_sample(value).is_err() {
                    warn!("radio capture write failed");
                    self.set_state(status::ERROR, Some("Write data failed".to_owned()));
                    return;
                }
            }
        }
    }

    fn write_logic(&mut self, buffer: &SignalBuffer) {
        if !buffer.is_valid() {
            if let Some(writer) = self.logic_writer.take() {
                info!("closing logic capture");
                let _ = writer.finalize();
            }
            return;
        }

        if buffer.signal_type() != SignalType::LogicSamples {
            return;
        }

        if self.logic_writer.is_none() {
            let spec = WavSpec {
                channels: buffer.stride() as u16,
                sample_rate: buffer.sample_rate(),
                bits_per_sample: 8,
                sample_format: SampleFormat::Int,
            };
            let path = self.file_name("logic");
            match WavWriter::create(&path, spec) {
                Ok(writer) => {
                    info!("created capture file {}", path.display());
                    self.logic_writer = Some(writer);
                }
                Err(e) => {
                    warn!("failed to create capture file: {e}");
                    self.set_state(status::ERROR, Some("Write data failed".to_owned()));
                    return;
                }
            }
        }

        if let Some(writer) = self.logic_writer.as_mut() {
            for sample in buffer.as_slice() {
                let value = i8::from(*sample > 0.5);
                if writer.write_sample(value).is_err() {
                    warn!("logic capture write failed");
                    self.set_state(status::ERROR, Some("Write data failed".to_owned()));
                    return;
                }
            }
        }
    }

    /// Stream one chunk of the replay file, closing out at end of file.
    fn replay_chunk(&mut self) {
        let Some(replay) = self.replay.as_mut() else {
            self.set_state(status::IDLE, None);
            return;
        };

        let spec = replay.reader.spec();
        let channels = spec.channels as usize;
        let wanted = CHUNK_SAMPLES * channels;

        let mut samples: Vec<f32> = Vec::with_capacity(wanted);

        if replay.logic {
            for sample in replay.reader.samples::<i8>().take(wanted) {
                match sample {
                    Ok(v) => samples.push(if v > 0 { 1.0 } else { 0.0 }),
                    Err(_) => break,
                }
            }
        } else {
            for sample in replay.reader.samples::<i16>().take(wanted) {
                match sample {
                    Ok(v) => samples.push(f32::from(v) / SAMPLE_SCALE),
                    Err(_) => break,
                }
            }
        }

        let offset = replay.offset;
        let frames_read = samples.len() / channels;
        replay.offset += frames_read as u64;

        let finished = samples.len() < wanted;
        let logic = replay.logic;

        if !samples.is_empty() {
            if logic {
                let mut buffer = SignalBuffer::new(
                    samples.len(),
                    channels,
                    1,
                    spec.sample_rate,
                    offset,
                    0,
                    SignalType::LogicSamples,
                );
                buffer.put_slice(&samples);
                buffer.flip();

                debug!("replay logic chunk offset {offset} length {}", buffer.elements());
                self.logic_raw_stream.publish(buffer);
            } else if channels == 2 {
                // IQ capture: publish the pairs and the derived magnitude
                let mut iq = SignalBuffer::new(
                    samples.len(),
                    2,
                    1,
                    spec.sample_rate,
                    offset,
                    0,
                    SignalType::RawIq,
                );
                iq.put_slice(&samples);
                iq.flip();

                let mut magnitude = SignalBuffer::new(
                    frames_read,
                    1,
                    1,
                    spec.sample_rate,
                    offset,
                    0,
                    SignalType::RawReal,
                );
                for pair in samples.chunks_exact(2) {
                    magnitude.put((pair[0] * pair[0] + pair[1] * pair[1]).sqrt());
                }
                magnitude.flip();

                self.radio_iq_stream.publish(iq);
                self.radio_raw_stream.publish(magnitude);
            } else {
                let mut buffer = SignalBuffer::new(
                    samples.len(),
                    1,
                    1,
                    spec.sample_rate,
                    offset,
                    0,
                    SignalType::RawReal,
                );
                buffer.put_slice(&samples);
                buffer.flip();

                self.radio_raw_stream.publish(buffer);
            }
        }

        if finished {
            info!("replay finished after {} sample frames", replay.offset);

            if logic {
                self.logic_raw_stream.publish(SignalBuffer::eof(SignalType::LogicSamples));
            } else {
                self.radio_iq_stream.publish(SignalBuffer::eof(SignalType::RawIq));
                self.radio_raw_stream.publish(SignalBuffer::eof(SignalType::RawReal));
            }

            self.replay = None;
            self.set_state(status::IDLE, None);
        }
    }

    fn set_state(&mut self, state: i32, message: Option<String>) {
        self.state.store(state, Ordering::SeqCst);

        let label = match state {
            status::READING => "reading",
            status::WRITING => "writing",
            status::ERROR => "error",
            _ => "idle",
        };

        let mut data = json!({ "status": label });
        if let Some(message) = message {
            data["message"] = json!(message);
        }

        self.task.update_status(state, data);
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }
}

impl Worker for SignalStorageTask {
    fn name(&self) -> &str {
        "SignalStorage"
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(None) {
            debug!("recorder command [{}]", event.code);

            match event.code {
                command::READ => self.begin_read(&event),
                command::WRITE => self.begin_write(&event),
                command::STOP => self.close_storage(&event),
                _ => {
                    warn!("unknown recorder command {}", event.code);
                    event.reject(crate::event::reject::UNKNOWN_COMMAND, "unknown command");
                }
            }
        }

        match self.state.load(Ordering::SeqCst) {
            status::READING => self.replay_chunk(),
            status::WRITING => {
                if let Some(buffer) = self.radio_queue.get(Some(Duration::from_millis(25))) {
                    self.write_radio(&buffer);
                }
                if let Some(buffer) = self.logic_queue.get(None) {
                    self.write_logic(&buffer);
                }
            }
            _ => wait(50),
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventResponse;
    use std::sync::Mutex;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tagscope-wav-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn drain_writes(task: &mut SignalStorageTask) {
        while let Some(buffer) = task.radio_queue.get(None) {
            task.write_radio(&buffer);
        }
        while let Some(buffer) = task.logic_queue.get(None) {
            task.write_logic(&buffer);
        }
    }

    #[test]
    fn radio_capture_round_trip() {
        let dir = temp_dir("radio");
        let bus = Bus::new();
        let mut task = SignalStorageTask::new(&bus);

        let (event, rx) = Event::command(command::WRITE);
        task.begin_write(&event.with_data(json!({"storagePath": dir}).to_string()));
        assert!(matches!(rx.recv().unwrap(), EventResponse::Resolved(_)));

        // one channel of known samples, then EOF to close the file
        let samples: Vec<f32> = (0..1000).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let mut buffer =
            SignalBuffer::new(samples.len(), 1, 1, 48_000, 0, 0, SignalType::RawReal);
        buffer.put_slice(&samples);
        buffer.flip();

        bus.subject::<SignalBuffer>("radio.signal.raw").publish(buffer);
        bus.subject::<SignalBuffer>("radio.signal.raw")
            .publish(SignalBuffer::eof(SignalType::RawReal));
        drain_writes(&mut task);

        // find the capture file and replay it through a fresh task
        let capture = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .find(|e| e.file_name().to_string_lossy().starts_with("radio-"))
            .expect("capture file")
            .path();

        let replay_bus = Bus::new();
        let mut replayer = SignalStorageTask::new(&replay_bus);

        let seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = replay_bus
            .subject::<SignalBuffer>("radio.signal.raw")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));

        let (event, rx) = Event::command(command::READ);
        replayer.begin_read(&event.with_data(json!({"fileName": capture}).to_string()));
        assert!(matches!(rx.recv().unwrap(), EventResponse::Resolved(_)));

        while replayer.is_replaying() {
            replayer.replay_chunk();
        }

        let seen = seen.lock().unwrap();
        // data buffers plus the EOF marker
        assert!(seen.len() >= 2);
        assert!(!seen.last().unwrap().is_valid());

        let replayed: Vec<f32> =
            seen.iter().filter(|b| b.is_valid()).flat_map(|b| b.as_slice().to_vec()).collect();
        assert_eq!(replayed.len(), samples.len());
        for (a, b) in samples.iter().zip(&replayed) {
            // one LSB of the 16-bit container
            assert!((a - b).abs() <= 1.5 / SAMPLE_SCALE, "{a} vs {b}");
        }

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn iq_replay_emits_both_streams() {
        let dir = temp_dir("iq");

        // write a 2-channel IQ file directly
        let spec = WavSpec {
            channels: 2,
            sample_rate: 10_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path = dir.join("iq.wav");
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample((0.3 * SAMPLE_SCALE) as i16).unwrap();
            writer.write_sample((0.4 * SAMPLE_SCALE) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let bus = Bus::new();
        let mut task = SignalStorageTask::new(&bus);

        let iq_seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let raw_seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = iq_seen.clone();
        let _iq_sub = bus
            .subject::<SignalBuffer>("radio.signal.iq")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));
        let sink = raw_seen.clone();
        let _raw_sub = bus
            .subject::<SignalBuffer>("radio.signal.raw")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));

        let (event, _rx) = Event::command(command::READ);
        task.begin_read(&event.with_data(json!({"fileName": path}).to_string()));
        while task.is_replaying() {
            task.replay_chunk();
        }

        let iq_seen = iq_seen.lock().unwrap();
        let raw_seen = raw_seen.lock().unwrap();

        let iq = iq_seen.iter().find(|b| b.is_valid()).expect("iq buffer");
        assert_eq!(iq.signal_type(), SignalType::RawIq);
        assert_eq!(iq.stride(), 2);
        assert_eq!(iq.elements(), 200);

        let raw = raw_seen.iter().find(|b| b.is_valid()).expect("magnitude buffer");
        assert_eq!(raw.signal_type(), SignalType::RawReal);
        // |0.3 + 0.4i| = 0.5
        assert!((raw.sample(0) - 0.5).abs() < 0.01);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unsupported_channel_count_is_rejected() {
        let dir = temp_dir("badch");

        let spec = WavSpec {
            channels: 3,
            sample_rate: 10_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path = dir.join("three.wav");
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..9 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let bus = Bus::new();
        let mut task = SignalStorageTask::new(&bus);

        let (event, rx) = Event::command(command::READ);
        task.begin_read(&event.with_data(json!({"fileName": path}).to_string()));

        match rx.recv().unwrap() {
            EventResponse::Rejected { code, .. } => {
                assert_eq!(code, StorageError::InvalidStorageFormat.code());
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(dir);
    }
}

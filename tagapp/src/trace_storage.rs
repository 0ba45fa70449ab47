//! Trace storage worker: persists decoded frames and adaptive signal views
//! into a package file, and streams them back out of one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use tagcore::apcm::{
    ApcmHeader, LogicReader, LogicWriter, RadioReader, RadioWriter, APCM_HEADER_LEN,
    LOGIC_RECORD_LEN, RADIO_RECORD_LEN,
};
use tagcore::buffer::{SignalBuffer, SignalType};
use tagcore::frame::{FramePhase, FrameType, RawFrame, TechType};

use crate::error::StorageError;
use crate::event::{command, Bus, Event, Subject, Subscription};
use crate::package::{PackageReader, PackageWriter};
use crate::task::TaskContext;
use crate::worker::{wait, Worker};

/// Records are streamed in chunks of at most 32 KiB.
const CHUNK_RECORDS: usize = 16384;

mod status {
    pub const IDLE: i32 = 0;
    pub const READING: i32 = 1;
    pub const WRITING: i32 = 2;
    pub const COMPLETE: i32 = 4;
    pub const ERROR: i32 = 5;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameRecord {
    sample_start: u64,
    sample_end: u64,
    sample_rate: u32,
    time_start: f64,
    time_end: f64,
    tech_type: u32,
    frame_type: u32,
    frame_rate: u32,
    frame_flags: u32,
    frame_phase: u32,
    date_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameDocument {
    frames: Vec<FrameRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadConfig {
    file_name: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteConfig {
    file_name: PathBuf,
    #[serde(default)]
    time_start: f64,
    #[serde(default)]
    time_end: f64,
}

/// Worker persisting and replaying trace packages.
pub struct TraceStorageTask {
    task: TaskContext,

    storage_frame_stream: Subject<RawFrame>,
    storage_signal_stream: Subject<SignalBuffer>,

    frame_cache: Arc<Mutex<Vec<RawFrame>>>,
    logic_cache: Arc<Mutex<Vec<SignalBuffer>>>,
    radio_cache: Arc<Mutex<Vec<SignalBuffer>>>,

    _logic_frames: Subscription<RawFrame>,
    _radio_frames: Subscription<RawFrame>,
    _adaptive_signals: Subscription<SignalBuffer>,
}

impl TraceStorageTask {
    pub fn new(bus: &Bus) -> Self {
        let task = TaskContext::new(bus, "worker.TraceStorage", "storage");

        let storage_frame_stream = bus.subject::<RawFrame>("storage.frame");
        let storage_signal_stream = bus.subject::<SignalBuffer>("storage.signal");

        let frame_cache = Arc::new(Mutex::new(Vec::new()));
        let logic_cache = Arc::new(Mutex::new(Vec::new()));
        let radio_cache = Arc::new(Mutex::new(Vec::new()));

        let cache = frame_cache.clone();
        let logic_frames =
            bus.subject::<RawFrame>("logic.decoder.frame").subscribe(move |frame: &RawFrame| {
                if frame.is_valid() {
                    cache.lock().unwrap().push(frame.clone());
                }
            });

        let cache = frame_cache.clone();
        let radio_frames =
            bus.subject::<RawFrame>("radio.decoder.frame").subscribe(move |frame: &RawFrame| {
                if frame.is_valid() {
                    cache.lock().unwrap().push(frame.clone());
                }
            });

        let logic = logic_cache.clone();
        let radio = radio_cache.clone();
        let adaptive_signals =
            bus.subject::<SignalBuffer>("adaptive.signal").subscribe(move |buffer: &SignalBuffer| {
                if buffer.is_valid() {
                    match buffer.signal_type() {
                        SignalType::LogicSignal | SignalType::AdvLogic => {
                            logic.lock().unwrap().push(buffer.clone());
                        }
                        SignalType::RadioSignal | SignalType::AdvReal => {
                            radio.lock().unwrap().push(buffer.clone());
                        }
                        _ => {}
                    }
                }
            });

        TraceStorageTask {
            task,
            storage_frame_stream,
            storage_signal_stream,
            frame_cache,
            logic_cache,
            radio_cache,
            _logic_frames: logic_frames,
            _radio_frames: radio_frames,
            _adaptive_signals: adaptive_signals,
        }
    }

    fn read_file(&self, event: &Event) {
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

        info!("read trace file {}", config.file_name.display());
        self.update_storage_status(status::READING, 0, None);

        match self.read_trace_file(&config.file_name) {
            Ok(()) => {
                event.resolve(None);
                self.update_storage_status(status::COMPLETE, 100, None);
            }
            Err(error) => {
                self.frame_cache.lock().unwrap().clear();
                self.logic_cache.lock().unwrap().clear();
                self.radio_cache.lock().unwrap().clear();

                event.reject(error.code(), error.to_string());
                self.update_storage_status(status::ERROR, 100, Some(error.to_string()));
            }
        }
    }

    fn write_file(&self, event: &Event) {
        let Some(data) = event.data() else {
            event.reject(StorageError::MissingParameters.code(), "Missing parameters");
            return;
        };

        let config: WriteConfig = match serde_json::from_str(data) {
            Ok(config) => config,
            Err(_) => {
                event.reject(StorageError::MissingFileName.code(), "Missing file name");
                return;
            }
        };

        info!(
            "write trace file {}, range {} -> {}",
            config.file_name.display(),
            config.time_start,
            config.time_end
        );
        self.update_storage_status(status::WRITING, 0, None);

        match self.write_trace_file(&config) {
            Ok(()) => {
                event.resolve(None);
                self.update_storage_status(status::COMPLETE, 100, None);
            }
            Err(error) => {
                event.reject(error.code(), error.to_string());
                self.update_storage_status(status::ERROR, 100, Some(error.to_string()));
            }
        }
    }

    fn clear_caches(&self, event: &Event) {
        info!("clear {} cached frames", self.frame_cache.lock().unwrap().len());
        self.frame_cache.lock().unwrap().clear();
        self.logic_cache.lock().unwrap().clear();
        self.radio_cache.lock().unwrap().clear();
        event.resolve(None);
    }

    fn read_trace_file(&self, path: &PathBuf) -> Result<(), StorageError> {
        let mut package = PackageReader::open(path)?;

        self.frame_cache.lock().unwrap().clear();
        self.logic_cache.lock().unwrap().clear();
        self.radio_cache.lock().unwrap().clear();

        while let Some((name, data)) = package.next_entry()? {
            info!("read entry {name} length {}", data.len());

            if name.starts_with("frame") {
                self.read_frame_entry(&data)?;
            } else if name.starts_with("logic") {
                self.read_signal_entry(&data, SignalType::LogicSignal)?;
            } else if name.starts_with("radio") {
                self.read_signal_entry(&data, SignalType::RadioSignal)?;
            } else {
                warn!("skip unknown entry: {name}");
            }
        }

        Ok(())
    }

    fn read_frame_entry(&self, data: &[u8]) -> Result<(), StorageError> {
        let document: FrameDocument =
            serde_json::from_slice(data).map_err(|_| StorageError::InvalidStorageFormat)?;

        for record in document.frames {
            let tech_type = TechType::from_code(record.tech_type)
                .ok_or(StorageError::InvalidStorageFormat)?;
            let frame_type = FrameType::from_code(record.frame_type)
                .ok_or(StorageError::InvalidStorageFormat)?;
            let frame_phase = FramePhase::from_code(record.frame_phase)
                .ok_or(StorageError::InvalidStorageFormat)?;

            let mut frame = RawFrame::new(tech_type, frame_type);
            frame.set_frame_phase(frame_phase);
            frame.set_frame_flags(record.frame_flags);
            frame.set_frame_rate(record.frame_rate);
            frame.set_sample_start(record.sample_start);
            frame.set_sample_end(record.sample_end);
            frame.set_sample_rate(record.sample_rate);
            frame.set_time_start(record.time_start);
            frame.set_time_end(record.time_end);
            frame.set_date_time(record.date_time);

            if let Some(text) = &record.frame_data {
                for part in text.split(':') {
                    let byte = u8::from_str_radix(part, 16)
                        .map_err(|_| StorageError::InvalidStorageFormat)?;
                    frame.put(byte);
                }
            }

            self.storage_frame_stream.publish(frame.clone());
            self.frame_cache.lock().unwrap().push(frame);
        }

        // end-of-stream marker after the whole entry
        self.storage_frame_stream.publish(RawFrame::eof());

        Ok(())
    }

    fn read_signal_entry(
        &self,
        data: &[u8],
        signal_type: SignalType,
    ) -> Result<(), StorageError> {
        let header = ApcmHeader::from_bytes(data).map_err(|e| {
            error!("{e}");
            StorageError::InvalidStorageFormat
        })?;

        let record_len = match signal_type {
            SignalType::LogicSignal => LOGIC_RECORD_LEN,
            _ => RADIO_RECORD_LEN,
        };

        if data.len() != APCM_HEADER_LEN + header.total_samples as usize * record_len {
            error!("invalid signal chunk size");
            return Err(StorageError::InvalidStorageFormat);
        }

        debug!(
            "signal entry: stream {} offset {} rate {} samples {}",
            header.stream_id, header.start_offset, header.sample_rate, header.total_samples
        );

        let records = &data[APCM_HEADER_LEN..];

        let mut logic_reader = LogicReader::new(u64::from(header.start_offset));
        let mut radio_reader = RadioReader::new(u64::from(header.start_offset));

        for chunk in records.chunks(CHUNK_RECORDS * record_len) {
            let position = match signal_type {
                SignalType::LogicSignal => logic_reader.position(),
                _ => radio_reader.position(),
            };

            let mut buffer = SignalBuffer::new(
                (chunk.len() / record_len) * 2,
                2,
                1,
                header.sample_rate,
                position,
                0,
                signal_type,
            )
            .with_id(header.stream_id);

            let result = match signal_type {
                SignalType::LogicSignal => logic_reader.decode(chunk, |offset, value| {
                    buffer.put(value).put((offset - position) as f32);
                }),
                _ => radio_reader.decode(chunk, |offset, value| {
                    buffer.put(value).put((offset - position) as f32);
                }),
            };
            result.map_err(|_| StorageError::ReadDataFailed)?;

            buffer.flip();

            self.storage_signal_stream.publish(buffer.clone());

            match signal_type {
                SignalType::LogicSignal => self.logic_cache.lock().unwrap().push(buffer),
                _ => self.radio_cache.lock().unwrap().push(buffer),
            }
        }

        self.storage_signal_stream.publish(SignalBuffer::eof(signal_type));

        Ok(())
    }

    fn write_trace_file(&self, config: &WriteConfig) -> Result<(), StorageError> {
        let mut package = PackageWriter::create(&config.file_name)?;

        self.write_frame_entry(&mut package, config)?;
        self.write_signal_entries(&mut package, config, false)?;
        self.write_signal_entries(&mut package, config, true)?;

        package.finish()
    }

    fn write_frame_entry(
        &self,
        package: &mut PackageWriter,
        config: &WriteConfig,
    ) -> Result<(), StorageError> {
        let mut records = Vec::new();

        for frame in self.frame_cache.lock().unwrap().iter() {
            if frame.time_start() < config.time_start {
                continue;
            }
            if config.time_end > 0.0 && frame.time_end() > config.time_end {
                continue;
            }

            let range_offset = (f64::from(frame.sample_rate()) * config.time_start) as u64;

            records.push(FrameRecord {
                sample_start: frame.sample_start().saturating_sub(range_offset),
                sample_end: frame.sample_end().saturating_sub(range_offset),
                sample_rate: frame.sample_rate(),
                time_start: frame.time_start() - config.time_start,
                time_end: frame.time_end() - config.time_start,
                tech_type: frame.tech_type() as u32,
                frame_type: frame.frame_type() as u32,
                frame_rate: frame.frame_rate(),
                frame_flags: frame.frame_flags(),
                frame_phase: frame.frame_phase() as u32,
                date_time: frame.date_time(),
                frame_data: (!frame.is_empty()).then(|| {
                    frame
                        .data()
                        .iter()
                        .map(|b| format!("{b:02X}"))
                        .collect::<Vec<_>>()
                        .join(":")
                }),
            });
        }

        let document = FrameDocument { frames: records };
        let content =
            serde_json::to_vec(&document).map_err(|_| StorageError::WriteDataFailed)?;

        info!("add frame entry with {} frames", document.frames.len());

        package.add_entry("frame.json", &content)
    }

    fn write_signal_entries(
        &self,
        package: &mut PackageWriter,
        config: &WriteConfig,
        radio: bool,
    ) -> Result<(), StorageError> {
        let cache = if radio { &self.radio_cache } else { &self.logic_cache };
        let cache = cache.lock().unwrap();

        let mut channels: Vec<u32> = Vec::new();
        for buffer in cache.iter() {
            if !channels.contains(&buffer.id()) {
                channels.push(buffer.id());
            }
        }

        info!("detected {} {} channels", channels.len(), if radio { "radio" } else { "logic" });

        for id in channels {
            let first = cache
                .iter()
                .find(|b| b.id() == id)
                .ok_or(StorageError::WriteDataFailed)?;

            let sample_rate = first.sample_rate();
            let sample_start = (f64::from(sample_rate) * config.time_start) as u64;
            let sample_end = if config.time_end > 0.0 {
                (f64::from(sample_rate) * config.time_end) as u64
            } else {
                u64::MAX
            };

            let start_offset = first.offset().max(sample_start);

            let mut logic_writer = LogicWriter::new(start_offset);
            let mut radio_writer = RadioWriter::new(start_offset);

            for buffer in cache.iter().filter(|b| b.id() == id) {
                let samples = buffer.as_slice();
                for pair in samples.chunks_exact(buffer.stride()) {
                    let offset = buffer.offset() + pair[1] as u64;
                    if offset > sample_end {
                        break;
                    }
                    if offset < sample_start {
                        continue;
                    }
                    if radio {
                        radio_writer.push(offset, pair[0]);
                    } else {
                        logic_writer.push(offset, pair[0]);
                    }
                }
            }

            let (count, records): (u32, &[u8]) = if radio {
                (radio_writer.count(), radio_writer.records())
            } else {
                (logic_writer.count(), logic_writer.records())
            };

            let header = ApcmHeader {
                flags: 0,
                start_offset: start_offset as u32,
                total_samples: count,
                stream_id: id,
                sample_rate,
            };

            let name = if radio { format!("radio-{id}.apcm") } else { format!("logic-{id}.apcm") };
            info!("add {} entry with {} samples", name, count);

            let mut entry = Vec::with_capacity(APCM_HEADER_LEN + records.len());
            entry.extend_from_slice(&header.to_bytes());
            entry.extend_from_slice(records);

            package.add_entry(&name, &entry)?;
        }

        Ok(())
    }

    fn update_storage_status(&self, value: i32, progress: i32, message: Option<String>) {
        let label = match value {
            status::READING => "reading",
            status::WRITING => "writing",
            status::COMPLETE => "complete",
            status::ERROR => "error",
            _ => "idle",
        };

        let mut data = json!({ "status": label, "progress": progress });
        if let Some(message) = message {
            data["message"] = json!(message);
        }

        self.task.update_status(value, data);
    }
}

impl Worker for TraceStorageTask {
    fn name(&self) -> &str {
        "TraceStorageTask"
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(Some(Duration::from_millis(250))) {
            debug!("storage command [{}]", event.code);

            match event.code {
                command::READ => self.read_file(&event),
                command::WRITE => self.write_file(&event),
                command::CLEAR => self.clear_caches(&event),
                _ => {
                    warn!("unknown storage command {}", event.code);
                    event.reject(crate::event::reject::UNKNOWN_COMMAND, "unknown command");
                }
            }
        }

        wait(10);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventResponse;
    use tagcore::frame::frame_flags;

    fn temp_trace(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tagscope-trace-{}-{name}.trz", std::process::id()))
    }

    /// Test streams run at 1 ksps so delta offsets stay within one byte.
    const RATE: u32 = 1000;

    fn radio_signal_buffer(id: u32, offset: u64, points: &[(f32, f32)]) -> SignalBuffer {
        let mut buffer =
            SignalBuffer::new(points.len() * 2, 2, 1, RATE, offset, 0, SignalType::RadioSignal)
                .with_id(id);
        for (value, index) in points {
            buffer.put(*value).put(*index);
        }
        buffer.flip();
        buffer
    }

    fn make_frame(time: f64, bytes: &[u8]) -> RawFrame {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Poll);
        frame.set_frame_phase(FramePhase::Selection);
        frame.set_sample_rate(RATE);
        frame.set_sample_start((time * f64::from(RATE)) as u64);
        frame.set_sample_end((time * f64::from(RATE)) as u64 + 1);
        frame.set_time_start(time);
        frame.set_time_end(time + 0.0005);
        frame.set_frame_rate(105_937);
        frame.put_slice(bytes);
        frame
    }

    fn write_command(path: &PathBuf, start: f64, end: f64) -> Event {
        let (event, _rx) = Event::command(command::WRITE);
        event.with_data(
            json!({"fileName": path, "timeStart": start, "timeEnd": end}).to_string(),
        )
    }

    #[test]
    fn trace_round_trip_with_range_trim() {
        let bus = Bus::new();
        let task = TraceStorageTask::new(&bus);

        // frames at 0.5 s intervals over 5 s, some outside the window
        let frame_subject = bus.subject::<RawFrame>("radio.decoder.frame");
        for i in 0..10 {
            frame_subject.publish(make_frame(i as f64 * 0.5, &[0x26]));
        }
        // EOF frames are never cached
        frame_subject.publish(RawFrame::eof());

        // one radio channel, samples every 200 ms from 0.9 s to 4.65 s
        let points: Vec<(f32, f32)> =
            (0..19).map(|k| (0.1 + 0.01 * k as f32, (50 + 200 * k) as f32)).collect();
        let adaptive = bus.subject::<SignalBuffer>("adaptive.signal");
        adaptive.publish(radio_signal_buffer(0, 900, &points));

        let path = temp_trace("range");
        let event = write_command(&path, 1.0, 4.0);
        task.write_file(&event);

        // read everything back through a fresh task on its own bus
        let read_bus = Bus::new();
        let reader = TraceStorageTask::new(&read_bus);

        let frames: Arc<Mutex<Vec<RawFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let _frame_sub = read_bus.subject::<RawFrame>("storage.frame").subscribe(move |f: &RawFrame| {
            if f.is_valid() {
                sink.lock().unwrap().push(f.clone());
            }
        });

        let buffers: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = buffers.clone();
        let _signal_sub = read_bus
            .subject::<SignalBuffer>("storage.signal")
            .subscribe(move |b: &SignalBuffer| {
                if b.is_valid() {
                    sink.lock().unwrap().push(b.clone());
                }
            });

        let (event, rx) = Event::command(command::READ);
        let event = event.with_data(json!({"fileName": path}).to_string());
        reader.read_file(&event);
        assert!(matches!(rx.recv().unwrap(), EventResponse::Resolved(_)));

        // frames with [timeStart, timeEnd] inside [1.0, 4.0], shifted left by 1.0 s
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 6);
        assert!((frames[0].time_start() - 0.0).abs() < 1e-9);
        assert_eq!(frames[0].sample_start(), 0);
        assert_eq!(frames[0].data(), &[0x26]);
        assert!((frames[5].time_start() - 2.5).abs() < 1e-9);

        // radio samples within [1.0 s, 4.0 s]: absolute offsets 1150..3950
        let buffers = buffers.lock().unwrap();
        assert_eq!(buffers.len(), 1);
        let buffer = &buffers[0];
        assert_eq!(buffer.signal_type(), SignalType::RadioSignal);
        assert_eq!(buffer.elements(), 15 * 2);
        let absolute: Vec<u64> = buffer
            .as_slice()
            .chunks(2)
            .map(|pair| buffer.offset() + pair[1] as u64)
            .collect();
        let expected: Vec<u64> = (1..=15).map(|k| 950 + 200 * k).collect();
        assert_eq!(absolute, expected);
        let values: Vec<f32> = buffer.as_slice().chunks(2).map(|p| p[0]).collect();
        for (k, value) in values.iter().enumerate() {
            let original = 0.1 + 0.01 * (k + 1) as f32;
            assert!((value - original).abs() <= 1.0 / 32768.0);
        }

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_name_is_rejected() {
        let bus = Bus::new();
        let task = TraceStorageTask::new(&bus);

        let (event, rx) = Event::command(command::WRITE);
        let event = event.with_data("{}".to_owned());
        task.write_file(&event);

        assert_eq!(
            rx.recv().unwrap(),
            EventResponse::Rejected {
                code: StorageError::MissingFileName.code(),
                message: "Missing file name".to_owned()
            }
        );
    }

    #[test]
    fn unreadable_package_is_rejected() {
        let bus = Bus::new();
        let task = TraceStorageTask::new(&bus);

        let path = temp_trace("absent-file");
        let (event, rx) = Event::command(command::READ);
        let event = event.with_data(json!({"fileName": path}).to_string());
        task.read_file(&event);

        match rx.recv().unwrap() {
            EventResponse::Rejected { code, .. } => {
                assert_eq!(code, StorageError::FileOpenFailed.code());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn frame_flags_survive_round_trip() {
        let bus = Bus::new();
        let task = TraceStorageTask::new(&bus);

        let mut frame = make_frame(0.5, &[0x50, 0x00, 0x57, 0xCD]);
        frame.set_frame_flags(frame_flags::CRC_ERROR | frame_flags::ENCRYPTED);
        bus.subject::<RawFrame>("logic.decoder.frame").publish(frame);

        let path = temp_trace("flags");
        task.write_file(&write_command(&path, 0.0, 10.0));

        let read_bus = Bus::new();
        let reader = TraceStorageTask::new(&read_bus);
        let frames: Arc<Mutex<Vec<RawFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let _sub = read_bus.subject::<RawFrame>("storage.frame").subscribe(move |f: &RawFrame| {
            if f.is_valid() {
                sink.lock().unwrap().push(f.clone());
            }
        });

        let (event, _rx) = Event::command(command::READ);
        reader.read_file(&event.with_data(json!({"fileName": path}).to_string()));

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].has_frame_flags(frame_flags::CRC_ERROR));
        assert!(frames[0].has_frame_flags(frame_flags::ENCRYPTED));
        assert_eq!(frames[0].data(), &[0x50, 0x00, 0x57, 0xCD]);

        let _ = std::fs::remove_file(path);
    }
}

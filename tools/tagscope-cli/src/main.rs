use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use serde_json::json;

use tagapp::event::{command, Bus, Event, EventResponse};
use tagapp::fourier::FourierTask;
use tagapp::logic_decoder::LogicDecoderTask;
use tagapp::logic_device::LogicDeviceTask;
use tagapp::radio_decoder::RadioDecoderTask;
use tagapp::radio_device::RadioDeviceTask;
use tagapp::resampler::ResamplingTask;
use tagapp::signal_storage::SignalStorageTask;
use tagapp::trace_storage::TraceStorageTask;
use tagapp::worker::{spawn, WorkerHandle};

/// Off-line and live decoder for NFC and ISO-7816 captures.
#[derive(Parser, Debug)]
#[command(name = "tagscope", version, about)]
struct Args {
    /// Decode frames from a live device or a replayed capture
    #[arg(long)]
    decode: bool,

    /// Replay a capture (.wav) or trace (.trz) file
    #[arg(long)]
    read: Option<PathBuf>,

    /// Write capture files into this directory while streaming
    #[arg(long)]
    write: Option<PathBuf>,

    /// Print one JSON line per decoded frame on stdout
    #[arg(long)]
    print_frames: bool,

    /// Logic analyzer input threshold in volts
    #[arg(long, default_value_t = 1.65)]
    vth: f32,

    /// Sample rate in hertz
    #[arg(long, default_value_t = 10_000_000)]
    sample_rate: u32,

    /// Comma separated list of logic channels to enable
    #[arg(long, value_delimiter = ',')]
    channels: Vec<usize>,

    /// Directory holding device firmware and FPGA bitstreams
    #[arg(long)]
    firmware_path: Option<PathBuf>,
}

/// Send a command to a worker and wait for its completion.
fn send(bus: &Bus, topic: &str, code: i32, data: Option<String>) -> Result<(), String> {
    let (event, rx) = Event::command(code);
    let event = match data {
        Some(data) => event.with_data(data),
        None => event,
    };

    bus.subject::<Event>(&format!("{topic}.command")).publish(event);

    match rx.recv_timeout(Duration::from_secs(30)) {
        Ok(EventResponse::Resolved(_)) => Ok(()),
        Ok(EventResponse::Rejected { code, message }) => {
            Err(format!("{topic} rejected command ({code}): {message}"))
        }
        Err(_) => Err(format!("{topic} did not answer")),
    }
}

fn run(args: Args) -> Result<(), String> {
    let bus = Bus::new();

    let mut workers: Vec<WorkerHandle> = Vec::new();

    workers.push(spawn(Box::new(RadioDecoderTask::new(&bus, args.print_frames))));
    workers.push(spawn(Box::new(LogicDecoderTask::new(&bus))));
    workers.push(spawn(Box::new(ResamplingTask::new(&bus))));
    workers.push(spawn(Box::new(FourierTask::new(&bus))));
    workers.push(spawn(Box::new(TraceStorageTask::new(&bus))));
    workers.push(spawn(Box::new(SignalStorageTask::new(&bus))));
    workers.push(spawn(Box::new(LogicDeviceTask::new(&bus))));
    workers.push(spawn(Box::new(RadioDeviceTask::new(&bus))));

    // decoders follow the capture sample rate
    send(
        &bus,
        "radio.decoder",
        command::CONFIGURE,
        Some(
            json!({
                "enabled": args.decode,
                "sampleRate": args.sample_rate,
                "protocol": { "nfca": { "enabled": true } }
            })
            .to_string(),
        ),
    )?;

    send(
        &bus,
        "logic.decoder",
        command::CONFIGURE,
        Some(
            json!({
                "enabled": args.decode,
                "sampleRate": args.sample_rate,
                "protocol": { "iso7816": { "enabled": true } }
            })
            .to_string(),
        ),
    )?;

    send(
        &bus,
        "logic.receiver",
        command::CONFIGURE,
        Some(
            json!({
                "enabled": args.read.is_none(),
                "channels": args.channels,
                "sampleRate": args.sample_rate,
                "vThreshold": args.vth,
                "firmwarePath": args.firmware_path,
            })
            .to_string(),
        ),
    )?;

    // the SDR source stays parked unless explicitly enabled at runtime
    send(
        &bus,
        "radio.receiver",
        command::CONFIGURE,
        Some(json!({ "enabled": false, "sampleRate": args.sample_rate }).to_string()),
    )?;

    if args.decode {
        send(&bus, "radio.decoder", command::START, None)?;
        send(&bus, "logic.decoder", command::START, None)?;
    }

    if let Some(directory) = &args.write {
        std::fs::create_dir_all(directory)
            .map_err(|e| format!("cannot create {}: {e}", directory.display()))?;
        send(
            &bus,
            "recorder",
            command::WRITE,
            Some(json!({ "storagePath": directory }).to_string()),
        )?;
    }

    // stored frames print the same JSON lines as freshly decoded ones
    let _storage_printer = args.print_frames.then(|| {
        bus.subject::<tagcore::frame::RawFrame>("storage.frame").subscribe(
            |frame: &tagcore::frame::RawFrame| {
                if frame.is_valid() {
                    println!("{}", tagapp::radio_decoder::format_frame_json(frame));
                }
            },
        )
    });

    match &args.read {
        Some(file) if file.extension().is_some_and(|e| e == "trz") => {
            // decoded trace: frames replay straight out of storage
            send(
                &bus,
                "storage",
                command::READ,
                Some(json!({ "fileName": file }).to_string()),
            )?;

            info!("trace {} replayed", file.display());
        }
        Some(file) => {
            // raw capture: samples replay through the decoders
            send(
                &bus,
                "recorder",
                command::READ,
                Some(json!({ "fileName": file }).to_string()),
            )?;

            // wait for the replay to run dry
            wait_for_status(&bus, "recorder", "idle")?;
            if args.decode {
                wait_for_status(&bus, "radio.decoder", "idle")?;
                wait_for_status(&bus, "logic.decoder", "idle")?;
            }
        }
        None => {
            info!("streaming from device; interrupt to stop");
            loop {
                std::thread::park();
            }
        }
    }

    for worker in workers {
        worker.join();
    }

    Ok(())
}

/// Poll a worker's sticky status until it reports the wanted state.
fn wait_for_status(bus: &Bus, topic: &str, wanted: &'static str) -> Result<(), String> {
    use std::sync::{Arc, Mutex};

    let subject = bus.subject::<Event>(&format!("{topic}.status"));
    let deadline = std::time::Instant::now() + Duration::from_secs(600);

    loop {
        std::thread::sleep(Duration::from_millis(100));

        // the sticky status replays to a fresh subscriber on attach
        let current: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let sink = current.clone();
        let subscription = subject.subscribe(move |event: &Event| {
            if let Some(data) = event.data() {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                    if let Some(status) = value["status"].as_str() {
                        *sink.lock().unwrap() = Some(status.to_owned());
                    }
                }
            }
        });
        let status = current.lock().unwrap().clone();
        drop(subscription);

        if status.as_deref() == Some(wanted) {
            return Ok(());
        }

        if std::time::Instant::now() > deadline {
            return Err(format!("{topic} never reached {wanted}"));
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            eprintln!("tagscope: {message}");
            ExitCode::FAILURE
        }
    }
}

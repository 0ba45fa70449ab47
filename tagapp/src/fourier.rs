//! Fourier worker: turns the live IQ stream into DC-centred magnitude bins
//! for the spectrum display.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::Deserialize;
use serde_json::json;

use tagcore::buffer::{SignalBuffer, SignalType};

use crate::event::{command, reject, Bus, Event, Subject, Subscription};
use crate::task::TaskContext;
use crate::worker::{wait, Worker};

/// Transform length; bins published per update.
const FFT_LENGTH: usize = 1024;

/// Display bandwidth the input is decimated down to.
const BANDWIDTH: u32 = 10_000_000 / 16;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FourierConfig {
    enabled: Option<bool>,
}

/// Worker computing the spectrum view at up to 100 frames per second.
pub struct FourierTask {
    task: TaskContext,

    frequency_stream: Subject<SignalBuffer>,

    /// Most recent IQ buffer, replaced on every publication
    signal: Arc<Mutex<Option<SignalBuffer>>>,
    _signal_subscription: Subscription<SignalBuffer>,

    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    enabled: bool,
}

impl FourierTask {
    pub fn new(bus: &Bus) -> Self {
        let task = TaskContext::new(bus, "worker.FourierProcess", "fourier");

        let signal: Arc<Mutex<Option<SignalBuffer>>> = Arc::new(Mutex::new(None));
        let slot = signal.clone();
        let signal_subscription =
            bus.subject::<SignalBuffer>("radio.signal.iq").subscribe(move |buffer: &SignalBuffer| {
                if let Ok(mut slot) = slot.try_lock() {
                    *slot = Some(buffer.clone());
                }
            });

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_LENGTH);

        // sin^2 window tapers both edges of the capture
        let window: Vec<f32> = (0..FFT_LENGTH)
            .map(|i| (std::f32::consts::PI * i as f32 / FFT_LENGTH as f32).sin().powi(2))
            .collect();

        FourierTask {
            task,
            frequency_stream: bus.subject("signal.fft"),
            signal,
            _signal_subscription: signal_subscription,
            fft,
            window,
            enabled: false,
        }
    }

    fn configure(&mut self, event: &Event) {
        let Some(data) = event.data() else {
            event.reject(reject::INVALID_CONFIG, "invalid config data");
            return;
        };

        match serde_json::from_str::<FourierConfig>(data) {
            Ok(config) => {
                if let Some(enabled) = config.enabled {
                    self.enabled = enabled;
                }
                event.resolve(None);
                self.update_fourier_status();
            }
            Err(_) => {
                event.reject(reject::INVALID_CONFIG, "invalid config data");
            }
        }
    }

    /// Window, transform and fold the most recent IQ capture.
    fn process(&mut self) {
        let buffer = self.signal.lock().unwrap().clone();

        let Some(buffer) = buffer else { return };

        if !buffer.is_valid() || buffer.signal_type() != SignalType::RawIq {
            return;
        }

        let samples = buffer.as_slice();

        // decimate to the display bandwidth
        let decimation = (buffer.sample_rate() / BANDWIDTH).max(1) as usize;

        if samples.len() < FFT_LENGTH * 2 * decimation {
            return;
        }

        let mut bins: Vec<Complex32> = (0..FFT_LENGTH)
            .map(|i| {
                let at = i * decimation * 2;
                Complex32::new(samples[at] * self.window[i], samples[at + 1] * self.window[i])
            })
            .collect();

        self.fft.process(&mut bins);

        let mut result = SignalBuffer::new(
            FFT_LENGTH,
            1,
            1,
            buffer.sample_rate(),
            0,
            decimation as u32,
            SignalType::FftBin,
        );

        // negative frequencies first so DC lands in the centre
        for bin in bins[FFT_LENGTH / 2..].iter().chain(bins[..FFT_LENGTH / 2].iter()) {
            result.put(bin.norm());
        }
        result.flip();

        debug!("fft frame with decimation {decimation}");

        self.frequency_stream.publish(result);
    }

    fn update_fourier_status(&self) {
        let data = json!({ "status": if self.enabled { "streaming" } else { "disabled" } });
        self.task.update_status(0, data);
    }
}

impl Worker for FourierTask {
    fn name(&self) -> &str {
        "FourierProcessTask"
    }

    fn start(&mut self) {
        self.update_fourier_status();
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(None) {
            debug!("fourier command [{}]", event.code);

            if event.code == command::CONFIGURE {
                self.configure(&event);
            } else {
                event.reject(reject::UNKNOWN_COMMAND, "unknown command");
            }
        }

        if self.enabled {
            // pace the spectrum at 100 frames per second
            wait(10);
            self.process();
        } else {
            wait(100);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn iq_buffer(samples: &[f32], rate: u32) -> SignalBuffer {
        let mut buffer = SignalBuffer::new(samples.len(), 2, 1, rate, 0, 0, SignalType::RawIq);
        buffer.put_slice(samples);
        buffer.flip();
        buffer
    }

    fn collect_fft(bus: &Bus) -> Arc<StdMutex<Vec<SignalBuffer>>> {
        let seen: Arc<StdMutex<Vec<SignalBuffer>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let subject = bus.subject::<SignalBuffer>("signal.fft");
        let sub = subject.subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));
        std::mem::forget(sub);
        seen
    }

    #[test]
    fn dc_tone_lands_in_the_centre_bin() {
        let bus = Bus::new();
        let mut task = FourierTask::new(&bus);
        let seen = collect_fft(&bus);

        // constant IQ vector = tone at DC; 10 MHz with decimation 16
        let rate = 10_000_000u32;
        let decimation = (rate / BANDWIDTH) as usize;
        let samples = vec![0.5f32; FFT_LENGTH * 2 * decimation];

        bus.subject::<SignalBuffer>("radio.signal.iq").publish(iq_buffer(&samples, rate));
        task.process();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let result = &seen[0];
        assert_eq!(result.signal_type(), SignalType::FftBin);
        assert_eq!(result.elements(), FFT_LENGTH);
        assert_eq!(result.decimation(), decimation as u32);

        // the peak magnitude must be at the centre after the fold
        let bins = result.as_slice();
        let (peak, _) = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!(peak, FFT_LENGTH / 2);
    }

    #[test]
    fn short_buffers_are_skipped() {
        let bus = Bus::new();
        let mut task = FourierTask::new(&bus);
        let seen = collect_fft(&bus);

        bus.subject::<SignalBuffer>("radio.signal.iq")
            .publish(iq_buffer(&vec![0.1f32; 64], 10_000_000));
        task.process();

        assert!(seen.lock().unwrap().is_empty());
    }
}

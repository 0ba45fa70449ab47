//! Adaptive resampling worker: thins raw logic and radio streams into sparse
//! display buffers on the `adaptive.signal` topic.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use tagcore::buffer::{SignalBuffer, SignalType};
use tagcore::resample::{resample_logic, resample_radio};

use crate::event::BlockingQueue;
use crate::event::{Bus, Subject, Subscription};
use crate::task::TaskContext;
use crate::worker::Worker;

pub struct ResamplingTask {
    task: TaskContext,

    adaptive_stream: Subject<SignalBuffer>,

    signal_queue: Arc<BlockingQueue<SignalBuffer>>,
    _logic_subscription: Subscription<SignalBuffer>,
    _radio_subscription: Subscription<SignalBuffer>,
}

impl ResamplingTask {
    pub fn new(bus: &Bus) -> Self {
        let task = TaskContext::new(bus, "worker.SignalResampling", "adaptive");

        let signal_queue = Arc::new(BlockingQueue::new());

        let queue = signal_queue.clone();
        let logic_subscription = bus
            .subject::<SignalBuffer>("logic.signal.raw")
            .subscribe(move |buffer: &SignalBuffer| queue.add(buffer.clone()));

        let queue = signal_queue.clone();
        let radio_subscription = bus
            .subject::<SignalBuffer>("radio.signal.raw")
            .subscribe(move |buffer: &SignalBuffer| queue.add(buffer.clone()));

        ResamplingTask {
            task,
            adaptive_stream: bus.subject("adaptive.signal"),
            signal_queue,
            _logic_subscription: logic_subscription,
            _radio_subscription: radio_subscription,
        }
    }

    fn process(&self, buffer: &SignalBuffer) {
        if !buffer.is_valid() {
            self.adaptive_stream.publish(SignalBuffer::eof(buffer.signal_type()));
            return;
        }

        match buffer.signal_type() {
            SignalType::LogicSamples => {
                // multichannel captures resample per lane elsewhere; here the
                // stream carries one lane per buffer id
                self.adaptive_stream.publish(resample_logic(buffer));
            }
            SignalType::RawReal => {
                self.adaptive_stream.publish(resample_radio(buffer));
            }
            _ => {}
        }
    }
}

impl Worker for ResamplingTask {
    fn name(&self) -> &str {
        "AdaptiveSamplingTask"
    }

    fn run(&mut self) -> bool {
        if let Some(event) = self.task.next_command(None) {
            debug!("adaptive command [{}]", event.code);
            event.resolve(None);
        }

        if let Some(buffer) = self.signal_queue.get(Some(Duration::from_millis(25))) {
            self.process(&buffer);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn logic_buffers_produce_adaptive_output_and_eof_propagates() {
        let bus = Bus::new();
        let task = ResamplingTask::new(&bus);

        let seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus
            .subject::<SignalBuffer>("adaptive.signal")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));

        let samples: Vec<f32> = (0..600).map(|i| if i < 300 { 0.0 } else { 1.0 }).collect();
        let mut buffer =
            SignalBuffer::new(samples.len(), 1, 1, 1_000_000, 0, 0, SignalType::LogicSamples);
        buffer.put_slice(&samples);
        buffer.flip();

        task.process(&buffer);
        task.process(&SignalBuffer::eof(SignalType::LogicSamples));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].signal_type(), SignalType::AdvLogic);
        assert!(seen[0].elements() > 0);
        assert!(!seen[1].is_valid());
    }

    #[test]
    fn radio_buffers_are_thinned() {
        let bus = Bus::new();
        let task = ResamplingTask::new(&bus);

        let seen: Arc<Mutex<Vec<SignalBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus
            .subject::<SignalBuffer>("adaptive.signal")
            .subscribe(move |b: &SignalBuffer| sink.lock().unwrap().push(b.clone()));

        let samples = vec![0.5f32; 2000];
        let mut buffer =
            SignalBuffer::new(samples.len(), 1, 1, 1_000_000, 0, 0, SignalType::RawReal);
        buffer.put_slice(&samples);
        buffer.flip();

        task.process(&buffer);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].signal_type(), SignalType::AdvReal);
        // far fewer points than the input
        assert!(seen[0].elements() / 2 < 200);
    }
}

//! Adaptive down-sampling of raw sample streams into sparse
//! `(value, sample index)` pairs that still draw faithfully at display zoom
//! levels.

use crate::buffer::{SignalBuffer, SignalType};

/// Moving-average window for the radio deviation detector.
const WINDOW: usize = 51;

/// Deviation from the moving mean that forces a sample out.
const THRESHOLD: f32 = 0.005;

/// Maximum gap between emitted samples, bounded by the one-byte delta offset
/// of the trace storage format.
const LOGIC_INTERVAL: usize = 255;
const RADIO_INTERVAL: usize = 255;

/// Resample a logic stream: emit on level change or every
/// [`LOGIC_INTERVAL`] samples. Output carries stride-2 `(value, index)` pairs.
pub fn resample_logic(buffer: &SignalBuffer) -> SignalBuffer {
    let input = buffer.as_slice();

    let mut resampled = SignalBuffer::new(
        buffer.elements() * 2,
        2,
        1,
        buffer.sample_rate(),
        buffer.offset(),
        0,
        SignalType::AdvLogic,
    )
    .with_id(buffer.id());

    if input.is_empty() {
        resampled.flip();
        return resampled;
    }

    let mut last = input[0];
    resampled.put(last).put(0.0);

    let mut control = 0usize;

    for (i, &value) in input.iter().enumerate().skip(1) {
        if value != last || i - control >= LOGIC_INTERVAL {
            resampled.put(value).put(i as f32);
            last = value;
            control = i;
        }
    }

    resampled.flip();
    resampled
}

/// Resample a radio stream on deviation from a moving mean. A changed sample
/// is preceded by a hold point at the previous index so the reconstructed
/// polyline stays horizontal up to the change.
pub fn resample_radio(buffer: &SignalBuffer) -> SignalBuffer {
    let input = buffer.as_slice();

    let mut resampled = SignalBuffer::new(
        buffer.elements() * 2 + 4,
        2,
        1,
        buffer.sample_rate(),
        buffer.offset(),
        0,
        SignalType::AdvReal,
    )
    .with_id(buffer.id());

    if input.is_empty() {
        resampled.flip();
        return resampled;
    }

    let mut average: f32 = input.iter().take(WINDOW / 2).sum();

    // the first sample always goes out
    resampled.put(input[0]).put(0.0);

    let mut last = input[0];
    let mut control = 0usize;
    let mut previous: isize = -1;

    for i in 0..input.len() {
        let value = input[i];

        // slide the window: one in at the leading edge, one out at the tail
        let ahead = i + WINDOW / 2;
        if ahead < input.len() {
            average += input[ahead];
        }
        let tail = i as isize - (WINDOW / 2) as isize - 1;
        if tail >= 0 {
            average -= input[tail as usize];
        }

        let deviation = (value - average / WINDOW as f32).abs();

        if deviation > THRESHOLD || i - control >= RADIO_INTERVAL {
            // hold point keeps the preceding run flat
            if deviation > THRESHOLD && previous >= 0 && control < previous as usize {
                resampled.put(last).put(previous as f32);
            }

            resampled.put(value).put(i as f32);
            control = i;
        }

        last = value;
        previous = i as isize;
    }

    // close the stream on its final sample
    if control < previous as usize {
        resampled.put(last).put(previous as f32);
    }

    resampled.flip();
    resampled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logic_buffer(samples: &[f32]) -> SignalBuffer {
        let mut buffer =
            SignalBuffer::new(samples.len(), 1, 1, 10_000_000, 0, 0, SignalType::LogicSamples);
        buffer.put_slice(samples);
        buffer.flip();
        buffer
    }

    fn radio_buffer(samples: &[f32]) -> SignalBuffer {
        let mut buffer =
            SignalBuffer::new(samples.len(), 1, 1, 10_000_000, 0, 0, SignalType::RawReal);
        buffer.put_slice(samples);
        buffer.flip();
        buffer
    }

    fn pairs(buffer: &SignalBuffer) -> Vec<(f32, f32)> {
        buffer.as_slice().chunks(2).map(|c| (c[0], c[1])).collect()
    }

    #[test]
    fn logic_emits_on_edges_and_interval() {
        // 1 kHz-ish square wave: edge every 500 samples over 10_000 samples
        let samples: Vec<f32> =
            (0..10_000).map(|i| if (i / 500) % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let edges = 19;

        let out = resample_logic(&logic_buffer(&samples));
        assert_eq!(out.signal_type(), SignalType::AdvLogic);
        assert_eq!(out.stride(), 2);

        let count = out.elements() / 2;
        // bounded by edges plus one forced sample per max gap plus the first
        assert!(count <= edges + 10_000 / LOGIC_INTERVAL + 1);

        let points = pairs(&out);
        assert_eq!(points[0].1, 0.0);
        // every edge position must be present exactly
        for i in 1..20 {
            let index = (i * 500) as f32;
            assert!(points.iter().any(|p| p.1 == index), "missing edge at {index}");
        }
    }

    #[test]
    fn logic_flat_stream_emits_interval_markers_only() {
        let samples = vec![1.0f32; 1000];
        let out = resample_logic(&logic_buffer(&samples));
        let points = pairs(&out);
        // first sample plus one marker every LOGIC_INTERVAL samples
        assert_eq!(points.len(), 1 + 1000 / LOGIC_INTERVAL);
        assert!(points.iter().all(|p| p.0 == 1.0));
    }

    #[test]
    fn radio_emits_first_and_last_samples() {
        let samples = vec![0.25f32; 600];
        let out = resample_radio(&radio_buffer(&samples));
        let points = pairs(&out);

        assert_eq!(points.first().unwrap().1, 0.0);
        assert_eq!(points.last().unwrap().1, 599.0);
        assert_eq!(out.signal_type(), SignalType::AdvReal);
    }

    #[test]
    fn radio_step_emits_hold_point_before_change() {
        let mut samples = vec![0.1f32; 400];
        for s in samples.iter_mut().skip(200) {
            *s = 0.9;
        }

        let out = resample_radio(&radio_buffer(&samples));
        let points = pairs(&out);

        // the step at 200 must be bracketed by a hold at 199
        let step = points.iter().position(|p| p.1 == 200.0).expect("step sample");
        assert_eq!(points[step - 1].1, 199.0);
        assert!((points[step - 1].0 - 0.1).abs() < 1e-6);
        assert!((points[step].0 - 0.9).abs() < 1e-6);
    }

    #[test]
    fn radio_emission_bound_holds() {
        // noisy edges at known positions
        let mut samples = vec![0.2f32; 2000];
        let mut edges = 0;
        for i in (100..2000).step_by(400) {
            for s in samples.iter_mut().skip(i).take(5) {
                *s = 0.8;
            }
            edges += 1;
        }

        let out = resample_radio(&radio_buffer(&samples));
        let count = out.elements() / 2;

        // transition region around each burst is bounded by the window width
        let per_edge = 2 * (WINDOW + 5);
        assert!(count <= 2000 / RADIO_INTERVAL + 2 * edges * per_edge + 2);
    }
}

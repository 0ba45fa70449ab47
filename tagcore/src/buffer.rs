/// Semantic tag describing what the samples in a buffer mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Interleaved I/Q pairs straight from a radio receiver, stride 2
    RawIq,
    /// Real-valued magnitude samples, stride 1
    RawReal,
    /// Multichannel logic samples interleaved sample-major, stride = channel count
    LogicSamples,
    /// Magnitude bins of a windowed FFT, DC centred
    FftBin,
    /// Sparse (value, index) pairs for a logic channel, stride 2
    LogicSignal,
    /// Sparse (value, index) pairs for a radio channel, stride 2
    RadioSignal,
    /// Adaptive-resampled radio stream, stride 2
    AdvReal,
    /// Adaptive-resampled logic stream, stride 2
    AdvLogic,
}

/// Cursor-backed container of `f32` samples shared between a producer and a
/// single consumer.
///
/// Behaves like a flippable byte buffer: the producer reserves space with
/// [`push`](SignalBuffer::push) or appends with [`put`](SignalBuffer::put),
/// calls [`flip`](SignalBuffer::flip), and hands the buffer downstream. The
/// consumer drains it with [`get`](SignalBuffer::get) or reads it in place by
/// index. A buffer with no backing storage is the end-of-stream sentinel.
#[derive(Debug, Clone)]
pub struct SignalBuffer {
    data: Option<Vec<f32>>,
    position: usize,
    limit: usize,
    signal_type: SignalType,
    stride: usize,
    interleave: usize,
    sample_rate: u32,
    decimation: u32,
    offset: u64,
    id: u32,
}

impl SignalBuffer {
    pub fn new(
        capacity: usize,
        stride: usize,
        interleave: usize,
        sample_rate: u32,
        offset: u64,
        decimation: u32,
        signal_type: SignalType,
    ) -> Self {
        SignalBuffer {
            data: Some(vec![0.0; capacity]),
            position: 0,
            limit: capacity,
            signal_type,
            stride,
            interleave,
            sample_rate,
            decimation,
            offset,
            id: 0,
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// End-of-stream sentinel carrying no storage.
    pub fn eof(signal_type: SignalType) -> Self {
        SignalBuffer {
            data: None,
            position: 0,
            limit: 0,
            signal_type,
            stride: 1,
            interleave: 1,
            sample_rate: 0,
            decimation: 0,
            offset: 0,
            id: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.is_some()
    }

    pub fn signal_type(&self) -> SignalType {
        self.signal_type
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn interleave(&self) -> usize {
        self.interleave
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn decimation(&self) -> u32 {
        self.decimation
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Samples left between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Total elements written, valid after [`flip`](SignalBuffer::flip).
    pub fn elements(&self) -> usize {
        self.limit
    }

    pub fn is_full(&self) -> bool {
        self.position == self.capacity()
    }

    /// Reserve `count` contiguous samples at the current position and return
    /// them for writing. Returns `None` when the buffer cannot hold them.
    pub fn push(&mut self, count: usize) -> Option<&mut [f32]> {
        let data = self.data.as_mut()?;
        if self.position + count > data.len() {
            return None;
        }
        let start = self.position;
        self.position += count;
        Some(&mut data[start..start + count])
    }

    /// Append one sample, advancing position. Chainable.
    pub fn put(&mut self, value: f32) -> &mut Self {
        if let Some(slot) = self.push(1) {
            slot[0] = value;
        }
        self
    }

    pub fn put_slice(&mut self, values: &[f32]) -> &mut Self {
        if let Some(slots) = self.push(values.len()) {
            slots.copy_from_slice(values);
        }
        self
    }

    /// Prepare the buffer for reading: limit becomes the write position and
    /// the read cursor rewinds to zero.
    pub fn flip(&mut self) -> &mut Self {
        self.limit = self.position;
        self.position = 0;
        self
    }

    /// Read one sample, advancing position.
    pub fn get(&mut self) -> Option<f32> {
        if self.position >= self.limit {
            return None;
        }
        let value = self.data.as_ref()?[self.position];
        self.position += 1;
        Some(value)
    }

    /// Fill `out` from the current position, advancing it. Returns samples read.
    pub fn get_slice(&mut self, out: &mut [f32]) -> usize {
        let count = out.len().min(self.remaining());
        if let Some(data) = self.data.as_ref() {
            out[..count].copy_from_slice(&data[self.position..self.position + count]);
            self.position += count;
        }
        count
    }

    /// Read the sample at `position + index` without advancing.
    pub fn sample(&self, index: usize) -> f32 {
        self.data.as_ref().map(|d| d[self.position + index]).unwrap_or(0.0)
    }

    /// Whole backing slice up to limit, ignoring the read cursor.
    pub fn as_slice(&self) -> &[f32] {
        match self.data.as_ref() {
            Some(data) => &data[..self.limit],
            None => &[],
        }
    }
}

impl Default for SignalBuffer {
    fn default() -> Self {
        SignalBuffer::eof(SignalType::RawReal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_flip_get() {
        let mut buffer = SignalBuffer::new(8, 1, 1, 1000, 0, 0, SignalType::RawReal);
        buffer.put(1.0).put(2.0).put(3.0);
        assert_eq!(buffer.position(), 3);
        buffer.flip();
        assert_eq!(buffer.limit(), 3);
        assert_eq!(buffer.remaining(), 3);
        assert_eq!(buffer.get(), Some(1.0));
        assert_eq!(buffer.sample(0), 2.0);
        assert_eq!(buffer.get(), Some(2.0));
        assert_eq!(buffer.get(), Some(3.0));
        assert_eq!(buffer.get(), None);
    }

    #[test]
    fn push_reserves_contiguous_region() {
        let mut buffer = SignalBuffer::new(4, 2, 1, 1000, 10, 0, SignalType::LogicSignal);
        {
            let slots = buffer.push(4).unwrap();
            slots.copy_from_slice(&[1.0, 0.0, 0.0, 3.0]);
        }
        assert!(buffer.push(1).is_none());
        buffer.flip();
        assert_eq!(buffer.as_slice(), &[1.0, 0.0, 0.0, 3.0]);
        assert_eq!(buffer.offset(), 10);
    }

    #[test]
    fn eof_sentinel_is_invalid() {
        let buffer = SignalBuffer::eof(SignalType::RawIq);
        assert!(!buffer.is_valid());
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn cursor_invariant_holds() {
        let mut buffer = SignalBuffer::new(16, 1, 1, 1000, 0, 0, SignalType::RawReal);
        for i in 0..10 {
            buffer.put(i as f32);
            assert!(buffer.position() <= buffer.limit());
            assert!(buffer.limit() <= buffer.capacity());
        }
        buffer.flip();
        assert!(buffer.position() <= buffer.limit());
    }
}

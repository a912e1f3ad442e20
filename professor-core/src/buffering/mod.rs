//! Lock-free SPSC ring buffer between the input device callback and the
//! capture worker.
//!
//! Uses `ringbuf::HeapRb<f32>`: `push_slice` is wait-free and safe to call
//! from the real-time audio callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the input device callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture worker.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^19 = 524 288 f32 samples ≈ 10.9 s at 48 kHz.
pub const RING_CAPACITY: usize = 1 << 19;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_hands_samples_from_producer_to_consumer_in_order() {
        let (mut producer, mut consumer) = create_audio_ring();
        assert_eq!(producer.push_slice(&[0.1, 0.2, 0.3]), 3);

        let mut out = [0f32; 4];
        let n = consumer.pop_slice(&mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..n], &[0.1, 0.2, 0.3]);
    }
}

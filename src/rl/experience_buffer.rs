//! Replay buffer for DQN training
//!
//! Bounded pool of experiences popped from the durable queue. Oldest entries
//! are evicted at capacity; mini-batches are sampled uniformly without
//! replacement.

use rand::Rng;
use std::collections::VecDeque;

use crate::types::Experience;

/// Ring buffer for experience storage
pub struct ReplayBuffer {
    buffer: VecDeque<Experience>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add experience to buffer
    pub fn push(&mut self, exp: Experience) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(exp);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether training may start
    pub fn ready(&self, min_size: usize) -> bool {
        self.buffer.len() >= min_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.buffer.iter()
    }

    /// Uniform sample of `batch_size` distinct experiences, or fewer when the
    /// buffer is smaller.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<&Experience> {
        let n = batch_size.min(self.buffer.len());
        rand::seq::index::sample(rng, self.buffer.len(), n)
            .into_iter()
            .map(|i| &self.buffer[i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn make_exp(reward: f32) -> Experience {
        Experience {
            state: vec![reward; 3],
            action: 1,
            reward,
            next_state: vec![0.0; 3],
            done: false,
            quantity: 0.001,
        }
    }

    #[test]
    fn test_buffer_capacity() {
        let mut buffer = ReplayBuffer::new(3);
        buffer.push(make_exp(1.0));
        buffer.push(make_exp(2.0));
        buffer.push(make_exp(3.0));
        assert_eq!(buffer.len(), 3);

        buffer.push(make_exp(4.0));
        assert_eq!(buffer.len(), 3);

        // First experience should be evicted
        let first_reward = buffer.iter().next().unwrap().reward;
        assert_eq!(first_reward, 2.0);
    }

    #[test]
    fn test_sample_without_replacement() {
        let mut buffer = ReplayBuffer::new(100);
        for i in 0..50 {
            buffer.push(make_exp(i as f32));
        }
        let mut rng = StdRng::seed_from_u64(42);
        let batch = buffer.sample(20, &mut rng);
        assert_eq!(batch.len(), 20);
        let distinct: HashSet<u32> = batch.iter().map(|e| e.reward as u32).collect();
        assert_eq!(distinct.len(), 20);
    }

    #[test]
    fn test_sample_larger_than_buffer() {
        let mut buffer = ReplayBuffer::new(10);
        buffer.push(make_exp(1.0));
        buffer.push(make_exp(2.0));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(buffer.sample(64, &mut rng).len(), 2);
        assert!(buffer.ready(2));
        assert!(!buffer.ready(3));
    }
}

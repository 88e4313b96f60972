//! Rotating shuffle buffer for pass 2

use rand::Rng;

use crate::point::PointBuffer;

/// Fixed-capacity batch of points; each batch gets a new buffer id
#[derive(Debug)]
pub struct ShuffleBuffer {
    points: PointBuffer,
    capacity: usize,
    id: u16,
}

impl ShuffleBuffer {
    pub fn new(record_len: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: PointBuffer::with_capacity(record_len, capacity.min(1 << 20)),
            capacity,
            id: 0,
        }
    }

    /// Append a point; true once the buffer is full
    pub fn push(&mut self, record: &[u8]) -> bool {
        self.points.push(record);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Id of the batch currently being filled
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.points.shuffle(rng);
    }

    pub fn points(&self) -> &PointBuffer {
        &self.points
    }

    /// Empty the buffer and move on to the next batch id
    pub fn rotate(&mut self) {
        self.points.clear();
        self.id = self.id.wrapping_add(1);
    }
}

//! Growable buffer of fixed-length point records

use rand::Rng;

use super::format::PointView;

/// Records smaller than this many points grow to it on first reallocation
const MIN_GROWTH_RECORDS: usize = 64;

/// Contiguous storage for fixed-length point records.
///
/// Records stay opaque byte blobs; `PointView` gives typed access to the
/// fields the builder needs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointBuffer {
    record_len: usize,
    data: Vec<u8>,
}

impl PointBuffer {
    pub fn new(record_len: usize) -> Self {
        Self { record_len, data: Vec::new() }
    }

    pub fn with_capacity(record_len: usize, records: usize) -> Self {
        Self { record_len, data: Vec::with_capacity(record_len * records) }
    }

    /// Wrap already encoded records. Trailing partial records are rejected.
    pub fn from_bytes(record_len: usize, data: Vec<u8>) -> Option<Self> {
        (record_len > 0 && data.len() % record_len == 0).then_some(Self { record_len, data })
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Number of records
    pub fn len(&self) -> usize {
        if self.record_len == 0 { 0 } else { self.data.len() / self.record_len }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capacity in records
    pub fn capacity(&self) -> usize {
        if self.record_len == 0 { 0 } else { self.data.capacity() / self.record_len }
    }

    /// Append one record, doubling the allocation when full
    pub fn push(&mut self, record: &[u8]) {
        debug_assert_eq!(record.len(), self.record_len, "record length mismatch");
        if self.data.len() + self.record_len > self.data.capacity() {
            let grow = self.data.capacity().max(self.record_len * MIN_GROWTH_RECORDS);
            self.data.reserve_exact(grow);
        }
        self.data.extend_from_slice(record);
    }

    pub fn record(&self, index: usize) -> &[u8] {
        let start = index * self.record_len;
        &self.data[start..start + self.record_len]
    }

    pub fn record_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.record_len;
        &mut self.data[start..start + self.record_len]
    }

    pub fn view(&self, index: usize) -> PointView<'_> {
        PointView::new(self.record(index))
    }

    /// Exchange the stored record at `index` with `incoming`
    pub fn swap_with(&mut self, index: usize, incoming: &mut [u8]) {
        self.record_mut(index).swap_with_slice(incoming);
    }

    /// Exchange two stored records
    pub fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let len = self.record_len;
        let (head, tail) = self.data.split_at_mut(hi * len);
        head[lo * len..(lo + 1) * len].swap_with_slice(&mut tail[..len]);
    }

    /// Uniform in-place permutation (Fisher-Yates)
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for i in (1..self.len()).rev() {
            let j = rng.random_range(0..=i);
            self.swap(i, j);
        }
    }

    /// Order records by GPS time, then scanner channel, then return number.
    ///
    /// Consecutive records from the same pulse compress better.
    pub fn sort_for_compression(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            let (ta, ca, ra) = self.view(a).compression_order();
            let (tb, cb, rb) = self.view(b).compression_order();
            ta.total_cmp(&tb).then(ca.cmp(&cb)).then(ra.cmp(&rb))
        });
        let mut sorted = Vec::with_capacity(self.data.len());
        for index in order {
            sorted.extend_from_slice(self.record(index));
        }
        self.data = sorted;
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.record_len.max(1))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Drop the contents and the allocation
    pub fn release(&mut self) {
        self.data = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::format::{PointFormat, PointRecord};
    use glam::IVec3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn record(x: i32, gps: f64, channel: u8, ret: u8) -> Vec<u8> {
        PointRecord::new(PointFormat::pdrf6())
            .with_raw_xyz(IVec3::new(x, 0, 0))
            .with_gps_time(gps)
            .with_scanner_channel(channel)
            .with_returns(ret, 3)
            .into_bytes()
    }

    fn xs(buffer: &PointBuffer) -> Vec<i32> {
        (0..buffer.len()).map(|i| buffer.view(i).raw_xyz().x).collect()
    }

    #[test]
    fn test_push_and_grow() {
        let mut buffer = PointBuffer::new(30);
        for i in 0..200 {
            buffer.push(&record(i, 0.0, 0, 1));
        }
        assert_eq!(buffer.len(), 200);
        assert!(buffer.capacity() >= 200);
        assert_eq!(buffer.view(150).raw_xyz().x, 150);
    }

    #[test]
    fn test_swap_with_returns_previous_occupant() {
        let mut buffer = PointBuffer::new(30);
        buffer.push(&record(1, 0.0, 0, 1));
        buffer.push(&record(2, 0.0, 0, 1));
        let mut incoming = record(9, 0.0, 0, 1);
        buffer.swap_with(1, &mut incoming);
        assert_eq!(xs(&buffer), vec![1, 9]);
        assert_eq!(PointView::new(&incoming).raw_xyz().x, 2);
    }

    #[test]
    fn test_sort_for_compression() {
        let mut buffer = PointBuffer::new(30);
        buffer.push(&record(0, 5.0, 0, 1));
        buffer.push(&record(1, 1.0, 1, 2));
        buffer.push(&record(2, 1.0, 1, 1));
        buffer.push(&record(3, 1.0, 0, 3));
        buffer.sort_for_compression();
        assert_eq!(xs(&buffer), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let mut buffer = PointBuffer::new(30);
        for i in 0..100 {
            buffer.push(&record(i, 0.0, 0, 1));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        buffer.shuffle(&mut rng);
        let mut values = xs(&buffer);
        assert_ne!(values, (0..100).collect::<Vec<_>>());
        values.sort();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_from_bytes_rejects_partial_record() {
        assert!(PointBuffer::from_bytes(30, vec![0; 60]).is_some());
        assert!(PointBuffer::from_bytes(30, vec![0; 61]).is_none());
    }
}

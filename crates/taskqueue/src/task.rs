use byteorder::{BigEndian, ByteOrder};

/// A durable task scheduled for a wall-clock instant.
///
/// The storage key is the 8-byte big-endian scheduled time followed by the
/// task's data key, so lexicographic key order equals scheduled-time order.
/// The data key is required: it is what tells two tasks scheduled for the
/// same millisecond apart. Scheduling a task whose time and data key both
/// collide with an existing one overwrites it.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    scheduled_ms: i64,
    data_key: Vec<u8>,
    value: Vec<u8>,
    completed: bool,
}

impl ScheduledTask {
    pub fn new(scheduled_ms: i64, data_key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        let data_key = data_key.into();
        assert!(scheduled_ms >= 0, "scheduled time must be non-negative");
        assert!(!data_key.is_empty(), "a scheduled task requires a data key");
        ScheduledTask {
            scheduled_ms,
            data_key,
            value: value.into(),
            completed: false,
        }
    }

    /// Big-endian encoding preserves numeric order under byte-wise
    /// comparison.
    pub fn encode_timestamp(timestamp_ms: i64) -> [u8; 8] {
        assert!(timestamp_ms >= 0, "timestamps must be non-negative");
        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, timestamp_ms);
        buf
    }

    pub fn decode_timestamp(buf: &[u8]) -> i64 {
        BigEndian::read_i64(&buf[..8])
    }

    /// Split a storage key back into its scheduled time and data key.
    pub fn split_key(key: &[u8]) -> (i64, &[u8]) {
        (Self::decode_timestamp(key), &key[8..])
    }

    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + self.data_key.len());
        key.extend_from_slice(&Self::encode_timestamp(self.scheduled_ms));
        key.extend_from_slice(&self.data_key);
        key
    }

    pub fn scheduled_ms(&self) -> i64 {
        self.scheduled_ms
    }

    pub fn data_key(&self) -> &[u8] {
        &self.data_key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Signal that this task has been fully processed; the queue deletes it
    /// when the processing batch commits.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        // The storage key is derived and `completed` is transient batch
        // state; neither participates in identity.
        self.scheduled_ms == other.scheduled_ms
            && self.data_key == other.data_key
            && self.value == other.value
    }
}

impl Eq for ScheduledTask {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_timestamp_then_data_key() {
        let task = ScheduledTask::new(0x0102030405060708, "dk", "v");
        assert_eq!(
            task.key(),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, b'd', b'k']
        );
    }

    #[test]
    fn timestamp_roundtrip() {
        for ts in [0i64, 1, 1462295107012, i64::MAX] {
            assert_eq!(
                ScheduledTask::decode_timestamp(&ScheduledTask::encode_timestamp(ts)),
                ts
            );
        }
    }

    #[test]
    fn key_order_follows_time_order() {
        let earlier = ScheduledTask::new(1462295107012, "z", "");
        let later = ScheduledTask::new(1472295107012, "a", "");
        // Time dominates the comparison even though the data keys sort the
        // other way.
        assert!(earlier.key() < later.key());

        // Same instant orders by data key.
        let first = ScheduledTask::new(1462295107012, "a", "");
        let second = ScheduledTask::new(1462295107012, "b", "");
        assert!(first.key() < second.key());
    }

    #[test]
    fn split_key_recovers_both_parts() {
        let task = ScheduledTask::new(1462295107012, "data-key", "payload");
        let key = task.key();
        let (ts, data_key) = ScheduledTask::split_key(&key);
        assert_eq!(ts, 1462295107012);
        assert_eq!(data_key, b"data-key");
    }

    #[test]
    fn equality_ignores_completion() {
        let mut a = ScheduledTask::new(5, "k", "v");
        let b = ScheduledTask::new(5, "k", "v");
        a.mark_completed();
        assert_eq!(a, b);
        assert_ne!(a, ScheduledTask::new(5, "k", "other"));
    }

    #[test]
    #[should_panic(expected = "requires a data key")]
    fn empty_data_key_is_rejected() {
        ScheduledTask::new(5, "", "v");
    }
}

use std::collections::VecDeque;

use codec::RespValue;

/// Serializes responses back into request-arrival order.
///
/// Every decoded request is assigned the next sequence key and a pending
/// reply slot. Handlers resolve keys in whatever order they complete;
/// resolved replies are released only once every lower-keyed reply has been
/// released first. The queue length equals the requests currently in
/// flight, which bounds per-connection memory.
pub struct OrderedReplies {
    start_key: i64,
    pending: VecDeque<RespValue>,
}

impl OrderedReplies {
    pub fn new() -> Self {
        OrderedReplies {
            start_key: 0,
            pending: VecDeque::new(),
        }
    }

    /// Assign the sequence key for a newly-arrived request.
    pub fn begin_request(&mut self) -> i64 {
        let key = self.start_key + self.pending.len() as i64;
        self.pending.push_back(RespValue::Pending);
        key
    }

    /// Fill the slot for `key` and emit every reply that is now ready, in
    /// key order. A double resolution, an unknown key, or a `Pending` value
    /// is a programming error in the handler and panics.
    pub fn resolve(&mut self, key: i64, value: RespValue, mut emit: impl FnMut(RespValue)) {
        assert!(
            !value.is_pending(),
            "a reply cannot be resolved with a pending value"
        );
        let index = key - self.start_key;
        assert!(
            index >= 0 && (index as usize) < self.pending.len(),
            "reply key {key} is not in flight"
        );
        let slot = &mut self.pending[index as usize];
        assert!(slot.is_pending(), "reply key {key} was already resolved");
        *slot = value;

        while let Some(front) = self.pending.front() {
            if front.is_pending() {
                break;
            }
            emit(self.pending.pop_front().unwrap());
            self.start_key += 1;
        }
    }

    /// Requests whose replies have not yet been released.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Default for OrderedReplies {
    fn default() -> Self {
        Self::new()
    }
}

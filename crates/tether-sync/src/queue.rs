//! Offline queue: pending pushes held while the channel is disconnected.

use tether_core::{Envelope, RtId};

/// Pending envelopes keyed by runtime id, in first-queued order.
///
/// Each runtime id has at most one pending envelope. Queuing a newer envelope
/// for the same id replaces the content but keeps the original position.
#[derive(Debug, Clone, Default)]
pub struct OfflineQueue {
    entries: Vec<(RtId, Envelope)>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an envelope, returning the one it replaced.
    pub fn insert(&mut self, rt_id: RtId, envelope: Envelope) -> Option<Envelope> {
        match self.entries.iter_mut().find(|(id, _)| *id == rt_id) {
            Some((_, slot)) => Some(std::mem::replace(slot, envelope)),
            None => {
                self.entries.push((rt_id, envelope));
                None
            }
        }
    }

    /// The pending envelope for a runtime id.
    pub fn get(&self, rt_id: RtId) -> Option<&Envelope> {
        self.entries
            .iter()
            .find(|(id, _)| *id == rt_id)
            .map(|(_, envelope)| envelope)
    }

    /// Remove the pending envelope for a runtime id.
    pub fn remove(&mut self, rt_id: RtId) -> Option<Envelope> {
        let index = self.entries.iter().position(|(id, _)| *id == rt_id)?;
        Some(self.entries.remove(index).1)
    }

    /// Take the oldest pending envelope.
    pub fn pop_front(&mut self) -> Option<(RtId, Envelope)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Take everything, oldest first.
    pub fn take_all(&mut self) -> Vec<(RtId, Envelope)> {
        std::mem::take(&mut self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(RtId, Envelope)> {
        self.entries.iter()
    }

    pub fn envelopes_mut(&mut self) -> impl Iterator<Item = &mut Envelope> {
        self.entries.iter_mut().map(|(_, envelope)| envelope)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(rt: u64, v: i64) -> Envelope {
        Envelope::save(json!({ "v": v })).with_rt_id(RtId(rt))
    }

    #[test]
    fn test_latest_wins_per_id_and_keeps_position() {
        let mut queue = OfflineQueue::new();
        assert!(queue.insert(RtId(1), envelope(1, 1)).is_none());
        assert!(queue.insert(RtId(2), envelope(2, 2)).is_none());
        let replaced = queue.insert(RtId(1), envelope(1, 3));

        assert_eq!(replaced, Some(envelope(1, 1)));
        assert_eq!(queue.len(), 2);

        let drained: Vec<_> = queue.take_all();
        assert_eq!(drained[0], (RtId(1), envelope(1, 3)));
        assert_eq!(drained[1], (RtId(2), envelope(2, 2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_front_in_insertion_order() {
        let mut queue = OfflineQueue::new();
        queue.insert(RtId(5), envelope(5, 0));
        queue.insert(RtId(3), envelope(3, 0));

        assert_eq!(queue.pop_front().map(|(id, _)| id), Some(RtId(5)));
        assert_eq!(queue.get(RtId(3)), Some(&envelope(3, 0)));
        assert_eq!(queue.pop_front().map(|(id, _)| id), Some(RtId(3)));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_remove_keeps_others_in_order() {
        let mut queue = OfflineQueue::new();
        queue.insert(RtId(1), envelope(1, 0));
        queue.insert(RtId(2), envelope(2, 0));
        queue.insert(RtId(3), envelope(3, 0));

        assert_eq!(queue.remove(RtId(2)), Some(envelope(2, 0)));
        assert!(queue.remove(RtId(2)).is_none());
        let left: Vec<RtId> = queue.iter().map(|(id, _)| *id).collect();
        assert_eq!(left, vec![RtId(1), RtId(3)]);
    }
}

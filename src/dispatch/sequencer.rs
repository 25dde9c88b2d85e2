//! Response ordering towards the client.
//!
//! Every client request that expects a response reserves a slot when it
//! arrives. A slot is filled by an upstream response, a short-circuit
//! response, or released empty when the request or its response is dropped.
//! Only the contiguous run of filled slots at the head is ever flushed, so the
//! client observes responses in request order.

use std::collections::VecDeque;

use crate::frame::ResponseFrame;

enum Slot {
    Pending,
    Ready(Option<ResponseFrame>),
}

#[derive(Default)]
pub(crate) struct ResponseSequencer {
    /// Slot number of `slots[0]`.
    head: u64,
    slots: VecDeque<Slot>,
}

impl ResponseSequencer {
    pub(crate) fn reserve(&mut self) -> u64 {
        self.slots.push_back(Slot::Pending);
        self.head + self.slots.len() as u64 - 1
    }

    /// Fill a reserved slot. `None` releases it without a response.
    pub(crate) fn fill(&mut self, slot: u64, response: Option<ResponseFrame>) {
        let Some(offset) = slot.checked_sub(self.head) else {
            return;
        };
        if let Some(entry) = self.slots.get_mut(offset as usize) {
            *entry = Slot::Ready(response);
        }
    }

    /// Remove and return the responses that are now deliverable, in order.
    pub(crate) fn drain_ready(&mut self) -> Vec<ResponseFrame> {
        let mut ready = Vec::new();
        while let Some(Slot::Ready(_)) = self.slots.front() {
            if let Some(Slot::Ready(response)) = self.slots.pop_front() {
                ready.extend(response);
            }
            self.head += 1;
        }
        ready
    }

    /// Slots reserved but not yet flushed.
    pub(crate) fn outstanding(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots flushed so far; every slot below it has been delivered.
    pub(crate) fn flushed(&self) -> u64 {
        self.head
    }

    /// Slot number the next `reserve` will hand out.
    pub(crate) fn next_slot(&self) -> u64 {
        self.head + self.slots.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ApiKey, ResponseHeader};
    use bytes::Bytes;

    fn response(correlation_id: u32) -> ResponseFrame {
        ResponseFrame {
            api_key: ApiKey::Metadata,
            api_version: 12,
            header: ResponseHeader { correlation_id },
            body: Bytes::new(),
        }
    }

    fn ids(frames: Vec<ResponseFrame>) -> Vec<u32> {
        frames.iter().map(ResponseFrame::correlation_id).collect()
    }

    #[test]
    fn later_slots_wait_for_the_head() {
        let mut sequencer = ResponseSequencer::default();
        let first = sequencer.reserve();
        let second = sequencer.reserve();
        let third = sequencer.reserve();

        sequencer.fill(third, Some(response(3)));
        sequencer.fill(second, Some(response(2)));
        assert!(sequencer.drain_ready().is_empty());

        sequencer.fill(first, Some(response(1)));
        assert_eq!(ids(sequencer.drain_ready()), vec![1, 2, 3]);
        assert_eq!(sequencer.outstanding(), 0);
    }

    #[test]
    fn released_slots_are_skipped() {
        let mut sequencer = ResponseSequencer::default();
        let first = sequencer.reserve();
        let second = sequencer.reserve();
        sequencer.fill(first, None);
        assert!(sequencer.drain_ready().is_empty());
        assert_eq!(sequencer.outstanding(), 1);

        let third = sequencer.reserve();
        sequencer.fill(third, Some(response(3)));
        sequencer.fill(second, Some(response(2)));
        assert_eq!(ids(sequencer.drain_ready()), vec![2, 3]);
        assert_eq!(sequencer.flushed(), 3);
        assert_eq!(sequencer.next_slot(), 3);
    }
}

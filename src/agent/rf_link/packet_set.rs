//! Accumulates frames for one in-flight message, keyed by `package_number`.
//! Used on both ends of the link: the receiver builds one per inbound
//! message, and the sender builds one (transiently) to collect ACK frames.

use std::collections::BTreeMap;

use super::frame::Frame;

#[derive(Default)]
pub struct PacketSet {
    source: Option<u16>,
    total: Option<u16>,
    frames: BTreeMap<u16, Frame>,
}

impl PacketSet {
    pub fn new() -> PacketSet {
        PacketSet::default()
    }

    /// Folds `frame` in. A frame whose `source_address`/`total_packages`
    /// disagrees with what's accumulated so far starts a fresh message —
    /// the previous, never-completed one is discarded rather than mixed
    /// with the new one.
    pub fn accept(&mut self, frame: Frame) {
        let is_new_message = self.source.map_or(true, |src| src != frame.source_address) || self.total.map_or(true, |t| t != frame.total_packages);
        if is_new_message {
            self.frames.clear();
        }
        self.source = Some(frame.source_address);
        self.total = Some(frame.total_packages);
        self.frames.insert(frame.package_number, frame);
    }

    pub fn source(&self) -> Option<u16> {
        self.source
    }

    pub fn has_any(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn received_numbers(&self) -> Vec<u16> {
        self.frames.keys().copied().collect()
    }

    pub fn is_complete(&self) -> bool {
        match self.total {
            Some(total) => self.frames.len() as u16 == total,
            None => false,
        }
    }

    /// Concatenates every accumulated body in `package_number` order,
    /// regardless of whether the set is complete. Used both to deliver a
    /// finished message and to decode an (often single-frame) ACK body.
    pub fn concat_bodies(&self) -> Vec<u8> {
        self.frames.values().flat_map(|f| f.body).collect()
    }

    /// `concat_bodies`, but only once every package in `0..total` has
    /// arrived — the contract for delivering a reassembled message to
    /// subscribers.
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.concat_bodies())
    }

    pub fn reset(&mut self) {
        self.source = None;
        self.total = None;
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(total: u16, number: u16, byte: u8) -> Frame {
        Frame { target_address: 9, source_address: 1, total_packages: total, package_number: number, body: [byte; 8] }
    }

    #[test]
    fn incomplete_set_does_not_reassemble() {
        let mut set = PacketSet::new();
        set.accept(frame(3, 0, 1));
        set.accept(frame(3, 2, 3));
        assert!(!set.is_complete());
        assert_eq!(set.reassemble(), None);
        assert_eq!(set.received_numbers(), vec![0, 2]);
    }

    #[test]
    fn complete_set_reassembles_in_package_order_regardless_of_arrival_order() {
        let mut set = PacketSet::new();
        set.accept(frame(2, 1, 2));
        set.accept(frame(2, 0, 1));
        assert!(set.is_complete());
        assert_eq!(set.reassemble(), Some(vec![1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2]));
    }

    #[test]
    fn a_frame_from_a_new_message_resets_accumulation() {
        let mut set = PacketSet::new();
        set.accept(frame(3, 0, 1));
        set.accept(Frame { source_address: 2, ..frame(3, 0, 9) });
        assert_eq!(set.received_numbers(), vec![0]);
        assert_eq!(set.source(), Some(2));
    }
}

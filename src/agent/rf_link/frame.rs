//! Wire layout of one RF packet: a fixed 17-byte, big-endian frame with an
//! 8-byte body and a trailing XOR parity byte. `byteorder` reads/writes the
//! multi-byte integer fields; nothing here touches a GPIO pin.

use byteorder::{BigEndian, ByteOrder};

/// Bytes of payload carried by one frame.
pub const BODY_LEN: usize = 8;
/// Total on-wire size: two address fields, two count fields, the body,
/// and one parity byte.
pub const FRAME_LEN: usize = 17;
/// Package-number value reserved as ACK-body padding; never a real index.
pub const ACK_PADDING: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub target_address: u16,
    pub source_address: u16,
    pub total_packages: u16,
    pub package_number: u16,
    pub body: [u8; BODY_LEN],
}

/// XOR of every byte in `bytes`. Applied to frame bytes `0..16` to produce
/// (or check) byte `16`.
pub fn parity(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

impl Frame {
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        BigEndian::write_u16(&mut buf[0..2], self.target_address);
        BigEndian::write_u16(&mut buf[2..4], self.source_address);
        BigEndian::write_u16(&mut buf[4..6], self.total_packages);
        BigEndian::write_u16(&mut buf[6..8], self.package_number);
        buf[8..16].copy_from_slice(&self.body);
        buf[16] = parity(&buf[0..16]);
        buf
    }

    /// Rejects a frame whose trailing byte doesn't match the XOR of the
    /// first sixteen — this is the only resynchronization signal the link
    /// has, since the wire format carries no preamble.
    pub fn is_valid(bytes: &[u8; FRAME_LEN]) -> bool {
        parity(&bytes[0..16]) == bytes[16]
    }

    pub fn from_bytes(bytes: &[u8; FRAME_LEN]) -> Option<Frame> {
        if !Self::is_valid(bytes) {
            return None;
        }
        let mut body = [0u8; BODY_LEN];
        body.copy_from_slice(&bytes[8..16]);
        Some(Frame {
            target_address: BigEndian::read_u16(&bytes[0..2]),
            source_address: BigEndian::read_u16(&bytes[2..4]),
            total_packages: BigEndian::read_u16(&bytes[4..6]),
            package_number: BigEndian::read_u16(&bytes[6..8]),
            body,
        })
    }
}

/// Splits `body` into `ceil(len/BODY_LEN)` frames addressed `source ->
/// target`; the final frame's tail is zero-padded. An empty `body`
/// produces zero frames.
pub fn packetize(source: u16, target: u16, body: &[u8]) -> Vec<Frame> {
    if body.is_empty() {
        return Vec::new();
    }
    let total = ((body.len() + BODY_LEN - 1) / BODY_LEN) as u16;
    body.chunks(BODY_LEN)
        .enumerate()
        .map(|(index, chunk)| {
            let mut buf = [0u8; BODY_LEN];
            buf[..chunk.len()].copy_from_slice(chunk);
            Frame { target_address: target, source_address: source, total_packages: total, package_number: index as u16, body: buf }
        })
        .collect()
}

/// Encodes the set of acknowledged package numbers as an ACK body, sorted
/// and padded to a multiple of `BODY_LEN` with [`ACK_PADDING`] entries (not
/// `0x0000`, which is a valid package number).
pub fn encode_ack_body(received: &[u16]) -> Vec<u8> {
    let mut sorted: Vec<u16> = received.to_vec();
    sorted.sort_unstable();

    let mut bytes = Vec::with_capacity(sorted.len() * 2);
    for number in &sorted {
        let mut entry = [0u8; 2];
        BigEndian::write_u16(&mut entry, *number);
        bytes.extend_from_slice(&entry);
    }
    while bytes.len() % BODY_LEN != 0 {
        let mut padding = [0u8; 2];
        BigEndian::write_u16(&mut padding, ACK_PADDING);
        bytes.extend_from_slice(&padding);
    }
    bytes
}

/// Reverses [`encode_ack_body`], dropping padding entries.
pub fn decode_ack_body(body: &[u8]) -> Vec<u16> {
    body.chunks_exact(2).map(BigEndian::read_u16).filter(|&n| n != ACK_PADDING).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame { target_address: 0x0102, source_address: 0x0304, total_packages: 4, package_number: 2, body: [1, 2, 3, 4, 5, 6, 7, 8] }
    }

    #[test]
    fn round_trips_through_bytes() {
        let frame = sample_frame();
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FRAME_LEN);
        assert_eq!(Frame::from_bytes(&bytes), Some(frame));
    }

    #[test]
    fn parity_is_xor_of_the_first_sixteen_bytes() {
        let bytes = sample_frame().to_bytes();
        assert_eq!(bytes[16], parity(&bytes[0..16]));
    }

    #[test]
    fn single_bit_corruption_is_rejected() {
        let mut bytes = sample_frame().to_bytes();
        bytes[3] ^= 0x01;
        assert!(!Frame::is_valid(&bytes));
        assert_eq!(Frame::from_bytes(&bytes), None);
    }

    #[test]
    fn packetize_splits_and_zero_pads_the_tail() {
        let body = [0xAAu8; 20];
        let frames = packetize(1, 2, &body);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].total_packages, 3);
        assert_eq!(frames[2].body, [0xAA, 0xAA, 0xAA, 0xAA, 0, 0, 0, 0]);
    }

    #[test]
    fn packetize_of_empty_body_yields_no_frames() {
        assert!(packetize(1, 2, &[]).is_empty());
    }

    #[test]
    fn ack_body_round_trips_and_strips_padding() {
        let body = encode_ack_body(&[0, 1, 3]);
        assert_eq!(body.len() % BODY_LEN, 0);
        assert_eq!(decode_ack_body(&body), vec![0, 1, 3]);
    }

    #[test]
    fn ack_padding_survives_a_zero_package_number() {
        // 0x0000 is a legitimate package number and must not be confused
        // with padding once it's mixed with filler entries.
        let body = encode_ack_body(&[0]);
        assert_eq!(decode_ack_body(&body), vec![0]);
    }
}

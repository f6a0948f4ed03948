//! Minimal HTTP/2 frame layer for the RemoteXPC channel.
//!
//! Producer-oriented: just enough of RFC 9113 to drive the XPC
//! handshake — SETTINGS, WINDOW_UPDATE, empty HEADERS, and DATA frames.
//! Inbound traffic is parsed only at the frame-header level, enough to
//! pull XPC messages out of DATA frames and recognize a SETTINGS ACK.

/// Client connection preface, sent before any frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_SIZE: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;

pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 4;

/// The fixed 9-byte header every frame starts with: 24-bit length,
/// type, flags, and a 31-bit stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(length: u32, kind: u8, flags: u8, stream_id: u32) -> Self {
        Self {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0..3].copy_from_slice(&self.length.to_be_bytes()[1..4]);
        out[3] = self.kind;
        out[4] = self.flags;
        out[5..9].copy_from_slice(&(self.stream_id & 0x7FFF_FFFF).to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let stream_id =
            u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7FFF_FFFF;
        Self {
            length,
            kind: buf[3],
            flags: buf[4],
            stream_id,
        }
    }

    pub fn is_settings_ack(&self) -> bool {
        self.kind == FRAME_SETTINGS && self.flags & FLAG_ACK != 0
    }
}

fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(payload.len() as u32, kind, flags, stream_id);
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

/// SETTINGS frame carrying `(identifier, value)` pairs on stream 0.
pub fn settings_frame(pairs: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(pairs.len() * 6);
    for (id, value) in pairs {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    frame(FRAME_SETTINGS, 0, 0, &payload)
}

/// SETTINGS acknowledgement: the ACK flag with an empty payload.
pub fn settings_ack_frame() -> Vec<u8> {
    frame(FRAME_SETTINGS, FLAG_ACK, 0, &[])
}

pub fn window_update_frame(stream_id: u32, increment: u32) -> Vec<u8> {
    frame(
        FRAME_WINDOW_UPDATE,
        0,
        stream_id,
        &(increment & 0x7FFF_FFFF).to_be_bytes(),
    )
}

/// HEADERS frame opening a stream: an empty header block with
/// END_HEADERS set, which is all the XPC dialect ever sends.
pub fn headers_frame(stream_id: u32) -> Vec<u8> {
    frame(FRAME_HEADERS, FLAG_END_HEADERS, stream_id, &[])
}

pub fn data_frame(stream_id: u32, payload: &[u8]) -> Vec<u8> {
    frame(FRAME_DATA, 0, stream_id, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_frame_bytes() {
        let bytes = settings_frame(&[
            (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
            (SETTINGS_INITIAL_WINDOW_SIZE, 1_048_576),
        ]);
        assert_eq!(
            bytes,
            vec![
                0x00, 0x00, 0x0C, // length 12
                0x04, 0x00, // SETTINGS, no flags
                0x00, 0x00, 0x00, 0x00, // stream 0
                0x00, 0x03, 0x00, 0x00, 0x00, 0x64, // MAX_CONCURRENT_STREAMS=100
                0x00, 0x04, 0x00, 0x10, 0x00, 0x00, // INITIAL_WINDOW_SIZE=1MiB
            ]
        );
    }

    #[test]
    fn settings_ack_is_empty_with_ack_flag() {
        let bytes = settings_ack_frame();
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x04, 0x01, 0, 0, 0, 0]);
        let header = FrameHeader::decode(&bytes[..9].try_into().unwrap());
        assert!(header.is_settings_ack());
    }

    #[test]
    fn window_update_frame_bytes() {
        let bytes = window_update_frame(0, 983_041);
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x04, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0x0F, 0x00, 0x01]
        );
    }

    #[test]
    fn headers_frame_bytes() {
        let bytes = headers_frame(1);
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x01, 0x04, 0, 0, 0, 1]);
    }

    #[test]
    fn data_frame_header_round_trip() {
        let bytes = data_frame(3, b"payload");
        let header = FrameHeader::decode(&bytes[..9].try_into().unwrap());
        assert_eq!(header.length, 7);
        assert_eq!(header.kind, FRAME_DATA);
        assert_eq!(header.stream_id, 3);
        assert_eq!(&bytes[9..], b"payload");
    }

    #[test]
    fn reserved_bit_is_masked() {
        let header = FrameHeader::decode(&[0, 0, 0, 0, 0, 0x80, 0, 0, 5]);
        assert_eq!(header.stream_id, 5);
    }
}

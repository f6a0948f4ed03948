//! Length-prefix frame splitter.
//!
//! A pure byte transducer: callers feed it raw chunks in whatever sizes
//! the socket produced and pull complete frame payloads back out. It
//! never touches a socket and never decodes a payload; the transport
//! composes those around it.

use bytes::{Bytes, BytesMut};

use crate::DeviceMuxError;

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug)]
pub struct LengthSplitter {
    buf: BytesMut,
    endian: Endianness,
    length_offset: usize,
    length_width: usize,
    /// Added to the length-field value to obtain the payload length.
    /// The muxer dialect uses −4: its field counts the whole packet,
    /// length field included.
    adjust: i64,
    max_frame: usize,
    shut: bool,
}

impl LengthSplitter {
    pub fn new(
        endian: Endianness,
        length_offset: usize,
        length_width: usize,
        adjust: i64,
        max_frame: usize,
    ) -> Self {
        Self {
            buf: BytesMut::new(),
            endian,
            length_offset,
            length_width,
            adjust,
            max_frame,
            shut: false,
        }
    }

    /// Appends raw bytes to the internal buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        if !self.shut {
            self.buf.extend_from_slice(chunk);
        }
    }

    /// Bytes accumulated past the last emitted frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Emits the next complete frame payload, or `None` when more bytes
    /// are needed. A declared length beyond `max_frame` poisons the
    /// splitter and discards the buffer.
    pub fn try_next(&mut self) -> Result<Option<Bytes>, DeviceMuxError> {
        if self.shut {
            return Ok(None);
        }
        let header_len = self.length_offset + self.length_width;
        if self.buf.len() < header_len {
            return Ok(None);
        }

        let field = &self.buf[self.length_offset..header_len];
        let raw = match self.endian {
            Endianness::Big => field.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64),
            Endianness::Little => field
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | *b as u64),
        };

        if raw > self.max_frame as u64 {
            self.shut = true;
            self.buf.clear();
            return Err(DeviceMuxError::FrameTooLarge {
                got: raw as usize,
                max: self.max_frame,
            });
        }
        let payload_len = raw as i64 + self.adjust;
        if payload_len < 0 {
            self.shut = true;
            self.buf.clear();
            return Err(DeviceMuxError::NegativeFrameLength);
        }
        let payload_len = payload_len as usize;

        if self.buf.len() < header_len + payload_len {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(header_len + payload_len);
        let payload = frame.split_off(header_len);
        Ok(Some(payload.freeze()))
    }

    /// Stops the splitter and releases any buffered bytes back to the
    /// caller, for handing the raw stream off.
    pub fn shutdown(mut self) -> BytesMut {
        self.shut = true;
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn emits_frames_fed_byte_by_byte() {
        let frames: [&[u8]; 3] = [b"abc", b"", b"0123456789"];
        let mut wire = Vec::new();
        for f in frames {
            wire.extend_from_slice(&be_frame(f));
        }

        let mut splitter = LengthSplitter::new(Endianness::Big, 0, 4, 0, 1024);
        let mut seen = Vec::new();
        for byte in wire {
            splitter.feed(&[byte]);
            while let Some(frame) = splitter.try_next().unwrap() {
                seen.push(frame.to_vec());
            }
        }
        assert_eq!(seen, frames.map(|f| f.to_vec()).to_vec());
        assert_eq!(splitter.buffered_len(), 0);
    }

    #[test]
    fn little_endian_with_negative_adjustment() {
        // Muxer style: the field counts the 16-byte header plus payload,
        // including its own four bytes.
        let payload = [0u8; 12 + 3];
        let mut wire = 19u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&payload);

        let mut splitter = LengthSplitter::new(Endianness::Little, 0, 4, -4, 1 << 20);
        splitter.feed(&wire);
        let frame = splitter.try_next().unwrap().unwrap();
        assert_eq!(frame.len(), 15);
        assert!(splitter.try_next().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_poisons_and_discards() {
        let mut splitter = LengthSplitter::new(Endianness::Big, 0, 4, 0, 1 << 20);
        splitter.feed(&(2u32 << 20).to_be_bytes());
        splitter.feed(b"junk");
        assert!(matches!(
            splitter.try_next(),
            Err(DeviceMuxError::FrameTooLarge { .. })
        ));
        assert_eq!(splitter.buffered_len(), 0);
        // Poisoned: further input is ignored.
        splitter.feed(&be_frame(b"x"));
        assert!(splitter.try_next().unwrap().is_none());
    }

    #[test]
    fn negative_payload_length_is_rejected() {
        let mut splitter = LengthSplitter::new(Endianness::Little, 0, 4, -4, 1 << 20);
        splitter.feed(&2u32.to_le_bytes());
        assert!(matches!(
            splitter.try_next(),
            Err(DeviceMuxError::NegativeFrameLength)
        ));
    }

    #[test]
    fn shutdown_releases_unconsumed_bytes() {
        let mut splitter = LengthSplitter::new(Endianness::Big, 0, 4, 0, 1024);
        let mut wire = be_frame(b"frame");
        wire.extend_from_slice(b"tail");
        splitter.feed(&wire);
        assert_eq!(splitter.try_next().unwrap().unwrap().as_ref(), b"frame");
        assert_eq!(splitter.shutdown().as_ref(), b"tail");
    }
}

use std::collections::VecDeque;

use super::frame::{Frame, MAX_FRAME_SIZE, PREAMBLE};

/// Stateful RTCM3 reassembler.
///
/// The framer consumes an arbitrary byte stream and emits every validated
/// frame it contains, discarding leading garbage, interleaved NMEA text
/// and corrupted candidates. It is restartable at any stream position and
/// yields the same frames no matter how the input is chunked, down to one
/// byte at a time.
///
/// Two states: while the buffer is empty the framer is seeking and drops
/// everything up to the next `0xD3`; once a candidate is buffered, byte
/// position 0 is authoritative until its length is known and its CRC has
/// been judged. A later `0xD3` inside the buffered prefix never preempts
/// the current candidate. On a CRC failure the candidate's first byte is
/// dropped and scanning resumes at the next preamble within the buffer,
/// so a frame hidden inside a corrupted candidate is still recovered.
///
/// The buffer never grows beyond [`MAX_FRAME_SIZE`] and nothing is
/// allocated per input byte. A frame still in progress when the stream
/// ends is simply never emitted.
///
/// # Test
///
/// ```
/// use ntrip_server_codec::{crc24q, framer::Framer};
///
/// let mut frame = vec![0xD3, 0x00, 0x02, 0x3E, 0xD0];
/// let crc = crc24q(&frame);
/// frame.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
///
/// let mut stream = b"$GNGGA,123519.00,,,,,0,00,,,M,,M,,*5C\r\n".to_vec();
/// stream.extend_from_slice(&frame);
///
/// let mut framer = Framer::default();
/// let frames: Vec<_> = framer.feed(&stream).collect();
///
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].as_bytes(), &frame[..]);
/// ```
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
    pending: VecDeque<Frame>,
}

impl Framer {
    /// Feeds a chunk of the stream and iterates over every frame it
    /// completes. Frames come out in stream order.
    pub fn feed<'a>(&'a mut self, input: &'a [u8]) -> Frames<'a> {
        Frames {
            framer: self,
            input,
            position: 0,
        }
    }

    /// Bytes of the in-progress candidate, at most [`MAX_FRAME_SIZE`].
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any in-progress candidate.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }

    fn push(&mut self, byte: u8) {
        if self.buffer.is_empty() {
            if byte != PREAMBLE {
                return;
            }

            self.buffer.reserve(MAX_FRAME_SIZE);
        }

        self.buffer.push(byte);

        loop {
            if self.buffer.len() < 3 {
                return;
            }

            let size = Frame::payload_size(&self.buffer) + 6;
            if self.buffer.len() < size {
                return;
            }

            match Frame::parse(&self.buffer[..size]) {
                Ok(frame) => {
                    self.pending.push_back(frame);
                    self.buffer.drain(..size);
                    self.align();
                }
                Err(_) => {
                    self.buffer.drain(..1);
                    self.align();
                }
            }
        }
    }

    /// Drops buffered bytes up to the next preamble.
    fn align(&mut self) {
        match self.buffer.iter().position(|byte| *byte == PREAMBLE) {
            Some(0) => {}
            Some(position) => {
                self.buffer.drain(..position);
            }
            None => self.buffer.clear(),
        }
    }
}

/// Iterator returned by [`Framer::feed`].
pub struct Frames<'a> {
    framer: &'a mut Framer,
    input: &'a [u8],
    position: usize,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.framer.pending.pop_front() {
                return Some(frame);
            }

            if self.position == self.input.len() {
                return None;
            }

            let byte = self.input[self.position];
            self.position += 1;
            self.framer.push(byte);
        }
    }
}

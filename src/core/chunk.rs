//! Chunked transfer of the host name
//! The name characteristic accepts at most MTU bytes per write, so the UTF-8
//! name is streamed as frames of one header byte plus up to MTU-1 payload
//! bytes. The header byte carries [`CHUNK_CONTINUATION`] while more payload
//! follows; the final frame clears it.

use crate::core::constants::CHUNK_CONTINUATION;

/// Stateful encoder cutting a UTF-8 name into MTU-sized frames
#[derive(Debug)]
pub struct ChunkedNameBuffer {
    bytes: Vec<u8>,
    offset: usize,
}

impl ChunkedNameBuffer {
    /// Creates a buffer over the UTF-8 bytes of `name`
    pub fn new(name: &str) -> Self {
        Self {
            bytes: name.as_bytes().to_vec(),
            offset: 0,
        }
    }

    /// Restarts the transfer from the first byte
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// True while payload bytes remain to be sent
    pub fn has_more(&self) -> bool {
        self.offset < self.bytes.len()
    }

    /// Returns the next frame and advances the cursor by its payload length.
    ///
    /// Panics when `mtu < 2`: a frame must fit the header byte and at least
    /// one payload byte.
    pub fn next_chunk(&mut self, mtu: usize) -> Vec<u8> {
        assert!(mtu >= 2, "mtu must fit a header byte plus payload");
        let remaining = self.bytes.len() - self.offset;
        let payload = remaining.min(mtu - 1);
        let header = if payload < remaining {
            CHUNK_CONTINUATION
        } else {
            0
        };
        let mut frame = Vec::with_capacity(payload + 1);
        frame.push(header);
        frame.extend_from_slice(&self.bytes[self.offset..self.offset + payload]);
        self.offset += payload;
        frame
    }

    /// Reverts the cursor past the last frame's payload so a failed write is
    /// retried with an identical frame. `frame_len` is the full frame length
    /// including the header byte.
    pub fn rewind(&mut self, frame_len: usize) {
        debug_assert!(frame_len >= 1 && frame_len - 1 <= self.offset);
        self.offset -= frame_len - 1;
    }
}

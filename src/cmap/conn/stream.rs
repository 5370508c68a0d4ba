//! Reassembly of wire protocol frames from an arbitrarily-chunked byte stream.

use crate::{
    cmap::conn::wire::Header,
    error::{Error, Result},
};

/// Accumulates bytes read off a socket and yields complete frames. TCP delivers data in
/// arbitrary chunks, so a single read may hold a partial header, several messages, or a
/// message split anywhere.
#[derive(Debug, Default)]
pub(crate) struct MessageBuffer {
    buffer: Vec<u8>,
}

impl MessageBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from the stream.
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Removes and returns the next complete frame, header included. Returns `Ok(None)`
    /// when the buffered bytes do not yet form a complete frame. A declared length that is
    /// negative, shorter than a header, or larger than `max_message_size` poisons the
    /// stream and returns an error; the connection must be closed.
    pub(crate) fn next_frame(&mut self, max_message_size: usize) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&self.buffer[..4]);
        let length = i32::from_le_bytes(length_bytes);

        if length < Header::LENGTH as i32 || length as usize > max_message_size {
            return Err(Error::invalid_response(format!(
                "invalid message size: {}",
                length
            )));
        }

        let length = length as usize;
        if self.buffer.len() < length {
            return Ok(None);
        }

        let rest = self.buffer.split_off(length);
        let frame = std::mem::replace(&mut self.buffer, rest);
        Ok(Some(frame))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cmap::conn::wire::{Header, OpCode};

    const MAX: usize = 48 * 1024 * 1024;

    fn frame(request_id: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Message,
        }
        .write_to(&mut buf);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn partial_frame_yields_nothing() {
        let full = frame(1, b"abcdef");

        let mut buffer = MessageBuffer::new();
        buffer.extend(&full[..3]);
        assert!(buffer.next_frame(MAX).unwrap().is_none());

        buffer.extend(&full[3..10]);
        assert!(buffer.next_frame(MAX).unwrap().is_none());

        buffer.extend(&full[10..]);
        assert_eq!(buffer.next_frame(MAX).unwrap(), Some(full));
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let first = frame(1, b"one");
        let second = frame(2, b"twotwo");

        let mut chunk = first.clone();
        chunk.extend_from_slice(&second);

        let mut buffer = MessageBuffer::new();
        buffer.extend(&chunk);
        assert_eq!(buffer.next_frame(MAX).unwrap(), Some(first));
        assert_eq!(buffer.next_frame(MAX).unwrap(), Some(second));
        assert!(buffer.next_frame(MAX).unwrap().is_none());
    }

    #[test]
    fn frame_split_across_many_chunks() {
        let full = frame(3, &vec![7u8; 100]);

        let mut buffer = MessageBuffer::new();
        for byte in &full {
            assert!(buffer.next_frame(MAX).unwrap().is_none());
            buffer.extend(std::slice::from_ref(byte));
        }
        assert_eq!(buffer.next_frame(MAX).unwrap(), Some(full));
    }

    #[test]
    fn negative_length_is_an_error() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(&(-1_i32).to_le_bytes());
        assert!(buffer.next_frame(MAX).is_err());
    }

    #[test]
    fn undersized_length_is_an_error() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(&4_i32.to_le_bytes());
        assert!(buffer.next_frame(MAX).is_err());
    }

    #[test]
    fn oversized_length_is_an_error() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(&((MAX as i32) + 1).to_le_bytes());
        assert!(buffer.next_frame(MAX).is_err());
    }
}

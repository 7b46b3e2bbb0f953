//! Length-prefixed message framing inside transport data frames.
//!
//! Format: 1 byte compressed flag (always 0 here) + 4 byte big-endian
//! length + payload. Messages may be split across data frames or several
//! may share one frame; [`MessageBuffer`] reassembles them per stream.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::Status;

/// Size of the message prefix.
pub const PREFIX_LEN: usize = 5;

/// Largest payload the 4 byte length prefix can describe.
pub const MAX_MESSAGE_LENGTH: usize = u32::MAX as usize;

/// Append one framed message to `out`.
pub fn encode(payload: &[u8], out: &mut BytesMut) -> Result<(), MessageError> {
    let len = u32::try_from(payload.len()).map_err(|_| MessageError::Unframeable {
        len: payload.len(),
    })?;
    out.reserve(PREFIX_LEN + payload.len());
    out.put_u8(0);
    out.put_u32(len);
    out.put_slice(payload);
    Ok(())
}

/// Frame a single message.
pub fn frame(payload: &[u8]) -> Result<Bytes, MessageError> {
    let mut out = BytesMut::new();
    encode(payload, &mut out)?;
    Ok(out.freeze())
}

/// A framed message could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The compressed flag was set; compression is not supported.
    Compressed,
    /// The declared length exceeds the configured limit.
    TooLarge { len: usize, limit: usize },
    /// The stream ended in the middle of a message.
    Truncated,
    /// The payload is too long for the length prefix.
    Unframeable { len: usize },
}

impl MessageError {
    /// Terminal status for a call whose request framing failed.
    pub fn status(&self) -> Status {
        match self {
            MessageError::Compressed => Status::internal(self.to_string()),
            MessageError::TooLarge { .. } => Status::resource_exhausted(self.to_string()),
            MessageError::Truncated => Status::internal(self.to_string()),
            MessageError::Unframeable { .. } => Status::resource_exhausted(self.to_string()),
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Compressed => write!(f, "received compressed message but compression is not supported"),
            MessageError::TooLarge { len, limit } => {
                write!(f, "received message larger than max ({} vs. {})", len, limit)
            }
            MessageError::Truncated => write!(f, "stream ended inside a message"),
            MessageError::Unframeable { len } => write!(
                f,
                "message of {} bytes does not fit a frame (max {})",
                len, MAX_MESSAGE_LENGTH
            ),
        }
    }
}

impl std::error::Error for MessageError {}

/// Per-stream buffer for reassembling messages from data frame chunks.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: BytesMut,
    max_len: Option<usize>,
}

impl MessageBuffer {
    /// `max_len` bounds the payload length of a single message.
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Append data from a data frame.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drain one complete message, or `None` if more bytes are needed.
    pub fn try_decode(&mut self) -> Result<Option<Bytes>, MessageError> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        if self.buf[0] != 0 {
            return Err(MessageError::Compressed);
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if let Some(limit) = self.max_len {
            if len > limit {
                return Err(MessageError::TooLarge { len, limit });
            }
        }
        if self.buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        let mut message = self.buf.split_to(PREFIX_LEN + len);
        message.advance(PREFIX_LEN);
        Ok(Some(message.freeze()))
    }

    /// Check that no partial message is left once the stream has ended.
    pub fn finish(&self) -> Result<(), MessageError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(MessageError::Truncated)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn frame_layout() {
        let framed = frame(b"hello").unwrap();
        assert_eq!(&framed[..PREFIX_LEN], &[0, 0, 0, 0, 5]);
        assert_eq!(&framed[PREFIX_LEN..], b"hello");
        assert_eq!(&frame(b"").unwrap()[..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn unframeable_length_is_resource_exhausted() {
        let err = MessageError::Unframeable {
            len: MAX_MESSAGE_LENGTH + 1,
        };
        assert_eq!(err.status().code(), Code::ResourceExhausted);
        assert!(err.to_string().contains("does not fit a frame"));
    }

    #[test]
    fn reassembles_split_message() {
        let encoded = frame(b"reassembled message").unwrap();
        let mut mb = MessageBuffer::new(None);

        mb.push(&encoded[..3]);
        assert_eq!(mb.try_decode(), Ok(None));
        mb.push(&encoded[3..8]);
        assert_eq!(mb.try_decode(), Ok(None));
        mb.push(&encoded[8..]);

        assert_eq!(mb.try_decode().unwrap().unwrap(), &b"reassembled message"[..]);
        assert!(mb.is_empty());
        assert!(mb.finish().is_ok());
    }

    #[test]
    fn several_messages_in_one_chunk() {
        let mut chunk = BytesMut::new();
        encode(b"first", &mut chunk).unwrap();
        encode(b"", &mut chunk).unwrap();
        encode(b"third", &mut chunk).unwrap();

        let mut mb = MessageBuffer::new(None);
        mb.push(&chunk);
        assert_eq!(mb.try_decode().unwrap().unwrap(), &b"first"[..]);
        assert_eq!(mb.try_decode().unwrap().unwrap(), &b""[..]);
        assert_eq!(mb.try_decode().unwrap().unwrap(), &b"third"[..]);
        assert_eq!(mb.try_decode(), Ok(None));
    }

    #[test]
    fn rejects_compressed_flag() {
        let mut mb = MessageBuffer::new(None);
        mb.push(&[1, 0, 0, 0, 1, 42]);
        let err = mb.try_decode().unwrap_err();
        assert_eq!(err, MessageError::Compressed);
        assert_eq!(err.status().code(), Code::Internal);
    }

    #[test]
    fn rejects_oversized_message_from_prefix_alone() {
        let mut mb = MessageBuffer::new(Some(4));
        mb.push(&[0, 0, 0, 0, 5]);
        let err = mb.try_decode().unwrap_err();
        assert_eq!(err, MessageError::TooLarge { len: 5, limit: 4 });
        assert_eq!(err.status().code(), Code::ResourceExhausted);
    }

    #[test]
    fn leftover_bytes_are_truncation() {
        let mut mb = MessageBuffer::new(None);
        mb.push(&[0, 0, 0]);
        assert_eq!(mb.try_decode(), Ok(None));
        assert_eq!(mb.finish(), Err(MessageError::Truncated));
    }
}

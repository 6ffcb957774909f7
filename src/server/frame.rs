//! Fixed-size message buffer with a UTF-8 view
//!
//! The wire format is a single fixed-capacity frame: UTF-8 payload,
//! zero-byte padded. Decoding trims the trailing padding; encoding
//! zero-fills first and truncates oversized payloads (loudly).

/// Fixed-capacity byte buffer carrying one UTF-8 message.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8]>,
}

impl FrameBuffer {
    /// Create a zero-filled buffer of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Encode a message into the buffer.
    ///
    /// The buffer is zero-filled first. A payload longer than the
    /// capacity is cut off on a char boundary and the truncation is
    /// logged as an error with the original length and the limit.
    pub fn set_message(&mut self, message: &str) {
        self.data.fill(0);
        if message.is_empty() {
            return;
        }

        let bytes = message.as_bytes();
        let mut length = bytes.len();
        if length > self.data.len() {
            tracing::error!(
                message,
                length,
                limit = self.data.len(),
                "the message was cut off"
            );
            length = self.data.len();
            while !message.is_char_boundary(length) {
                length -= 1;
            }
        }
        self.data[..length].copy_from_slice(&bytes[..length]);
    }

    /// Decode the whole buffer, trimming trailing zero padding.
    pub fn message(&self) -> String {
        self.message_prefix(self.data.len())
    }

    /// Decode the first `length` bytes, trimming trailing zero padding.
    /// Receive paths use this with the transferred byte count.
    pub fn message_prefix(&self, length: usize) -> String {
        let length = length.min(self.data.len());
        let end = self.data[..length]
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip() {
        let mut frame = FrameBuffer::new(16);
        frame.set_message("ping");
        assert_eq!(frame.message(), "ping");
        assert_eq!(&frame.as_slice()[..4], b"ping");
        assert!(frame.as_slice()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn overwrite_zero_fills() {
        let mut frame = FrameBuffer::new(16);
        frame.set_message("a long first message");
        frame.set_message("hi");
        assert_eq!(frame.message(), "hi");
    }

    #[test]
    fn empty_message() {
        let mut frame = FrameBuffer::new(8);
        frame.set_message("payload!");
        frame.set_message("");
        assert_eq!(frame.message(), "");
        assert!(frame.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn truncates_to_capacity() {
        let mut frame = FrameBuffer::new(4);
        frame.set_message("123456");
        assert_eq!(frame.message(), "1234");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let mut frame = FrameBuffer::new(5);
        // 'é' is two bytes; cutting at 5 would split the third one
        frame.set_message("ééé");
        assert_eq!(frame.message(), "éé");
    }

    #[test]
    fn prefix_decode() {
        let mut frame = FrameBuffer::new(16);
        frame.set_message("hello");
        assert_eq!(frame.message_prefix(5), "hello");
        assert_eq!(frame.message_prefix(3), "hel");
        assert_eq!(frame.message_prefix(64), "hello");
    }

    proptest! {
        #[test]
        fn arbitrary_messages_roundtrip(message in "[^\u{0}]{0,64}") {
            let mut frame = FrameBuffer::new(512);
            frame.set_message(&message);
            prop_assert_eq!(frame.message(), message);
        }

        #[test]
        fn truncation_never_exceeds_capacity(message in "\\PC{0,128}") {
            let mut frame = FrameBuffer::new(16);
            frame.set_message(&message);
            prop_assert!(frame.message().len() <= 16);
        }
    }
}

//! Two-part wire envelope: `[topic, payload]`
//!
//! Each part is written as a big-endian `u32` length followed by its bytes.
//! [`FrameDecoder`] reassembles envelopes from a byte stream that may arrive in
//! arbitrary chunks.

use crate::error::{BusError, DecodeError};

/// Largest topic or payload accepted from the wire
pub const MAX_PART_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// The only unit the transport understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(topic: impl Into<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Whether this envelope belongs to `topic` (exact byte match)
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.topic == topic
    }

    /// Frame the envelope for the wire
    ///
    /// Parts longer than [`MAX_PART_LEN`] are refused here, since every receiver
    /// would reject them and drop its connection.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        let topic_len = part_len("topic", &self.topic)?;
        let payload_len = part_len("payload", &self.payload)?;

        let mut frame =
            Vec::with_capacity(2 * LEN_PREFIX + self.topic.len() + self.payload.len());
        frame.extend_from_slice(&topic_len.to_be_bytes());
        frame.extend_from_slice(&self.topic);
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }
}

/// Incremental decoder for a stream of encoded envelopes
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Discard any partially received frame (e.g. after a reconnect)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete envelope, or `None` if more bytes are needed
    ///
    /// An oversized length prefix is an error; the stream cannot be resynchronized
    /// after it and the connection should be dropped.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, DecodeError> {
        let Some(topic_len) = read_len(&self.buffer, 0)? else {
            return Ok(None);
        };
        let topic_end = LEN_PREFIX + topic_len;
        let Some(payload_len) = read_len(&self.buffer, topic_end)? else {
            return Ok(None);
        };
        let payload_start = topic_end + LEN_PREFIX;
        let frame_end = payload_start + payload_len;
        if self.buffer.len() < frame_end {
            return Ok(None);
        }

        let topic = self.buffer[LEN_PREFIX..topic_end].to_vec();
        let payload = self.buffer[payload_start..frame_end].to_vec();
        self.buffer.drain(..frame_end);
        Ok(Some(Envelope { topic, payload }))
    }
}

fn part_len(name: &str, part: &[u8]) -> Result<u32, BusError> {
    if part.len() > MAX_PART_LEN {
        return Err(BusError::Encode(format!(
            "{} of {} bytes exceeds the {} byte frame limit",
            name,
            part.len(),
            MAX_PART_LEN
        )));
    }
    u32::try_from(part.len()).map_err(|e| BusError::Encode(e.to_string()))
}

fn read_len(buffer: &[u8], offset: usize) -> Result<Option<usize>, DecodeError> {
    if buffer.len() < offset + LEN_PREFIX {
        return Ok(None);
    }
    let mut raw = [0u8; LEN_PREFIX];
    raw.copy_from_slice(&buffer[offset..offset + LEN_PREFIX]);
    let len = u32::from_be_bytes(raw) as usize;
    if len > MAX_PART_LEN {
        return Err(DecodeError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Envelope::new("ab", vec![1, 2, 3]).encode().unwrap();
        assert_eq!(frame, vec![0, 0, 0, 2, b'a', b'b', 0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let first = Envelope::new("monitoring", vec![0x81, 0xa1, b'a', 0x01]);
        let second = Envelope::new("frame", vec![9; 300]);
        let mut stream = first.encode().unwrap();
        stream.extend(second.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(7) {
            decoder.extend(chunk);
            while let Some(envelope) = decoder.next_envelope().unwrap() {
                decoded.push(envelope);
            }
        }

        assert_eq!(decoded, vec![first, second]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_incomplete_frame_waits_for_more() {
        let frame = Envelope::new("t", vec![1, 2, 3, 4]).encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..frame.len() - 1]);
        assert!(decoder.next_envelope().unwrap().is_none());
        decoder.extend(&frame[frame.len() - 1..]);
        assert!(decoder.next_envelope().unwrap().is_some());
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&Envelope::new("t", Vec::new()).encode().unwrap());
        let envelope = decoder.next_envelope().unwrap().unwrap();
        assert!(envelope.payload.is_empty());
        assert!(envelope.matches(b"t"));
    }

    #[test]
    fn test_oversized_part_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decoder.next_envelope(),
            Err(DecodeError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_oversized_payload_is_refused_on_encode() {
        let envelope = Envelope::new("frame", vec![0; MAX_PART_LEN + 1]);
        assert!(matches!(envelope.encode(), Err(BusError::Encode(_))));

        let at_limit = Envelope::new("frame", vec![0; MAX_PART_LEN]).encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&at_limit);
        assert_eq!(
            decoder.next_envelope().unwrap().unwrap().payload.len(),
            MAX_PART_LEN
        );
    }

    #[test]
    fn test_topic_matching_is_exact() {
        let envelope = Envelope::new("monitoring", Vec::new());
        assert!(envelope.matches(b"monitoring"));
        assert!(!envelope.matches(b"monitor"));
        assert!(!envelope.matches(b"monitoring2"));
    }
}

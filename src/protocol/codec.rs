//! Length-delimited message framing
//!
//! Each frame is a 4-byte big-endian body length followed by the
//! bincode-encoded `Message`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::message::Message;

const LENGTH_PREFIX: usize = 4;

/// Encoder/decoder for control-connection frames
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn encode(&self, message: &Message) -> std::result::Result<Bytes, ProtocolError> {
        let body = bincode::serialize(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if body.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge(body.len()));
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Take one complete frame off the front of `buf`, if present.
    pub fn decode(&self, buf: &mut BytesMut) -> std::result::Result<Option<Message>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if buf.len() < LENGTH_PREFIX + len {
            buf.reserve(LENGTH_PREFIX + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let body = buf.split_to(len);
        bincode::deserialize(&body)
            .map(Some)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Read until a whole message is buffered. `Ok(None)` on clean EOF.
    pub fn read_message<R: Read>(&self, reader: &mut R, buf: &mut BytesMut) -> Result<Option<Message>> {
        let mut scratch = [0u8; 8192];
        loop {
            if let Some(message) = self.decode(buf)? {
                return Ok(Some(message));
            }

            let n = match reader.read(&mut scratch) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Malformed(format!(
                    "connection closed inside a frame ({} bytes buffered)",
                    buf.len()
                ))
                .into());
            }
            buf.extend_from_slice(&scratch[..n]);
        }
    }

    pub fn write_message<W: Write>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let frame = self.encode(message)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageType, Tag, Tlv, TlvAccess, MAX_TLV_DEPTH};
    use std::io::Cursor;

    fn sample() -> Message {
        Message::new(MessageType::CreateAudioEndpointReq)
            .with_id(9)
            .with_int(Tag::Port, 6000)
            .with_str(Tag::Protocol, "udp")
            .with(Tlv::group(Tag::Endpoint, vec![Tlv::bytes(Tag::Image, vec![1, 2, 3])]))
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let codec = MessageCodec::default();
        let frame = codec.encode(&sample()).unwrap();

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = MessageCodec::new(16);
        assert!(matches!(codec.encode(&sample()), Err(ProtocolError::FrameTooLarge(_))));

        let mut buf = BytesMut::new();
        buf.put_u32(1_000);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::FrameTooLarge(1_000))));
    }

    #[test]
    fn test_stream_read_write() {
        let codec = MessageCodec::default();
        let mut wire = Vec::new();
        codec.write_message(&mut wire, &sample()).unwrap();
        codec
            .write_message(&mut wire, &Message::new(MessageType::PingReq).with_id(10))
            .unwrap();

        let mut reader = Cursor::new(wire);
        let mut buf = BytesMut::new();
        assert_eq!(codec.read_message(&mut reader, &mut buf).unwrap(), Some(sample()));
        assert_eq!(
            codec.read_message(&mut reader, &mut buf).unwrap().unwrap().msg_type,
            MessageType::PingReq
        );
        assert!(codec.read_message(&mut reader, &mut buf).unwrap().is_none());
    }

    fn nested(levels: usize) -> Message {
        let mut attribute = Tlv::int(Tag::Volume, 1);
        for _ in 0..levels {
            attribute = Tlv::group(Tag::Event, vec![attribute]);
        }
        Message::new(MessageType::PingReq).with_id(1).with(attribute)
    }

    /// Frame `levels` empty groups nested inside each other without building
    /// the tree in memory: each level is a one-element vec length, the tag
    /// and the group variant.
    fn deep_frame(levels: usize) -> Vec<u8> {
        let shallow = MessageCodec::default()
            .encode(&Message::new(MessageType::PingReq).with_id(1).with(Tlv::group(Tag::Event, vec![])))
            .unwrap();
        let body = &shallow[LENGTH_PREFIX..];
        let (head, empty_len) = body.split_at(body.len() - 8);
        let group_header = &head[head.len() - 8..];

        let mut deep = head.to_vec();
        for _ in 1..levels {
            deep.extend_from_slice(&1u64.to_le_bytes());
            deep.extend_from_slice(group_header);
        }
        deep.extend_from_slice(empty_len);

        let mut frame = (deep.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&deep);
        frame
    }

    #[test]
    fn test_group_nesting_limit() {
        let codec = MessageCodec::default();

        let mut buf = BytesMut::from(&codec.encode(&nested(MAX_TLV_DEPTH)).unwrap()[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(nested(MAX_TLV_DEPTH)));

        let mut buf = BytesMut::from(&codec.encode(&nested(MAX_TLV_DEPTH + 1)).unwrap()[..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_deeply_nested_frame_is_malformed() {
        let codec = MessageCodec::default();

        // The hand-built layout matches the encoder's
        let mut buf = BytesMut::from(&deep_frame(3)[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.groups(Tag::Event)[0][0].tag, Tag::Event);

        let frame = deep_frame(15_000);
        assert!(frame.len() <= MAX_FRAME_SIZE);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Malformed(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let codec = MessageCodec::default();
        let frame = codec.encode(&sample()).unwrap();
        let mut reader = Cursor::new(frame[..6].to_vec());
        let mut buf = BytesMut::new();
        assert!(codec.read_message(&mut reader, &mut buf).is_err());
    }
}

//! MQTT 3.1.1 wire codec.
//!
//! Every packet is one [`BusFrame`]:
//!
//! ```text
//! [u8 type<<4 | flags] [remaining length: 1-4 bytes, 7 bits each] [payload]
//! ```
//!
//! Only the packets the relay needs are modelled. Strings are UTF-8 with a
//! big-endian `u16` length prefix; packet ids are big-endian `u16`.

use crate::error::{RelayError, Result};

/// Control nibbles (already shifted into the high half of the byte).
pub mod packet_type {
    /// Client connect request.
    pub const CONNECT: u8 = 0x10;
    /// Connect acknowledgement.
    pub const CONNACK: u8 = 0x20;
    /// Publish message.
    pub const PUBLISH: u8 = 0x30;
    /// Publish acknowledgement (QoS 1).
    pub const PUBACK: u8 = 0x40;
    /// Subscribe request.
    pub const SUBSCRIBE: u8 = 0x80;
    /// Subscribe acknowledgement.
    pub const SUBACK: u8 = 0x90;
    /// Unsubscribe request.
    pub const UNSUBSCRIBE: u8 = 0xA0;
    /// Unsubscribe acknowledgement.
    pub const UNSUBACK: u8 = 0xB0;
}

/// Largest value the 4-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_USERNAME: u8 = 0x80;
const SUBACK_FAILURE: u8 = 0x80;

/// One undecoded packet: control nibble, flags nibble and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// High nibble of the control byte (`0x30` for PUBLISH).
    pub packet_type: u8,
    /// Low nibble of the control byte.
    pub flags: u8,
    /// Variable header and payload; its length is the remaining length.
    pub payload: Vec<u8>,
}

impl BusFrame {
    /// Build a frame from a full control byte.
    pub fn new(control: u8, payload: Vec<u8>) -> Self {
        Self {
            packet_type: control & 0xF0,
            flags: control & 0x0F,
            payload,
        }
    }

    /// Serialize as `[control][remaining length][payload]`.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidInput`] if the payload exceeds
    /// [`MAX_REMAINING_LENGTH`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = encode_remaining_length(self.payload.len())?;
        let mut buf = Vec::with_capacity(1 + length.len() + self.payload.len());
        buf.push(self.packet_type | self.flags);
        buf.extend_from_slice(&length);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Encode a remaining length: 7 bits per byte, continuation bit set iff
/// more bytes follow.
pub fn encode_remaining_length(mut length: usize) -> Result<Vec<u8>> {
    if length > MAX_REMAINING_LENGTH {
        return Err(RelayError::InvalidInput(format!(
            "packet too large: {length} bytes (max {MAX_REMAINING_LENGTH})"
        )));
    }
    let mut bytes = Vec::with_capacity(4);
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        bytes.push(byte);
        if length == 0 {
            return Ok(bytes);
        }
    }
}

/// Decode a remaining length from the front of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the length and
/// the number of bytes it occupied.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in bytes.iter().enumerate() {
        if index == 4 {
            break;
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(RelayError::Protocol(
            "remaining length longer than 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

/// The packets exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Open a clean session.
    Connect {
        /// Client identifier.
        client_id: String,
        /// Optional username; the broker uses it for SDK metrics only.
        username: Option<String>,
    },
    /// Connect accepted. Anything but `0, 0` is refused at decode time.
    ConnAck,
    /// Application message.
    Publish {
        /// Topic name.
        topic: String,
        /// Delivery QoS (0 or 1).
        qos: u8,
        /// Present iff `qos > 0`.
        packet_id: Option<u16>,
        /// Raw message bytes.
        payload: Vec<u8>,
    },
    /// QoS 1 publish acknowledged.
    PubAck {
        /// Acknowledged packet id.
        packet_id: u16,
    },
    /// Subscribe to one topic filter.
    Subscribe {
        /// Packet id echoed in the SUBACK.
        packet_id: u16,
        /// Topic filter.
        topic: String,
        /// Requested QoS.
        qos: u8,
    },
    /// Subscription granted.
    SubAck {
        /// Acknowledged packet id.
        packet_id: u16,
        /// Granted QoS (0, 1 or 2).
        granted_qos: u8,
    },
    /// Drop one topic filter.
    Unsubscribe {
        /// Packet id echoed in the UNSUBACK.
        packet_id: u16,
        /// Topic filter.
        topic: String,
    },
    /// Unsubscribe acknowledged.
    UnsubAck {
        /// Acknowledged packet id.
        packet_id: u16,
    },
}

impl Packet {
    /// Build the frame for this packet.
    pub fn to_frame(&self) -> Result<BusFrame> {
        let frame = match self {
            Packet::Connect { client_id, username } => {
                let mut payload = Vec::new();
                put_string(&mut payload, PROTOCOL_NAME)?;
                payload.push(PROTOCOL_LEVEL);
                let mut flags = FLAG_CLEAN_SESSION;
                if username.is_some() {
                    flags |= FLAG_USERNAME;
                }
                payload.push(flags);
                // Keep-alive disabled.
                payload.extend_from_slice(&[0x00, 0x00]);
                put_string(&mut payload, client_id)?;
                if let Some(username) = username {
                    put_string(&mut payload, username)?;
                }
                BusFrame::new(packet_type::CONNECT, payload)
            }
            Packet::ConnAck => BusFrame::new(packet_type::CONNACK, vec![0x00, 0x00]),
            Packet::Publish { topic, qos, packet_id, payload: body } => {
                let mut payload = Vec::with_capacity(4 + topic.len() + body.len());
                put_string(&mut payload, topic)?;
                match (*qos, *packet_id) {
                    (0, None) => {}
                    (1, Some(id)) => payload.extend_from_slice(&id.to_be_bytes()),
                    _ => {
                        return Err(RelayError::InvalidInput(format!(
                            "publish qos {qos} with packet id {packet_id:?}"
                        )))
                    }
                }
                payload.extend_from_slice(body);
                BusFrame::new(packet_type::PUBLISH | (*qos << 1), payload)
            }
            Packet::PubAck { packet_id } => {
                BusFrame::new(packet_type::PUBACK, packet_id.to_be_bytes().to_vec())
            }
            Packet::Subscribe { packet_id, topic, qos } => {
                let mut payload = packet_id.to_be_bytes().to_vec();
                put_string(&mut payload, topic)?;
                payload.push(*qos);
                BusFrame::new(packet_type::SUBSCRIBE | 0x02, payload)
            }
            Packet::SubAck { packet_id, granted_qos } => {
                let mut payload = packet_id.to_be_bytes().to_vec();
                payload.push(*granted_qos);
                BusFrame::new(packet_type::SUBACK, payload)
            }
            Packet::Unsubscribe { packet_id, topic } => {
                let mut payload = packet_id.to_be_bytes().to_vec();
                put_string(&mut payload, topic)?;
                BusFrame::new(packet_type::UNSUBSCRIBE | 0x02, payload)
            }
            Packet::UnsubAck { packet_id } => {
                BusFrame::new(packet_type::UNSUBACK, packet_id.to_be_bytes().to_vec())
            }
        };
        Ok(frame)
    }

    /// Encode straight to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_frame()?.encode()
    }

    /// Decode and validate a frame.
    ///
    /// # Errors
    ///
    /// [`RelayError::Protocol`] for an unknown type, a wrong fixed length,
    /// a refused CONNACK or a failed SUBACK.
    pub fn from_frame(frame: &BusFrame) -> Result<Self> {
        let mut reader = PayloadReader::new(&frame.payload);
        let packet = match frame.packet_type {
            packet_type::CONNACK => {
                expect_length(frame, 2, "CONNACK")?;
                let ack_flags = reader.byte()?;
                let return_code = reader.byte()?;
                if ack_flags != 0 || return_code != 0 {
                    return Err(RelayError::Protocol(format!(
                        "connection refused (flags {ack_flags:#04x}, code {return_code:#04x})"
                    )));
                }
                Packet::ConnAck
            }
            packet_type::PUBLISH => {
                let qos = (frame.flags >> 1) & 0x03;
                if qos > 1 {
                    return Err(RelayError::Protocol(format!("unsupported publish qos {qos}")));
                }
                let topic = reader.string()?;
                let packet_id = if qos > 0 { Some(reader.u16()?) } else { None };
                Packet::Publish {
                    topic,
                    qos,
                    packet_id,
                    payload: reader.rest().to_vec(),
                }
            }
            packet_type::PUBACK => {
                expect_length(frame, 2, "PUBACK")?;
                Packet::PubAck { packet_id: reader.u16()? }
            }
            packet_type::SUBACK => {
                expect_length(frame, 3, "SUBACK")?;
                let packet_id = reader.u16()?;
                let granted_qos = reader.byte()?;
                if granted_qos == SUBACK_FAILURE {
                    return Err(RelayError::Protocol(format!(
                        "subscription #{packet_id} rejected by broker"
                    )));
                }
                if granted_qos > 2 {
                    return Err(RelayError::Protocol(format!(
                        "invalid SUBACK return code {granted_qos:#04x}"
                    )));
                }
                Packet::SubAck { packet_id, granted_qos }
            }
            packet_type::UNSUBACK => {
                expect_length(frame, 2, "UNSUBACK")?;
                Packet::UnsubAck { packet_id: reader.u16()? }
            }
            packet_type::CONNECT => {
                let protocol = reader.string()?;
                let level = reader.byte()?;
                if protocol != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
                    return Err(RelayError::Protocol(format!(
                        "unsupported protocol {protocol} level {level}"
                    )));
                }
                let flags = reader.byte()?;
                let _keep_alive = reader.u16()?;
                let client_id = reader.string()?;
                let username = if flags & FLAG_USERNAME != 0 {
                    Some(reader.string()?)
                } else {
                    None
                };
                Packet::Connect { client_id, username }
            }
            packet_type::SUBSCRIBE => {
                let packet_id = reader.u16()?;
                let topic = reader.string()?;
                let qos = reader.byte()?;
                Packet::Subscribe { packet_id, topic, qos }
            }
            packet_type::UNSUBSCRIBE => {
                let packet_id = reader.u16()?;
                let topic = reader.string()?;
                Packet::Unsubscribe { packet_id, topic }
            }
            other => {
                return Err(RelayError::Protocol(format!(
                    "invalid packet type {other:#04x}"
                )))
            }
        };
        Ok(packet)
    }
}

fn expect_length(frame: &BusFrame, expected: usize, name: &str) -> Result<()> {
    if frame.payload.len() == expected {
        Ok(())
    } else {
        Err(RelayError::Protocol(format!(
            "invalid {name} length: expected {expected}, got {}",
            frame.payload.len()
        )))
    }
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        RelayError::InvalidInput(format!("string too long: {} bytes", value.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Cursor over a frame payload; running short is a protocol error.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(RelayError::Protocol(format!(
                "packet truncated: need {n} bytes at offset {}, have {}",
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RelayError::Protocol(format!("invalid UTF-8 string: {e}")))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Incremental frame decoder for synchronous byte streams.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and extract every complete frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<BusFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while !self.buf.is_empty() {
            let Some((length, used)) = decode_remaining_length(&self.buf[1..])? else {
                break;
            };
            let total = 1 + used + length;
            if self.buf.len() < total {
                break;
            }
            frames.push(BusFrame::new(self.buf[0], self.buf[1 + used..total].to_vec()));
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder holds a partial frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Packet {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!decoder.has_partial());
        Packet::from_frame(&frames[0]).unwrap()
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for (length, expected) in [
            (0usize, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
        ] {
            let encoded = encode_remaining_length(length).unwrap();
            assert_eq!(encoded, expected, "length {length}");
            assert_eq!(
                decode_remaining_length(&encoded).unwrap(),
                Some((length, encoded.len()))
            );
        }
    }

    #[test]
    fn test_frame_payload_preserved_at_boundaries() {
        for length in [0usize, 1, 127, 128, 16_383] {
            let payload: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();
            let frame = BusFrame::new(0x30, payload.clone());
            let encoded = frame.encode().unwrap();
            let continuation = encoded[1] & 0x80 != 0;
            assert_eq!(continuation, length > 127, "length {length}");

            let frames = FrameDecoder::new().feed(&encoded).unwrap();
            assert_eq!(frames[0].payload, payload);
        }
    }

    #[test]
    fn test_remaining_length_too_large() {
        assert!(encode_remaining_length(MAX_REMAINING_LENGTH + 1).is_err());
        assert!(decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_connect_bytes() {
        let packet = Packet::Connect {
            client_id: "mqttjs_0a1b2c3d".to_string(),
            username: Some("u".to_string()),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], 0x10);
        assert_eq!(bytes[1] as usize, bytes.len() - 2);
        assert_eq!(&bytes[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(bytes[8], 0x04);
        assert_eq!(bytes[9], 0x82);
        assert_eq!(&bytes[10..12], &[0x00, 0x00]);
        assert_eq!(decode_one(&bytes), packet);
    }

    #[test]
    fn test_connack_accepted() {
        assert_eq!(decode_one(&[0x20, 0x02, 0x00, 0x00]), Packet::ConnAck);
    }

    #[test]
    fn test_connack_refused_is_protocol_error() {
        let frame = BusFrame::new(0x20, vec![0x00, 0x05]);
        assert!(matches!(Packet::from_frame(&frame), Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_fixed_length_violation() {
        let frame = BusFrame::new(0x20, vec![0x00, 0x00, 0x00]);
        assert!(matches!(Packet::from_frame(&frame), Err(RelayError::Protocol(_))));
        let frame = BusFrame::new(0x40, vec![0x00]);
        assert!(matches!(Packet::from_frame(&frame), Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_subscribe_control_byte_and_suback() {
        let bytes = Packet::Subscribe {
            packet_id: 0xC095,
            topic: "client/abc/+".to_string(),
            qos: 1,
        }
        .encode()
        .unwrap();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(&bytes[2..4], &[0xC0, 0x95]);
        assert_eq!(*bytes.last().unwrap(), 0x01);

        assert_eq!(
            decode_one(&[0x90, 0x03, 0xC0, 0x95, 0x01]),
            Packet::SubAck { packet_id: 0xC095, granted_qos: 1 }
        );
        let rejected = BusFrame::new(0x90, vec![0xC0, 0x95, 0x80]);
        assert!(Packet::from_frame(&rejected).is_err());
    }

    #[test]
    fn test_publish_qos1_has_packet_id() {
        let packet = Packet::Publish {
            topic: "t/1".to_string(),
            qos: 1,
            packet_id: Some(7),
            payload: b"{}".to_vec(),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], 0x32);
        assert_eq!(&bytes[2..9], &[0x00, 0x03, b't', b'/', b'1', 0x00, 0x07]);
        assert_eq!(decode_one(&bytes), packet);
    }

    #[test]
    fn test_publish_qos0_payload_runs_to_end() {
        let mut bytes = vec![0x30, 0x00, 0x00, 0x01, b'x'];
        bytes.extend_from_slice(b"hello");
        bytes[1] = (bytes.len() - 2) as u8;
        assert_eq!(
            decode_one(&bytes),
            Packet::Publish {
                topic: "x".to_string(),
                qos: 0,
                packet_id: None,
                payload: b"hello".to_vec(),
            }
        );
    }

    #[test]
    fn test_long_topic_prefix_is_big_endian() {
        let topic = "t".repeat(300);
        let bytes = Packet::Unsubscribe { packet_id: 1, topic: topic.clone() }
            .encode()
            .unwrap();
        // [A2][len len][id id][0x01 0x2C]...
        assert_eq!(bytes[0], 0xA2);
        assert_eq!(&bytes[5..7], &[0x01, 0x2C]);
        assert_eq!(decode_one(&bytes), Packet::Unsubscribe { packet_id: 1, topic });
    }

    #[test]
    fn test_truncated_publish_topic() {
        let frame = BusFrame::new(0x30, vec![0x00, 0x09, b'a']);
        assert!(matches!(Packet::from_frame(&frame), Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = BusFrame::new(0xD0, vec![]);
        assert!(matches!(Packet::from_frame(&frame), Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = Packet::PubAck { packet_id: 42 }.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        for byte in &bytes[..bytes.len() - 1] {
            assert!(decoder.feed(&[*byte]).unwrap().is_empty());
        }
        let frames = decoder.feed(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(Packet::from_frame(&frames[0]).unwrap(), Packet::PubAck { packet_id: 42 });
    }
}

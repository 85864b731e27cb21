//! BattlEye RCON wire protocol.
//!
//! Every datagram is `'B' 'E'`, a little-endian CRC-32 of the rest of the
//! datagram, `0xFF`, a packet type byte and a type-specific body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

const MAGIC: &[u8; 2] = b"BE";
const SEPARATOR: u8 = 0xFF;
/// Magic, checksum and separator.
const HEADER_LEN: usize = 7;
/// Largest datagram we expect from a server.
pub const MAX_DATAGRAM: usize = 65_507;

/// Leading multipart marker in a command reply body.
const MULTIPART_MARKER: u8 = 0x00;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Login = 0x00,
    Command = 0x01,
    ServerMessage = 0x02,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Login),
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::ServerMessage),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// A checksummed frame: packet type plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: PacketType,
    pub body: Bytes,
}

/// Encode a frame into a datagram.
#[must_use]
pub fn encode_frame(kind: PacketType, body: &[u8]) -> Bytes {
    let mut signed = BytesMut::with_capacity(2 + body.len());
    signed.put_u8(SEPARATOR);
    signed.put_u8(kind as u8);
    signed.put_slice(body);

    let mut out = BytesMut::with_capacity(HEADER_LEN - 1 + signed.len());
    out.put_slice(MAGIC);
    out.put_u32_le(crc32(&signed));
    out.put_slice(&signed);
    out.freeze()
}

/// Validate and split a datagram into a frame.
///
/// # Errors
/// Returns error on short input, bad magic, checksum mismatch or unknown type.
pub fn decode_frame(datagram: &[u8]) -> Result<Frame, DecodeError> {
    if datagram.len() < HEADER_LEN + 1 {
        return Err(DecodeError::TooShort(datagram.len()));
    }
    if &datagram[..2] != MAGIC || datagram[6] != SEPARATOR {
        return Err(DecodeError::BadHeader);
    }
    let expected = u32::from_le_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
    let actual = crc32(&datagram[6..]);
    if expected != actual {
        return Err(DecodeError::Checksum { expected, actual });
    }
    let kind = PacketType::try_from(datagram[7])?;
    Ok(Frame {
        kind,
        body: Bytes::copy_from_slice(&datagram[HEADER_LEN + 1..]),
    })
}

fn crc32(data: &[u8]) -> u32 {
    zlib_rs::crc32::crc32(0, data)
}

/// Packets sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPacket<'a> {
    /// Authenticate with the server password.
    Login { password: &'a str },
    /// Run a command. An empty command is the keep-alive probe.
    Command { seq: u8, command: &'a str },
    /// Acknowledge a server message.
    Ack { seq: u8 },
}

impl ClientPacket<'_> {
    /// Encode into a datagram.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match *self {
            Self::Login { password } => encode_frame(PacketType::Login, password.as_bytes()),
            Self::Command { seq, command } => {
                let mut body = Vec::with_capacity(1 + command.len());
                body.push(seq);
                body.extend_from_slice(command.as_bytes());
                encode_frame(PacketType::Command, &body)
            }
            Self::Ack { seq } => encode_frame(PacketType::ServerMessage, &[seq]),
        }
    }
}

/// Multipart position of a command reply fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub count: u8,
    pub index: u8,
}

/// Packets received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// Answer to a login attempt.
    LoginReply { accepted: bool },
    /// Acknowledgment of a command, possibly one fragment of several.
    CommandReply {
        seq: u8,
        part: Option<Part>,
        body: Bytes,
    },
    /// Asynchronous chat or event line that must be acknowledged.
    Message { seq: u8, body: Bytes },
}

impl ServerPacket {
    /// Decode a datagram received from the server.
    ///
    /// # Errors
    /// Returns error if the frame is invalid or its body is malformed.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        let Frame { kind, body } = decode_frame(datagram)?;
        match kind {
            PacketType::Login => {
                let flag = *body.first().ok_or(DecodeError::Malformed("empty login reply"))?;
                Ok(Self::LoginReply {
                    accepted: flag == 0x01,
                })
            }
            PacketType::Command => {
                let seq = *body.first().ok_or(DecodeError::Malformed("missing sequence"))?;
                let rest = body.slice(1..);
                if rest.first() == Some(&MULTIPART_MARKER) {
                    if rest.len() < 3 {
                        return Err(DecodeError::Malformed("truncated multipart header"));
                    }
                    let part = Part {
                        count: rest[1],
                        index: rest[2],
                    };
                    if part.count == 0 || part.index >= part.count {
                        return Err(DecodeError::Malformed("multipart index out of range"));
                    }
                    Ok(Self::CommandReply {
                        seq,
                        part: Some(part),
                        body: rest.slice(3..),
                    })
                } else {
                    Ok(Self::CommandReply {
                        seq,
                        part: None,
                        body: rest,
                    })
                }
            }
            PacketType::ServerMessage => {
                let seq = *body.first().ok_or(DecodeError::Malformed("missing sequence"))?;
                Ok(Self::Message {
                    seq,
                    body: body.slice(1..),
                })
            }
        }
    }

    /// Encode into a datagram, as a server would send it.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::LoginReply { accepted } => {
                encode_frame(PacketType::Login, &[u8::from(*accepted)])
            }
            Self::CommandReply { seq, part, body } => {
                let mut out = vec![*seq];
                if let Some(part) = part {
                    out.extend_from_slice(&[MULTIPART_MARKER, part.count, part.index]);
                }
                out.extend_from_slice(body);
                encode_frame(PacketType::Command, &out)
            }
            Self::Message { seq, body } => {
                let mut out = vec![*seq];
                out.extend_from_slice(body);
                encode_frame(PacketType::ServerMessage, &out)
            }
        }
    }
}

/// Push channel a server message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Event,
}

const CHAT_PREFIXES: &[&str] = &[
    "(Global)",
    "(Side)",
    "(Command)",
    "(Group)",
    "(Vehicle)",
    "(Direct)",
    "(Unknown)",
    "RCon admin #",
];

/// Classify a server message as chat or event.
#[must_use]
pub fn classify(message: &str) -> MessageKind {
    if CHAT_PREFIXES.iter().any(|p| message.starts_with(p)) {
        MessageKind::Chat
    } else {
        MessageKind::Event
    }
}

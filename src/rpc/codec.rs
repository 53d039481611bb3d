//! Multi-part message framing for the engine bus.
//!
//! Each logical message is one outer frame:
//! - 4 bytes: body length (big-endian)
//! - body: 2 bytes part count, then each part as 4-byte length + bytes
//!
//! Part 0 is the 16-byte slave id, part 1 the message opcode, and the
//! remaining parts depend on the opcode. Decoding consumes the whole frame;
//! missing continuations and trailing parts are reported as errors so the
//! caller can drop the envelope without losing stream sync.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Maximum outer frame size (16 MB). Request payloads are opaque, but a
/// runaway length prefix must not allocate unbounded memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message opcodes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Periodic liveness signal, slave -> engine.
    Heartbeat = 1,
    /// Termination order or acknowledgement, either direction.
    Terminate = 2,
    /// Dispatch a job to a slave, engine -> slave.
    Invoke = 3,
    /// One piece of a job response, slave -> engine.
    Chunk = 4,
    /// Job failure with code and message, slave -> engine.
    Error = 5,
    /// End of a job response, slave -> engine.
    Choke = 6,
}

impl TryFrom<u32> for Opcode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Opcode::Heartbeat),
            2 => Ok(Opcode::Terminate),
            3 => Ok(Opcode::Invoke),
            4 => Ok(Opcode::Chunk),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Choke),
            _ => Err(CodecError::UnknownOpcode(value)),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u32),

    #[error("truncated frame: expected {expected} more bytes")]
    Truncated { expected: usize },

    #[error("missing '{part}' part in a type {opcode:?} message")]
    MissingPart { opcode: Opcode, part: &'static str },

    #[error("{extra} trailing parts after a complete type {opcode:?} message")]
    TrailingParts { opcode: Opcode, extra: usize },

    #[error("malformed {0} part")]
    MalformedPart(&'static str),

    #[error("invalid UTF-8 in a string part: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed bus message, minus the peer id prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    Heartbeat,
    Terminate,
    Invoke { event: String, request: Bytes },
    Chunk { data: Bytes },
    Error { code: u32, message: String },
    Choke,
}

impl RpcMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            RpcMessage::Heartbeat => Opcode::Heartbeat,
            RpcMessage::Terminate => Opcode::Terminate,
            RpcMessage::Invoke { .. } => Opcode::Invoke,
            RpcMessage::Chunk { .. } => Opcode::Chunk,
            RpcMessage::Error { .. } => Opcode::Error,
            RpcMessage::Choke => Opcode::Choke,
        }
    }
}

/// One complete logical message: the peer id prefix plus the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub slave_id: Uuid,
    pub message: RpcMessage,
}

impl Envelope {
    pub fn new(slave_id: Uuid, message: RpcMessage) -> Self {
        Self { slave_id, message }
    }

    /// Encode into a wire-ready frame, outer length prefix included.
    pub fn encode(&self) -> BytesMut {
        let mut parts: Vec<Bytes> = Vec::with_capacity(4);
        parts.push(Bytes::copy_from_slice(self.slave_id.as_bytes()));

        let mut opcode = BytesMut::with_capacity(4);
        opcode.put_u32(self.message.opcode() as u32);
        parts.push(opcode.freeze());

        match &self.message {
            RpcMessage::Heartbeat | RpcMessage::Terminate | RpcMessage::Choke => {}
            RpcMessage::Invoke { event, request } => {
                parts.push(Bytes::copy_from_slice(event.as_bytes()));
                parts.push(request.clone());
            }
            RpcMessage::Chunk { data } => {
                parts.push(data.clone());
            }
            RpcMessage::Error { code, message } => {
                let mut c = BytesMut::with_capacity(4);
                c.put_u32(*code);
                parts.push(c.freeze());
                parts.push(Bytes::copy_from_slice(message.as_bytes()));
            }
        }

        let body_len: usize = 2 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u16(parts.len() as u16);
        for part in &parts {
            buf.put_u32(part.len() as u32);
            buf.put_slice(part);
        }
        buf
    }

    /// Decode a frame body (outer length prefix already stripped).
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let parts = split_parts(body)?;

        let id_part = parts.first().ok_or(CodecError::MalformedPart("slave id"))?;
        let slave_id =
            Uuid::from_slice(id_part).map_err(|_| CodecError::MalformedPart("slave id"))?;

        let opcode_part = parts.get(1).ok_or(CodecError::MalformedPart("opcode"))?;
        if opcode_part.len() != 4 {
            return Err(CodecError::MalformedPart("opcode"));
        }
        let opcode = Opcode::try_from(u32::from_be_bytes([
            opcode_part[0],
            opcode_part[1],
            opcode_part[2],
            opcode_part[3],
        ]))?;

        let payload = &parts[2..];
        let message = match opcode {
            Opcode::Heartbeat => RpcMessage::Heartbeat,
            Opcode::Terminate => RpcMessage::Terminate,
            Opcode::Choke => RpcMessage::Choke,
            Opcode::Invoke => {
                let event = payload.first().ok_or(CodecError::MissingPart {
                    opcode,
                    part: "event",
                })?;
                let request = payload.get(1).ok_or(CodecError::MissingPart {
                    opcode,
                    part: "request",
                })?;
                RpcMessage::Invoke {
                    event: String::from_utf8(event.to_vec())?,
                    request: request.clone(),
                }
            }
            Opcode::Chunk => {
                let data = payload.first().ok_or(CodecError::MissingPart {
                    opcode,
                    part: "data",
                })?;
                RpcMessage::Chunk { data: data.clone() }
            }
            Opcode::Error => {
                let code = payload.first().ok_or(CodecError::MissingPart {
                    opcode,
                    part: "code",
                })?;
                let message = payload.get(1).ok_or(CodecError::MissingPart {
                    opcode,
                    part: "message",
                })?;
                if code.len() != 4 {
                    return Err(CodecError::MalformedPart("error code"));
                }
                RpcMessage::Error {
                    code: u32::from_be_bytes([code[0], code[1], code[2], code[3]]),
                    message: String::from_utf8(message.to_vec())?,
                }
            }
        };

        let consumed = match opcode {
            Opcode::Heartbeat | Opcode::Terminate | Opcode::Choke => 0,
            Opcode::Chunk => 1,
            Opcode::Invoke | Opcode::Error => 2,
        };
        if payload.len() > consumed {
            return Err(CodecError::TrailingParts {
                opcode,
                extra: payload.len() - consumed,
            });
        }

        Ok(Envelope { slave_id, message })
    }
}

fn split_parts(mut body: Bytes) -> Result<Vec<Bytes>, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Truncated {
            expected: 2 - body.remaining(),
        });
    }
    let count = body.get_u16() as usize;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(CodecError::Truncated {
                expected: 4 - body.remaining(),
            });
        }
        let len = body.get_u32() as usize;
        if body.remaining() < len {
            return Err(CodecError::Truncated {
                expected: len - body.remaining(),
            });
        }
        parts.push(body.split_to(len));
    }
    Ok(parts)
}

/// Read one frame body from the stream. Returns `None` on a clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

/// Write one envelope to the stream.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.encode();
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

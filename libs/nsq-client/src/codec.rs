use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NsqError;

/// Protocol magic, written once right after the TCP connect.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const RESPONSE_OK: &[u8] = b"OK";
pub const RESPONSE_HEARTBEAT: &[u8] = b"_heartbeat_";
pub const RESPONSE_CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

// ═══════════════════════════════════════════════════════════════
//  MessageId
// ═══════════════════════════════════════════════════════════════

/// 16-byte ASCII hex id assigned by nsqd.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

// ═══════════════════════════════════════════════════════════════
//  Frames (nsqd → client)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Bytes),
}

// ═══════════════════════════════════════════════════════════════
//  Commands (client → nsqd)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Nop,
    Cls,
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
}

impl Command {
    /// FIN and REQ end the in-flight life of a message on its connection.
    pub fn releases_message(&self) -> bool {
        matches!(self, Command::Fin(_) | Command::Req { .. })
    }
}

// ═══════════════════════════════════════════════════════════════
//  NsqCodec
// ═══════════════════════════════════════════════════════════════

/// `[u32 size][u32 frame type][data]` on read, line commands on write.
#[derive(Debug, Clone)]
pub struct NsqCodec {
    max_frame: usize,
}

impl NsqCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for NsqCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = NsqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, NsqError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < 4 {
            return Err(NsqError::Protocol(format!("frame size {size} shorter than frame type")));
        }
        if size > self.max_frame {
            return Err(NsqError::FrameTooLarge { size, max: self.max_frame });
        }

        let total = 4 + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_u32();
        let data = src.split_to(size - 4).freeze();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => Ok(Some(Frame::Message(data))),
            other => Err(NsqError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = NsqError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), NsqError> {
        match cmd {
            Command::Identify(body) => {
                dst.put_slice(b"IDENTIFY\n");
                put_sized(dst, &body)?;
            }
            Command::Sub { topic, channel } => {
                dst.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => {
                dst.put_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => put_id_line(dst, b"FIN ", &id, None),
            Command::Req { id, delay_ms } => put_id_line(dst, b"REQ ", &id, Some(delay_ms)),
            Command::Touch(id) => put_id_line(dst, b"TOUCH ", &id, None),
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Cls => dst.put_slice(b"CLS\n"),
            Command::Pub { topic, body } => {
                dst.put_slice(format!("PUB {topic}\n").as_bytes());
                put_sized(dst, &body)?;
            }
            Command::Mpub { topic, bodies } => {
                dst.put_slice(format!("MPUB {topic}\n").as_bytes());
                let payload: usize = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                dst.put_u32(frame_len(payload)?);
                dst.put_u32(frame_len(bodies.len())?);
                for body in &bodies {
                    put_sized(dst, body)?;
                }
            }
        }
        Ok(())
    }
}

fn put_sized(dst: &mut BytesMut, body: &[u8]) -> Result<(), NsqError> {
    dst.put_u32(frame_len(body.len())?);
    dst.put_slice(body);
    Ok(())
}

fn put_id_line(dst: &mut BytesMut, verb: &[u8], id: &MessageId, delay_ms: Option<u64>) {
    dst.put_slice(verb);
    dst.put_slice(id.as_bytes());
    if let Some(delay) = delay_ms {
        dst.put_slice(format!(" {delay}").as_bytes());
    }
    dst.put_u8(b'\n');
}

fn frame_len(len: usize) -> Result<u32, NsqError> {
    u32::try_from(len).map_err(|_| NsqError::FrameTooLarge { size: len, max: u32::MAX as usize })
}

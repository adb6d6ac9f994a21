//! Wire protocol.
//!
//! Every request and reply travels as one frame:
//! `[u32 length][u8 type][u64 correlation_id][payload]`, length covering
//! everything after the length field itself. Replies echo the request's
//! correlation id. Payloads are fixed hand-rolled layouts over big-endian
//! integers and length-prefixed byte runs; message ids travel as their two
//! `u64` halves and print as `<ms>-<seq>` everywhere humans see them.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::error::QueueError;
use crate::core::id::MessageId;

pub const LENGTH_FIELD_LEN: usize = 4;
const HEADER_LEN: usize = 1 + 8;
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    // Requests
    Push = 0x01,
    Pop = 0x02,
    Ack = 0x03,
    Recover = 0x04,
    Range = 0x05,
    Info = 0x06,
    // Replies
    Ids = 0x10,
    Items = 0x11,
    Entries = 0x12,
    InfoReply = 0x13,
    Error = 0x14,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameDecodeError;

    fn try_from(value: u8) -> Result<Self, FrameDecodeError> {
        match value {
            0x01 => Ok(FrameType::Push),
            0x02 => Ok(FrameType::Pop),
            0x03 => Ok(FrameType::Ack),
            0x04 => Ok(FrameType::Recover),
            0x05 => Ok(FrameType::Range),
            0x06 => Ok(FrameType::Info),
            0x10 => Ok(FrameType::Ids),
            0x11 => Ok(FrameType::Items),
            0x12 => Ok(FrameType::Entries),
            0x13 => Ok(FrameType::InfoReply),
            0x14 => Ok(FrameType::Error),
            other => Err(FrameDecodeError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub correlation_id: u64,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
}

#[derive(Debug, Error)]
pub enum FrameEncodeError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

// ───────────────────────────────────────────────────────────
// Field helpers
// ───────────────────────────────────────────────────────────

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), FrameEncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| FrameEncodeError::PayloadTooLarge(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(slice: &mut &[u8]) -> Result<String, FrameDecodeError> {
    if slice.remaining() < 2 {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    let len = slice.get_u16() as usize;
    if slice.remaining() < len {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    let raw = slice.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameDecodeError::InvalidLength(len as u32))
}

fn put_blob(buf: &mut BytesMut, blob: &[u8]) -> Result<(), FrameEncodeError> {
    let len =
        u32::try_from(blob.len()).map_err(|_| FrameEncodeError::PayloadTooLarge(blob.len()))?;
    buf.put_u32(len);
    buf.put_slice(blob);
    Ok(())
}

fn get_blob(slice: &mut &[u8]) -> Result<Bytes, FrameDecodeError> {
    if slice.remaining() < 4 {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    let len = slice.get_u32() as usize;
    if slice.remaining() < len {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    Ok(slice.copy_to_bytes(len))
}

fn put_id(buf: &mut BytesMut, id: MessageId) {
    buf.put_u64(id.ms);
    buf.put_u64(id.seq);
}

fn get_id(slice: &mut &[u8]) -> Result<MessageId, FrameDecodeError> {
    if slice.remaining() < 16 {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    Ok(MessageId {
        ms: slice.get_u64(),
        seq: slice.get_u64(),
    })
}

fn get_u32_checked(slice: &mut &[u8]) -> Result<u32, FrameDecodeError> {
    if slice.remaining() < 4 {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    Ok(slice.get_u32())
}

fn need(slice: &&[u8], n: usize) -> Result<(), FrameDecodeError> {
    if slice.remaining() < n {
        return Err(FrameDecodeError::InvalidLength(slice.remaining() as u32));
    }
    Ok(())
}

fn expect_consumed(slice: &[u8]) -> Result<(), FrameDecodeError> {
    if slice.is_empty() {
        Ok(())
    } else {
        Err(FrameDecodeError::InvalidLength(slice.len() as u32))
    }
}

// ───────────────────────────────────────────────────────────
// Request payloads
// ───────────────────────────────────────────────────────────

/// PUSH payload: `[str queue][u32 n]{[u32 len][bytes]}*n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPayload {
    pub queue: String,
    pub payloads: Vec<Bytes>,
}

impl PushPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.queue)?;
        let n = u32::try_from(self.payloads.len())
            .map_err(|_| FrameEncodeError::PayloadTooLarge(self.payloads.len()))?;
        buf.put_u32(n);
        for payload in &self.payloads {
            put_blob(&mut buf, payload)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let queue = get_str(&mut slice)?;
        let n = get_u32_checked(&mut slice)?;
        let mut payloads = Vec::with_capacity(n as usize);
        for _ in 0..n {
            payloads.push(get_blob(&mut slice)?);
        }
        expect_consumed(slice)?;
        Ok(Self { queue, payloads })
    }
}

/// POP payload: `[u16 n]{[str queue]}*n [u64 count][i64 block_ms]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopPayload {
    pub queues: Vec<String>,
    pub count: u64,
    pub block_ms: i64,
}

impl PopPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        let n = u16::try_from(self.queues.len())
            .map_err(|_| FrameEncodeError::PayloadTooLarge(self.queues.len()))?;
        buf.put_u16(n);
        for queue in &self.queues {
            put_str(&mut buf, queue)?;
        }
        buf.put_u64(self.count);
        buf.put_i64(self.block_ms);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        need(&slice, 2)?;
        let n = slice.get_u16();
        let mut queues = Vec::with_capacity(n as usize);
        for _ in 0..n {
            queues.push(get_str(&mut slice)?);
        }
        need(&slice, 16)?;
        let count = slice.get_u64();
        let block_ms = slice.get_i64();
        expect_consumed(slice)?;
        Ok(Self {
            queues,
            count,
            block_ms,
        })
    }
}

/// ACK payload: `[str queue][u32 n]{[u64 ms][u64 seq]}*n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub queue: String,
    pub ids: Vec<MessageId>,
}

impl AckPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.queue)?;
        let n = u32::try_from(self.ids.len())
            .map_err(|_| FrameEncodeError::PayloadTooLarge(self.ids.len()))?;
        buf.put_u32(n);
        for &id in &self.ids {
            put_id(&mut buf, id);
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let queue = get_str(&mut slice)?;
        let n = get_u32_checked(&mut slice)?;
        let mut ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            ids.push(get_id(&mut slice)?);
        }
        expect_consumed(slice)?;
        Ok(Self { queue, ids })
    }
}

/// RECOVER payload: `[str queue][u64 count][i64 min_idle_ms]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverPayload {
    pub queue: String,
    pub count: u64,
    pub min_idle_ms: i64,
}

impl RecoverPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.queue)?;
        buf.put_u64(self.count);
        buf.put_i64(self.min_idle_ms);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let queue = get_str(&mut slice)?;
        need(&slice, 16)?;
        let count = slice.get_u64();
        let min_idle_ms = slice.get_i64();
        expect_consumed(slice)?;
        Ok(Self {
            queue,
            count,
            min_idle_ms,
        })
    }
}

/// RANGE payload: `[str queue][u8 pending][i64 start][u64 count]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePayload {
    pub queue: String,
    pub pending: bool,
    pub start: i64,
    pub count: u64,
}

impl RangePayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.queue)?;
        buf.put_u8(self.pending as u8);
        buf.put_i64(self.start);
        buf.put_u64(self.count);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let queue = get_str(&mut slice)?;
        need(&slice, 17)?;
        let pending = slice.get_u8() != 0;
        let start = slice.get_i64();
        let count = slice.get_u64();
        expect_consumed(slice)?;
        Ok(Self {
            queue,
            pending,
            start,
            count,
        })
    }
}

/// INFO payload: `[str queue]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPayload {
    pub queue: String,
}

impl InfoPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.queue)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let queue = get_str(&mut slice)?;
        expect_consumed(slice)?;
        Ok(Self { queue })
    }
}

// ───────────────────────────────────────────────────────────
// Reply payloads
// ───────────────────────────────────────────────────────────

/// IDS reply: `[u32 n]{[u64 ms][u64 seq]}*n`, used for PUSH and ACK results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdsPayload {
    pub ids: Vec<MessageId>,
}

impl IdsPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        let n = u32::try_from(self.ids.len())
            .map_err(|_| FrameEncodeError::PayloadTooLarge(self.ids.len()))?;
        buf.put_u32(n);
        for &id in &self.ids {
            put_id(&mut buf, id);
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let n = get_u32_checked(&mut slice)?;
        let mut ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            ids.push(get_id(&mut slice)?);
        }
        expect_consumed(slice)?;
        Ok(Self { ids })
    }
}

/// One POP result item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireItem {
    pub queue: String,
    pub id: MessageId,
    pub payload: Bytes,
}

/// ITEMS reply: `[u32 n]{[str queue][id][u32 len][bytes]}*n`, used for POP
/// results; empty on timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemsPayload {
    pub items: Vec<WireItem>,
}

impl ItemsPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        let n = u32::try_from(self.items.len())
            .map_err(|_| FrameEncodeError::PayloadTooLarge(self.items.len()))?;
        buf.put_u32(n);
        for item in &self.items {
            put_str(&mut buf, &item.queue)?;
            put_id(&mut buf, item.id);
            put_blob(&mut buf, &item.payload)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let n = get_u32_checked(&mut slice)?;
        let mut items = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let queue = get_str(&mut slice)?;
            let id = get_id(&mut slice)?;
            let payload = get_blob(&mut slice)?;
            items.push(WireItem { queue, id, payload });
        }
        expect_consumed(slice)?;
        Ok(Self { items })
    }
}

/// One RANGE/RECOVER result entry. Delivery fields are zero for entries
/// from the undelivered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEntry {
    pub id: MessageId,
    pub payload: Bytes,
    pub deliveries: u32,
    pub last_delivery: i64,
    pub age_ms: i64,
}

/// ENTRIES reply: `[u32 n]{[id][u32 len][bytes][u32 deliveries][i64 last][i64 age]}*n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntriesPayload {
    pub entries: Vec<WireEntry>,
}

impl EntriesPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        let n = u32::try_from(self.entries.len())
            .map_err(|_| FrameEncodeError::PayloadTooLarge(self.entries.len()))?;
        buf.put_u32(n);
        for entry in &self.entries {
            put_id(&mut buf, entry.id);
            put_blob(&mut buf, &entry.payload)?;
            buf.put_u32(entry.deliveries);
            buf.put_i64(entry.last_delivery);
            buf.put_i64(entry.age_ms);
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let n = get_u32_checked(&mut slice)?;
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = get_id(&mut slice)?;
            let payload = get_blob(&mut slice)?;
            need(&slice, 20)?;
            let deliveries = slice.get_u32();
            let last_delivery = slice.get_i64();
            let age_ms = slice.get_i64();
            entries.push(WireEntry {
                id,
                payload,
                deliveries,
                last_delivery,
                age_ms,
            });
        }
        expect_consumed(slice)?;
        Ok(Self { entries })
    }
}

/// INFO reply: `[id last][u64 undelivered][u64 delivered][u64 waiters][u64 memory]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoReplyPayload {
    pub last_id: MessageId,
    pub undelivered: u64,
    pub delivered: u64,
    pub waiters: u64,
    pub memory_used: u64,
}

impl InfoReplyPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(16 + 32);
        put_id(&mut buf, self.last_id);
        buf.put_u64(self.undelivered);
        buf.put_u64(self.delivered);
        buf.put_u64(self.waiters);
        buf.put_u64(self.memory_used);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        if payload.len() != 48 {
            return Err(FrameDecodeError::InvalidLength(payload.len() as u32));
        }
        let mut slice = &payload[..];
        let last_id = get_id(&mut slice)?;
        Ok(Self {
            last_id,
            undelivered: slice.get_u64(),
            delivered: slice.get_u64(),
            waiters: slice.get_u64(),
            memory_used: slice.get_u64(),
        })
    }
}

pub const ERR_NO_SUCH_QUEUE: u16 = 1;
pub const ERR_INVALID_ARGUMENT: u16 = 2;
pub const ERR_PAYLOAD_TOO_LARGE: u16 = 3;
pub const ERR_INTERNAL: u16 = 255;

/// ERROR reply: `[u16 code][str message]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

impl ErrorPayload {
    pub fn from_error(err: &QueueError) -> Self {
        let code = match err {
            QueueError::NoSuchQueue(_) => ERR_NO_SUCH_QUEUE,
            QueueError::InvalidArgument(_) => ERR_INVALID_ARGUMENT,
            QueueError::PayloadTooLarge { .. } => ERR_PAYLOAD_TOO_LARGE,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.code);
        put_str(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        need(&slice, 2)?;
        let code = slice.get_u16();
        let message = get_str(&mut slice)?;
        expect_consumed(slice)?;
        Ok(Self { code, message })
    }
}

// ───────────────────────────────────────────────────────────
// Frame codec
// ───────────────────────────────────────────────────────────

/// Encode a frame into the provided buffer.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
    let payload_len = frame.payload.len();
    let total_len = HEADER_LEN
        .checked_add(payload_len)
        .ok_or(FrameEncodeError::PayloadTooLarge(payload_len))?;

    if total_len > MAX_FRAME_SIZE as usize {
        return Err(FrameEncodeError::PayloadTooLarge(payload_len));
    }

    dst.reserve(LENGTH_FIELD_LEN + total_len);
    dst.put_u32(total_len as u32);
    dst.put_u8(frame.frame_type.into());
    dst.put_u64(frame.correlation_id);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Try to decode a single frame from the buffer.
///
/// Returns `Ok(None)` if there is not yet enough data for a full frame.
pub fn try_decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, FrameDecodeError> {
    if src.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }

    let mut length_bytes = &src[..LENGTH_FIELD_LEN];
    let frame_len = length_bytes.get_u32();

    if frame_len == 0 {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }
    if frame_len > MAX_FRAME_SIZE {
        return Err(FrameDecodeError::FrameTooLarge(frame_len));
    }
    let frame_len_usize = frame_len as usize;
    if frame_len_usize < HEADER_LEN {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }

    if src.len() < LENGTH_FIELD_LEN + frame_len_usize {
        return Ok(None);
    }

    let mut frame_bytes = src.split_to(LENGTH_FIELD_LEN + frame_len_usize);
    frame_bytes.advance(LENGTH_FIELD_LEN);

    let frame_type = FrameType::try_from(frame_bytes.get_u8())?;
    let correlation_id = frame_bytes.get_u64();
    let payload = frame_bytes.copy_to_bytes(frame_bytes.remaining());

    Ok(Some(Frame {
        frame_type,
        correlation_id,
        payload,
    }))
}

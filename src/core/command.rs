//! Typed command layer between the wire codec and the store.

use bytes::Bytes;

use crate::core::error::QueueError;
use crate::core::id::MessageId;
use crate::core::wire::{
    AckPayload, Frame, FrameEncodeError, FrameType, InfoPayload, PopPayload, PushPayload,
    RangePayload, RecoverPayload,
};

/// One parsed client request, mirroring the command surface one to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Push {
        queue: String,
        payloads: Vec<Bytes>,
    },
    Pop {
        queues: Vec<String>,
        count: u64,
        block_ms: i64,
    },
    Ack {
        queue: String,
        ids: Vec<MessageId>,
    },
    Recover {
        queue: String,
        count: u64,
        min_idle_ms: i64,
    },
    Range {
        queue: String,
        pending: bool,
        start: i64,
        count: u64,
    },
    Info {
        queue: String,
    },
}

impl Command {
    /// Decodes a request frame. Malformed payloads and reply-typed frames
    /// surface as `InvalidArgument` before any state is touched.
    pub fn from_frame(frame: &Frame) -> Result<Command, QueueError> {
        let bad = |e: &dyn std::fmt::Display| QueueError::InvalidArgument(format!("bad frame: {e}"));
        match frame.frame_type {
            FrameType::Push => {
                let p = PushPayload::decode(&frame.payload).map_err(|e| bad(&e))?;
                Ok(Command::Push {
                    queue: p.queue,
                    payloads: p.payloads,
                })
            }
            FrameType::Pop => {
                let p = PopPayload::decode(&frame.payload).map_err(|e| bad(&e))?;
                Ok(Command::Pop {
                    queues: p.queues,
                    count: p.count,
                    block_ms: p.block_ms,
                })
            }
            FrameType::Ack => {
                let p = AckPayload::decode(&frame.payload).map_err(|e| bad(&e))?;
                Ok(Command::Ack {
                    queue: p.queue,
                    ids: p.ids,
                })
            }
            FrameType::Recover => {
                let p = RecoverPayload::decode(&frame.payload).map_err(|e| bad(&e))?;
                Ok(Command::Recover {
                    queue: p.queue,
                    count: p.count,
                    min_idle_ms: p.min_idle_ms,
                })
            }
            FrameType::Range => {
                let p = RangePayload::decode(&frame.payload).map_err(|e| bad(&e))?;
                Ok(Command::Range {
                    queue: p.queue,
                    pending: p.pending,
                    start: p.start,
                    count: p.count,
                })
            }
            FrameType::Info => {
                let p = InfoPayload::decode(&frame.payload).map_err(|e| bad(&e))?;
                Ok(Command::Info { queue: p.queue })
            }
            other => Err(QueueError::InvalidArgument(format!(
                "frame type {:?} is not a request",
                other
            ))),
        }
    }

    /// Encodes this command as a request frame; the client side of
    /// [`Command::from_frame`].
    pub fn to_frame(&self, correlation_id: u64) -> Result<Frame, FrameEncodeError> {
        let (frame_type, payload) = match self {
            Command::Push { queue, payloads } => (
                FrameType::Push,
                PushPayload {
                    queue: queue.clone(),
                    payloads: payloads.clone(),
                }
                .encode()?,
            ),
            Command::Pop {
                queues,
                count,
                block_ms,
            } => (
                FrameType::Pop,
                PopPayload {
                    queues: queues.clone(),
                    count: *count,
                    block_ms: *block_ms,
                }
                .encode()?,
            ),
            Command::Ack { queue, ids } => (
                FrameType::Ack,
                AckPayload {
                    queue: queue.clone(),
                    ids: ids.clone(),
                }
                .encode()?,
            ),
            Command::Recover {
                queue,
                count,
                min_idle_ms,
            } => (
                FrameType::Recover,
                RecoverPayload {
                    queue: queue.clone(),
                    count: *count,
                    min_idle_ms: *min_idle_ms,
                }
                .encode()?,
            ),
            Command::Range {
                queue,
                pending,
                start,
                count,
            } => (
                FrameType::Range,
                RangePayload {
                    queue: queue.clone(),
                    pending: *pending,
                    start: *start,
                    count: *count,
                }
                .encode()?,
            ),
            Command::Info { queue } => (
                FrameType::Info,
                InfoPayload {
                    queue: queue.clone(),
                }
                .encode()?,
            ),
        };
        Ok(Frame {
            frame_type,
            correlation_id,
            payload,
        })
    }
}

pub fn new_push(queue: impl Into<String>, payloads: Vec<Bytes>) -> Command {
    Command::Push {
        queue: queue.into(),
        payloads,
    }
}

pub fn new_pop(queues: Vec<String>, count: u64, block_ms: i64) -> Command {
    Command::Pop {
        queues,
        count,
        block_ms,
    }
}

pub fn new_ack(queue: impl Into<String>, ids: Vec<MessageId>) -> Command {
    Command::Ack {
        queue: queue.into(),
        ids,
    }
}

pub fn new_recover(queue: impl Into<String>, count: u64, min_idle_ms: i64) -> Command {
    Command::Recover {
        queue: queue.into(),
        count,
        min_idle_ms,
    }
}

pub fn new_range(queue: impl Into<String>, pending: bool, start: i64, count: u64) -> Command {
    Command::Range {
        queue: queue.into(),
        pending,
        start,
        count,
    }
}

pub fn new_info(queue: impl Into<String>) -> Command {
    Command::Info {
        queue: queue.into(),
    }
}

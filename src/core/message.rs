//! Message storage.
//!
//! All live messages of one queue sit in an [`Arena`]: a table of blocks,
//! where each block is one contiguous allocation holding every message
//! created by a single push call. Messages are addressed by
//! `(block, slot)` pairs and chained into queue lists through those
//! addresses, never through references.
//!
//! Acknowledging a message releases its payload right away but keeps the
//! slot storage until every message in the block has been acknowledged;
//! then the whole block is freed at once. A push of one message produces a
//! one-slot block, which the same rule frees on its single ack.

use std::collections::HashMap;
use std::mem;

use bytes::Bytes;

use crate::core::id::MessageId;

/// Address of a message slot inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgAddr {
    pub(crate) block: u64,
    pub(crate) slot: u32,
}

/// A single queue message.
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub payload: Bytes,
    /// How many times the message has been handed to a consumer.
    pub deliveries: u32,
    /// Last delivery time in ms since epoch; 0 = never delivered.
    pub last_delivery: i64,
    pub(crate) next: Option<MsgAddr>,
}

impl Message {
    fn footprint(&self) -> usize {
        mem::size_of::<Message>() + self.payload.len()
    }
}

/// One contiguous batch of message slots from a single push call.
#[derive(Debug)]
struct Block {
    slots: Vec<Option<Message>>,
    acked: u32,
}

impl Block {
    fn count(&self) -> u32 {
        self.slots.len() as u32
    }
}

/// Outcome of acknowledging one slot, for memory accounting by the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckReclaim {
    /// Payload bytes released immediately.
    pub payload_bytes: usize,
    /// Slot storage released because the whole block was freed.
    pub slot_bytes: usize,
}

/// Block-granular storage for the messages of one queue.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    blocks: HashMap<u64, Block>,
    next_block: u64,
}

impl Arena {
    /// Allocates one block for a push batch and chains consecutive slots.
    /// Returns the addresses in slot order; empty input allocates nothing.
    pub fn alloc_block(&mut self, msgs: Vec<Message>) -> Vec<MsgAddr> {
        if msgs.is_empty() {
            return Vec::new();
        }
        let block = self.next_block;
        self.next_block += 1;

        let addrs: Vec<MsgAddr> = (0..msgs.len() as u32)
            .map(|slot| MsgAddr { block, slot })
            .collect();
        let mut slots: Vec<Option<Message>> = msgs.into_iter().map(Some).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            if let Some(msg) = slot {
                msg.next = addrs.get(i + 1).copied();
            }
        }
        self.blocks.insert(block, Block { slots, acked: 0 });
        addrs
    }

    pub fn get(&self, addr: MsgAddr) -> Option<&Message> {
        self.blocks
            .get(&addr.block)
            .and_then(|b| b.slots.get(addr.slot as usize))
            .and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, addr: MsgAddr) -> Option<&mut Message> {
        self.blocks
            .get_mut(&addr.block)
            .and_then(|b| b.slots.get_mut(addr.slot as usize))
            .and_then(|s| s.as_mut())
    }

    /// Acknowledges the message at `addr`: drops its payload now, and frees
    /// the owning block once `acked == count`.
    pub fn ack(&mut self, addr: MsgAddr) -> AckReclaim {
        let mut reclaim = AckReclaim::default();
        let Some(block) = self.blocks.get_mut(&addr.block) else {
            return reclaim;
        };
        let Some(slot) = block.slots.get_mut(addr.slot as usize) else {
            return reclaim;
        };
        if let Some(msg) = slot.take() {
            reclaim.payload_bytes = msg.payload.len();
            block.acked += 1;
            if block.acked == block.count() {
                let freed = self.blocks.remove(&addr.block);
                reclaim.slot_bytes =
                    freed.map_or(0, |b| b.slots.len() * mem::size_of::<Message>());
            }
        }
        reclaim
    }

    /// Estimated heap footprint of a batch before it is allocated.
    pub fn batch_footprint(msgs: &[Message]) -> usize {
        msgs.iter().map(Message::footprint).sum()
    }

    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: u64, payload: &'static [u8]) -> Message {
        Message {
            id: MessageId::new(1, seq),
            payload: Bytes::from_static(payload),
            deliveries: 0,
            last_delivery: 0,
            next: None,
        }
    }

    #[test]
    fn batch_slots_are_chained() {
        let mut arena = Arena::default();
        let addrs = arena.alloc_block(vec![msg(1, b"a"), msg(2, b"b"), msg(3, b"c")]);
        assert_eq!(addrs.len(), 3);
        assert_eq!(arena.get(addrs[0]).unwrap().next, Some(addrs[1]));
        assert_eq!(arena.get(addrs[1]).unwrap().next, Some(addrs[2]));
        assert_eq!(arena.get(addrs[2]).unwrap().next, None);
    }

    #[test]
    fn block_freed_only_when_fully_acked() {
        let mut arena = Arena::default();
        let addrs = arena.alloc_block(vec![msg(1, b"aa"), msg(2, b"bb")]);
        assert_eq!(arena.block_count(), 1);

        let first = arena.ack(addrs[0]);
        assert_eq!(first.payload_bytes, 2);
        assert_eq!(first.slot_bytes, 0);
        assert_eq!(arena.block_count(), 1);
        assert!(arena.get(addrs[0]).is_none());
        assert!(arena.get(addrs[1]).is_some());

        let second = arena.ack(addrs[1]);
        assert_eq!(second.payload_bytes, 2);
        assert_eq!(second.slot_bytes, 2 * mem::size_of::<Message>());
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    fn single_message_block_freed_on_first_ack() {
        let mut arena = Arena::default();
        let addrs = arena.alloc_block(vec![msg(1, b"solo")]);
        let reclaim = arena.ack(addrs[0]);
        assert_eq!(reclaim.payload_bytes, 4);
        assert!(reclaim.slot_bytes > 0);
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    fn double_ack_is_a_no_op() {
        let mut arena = Arena::default();
        let addrs = arena.alloc_block(vec![msg(1, b"x"), msg(2, b"y")]);
        arena.ack(addrs[0]);
        let again = arena.ack(addrs[0]);
        assert_eq!(again, AckReclaim::default());
        assert_eq!(arena.block_count(), 1);
    }
}

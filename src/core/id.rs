//! Message identifiers.
//!
//! An id is a pair of a millisecond Unix time and a sequence counter. Ids
//! generated in the same millisecond (or in a past millisecond if the clock
//! jumped backward) reuse the millisecond of the latest generated id with an
//! incremented sequence, so the stream of ids for one queue is strictly
//! increasing no matter what the wall clock does.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::error::QueueError;

/// Current Unix time in milliseconds.
pub fn mstime() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Queue item id: millisecond time plus sequence counter, ordered
/// lexicographically on `(ms, seq)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId {
    pub ms: u64,
    pub seq: u64,
}

impl MessageId {
    /// The zero id, used as "no id issued yet".
    pub const ZERO: MessageId = MessageId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next id after `last`, stamped with the current wall clock.
    pub fn next_after(last: MessageId) -> MessageId {
        Self::next_at(last, mstime())
    }

    /// Next id after `last` given the current time. If `now_ms` is ahead of
    /// `last`, the new id starts a fresh millisecond at sequence 1. Otherwise
    /// the previous id is advanced in place, never going backward.
    pub fn next_at(last: MessageId, now_ms: u64) -> MessageId {
        if now_ms > last.ms {
            return MessageId { ms: now_ms, seq: 1 };
        }
        if last.seq == u64::MAX {
            if last.ms == u64::MAX {
                // Last possible id; wrap around. Unreachable with real clocks.
                MessageId::ZERO
            } else {
                MessageId {
                    ms: last.ms + 1,
                    seq: 0,
                }
            }
        } else {
            MessageId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

/// Canonical textual form: `<ms>-<seq>`. This is the external identifier
/// format on the wire and in every user-facing surface.
impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || QueueError::InvalidArgument(format!("malformed message id: {s:?}"));
        let (ms, seq) = s.split_once('-').ok_or_else(bad)?;
        Ok(MessageId {
            ms: ms.parse().map_err(|_| bad())?,
            seq: seq.parse().map_err(|_| bad())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_millisecond_starts_at_seq_one() {
        let id = MessageId::next_at(MessageId::new(100, 7), 101);
        assert_eq!(id, MessageId::new(101, 1));
    }

    #[test]
    fn stalled_clock_increments_sequence() {
        let id = MessageId::next_at(MessageId::new(100, 7), 100);
        assert_eq!(id, MessageId::new(100, 8));
    }

    #[test]
    fn backward_clock_never_regresses() {
        let id = MessageId::next_at(MessageId::new(100, 7), 50);
        assert_eq!(id, MessageId::new(100, 8));
        assert!(id > MessageId::new(100, 7));
    }

    #[test]
    fn sequence_exhaustion_rolls_into_next_millisecond() {
        let id = MessageId::next_at(MessageId::new(100, u64::MAX), 100);
        assert_eq!(id, MessageId::new(101, 0));
    }

    #[test]
    fn saturated_id_wraps_to_zero() {
        let id = MessageId::next_at(MessageId::new(u64::MAX, u64::MAX), 5);
        assert_eq!(id, MessageId::ZERO);
    }

    #[test]
    fn strictly_increasing_under_hostile_clock() {
        // Clock held constant, then moved backward: ids must keep increasing.
        let clocks = [100, 100, 100, 42, 42, 101, 99];
        let mut last = MessageId::ZERO;
        for now in clocks {
            let next = MessageId::next_at(last, now);
            assert!(next > last, "{next} must be greater than {last}");
            last = next;
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(MessageId::new(2, 0) > MessageId::new(1, u64::MAX));
        assert!(MessageId::new(1, 2) > MessageId::new(1, 1));
    }

    #[test]
    fn text_round_trip() {
        let id = MessageId::new(1706000000123, 42);
        assert_eq!(id.to_string(), "1706000000123-42");
        assert_eq!("1706000000123-42".parse::<MessageId>().unwrap(), id);
    }

    #[test]
    fn malformed_ids_rejected() {
        for s in ["", "123", "-", "1-", "-2", "a-1", "1-b", "1-2-3", " 1-2"] {
            assert!(s.parse::<MessageId>().is_err(), "{s:?} should not parse");
        }
    }
}

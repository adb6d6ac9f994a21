//! Snapshot persistence.
//!
//! A snapshot file holds every queue in the store behind a small header:
//! magic, format version, queue count. Each queue records its name and last
//! issued id, both list lengths, then every undelivered message as
//! `(ms, seq, payload)` and every delivered message as
//! `(ms, seq, payload, deliveries, last_delivery)`, in list order. Loading
//! rebuilds both lists with their order, head/tail/length bookkeeping and
//! the delivered list's delivery-time ordering intact.

use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::core::id::MessageId;
use crate::core::store::QueueStore;

const HEADER_MAGIC: &[u8; 8] = b"RELIQSN\0";
const HEADER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot corruption: {0}")]
    Corruption(String),
}

/// Per-queue state as persisted: name, last id, then both lists in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub name: String,
    pub last_id: MessageId,
    pub undelivered: Vec<(MessageId, Bytes)>,
    pub delivered: Vec<(MessageId, Bytes, u32, i64)>,
}

/// Writes every queue in the store to `path`. Returns the queue count.
pub async fn save<P: AsRef<Path>>(store: &QueueStore, path: P) -> Result<usize, SnapshotError> {
    let snaps = store.export();
    let encoded = encode(&snaps);

    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut file = File::create(path).await?;
    file.write_all(&encoded).await?;
    file.sync_all().await?;
    info!(path = %path.display(), queues = snaps.len(), "snapshot saved");
    Ok(snaps.len())
}

/// Loads a snapshot file into the store, replacing queues of the same name.
/// Returns the number of queues restored.
pub async fn load<P: AsRef<Path>>(store: &QueueStore, path: P) -> Result<usize, SnapshotError> {
    let path = path.as_ref();
    let raw = fs::read(path).await?;
    let snaps = decode(&raw)?;
    let count = snaps.len();
    store.import(snaps);
    info!(path = %path.display(), queues = count, "snapshot loaded");
    Ok(count)
}

pub(crate) fn encode(snaps: &[QueueSnapshot]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(HEADER_MAGIC);
    buf.put_u32(HEADER_VERSION);
    buf.put_u32(snaps.len() as u32);

    for snap in snaps {
        buf.put_u16(snap.name.len() as u16);
        buf.put_slice(snap.name.as_bytes());
        buf.put_u64(snap.last_id.ms);
        buf.put_u64(snap.last_id.seq);
        buf.put_u64(snap.undelivered.len() as u64);
        buf.put_u64(snap.delivered.len() as u64);

        for (id, payload) in &snap.undelivered {
            buf.put_u64(id.ms);
            buf.put_u64(id.seq);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        for (id, payload, deliveries, last_delivery) in &snap.delivered {
            buf.put_u64(id.ms);
            buf.put_u64(id.seq);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
            buf.put_u32(*deliveries);
            buf.put_i64(*last_delivery);
        }
    }
    buf.freeze()
}

pub(crate) fn decode(raw: &[u8]) -> Result<Vec<QueueSnapshot>, SnapshotError> {
    let mut slice = raw;
    let magic = take(&mut slice, 8)?;
    if magic != HEADER_MAGIC {
        return Err(SnapshotError::Corruption("bad magic".into()));
    }
    need(&slice, 8)?;
    let version = slice.get_u32();
    if version != HEADER_VERSION {
        return Err(SnapshotError::Corruption(format!(
            "unsupported version {version}"
        )));
    }
    let queue_count = slice.get_u32();

    let mut snaps = Vec::with_capacity(queue_count as usize);
    for _ in 0..queue_count {
        need(&slice, 2)?;
        let name_len = slice.get_u16() as usize;
        let name_raw = take(&mut slice, name_len)?;
        let name = String::from_utf8(name_raw.to_vec())
            .map_err(|_| SnapshotError::Corruption("queue name is not utf-8".into()))?;

        need(&slice, 32)?;
        let last_id = MessageId::new(slice.get_u64(), slice.get_u64());
        let undelivered_len = slice.get_u64();
        let delivered_len = slice.get_u64();

        let mut undelivered = Vec::with_capacity(undelivered_len as usize);
        for _ in 0..undelivered_len {
            need(&slice, 20)?;
            let id = MessageId::new(slice.get_u64(), slice.get_u64());
            let payload_len = slice.get_u32() as usize;
            let payload = Bytes::copy_from_slice(take(&mut slice, payload_len)?);
            undelivered.push((id, payload));
        }

        let mut delivered = Vec::with_capacity(delivered_len as usize);
        for _ in 0..delivered_len {
            need(&slice, 20)?;
            let id = MessageId::new(slice.get_u64(), slice.get_u64());
            let payload_len = slice.get_u32() as usize;
            let payload = Bytes::copy_from_slice(take(&mut slice, payload_len)?);
            need(&slice, 12)?;
            let deliveries = slice.get_u32();
            let last_delivery = slice.get_i64();
            delivered.push((id, payload, deliveries, last_delivery));
        }

        snaps.push(QueueSnapshot {
            name,
            last_id,
            undelivered,
            delivered,
        });
    }
    if !slice.is_empty() {
        return Err(SnapshotError::Corruption(format!(
            "{} trailing bytes",
            slice.len()
        )));
    }
    Ok(snaps)
}

fn need(slice: &&[u8], n: usize) -> Result<(), SnapshotError> {
    if slice.len() < n {
        return Err(SnapshotError::Corruption("truncated snapshot".into()));
    }
    Ok(())
}

fn take<'a>(slice: &mut &'a [u8], n: usize) -> Result<&'a [u8], SnapshotError> {
    need(slice, n)?;
    let (head, rest) = slice.split_at(n);
    *slice = rest;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<QueueSnapshot> {
        vec![
            QueueSnapshot {
                name: "jobs".into(),
                last_id: MessageId::new(1_700, 4),
                undelivered: vec![
                    (MessageId::new(1_700, 3), Bytes::from_static(b"c")),
                    (MessageId::new(1_700, 4), Bytes::from_static(b"d")),
                ],
                delivered: vec![
                    (MessageId::new(1_700, 1), Bytes::from_static(b"a"), 1, 1_800),
                    (MessageId::new(1_700, 2), Bytes::from_static(b"b"), 3, 1_900),
                ],
            },
            QueueSnapshot {
                name: "mail".into(),
                last_id: MessageId::ZERO,
                undelivered: Vec::new(),
                delivered: Vec::new(),
            },
        ]
    }

    #[test]
    fn encode_decode_preserves_order_and_metadata() {
        let snaps = sample();
        let decoded = decode(&encode(&snaps)).unwrap();
        assert_eq!(decoded, snaps);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut raw = encode(&sample()).to_vec();
        raw[0] = b'X';
        assert!(matches!(
            decode(&raw),
            Err(SnapshotError::Corruption(_))
        ));
    }

    #[test]
    fn truncated_file_is_corruption() {
        let raw = encode(&sample());
        let cut = &raw[..raw.len() - 3];
        assert!(matches!(
            decode(cut),
            Err(SnapshotError::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn save_and_load_round_trip_through_a_store() {
        let store = QueueStore::new();
        store
            .push(
                "jobs",
                vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            )
            .unwrap();
        // Move one message to the delivered list so both survive the trip.
        let popped = store
            .pop(
                &["jobs".to_string()],
                1,
                crate::core::store::BlockMode::None,
                uuid::Uuid::new_v4(),
            )
            .unwrap();
        match popped {
            crate::core::store::PopOutcome::Items(items) => assert_eq!(items.len(), 1),
            _ => panic!("expected items"),
        }

        let path = std::env::temp_dir().join(format!("reliq-snap-{}.bin", uuid::Uuid::new_v4()));
        assert_eq!(save(&store, &path).await.unwrap(), 1);

        let restored = QueueStore::new();
        assert_eq!(load(&restored, &path).await.unwrap(), 1);
        let info = restored.info("jobs").unwrap();
        assert_eq!(info.undelivered, 1);
        assert_eq!(info.delivered, 1);
        assert_eq!(info.last_id, store.info("jobs").unwrap().last_id);

        let _ = std::fs::remove_file(&path);
    }
}

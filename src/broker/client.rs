//! Request/reply client for a running broker.
//!
//! Strictly one outstanding request at a time, which is all the CLIs and
//! tests need. Blocking POPs simply keep the call pending until the broker
//! replies or the connection drops.

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::core::command::{
    new_ack, new_info, new_pop, new_push, new_range, new_recover, Command,
};
use crate::core::id::MessageId;
use crate::core::wire::{
    encode_frame, try_decode_frame, EntriesPayload, ErrorPayload, Frame, FrameType, IdsPayload,
    InfoReplyPayload, ItemsPayload, WireEntry, WireItem,
};

pub struct BrokerClient {
    stream: TcpStream,
    inbuf: BytesMut,
    next_corr: u64,
}

impl BrokerClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to broker")?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbuf: BytesMut::with_capacity(16 * 1024),
            next_corr: 1,
        })
    }

    /// Sends one command and waits for its reply frame.
    pub async fn request(&mut self, cmd: &Command) -> anyhow::Result<Frame> {
        let corr = self.next_corr;
        self.next_corr += 1;

        let frame = cmd.to_frame(corr)?;
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out)?;
        self.stream.write_all(&out).await?;

        loop {
            if let Some(reply) = try_decode_frame(&mut self.inbuf)? {
                if reply.correlation_id != corr {
                    bail!(
                        "broker replied to request {} while waiting for {}",
                        reply.correlation_id,
                        corr
                    );
                }
                return Ok(reply);
            }
            let n = self.stream.read_buf(&mut self.inbuf).await?;
            if n == 0 {
                bail!("connection closed by broker");
            }
        }
    }

    pub async fn push(&mut self, queue: &str, payloads: Vec<Bytes>) -> anyhow::Result<Vec<MessageId>> {
        let reply = self.request(&new_push(queue, payloads)).await?;
        let payload = expect(&reply, FrameType::Ids)?;
        Ok(IdsPayload::decode(payload)?.ids)
    }

    pub async fn pop(
        &mut self,
        queues: Vec<String>,
        count: u64,
        block_ms: i64,
    ) -> anyhow::Result<Vec<WireItem>> {
        let reply = self.request(&new_pop(queues, count, block_ms)).await?;
        let payload = expect(&reply, FrameType::Items)?;
        Ok(ItemsPayload::decode(payload)?.items)
    }

    pub async fn ack(&mut self, queue: &str, ids: Vec<MessageId>) -> anyhow::Result<Vec<MessageId>> {
        let reply = self.request(&new_ack(queue, ids)).await?;
        let payload = expect(&reply, FrameType::Ids)?;
        Ok(IdsPayload::decode(payload)?.ids)
    }

    pub async fn recover(
        &mut self,
        queue: &str,
        count: u64,
        min_idle_ms: i64,
    ) -> anyhow::Result<Vec<WireEntry>> {
        let reply = self.request(&new_recover(queue, count, min_idle_ms)).await?;
        let payload = expect(&reply, FrameType::Entries)?;
        Ok(EntriesPayload::decode(payload)?.entries)
    }

    pub async fn range(
        &mut self,
        queue: &str,
        pending: bool,
        start: i64,
        count: u64,
    ) -> anyhow::Result<Vec<WireEntry>> {
        let reply = self.request(&new_range(queue, pending, start, count)).await?;
        let payload = expect(&reply, FrameType::Entries)?;
        Ok(EntriesPayload::decode(payload)?.entries)
    }

    pub async fn info(&mut self, queue: &str) -> anyhow::Result<InfoReplyPayload> {
        let reply = self.request(&new_info(queue)).await?;
        let payload = expect(&reply, FrameType::InfoReply)?;
        Ok(InfoReplyPayload::decode(payload)?)
    }
}

/// Checks the reply type, surfacing broker-side errors as `anyhow` errors.
fn expect(reply: &Frame, wanted: FrameType) -> anyhow::Result<&Bytes> {
    if reply.frame_type == wanted {
        return Ok(&reply.payload);
    }
    if reply.frame_type == FrameType::Error {
        let err = ErrorPayload::decode(&reply.payload)?;
        bail!("broker error {}: {}", err.code, err.message);
    }
    bail!(
        "unexpected reply type {:?} (wanted {:?})",
        reply.frame_type,
        wanted
    );
}

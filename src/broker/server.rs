//! Server engine for the reliq broker.
//!
//! One spawned task per connection. Requests are length-prefixed frames;
//! each gets exactly one reply carrying the same correlation id. A blocking
//! POP suspends only its own connection task: the store hands back a ticket
//! and the task awaits it outside every lock.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::command::Command;
use crate::core::error::QueueError;
use crate::core::id::mstime;
use crate::core::queue::{ListKind, MessageView};
use crate::core::store::{BlockMode, PopOutcome, QueueStore};
use crate::core::wire::{
    encode_frame, try_decode_frame, EntriesPayload, ErrorPayload, Frame, FrameType, IdsPayload,
    InfoReplyPayload, ItemsPayload, WireEntry, WireItem, LENGTH_FIELD_LEN,
};

const INBUF_INIT: usize = 64 * 1024;

/// Starts the broker on the configured address and serves until the
/// process is shut down.
pub async fn serve(store: Arc<QueueStore>, cfg: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.server.bind_addr).await?;
    info!("reliq broker listening on {}", cfg.server.bind_addr);
    serve_on(listener, store, cfg).await
}

/// Accept loop over an already-bound listener, split out so tests can bind
/// an ephemeral port first.
pub async fn serve_on(
    listener: TcpListener,
    store: Arc<QueueStore>,
    cfg: Config,
) -> anyhow::Result<()> {
    let permits = Arc::new(Semaphore::new(cfg.server.max_connections));
    let cfg = Arc::new(cfg);

    loop {
        let permit = Arc::clone(&permits).acquire_owned().await?;
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true)?;

        let store = Arc::clone(&store);
        let cfg = Arc::clone(&cfg);
        let consumer = Uuid::new_v4();
        debug!(%peer_addr, %consumer, "client connected");

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_client(socket, store, cfg, consumer).await {
                warn!(%peer_addr, "error handling client: {e:?}");
            }
            debug!(%peer_addr, %consumer, "client disconnected");
        });
    }
}

/// Resolves when the process receives SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

async fn handle_client(
    stream: TcpStream,
    store: Arc<QueueStore>,
    cfg: Arc<Config>,
    consumer: Uuid,
) -> anyhow::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);
    let mut inbuf = BytesMut::with_capacity(INBUF_INIT);
    let mut outbuf = BytesMut::with_capacity(4 * 1024);

    'io: loop {
        let n = reader.read_buf(&mut inbuf).await?;
        if n == 0 {
            break 'io; // EOF; ticket drops detach any parked waiter
        }

        loop {
            if inbuf.len() >= LENGTH_FIELD_LEN {
                let len =
                    u32::from_be_bytes([inbuf[0], inbuf[1], inbuf[2], inbuf[3]]) as usize;
                if len > cfg.server.max_frame_bytes {
                    warn!(%consumer, len, "frame exceeds max_frame_bytes; dropping connection");
                    break 'io;
                }
            }
            let frame = match try_decode_frame(&mut inbuf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break, // incomplete; read more
                Err(e) => {
                    warn!(%consumer, "undecodable frame: {e}; dropping connection");
                    break 'io;
                }
            };

            let reply = dispatch(&store, &cfg, frame, consumer).await;
            outbuf.clear();
            encode_frame(&reply, &mut outbuf)?;
            writer.write_all(&outbuf).await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

async fn dispatch(store: &QueueStore, cfg: &Config, frame: Frame, consumer: Uuid) -> Frame {
    let corr = frame.correlation_id;
    let cmd = match Command::from_frame(&frame) {
        Ok(cmd) => cmd,
        Err(e) => return error_frame(corr, &e),
    };
    match execute(store, cfg, cmd, consumer).await {
        Ok(reply) => reply.into_frame(corr),
        Err(e) => error_frame(corr, &e),
    }
}

enum Reply {
    Ids(IdsPayload),
    Items(ItemsPayload),
    Entries(EntriesPayload),
    Info(InfoReplyPayload),
}

impl Reply {
    fn into_frame(self, corr: u64) -> Frame {
        let (frame_type, encoded) = match self {
            Reply::Ids(p) => (FrameType::Ids, p.encode()),
            Reply::Items(p) => (FrameType::Items, p.encode()),
            Reply::Entries(p) => (FrameType::Entries, p.encode()),
            Reply::Info(p) => (FrameType::InfoReply, p.encode()),
        };
        match encoded {
            Ok(payload) => Frame {
                frame_type,
                correlation_id: corr,
                payload,
            },
            Err(e) => {
                warn!("failed to encode reply: {e}");
                internal_error_frame(corr)
            }
        }
    }
}

async fn execute(
    store: &QueueStore,
    cfg: &Config,
    cmd: Command,
    consumer: Uuid,
) -> Result<Reply, QueueError> {
    match cmd {
        Command::Push { queue, payloads } => {
            let limit = cfg.queues.max_payload_bytes;
            if let Some(big) = payloads.iter().find(|p| p.len() > limit) {
                return Err(QueueError::PayloadTooLarge {
                    got: big.len(),
                    limit,
                });
            }
            let ids = store.push(&queue, payloads)?;
            Ok(Reply::Ids(IdsPayload { ids }))
        }

        Command::Pop {
            queues,
            count,
            block_ms,
        } => {
            let outcome = store.pop(&queues, count, BlockMode::from_ms(block_ms), consumer)?;
            let items = match outcome {
                PopOutcome::Items(items) => items,
                // Suspends this connection's task until woken or timed out;
                // a timeout is an ordinary empty reply.
                PopOutcome::Pending(ticket) => ticket.wait().await,
            };
            Ok(Reply::Items(ItemsPayload {
                items: items
                    .into_iter()
                    .map(|i| WireItem {
                        queue: i.queue,
                        id: i.id,
                        payload: i.payload,
                    })
                    .collect(),
            }))
        }

        Command::Ack { queue, ids } => Ok(Reply::Ids(IdsPayload {
            ids: store.ack(&queue, &ids)?,
        })),

        Command::Recover {
            queue,
            count,
            min_idle_ms,
        } => {
            let views = store.recover(&queue, count, min_idle_ms)?;
            Ok(Reply::Entries(entries_from(views)))
        }

        Command::Range {
            queue,
            pending,
            start,
            count,
        } => {
            let which = if pending {
                ListKind::Delivered
            } else {
                ListKind::Undelivered
            };
            let views = store.range(&queue, which, start, count)?;
            Ok(Reply::Entries(entries_from(views)))
        }

        Command::Info { queue } => {
            let info = store.info(&queue)?;
            Ok(Reply::Info(InfoReplyPayload {
                last_id: info.last_id,
                undelivered: info.undelivered,
                delivered: info.delivered,
                waiters: info.waiters,
                memory_used: info.memory_used,
            }))
        }
    }
}

fn entries_from(views: Vec<MessageView>) -> EntriesPayload {
    let now = mstime() as i64;
    EntriesPayload {
        entries: views
            .into_iter()
            .map(|m| WireEntry {
                id: m.id,
                payload: m.payload,
                deliveries: m.deliveries,
                last_delivery: m.last_delivery,
                age_ms: if m.last_delivery == 0 {
                    0
                } else {
                    now - m.last_delivery
                },
            })
            .collect(),
    }
}

fn error_frame(corr: u64, err: &QueueError) -> Frame {
    let mut payload = ErrorPayload::from_error(err);
    payload.message.truncate(512);
    match payload.encode() {
        Ok(encoded) => Frame {
            frame_type: FrameType::Error,
            correlation_id: corr,
            payload: encoded,
        },
        Err(_) => internal_error_frame(corr),
    }
}

fn internal_error_frame(corr: u64) -> Frame {
    let payload = ErrorPayload {
        code: crate::core::wire::ERR_INTERNAL,
        message: "internal error".into(),
    };
    Frame {
        frame_type: FrameType::Error,
        correlation_id: corr,
        // A static message always encodes.
        payload: payload.encode().unwrap_or_default(),
    }
}

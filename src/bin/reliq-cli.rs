//! CLI client for the reliq broker.
//!
//! One-shot push, pop, ack, recover, range and info commands against a
//! running broker, with defaults taken from reliq.toml.

use std::net::SocketAddr;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::error;

use reliq::broker::client::BrokerClient;
use reliq::config::CONFIG;
use reliq::core::id::MessageId;
use reliq::logging::init_logging;

/// Command-line interface for reliq.
#[derive(Debug, Parser)]
#[command(
    name = "reliq-cli",
    version,
    about = "reliq CLI: push/pop/ack/recover/range/info"
)]
pub struct Cli {
    /// Address of the reliq broker (e.g. 127.0.0.1:7379)
    #[arg(short, long, default_value = "127.0.0.1:7379")]
    pub addr: SocketAddr,

    #[command(subcommand)]
    pub command: Command,
}

/// Supported CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Push one or more payloads onto a queue
    Push {
        /// Queue name
        queue: String,
        /// Payloads, one message each (enclose in quotes for spaces)
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Pop messages from the first non-empty of the given queues
    Pop {
        /// Queue names, tried in order
        #[arg(required = true)]
        queues: Vec<String>,
        /// Maximum messages to pop (defaults to queues.default_pop_count)
        #[arg(short, long)]
        count: Option<u64>,
        /// 0 = return immediately, N > 0 = block up to N ms, -1 = block forever
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        block: i64,
    },

    /// Acknowledge delivered messages
    Ack {
        /// Queue name
        queue: String,
        /// Message ids in <ms>-<seq> form
        #[arg(required = true)]
        ids: Vec<MessageId>,
    },

    /// Re-deliver messages that have been pending too long
    Recover {
        /// Queue name
        queue: String,
        /// Maximum messages to recover
        #[arg(short, long, default_value_t = 10)]
        count: u64,
        /// Minimum delivery age in ms (defaults to queues.default_recover_min_idle_ms)
        #[arg(short, long)]
        min_idle: Option<i64>,
    },

    /// List messages without consuming them
    Range {
        /// Queue name
        queue: String,
        /// Inspect the delivered (pending-ack) list instead of undelivered
        #[arg(long)]
        pending: bool,
        /// Start offset; negative counts from the tail
        #[arg(default_value_t = 0, allow_hyphen_values = true)]
        start: i64,
        /// Maximum entries to return
        #[arg(default_value_t = 25)]
        count: u64,
    },

    /// Show queue counters
    Info {
        /// Queue name
        queue: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut client = BrokerClient::connect(cli.addr).await?;

    match cli.command {
        Command::Push { queue, messages } => {
            let limit = CONFIG.queues.max_payload_bytes;
            if let Some(big) = messages.iter().find(|m| m.len() > limit) {
                error!(
                    "payload of {} bytes exceeds the configured maximum of {}, aborting",
                    big.len(),
                    limit
                );
                return Err(anyhow::anyhow!("payload too large"));
            }
            let payloads = messages.into_iter().map(Bytes::from).collect();
            for id in client.push(&queue, payloads).await? {
                println!("{id}");
            }
        }

        Command::Pop {
            queues,
            count,
            block,
        } => {
            let count = count.unwrap_or(CONFIG.queues.default_pop_count);
            for item in client.pop(queues, count, block).await? {
                println!(
                    "{} {} {}",
                    item.id,
                    item.queue,
                    String::from_utf8_lossy(&item.payload)
                );
            }
        }

        Command::Ack { queue, ids } => {
            for id in client.ack(&queue, ids).await? {
                println!("{id}");
            }
        }

        Command::Recover {
            queue,
            count,
            min_idle,
        } => {
            let min_idle = min_idle.unwrap_or(CONFIG.queues.default_recover_min_idle_ms);
            for entry in client.recover(&queue, count, min_idle).await? {
                println!(
                    "{} {} deliveries={}",
                    entry.id,
                    String::from_utf8_lossy(&entry.payload),
                    entry.deliveries
                );
            }
        }

        Command::Range {
            queue,
            pending,
            start,
            count,
        } => {
            for entry in client.range(&queue, pending, start, count).await? {
                if pending {
                    println!(
                        "{} {} deliveries={} age_ms={}",
                        entry.id,
                        String::from_utf8_lossy(&entry.payload),
                        entry.deliveries,
                        entry.age_ms
                    );
                } else {
                    println!("{} {}", entry.id, String::from_utf8_lossy(&entry.payload));
                }
            }
        }

        Command::Info { queue } => {
            let info = client.info(&queue).await?;
            println!("last_id      {}", info.last_id);
            println!("undelivered  {}", info.undelivered);
            println!("delivered    {}", info.delivered);
            println!("waiters      {}", info.waiters);
            println!("memory_used  {}", info.memory_used);
        }
    }

    Ok(())
}

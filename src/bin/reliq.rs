//! reliq – one binary that can start the broker *or* act as an
//! interactive client shell.
//
//  $ reliq start --config reliq.toml
//  $ reliq connect 127.0.0.1:7379
//  > push jobs hello
//  > pop jobs
//  > 1706000000123-1 jobs hello

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tracing::info;

use reliq::broker::client::BrokerClient;
use reliq::broker::server::{serve, shutdown_signal};
use reliq::core::id::MessageId;
use reliq::core::snapshot::{self, SnapshotError};
use reliq::logging::init_logging;
use reliq::{load_config, Config, QueueStore};

#[derive(Debug, Parser)]
#[command(name = "reliq", version, about = "reliq broker & interactive shell")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env RELIQ_CONFIG overrides)
        #[arg(short, long, default_value = "reliq.toml")]
        config: String,
    },
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg_path: String = std::env::var("RELIQ_CONFIG").unwrap_or(config);
            let cfg: Config = load_config(&cfg_path)?;
            start(cfg).await?;
        }
        Command::Connect { addr } => repl(addr).await?,
    }
    Ok(())
}

async fn start(cfg: Config) -> anyhow::Result<()> {
    let store = Arc::new(QueueStore::new());

    if cfg.snapshot.load_on_start {
        if let Some(path) = cfg.snapshot.path.clone() {
            match snapshot::load(&store, &path).await {
                Ok(_) => {}
                Err(SnapshotError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!("no snapshot at {path}; starting empty");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let result = tokio::select! {
        res = serve(Arc::clone(&store), cfg.clone()) => res,
        _ = shutdown_signal() => Ok(()),
    };

    if cfg.snapshot.save_on_shutdown {
        if let Some(path) = cfg.snapshot.path.as_deref() {
            snapshot::save(&store, path).await?;
        }
    }
    result
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
async fn repl(addr: SocketAddr) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;
    let mut client = BrokerClient::connect(addr).await?;

    println!("Connected to {addr}. Type `help` for commands.");

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        let words: Vec<&str> = line.split_whitespace().collect();
        let outcome = match words.as_slice() {
            ["help"] => {
                println!("push <queue> <payload...>");
                println!("pop <queue[,queue...]> [count] [block_ms]   (block_ms -1 = forever)");
                println!("ack <queue> <id...>");
                println!("recover <queue> [count] [min_idle_ms]");
                println!("range <queue> [new|pending] [start] [count]");
                println!("info <queue> | exit");
                Ok(())
            }
            ["exit" | "quit"] => break,

            ["push", queue, rest @ ..] if !rest.is_empty() => {
                let payloads = rest
                    .iter()
                    .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                    .collect();
                run_push(&mut client, queue, payloads).await
            }

            ["pop", queues, rest @ ..] if rest.len() <= 2 => {
                let queues: Vec<String> = queues.split(',').map(str::to_string).collect();
                let count = rest.first().map_or(Ok(1), |s| s.parse::<u64>());
                let block = rest.get(1).map_or(Ok(0), |s| s.parse::<i64>());
                match (count, block) {
                    (Ok(count), Ok(block)) => run_pop(&mut client, queues, count, block).await,
                    _ => {
                        println!("usage: pop <queue[,queue...]> [count] [block_ms]");
                        Ok(())
                    }
                }
            }

            ["ack", queue, rest @ ..] if !rest.is_empty() => {
                match rest.iter().map(|s| s.parse::<MessageId>()).collect::<Result<Vec<_>, _>>() {
                    Ok(ids) => run_ack(&mut client, queue, ids).await,
                    Err(e) => {
                        println!("{e}");
                        Ok(())
                    }
                }
            }

            ["recover", queue, rest @ ..] if rest.len() <= 2 => {
                let count = rest.first().map_or(Ok(10), |s| s.parse::<u64>());
                let min_idle = rest.get(1).map_or(Ok(0), |s| s.parse::<i64>());
                match (count, min_idle) {
                    (Ok(count), Ok(min_idle)) => {
                        run_recover(&mut client, queue, count, min_idle).await
                    }
                    _ => {
                        println!("usage: recover <queue> [count] [min_idle_ms]");
                        Ok(())
                    }
                }
            }

            ["range", queue, rest @ ..] if rest.len() <= 3 => {
                let pending = matches!(rest.first(), Some(&"pending"));
                let start = rest.get(1).map_or(Ok(0), |s| s.parse::<i64>());
                let count = rest.get(2).map_or(Ok(25), |s| s.parse::<u64>());
                match (start, count) {
                    (Ok(start), Ok(count)) => {
                        run_range(&mut client, queue, pending, start, count).await
                    }
                    _ => {
                        println!("usage: range <queue> [new|pending] [start] [count]");
                        Ok(())
                    }
                }
            }

            ["info", queue] => run_info(&mut client, queue).await,

            _ => {
                println!("Unknown cmd. Type `help`.");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            println!("error: {e}");
        }
    }
    Ok(())
}

async fn run_push(client: &mut BrokerClient, queue: &str, payloads: Vec<Bytes>) -> anyhow::Result<()> {
    for id in client.push(queue, payloads).await? {
        println!("{id}");
    }
    Ok(())
}

async fn run_pop(
    client: &mut BrokerClient,
    queues: Vec<String>,
    count: u64,
    block: i64,
) -> anyhow::Result<()> {
    let items = client.pop(queues, count, block).await?;
    if items.is_empty() {
        println!("(no items)");
    }
    for item in items {
        println!("{} {} {}", item.id, item.queue, String::from_utf8_lossy(&item.payload));
    }
    Ok(())
}

async fn run_ack(client: &mut BrokerClient, queue: &str, ids: Vec<MessageId>) -> anyhow::Result<()> {
    let removed = client.ack(queue, ids).await?;
    println!("acknowledged {}", removed.len());
    Ok(())
}

async fn run_recover(
    client: &mut BrokerClient,
    queue: &str,
    count: u64,
    min_idle: i64,
) -> anyhow::Result<()> {
    let entries = client.recover(queue, count, min_idle).await?;
    if entries.is_empty() {
        println!("(nothing stale)");
    }
    for e in entries {
        println!(
            "{} {} deliveries={}",
            e.id,
            String::from_utf8_lossy(&e.payload),
            e.deliveries
        );
    }
    Ok(())
}

async fn run_range(
    client: &mut BrokerClient,
    queue: &str,
    pending: bool,
    start: i64,
    count: u64,
) -> anyhow::Result<()> {
    let entries = client.range(queue, pending, start, count).await?;
    if entries.is_empty() {
        println!("(empty)");
    }
    for e in entries {
        if pending {
            println!(
                "{} {} deliveries={} age_ms={}",
                e.id,
                String::from_utf8_lossy(&e.payload),
                e.deliveries,
                e.age_ms
            );
        } else {
            println!("{} {}", e.id, String::from_utf8_lossy(&e.payload));
        }
    }
    Ok(())
}

async fn run_info(client: &mut BrokerClient, queue: &str) -> anyhow::Result<()> {
    let info = client.info(queue).await?;
    println!("last_id      {}", info.last_id);
    println!("undelivered  {}", info.undelivered);
    println!("delivered    {}", info.delivered);
    println!("waiters      {}", info.waiters);
    println!("memory_used  {}", info.memory_used);
    Ok(())
}

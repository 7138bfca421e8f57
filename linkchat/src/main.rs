//! `LinkChat`: line-oriented messaging client.
//!
//! Reads commands from stdin and prints client events as they arrive.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/linkchat/config.toml`).
//!
//! ```bash
//! cargo run --bin linkchat -- --bus-url ws://127.0.0.1:8000/ws \
//!     --asset-addr 127.0.0.1:9001 --identity alice
//! ```

use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use linkchat::client::{ChatClient, ClientEvent};
use linkchat::config::{CliArgs, ClientConfig};
use linkchat::conversation::Origin;
use linkchat::runtime::{self, ClientHandle};
use linkchat_proto::transfer::TransferMode;

const HELP: &str = "\
commands:
  /connect <name>             register with the bus
  /peers                      list visible peers
  /open <peer>                open a conversation
  /select <peer>              switch the active conversation
  /send <text>                send to the active peer (or type text directly)
  /image <path> [fiable|semi] send an image to the active peer
  /history [peer]             show a conversation
  /transfers                  list asset transfers
  /disconnect                 end the session
  /quit                       exit";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(bus = %config.bus_url, assets = %config.asset_addr, "linkchat starting");

    let (client, events) = ChatClient::new(
        config.connection_manager(),
        config.link_connector(),
        config.client_settings(),
    );
    let (handle, task) = runtime::spawn_client(client, config.channel_capacity);

    let mut repl = Repl {
        handle,
        active: None,
    };
    if let Some(identity) = &config.identity {
        repl.run(Command::Connect(identity.clone())).await;
    }
    println!("{HELP}");

    let result = repl.event_loop(events).await;

    let _ = repl.handle.shutdown().await;
    let _ = task.await;
    tracing::info!("linkchat exiting");
    result
}

/// Initialize file-based logging.
///
/// Stdout belongs to the command loop, so logs go to a file. Returns a
/// [`WorkerGuard`] that must be held until shutdown so buffered entries are
/// flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("linkchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Connect(String),
    Peers,
    Open(String),
    Select(String),
    Send(String),
    Image {
        path: PathBuf,
        mode: Option<TransferMode>,
    },
    History(Option<String>),
    Transfers,
    Disconnect,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };
    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(n, a)| (n, a.trim()));
    let required = |what: &str| {
        if arg.is_empty() {
            Err(format!("usage: /{name} <{what}>"))
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name {
        "connect" => Command::Connect(required("name")?),
        "peers" => Command::Peers,
        "open" => Command::Open(required("peer")?),
        "select" => Command::Select(required("peer")?),
        "send" => Command::Send(required("text")?),
        "image" => {
            let mut parts = arg.split_whitespace();
            let path = parts
                .next()
                .ok_or_else(|| "usage: /image <path> [fiable|semi]".to_string())?;
            let mode = parts
                .next()
                .map(str::parse::<TransferMode>)
                .transpose()
                .map_err(|e| e.to_string())?;
            Command::Image {
                path: PathBuf::from(path),
                mode,
            }
        }
        "history" => Command::History((!arg.is_empty()).then(|| arg.to_string())),
        "transfers" => Command::Transfers,
        "disconnect" => Command::Disconnect,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other} (try /help)")),
    };
    Ok(Some(command))
}

struct Repl {
    handle: ClientHandle,
    active: Option<String>,
}

impl Repl {
    async fn event_loop(&mut self, mut events: mpsc::Receiver<ClientEvent>) -> io::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_command(&line) {
                        Ok(Some(Command::Quit)) => break,
                        Ok(Some(command)) => self.run(command).await,
                        Ok(None) => {}
                        Err(usage) => println!("{usage}"),
                    }
                }
                Some(event) = events.recv() => print_event(&event),
            }
        }
        Ok(())
    }

    fn active_peer(&self) -> Option<String> {
        let peer = self.active.clone();
        if peer.is_none() {
            println!("no active peer: use /select <peer>");
        }
        peer
    }

    async fn run(&mut self, command: Command) {
        let handle = &self.handle;
        let outcome = match command {
            Command::Connect(identity) => handle.connect(&identity).await,
            Command::Peers => match handle.peers().await {
                Ok(peers) => {
                    for peer in peers {
                        println!(
                            "  {} {}",
                            peer.identity,
                            peer.address.as_deref().unwrap_or("-")
                        );
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Command::Open(peer) => handle.open(&peer).await,
            Command::Select(peer) => {
                let result = handle.select(&peer).await;
                if result.is_ok() {
                    self.active = Some(peer);
                }
                result
            }
            Command::Send(text) => {
                let Some(peer) = self.active_peer() else { return };
                self.handle.send_text(&peer, &text).await
            }
            Command::Image { path, mode } => {
                let Some(peer) = self.active_peer() else { return };
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(e) => {
                        println!("cannot read {}: {e}", path.display());
                        return;
                    }
                };
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("image")
                    .to_string();
                self.handle
                    .send_asset(&peer, &file_name, data, mode)
                    .await
                    .map(|id| println!("transfer {id} started"))
            }
            Command::History(peer) => {
                let Some(peer) = peer.or_else(|| self.active_peer()) else {
                    return;
                };
                self.handle.history(&peer).await.map(|history| {
                    for message in history {
                        let marker = match message.origin {
                            Origin::Local => ">",
                            Origin::Remote => "<",
                        };
                        println!(
                            "  {} {marker} {}: {}",
                            message.at.format("%H:%M:%S"),
                            message.from,
                            message.content
                        );
                    }
                })
            }
            Command::Transfers => handle.transfers().await.map(|transfers| {
                for t in transfers {
                    println!(
                        "  {} {} -> {} [{}] {:?} {}%",
                        t.id,
                        t.file_name,
                        t.peer,
                        t.mode,
                        t.state,
                        t.progress()
                    );
                }
            }),
            Command::Disconnect => {
                self.active = None;
                handle.disconnect().await
            }
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => Ok(()),
        };
        if let Err(e) = outcome {
            println!("error: {e}");
        }
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected { identity, address } => {
            println!("* connected as {identity} ({address})");
        }
        ClientEvent::Disconnected { reason } => match reason {
            Some(reason) => println!("* disconnected: {reason}"),
            None => println!("* disconnected"),
        },
        ClientEvent::PeersChanged(peers) => {
            let names: Vec<_> = peers.iter().map(|p| p.identity.as_str()).collect();
            println!("* peers: {}", names.join(", "));
        }
        ClientEvent::MessageReceived {
            peer,
            message,
            unread,
        } => {
            if *unread > 0 {
                println!("[{peer}] {} ({unread} unread)", message.content);
            } else {
                println!("[{peer}] {}", message.content);
            }
        }
        ClientEvent::TransferStarted {
            id,
            peer,
            chunks_total,
        } => println!("* transfer {id} to {peer}: {chunks_total} chunks"),
        ClientEvent::TransferProgress { id, progress } => {
            tracing::debug!(transfer_id = %id, progress, "transfer progress");
        }
        ClientEvent::TransferCompleted { id, asset } => {
            println!("* transfer {id} completed: {}", asset.path());
        }
        ClientEvent::TransferFailed { id, error } => {
            println!("* transfer {id} failed: {error}");
        }
        ClientEvent::BusError(reason) => println!("* bus error: {reason}"),
    }
}

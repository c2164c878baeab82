// nearfile: discover nearby devices on the LAN, pair with one, send it files.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use nearfile_core::{DeviceId, Peer};
use nearfile_node::storage::FsFileStore;
use nearfile_node::{config, SessionController, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "nearfile=info,nearfile_node=info,nearfile_core=info";

#[derive(Parser, Debug)]
#[command(name = "nearfile", version, about = "Send files to nearby devices")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the network and take commands on stdin until quit or Ctrl+C.
    Run {
        /// Name shown to other devices.
        #[arg(long)]
        name: Option<String>,
        /// Where received files are saved.
        #[arg(long)]
        download_dir: Option<PathBuf>,
        /// First control port to try.
        #[arg(long)]
        base_port: Option<u16>,
    },
    /// Listen for a few seconds, list the devices found, and exit.
    Scan {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

/// One line typed by the operator.
#[derive(Debug, PartialEq, Eq)]
enum Operator {
    Peers,
    /// Pair with a peer, named by list number or device id.
    Connect(String),
    /// Confirm an incoming request with the code shown on the other device.
    Code(String),
    Reject,
    Cancel,
    Send {
        path: PathBuf,
        peer: Option<String>,
    },
    Disconnect,
    Help,
    Quit,
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let rest: Vec<&str> = words.collect();
        let one = |what: &str| -> Result<String, String> {
            match rest.as_slice() {
                [arg] => Ok(arg.to_string()),
                _ => Err(format!("usage: {verb} <{what}>")),
            }
        };
        match verb {
            "peers" | "ls" => Ok(Operator::Peers),
            "connect" | "pair" => one("number|device-id").map(Operator::Connect),
            "code" => one("4-digit code").map(Operator::Code),
            "reject" => Ok(Operator::Reject),
            "cancel" => Ok(Operator::Cancel),
            "send" => match rest.as_slice() {
                [path] => Ok(Operator::Send {
                    path: PathBuf::from(path),
                    peer: None,
                }),
                [path, peer] => Ok(Operator::Send {
                    path: PathBuf::from(path),
                    peer: Some(peer.to_string()),
                }),
                _ => Err("usage: send <path> [number|device-id]".to_string()),
            },
            "disconnect" => Ok(Operator::Disconnect),
            "help" | "?" => Ok(Operator::Help),
            "quit" | "exit" => Ok(Operator::Quit),
            other => Err(format!("unknown command '{other}'; try help")),
        }
    }
}

const HELP: &str = "\
peers                      list nearby devices
connect <n|id>             pair with a device; shows a code for the other side
code <nnnn>                accept a pairing request with the code from the other device
reject                     decline a pairing request
cancel                     abandon the pending pairing
send <path> [n|id]         send a file (to the connected device by default)
disconnect                 leave the connected device
quit                       exit";

/// Resolve `token` as a 1-based list position or a device id.
fn pick_peer(peers: &[Peer], token: &str) -> Option<DeviceId> {
    if let Ok(n) = token.parse::<usize>() {
        if let Some(p) = n.checked_sub(1).and_then(|i| peers.get(i)) {
            return Some(p.id.clone());
        }
    }
    peers
        .iter()
        .find(|p| p.id.as_str() == token)
        .map(|p| p.id.clone())
}

fn print_peers(peers: &[Peer]) {
    if peers.is_empty() {
        println!("no devices found yet");
    }
    for (i, p) in peers.iter().enumerate() {
        let mark = if p.connected { " (connected)" } else { "" };
        println!("{:>3}. {} [{}] via {:?}{}", i + 1, p.display_name, p.id, p.link, mark);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load();
    let rt = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    match cli.command {
        Command::Run {
            name,
            download_dir,
            base_port,
        } => {
            if let Some(name) = name {
                cfg.device_name = name;
            }
            if let Some(dir) = download_dir {
                cfg.download_dir = dir;
            }
            if let Some(port) = base_port {
                cfg.base_port = port;
            }
            rt.block_on(run(cfg))
        }
        Command::Scan { seconds } => rt.block_on(scan(cfg, Duration::from_secs(seconds))),
    }
}

fn session_for(cfg: config::Config) -> SessionController {
    let store = Arc::new(FsFileStore::new(cfg.download_dir.clone()));
    SessionController::new(cfg, store)
}

async fn scan(cfg: config::Config, wait: Duration) -> anyhow::Result<()> {
    let session = session_for(cfg);
    session
        .start_discovery()
        .await
        .map_err(|e| anyhow!(e.notification()))?;
    tokio::time::sleep(wait).await;
    print_peers(&session.peers().await);
    session.shutdown().await;
    Ok(())
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let download_dir = cfg.download_dir.clone();
    let session = session_for(cfg);
    session
        .start_discovery()
        .await
        .map_err(|e| anyhow!(e.notification()))?;
    println!(
        "{} ({}) ready; files are saved to {}. Type help for commands.",
        session.identity().display_name,
        session.identity().device_id,
        download_dir.display()
    );

    let printer = tokio::spawn(print_events(session.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("cannot read stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Operator>() {
                    Ok(Operator::Quit) => break,
                    Ok(op) => {
                        if let Err(e) = execute(&session, op).await {
                            println!("{e}");
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            signal = shutdown_signal() => {
                signal?;
                break;
            }
        }
    }

    session.disconnect().await.ok();
    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn execute(session: &SessionController, op: Operator) -> anyhow::Result<()> {
    match op {
        Operator::Peers => print_peers(&session.peers().await),
        Operator::Connect(token) => {
            let peers = session.peers().await;
            let Some(id) = pick_peer(&peers, &token) else {
                bail!("no device '{token}'; run peers to list them");
            };
            session
                .connect(&id)
                .await
                .map_err(|e| anyhow!(e.notification()))?;
        }
        Operator::Code(code) => {
            session
                .submit_pair_code(&code)
                .await
                .map_err(|e| anyhow!(e.notification()))?;
        }
        Operator::Reject => session
            .reject_pairing()
            .await
            .map_err(|e| anyhow!(e.notification()))?,
        Operator::Cancel => session
            .cancel_connect()
            .await
            .map_err(|e| anyhow!(e.notification()))?,
        Operator::Send { path, peer } => {
            let peers = session.peers().await;
            let target = match peer {
                Some(token) => pick_peer(&peers, &token),
                None => peers.iter().find(|p| p.connected).map(|p| p.id.clone()),
            };
            let Some(target) = target else {
                bail!("pair with a device before sending");
            };
            // Sending runs in the background so the prompt stays usable.
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.send_file(&path, &target).await {
                    tracing::debug!(error = %e, "send ended with an error");
                }
            });
        }
        Operator::Disconnect => session
            .disconnect()
            .await
            .map_err(|e| anyhow!(e.notification()))?,
        Operator::Help => println!("{HELP}"),
        Operator::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Progress {
                transfer_id,
                bytes,
                total,
                ..
            }) => {
                tracing::debug!(transfer = %transfer_id, bytes, total, "progress");
            }
            Ok(event) => {
                if let Some(line) = event.notification() {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("cannot watch SIGTERM")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

mod console;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use libp2p::identity::Keypair;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use waypoint_p2p::bootstrap::BootstrapConfig;
use waypoint_p2p::identity::encode_keypair_hex;
use waypoint_p2p::{
    init_logging, LogControl, LogFormat, Node, NodeConfig, NodeEvent, NodeHandle, StatusReporter,
};

use crate::console::{ConsoleCommand, HELP};

#[derive(Parser, Debug)]
#[command(name = "waypoint", version, about = "Waypoint libp2p peer and relay server")]
struct Cli {
    /// TOML configuration file. Flags override its values.
    #[arg(long, short, global = true, env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directives, e.g. "info" or "info,waypoint_p2p=debug".
    #[arg(long, global = true, env = "WAYPOINT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format: human or json.
    #[arg(long, global = true, env = "WAYPOINT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a peer that bootstraps, discovers peers and reserves a relay slot.
    Peer(NodeArgs),
    /// Run a circuit relay server.
    Relay(NodeArgs),
    /// Print a new hex keypair on stdout and its peer id on stderr.
    Keygen,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Listen multiaddrs (comma separated).
    #[arg(long, env = "WAYPOINT_LISTEN", value_delimiter = ',')]
    listen: Vec<String>,

    /// Bootstrap multiaddrs with /p2p/ peer ids (comma separated).
    #[arg(long, env = "WAYPOINT_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Start without any bootstrap peers.
    #[arg(long, conflicts_with = "bootstrap")]
    no_bootstrap: bool,

    /// Hex-encoded protobuf keypair.
    #[arg(long, env = "WAYPOINT_KEYPAIR_HEX", hide_env_values = true)]
    keypair_hex: Option<String>,

    /// File holding a protobuf keypair, raw or hex.
    #[arg(long, env = "WAYPOINT_KEYPAIR_FILE")]
    keypair_file: Option<PathBuf>,

    /// Application topics to join (comma separated).
    #[arg(long, value_delimiter = ',')]
    topics: Vec<String>,

    /// Seconds between status reports.
    #[arg(long, env = "WAYPOINT_STATUS_INTERVAL")]
    status_interval: Option<u64>,

    /// Refuse to dial loopback, private and link-local addresses.
    #[arg(long)]
    deny_private: bool,

    /// Do not read commands from stdin.
    #[arg(long)]
    no_console: bool,
}

impl NodeArgs {
    fn apply(self, config: &mut NodeConfig) {
        if !self.listen.is_empty() {
            config.listen = self.listen;
        }
        if self.no_bootstrap {
            config.bootstrap = BootstrapConfig::none();
        } else if !self.bootstrap.is_empty() {
            config.bootstrap.peers = self.bootstrap;
        }
        if self.keypair_hex.is_some() {
            config.identity.keypair_hex = self.keypair_hex;
        }
        if self.keypair_file.is_some() {
            config.identity.keypair_file = self.keypair_file;
        }
        if !self.topics.is_empty() {
            config.topics = self.topics;
        }
        if let Some(secs) = self.status_interval {
            config.status_interval_secs = secs;
        }
        if self.deny_private {
            config.gate.allow_private_addresses = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mode, args) = match cli.command {
        Command::Keygen => return keygen(),
        Command::Peer(args) => (Mode::Peer, args),
        Command::Relay(args) => (Mode::Relay, args),
    };

    let mut config = load_config(cli.config.as_deref(), mode)?;
    let console = !args.no_console;
    args.apply(&mut config);
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }

    let log = init_logging(config.log_format, &config.log_level)?;
    config.validate().context("invalid configuration")?;

    run(config, log, console, mode).await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Peer,
    Relay,
}

impl Mode {
    fn preset(self) -> NodeConfig {
        match self {
            Mode::Peer => NodeConfig::peer(),
            Mode::Relay => NodeConfig::relay(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Mode::Peer => "peer",
            Mode::Relay => "relay",
        }
    }
}

/// The subcommand's preset, with the config file (if any) applied on top.
/// `relay` always serves as a relay.
fn load_config(path: Option<&Path>, mode: Mode) -> Result<NodeConfig> {
    let preset = mode.preset();
    let mut config = match path {
        Some(path) => preset
            .merge_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => preset,
    };
    if mode == Mode::Relay && !config.relay.server.enabled {
        warn!("relay.server.enabled = false ignored for the relay command");
        config.relay.server.enabled = true;
    }
    Ok(config)
}

fn keygen() -> Result<()> {
    let keypair = Keypair::generate_ed25519();
    let encoded = encode_keypair_hex(&keypair).context("encoding keypair")?;
    eprintln!("peer id: {}", keypair.public().to_peer_id());
    println!("{}", encoded);
    Ok(())
}

async fn run(config: NodeConfig, log: LogControl, console: bool, mode: Mode) -> Result<()> {
    let status_interval = config.status_interval();
    let discovery_topics = config.discovery.topics.clone();

    let node = match Node::new(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "Failed to start node");
            return Err(e).context("starting node");
        }
    };
    let handle = node.handle();
    let event_task = tokio::spawn(log_events(handle.events(), discovery_topics));
    let node_task = node.spawn();

    info!(
        peer_id = %handle.peer_id(),
        mode = mode.label(),
        "Node started"
    );
    print_addresses(&handle).await;

    let reporter = StatusReporter::spawn(handle.clone(), status_interval);

    let (quit_tx, mut quit_rx) = mpsc::channel(1);
    let console_task = console.then(|| tokio::spawn(run_console(handle.clone(), log, quit_tx)));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Ctrl-C handler failed");
            }
            info!("Interrupted");
        }
        Some(()) = quit_rx.recv(), if console => {}
    }

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Shutdown request failed");
    }
    reporter.abort();
    event_task.abort();
    if let Some(task) = console_task {
        task.abort();
    }
    let _ = node_task.await;
    info!("Stopped");
    Ok(())
}

/// Log our addresses once the listeners are up.
async fn print_addresses(handle: &NodeHandle) {
    for _ in 0..50 {
        match handle.multiaddrs().await {
            Ok(addrs) if !addrs.is_empty() => {
                for addr in addrs {
                    info!("Listening on {}", addr);
                }
                return;
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(_) => return,
        }
    }
    warn!("No listen addresses yet");
}

async fn log_events(mut events: broadcast::Receiver<NodeEvent>, discovery_topics: Vec<String>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = event.describe(&discovery_topics) {
                    info!("{}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read stdin on a plain thread: a blocking read must not hold up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_console(handle: NodeHandle, log: LogControl, quit: mpsc::Sender<()>) {
    let mut lines = spawn_stdin_reader();
    // Ends when stdin closes; the node keeps running until Ctrl-C.
    while let Some(line) = lines.recv().await {
        match ConsoleCommand::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => {
                let _ = quit.send(()).await;
                return;
            }
            Ok(Some(command)) => execute(&handle, &log, command).await,
            Err(message) => println!("{}", message),
        }
    }
}

async fn execute(handle: &NodeHandle, log: &LogControl, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Dial(addr) => {
            // Dials can take a while; the result is logged by the handle.
            let handle = handle.clone();
            tokio::spawn(async move {
                let _ = handle.dial(addr).await;
            });
        }
        ConsoleCommand::Publish { topic, text } => match handle.publish(&topic, text).await {
            Ok(()) => println!("published on {}", topic),
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::Subscribe(topic) => match handle.subscribe(&topic).await {
            Ok(true) => println!("subscribed to {}", topic),
            Ok(false) => println!("already subscribed to {}", topic),
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::Status => match handle.status().await {
            Ok(status) => println!("{}", status.render()),
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::Peers => match handle.peers().await {
            Ok(peers) if peers.is_empty() => println!("no peers connected"),
            Ok(peers) => {
                for peer in peers {
                    println!("{}", peer);
                }
            }
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::Log(directives) => match log.enable(&directives) {
            Ok(()) => println!("log filter set to {}", directives),
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::LogOff => {
            if let Err(e) = log.disable() {
                println!("{}", e);
            }
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}

//! CmdNode - Peer-to-peer JSON command messaging
//!
//! Nodes exchange length-prefixed JSON command envelopes over TCP and
//! dispatch them to a fixed set of handlers.

mod config;
mod dispatch;
mod identity;
mod network;
mod protocol;
mod registry;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{Config, FileSettings, MemorySettings, SettingsStore};
use dispatch::NodeEvent;
use identity::HostDescription;
use network::{BindSession, Client, ConnectionState, Server, ServerEvent};
use protocol::OutgoingMessage;

/// CmdNode - Peer-to-peer JSON command messaging
#[derive(Parser)]
#[command(name = "cmdnode")]
#[command(author = "CmdNode Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange command envelopes between networked nodes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as relay server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run as client (connect to a node)
    Client {
        /// Address to connect to, HOST or HOST:PORT
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show how this host presents itself
    Info,
}

/// A line typed at the client prompt
#[derive(Debug, Clone, PartialEq)]
enum InputCommand {
    Message(String),
    MessageTo { to: String, message: String },
    Identify,
    Status(String),
    Error(String),
    Peers,
    Connect,
    Close,
    Quit,
}

fn parse_input(line: &str) -> Option<InputCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(InputCommand::Message(line.to_string()));
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/to" => {
            let (to, message) = rest.split_once(char::is_whitespace)?;
            Some(InputCommand::MessageTo {
                to: to.to_string(),
                message: message.trim().to_string(),
            })
        }
        "/identify" => Some(InputCommand::Identify),
        "/status" => Some(InputCommand::Status(rest.to_string())),
        "/error" => Some(InputCommand::Error(rest.to_string())),
        "/peers" => Some(InputCommand::Peers),
        "/connect" => Some(InputCommand::Connect),
        "/close" => Some(InputCommand::Close),
        "/quit" => Some(InputCommand::Quit),
        _ => None,
    }
}

/// Split `HOST[:PORT]`, falling back to `default_port`
fn split_host_port(addr: &str, default_port: u16) -> anyhow::Result<(String, u16)> {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok((socket.ip().to_string(), socket.port()));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), port.parse()?)),
        _ => Ok((addr.to_string(), default_port)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Server { port } => {
            run_server(config, port).await?;
        }
        Commands::Client { server } => {
            run_client(config, server).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info(&config).await;
        }
    }

    Ok(())
}

/// Run the relay server
async fn run_server(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let identity = config.identity();
    let mut net_config = config.net_config();
    if let Some(port) = port {
        net_config.port = port;
    }

    tracing::info!("Starting CmdNode server '{}' on port {}", identity.name, net_config.port);

    let mut server = Server::new(net_config, identity.clone());
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let bind_addr = server.start().await?;

    println!("\n========================================");
    println!("  CmdNode Server Running");
    println!("========================================");
    println!("  Node: {}", identity.name);
    println!("  Listening: {}", bind_addr);
    println!("========================================");
    println!("\nWaiting for nodes to connect...");
    println!("Press Ctrl+C to stop.\n");

    // Node name -> connection that last identified with it
    let mut names: HashMap<String, SocketAddr> = HashMap::new();

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::PeerConnected { addr } => {
                        println!("+ Connected: {}", addr);
                    }
                    ServerEvent::PeerDisconnected { addr } => {
                        println!("- Disconnected: {}", addr);
                        names.retain(|_, a| *a != addr);
                        server.broadcast(OutgoingMessage::PeersList(sorted_names(&names))).await;
                    }
                    ServerEvent::Node { addr, event } => {
                        handle_node_event(&server, &mut names, addr, event).await;
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { .. } => {}
                    ServerEvent::Stopped => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    if server.is_running().await {
        server.stop().await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

fn sorted_names(names: &HashMap<String, SocketAddr>) -> Vec<String> {
    let mut list: Vec<String> = names.keys().cloned().collect();
    list.sort();
    list
}

async fn handle_node_event(
    server: &Server,
    names: &mut HashMap<String, SocketAddr>,
    addr: SocketAddr,
    event: NodeEvent,
) {
    match event {
        NodeEvent::Identified(envelope) => {
            let Some(name) = envelope.name_client.clone() else {
                return;
            };
            println!("* {} identified as {}", addr, name);
            names.insert(name, addr);
            server.broadcast(OutgoingMessage::PeersList(sorted_names(names))).await;
        }
        NodeEvent::Relay { from, to, message } => {
            let reply = match names.get(&to) {
                Some(target) => server
                    .send_to(target, OutgoingMessage::MessageTo { from, to: to.clone(), message })
                    .await
                    .err()
                    .map(|e| format!("Could not deliver to {}: {}", to, e)),
                None => Some(format!("Unknown recipient: {}", to)),
            };
            if let Some(text) = reply {
                tracing::warn!("{}", text);
                if let Err(e) = server.send_to(&addr, OutgoingMessage::Error(text)).await {
                    tracing::debug!("Could not report relay failure to {}: {}", addr, e);
                }
            }
        }
        NodeEvent::Message(line) | NodeEvent::Status(line) => println!("{}", line),
        NodeEvent::Error(line) => eprintln!("{}", line),
        other => tracing::debug!("{}: {:?}", addr, other),
    }
}

/// Run the interactive client
async fn run_client(config: Config, server_addr: Option<String>) -> anyhow::Result<()> {
    let identity = config.identity();
    let mut net_config = config.net_config();
    if let Some(addr) = server_addr {
        let (host, port) = split_host_port(&addr, net_config.port)?;
        net_config.host = host;
        net_config.port = port;
    }

    let settings: Arc<dyn SettingsStore> = match FileSettings::open(&config.settings_path()) {
        Ok(settings) => {
            tracing::debug!("Settings stored in {}", settings.path().display());
            Arc::new(settings)
        }
        Err(e) => {
            tracing::warn!("Settings unavailable, keeping them in memory: {}", e);
            Arc::new(MemorySettings::new())
        }
    };
    let negotiator = Arc::new(BindSession::new(net_config.bind_address.clone()));

    let target = format!("{}:{}", net_config.host, net_config.port);
    let mut client = Client::with_collaborators(net_config, identity.clone(), settings, negotiator);
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    println!("Connecting to {} as '{}'...", target, identity.name);
    println!("Type a message, or /to NAME text, /identify, /status, /error, /peers, /connect, /close, /quit\n");
    client.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => print_client_event(event),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let Some(command) = parse_input(&line) else {
                    if !line.trim().is_empty() {
                        println!("Unknown command: {}", line.trim());
                    }
                    continue;
                };
                if command == InputCommand::Quit {
                    break;
                }
                if let Err(e) = run_command(&client, command).await {
                    println!("! {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.shutdown().await?;
    tracing::info!("Client stopped");

    Ok(())
}

async fn run_command(client: &Client, command: InputCommand) -> anyhow::Result<()> {
    let name = client.identity().name.clone();
    match command {
        InputCommand::Message(text) => client.send_message(text).await?,
        InputCommand::MessageTo { to, message } => client.send_message_to(name, to, message).await?,
        InputCommand::Identify => client.identify().await?,
        InputCommand::Status(text) => client.send_status(text).await?,
        InputCommand::Error(text) => client.send_error(text).await?,
        InputCommand::Peers => {
            let peers = client.peers().await?;
            if peers.is_empty() {
                println!("No known peers");
            }
            for peer in peers {
                println!("  {} ({}) {}:{}", peer.name, peer.id, peer.ip, peer.port);
            }
        }
        InputCommand::Connect => client.connect().await?,
        InputCommand::Close => client.close().await?,
        InputCommand::Quit => {}
    }
    Ok(())
}

fn print_client_event(event: NodeEvent) {
    match event {
        NodeEvent::Status(line) | NodeEvent::Message(line) => println!("{}", line),
        NodeEvent::Error(line) => eprintln!("{}", line),
        NodeEvent::Identified(envelope) => {
            println!(
                "* {} identified ({})",
                envelope.name_client.as_deref().unwrap_or("?"),
                envelope.description_client.as_deref().unwrap_or("")
            );
        }
        NodeEvent::PeerList(peers) => println!("* Peers: {}", peers.join(", ")),
        NodeEvent::Relay { from, to, message } => println!("[{} -> {}] {}", from, to, message),
        NodeEvent::StateChanged(ConnectionState::Open) => println!("* Connected"),
        NodeEvent::StateChanged(ConnectionState::Idle) => println!("* Disconnected"),
        other => tracing::debug!("{:?}", other),
    }
}

/// Print how this host presents itself
async fn print_system_info(config: &Config) {
    let description = HostDescription::describe().await;

    println!("CmdNode System Information");
    println!("==========================\n");

    let identity = config.identity();
    println!("Node: {} ({})", identity.name, identity.kind);
    if !identity.group.is_empty() {
        println!("Group: {}", identity.group);
    }

    println!();
    for line in description.status_lines(&config.network.host, config.network.port) {
        println!("{}", line);
    }

    println!("\nSettings: {}", config.settings_path().display());
    println!("Default Port: {}", protocol::DEFAULT_PORT);
}

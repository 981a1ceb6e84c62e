//! bitchat demo node.
//!
//! Joins a mesh over TCP links and bridges stdin commands to the mesh
//! service. This is a development harness, not the chat UI; messages
//! and events are reported through tracing.
//!
//! # Usage
//!
//! ```bash
//! # First node listens
//! bitchat-node --nickname alice --listen 127.0.0.1:7771
//!
//! # Others dial in
//! bitchat-node --nickname bob --connect 127.0.0.1:7771
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use bitchat_core::chat::{ChatMessage, Command};
use bitchat_core::mesh::MeshCommand;
use bitchat_proto::PeerId;
use bitchat_proto::payloads::receipt::DeliveryAck;
use bitchat_runtime::link::DEFAULT_OP_TIMEOUT;
use bitchat_runtime::{MeshDelegate, Node, NodeConfig, RedbSecureStore, TcpLink};

/// bitchat mesh node over TCP links
#[derive(Parser, Debug)]
#[command(name = "bitchat-node")]
#[command(about = "Serverless mesh chat node (TCP reference links)")]
#[command(version)]
struct Args {
    /// Display name to announce
    #[arg(short, long, default_value = "anon")]
    nickname: String,

    /// Address to accept peer links on
    #[arg(short, long)]
    listen: Option<String>,

    /// Peer addresses to dial
    #[arg(short, long)]
    connect: Vec<String>,

    /// Directory for the secure store database
    #[arg(long, default_value = ".bitchat")]
    data_dir: PathBuf,

    /// Link MTU to negotiate
    #[arg(long, default_value = "4096")]
    mtu: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Delegate that reports every mesh event through tracing.
struct LogDelegate;

impl MeshDelegate for LogDelegate {
    fn on_message(&self, message: ChatMessage) {
        let scope = message.channel.clone().unwrap_or_else(|| {
            if message.is_private { "[private]".to_string() } else { "[public]".to_string() }
        });
        tracing::info!(
            from = %message.sender_nickname,
            %scope,
            encrypted = message.is_encrypted,
            "{}",
            message.content
        );
    }

    fn on_peer_connected(&self, peer: PeerId) {
        tracing::info!(%peer, "peer connected");
    }

    fn on_peer_disconnected(&self, peer: PeerId) {
        tracing::info!(%peer, "peer disconnected");
    }

    fn on_delivery_ack(&self, ack: DeliveryAck) {
        tracing::info!(message = %ack.message_id, by = %ack.recipient_nickname, "delivered");
    }

    fn on_handshake_failed(&self, peer: PeerId, reason: String) {
        tracing::warn!(%peer, %reason, "handshake failed");
    }

    fn on_system_message(&self, note: String) {
        tracing::info!("{note}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    std::fs::create_dir_all(&args.data_dir)?;
    let store = RedbSecureStore::open(args.data_dir.join("bitchat.redb"))?;

    let node = Arc::new(Node::spawn(store, NodeConfig::default(), Arc::new(LogDelegate))?);
    node.command(MeshCommand::SetNickname(args.nickname.clone())).await;

    tracing::info!(
        nickname = %args.nickname,
        peer_id = %node.peer_id().await,
        fingerprint = %node.fingerprint().await,
        "node up"
    );

    if let Some(listen) = &args.listen {
        let listener = TcpListener::bind(listen).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening for peers");
        let accept_node = Arc::clone(&node);
        let mtu = args.mtu;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::info!(%addr, "peer link accepted");
                        let link = Arc::new(TcpLink::new(stream, mtu, DEFAULT_OP_TIMEOUT));
                        accept_node.attach_link(link).await;
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        break;
                    },
                }
            }
        });
    }

    for addr in &args.connect {
        match TcpLink::connect(addr, args.mtu).await {
            Ok(link) => {
                tracing::info!(%addr, "peer link connected");
                node.attach_link(Arc::new(link)).await;
            },
            Err(e) => tracing::warn!(%addr, error = %e, "dial failed"),
        }
    }

    run_repl(&node).await;
    node.shutdown().await;
    Ok(())
}

/// Bridge stdin lines to mesh commands until EOF or ctrl-c.
async fn run_repl<S: bitchat_core::SecureStore>(node: &Node<S>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if let Some(command) = parse_line(&line) {
                    node.command(command).await;
                } else {
                    tracing::info!("unknown command: {line}");
                }
            },
        }
    }
}

/// Map an input line to a mesh command: slash commands or public chat.
fn parse_line(line: &str) -> Option<MeshCommand> {
    if !line.starts_with('/') {
        return Some(MeshCommand::SendPublic { content: line.to_string(), channel: None });
    }
    match Command::parse(line).ok()? {
        Command::Msg { target, content } => {
            let to = PeerId::from_hex(&target).ok()?;
            Some(MeshCommand::SendPrivate {
                content,
                to,
                recipient_nickname: target,
                message_id: Uuid::new_v4(),
            })
        },
        Command::Join { channel, password } => {
            Some(MeshCommand::JoinChannel { channel, password })
        },
        Command::Leave { channel } => {
            Some(MeshCommand::LeaveChannel { channel: channel.unwrap_or_default() })
        },
        Command::Nick { nickname } => Some(MeshCommand::SetNickname(nickname)),
        Command::Pass { channel, password } => {
            Some(MeshCommand::SetChannelPassword { channel, password })
        },
        Command::Block { target } => {
            Some(MeshCommand::Block { peer: PeerId::from_hex(&target).ok()? })
        },
        Command::Unblock { target } => {
            Some(MeshCommand::Unblock { peer: PeerId::from_hex(&target).ok()? })
        },
        Command::Who | Command::Channels => Some(MeshCommand::SendAnnounce),
    }
}

//! Node runtime: tasks and channels around the Sans-IO mesh driver.
//!
//! The task set mirrors the concurrency model of the protocol: one
//! reader task per link, one inbound-dispatch task that owns the driver,
//! one writer task per link fed by the outbound router, and a periodic
//! maintenance task. All coordination is bounded `mpsc`; the driver
//! itself is locked only inside the dispatch task, so every state
//! machine runs single-threaded while link I/O overlaps freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use bitchat_core::chat::ChatMessage;
use bitchat_core::mesh::{AppEvent, LinkId, MeshAction, MeshCommand, MeshEvent, SendTarget};
use bitchat_core::{MeshConfig, MeshService, Result, SecureStore};
use bitchat_proto::PeerId;
use bitchat_proto::payloads::receipt::{DeliveryAck, ReadReceipt};

use crate::link::Link;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Mesh driver configuration.
    pub mesh: MeshConfig,
    /// Maintenance tick interval.
    pub tick_interval: Duration,
    /// Upper bound of the random delay applied to relayed frames.
    pub relay_jitter_max: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            tick_interval: Duration::from_secs(5),
            relay_jitter_max: Duration::from_millis(50),
        }
    }
}

/// Application callbacks, invoked from the dispatch task.
///
/// Implementations must not block; hand heavy work to your own tasks.
pub trait MeshDelegate: Send + Sync + 'static {
    /// A chat message arrived.
    fn on_message(&self, _message: ChatMessage) {}
    /// A peer became visible.
    fn on_peer_connected(&self, _peer: PeerId) {}
    /// A peer went away.
    fn on_peer_disconnected(&self, _peer: PeerId) {}
    /// The peer list changed.
    fn on_peer_list(&self, _peers: Vec<PeerId>) {}
    /// A peer left a channel.
    fn on_channel_leave(&self, _channel: String, _peer: PeerId) {}
    /// A delivery ack arrived for a message we sent.
    fn on_delivery_ack(&self, _ack: DeliveryAck) {}
    /// A read receipt arrived for a message we sent.
    fn on_read_receipt(&self, _receipt: ReadReceipt) {}
    /// A peer needs a handshake before private traffic can flow.
    fn on_handshake_required(&self, _peer: PeerId) {}
    /// A handshake or session failed.
    fn on_handshake_failed(&self, _peer: PeerId, _reason: String) {}
    /// Inline system note.
    fn on_system_message(&self, _note: String) {}
}

struct LinkHandle {
    frames: mpsc::Sender<(Vec<u8>, bool)>,
    tasks: Vec<JoinHandle<()>>,
}

/// A running mesh node.
pub struct Node<S: SecureStore> {
    service: Arc<Mutex<MeshService<S>>>,
    events: mpsc::Sender<MeshEvent>,
    links: Arc<RwLock<HashMap<LinkId, LinkHandle>>>,
    next_link_id: AtomicU64,
    config: NodeConfig,
    tasks: Vec<JoinHandle<()>>,
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl<S: SecureStore> Node<S> {
    /// Build the driver and spawn the dispatch and maintenance tasks.
    pub fn spawn(
        store: S,
        config: NodeConfig,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Result<Self> {
        let service = Arc::new(Mutex::new(MeshService::new(store, config.mesh.clone())?));
        let (events_tx, events_rx) = mpsc::channel::<MeshEvent>(256);
        let links: Arc<RwLock<HashMap<LinkId, LinkHandle>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&service),
            events_rx,
            Arc::clone(&links),
            delegate,
        ));

        let tick_events = events_tx.clone();
        let tick_interval = config.tick_interval;
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick_events.send(MeshEvent::Tick).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            service,
            events: events_tx,
            links,
            next_link_id: AtomicU64::new(1),
            config,
            tasks: vec![dispatch, maintenance],
        })
    }

    /// Attach a link to a newly discovered peer; spawns its reader and
    /// writer tasks and introduces us on it.
    pub async fn attach_link(&self, link: Arc<dyn Link>) -> LinkId {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, mut frames_rx) = mpsc::channel::<(Vec<u8>, bool)>(64);
        let jitter_max = self.config.relay_jitter_max;

        // Writer: per-link FIFO keeps session traffic strictly ordered;
        // relayed frames get a short random delay to spread storms.
        let writer_link = Arc::clone(&link);
        let writer_events = self.events.clone();
        let writer = tokio::spawn(async move {
            while let Some((bytes, jitter)) = frames_rx.recv().await {
                if jitter && !jitter_max.is_zero() {
                    let delay = rand::thread_rng().gen_range(0..jitter_max.as_millis() as u64);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if let Err(e) = writer_link.send_frame(&bytes).await {
                    tracing::debug!(link = link_id, error = %e, "link write failed");
                    let _ = writer_events.send(MeshEvent::LinkDown { link: link_id }).await;
                    break;
                }
            }
        });

        // Reader: frames in, until the link dies.
        let reader_link = Arc::clone(&link);
        let reader_events = self.events.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader_link.recv_frame().await {
                    Ok(bytes) => {
                        if reader_events
                            .send(MeshEvent::Frame { link: link_id, bytes })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::debug!(link = link_id, error = %e, "link read failed");
                        let _ = reader_events.send(MeshEvent::LinkDown { link: link_id }).await;
                        break;
                    },
                }
            }
        });

        {
            let mut registry = self.links.write().await;
            registry
                .insert(link_id, LinkHandle { frames: frames_tx, tasks: vec![writer, reader] });
        }
        let _ = self.events.send(MeshEvent::LinkUp { link: link_id, mtu: link.mtu() }).await;
        link_id
    }

    /// Submit an application command.
    pub async fn command(&self, command: MeshCommand) {
        let _ = self.events.send(MeshEvent::Command(command)).await;
    }

    /// Our current peer id.
    pub async fn peer_id(&self) -> PeerId {
        self.service.lock().await.peer_id()
    }

    /// Our stable fingerprint.
    pub async fn fingerprint(&self) -> String {
        self.service.lock().await.fingerprint()
    }

    /// True when a session with `peer` is established.
    pub async fn has_session(&self, peer: &PeerId) -> bool {
        self.service.lock().await.has_session(peer)
    }

    /// Stop every task this node spawned.
    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        let mut registry = self.links.write().await;
        for (_, handle) in registry.drain() {
            for task in handle.tasks {
                task.abort();
            }
        }
    }
}

async fn dispatch_loop<S: SecureStore>(
    service: Arc<Mutex<MeshService<S>>>,
    mut events: mpsc::Receiver<MeshEvent>,
    links: Arc<RwLock<HashMap<LinkId, LinkHandle>>>,
    delegate: Arc<dyn MeshDelegate>,
) {
    while let Some(event) = events.recv().await {
        if let MeshEvent::LinkDown { link } = &event {
            let mut registry = links.write().await;
            if let Some(handle) = registry.remove(link) {
                for task in handle.tasks {
                    task.abort();
                }
            }
        }

        let actions = {
            let mut service = service.lock().await;
            service.process(event, now_ms())
        };

        for action in actions {
            match action {
                MeshAction::Send { target, bytes } => {
                    deliver_to_links(&links, target, bytes).await;
                },
                MeshAction::App(event) => notify_delegate(delegate.as_ref(), event),
            }
        }
    }
}

async fn deliver_to_links(
    links: &RwLock<HashMap<LinkId, LinkHandle>>,
    target: SendTarget,
    bytes: Vec<u8>,
) {
    let registry = links.read().await;
    match target {
        SendTarget::Link(link) => {
            if let Some(handle) = registry.get(&link) {
                let _ = handle.frames.send((bytes, false)).await;
            }
        },
        SendTarget::AllLinks => {
            for handle in registry.values() {
                let _ = handle.frames.send((bytes.clone(), false)).await;
            }
        },
        SendTarget::AllExcept(excluded) => {
            for (link, handle) in registry.iter() {
                if *link != excluded {
                    let _ = handle.frames.send((bytes.clone(), true)).await;
                }
            }
        },
    }
}

fn notify_delegate(delegate: &dyn MeshDelegate, event: AppEvent) {
    match event {
        AppEvent::Message(message) => delegate.on_message(message),
        AppEvent::PeerConnected(peer) => delegate.on_peer_connected(peer),
        AppEvent::PeerDisconnected(peer) => delegate.on_peer_disconnected(peer),
        AppEvent::PeerListUpdated(peers) => delegate.on_peer_list(peers),
        AppEvent::ChannelLeave { channel, peer } => delegate.on_channel_leave(channel, peer),
        AppEvent::DeliveryAcked(ack) => delegate.on_delivery_ack(ack),
        AppEvent::ReadReceiptReceived(receipt) => delegate.on_read_receipt(receipt),
        AppEvent::HandshakeRequired(peer) => delegate.on_handshake_required(peer),
        AppEvent::HandshakeFailed { peer, reason } => delegate.on_handshake_failed(peer, reason),
        AppEvent::System(note) => delegate.on_system_message(note),
    }
}

impl<S: SecureStore> std::fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("tasks", &self.tasks.len()).finish()
    }
}

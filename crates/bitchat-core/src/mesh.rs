//! Mesh service: the Sans-IO orchestrator.
//!
//! Ties together the router, session manager, peer directory, fragment
//! reassembly, store-and-forward cache, channel registry, and identity
//! store. The driver consumes [`MeshEvent`]s (frames, link changes,
//! ticks, application commands) and returns [`MeshAction`]s for the
//! runtime to execute. It performs no I/O and reads no clocks, so every
//! scenario in the test suite drives it directly with synthetic time.

use std::collections::HashMap;

use uuid::Uuid;

use bitchat_crypto::StaticIdentity;
use bitchat_proto::payloads::announce::{Announce, IdentityAnnounce, Leave};
use bitchat_proto::payloads::channel::{
    ChannelAnnounce, ChannelKeyVerifyRequest, ChannelKeyVerifyResponse, ChannelMetadata,
    ChannelPasswordUpdate, ChannelRetention,
};
use bitchat_proto::payloads::handshake::HandshakeRequest;
use bitchat_proto::payloads::message::{ChatPayload, SealedChatPayload};
use bitchat_proto::payloads::receipt::{DeliveryAck, DeliveryStatusRequest, ReadReceipt};
use bitchat_proto::{MessageType, Packet, PeerId, WireOptions, split_packet, wire};

use crate::channel::{ChannelRegistry, JoinOutcome};
use crate::chat::ChatMessage;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::fragment::ReassemblyTable;
use crate::identity::IdentityStore;
use crate::peer_directory::PeerDirectory;
use crate::router::Router;
use crate::secure_store::{Preferences, SecureStore};
use crate::session::{SendOutcome, SessionManager};
use crate::store_forward::StoreForwardCache;

/// Runtime-assigned identifier for one link.
pub type LinkId = u64;

/// Inputs to the mesh driver.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A link to a neighbor came up.
    LinkUp {
        /// Runtime link id
        link: LinkId,
        /// Negotiated maximum frame size for this link
        mtu: usize,
    },
    /// A link was lost (timeout or disconnect).
    LinkDown {
        /// Runtime link id
        link: LinkId,
    },
    /// A frame arrived on a link.
    Frame {
        /// Arrival link
        link: LinkId,
        /// Raw frame bytes
        bytes: Vec<u8>,
    },
    /// Periodic maintenance tick.
    Tick,
    /// An application command.
    Command(MeshCommand),
}

/// Commands the application can issue.
#[derive(Debug, Clone)]
pub enum MeshCommand {
    /// Broadcast a public or channel message.
    SendPublic {
        /// Message text
        content: String,
        /// Target channel, or `None` for the public broadcast
        channel: Option<String>,
    },
    /// Send an end-to-end encrypted private message.
    SendPrivate {
        /// Message text
        content: String,
        /// Recipient peer
        to: PeerId,
        /// Recipient nickname for local bookkeeping
        recipient_nickname: String,
        /// Message id minted by the caller (for receipt tracking)
        message_id: Uuid,
    },
    /// Broadcast a presence announce now.
    SendAnnounce,
    /// Broadcast the signed identity binding now.
    SendIdentityAnnounce,
    /// Start a Noise handshake with a peer.
    InitiateHandshake(PeerId),
    /// Ask a peer to initiate a handshake toward us.
    SendHandshakeRequest {
        /// Peer being asked
        peer: PeerId,
    },
    /// Change nickname (persists and re-announces).
    SetNickname(String),
    /// Join a channel, deriving a key when a password is given.
    JoinChannel {
        /// Channel tag
        channel: String,
        /// Password for protected channels
        password: Option<String>,
    },
    /// Leave a channel.
    LeaveChannel {
        /// Channel tag
        channel: String,
    },
    /// Set or rotate a channel password (creator operation).
    SetChannelPassword {
        /// Channel tag
        channel: String,
        /// New password
        password: String,
    },
    /// Block a peer by its current id (recorded by fingerprint).
    Block {
        /// Peer to block
        peer: PeerId,
    },
    /// Unblock a peer.
    Unblock {
        /// Peer to unblock
        peer: PeerId,
    },
    /// Send a read receipt for a private message.
    SendReadReceipt {
        /// Message that was read
        message_id: Uuid,
        /// Original sender
        to: PeerId,
    },
}

/// Where to send an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    /// One specific link.
    Link(LinkId),
    /// Every live link.
    AllLinks,
    /// Every live link except one (relay exclusion).
    AllExcept(LinkId),
}

/// Outputs of the mesh driver.
#[derive(Debug, Clone)]
pub enum MeshAction {
    /// Write a frame to links.
    Send {
        /// Destination links
        target: SendTarget,
        /// Encoded frame
        bytes: Vec<u8>,
    },
    /// Notify the application.
    App(AppEvent),
}

/// Delegate notifications, mirroring the application contract.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A chat message arrived (or a local echo of one we sent).
    Message(ChatMessage),
    /// A peer became visible.
    PeerConnected(PeerId),
    /// A peer went away.
    PeerDisconnected(PeerId),
    /// The peer list changed.
    PeerListUpdated(Vec<PeerId>),
    /// A peer left a channel.
    ChannelLeave {
        /// Channel that was left
        channel: String,
        /// Peer that left
        peer: PeerId,
    },
    /// A delivery acknowledgment arrived for a message we sent.
    DeliveryAcked(DeliveryAck),
    /// A read receipt arrived for a message we sent.
    ReadReceiptReceived(ReadReceipt),
    /// A session needs a (re-)handshake before traffic can flow.
    HandshakeRequired(PeerId),
    /// A handshake or session failed.
    HandshakeFailed {
        /// Peer whose session failed
        peer: PeerId,
        /// Failure reason
        reason: String,
    },
    /// Inline system note (wrong channel key, blocked recipient, ...).
    System(String),
}

/// The mesh orchestrator.
pub struct MeshService<S: SecureStore> {
    config: MeshConfig,
    wire_options: WireOptions,
    identity: StaticIdentity,
    identity_store: IdentityStore<S>,
    prefs: Preferences<S>,
    peer_id: PeerId,
    nickname: String,
    router: Router,
    sessions: SessionManager,
    directory: PeerDirectory,
    reassembly: ReassemblyTable,
    cache: StoreForwardCache,
    channels: ChannelRegistry,
    link_peers: HashMap<LinkId, PeerId>,
    peer_links: HashMap<PeerId, LinkId>,
    link_mtus: HashMap<LinkId, usize>,
    recent_acks: HashMap<Uuid, DeliveryAck>,
    last_announce_ms: u64,
    reserved_frames_ignored: u64,
}

impl<S: SecureStore> MeshService<S> {
    /// Build a mesh service over a secure store.
    ///
    /// Loads (or creates) the static identity, restores preferences, and
    /// mints a fresh random peer id.
    pub fn new(store: S, config: MeshConfig) -> Result<Self> {
        let identity_store = IdentityStore::new(store.clone(), config.peer_id_rotation_range);
        let identity = identity_store.load_or_generate()?;
        let prefs = Preferences::new(store);
        let nickname = prefs.nickname()?.unwrap_or_else(|| "anon".to_string());
        let peer_id = IdentityStore::<S>::random_peer_id();

        Ok(Self {
            wire_options: WireOptions {
                enable_compression: config.enable_compression,
                compression_threshold: config.compression_threshold,
            },
            router: Router::new(&config),
            sessions: SessionManager::new(*identity.noise_private(), &config),
            reassembly: ReassemblyTable::new(&config),
            cache: StoreForwardCache::new(&config),
            channels: ChannelRegistry::new(),
            directory: PeerDirectory::new(),
            link_peers: HashMap::new(),
            peer_links: HashMap::new(),
            link_mtus: HashMap::new(),
            recent_acks: HashMap::new(),
            last_announce_ms: 0,
            reserved_frames_ignored: 0,
            identity,
            identity_store,
            prefs,
            peer_id,
            nickname,
            config,
        })
    }

    /// Our current (volatile) peer id.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Adopt a specific peer id.
    ///
    /// Normally ids are minted randomly on start and rotation; this
    /// exists for deterministic tests and for forced rotations driven by
    /// the application.
    pub fn adopt_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = peer_id;
    }

    /// Our stable fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// Our nickname.
    #[must_use]
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// True when a transport session with `peer` is live.
    #[must_use]
    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.is_established(peer)
    }

    /// Router drop counters, for diagnostics and tests.
    #[must_use]
    pub fn drop_counters(&self) -> crate::router::DropCounters {
        self.router.counters()
    }

    /// Reserved version-negotiation frames seen and ignored.
    #[must_use]
    pub fn reserved_frames_ignored(&self) -> u64 {
        self.reserved_frames_ignored
    }

    /// True when `peer` is a favorite (keyed by fingerprint, so the
    /// answer survives peer-id rotation).
    #[must_use]
    pub fn is_favorite(&self, peer: &PeerId) -> bool {
        self.directory
            .fingerprint_of(peer)
            .is_some_and(|fpr| self.prefs.is_favorite(fpr).unwrap_or(false))
    }

    /// Mark or unmark a peer's fingerprint as a favorite.
    pub fn set_favorite(&mut self, peer: &PeerId, favorite: bool) -> Result<()> {
        let Some(fingerprint) = self.directory.fingerprint_of(peer) else {
            return Err(MeshError::SessionNotEstablished(*peer));
        };
        self.prefs.set_favorite(fingerprint, favorite)?;
        Ok(())
    }

    /// Process one event, returning the actions to execute.
    pub fn process(&mut self, event: MeshEvent, now_ms: u64) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        match event {
            MeshEvent::LinkUp { link, mtu } => self.on_link_up(link, mtu, now_ms, &mut actions),
            MeshEvent::LinkDown { link } => self.on_link_down(link, &mut actions),
            MeshEvent::Frame { link, bytes } => {
                self.on_frame(link, &bytes, now_ms, &mut actions);
            },
            MeshEvent::Tick => self.on_tick(now_ms, &mut actions),
            MeshEvent::Command(command) => self.on_command(command, now_ms, &mut actions),
        }
        actions
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    fn on_link_up(&mut self, link: LinkId, mtu: usize, now_ms: u64, actions: &mut Vec<MeshAction>) {
        self.link_mtus.insert(link, mtu);
        tracing::debug!(link, mtu, "link up");
        // Introduce ourselves on the new link.
        let announce = self.build_announce(now_ms);
        self.send_packet(&announce, SendTarget::Link(link), actions);
        let identity = self.build_identity_announce(now_ms);
        self.send_packet(&identity, SendTarget::Link(link), actions);
    }

    fn on_link_down(&mut self, link: LinkId, actions: &mut Vec<MeshAction>) {
        self.link_mtus.remove(&link);
        let Some(peer) = self.link_peers.remove(&link) else {
            return;
        };
        self.peer_links.remove(&peer);
        self.sessions.remove(&peer);
        // The directory record survives so the store-and-forward cache
        // can still key on the peer's fingerprint; the quiet-timeout
        // eviction reclaims it if the peer never returns.
        tracing::info!(link, %peer, "link lost");
        actions.push(MeshAction::App(AppEvent::PeerDisconnected(peer)));
        actions.push(MeshAction::App(AppEvent::PeerListUpdated(self.directory.peer_ids())));
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    fn on_frame(&mut self, link: LinkId, bytes: &[u8], now_ms: u64, actions: &mut Vec<MeshAction>) {
        let packet = match wire::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.router.note_framing_drop();
                tracing::debug!(link, error = %e, "frame dropped: decode failed");
                return;
            },
        };

        // Signed packets must verify before delivery or relay, when we
        // hold the sender's signing key.
        if packet.signature.is_some() {
            if let Some(key) = self.signing_key_of(&packet.sender_id) {
                if packet.verify_signature(&key).is_err() {
                    self.router.note_framing_drop();
                    tracing::warn!(sender = %packet.sender_id, "dropped packet with bad signature");
                    return;
                }
            }
        }

        let outcome = self.router.route(&packet, &self.peer_id, now_ms);

        if let Some(relayed) = &outcome.relay {
            self.send_packet(relayed, SendTarget::AllExcept(link), actions);
        }

        // Directed traffic for a peer that is currently offline gets
        // cached for replay, keyed by its stable fingerprint. Duplicates
        // the router already suppressed are not cached again.
        let fresh = outcome.deliver || outcome.relay.is_some();
        if let Some(recipient) = packet.recipient_id {
            if fresh && !recipient.is_broadcast() && recipient != self.peer_id {
                if let Some(fingerprint) = self.directory.fingerprint_of(&recipient) {
                    if !self.peer_links.contains_key(&recipient) {
                        let fingerprint = fingerprint.to_string();
                        self.cache.enqueue(&fingerprint, packet.clone(), now_ms);
                    }
                }
            }
        }

        if outcome.deliver {
            self.deliver(&packet, Some(link), now_ms, false, actions);
        }
    }

    /// Handle a packet addressed to us (directly, via broadcast, via
    /// reassembly, or carried inside a session).
    #[allow(clippy::too_many_lines)]
    fn deliver(
        &mut self,
        packet: &Packet,
        link: Option<LinkId>,
        now_ms: u64,
        via_session: bool,
        actions: &mut Vec<MeshAction>,
    ) {
        // A frame that still carries the full hop budget came from a
        // direct neighbor; that is what binds a link to a peer id.
        if let Some(link) = link {
            if packet.ttl >= self.config.ttl_default {
                self.bind_link(link, packet.sender_id);
            }
        }
        // Records are created by presence traffic only; anything else
        // just refreshes activity on peers we already track.
        if self.directory.record(&packet.sender_id).is_some() {
            self.directory.upsert(packet.sender_id, None, now_ms);
        }

        match packet.message_type {
            MessageType::Announce => self.on_announce(packet, link, now_ms, actions),
            MessageType::Leave => self.on_leave(packet, actions),
            MessageType::Message => self.on_chat_message(packet, now_ms, via_session, actions),
            MessageType::FragmentStart
            | MessageType::FragmentContinue
            | MessageType::FragmentEnd => match self.reassembly.insert(packet, now_ms) {
                Ok(Some(reassembled)) => {
                    self.deliver(&reassembled, None, now_ms, via_session, actions);
                },
                Ok(None) => {},
                Err(e) => {
                    self.router.note_framing_drop();
                    tracing::debug!(error = %e, "fragment dropped");
                },
            },
            MessageType::ChannelAnnounce => self.on_channel_announce(packet, actions),
            MessageType::ChannelRetention => {
                if let Ok(retention) = ChannelRetention::decode(&packet.payload) {
                    self.channels.set_retention(&retention.channel, retention.enabled);
                }
            },
            MessageType::ChannelMetadata => self.on_channel_metadata(packet, actions),
            MessageType::DeliveryAck => self.on_delivery_ack(packet, actions),
            MessageType::DeliveryStatusRequest => {
                self.on_delivery_status_request(packet, actions);
            },
            MessageType::ReadReceipt => {
                if let Ok(receipt) = ReadReceipt::decode(&packet.payload) {
                    actions.push(MeshAction::App(AppEvent::ReadReceiptReceived(receipt)));
                }
            },
            MessageType::NoiseHandshakeInit => {
                self.on_noise_handshake_init(packet, now_ms, actions);
            },
            MessageType::NoiseHandshakeResp => {
                self.on_noise_handshake_resp(packet, now_ms, actions);
            },
            MessageType::NoiseEncrypted => self.on_noise_encrypted(packet, now_ms, actions),
            MessageType::NoiseIdentityAnnounce => {
                self.on_identity_announce(packet, link, now_ms, actions);
            },
            MessageType::ChannelKeyVerifyRequest => {
                self.on_channel_key_verify_request(packet, actions);
            },
            MessageType::ChannelKeyVerifyResponse => {
                if let Ok(response) = ChannelKeyVerifyResponse::decode(&packet.payload) {
                    tracing::debug!(channel = %response.channel, "channel key verify response");
                }
            },
            MessageType::ChannelPasswordUpdate => self.on_channel_password_update(packet, actions),
            MessageType::VersionHello | MessageType::VersionAck => {
                // Reserved for a future compatibility negotiation.
                self.reserved_frames_ignored += 1;
            },
            MessageType::HandshakeRequest => self.on_handshake_request(packet, now_ms, actions),
        }
    }

    fn on_announce(
        &mut self,
        packet: &Packet,
        link: Option<LinkId>,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        let Ok(announce) = Announce::decode(&packet.payload) else {
            self.router.note_framing_drop();
            return;
        };
        let is_new = self.directory.upsert(packet.sender_id, Some(&announce.nickname), now_ms);
        if is_new {
            tracing::info!(peer = %packet.sender_id, nickname = %announce.nickname, "peer appeared");
            actions.push(MeshAction::App(AppEvent::PeerConnected(packet.sender_id)));
            actions
                .push(MeshAction::App(AppEvent::PeerListUpdated(self.directory.peer_ids())));
        }
        if link.is_some() {
            self.replay_cached(packet.sender_id, now_ms, actions);
        }
    }

    fn on_leave(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        let channel = Leave::decode(&packet.payload).ok().and_then(|leave| leave.channel);
        match channel {
            Some(channel) => {
                actions.push(MeshAction::App(AppEvent::ChannelLeave {
                    channel,
                    peer: packet.sender_id,
                }));
            },
            None => {
                let peer = packet.sender_id;
                self.sessions.remove(&peer);
                if let Some(link) = self.peer_links.remove(&peer) {
                    self.link_peers.remove(&link);
                }
                self.directory.remove(&peer);
                actions.push(MeshAction::App(AppEvent::PeerDisconnected(peer)));
                actions
                    .push(MeshAction::App(AppEvent::PeerListUpdated(self.directory.peer_ids())));
            },
        }
    }

    fn on_chat_message(
        &mut self,
        packet: &Packet,
        now_ms: u64,
        via_session: bool,
        actions: &mut Vec<MeshAction>,
    ) {
        if self.is_sender_blocked(&packet.sender_id) {
            tracing::debug!(sender = %packet.sender_id, "message from blocked peer dropped");
            return;
        }

        let is_relayed = packet.ttl < self.config.ttl_default;
        if let Ok(payload) = ChatPayload::decode(&packet.payload) {
            let message = ChatMessage::from_payload(
                payload,
                packet.sender_id,
                packet.timestamp_ms,
                via_session,
                is_relayed,
                via_session,
            );
            let hops = self.config.ttl_default.saturating_sub(packet.ttl);
            let ack = (via_session && packet.is_addressed_to(&self.peer_id))
                .then(|| self.build_delivery_ack(&message, hops, now_ms));
            actions.push(MeshAction::App(AppEvent::Message(message)));
            if let Some(ack) = ack {
                self.send_private_control(
                    packet.sender_id,
                    MessageType::DeliveryAck,
                    &ack,
                    now_ms,
                    actions,
                );
            }
            return;
        }

        // Not plain CBOR: a channel-sealed body or garbage.
        match SealedChatPayload::decode(&packet.payload) {
            Ok(sealed) => self.open_sealed_message(packet, &sealed, is_relayed, actions),
            Err(e) => {
                self.router.note_framing_drop();
                tracing::debug!(error = %e, "undecodable chat message dropped");
            },
        }
    }

    fn open_sealed_message(
        &mut self,
        packet: &Packet,
        sealed: &SealedChatPayload,
        is_relayed: bool,
        actions: &mut Vec<MeshAction>,
    ) {
        let channel = &sealed.sealed_channel;
        if !self.channels.is_joined(channel) {
            // Not our conversation; it was still relayed.
            return;
        }
        let Some(key) = self.channels.key(channel) else {
            actions.push(MeshAction::App(AppEvent::System(format!(
                "encrypted message in {channel}; join with the password to read it"
            ))));
            return;
        };
        let plaintext = match key.decrypt(&sealed.sealed) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                actions.push(MeshAction::App(AppEvent::System(format!(
                    "unable to decrypt message in {channel}: wrong channel key"
                ))));
                return;
            },
        };
        match ChatPayload::decode(&plaintext) {
            Ok(payload) => {
                let message = ChatMessage::from_payload(
                    payload,
                    packet.sender_id,
                    packet.timestamp_ms,
                    false,
                    is_relayed,
                    true,
                );
                actions.push(MeshAction::App(AppEvent::Message(message)));
            },
            Err(e) => {
                tracing::debug!(error = %e, "sealed payload decrypted to garbage");
            },
        }
    }

    fn on_channel_announce(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        let Ok(announce) = ChannelAnnounce::decode(&packet.payload) else {
            return;
        };
        self.channels.observe(
            &announce.channel,
            Some(announce.creator_id),
            announce.is_protected,
            announce.key_commitment.clone(),
        );
        self.remember_channel_facts(&announce.channel, announce.is_protected, announce.creator_id);
        let _ = actions;
    }

    fn on_channel_metadata(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        let Ok(metadata) = ChannelMetadata::decode(&packet.payload) else {
            return;
        };
        self.channels.observe(
            &metadata.channel,
            Some(metadata.creator_id),
            metadata.is_protected,
            metadata.key_commitment.clone(),
        );
        self.remember_channel_facts(&metadata.channel, metadata.is_protected, metadata.creator_id);
        let _ = actions;
    }

    fn remember_channel_facts(&mut self, channel: &str, is_protected: bool, creator: PeerId) {
        if let Err(e) = self.prefs.set_channel_protected(channel, is_protected) {
            tracing::warn!(error = %e, "failed to persist channel protection flag");
        }
        if let Err(e) = self.prefs.set_channel_creator(channel, &creator.to_hex()) {
            tracing::warn!(error = %e, "failed to persist channel creator");
        }
    }

    fn on_delivery_ack(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        if let Ok(ack) = DeliveryAck::decode(&packet.payload) {
            actions.push(MeshAction::App(AppEvent::DeliveryAcked(ack)));
        }
    }

    fn on_delivery_status_request(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        let Ok(request) = DeliveryStatusRequest::decode(&packet.payload) else {
            return;
        };
        // Answer from the acks we have produced; silence otherwise.
        if let Some(ack) = self.recent_acks.get(&request.message_id).cloned() {
            if let Ok(payload) = ack.encode() {
                let response = self
                    .new_packet(MessageType::DeliveryAck, payload, packet.timestamp_ms)
                    .with_recipient(packet.sender_id);
                let target = self.target_for(&packet.sender_id);
                self.send_packet(&response, target, actions);
            }
        }
    }

    fn on_noise_handshake_init(
        &mut self,
        packet: &Packet,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        if !packet.is_addressed_to(&self.peer_id) {
            return;
        }
        let peer = packet.sender_id;
        let local = self.peer_id;
        match self.sessions.on_handshake_init(&local, peer, &packet.payload, now_ms) {
            Ok(outcome) => {
                if let Some(msg2) = outcome.response {
                    let response = self
                        .new_packet(MessageType::NoiseHandshakeResp, msg2, now_ms)
                        .with_recipient(peer);
                    let target = self.target_for(&peer);
                    self.send_packet(&response, target, actions);
                }
            },
            Err(e) => {
                actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                    peer,
                    reason: e.to_string(),
                }));
            },
        }
    }

    fn on_noise_handshake_resp(
        &mut self,
        packet: &Packet,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        if !packet.is_addressed_to(&self.peer_id) {
            return;
        }
        let peer = packet.sender_id;
        match self.sessions.on_handshake_resp(peer, &packet.payload, now_ms) {
            Ok(outcome) => {
                if let Some(msg3) = outcome.response {
                    let response = self
                        .new_packet(MessageType::NoiseHandshakeResp, msg3, now_ms)
                        .with_recipient(peer);
                    let target = self.target_for(&peer);
                    self.send_packet(&response, target, actions);
                }
                if let Some(info) = outcome.established {
                    self.on_session_established(info.peer, info.fingerprint, now_ms, actions);
                }
            },
            Err(e) => {
                actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                    peer,
                    reason: e.to_string(),
                }));
            },
        }
    }

    fn on_session_established(
        &mut self,
        peer: PeerId,
        fingerprint: String,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        self.directory.bind(peer, fingerprint, now_ms);

        // Flush plaintext that queued up while the handshake ran.
        for plaintext in self.sessions.take_queued(&peer) {
            match self.sessions.encrypt(peer, &plaintext) {
                Ok(SendOutcome::Encrypted(ciphertext)) => {
                    let outer = self
                        .new_packet(MessageType::NoiseEncrypted, ciphertext, now_ms)
                        .with_recipient(peer);
                    let target = self.target_for(&peer);
                    self.send_packet(&outer, target, actions);
                },
                Ok(_) => break,
                Err(e) => {
                    actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                        peer,
                        reason: e.to_string(),
                    }));
                    return;
                },
            }
        }

        self.replay_cached(peer, now_ms, actions);
    }

    fn on_noise_encrypted(&mut self, packet: &Packet, now_ms: u64, actions: &mut Vec<MeshAction>) {
        if !packet.is_addressed_to(&self.peer_id) {
            return;
        }
        let peer = packet.sender_id;
        if self.is_sender_blocked(&peer) {
            return;
        }
        let plaintext = match self.sessions.decrypt(peer, &packet.payload) {
            Ok(plaintext) => plaintext,
            Err(MeshError::SessionNotEstablished(_)) => {
                actions.push(MeshAction::App(AppEvent::HandshakeRequired(peer)));
                return;
            },
            Err(e) => {
                actions.push(MeshAction::App(AppEvent::HandshakeRequired(peer)));
                actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                    peer,
                    reason: e.to_string(),
                }));
                return;
            },
        };
        let inner = match wire::decode(&plaintext) {
            Ok(inner) => inner,
            Err(e) => {
                self.router.note_framing_drop();
                tracing::debug!(error = %e, "inner packet decode failed");
                return;
            },
        };
        // The tunnel authenticates the sender; the inner packet must
        // agree or someone is splicing sessions.
        if inner.sender_id != peer {
            tracing::warn!(outer = %peer, inner = %inner.sender_id, "inner sender mismatch");
            return;
        }
        self.deliver(&inner, None, now_ms, true, actions);
    }

    fn on_identity_announce(
        &mut self,
        packet: &Packet,
        link: Option<LinkId>,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        let Ok(announce) = IdentityAnnounce::decode(&packet.payload) else {
            self.router.note_framing_drop();
            return;
        };
        if announce.verify().is_err() {
            tracing::warn!(peer = %announce.peer_id, "identity announce failed verification");
            return;
        }
        let fingerprint = bitchat_crypto::fingerprint(&announce.noise_public_key);
        let is_new = self.directory.record(&announce.peer_id).is_none();
        self.directory.bind(announce.peer_id, fingerprint, now_ms);
        self.directory.upsert(announce.peer_id, Some(&announce.nickname), now_ms);
        if let Ok(key) = announce.signing_public_key.as_slice().try_into() {
            self.directory.set_signing_key(&announce.peer_id, key);
        }
        if let Some(link) = link {
            if packet.ttl >= self.config.ttl_default {
                self.bind_link(link, announce.peer_id);
            }
        }
        if is_new {
            actions.push(MeshAction::App(AppEvent::PeerConnected(announce.peer_id)));
            actions
                .push(MeshAction::App(AppEvent::PeerListUpdated(self.directory.peer_ids())));
        }

        let peer = announce.peer_id;
        if !self.sessions.is_established(&peer) && !self.sessions.is_handshaking(&peer) {
            if SessionManager::should_initiate(&self.peer_id, &peer) {
                self.initiate_handshake(peer, now_ms, actions);
            } else if self.sessions.queued_count(&peer) > 0 {
                self.send_handshake_request(peer, now_ms, actions);
            }
        }
        self.replay_cached(peer, now_ms, actions);
    }

    fn on_channel_key_verify_request(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        let Ok(request) = ChannelKeyVerifyRequest::decode(&packet.payload) else {
            return;
        };
        let Some(key) = self.channels.key(&request.channel) else {
            return;
        };
        let response = ChannelKeyVerifyResponse {
            channel: request.channel.clone(),
            proof: key.verify_proof(&request.nonce),
        };
        if let Ok(payload) = response.encode() {
            let reply = self
                .new_packet(MessageType::ChannelKeyVerifyResponse, payload, packet.timestamp_ms)
                .with_recipient(packet.sender_id);
            let target = self.target_for(&packet.sender_id);
            self.send_packet(&reply, target, actions);
        }
    }

    fn on_channel_password_update(&mut self, packet: &Packet, actions: &mut Vec<MeshAction>) {
        let Ok(update) = ChannelPasswordUpdate::decode(&packet.payload) else {
            return;
        };
        let channel = update.channel.clone();
        let Some(old_key) = self.channels.key(&channel) else {
            return;
        };
        match old_key.decrypt(&update.wrapped_new_key) {
            Ok(new_key_bytes) => {
                let Ok(bytes) = <[u8; 32]>::try_from(new_key_bytes) else {
                    return;
                };
                let new_key = bitchat_crypto::ChannelKey::from_bytes(bytes);
                if !new_key.matches_commitment(&update.new_key_commitment) {
                    tracing::warn!(%channel, "password update commitment mismatch");
                    return;
                }
                self.channels.observe(
                    &channel,
                    Some(packet.sender_id),
                    true,
                    Some(update.new_key_commitment.clone()),
                );
                self.channels.adopt_key(&channel, new_key);
                actions.push(MeshAction::App(AppEvent::System(format!(
                    "{channel} password was rotated by the channel owner"
                ))));
            },
            Err(_) => {
                actions.push(MeshAction::App(AppEvent::System(format!(
                    "{channel} password changed; rejoin with the new password"
                ))));
                self.channels.leave(&channel);
            },
        }
    }

    fn on_handshake_request(&mut self, packet: &Packet, now_ms: u64, actions: &mut Vec<MeshAction>) {
        let Ok(request) = HandshakeRequest::decode(&packet.payload) else {
            return;
        };
        if request.target_id != self.peer_id {
            return;
        }
        let peer = request.requester_id;
        if self.sessions.is_established(&peer) || self.sessions.is_handshaking(&peer) {
            return;
        }
        if SessionManager::should_initiate(&self.peer_id, &peer) {
            tracing::debug!(%peer, pending = request.pending_count, "handshake requested");
            self.initiate_handshake(peer, now_ms, actions);
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn on_tick(&mut self, now_ms: u64, actions: &mut Vec<MeshAction>) {
        for peer in self.sessions.expire_handshakes(now_ms) {
            actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                peer,
                reason: "handshake deadline exceeded".to_string(),
            }));
        }

        for peer in self.sessions.sessions_needing_rekey(now_ms) {
            match self.sessions.begin_rekey(peer, now_ms) {
                Ok(msg1) => {
                    tracing::debug!(%peer, "rekey started");
                    let init = self
                        .new_packet(MessageType::NoiseHandshakeInit, msg1, now_ms)
                        .with_recipient(peer);
                    let target = self.target_for(&peer);
                    self.send_packet(&init, target, actions);
                },
                Err(MeshError::HandshakeInProgress(_)) => {},
                Err(e) => {
                    actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                        peer,
                        reason: e.to_string(),
                    }));
                },
            }
        }

        self.reassembly.purge_expired(now_ms);
        self.cache.purge_expired(now_ms);

        let horizon = now_ms.saturating_sub(self.config.peer_eviction_timeout.as_millis() as u64);
        let evicted = self.directory.evict_quiet(horizon);
        if !evicted.is_empty() {
            for record in &evicted {
                self.sessions.remove(&record.peer_id);
                if let Some(link) = self.peer_links.remove(&record.peer_id) {
                    self.link_peers.remove(&link);
                }
                actions.push(MeshAction::App(AppEvent::PeerDisconnected(record.peer_id)));
            }
            actions.push(MeshAction::App(AppEvent::PeerListUpdated(self.directory.peer_ids())));
        }

        if now_ms.saturating_sub(self.last_announce_ms)
            >= self.config.announce_interval.as_millis() as u64
        {
            let announce = self.build_announce(now_ms);
            self.send_packet(&announce, SendTarget::AllLinks, actions);
            self.last_announce_ms = now_ms;
        }

        // Rotation waits out in-flight handshakes: a peer mid-handshake
        // addresses its next message to the id it started with.
        if !self.sessions.has_pending_handshakes() {
            match self.identity_store.should_rotate_peer_id(now_ms) {
                Ok(true) => self.rotate_peer_id(now_ms, actions),
                Ok(false) => {},
                Err(e) => tracing::warn!(error = %e, "rotation check failed"),
            }
        }
    }

    fn rotate_peer_id(&mut self, now_ms: u64, actions: &mut Vec<MeshAction>) {
        let old = self.peer_id;
        self.peer_id = IdentityStore::<S>::random_peer_id();
        if let Err(e) = self.identity_store.mark_rotation_completed(now_ms) {
            tracing::warn!(error = %e, "failed to persist rotation");
        }
        tracing::info!(%old, new = %self.peer_id, "peer id rotated");
        // Re-bind the new id to our identity for everyone listening.
        let identity = self.build_identity_announce(now_ms);
        self.send_packet(&identity, SendTarget::AllLinks, actions);
        let announce = self.build_announce(now_ms);
        self.send_packet(&announce, SendTarget::AllLinks, actions);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, command: MeshCommand, now_ms: u64, actions: &mut Vec<MeshAction>) {
        match command {
            MeshCommand::SendPublic { content, channel } => {
                self.send_public(&content, channel.as_deref(), now_ms, actions);
            },
            MeshCommand::SendPrivate { content, to, recipient_nickname, message_id } => {
                self.send_private(&content, to, &recipient_nickname, message_id, now_ms, actions);
            },
            MeshCommand::SendAnnounce => {
                let announce = self.build_announce(now_ms);
                self.send_packet(&announce, SendTarget::AllLinks, actions);
                self.last_announce_ms = now_ms;
            },
            MeshCommand::SendIdentityAnnounce => {
                let identity = self.build_identity_announce(now_ms);
                self.send_packet(&identity, SendTarget::AllLinks, actions);
            },
            MeshCommand::InitiateHandshake(peer) => {
                self.initiate_handshake(peer, now_ms, actions);
            },
            MeshCommand::SendHandshakeRequest { peer } => {
                self.send_handshake_request(peer, now_ms, actions);
            },
            MeshCommand::SetNickname(nickname) => {
                self.nickname = nickname;
                if let Err(e) = self.prefs.set_nickname(&self.nickname) {
                    tracing::warn!(error = %e, "failed to persist nickname");
                }
                let announce = self.build_announce(now_ms);
                self.send_packet(&announce, SendTarget::AllLinks, actions);
            },
            MeshCommand::JoinChannel { channel, password } => {
                self.join_channel(&channel, password.as_deref(), actions);
            },
            MeshCommand::LeaveChannel { channel } => {
                self.channels.leave(&channel);
                if let Err(e) = self.prefs.set_channel_joined(&channel, false) {
                    tracing::warn!(error = %e, "failed to persist channel leave");
                }
                if let Ok(payload) = (Leave { channel: Some(channel.clone()) }).encode() {
                    let packet = self
                        .new_packet(MessageType::Leave, payload, now_ms)
                        .with_recipient(PeerId::BROADCAST);
                    self.send_packet(&packet, SendTarget::AllLinks, actions);
                }
                actions.push(MeshAction::App(AppEvent::System(format!("left {channel}"))));
            },
            MeshCommand::SetChannelPassword { channel, password } => {
                self.set_channel_password(&channel, &password, now_ms, actions);
            },
            MeshCommand::Block { peer } => self.set_blocked(peer, true, actions),
            MeshCommand::Unblock { peer } => self.set_blocked(peer, false, actions),
            MeshCommand::SendReadReceipt { message_id, to } => {
                let receipt = ReadReceipt {
                    message_id,
                    reader_id: self.peer_id,
                    reader_nickname: self.nickname.clone(),
                    timestamp_ms: now_ms,
                };
                self.send_private_control(to, MessageType::ReadReceipt, &receipt, now_ms, actions);
            },
        }
    }

    fn send_public(
        &mut self,
        content: &str,
        channel: Option<&str>,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        let payload = ChatPayload {
            id: Uuid::new_v4(),
            sender_nickname: self.nickname.clone(),
            content: content.to_string(),
            mentions: ChatMessage::extract_mentions(content),
            channel: channel.map(ToString::to_string),
        };

        let encoded = match channel.and_then(|c| self.channels.key(c)) {
            Some(key) => {
                let Ok(plain) = payload.encode() else { return };
                let nonce: [u8; 12] = rand::random();
                let Ok(sealed) = key.encrypt(&plain, nonce) else {
                    actions.push(MeshAction::App(AppEvent::System(
                        "channel encryption failed".to_string(),
                    )));
                    return;
                };
                let boxed = SealedChatPayload {
                    sealed_channel: channel.unwrap_or_default().to_string(),
                    sealed,
                };
                match boxed.encode() {
                    Ok(encoded) => encoded,
                    Err(_) => return,
                }
            },
            None => match payload.encode() {
                Ok(encoded) => encoded,
                Err(_) => return,
            },
        };

        let packet = self
            .new_packet(MessageType::Message, encoded, now_ms)
            .with_recipient(PeerId::BROADCAST);
        self.send_packet(&packet, SendTarget::AllLinks, actions);

        // Local echo so the application renders our own message.
        let mut echo = ChatMessage::from_payload(
            payload,
            self.peer_id,
            now_ms,
            false,
            false,
            channel.is_some_and(|c| self.channels.key(c).is_some()),
        );
        echo.sender_nickname = self.nickname.clone();
        actions.push(MeshAction::App(AppEvent::Message(echo)));
    }

    fn send_private(
        &mut self,
        content: &str,
        to: PeerId,
        recipient_nickname: &str,
        message_id: Uuid,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        if self.is_sender_blocked(&to) {
            actions.push(MeshAction::App(AppEvent::System(format!(
                "cannot message {recipient_nickname}: peer is blocked"
            ))));
            return;
        }

        let payload = ChatPayload {
            id: message_id,
            sender_nickname: self.nickname.clone(),
            content: content.to_string(),
            mentions: ChatMessage::extract_mentions(content),
            channel: None,
        };
        let Ok(encoded) = payload.encode() else { return };
        let inner = self
            .new_packet(MessageType::Message, encoded, now_ms)
            .with_recipient(to);
        let Ok(inner_bytes) = wire::encode(&inner, &self.wire_options) else {
            return;
        };

        match self.sessions.encrypt(to, &inner_bytes) {
            Ok(SendOutcome::Encrypted(ciphertext)) => {
                let outer = self
                    .new_packet(MessageType::NoiseEncrypted, ciphertext, now_ms)
                    .with_recipient(to);
                let target = self.target_for(&to);
                self.send_packet(&outer, target, actions);
            },
            Ok(SendOutcome::Queued { pending }) => {
                tracing::debug!(%to, pending, "private message queued behind handshake");
            },
            Ok(SendOutcome::NeedsHandshake { pending }) => {
                if SessionManager::should_initiate(&self.peer_id, &to) {
                    self.initiate_handshake(to, now_ms, actions);
                } else {
                    let _ = pending;
                    self.send_handshake_request(to, now_ms, actions);
                }
            },
            Err(e) => {
                actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                    peer: to,
                    reason: e.to_string(),
                }));
            },
        }
    }

    /// Encrypt and send a control payload (ack, receipt) through the
    /// session with `peer`, silently skipping when no session is live.
    fn send_private_control<T>(
        &mut self,
        peer: PeerId,
        message_type: MessageType,
        payload: &T,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) where
        T: CborControl,
    {
        let Ok(encoded) = payload.encode_control() else { return };
        let inner = self.new_packet(message_type, encoded, now_ms).with_recipient(peer);
        let Ok(inner_bytes) = wire::encode(&inner, &self.wire_options) else {
            return;
        };
        if let Ok(SendOutcome::Encrypted(ciphertext)) = self.sessions.encrypt(peer, &inner_bytes)
        {
            let outer = self
                .new_packet(MessageType::NoiseEncrypted, ciphertext, now_ms)
                .with_recipient(peer);
            let target = self.target_for(&peer);
            self.send_packet(&outer, target, actions);
        }
    }

    fn initiate_handshake(&mut self, peer: PeerId, now_ms: u64, actions: &mut Vec<MeshAction>) {
        match self.sessions.initiate(peer, now_ms) {
            Ok(msg1) => {
                let init = self
                    .new_packet(MessageType::NoiseHandshakeInit, msg1, now_ms)
                    .with_recipient(peer);
                let target = self.target_for(&peer);
                self.send_packet(&init, target, actions);
            },
            Err(MeshError::HandshakeInProgress(_)) => {},
            Err(e) => {
                actions.push(MeshAction::App(AppEvent::HandshakeFailed {
                    peer,
                    reason: e.to_string(),
                }));
            },
        }
    }

    fn send_handshake_request(&mut self, peer: PeerId, now_ms: u64, actions: &mut Vec<MeshAction>) {
        let request = HandshakeRequest {
            requester_id: self.peer_id,
            requester_nickname: self.nickname.clone(),
            target_id: peer,
            pending_count: self.sessions.queued_count(&peer).min(u8::MAX as usize) as u8,
        };
        if let Ok(payload) = request.encode() {
            let packet = self
                .new_packet(MessageType::HandshakeRequest, payload, now_ms)
                .with_recipient(peer);
            let target = self.target_for(&peer);
            self.send_packet(&packet, target, actions);
        }
    }

    fn join_channel(
        &mut self,
        channel: &str,
        password: Option<&str>,
        actions: &mut Vec<MeshAction>,
    ) {
        match self.channels.join(channel, password) {
            JoinOutcome::Joined => {
                if let Err(e) = self.prefs.set_channel_joined(channel, true) {
                    tracing::warn!(error = %e, "failed to persist channel join");
                }
                actions.push(MeshAction::App(AppEvent::System(format!("joined {channel}"))));
            },
            JoinOutcome::PasswordRequired => {
                actions.push(MeshAction::App(AppEvent::System(format!(
                    "{channel} is password protected; /join {channel} <password>"
                ))));
            },
            JoinOutcome::WrongPassword => {
                actions.push(MeshAction::App(AppEvent::System(format!(
                    "wrong password for {channel}"
                ))));
            },
        }
    }

    fn set_channel_password(
        &mut self,
        channel: &str,
        password: &str,
        now_ms: u64,
        actions: &mut Vec<MeshAction>,
    ) {
        // Only the creator (or the first claimant) may set a password.
        if let Some(state) = self.channels.state(channel) {
            if let Some(creator) = state.creator_id {
                if creator != self.peer_id {
                    actions.push(MeshAction::App(AppEvent::System(format!(
                        "only the creator of {channel} can change its password"
                    ))));
                    return;
                }
            }
        }
        self.channels.create_protected(channel, password, self.peer_id);
        self.remember_channel_facts(channel, true, self.peer_id);
        if let Err(e) = self.prefs.set_channel_joined(channel, true) {
            tracing::warn!(error = %e, "failed to persist channel join");
        }

        let commitment = self.channels.state(channel).and_then(|s| s.key_commitment.clone());
        let metadata = ChannelMetadata {
            channel: channel.to_string(),
            creator_id: self.peer_id,
            created_at_ms: now_ms,
            is_protected: true,
            key_commitment: commitment,
        };
        if let Ok(payload) = metadata.encode() {
            let packet = self
                .new_packet(MessageType::ChannelMetadata, payload, now_ms)
                .with_recipient(PeerId::BROADCAST);
            self.send_packet(&packet, SendTarget::AllLinks, actions);
        }
        actions.push(MeshAction::App(AppEvent::System(format!(
            "password set for {channel}"
        ))));
    }

    fn set_blocked(&mut self, peer: PeerId, blocked: bool, actions: &mut Vec<MeshAction>) {
        let Some(fingerprint) = self.directory.fingerprint_of(&peer).map(ToString::to_string)
        else {
            actions.push(MeshAction::App(AppEvent::System(
                "cannot block: peer identity not yet known".to_string(),
            )));
            return;
        };
        if let Err(e) = self.prefs.set_blocked(&fingerprint, blocked) {
            tracing::warn!(error = %e, "failed to persist blocklist change");
            return;
        }
        let verb = if blocked { "blocked" } else { "unblocked" };
        actions.push(MeshAction::App(AppEvent::System(format!("{verb} {peer}"))));
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn new_packet(&self, message_type: MessageType, payload: Vec<u8>, now_ms: u64) -> Packet {
        Packet::new(message_type, self.peer_id, now_ms, payload)
            .with_ttl(self.config.ttl_default)
    }

    fn build_announce(&self, now_ms: u64) -> Packet {
        let payload = Announce { nickname: self.nickname.clone() }
            .encode()
            .unwrap_or_default();
        let mut packet = self
            .new_packet(MessageType::Announce, payload, now_ms)
            .with_recipient(PeerId::BROADCAST);
        packet.sign(self.identity.signing_key());
        packet
    }

    fn build_identity_announce(&self, now_ms: u64) -> Packet {
        let announce = IdentityAnnounce::signed(
            self.peer_id,
            self.nickname.clone(),
            *self.identity.noise_public(),
            self.identity.signing_key(),
            now_ms,
        );
        let payload = announce.encode().unwrap_or_default();
        self.new_packet(MessageType::NoiseIdentityAnnounce, payload, now_ms)
            .with_recipient(PeerId::BROADCAST)
    }

    fn build_delivery_ack(
        &mut self,
        message: &ChatMessage,
        hop_count: u8,
        now_ms: u64,
    ) -> DeliveryAck {
        let ack = DeliveryAck {
            message_id: message.id,
            recipient_id: self.peer_id,
            recipient_nickname: self.nickname.clone(),
            hop_count,
            timestamp_ms: now_ms,
        };
        self.recent_acks.insert(message.id, ack.clone());
        ack
    }

    /// Encode a packet and emit send actions, fragmenting when the
    /// target link cannot carry it whole.
    fn send_packet(&mut self, packet: &Packet, target: SendTarget, actions: &mut Vec<MeshAction>) {
        let encoded = match wire::encode(packet, &self.wire_options) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "packet encode failed");
                return;
            },
        };
        let mtu = self.mtu_for(target);
        if encoded.len() <= mtu {
            actions.push(MeshAction::Send { target, bytes: encoded });
            return;
        }
        // Chunk against the largest padding block the link can carry,
        // not the raw MTU: the encoder rounds every small packet up to
        // a block, and a fragment that pads past the MTU is useless.
        let budget = bitchat_proto::BLOCK_SIZES
            .iter()
            .rev()
            .find(|&&block| block <= mtu)
            .map_or(mtu, |&block| block - 16);
        match split_packet(packet, budget) {
            Ok(fragments) => {
                tracing::debug!(count = fragments.len(), "packet fragmented for link mtu");
                for fragment in fragments {
                    match wire::encode(&fragment, &self.wire_options) {
                        Ok(bytes) => actions.push(MeshAction::Send { target, bytes }),
                        Err(e) => tracing::warn!(error = %e, "fragment encode failed"),
                    }
                }
            },
            Err(e) => tracing::warn!(error = %e, "fragmentation failed, packet dropped"),
        }
    }

    fn mtu_for(&self, target: SendTarget) -> usize {
        match target {
            SendTarget::Link(link) => self.link_mtus.get(&link).copied().unwrap_or(usize::MAX),
            SendTarget::AllLinks => {
                self.link_mtus.values().copied().min().unwrap_or(usize::MAX)
            },
            SendTarget::AllExcept(excluded) => self
                .link_mtus
                .iter()
                .filter(|(link, _)| **link != excluded)
                .map(|(_, mtu)| *mtu)
                .min()
                .unwrap_or(usize::MAX),
        }
    }

    fn target_for(&self, peer: &PeerId) -> SendTarget {
        match self.peer_links.get(peer) {
            Some(link) => SendTarget::Link(*link),
            None => SendTarget::AllLinks,
        }
    }

    fn bind_link(&mut self, link: LinkId, peer: PeerId) {
        if let Some(previous) = self.link_peers.insert(link, peer) {
            if previous != peer {
                self.peer_links.remove(&previous);
            }
        }
        self.peer_links.insert(peer, link);
    }

    fn replay_cached(&mut self, peer: PeerId, now_ms: u64, actions: &mut Vec<MeshAction>) {
        let Some(fingerprint) = self.directory.fingerprint_of(&peer).map(ToString::to_string)
        else {
            return;
        };
        let cached = self.cache.drain_for(&fingerprint, now_ms);
        if cached.is_empty() {
            return;
        }
        tracing::info!(%peer, count = cached.len(), "replaying cached packets");
        let target = self.target_for(&peer);
        for mut packet in cached {
            // Re-address to the peer's current id; it may have rotated
            // while offline.
            packet.recipient_id = Some(peer);
            self.send_packet(&packet, target, actions);
        }
    }

    fn is_sender_blocked(&self, peer: &PeerId) -> bool {
        let Some(fingerprint) = self.directory.fingerprint_of(peer) else {
            return false;
        };
        self.prefs.is_blocked(fingerprint).unwrap_or(false)
    }

    fn signing_key_of(&self, peer: &PeerId) -> Option<ed25519_dalek::VerifyingKey> {
        let record = self.directory.record(peer)?;
        let bytes = record.signing_public_key?;
        ed25519_dalek::VerifyingKey::from_bytes(&bytes).ok()
    }
}

impl<S: SecureStore> std::fmt::Debug for MeshService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshService")
            .field("peer_id", &self.peer_id)
            .field("nickname", &self.nickname)
            .field("peers", &self.directory.len())
            .finish()
    }
}

/// CBOR encoding hook for control payloads sent through sessions.
trait CborControl {
    fn encode_control(&self) -> bitchat_proto::Result<Vec<u8>>;
}

impl CborControl for DeliveryAck {
    fn encode_control(&self) -> bitchat_proto::Result<Vec<u8>> {
        self.encode()
    }
}

impl CborControl for ReadReceipt {
    fn encode_control(&self) -> bitchat_proto::Result<Vec<u8>> {
        self.encode()
    }
}

//! The running node.
//!
//! [`Node::new`] builds the swarm (TCP, QUIC, DNS, WebSocket and the relay
//! client transport, all secured with Noise and multiplexed with Yamux),
//! opens the listeners and joins the configured topics. [`Node::spawn`]
//! moves it onto a tokio task that owns the swarm; every other part of the
//! program talks to it through a cloneable [`NodeHandle`]. Commands carry
//! oneshot reply channels and events fan out over a broadcast channel.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    autonat, dcutr, gossipsub, identify,
    identity::Keypair,
    noise, ping, relay,
    swarm::{dial_opts::DialOpts, ConnectionId, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::behaviour::{NodeBehaviour, NodeBehaviourEvent, PeerStore};
use crate::bootstrap::BootstrapState;
use crate::config::NodeConfig;
use crate::discovery::{
    accept_announcement, AnnouncementError, DiscoverySource, PeerAnnouncement,
};
use crate::error::NodeError;
use crate::event::{ConnectionInfo, Direction, NodeEvent};
use crate::gate::{ConnectionGate, Denial};
use crate::identity::load_keypair;
use crate::pubsub::{greeting, GossipStats, MessageKind, PubsubMessage, WELCOME_TOPIC};
use crate::relay::{circuit_listen_addr, supports_relay_hop, ConnectionMode, RelayReservations};
use crate::status::{PeerStatus, StatusSnapshot};
use crate::transport::{relay_peer_of, with_peer_id, TransportStats, TransportType};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
/// Period for re-requesting reservations on connected relays with a free slot.
const RESERVATION_RETRY: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<T>;

/// Requests from a [`NodeHandle`] to the event loop.
enum Command {
    Dial {
        addr: Multiaddr,
        reply: Reply<Result<PeerId, NodeError>>,
    },
    Subscribe {
        topic: String,
        reply: Reply<Result<bool, NodeError>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<Result<(), NodeError>>,
    },
    Connections {
        reply: Reply<Vec<ConnectionInfo>>,
    },
    Multiaddrs {
        reply: Reply<Vec<Multiaddr>>,
    },
    Peers {
        reply: Reply<Vec<PeerId>>,
    },
    Subscribers {
        topic: String,
        reply: Reply<Vec<PeerId>>,
    },
    Status {
        reply: Reply<StatusSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
    dial_timeout: Duration,
}

impl NodeHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Subscribe to node events. Events sent before this call are not
    /// replayed; a receiver that falls behind sees `RecvError::Lagged`.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| NodeError::NotRunning)?;
        rx.await.map_err(|_| NodeError::NotRunning)
    }

    /// Dial `addr` and wait until the connection is established or fails.
    /// Failures are logged and returned; there is no retry.
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId, NodeError> {
        let shown = addr.to_string();
        let result = match tokio::time::timeout(
            self.dial_timeout,
            self.request(|reply| Command::Dial { addr, reply }),
        )
        .await
        {
            Ok(result) => result.and_then(|r| r),
            Err(_) => Err(NodeError::DialTimeout {
                addr: shown.clone(),
                secs: self.dial_timeout.as_secs(),
            }),
        };

        match &result {
            Ok(peer_id) => info!(%peer_id, addr = %shown, "Dial succeeded"),
            Err(e) => warn!(addr = %shown, error = %e, "Dial failed"),
        }
        result
    }

    /// Join a topic. Returns `false` if already subscribed.
    pub async fn subscribe(&self, topic: &str) -> Result<bool, NodeError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply })
            .await?
    }

    pub async fn publish(
        &self,
        topic: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), NodeError> {
        let topic = topic.to_string();
        let data = data.into();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await?
    }

    /// Open connections.
    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, NodeError> {
        self.request(|reply| Command::Connections { reply }).await
    }

    /// Our dialable addresses, each ending in `/p2p/<peer id>`.
    pub async fn multiaddrs(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.request(|reply| Command::Multiaddrs { reply }).await
    }

    /// Connected peers.
    pub async fn peers(&self) -> Result<Vec<PeerId>, NodeError> {
        self.request(|reply| Command::Peers { reply }).await
    }

    /// Peers known to be subscribed to `topic`.
    pub async fn subscribers(&self, topic: &str) -> Result<Vec<PeerId>, NodeError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribers { topic, reply })
            .await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, NodeError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the event loop and close every connection.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// A node and all the state its event loop owns.
pub struct Node {
    swarm: Swarm<NodeBehaviour>,
    config: NodeConfig,
    local_peer_id: PeerId,
    gate: ConnectionGate,
    discovery_topics: Vec<String>,

    command_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<NodeEvent>,

    connections: HashMap<ConnectionId, ConnectionInfo>,
    peers: PeerStore,
    pending_dials: HashMap<ConnectionId, (String, Reply<Result<PeerId, NodeError>>)>,

    bootstrap_peers: HashSet<PeerId>,
    /// Connected peers that identified as circuit relays.
    relays: HashSet<PeerId>,
    bootstrap: BootstrapState,
    reservations: RelayReservations,
    gossip: GossipStats,
}

impl Node {
    /// Build, listen, subscribe and spawn the event loop.
    pub async fn start(config: NodeConfig) -> Result<NodeHandle, NodeError> {
        let node = Self::new(config).await?;
        let handle = node.handle();
        node.spawn();
        Ok(handle)
    }

    /// Build the node without starting its event loop, so callers can
    /// subscribe to events before bootstrap begins.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let keypair = load_keypair(&config.identity)?;
        let local_peer_id = keypair.public().to_peer_id();
        info!(peer_id = %local_peer_id, "Local peer id");

        let mut swarm = build_swarm(keypair, &config).await?;

        for addr in config.enabled_listen_addrs()? {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| NodeError::Listen {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
        }

        for topic in config.all_topics() {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(topic.as_str()))
                .map_err(|e| NodeError::Subscribe {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })?;
            debug!(%topic, "Subscribed");
        }

        let discovery_topics = if config.discovery.enabled {
            config.discovery.topics.clone()
        } else {
            Vec::new()
        };

        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            swarm,
            gate: ConnectionGate::new(&config.gate, config.transports.clone()),
            reservations: RelayReservations::new(if config.transports.enable_relay {
                config.relay.discover_relays
            } else {
                0
            }),
            config,
            local_peer_id,
            discovery_topics,
            command_tx,
            commands,
            events,
            connections: HashMap::new(),
            peers: PeerStore::new(),
            pending_dials: HashMap::new(),
            bootstrap_peers: HashSet::new(),
            relays: HashSet::new(),
            bootstrap: BootstrapState::new(),
            gossip: GossipStats::default(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            peer_id: self.local_peer_id,
            commands: self.command_tx.clone(),
            events: self.events.clone(),
            dial_timeout: self.config.dial_timeout(),
        }
    }

    /// Run the event loop on a tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self) {
        self.start_bootstrap();

        let announcing = !self.discovery_topics.is_empty() && !self.config.discovery.listen_only;
        let mut discovery_tick = tokio::time::interval(self.config.discovery.interval());
        discovery_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reserving = self.reservations.capacity() > 0;
        let mut reservation_tick = tokio::time::interval(RESERVATION_RETRY);
        reservation_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        info!("Node shutting down");
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = discovery_tick.tick(), if announcing => self.announce(),
                _ = reservation_tick.tick(), if reserving => self.retry_reservations(),
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // ── Bootstrap & discovery ──────────────────────────────────────────

    fn start_bootstrap(&mut self) {
        let entries = match self.config.bootstrap.peers_by_id() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Invalid bootstrap list");
                return;
            }
        };

        self.bootstrap
            .start(entries.len(), self.config.bootstrap.min_peers);
        info!("{}", self.bootstrap.log_state());

        for (peer_id, addrs) in entries {
            self.bootstrap_peers.insert(peer_id);
            self.peers.entry(peer_id).add_addrs(addrs.iter().cloned());
            self.emit(NodeEvent::PeerDiscovered {
                peer_id,
                addrs: addrs.clone(),
                source: DiscoverySource::Bootstrap,
            });
            if !self.dial_peer(peer_id, addrs) {
                self.bootstrap.record_failure();
            }
        }
    }

    /// Publish our addresses on every discovery topic.
    fn announce(&mut self) {
        let addrs = self.self_addrs();
        if addrs.is_empty() {
            return;
        }
        let payload = PeerAnnouncement::new(&self.local_peer_id, &addrs).encode();

        for topic in &self.discovery_topics {
            let result = self
                .swarm
                .behaviour_mut()
                .gossipsub
                .publish(gossipsub::IdentTopic::new(topic.as_str()), payload.clone());
            self.gossip.record_publish(result.is_ok());
            match result {
                Ok(_) => debug!(%topic, addrs = addrs.len(), "Announced self"),
                // Expected until a peer on the topic is connected.
                Err(e) => debug!(%topic, error = %e, "Announcement not published"),
            }
        }
    }

    fn handle_announcement(&mut self, data: &[u8], source: Option<PeerId>) {
        match accept_announcement(data, source, &self.local_peer_id) {
            Ok(found) => {
                let record = self.peers.entry(found.peer_id);
                record.add_addrs(found.addrs.iter().cloned());
                record.announcements_valid += 1;
                let known_addrs = record.addrs.clone();

                debug!(peer_id = %found.peer_id, addrs = found.addrs.len(), "Peer announced");
                self.emit(NodeEvent::PeerDiscovered {
                    peer_id: found.peer_id,
                    addrs: found.addrs.clone(),
                    source: DiscoverySource::Pubsub,
                });

                if self.config.discovery.auto_dial
                    && !self.swarm.is_connected(&found.peer_id)
                    && self.connections.len() < self.config.max_connections
                {
                    self.dial_peer(found.peer_id, known_addrs);
                }
                self.prune_peers();
            }
            Err(AnnouncementError::OwnAnnouncement) => {}
            Err(e) => {
                self.gossip.announcements_rejected += 1;
                debug!(error = %e, "Dropped peer announcement");

                if let AnnouncementError::SourceMismatch { author, .. } = e {
                    let record = self.peers.entry(author);
                    record.announcements_invalid += 1;
                    if record.should_disconnect() {
                        warn!(peer_id = %author, "Disconnecting peer publishing spoofed announcements");
                        let _ = self.swarm.disconnect_peer_id(author);
                    }
                    self.prune_peers();
                }
            }
        }
    }

    /// Bound the peer store, keeping connected and bootstrap peers.
    fn prune_peers(&mut self) {
        let swarm = &self.swarm;
        let bootstrap_peers = &self.bootstrap_peers;
        let dropped = self
            .peers
            .prune(|peer| swarm.is_connected(peer) || bootstrap_peers.contains(peer));
        if dropped > 0 {
            debug!(dropped, known = self.peers.len(), "Pruned peer store");
        }
    }

    /// Dial a known peer on whichever of `addrs` the gate lets through.
    /// Returns whether a dial was started.
    fn dial_peer(&mut self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> bool {
        if self.gate.is_denied_peer(&peer_id) {
            debug!(%peer_id, "Not dialling denied peer");
            return false;
        }

        let allowed: Vec<Multiaddr> = addrs
            .into_iter()
            .filter(|addr| match self.gate.check_dial(addr) {
                Ok(()) => true,
                Err(denial) => {
                    debug!(%peer_id, %addr, %denial, "Address rejected by gate");
                    false
                }
            })
            .collect();
        if allowed.is_empty() {
            return false;
        }

        match self
            .swarm
            .dial(DialOpts::peer_id(peer_id).addresses(allowed).build())
        {
            Ok(()) => true,
            Err(e) => {
                debug!(%peer_id, error = %e, "Dial not started");
                false
            }
        }
    }

    // ── Relay ──────────────────────────────────────────────────────────

    /// Reserve a slot on `relay` using the address we reached it on.
    fn reserve_on(&mut self, relay: PeerId, advertised: &[Multiaddr]) {
        let reached_on = self
            .connections
            .values()
            .filter(|c| c.peer_id == relay && c.direction == Direction::Outbound)
            .map(|c| c.remote_addr.clone())
            .find(|a| TransportType::from_multiaddr(a) != TransportType::CircuitRelay);
        let Some(addr) = reached_on.or_else(|| {
            advertised
                .iter()
                .find(|a| {
                    TransportType::from_multiaddr(a) != TransportType::CircuitRelay
                        && self.gate.check_dial(a).is_ok()
                })
                .cloned()
        }) else {
            debug!(relay = %relay, "No usable address for relay reservation");
            return;
        };

        let circuit = circuit_listen_addr(&addr, relay);
        match self.swarm.listen_on(circuit.clone()) {
            Ok(listener) => {
                self.reservations.insert_pending(relay, listener);
                info!(relay = %relay, addr = %circuit, "Requesting relay reservation");
            }
            Err(e) => warn!(relay = %relay, error = %e, "Relay reservation failed"),
        }
    }

    /// Re-request reservations that were refused or dropped while the relay
    /// stays connected, e.g. when it had no confirmed external address yet.
    fn retry_reservations(&mut self) {
        let relays: Vec<PeerId> = self
            .relays
            .iter()
            .filter(|relay| self.reservations.wants(relay))
            .copied()
            .collect();
        for relay in relays {
            let known = self
                .peers
                .get(&relay)
                .map(|record| record.addrs.clone())
                .unwrap_or_default();
            debug!(relay = %relay, "Retrying relay reservation");
            self.reserve_on(relay, &known);
        }
    }

    // ── Swarm events ───────────────────────────────────────────────────

    fn handle_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let direction = if endpoint.is_dialer() {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                // Dials to an address without /p2p/ only learn the peer id here.
                if self.gate.is_denied_peer(&peer_id) {
                    warn!(%peer_id, ?direction, "Closing connection to denied peer");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    if let Some((addr, reply)) = self.pending_dials.remove(&connection_id) {
                        let _ = reply.send(Err(NodeError::DialDenied {
                            addr,
                            reason: Denial::DeniedPeer(peer_id).to_string(),
                        }));
                    }
                    return;
                }

                let remote_addr = endpoint.get_remote_address().clone();
                let info = ConnectionInfo {
                    peer_id,
                    transport: TransportType::from_multiaddr(&remote_addr),
                    remote_addr,
                    direction,
                };
                debug!(
                    %peer_id,
                    transport = info.transport.label(),
                    addr = %info.remote_addr,
                    "Connection established"
                );
                self.connections.insert(connection_id, info.clone());

                if let Some((_, reply)) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
                if num_established.get() == 1 && self.bootstrap_peers.contains(&peer_id) {
                    self.bootstrap.record_connected();
                    info!("{}", self.bootstrap.log_state());
                }
                self.emit(NodeEvent::ConnectionOpened(info));
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                cause,
            } => {
                // Connections to denied peers were never recorded.
                if self.connections.remove(&connection_id).is_none() {
                    return;
                }
                debug!(%peer_id, ?cause, "Connection closed");

                if num_established == 0 {
                    if self.bootstrap_peers.contains(&peer_id) {
                        self.bootstrap.record_disconnected();
                    } else {
                        self.peers.remove(&peer_id);
                    }
                    self.relays.remove(&peer_id);
                    if let Some(listener) = self.reservations.release_relay(&peer_id) {
                        info!(relay = %peer_id, "Relay disconnected, dropping reservation");
                        self.swarm.remove_listener(listener);
                    }
                }
                self.emit(NodeEvent::ConnectionClosed {
                    peer_id,
                    remote_addr: endpoint.get_remote_address().clone(),
                    cause: cause.map(|e| e.to_string()),
                });
            }

            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                if let Some((addr, reply)) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NodeError::DialFailed {
                        addr,
                        reason: error.to_string(),
                    }));
                }
                match peer_id {
                    Some(peer_id) if self.bootstrap_peers.contains(&peer_id) => {
                        if !self.swarm.is_connected(&peer_id) {
                            self.bootstrap.record_failure();
                        }
                        warn!(%peer_id, error = %error, "Bootstrap dial failed");
                        info!("{}", self.bootstrap.log_state());
                    }
                    _ => debug!(?peer_id, error = %error, "Outgoing connection failed"),
                }
            }

            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(addr = %send_back_addr, error = %error, "Incoming connection failed");
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening");
                self.emit_self_addrs();
            }

            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "Listen address expired");
                self.emit_self_addrs();
            }

            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if let Some(relay) = self.reservations.release_listener(listener_id) {
                    info!(relay = %relay, ?reason, "Relay reservation closed");
                } else {
                    debug!(?listener_id, ?reason, "Listener closed");
                }
                self.emit_self_addrs();
            }

            SwarmEvent::ListenerError { listener_id, error } => {
                debug!(?listener_id, error = %error, "Listener error");
            }

            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!(%address, "External address confirmed");
                self.emit_self_addrs();
            }

            SwarmEvent::ExternalAddrExpired { address } => {
                debug!(%address, "External address expired");
                self.emit_self_addrs();
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message_id,
                message,
            }) => {
                let topic = message.topic.as_str().to_string();
                let kind = MessageKind::from_topic(&topic, &self.discovery_topics);
                self.gossip.record_received(&kind);
                if kind == MessageKind::Discovery {
                    self.handle_announcement(&message.data, message.source);
                }

                self.emit(NodeEvent::MessageReceived(PubsubMessage {
                    topic,
                    data: message.data,
                    source: message.source,
                    propagation_source,
                    message_id: message_id.to_string(),
                }));
            }

            NodeBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                debug!(%peer_id, topic = topic.as_str(), "Peer subscribed");
                if self.config.greeting && topic.as_str() == WELCOME_TOPIC {
                    self.greet(peer_id);
                }
            }

            NodeBehaviourEvent::Gossipsub(gossipsub::Event::Unsubscribed { peer_id, topic }) => {
                debug!(%peer_id, topic = topic.as_str(), "Peer unsubscribed");
            }

            NodeBehaviourEvent::Gossipsub(_) => {}

            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(
                    %peer_id,
                    agent = %info.agent_version,
                    addrs = info.listen_addrs.len(),
                    "Identified peer"
                );

                if self.config.relay.server.enabled {
                    self.swarm.add_external_address(info.observed_addr.clone());
                }

                if supports_relay_hop(&info.protocols) {
                    self.relays.insert(peer_id);
                    if self.reservations.wants(&peer_id) {
                        self.reserve_on(peer_id, &info.listen_addrs);
                    }
                }

                let record = self.peers.entry(peer_id);
                record.add_addrs(info.listen_addrs);
                record.agent_version = Some(info.agent_version);
            }

            NodeBehaviourEvent::Identify(_) => {}

            NodeBehaviourEvent::Ping(ping::Event {
                peer,
                result: Ok(rtt),
                ..
            }) => {
                self.peers.entry(peer).record_rtt(rtt);
            }

            NodeBehaviourEvent::Ping(_) => {}

            NodeBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                self.reservations.mark_active(&relay_peer_id);
                if !renewal {
                    info!(relay = %relay_peer_id, "Relay reservation accepted");
                    self.emit(NodeEvent::RelayReservationAccepted {
                        relay: relay_peer_id,
                    });
                }
            }

            NodeBehaviourEvent::RelayClient(event) => debug!(?event, "Relay client event"),

            NodeBehaviourEvent::RelayServer(relay::Event::ReservationReqAccepted {
                src_peer_id,
                ..
            }) => {
                info!(peer_id = %src_peer_id, "Accepted reservation");
            }

            NodeBehaviourEvent::RelayServer(relay::Event::CircuitReqAccepted {
                src_peer_id,
                dst_peer_id,
                ..
            }) => {
                info!(src = %src_peer_id, dst = %dst_peer_id, "Relaying circuit");
            }

            NodeBehaviourEvent::RelayServer(event) => debug!(?event, "Relay server event"),

            NodeBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => {
                let error = result.err().map(|e| e.to_string());
                match &error {
                    None => info!(peer_id = %remote_peer_id, "Hole punch succeeded"),
                    Some(e) => debug!(peer_id = %remote_peer_id, error = %e, "Hole punch failed"),
                }
                self.emit(NodeEvent::HolePunch {
                    peer_id: remote_peer_id,
                    success: error.is_none(),
                    error,
                });
            }

            NodeBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!(?old, ?new, "NAT status changed");
            }

            NodeBehaviourEvent::Autonat(_) => {}
        }
    }

    fn greet(&mut self, peer_id: PeerId) {
        let result = self.swarm.behaviour_mut().gossipsub.publish(
            gossipsub::IdentTopic::new(WELCOME_TOPIC),
            greeting(&self.local_peer_id),
        );
        self.gossip.record_publish(result.is_ok());
        match result {
            Ok(_) => debug!(%peer_id, "Greeted peer"),
            Err(e) => debug!(%peer_id, error = %e, "Greeting not published"),
        }
    }

    // ── Commands ───────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { addr, reply } => {
                if let Err(denial) = self.gate.check_dial(&addr) {
                    let _ = reply.send(Err(NodeError::DialDenied {
                        addr: addr.to_string(),
                        reason: denial.to_string(),
                    }));
                    return;
                }
                let opts = DialOpts::from(addr.clone());
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials
                            .insert(connection_id, (addr.to_string(), reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NodeError::DialFailed {
                            addr: addr.to_string(),
                            reason: e.to_string(),
                        }));
                    }
                }
            }

            Command::Subscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&gossipsub::IdentTopic::new(topic.as_str()))
                    .map_err(|e| NodeError::Subscribe {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    });
                let _ = reply.send(result);
            }

            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(gossipsub::IdentTopic::new(topic.as_str()), data);
                self.gossip.record_publish(result.is_ok());
                let _ = reply.send(result.map(|_| ()).map_err(|e| NodeError::Publish {
                    topic,
                    reason: e.to_string(),
                }));
            }

            Command::Connections { reply } => {
                let _ = reply.send(self.connections.values().cloned().collect());
            }

            Command::Multiaddrs { reply } => {
                let _ = reply.send(self.self_addrs());
            }

            Command::Peers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }

            Command::Subscribers { topic, reply } => {
                let _ = reply.send(self.subscribers(&topic));
            }

            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }

            // Handled by the loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ── State views ────────────────────────────────────────────────────

    /// Listen and confirmed external addresses, with our peer id appended.
    fn self_addrs(&self) -> Vec<Multiaddr> {
        let mut addrs: Vec<Multiaddr> = Vec::new();
        for addr in self
            .swarm
            .listeners()
            .chain(self.swarm.external_addresses())
        {
            let addr = with_peer_id(addr, self.local_peer_id);
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }

    fn emit_self_addrs(&self) {
        self.emit(NodeEvent::SelfAddressesUpdated {
            addrs: self.self_addrs(),
        });
    }

    fn subscribers(&self, topic: &str) -> Vec<PeerId> {
        self.swarm
            .behaviour()
            .gossipsub
            .all_peers()
            .filter(|(_, topics)| topics.iter().any(|t| t.as_str() == topic))
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn snapshot(&self) -> StatusSnapshot {
        let mut connections: Vec<ConnectionInfo> = self.connections.values().cloned().collect();
        connections.sort_by_key(|c| c.peer_id.to_string());

        let transports = TransportStats::from_transports(connections.iter().map(|c| c.transport));
        let relay_peer = connections
            .iter()
            .find_map(|c| relay_peer_of(&c.remote_addr))
            .or_else(|| self.reservations.active().first().copied());
        let mode = ConnectionMode::derive(&transports, relay_peer, &self.bootstrap);

        let mut per_peer: HashMap<PeerId, usize> = HashMap::new();
        for conn in &connections {
            *per_peer.entry(conn.peer_id).or_default() += 1;
        }
        let mut peers: Vec<PeerStatus> = per_peer
            .into_iter()
            .map(|(peer_id, count)| {
                let record = self.peers.get(&peer_id);
                PeerStatus {
                    peer_id,
                    connections: count,
                    latency_ms: record.and_then(|r| r.avg_latency_ms),
                    agent_version: record.and_then(|r| r.agent_version.clone()),
                }
            })
            .collect();
        peers.sort_by_key(|p| p.peer_id.to_string());

        let mut topics: Vec<(String, usize)> = self
            .swarm
            .behaviour()
            .gossipsub
            .topics()
            .map(|t| {
                let topic = t.as_str().to_string();
                let count = self.subscribers(&topic).len();
                (topic, count)
            })
            .collect();
        topics.sort();

        StatusSnapshot {
            peer_id: self.local_peer_id,
            online: self.swarm.listeners().next().is_some(),
            connections,
            transports,
            addresses: self.self_addrs(),
            peers,
            topics,
            mode,
            bootstrap: self.bootstrap.clone(),
            gossip: self.gossip.clone(),
            reservations: self.reservations.active(),
            known_peers: self.peers.len(),
        }
    }
}

fn transport_error<E: std::fmt::Display>(e: E) -> NodeError {
    NodeError::Transport {
        reason: e.to_string(),
    }
}

/// Build the swarm with every native transport. Which ones are listened on
/// and dialled is decided by the listen addresses and the connection gate.
async fn build_swarm(
    keypair: Keypair,
    config: &NodeConfig,
) -> Result<Swarm<NodeBehaviour>, NodeError> {
    let idle_timeout = config.idle_connection_timeout();

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(transport_error)?
        .with_quic()
        .with_dns()
        .map_err(transport_error)?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(transport_error)?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(transport_error)?
        .with_behaviour(|key, relay_client| {
            NodeBehaviour::new(key, relay_client, config)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
        .map_err(transport_error)?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

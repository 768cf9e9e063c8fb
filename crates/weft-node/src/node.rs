//! The mesh node: lifecycle, handshake, peer registry, degree upkeep.
//!
//! # THE TOPOLOGY IS GOSSIP
//!
//! There is no coordinator. A node only ever *knows* its own neighbor
//! list; everything else it believes about the network arrived in a state
//! announcement and may be stale. Routing therefore runs on the effective
//! network - the subset of edges both endpoints have announced - which is
//! recomputed on every adjacency change (see [`crate::topology`]).
//!
//! # Lifecycle
//!
//! [`Node::create`] binds one TCP listener and one UDP discovery socket on
//! the same port and spawns five long-lived tasks:
//!
//! ```text
//! connection listener   accept -> handshake -> peer registered
//! solicitation listener UDP "meshage:<name>" -> solicited dial back
//! message pump          decoded frames -> router (crate::router)
//! degree maintainer     broadcast solicitations until degree met
//! periodic announcer    refresh our neighbor announcement
//! ```
//!
//! plus a read task and a write task per connected peer. Shutdown stops
//! the listeners, tears down every peer, then closes the receive and
//! error channels last.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use weft_proto::{wire, Mesh, Message};

use crate::config::{NodeConfig, ERROR_BUFFER, RECEIVE_BUFFER};
use crate::discovery::{self, MAX_BACKOFF};
use crate::error::{Error, Result};
use crate::peer::{Peer, PumpEvent};
use crate::topology;

/// Topology state guarded by the mesh lock: the gossiped adjacency claims,
/// the mutually agreed subset, and the first-hop routes derived from it.
pub(crate) struct MeshState {
    pub network: Mesh,
    pub effective: Mesh,
    pub routes: HashMap<String, String>,
}

/// A mesh overlay node.
///
/// Cheap to share: all state lives behind its own lock. Lock order when
/// nesting would ever be needed is peer map, then mesh state, then
/// sequences; the implementation never holds two of them at once, and
/// never holds the mesh lock while writing to a peer.
pub struct Node {
    pub(crate) name: String,
    degree: AtomicU32,
    port: u16,
    timeout: Duration,
    msa_timeout: AtomicU64,
    pub(crate) default_ttl: i32,
    solicit_target: SocketAddr,

    /// Live peers by name. Keys mirror our own entry in `network`.
    pub(crate) peers: Mutex<HashMap<String, Arc<Peer>>>,
    pub(crate) mesh: RwLock<MeshState>,
    /// Highest sequence seen per origin; our own entry doubles as the
    /// outbound counter.
    sequences: Mutex<HashMap<String, u64>>,
    /// Held for the whole of a solicitation campaign so only one runs.
    campaign: Mutex<()>,

    pub(crate) pump_tx: mpsc::Sender<PumpEvent>,
    receive_tx: std::sync::Mutex<Option<mpsc::Sender<Message>>>,
    errors_tx: std::sync::Mutex<Option<mpsc::Sender<Error>>>,
    errors_rx: std::sync::Mutex<Option<mpsc::Receiver<Error>>>,

    discovery: Arc<UdpSocket>,
    solicit_wake: Notify,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    peer_instances: AtomicU64,
    down: AtomicBool,
}

impl Node {
    /// Start a node: bind the TCP and UDP listeners, spawn the long-lived
    /// tasks, and return the node with its receive channel.
    ///
    /// A port already in use surfaces here; there is no recovery model for
    /// a lost listener, so callers treat this as fatal.
    pub async fn create(config: NodeConfig) -> Result<(Arc<Node>, mpsc::Receiver<Message>)> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();
        let discovery_socket = Arc::new(discovery::bind(port)?);

        let (pump_tx, pump_rx) = mpsc::channel(RECEIVE_BUFFER);
        let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);

        let mut network = Mesh::new();
        network.insert(config.name.clone(), Vec::new());
        let effective = topology::effective_network(&network);
        let routes = topology::routes_from(&config.name, &effective);

        let solicit_target = config.solicit_target(port);

        let node = Arc::new(Node {
            name: config.name,
            degree: AtomicU32::new(config.degree),
            port,
            timeout: config.timeout,
            msa_timeout: AtomicU64::new(config.msa_timeout),
            default_ttl: config.ttl,
            solicit_target,
            peers: Mutex::new(HashMap::new()),
            mesh: RwLock::new(MeshState {
                network,
                effective,
                routes,
            }),
            sequences: Mutex::new(HashMap::new()),
            campaign: Mutex::new(()),
            pump_tx,
            receive_tx: std::sync::Mutex::new(Some(receive_tx)),
            errors_tx: std::sync::Mutex::new(Some(errors_tx)),
            errors_rx: std::sync::Mutex::new(Some(errors_rx)),
            discovery: discovery_socket,
            solicit_wake: Notify::new(),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
            peer_instances: AtomicU64::new(0),
            down: AtomicBool::new(false),
        });

        info!(name = %node.name, port, "node listening");

        let tasks = vec![
            tokio::spawn(
                Arc::clone(&node).connection_listener(listener, node.shutdown_tx.subscribe()),
            ),
            tokio::spawn(Arc::clone(&node).solicitation_listener(node.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&node).message_pump(pump_rx, node.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&node).degree_maintainer(node.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&node).periodic_announcer(node.shutdown_tx.subscribe())),
        ];
        *node.tasks.lock().unwrap() = tasks;

        // Kick the first solicitation campaign; it exits immediately when
        // the degree is zero.
        node.solicit_wake.notify_one();

        Ok((node, receive_rx))
    }

    /// This node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port both listeners ended up on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Target connection count.
    pub fn degree(&self) -> u32 {
        self.degree.load(Ordering::Relaxed)
    }

    /// Change the target degree. Raising it wakes the solicitor; lowering
    /// it never severs existing peers.
    pub fn set_degree(&self, degree: u32) {
        let previous = self.degree.swap(degree, Ordering::Relaxed);
        if degree > previous {
            self.solicit_wake.notify_one();
        }
    }

    /// Period of the announcement timer, in seconds.
    pub fn msa_timeout(&self) -> u64 {
        self.msa_timeout.load(Ordering::Relaxed)
    }

    /// Set the period of the announcement timer, in seconds.
    pub fn set_msa_timeout(&self, seconds: u64) {
        self.msa_timeout.store(seconds, Ordering::Relaxed);
    }

    /// Deep copy of the effective topology: the edges both endpoints have
    /// announced, restricted to the component reachable from this node.
    pub async fn mesh(&self) -> Mesh {
        self.mesh.read().await.effective.clone()
    }

    /// Deep copy of the route table, destination to next hop. Always
    /// contains this node routing to itself.
    pub async fn routes(&self) -> HashMap<String, String> {
        self.mesh.read().await.routes.clone()
    }

    /// Sorted names of the currently connected peers.
    pub async fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The asynchronous error channel. Routing failures on in-flight
    /// traffic land here; it can be taken once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx.lock().unwrap().take()
    }

    /// Dial a specific peer, regardless of degree.
    pub async fn dial(&self, addr: impl ToSocketAddrs) -> Result<()> {
        self.dial_inner(addr, false).await
    }

    /// Send application bytes to `destination` and wait for its ack.
    ///
    /// The message is pushed through the router as if it had been received
    /// from ourselves, then the caller parks on the first-hop peer's ack
    /// channel until its id comes back or the timeout expires. An ack
    /// timeout does not mean the message was lost; delivery is
    /// at-most-once with best-effort confirmation.
    pub async fn send(&self, destination: &str, body: Vec<u8>) -> Result<()> {
        if self.down.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if destination == self.name {
            let id = self.sequence().await;
            self.deliver(Message::unicast(self.name.as_str(), destination, id, 0, body));
            return Ok(());
        }

        let first_hop = {
            let mesh = self.mesh.read().await;
            mesh.routes.get(destination).cloned()
        }
        .ok_or_else(|| Error::NoRoute(destination.to_string()))?;

        let peer = self
            .peers
            .lock()
            .await
            .get(&first_hop)
            .cloned()
            .ok_or_else(|| Error::NoRoute(destination.to_string()))?;

        // Hold the ack receiver before the message leaves, so a concurrent
        // send through the same first hop cannot consume our ack. Sends
        // sharing a first hop serialize here.
        let mut acks = peer.acks.lock().await;

        let id = self.sequence().await;
        let message = Message::unicast(
            self.name.as_str(),
            destination,
            id,
            self.default_ttl,
            body,
        );
        self.pump_tx
            .send(PumpEvent::Local(message))
            .await
            .map_err(|_| Error::Shutdown)?;

        // Anything that is not our id is a stale ack from a send that
        // already timed out; skip it.
        let deadline = Instant::now() + self.timeout;
        loop {
            match timeout_at(deadline, acks.recv()).await {
                Err(_) | Ok(None) => return Err(Error::AckTimeout(id)),
                Ok(Some(acked)) if acked == id => return Ok(()),
                Ok(Some(_)) => continue,
            }
        }
    }

    /// Flood application bytes to every reachable node. Best effort; no
    /// acks come back for broadcasts.
    pub async fn broadcast(&self, body: Vec<u8>) -> Result<()> {
        if self.down.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if self.default_ttl <= 0 {
            return Err(Error::TtlExpired {
                source: self.name.clone(),
                id: 0,
            });
        }
        let id = self.sequence().await;
        // The origin hop spends one unit of budget, like every forward.
        let message = Message::broadcast(self.name.as_str(), id, self.default_ttl - 1, body);
        self.flood(message).await;
        Ok(())
    }

    /// Stop the node: listeners first, peers second, channels last.
    pub async fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(name = %self.name, "node shutting down");
        let _ = self.shutdown_tx.send(true);

        let peers: Vec<Arc<Peer>> = {
            let mut peers = self.peers.lock().await;
            peers.drain().map(|(_, p)| p).collect()
        };
        for peer in peers {
            peer.close();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        self.receive_tx.lock().unwrap().take();
        self.errors_tx.lock().unwrap().take();
    }

    // ---- handshake and peer registry ------------------------------------

    /// Transport failures while dialing, the handshake included, count as
    /// dial failures; only a decode problem is a wire error.
    fn dial_error(e: weft_proto::WireError) -> Error {
        match e {
            weft_proto::WireError::Io(io) => Error::Dial(io),
            other => Error::Wire(other),
        }
    }

    async fn dial_inner(&self, addr: impl ToSocketAddrs, solicited: bool) -> Result<()> {
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Dial(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(Error::Dial)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let remote: String = wire::read_frame(&mut read_half)
            .await
            .map_err(Self::dial_error)?;
        let remote_solicited: bool = wire::read_frame(&mut read_half)
            .await
            .map_err(Self::dial_error)?;

        if remote == self.name {
            return Err(Error::DuplicatePeer(remote));
        }
        if solicited && !remote_solicited {
            // The remote's slots filled while our solicitation was in
            // flight; hang up without a word.
            debug!(peer = %remote, "remote no longer soliciting, hanging up");
            return Ok(());
        }

        wire::write_frame(&mut write_half, self.name.as_str())
            .await
            .map_err(Self::dial_error)?;

        debug!(peer = %remote, solicited, "handshake complete (dial side)");
        self.register_peer(remote, read_half, write_half, true).await?;
        self.originate_announcement().await;
        Ok(())
    }

    async fn handshake_inbound(&self, stream: TcpStream) -> Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();

        let solicited = {
            let peers = self.peers.lock().await;
            (peers.len() as u32) < self.degree.load(Ordering::Relaxed)
        };

        wire::write_frame(&mut write_half, self.name.as_str()).await?;
        wire::write_frame(&mut write_half, &solicited).await?;

        let remote: String = wire::read_frame(&mut read_half).await?;
        if remote == self.name {
            return Err(Error::DuplicatePeer(remote));
        }

        debug!(peer = %remote, solicited, "handshake complete (accept side)");
        self.register_peer(remote, read_half, write_half, false).await?;
        self.originate_announcement().await;
        Ok(())
    }

    /// Check-and-insert under the peer map lock. This is the only
    /// duplicate gate: every handshaken connection, dialed or accepted,
    /// lands here, and the whole accept-evict-reject decision happens
    /// atomically so no interleaving of the two sides can disagree.
    ///
    /// When both sides of a pair dial each other simultaneously, each
    /// sees two connections under one name, one per direction. Both sides
    /// keep the connection dialed by the lexicographically smaller name,
    /// so exactly one link survives and it is the same link everywhere;
    /// the loser closes with `DuplicatePeer`. A second connection in the
    /// *same* direction is a plain re-dial and is rejected, keeping the
    /// established link.
    async fn register_peer(
        &self,
        remote: String,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        dialed_by_us: bool,
    ) -> Result<()> {
        let instance = self.peer_instances.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.lock().await;

        if let Some(existing) = peers.get(&remote) {
            if existing.dialed_by_us == dialed_by_us {
                return Err(Error::DuplicatePeer(remote));
            }
            let dialer = if dialed_by_us { &self.name } else { &remote };
            if dialer != std::cmp::min(&self.name, &remote) {
                return Err(Error::DuplicatePeer(remote));
            }
            if let Some(old) = peers.remove(&remote) {
                debug!(peer = %remote, "replacing duplicate connection");
                old.close();
            }
        }

        let peer = Peer::spawn(
            remote.clone(),
            instance,
            dialed_by_us,
            read_half,
            write_half,
            self.pump_tx.clone(),
        );
        info!(peer = %remote, "peer connected");
        peers.insert(remote, peer);
        Ok(())
    }

    /// Deregister a peer whose read task ended, then re-announce and give
    /// the solicitor a chance to refill the slot.
    pub(crate) async fn drop_peer(&self, name: &str, instance: u64) {
        let removed = {
            let mut peers = self.peers.lock().await;
            match peers.get(name) {
                Some(p) if p.instance == instance => peers.remove(name),
                _ => None,
            }
        };
        if let Some(peer) = removed {
            info!(peer = %name, "peer disconnected");
            peer.close();
            self.solicit_wake.notify_one();
            self.originate_announcement().await;
        }
    }

    // ---- sequences ------------------------------------------------------

    /// Next outbound sequence number for this origin.
    pub(crate) async fn sequence(&self) -> u64 {
        let mut sequences = self.sequences.lock().await;
        let entry = sequences.entry(self.name.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Record `id` for `source` if it advances the high-water mark.
    /// Duplicates report false and must not be delivered or forwarded.
    pub(crate) async fn flood_fresh(&self, source: &str, id: u64) -> bool {
        let mut sequences = self.sequences.lock().await;
        let entry = sequences.entry(source.to_string()).or_insert(0);
        if id <= *entry {
            false
        } else {
            *entry = id;
            true
        }
    }

    // ---- channels to the application ------------------------------------

    /// Hand a message to the application. A full receive channel drops the
    /// message with a warning; the router never parks on a slow reader.
    pub(crate) fn deliver(&self, message: Message) {
        let sender = self.receive_tx.lock().unwrap().clone();
        let Some(sender) = sender else { return };
        match sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!(source = %m.source, id = m.id, "receive channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Emit an asynchronous error. Try-send: nobody draining the channel
    /// loses errors rather than wedging the router.
    pub(crate) fn emit_error(&self, error: Error) {
        let sender = self.errors_tx.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(error);
        }
    }

    /// Recompute the effective network and routes from the current claims.
    /// Only the component reachable from this node is kept; nodes we can
    /// no longer reach drop out of the effective map entirely.
    pub(crate) fn recompute_locked(&self, mesh: &mut MeshState) {
        mesh.effective = topology::effective_network(&mesh.network);
        mesh.routes = topology::routes_from(&self.name, &mesh.effective);
        let routes = &mesh.routes;
        mesh.effective.retain(|name, _| routes.contains_key(name));
    }

    // ---- long-lived tasks ----------------------------------------------

    async fn connection_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let stream = tokio::select! {
                r = listener.accept() => match r {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        stream
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                },
                _ = shutdown.changed() => return,
            };
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = node.handshake_inbound(stream).await {
                    debug!(error = %e, "inbound handshake failed");
                }
            });
        }
    }

    async fn solicitation_listener(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; 1024];
        loop {
            let (len, src) = tokio::select! {
                r = self.discovery.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "discovery recv error");
                        continue;
                    }
                },
                _ = shutdown.changed() => return,
            };
            let Some(name) = discovery::parse_solicitation(&buf[..len]) else {
                warn!(%src, "malformed discovery datagram");
                continue;
            };
            if name == self.name {
                debug!("own solicitation echoed back, ignoring");
                continue;
            }
            // The datagram came off the solicitor's bound discovery
            // socket, so its source address is the dialable mesh address.
            // A solicitor we are already linked to is rejected by the
            // registration gate, not guessed at here.
            info!(peer = %name, %src, "solicitation received, dialing back");
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = node.dial_inner(src, true).await {
                    debug!(%src, error = %e, "solicited dial failed");
                }
            });
        }
    }

    async fn degree_maintainer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.solicit_wake.notified() => {}
                _ = shutdown.changed() => return,
            }
            self.solicit_campaign(&mut shutdown).await;
            // The campaign may have consumed the shutdown change itself.
            if *shutdown.borrow() {
                return;
            }
        }
    }

    /// One solicitation campaign: broadcast, back off, repeat until the
    /// degree is met. The campaign lock keeps a single campaign active no
    /// matter how many wakeups race in. Send failures are retried on the
    /// same backoff schedule; a briefly downed interface should not leave
    /// the degree unmet forever.
    async fn solicit_campaign(&self, shutdown: &mut watch::Receiver<bool>) {
        let _active = self.campaign.lock().await;
        let mut backoff: u32 = 1;
        loop {
            let degree = self.degree.load(Ordering::Relaxed);
            if degree == 0 || self.peers.lock().await.len() as u32 >= degree {
                return;
            }
            debug!(target_degree = degree, "soliciting connections");
            let datagram = discovery::solicitation(&self.name);
            if let Err(e) = self
                .discovery
                .send_to(datagram.as_bytes(), self.solicit_target)
                .await
            {
                warn!(error = %e, "solicitation send failed");
            }
            let wait = rand::thread_rng().gen_range(0..1u64 << backoff);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                _ = shutdown.changed() => return,
            }
            if backoff < MAX_BACKOFF {
                backoff += 1;
            }
        }
    }

    async fn periodic_announcer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let period = Duration::from_secs(self.msa_timeout.load(Ordering::Relaxed).max(1));
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => return,
            }
            self.originate_announcement().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch_node(name: &str) -> (Arc<Node>, mpsc::Receiver<Message>) {
        let config = NodeConfig::new(name, 0, 0);
        Node::create(config).await.expect("node should start")
    }

    #[tokio::test]
    async fn sequences_are_monotonic() {
        let (node, _rx) = scratch_node("seq").await;

        let first = node.sequence().await;
        let second = node.sequence().await;
        assert_eq!(second, first + 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn flood_dedup_drops_stale_ids() {
        let (node, _rx) = scratch_node("dedup").await;

        assert!(node.flood_fresh("origin", 5).await);
        assert!(!node.flood_fresh("origin", 5).await);
        assert!(!node.flood_fresh("origin", 4).await);
        assert!(node.flood_fresh("origin", 6).await);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn fresh_node_routes_to_itself() {
        let (node, _rx) = scratch_node("solo").await;

        let routes = node.routes().await;
        assert_eq!(routes.get("solo"), Some(&"solo".to_string()));
        assert_eq!(routes.len(), 1);
        assert!(node.mesh().await.is_empty());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn send_without_route_fails_fast() {
        let (node, _rx) = scratch_node("lonely").await;

        let err = node.send("nowhere", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::NoRoute(dest) if dest == "nowhere"));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_self_delivers_locally() {
        let (node, mut rx) = scratch_node("me").await;

        node.send("me", b"note".to_vec()).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.source, "me");

        node.shutdown().await;
    }

    #[tokio::test]
    async fn raising_the_degree_wakes_the_solicitor() {
        let (node, _rx) = scratch_node("grow").await;

        assert_eq!(node.degree(), 0);
        node.set_degree(3);
        assert_eq!(node.degree(), 3);
        node.set_degree(1);
        assert_eq!(node.degree(), 1);

        node.shutdown().await;
    }
}

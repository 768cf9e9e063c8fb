//! Message router: the pump task and per-command handling.
//!
//! Every decoded frame, and everything this node originates, passes
//! through one pump. Unicasts hop along the route table, acks walk their
//! reverse-path plan, and floods (broadcasts and state announcements) fan
//! out to every peer not already on the message's trace, gated by
//! per-origin sequence dedup so a cycle can never re-amplify them.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use weft_proto::{Message, Payload};

use crate::error::Error;
use crate::node::Node;
use crate::peer::{Peer, PumpEvent};

impl Node {
    /// The pump task: drains inbound frames, locally originated messages,
    /// and peer teardown events. On shutdown it finishes whatever is
    /// already queued before returning.
    pub(crate) async fn message_pump(
        self: Arc<Self>,
        mut pump_rx: mpsc::Receiver<PumpEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = pump_rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => return,
                },
                _ = shutdown.changed() => {
                    while let Ok(event) = pump_rx.try_recv() {
                        self.dispatch(event).await;
                    }
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, event: PumpEvent) {
        match event {
            PumpEvent::PeerClosed { name, instance } => self.drop_peer(&name, instance).await,
            PumpEvent::Inbound { from, message } => self.route(Some(from.as_str()), message).await,
            PumpEvent::Local(message) => self.route(None, message).await,
        }
    }

    async fn route(&self, from: Option<&str>, message: Message) {
        debug!(
            command = message.payload.command(),
            source = %message.source,
            id = message.id,
            from = from.unwrap_or("local"),
            "routing message"
        );
        match &message.payload {
            Payload::StateAnnouncement(_) => self.handle_announcement(message).await,
            Payload::Ack => self.handle_ack(from, message).await,
            Payload::Unicast(_) => self.handle_unicast(message).await,
            Payload::Broadcast(_) => self.handle_broadcast(message).await,
        }
    }

    // ---- state announcements -------------------------------------------

    /// Compare our live peer list with what we last announced; on change,
    /// update our own claim and recompute. Always floods a fresh
    /// announcement, so the periodic timer keeps refreshing our sequence
    /// and late joiners catch up even when nothing changed.
    pub(crate) async fn originate_announcement(&self) {
        let mut neighbors: Vec<String> = {
            let peers = self.peers.lock().await;
            peers.keys().cloned().collect()
        };
        neighbors.sort();

        {
            let mut mesh = self.mesh.write().await;
            if mesh.network.get(&self.name) != Some(&neighbors) {
                debug!(?neighbors, "own adjacency changed, recomputing");
                mesh.network.insert(self.name.clone(), neighbors.clone());
                self.recompute_locked(&mut mesh);
            }
        }

        let id = self.sequence().await;
        let message = Message::state_announcement(self.name.as_str(), id, neighbors);
        self.flood(message).await;
    }

    /// Flooded neighbor-list update from another node: dedup by origin
    /// sequence, absorb the claim if it changed, pass the flood on.
    async fn handle_announcement(&self, message: Message) {
        if !self.flood_fresh(&message.source, message.id).await {
            debug!(source = %message.source, id = message.id, "stale announcement dropped");
            return;
        }
        let Payload::StateAnnouncement(neighbors) = &message.payload else {
            return;
        };

        {
            let mut mesh = self.mesh.write().await;
            if mesh.network.get(&message.source) != Some(neighbors) {
                debug!(source = %message.source, ?neighbors, "adjacency changed, recomputing");
                mesh.network.insert(message.source.clone(), neighbors.clone());
                self.recompute_locked(&mut mesh);
            }
        }

        self.flood(message).await;
    }

    /// Forward a flood to every peer not already on its trace, appending
    /// ourselves first. Callers gate on the origin sequence; this only
    /// fans out. Peer outboxes are never awaited while any lock is held.
    pub(crate) async fn flood(&self, mut message: Message) {
        message.note_hop(&self.name);
        let targets: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().await;
            peers
                .values()
                .filter(|p| !message.visited(&p.name))
                .cloned()
                .collect()
        };
        for peer in targets {
            peer.enqueue(message.clone());
        }
    }

    // ---- unicast --------------------------------------------------------

    async fn handle_unicast(&self, mut message: Message) {
        if message.destination.as_deref() == Some(self.name.as_str()) {
            let ack = Message::ack_for(&message, self.name.as_str());
            self.deliver(message);
            self.handle_ack(None, ack).await;
            return;
        }

        let Some(destination) = message.destination.clone() else {
            return;
        };

        // Hop budget: each forward, the origin's included, spends one.
        if message.ttl <= 0 {
            warn!(%destination, id = message.id, "unicast out of hops");
            self.emit_error(Error::TtlExpired {
                source: message.source.clone(),
                id: message.id,
            });
            return;
        }
        message.ttl -= 1;

        let next = {
            let mesh = self.mesh.read().await;
            mesh.routes.get(&destination).cloned()
        };
        let Some(next) = next else {
            debug!(%destination, "no route for unicast");
            self.emit_error(Error::NoRoute(destination));
            return;
        };

        message.note_hop(&self.name);
        self.forward(&next, message).await;
    }

    // ---- acks -----------------------------------------------------------

    /// Acks walk the reverse-path plan left in `current_route` by
    /// [`Message::ack_for`]. At the original sender the id is handed to
    /// the peer the frame arrived from, which is exactly where `send`
    /// waits. Acks are best effort: an undeliverable one is dropped and
    /// the sender times out.
    async fn handle_ack(&self, from: Option<&str>, message: Message) {
        let Some(destination) = message.destination.clone() else {
            return;
        };

        if destination == self.name {
            let Some(from) = from else { return };
            let peers = self.peers.lock().await;
            if let Some(peer) = peers.get(from) {
                peer.push_ack(message.id);
            }
            return;
        }

        // Next hop: the plan entry after us, or the plan head when we
        // originated the ack ourselves.
        let planned = {
            let route = &message.current_route;
            match route.iter().position(|h| h == &self.name) {
                Some(i) => route.get(i + 1).cloned(),
                None => route.first().cloned(),
            }
        };
        let Some(planned) = planned else { return };

        // The plan can go stale mid-convergence; fall back to the route
        // table before giving up.
        let next = if self.peers.lock().await.contains_key(&planned) {
            planned
        } else {
            match self.mesh.read().await.routes.get(&destination) {
                Some(n) => n.clone(),
                None => {
                    debug!(%destination, id = message.id, "ack undeliverable, dropping");
                    return;
                }
            }
        };

        let mut message = message;
        if message.ttl <= 0 {
            debug!(%destination, id = message.id, "ack out of hops");
            return;
        }
        message.ttl -= 1;
        self.forward(&next, message).await;
    }

    // ---- broadcast ------------------------------------------------------

    /// Broadcast ingress. The sequence gate runs before local delivery, so
    /// however many flood copies arrive over a cyclic mesh, the
    /// application sees each origin message exactly once.
    async fn handle_broadcast(&self, mut message: Message) {
        if !self.flood_fresh(&message.source, message.id).await {
            debug!(source = %message.source, id = message.id, "duplicate broadcast dropped");
            return;
        }
        self.deliver(message.clone());

        if message.ttl <= 0 {
            debug!(source = %message.source, id = message.id, "broadcast out of hops");
            return;
        }
        message.ttl -= 1;
        self.flood(message).await;
    }

    // ---- forwarding -----------------------------------------------------

    async fn forward(&self, next: &str, message: Message) {
        let peer = { self.peers.lock().await.get(next).cloned() };
        match peer {
            Some(peer) => {
                peer.enqueue(message);
            }
            None => {
                // Route table and peer map disagree for an instant around
                // a disconnect.
                if let Some(destination) = message.destination {
                    debug!(%destination, next, "next hop gone");
                    self.emit_error(Error::NoRoute(destination));
                }
            }
        }
    }
}

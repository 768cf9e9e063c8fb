//! A live peer connection.
//!
//! Each peer owns two tasks over one TCP stream: a read task decoding
//! frames into the node's message pump, and a write task draining the
//! peer's outbox. The outbox serializes concurrent senders; a full outbox
//! sheds the frame rather than stalling the router on a slow peer.
//!
//! Transport errors close only this peer. The read task's exit is the
//! single teardown signal: it posts a `PeerClosed` event and the pump
//! deregisters the peer.

use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_proto::{wire, Message};

use crate::config::RECEIVE_BUFFER;

/// Events fed to the node's message pump.
#[derive(Debug)]
pub(crate) enum PumpEvent {
    /// A frame decoded off a peer stream.
    Inbound { from: String, message: Message },
    /// A message originated by this node, routed as if received from self.
    Local(Message),
    /// A peer's read task ended; `instance` guards against tearing down a
    /// replacement connection registered under the same name.
    PeerClosed { name: String, instance: u64 },
}

/// Handle to a connected, handshaken peer.
pub(crate) struct Peer {
    pub name: String,
    /// Distinguishes connections that reused a name.
    pub instance: u64,
    /// True if this side opened the connection. The duplicate tie-break
    /// keys off the dialer's name, so each registered connection must
    /// remember its direction.
    pub dialed_by_us: bool,
    outbox: mpsc::Sender<Message>,
    ack_tx: mpsc::Sender<u64>,
    /// Taken by `send` while it waits for its ack id.
    pub acks: Mutex<mpsc::Receiver<u64>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Peer {
    /// Spawn the read and write tasks over a handshaken stream.
    pub fn spawn(
        name: String,
        instance: u64,
        dialed_by_us: bool,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        pump: mpsc::Sender<PumpEvent>,
    ) -> Arc<Peer> {
        let (outbox_tx, outbox_rx) = mpsc::channel(RECEIVE_BUFFER);
        let (ack_tx, ack_rx) = mpsc::channel(RECEIVE_BUFFER);

        let read_task = tokio::spawn(read_loop(name.clone(), instance, read_half, pump));
        let write_task = tokio::spawn(write_loop(name.clone(), write_half, outbox_rx));

        Arc::new(Peer {
            name,
            instance,
            dialed_by_us,
            outbox: outbox_tx,
            ack_tx,
            acks: Mutex::new(ack_rx),
            read_task,
            write_task,
        })
    }

    /// Queue a message for this peer. Returns false if the outbox is full
    /// or the connection is gone; the caller logs and moves on.
    pub fn enqueue(&self, message: Message) -> bool {
        match self.outbox.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!(peer = %self.name, command = m.payload.command(), "peer outbox full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Hand an ack id to whoever is waiting on this peer's ack channel.
    pub fn push_ack(&self, id: u64) {
        if self.ack_tx.try_send(id).is_err() {
            debug!(peer = %self.name, id, "ack channel full or closed, dropping ack");
        }
    }

    /// Tear down both tasks. Dropping the halves closes the socket.
    pub fn close(&self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

async fn read_loop(
    name: String,
    instance: u64,
    mut read_half: OwnedReadHalf,
    pump: mpsc::Sender<PumpEvent>,
) {
    loop {
        match wire::read_frame::<_, Message>(&mut read_half).await {
            Ok(message) => {
                let event = PumpEvent::Inbound {
                    from: name.clone(),
                    message,
                };
                if pump.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(peer = %name, error = %e, "peer stream closed");
                let _ = pump.send(PumpEvent::PeerClosed { name, instance }).await;
                return;
            }
        }
    }
}

async fn write_loop(
    name: String,
    mut write_half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Message>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = wire::write_frame(&mut write_half, &message).await {
            debug!(peer = %name, error = %e, "peer write failed");
            return;
        }
    }
}

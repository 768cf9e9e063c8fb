//! Error types for weft-node.

use std::fmt;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
///
/// Routing failures (`NoRoute`, `TtlExpired`) are also emitted
/// asynchronously on the node's error channel when they happen to in-flight
/// traffic rather than to a local caller.
///
/// Implemented by hand rather than via `#[derive(thiserror::Error)]` because
/// `TtlExpired` has a field literally named `source` that holds a `String`
/// (the originating peer id), not a `std::error::Error` — thiserror treats
/// any field named `source` as the error's source unconditionally, which
/// doesn't type-check here.
#[derive(Debug)]
pub enum Error {
    /// Dialing a peer failed at the transport level.
    Dial(std::io::Error),

    /// Already connected to the named node.
    DuplicatePeer(String),

    /// No next hop known for the destination.
    NoRoute(String),

    /// A message ran out of hops before reaching its destination.
    TtlExpired { source: String, id: u64 },

    /// The destination did not acknowledge within the send timeout.
    AckTimeout(u64),

    /// Frame codec failure on a peer stream.
    Wire(weft_proto::WireError),

    /// IO error from a listener or socket.
    Io(std::io::Error),

    /// The node has been shut down.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Dial(e) => write!(f, "dial failed: {e}"),
            Error::DuplicatePeer(id) => write!(f, "already connected to {id}"),
            Error::NoRoute(id) => write!(f, "no route to {id}"),
            Error::TtlExpired { source, id } => {
                write!(f, "ttl expired for message {id} from {source}")
            }
            Error::AckTimeout(id) => write!(f, "timed out waiting for ack of message {id}"),
            Error::Wire(e) => write!(f, "{e}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Shutdown => write!(f, "node is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Dial(e) => Some(e),
            Error::Wire(e) => e.source(),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<weft_proto::WireError> for Error {
    fn from(e: weft_proto::WireError) -> Self {
        Error::Wire(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

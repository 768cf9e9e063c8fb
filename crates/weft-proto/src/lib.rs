//! Weft Proto - Mesh Message Model and Wire Codec
//!
//! The shared protocol surface between weft nodes:
//!
//! - **Message**: the routed message record carried over every peer link,
//!   with a payload tagged by command (unicast, broadcast, ack, state
//!   announcement).
//! - **Wire**: length-prefixed, self-describing frames over any async
//!   stream. The same codec carries handshake fields and messages.
//!
//! Nothing in this crate touches a socket; `weft-node` owns all transport.

pub mod message;
pub mod wire;

pub use message::{Mesh, Message, Payload};
pub use wire::{read_frame, write_frame, WireError, MAX_FRAME_LEN};

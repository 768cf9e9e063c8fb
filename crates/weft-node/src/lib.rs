//! Weft Node - Self-Organizing Mesh Overlay
//!
//! A weft node discovers peers on its network segment by UDP broadcast,
//! maintains a target number of TCP peer connections, gossips its neighbor
//! list so every node can derive a next hop to every other node, and
//! delivers application messages over the resulting graph.
//!
//! # Architecture
//!
//! - **Node**: public facade and lifecycle; owns the listeners and tasks
//! - **Peer**: one live TCP connection with a read task and a write task
//! - **Discovery**: UDP solicitations with exponential backoff
//! - **Topology**: mutual-edge reconciliation and BFS first-hop routes
//! - **Router**: ingress demux (unicast / broadcast / ack / announcements)
//!
//! # Example
//!
//! ```no_run
//! use weft_node::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (node, mut receive) = Node::create(NodeConfig::new("alpha", 2, 9700)).await?;
//!     while let Some(message) = receive.recv().await {
//!         println!("message {} from {}", message.id, message.source);
//!     }
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
mod peer;
mod router;
pub mod topology;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::Node;
pub use weft_proto::{Mesh, Message, Payload};

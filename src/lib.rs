//! muxrpc: channel-multiplexed RPC over reliable byte streams.
//!
//! Concurrent in-flight calls share one connection by tagging every frame
//! with a small integer channel. The client peer owns a fixed-size channel
//! table; a call past the budget queues FIFO until a response frees a slot.
//! The server peer dispatches each decoded request concurrently and echoes
//! the request's channel on its response.
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │          ClientPeer          │
//!              ├──────────────────────────────┤
//!              │  channels: [Option<waiter>]  │
//!              │  queue:    VecDeque<call>    │
//!              └──────┬───────────────▲───────┘
//!        send_message │               │ decode pump
//!                     ▼               │
//!              encode + write ──► byte stream ──► Codec::decode
//!                                                     │
//!              ┌──────────────────────────────┐       │
//!              │          ServerPeer          │◄──────┘
//!              │  handle_request per frame,   │
//!              │  response on same channel    │
//!              └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! // Server
//! let server = Server::bind("127.0.0.1:9000", BinaryCodec::new, EchoService).await?;
//! tokio::spawn(server.run());
//!
//! // Client
//! let peer = ClientPeer::connect(addr, BinaryCodec::new(), PeerConfig::new()).await?;
//! let response = peer.send_message("ping", Some(Duration::from_secs(1))).await?;
//! ```

mod client;
mod codec;
mod connection;
mod error;
mod peer;
mod server;

pub use client::*;
pub use codec::*;
pub use connection::*;
pub use error::*;
pub use server::*;

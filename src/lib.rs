//! Length-prefixed, bidirectional messaging channels over stream
//! sockets.
//!
//! This crate is the I/O substrate of a cluster scheduler's messaging
//! layer. It moves opaque typed payloads ([`Envelope`]s) between
//! cooperating processes over TCP, framed as an 8-byte little-endian
//! length prefix followed by the payload bytes.
//!
//! Three pieces compose leaves-first:
//!
//! - a reactor: an event loop on a dedicated worker thread, kept alive
//!   by work-anchors while connections or operations exist;
//! - [`Channel`]: a duplex framed message pipe over one connected
//!   socket, with synchronous and asynchronous send and receive;
//! - [`MessagingAdapter`]: the process-wide façade that accepts inbound
//!   connections, keeps the resulting back-channels indexed by accept
//!   order, and opens or closes outbound channels on request.
//!
//! Higher layers hand the transport serializable payloads and receive
//! decoded payloads back; request/response semantics, payload codecs
//! and endpoint discovery all live above this crate.

pub mod adapter;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;

mod endpoint;
mod reactor;

pub use adapter::MessagingAdapter;
pub use channel::{Channel, LENGTH_PREFIX_SIZE};
pub use config::{Config, DEFAULT_MAX_FRAME_SIZE};
pub use envelope::{BytesEnvelope, Envelope};
pub use error::{Error, ErrorKind, Result};

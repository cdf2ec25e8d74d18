//! TCP/TLS stream layer for Raft peer transport
//!
//! [`TcpStreamLayer`] provides dial / accept / close / addr over a bound
//! listener. [`new_tcp_transport`] validates the advertised address before
//! any transport is built on top of it.

pub mod error;
pub mod layer;
pub mod stream;

pub use error::{TransportError, TransportResult};
pub use layer::{DEFAULT_HANDSHAKE_TIMEOUT, StreamLayer, TcpStreamLayer, new_tcp_transport};
pub use stream::{PeerStream, ServerTlsStream};

//! Network Primitives
//!
//! Duplex connections, the bidirectional relay and client-derived socket marks.

pub mod duplex;
pub mod marker;
pub mod relay;

pub use duplex::{BoxReader, BoxWriter, ConnControl, DuplexConn, TcpControl};
pub use marker::{compute_mark, Marker};
pub use relay::{relay, RelayReport};

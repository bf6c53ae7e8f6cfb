//! Reliable framed transport for a split model: one TCP connection, one peer,
//! checksum-acknowledged frames, and the rendezvous hand-off between the
//! network thread and the compute thread.

pub mod channel;
mod error;
pub mod frame;
mod relay;
pub mod rendezvous;

pub use channel::{Acceptor, ChannelConfig, ChannelMetrics, ReliableChannel};
pub use error::{CommsErr, Result};
pub use relay::relay;

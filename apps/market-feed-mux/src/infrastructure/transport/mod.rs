//! Transport Adapters
//!
//! Implementations of the `Transport` port.

mod loopback;

pub use loopback::{LoopbackTransport, SentMessage};

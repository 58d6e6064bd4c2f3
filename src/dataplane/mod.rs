//! Shared data-plane primitives: packet buffers and the IP-in-IP codec.

pub mod buffer;
pub mod ipip;

pub use buffer::{BufferPool, PktBuf, PktPools, BUFFER_SIZE, HEADROOM, MAX_PKT};
pub use ipip::{decapsulate, encapsulate, IpFlow, TunnelInfo};

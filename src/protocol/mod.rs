//! Protocol module - Wire formats spoken by the AMF sidecars
//!
//! Two length-prefixed framings exist side by side and are never mixed on
//! one connection:
//! - Varint framing: base-128 varint length, then payload (health server,
//!   registration client)
//! - Fixed32 framing: 4 bytes little-endian length, then payload (cnode
//!   client)
//!
//! Payloads are tiny hand-encoded protobuf messages with fixed shapes.

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Node class announced by this network function (AMF)
pub const NODE_TYPE_AMF: u64 = 13;

/// Default TCP port of the health server
pub const DEFAULT_HEALTH_PORT: u16 = 50051;

/// Default TCP port of the cnode server
pub const DEFAULT_CNODE_PORT: u16 = 9090;

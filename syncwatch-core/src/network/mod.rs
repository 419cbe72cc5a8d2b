//! P2P Networking
//!
//! A WebSocket link to the session registry for membership and signaling,
//! plus a WebRTC data-channel mesh for peer-to-peer sync traffic.

mod mesh;
mod signaling;
mod topology;

pub use mesh::{should_initiate, LinkState, MeshState};
pub use signaling::{
    RelayedSignal, SignalMessage, SignalingClient, SignalingEvent, SignalingHandle, PASSWORD_REQUIRED,
};
pub use topology::{NetworkConfig, NetworkError, TopologyEvent, TopologyHandle, TopologyManager};

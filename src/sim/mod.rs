//! Deterministic network simulation: per-link capacity, delay, jitter and
//! loss models, addressable endpoints, multi-hop routes and synthetic cross
//! traffic. Everything runs in simulated time.

mod cross_traffic;
mod endpoint;
mod network;

pub use cross_traffic::{
    PulsedPeaksConfig, PulsedPeaksCrossTraffic, RandomWalkConfig, RandomWalkCrossTraffic,
};
pub use endpoint::{
    EmulatedEndpoint, EmulatedPacket, EndpointAddr, EndpointId, NetworkEmulator, NodeId,
    ReceiverFn, RouteId,
};
pub use network::{
    DeliveredPacket, NetworkConfig, PacketInFlight, SimulatedNetwork,
};

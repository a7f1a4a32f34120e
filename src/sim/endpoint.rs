//! Addressable endpoints and multi-hop routes over simulated links.

use std::collections::HashMap;

use crate::units::{DataSize, Timestamp};

use super::network::{DeliveredPacket, NetworkConfig, PacketInFlight, SimulatedNetwork};

/// IP-and-port address of an endpoint socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
    pub ip: u32,
    pub port: u16,
}

/// A packet as seen by a receiving endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EmulatedPacket {
    pub from: EndpointAddr,
    pub to: EndpointAddr,
    pub size: DataSize,
    /// Id assigned at send time; carries the payload identity across hops.
    pub id: u64,
    pub send_time: Timestamp,
    pub arrival_time: Timestamp,
}

pub type ReceiverFn = Box<dyn FnMut(EmulatedPacket) + Send>;

/// An endpoint with a table of bound ports.
pub struct EmulatedEndpoint {
    ip: u32,
    next_port: u16,
    receivers: HashMap<u16, ReceiverFn>,
}

impl EmulatedEndpoint {
    fn new(ip: u32) -> Self {
        Self {
            ip,
            next_port: 49152,
            receivers: HashMap::new(),
        }
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    /// Binds a receiver. With `port` of `None` the next ephemeral port is
    /// used. Returns the bound port.
    pub fn bind_receiver(&mut self, port: Option<u16>, receiver: ReceiverFn) -> u16 {
        let port = port.unwrap_or_else(|| {
            while self.receivers.contains_key(&self.next_port) {
                self.next_port = self.next_port.wrapping_add(1);
            }
            self.next_port
        });
        self.receivers.insert(port, receiver);
        port
    }

    pub fn unbind_receiver(&mut self, port: u16) {
        self.receivers.remove(&port);
    }

    fn deliver(&mut self, packet: EmulatedPacket) {
        match self.receivers.get_mut(&packet.to.port) {
            Some(receiver) => receiver(packet),
            None => {
                tracing::debug!(port = packet.to.port, "packet to unbound port dropped");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(usize);

struct RouteSpec {
    hops: Vec<usize>,
    dest: usize,
}

struct FlightMeta {
    route: usize,
    hop_index: usize,
    from: EndpointAddr,
    to: EndpointAddr,
    size: DataSize,
    send_time: Timestamp,
}

/// Owns the nodes, endpoints and routes of one emulated network and moves
/// packets between them as time advances.
///
/// Removing a route lets packets already inside it finish the hop they are
/// on; when they exit they have nowhere to go and are dropped.
#[derive(Default)]
pub struct NetworkEmulator {
    nodes: Vec<SimulatedNetwork>,
    endpoints: Vec<EmulatedEndpoint>,
    routes: Vec<Option<RouteSpec>>,
    in_flight: HashMap<u64, FlightMeta>,
    next_packet_id: u64,
}

impl NetworkEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, config: NetworkConfig, seed: u64) -> NodeId {
        self.nodes.push(SimulatedNetwork::new(config, seed));
        NodeId(self.nodes.len() - 1)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SimulatedNetwork {
        &mut self.nodes[id.0]
    }

    pub fn add_endpoint(&mut self, ip: u32) -> EndpointId {
        self.endpoints.push(EmulatedEndpoint::new(ip));
        EndpointId(self.endpoints.len() - 1)
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> &mut EmulatedEndpoint {
        &mut self.endpoints[id.0]
    }

    /// Creates a route traversing `hops` in order and terminating at `dest`.
    pub fn add_route(&mut self, hops: Vec<NodeId>, dest: EndpointId) -> RouteId {
        assert!(!hops.is_empty(), "a route needs at least one node");
        self.routes.push(Some(RouteSpec {
            hops: hops.into_iter().map(|n| n.0).collect(),
            dest: dest.0,
        }));
        RouteId(self.routes.len() - 1)
    }

    /// Removes a route. Packets in flight finish their current hop and are
    /// then dropped.
    pub fn remove_route(&mut self, route: RouteId) {
        self.routes[route.0] = None;
    }

    /// Injects a packet at the head of `route`. Returns the packet id, or
    /// `None` when the first hop's queue rejected it.
    pub fn send(
        &mut self,
        route: RouteId,
        from: EndpointAddr,
        to: EndpointAddr,
        size: DataSize,
        now: Timestamp,
    ) -> Option<u64> {
        let spec = self.routes[route.0].as_ref()?;
        let first_hop = spec.hops[0];
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        let accepted = self.nodes[first_hop].enqueue(PacketInFlight {
            id,
            size,
            send_time: now,
        });
        if !accepted {
            tracing::debug!(id, "first hop queue full, packet dropped at send");
            return None;
        }
        self.in_flight.insert(
            id,
            FlightMeta {
                route: route.0,
                hop_index: 0,
                from,
                to,
                size,
                send_time: now,
            },
        );
        Some(id)
    }

    /// Moves every deliverable packet one step forward: into the next hop,
    /// or to its destination endpoint.
    pub fn process(&mut self, now: Timestamp) {
        for node_index in 0..self.nodes.len() {
            let delivered = self.nodes[node_index].dequeue_deliverable(now);
            for DeliveredPacket {
                packet,
                arrival_time,
            } in delivered
            {
                let Some(meta) = self.in_flight.remove(&packet.id) else {
                    continue;
                };
                let Some(arrival_time) = arrival_time else {
                    // Lost on the link.
                    continue;
                };
                let Some(route) = self.routes[meta.route].as_ref() else {
                    // Route was removed while the packet was in flight.
                    continue;
                };
                let next_hop = meta.hop_index + 1;
                if next_hop < route.hops.len() {
                    let next_node = route.hops[next_hop];
                    let accepted = self.nodes[next_node].enqueue(PacketInFlight {
                        id: packet.id,
                        size: meta.size,
                        send_time: arrival_time,
                    });
                    if accepted {
                        self.in_flight.insert(
                            packet.id,
                            FlightMeta {
                                hop_index: next_hop,
                                ..meta
                            },
                        );
                    }
                } else {
                    let dest = route.dest;
                    self.endpoints[dest].deliver(EmulatedPacket {
                        from: meta.from,
                        to: meta.to,
                        size: meta.size,
                        id: packet.id,
                        send_time: meta.send_time,
                        arrival_time,
                    });
                }
            }
        }
    }
}

use std::fmt;
use std::net::Ipv6Addr;

use crate::protocol::MESH_LOCAL_PREFIX_LEN;

/// One `key[=value]` entry of a DNS TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Encoded as the bare key, without `=`
    pub is_boolean: bool,
}

impl TxtEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_boolean: false,
        }
    }

    pub fn boolean(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            is_boolean: true,
        }
    }
}

/// A service registered with the mesh-side registration server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrpService {
    /// Full instance name, e.g. "printer._ipp._tcp.default.service.arpa."
    pub instance_full_name: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    /// Raw TXT RDATA
    pub txt_data: Vec<u8>,
    /// Sub-type labels, e.g. ["_color"]
    pub sub_type_labels: Vec<String>,
    pub deleted: bool,
}

/// A host registered with the mesh-side registration server, with its services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrpHost {
    /// Full host name, e.g. "node1.default.service.arpa."
    pub full_name: String,
    pub addresses: Vec<Ipv6Addr>,
    pub deleted: bool,
    pub services: Vec<SrpService>,
}

/// A service instance reported by the discovery publisher.
///
/// `name` is the bare instance label; `host_name` is a full name ending in a dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredInstanceInfo {
    pub name: String,
    pub host_name: String,
    pub addresses: Vec<Ipv6Addr>,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub txt_data: Vec<u8>,
    pub ttl: u32,
}

/// A host reported by the discovery publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredHostInfo {
    pub host_name: String,
    pub addresses: Vec<Ipv6Addr>,
    pub ttl: u32,
}

/// A discovered service instance as delivered to the coprocessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInstanceInfo {
    pub full_name: String,
    pub host_name: String,
    pub addresses: Vec<Ipv6Addr>,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub txt_data: Vec<u8>,
    pub ttl: u32,
}

/// A discovered host as delivered to the coprocessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub addresses: Vec<Ipv6Addr>,
    pub ttl: u32,
}

/// Thread device role as last reported by the coprocessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceRole {
    #[default]
    Disabled,
    Detached,
    Child,
    Router,
    Leader,
}

impl DeviceRole {
    pub fn is_attached(&self) -> bool {
        matches!(self, DeviceRole::Child | DeviceRole::Router | DeviceRole::Leader)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceRole::Disabled => "disabled",
            DeviceRole::Detached => "detached",
            DeviceRole::Child => "child",
            DeviceRole::Router => "router",
            DeviceRole::Leader => "leader",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneRouterState {
    Disabled,
    Secondary,
    Primary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastListenerEvent {
    Added,
    Removed,
}

/// An entry of the coprocessor's unicast address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ip6AddressInfo {
    pub address: Ipv6Addr,
    pub prefix_length: u8,
    pub preferred: bool,
}

/// The /64 mesh-local prefix of the Thread network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshLocalPrefix(pub [u8; MESH_LOCAL_PREFIX_LEN]);

impl MeshLocalPrefix {
    pub fn contains(&self, address: &Ipv6Addr) -> bool {
        address.octets()[..MESH_LOCAL_PREFIX_LEN] == self.0
    }
}

impl fmt::Display for MeshLocalPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut octets = [0u8; 16];
        octets[..MESH_LOCAL_PREFIX_LEN].copy_from_slice(&self.0);
        write!(f, "{}/64", Ipv6Addr::from(octets))
    }
}

pub mod device;
pub mod hdlc;
pub mod ncp_spinel;
pub mod spinel;

use std::net::Ipv6Addr;
use std::time::Duration;

use shared::types::{
    BackboneRouterState, DeviceRole, HostInfo, Ip6AddressInfo, MeshLocalPrefix,
    MulticastListenerEvent, ServiceInstanceInfo, SrpHost,
};
use shared::Result;

/// Something the coprocessor told us without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum NcpEvent {
    SrpServiceUpdate {
        id: u32,
        host: SrpHost,
        timeout: Duration,
    },
    DnssdSubscribe(String),
    DnssdUnsubscribe(String),
    BackboneRouterState(BackboneRouterState),
    MulticastListener(MulticastListenerEvent, Ipv6Addr),
    RoleChanged(DeviceRole),
    NetifStateChanged(bool),
    Ip6AddressTable(Vec<Ip6AddressInfo>),
    Ip6MulticastAddressTable(Vec<Ipv6Addr>),
    Ip6Receive(Vec<u8>),
}

/// Sink for encoded spinel frames.
pub trait SpinelInterface {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// Last-known network state, readable without a round trip.
pub trait NetworkProperties {
    fn device_role(&self) -> DeviceRole;
    fn active_dataset_tlvs(&self) -> &[u8];
    fn mesh_local_prefix(&self) -> Option<MeshLocalPrefix>;
}

/// The coprocessor's service registration server.
pub trait SrpServer: NetworkProperties {
    /// Report the outcome of one service update. Called once per update id.
    fn handle_service_update_result(&mut self, id: u32, result: Result<()>);

    /// Hosts currently registered, for a full re-publish.
    fn hosts(&self) -> Vec<SrpHost>;
}

/// The coprocessor's DNS-SD query server.
pub trait DnssdQuery {
    fn handle_discovered_service_instance(
        &mut self,
        service_full_name: &str,
        info: &ServiceInstanceInfo,
    );

    fn handle_discovered_host(&mut self, host_full_name: &str, info: &HostInfo);
}

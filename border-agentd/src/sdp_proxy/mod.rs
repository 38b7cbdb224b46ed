//! Service discovery proxies between the mesh and the infrastructure link.

pub mod advertising_proxy;
pub mod discovery_proxy;

pub use advertising_proxy::AdvertisingProxy;
pub use discovery_proxy::DiscoveryProxy;

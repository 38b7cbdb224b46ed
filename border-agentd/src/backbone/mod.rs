//! Backbone router support: multicast forwarding across the Thread and
//! infrastructure interfaces.

pub mod mcast_routing;
pub mod mrt6;

pub use mcast_routing::MulticastRoutingManager;

//! The agent event loop: everything coprocessor-, publisher- and
//! kernel-facing runs here, one event at a time.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use shared::types::MulticastListenerEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backbone::mcast_routing::Upcall;
use crate::backbone::MulticastRoutingManager;
use crate::config::Config;
use crate::mdns::{Publisher, PublisherEvent};
use crate::ncp::ncp_spinel::NcpSpinel;
use crate::ncp::{NcpEvent, NetworkProperties};
use crate::sdp_proxy::{AdvertisingProxy, DiscoveryProxy};

/// Upper bound on the detach handshake at shutdown.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Agent<P: Publisher> {
    ncp: NcpSpinel,
    publisher: P,
    advertising: AdvertisingProxy,
    discovery: DiscoveryProxy,
    multicast: Option<MulticastRoutingManager>,
    /// Sent to the leader on the first attach, then cleared
    pending_dataset: Option<Vec<u8>>,
    leave_on_shutdown: bool,
}

impl<P: Publisher> Agent<P> {
    pub fn new(
        config: &Config,
        ncp: NcpSpinel,
        publisher: P,
        multicast: Option<MulticastRoutingManager>,
    ) -> Result<Self> {
        let mut advertising = AdvertisingProxy::new();
        advertising.set_enabled(config.advertising.enabled);
        let mut discovery = DiscoveryProxy::new();
        if config.discovery.enabled {
            discovery.start();
        }

        tracing::info!(
            "Advertising proxy {}, discovery proxy {}, multicast routing {}",
            on_off(advertising.is_enabled()),
            on_off(discovery.is_enabled()),
            on_off(multicast.is_some()),
        );

        Ok(Self {
            ncp,
            publisher,
            advertising,
            discovery,
            multicast,
            pending_dataset: config.ncp.pending_dataset_tlvs()?,
            leave_on_shutdown: config.ncp.leave_on_shutdown,
        })
    }

    pub fn ncp_mut(&mut self) -> &mut NcpSpinel {
        &mut self.ncp
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    /// Run until cancelled. Returns an error when the radio goes away or
    /// the multicast router cannot be set up.
    pub async fn run(
        &mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut publisher_events: mpsc::UnboundedReceiver<PublisherEvent>,
        expire_interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut expire_tick = tokio::time::interval(expire_interval);

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        bail!("Radio device closed");
                    };
                    if let Some(event) = self.ncp.handle_frame(&frame) {
                        self.handle_ncp_event(event)?;
                    }
                }
                Some(event) = publisher_events.recv() => {
                    self.handle_publisher_event(event);
                }
                upcall = next_upcall(&mut self.multicast) => {
                    let prefix = self.ncp.mesh_local_prefix();
                    if let Some(multicast) = self.multicast.as_mut() {
                        multicast.process_upcall(upcall, prefix.as_ref(), Instant::now());
                    }
                }
                _ = expire_tick.tick() => {
                    if let Some(multicast) = self.multicast.as_mut() {
                        multicast.handle_tick(Instant::now());
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Agent loop shutting down");
                    break;
                }
            }
        }

        self.discovery.stop(&mut self.publisher);
        self.advertising.set_enabled(false);
        if self.leave_on_shutdown {
            self.leave_network(&mut frames).await;
        }
        Ok(())
    }

    /// Detach and erase the network state, pumping radio frames until the
    /// coprocessor confirms or `LEAVE_TIMEOUT` passes.
    async fn leave_network(&mut self, frames: &mut mpsc::Receiver<Vec<u8>>) {
        let done = Rc::new(Cell::new(false));
        let finished = done.clone();
        self.ncp.leave(move |result| {
            match result {
                Ok(()) => tracing::info!("Left Thread network"),
                Err(e) => tracing::error!("Failed to leave Thread network: {}", e),
            }
            finished.set(true);
        });

        let ncp = &mut self.ncp;
        let pump = async {
            while !done.get() {
                let Some(frame) = frames.recv().await else {
                    tracing::warn!("Radio closed while leaving network");
                    return;
                };
                if let Some(event) = ncp.handle_frame(&frame) {
                    tracing::debug!("Ignoring {:?} while leaving network", event);
                }
            }
        };
        if tokio::time::timeout(LEAVE_TIMEOUT, pump).await.is_err() {
            tracing::warn!("Timed out leaving Thread network");
        }
    }

    pub fn handle_ncp_event(&mut self, event: NcpEvent) -> Result<()> {
        match event {
            NcpEvent::SrpServiceUpdate { id, host, timeout } => {
                self.advertising
                    .handle_service_update(id, &host, timeout, &mut self.ncp, &mut self.publisher);
            }
            NcpEvent::DnssdSubscribe(name) => self.discovery.subscribe(&name, &mut self.publisher),
            NcpEvent::DnssdUnsubscribe(name) => self.discovery.unsubscribe(&name, &mut self.publisher),
            NcpEvent::BackboneRouterState(state) => match self.multicast.as_mut() {
                Some(multicast) => multicast.handle_state_change(state)?,
                None => tracing::debug!("Multicast routing not configured, ignoring state {:?}", state),
            },
            NcpEvent::MulticastListener(event, group) => {
                // mirror the group on the Thread interface so forwarded traffic is delivered
                let added = event == MulticastListenerEvent::Added;
                if let Err(e) = self.ncp.ip6_update_multicast_subscription(&group, added) {
                    tracing::warn!("Failed to update subscription for {}: {}", group, e);
                }
                if let Some(multicast) = self.multicast.as_mut() {
                    multicast.handle_listener_event(event, group, Instant::now());
                }
            }
            NcpEvent::RoleChanged(_) => self.handle_role_change(),
            NcpEvent::NetifStateChanged(up) => {
                tracing::info!("Thread interface {}", if up { "up" } else { "down" })
            }
            NcpEvent::Ip6AddressTable(table) => {
                tracing::debug!("Thread unicast addresses: {:?}", table)
            }
            NcpEvent::Ip6MulticastAddressTable(table) => {
                tracing::debug!("Thread multicast addresses: {:?}", table)
            }
            NcpEvent::Ip6Receive(packet) => tracing::debug!("Received {} byte IPv6 datagram", packet.len()),
        }
        Ok(())
    }

    fn handle_role_change(&mut self) {
        let role = self.ncp.device_role();
        if !role.is_attached() {
            tracing::info!("Device role is now {}", role);
            return;
        }

        tracing::info!(
            "Attached as {} ({} byte active dataset)",
            role,
            self.ncp.active_dataset_tlvs().len()
        );
        if let Some(tlvs) = self.pending_dataset.take() {
            tracing::info!("Scheduling migration to configured pending dataset");
            self.ncp.schedule_migration(tlvs, |result| match result {
                Ok(()) => tracing::info!("Pending dataset accepted by the leader"),
                Err(e) => tracing::error!("Failed to schedule migration: {}", e),
            });
        }
    }

    pub fn handle_publisher_event(&mut self, event: PublisherEvent) {
        match event {
            PublisherEvent::StateChanged(state) => {
                tracing::info!("Publisher state changed to {:?}", state);
                self.advertising
                    .handle_publisher_state(state, &mut self.ncp, &mut self.publisher);
            }
            PublisherEvent::ServicePublished { name, service_type, result } => {
                self.advertising
                    .handle_service_published(&name, &service_type, result, &mut self.ncp);
            }
            PublisherEvent::HostPublished { name, result } => {
                self.advertising.handle_host_published(&name, result, &mut self.ncp);
            }
            PublisherEvent::ServiceDiscovered { service_type, instance } => {
                self.discovery
                    .handle_service_discovered(&service_type, &instance, &mut self.ncp);
            }
            PublisherEvent::HostDiscovered { host_name, host } => {
                self.discovery.handle_host_discovered(&host_name, &host, &mut self.ncp);
            }
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

async fn next_upcall(multicast: &mut Option<MulticastRoutingManager>) -> Upcall {
    match multicast {
        Some(multicast) => multicast.next_upcall().await,
        None => std::future::pending().await,
    }
}

pub mod advertise;
pub mod browser;

use std::net::Ipv6Addr;

use mdns_sd::ServiceDaemon;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shared::types::{DiscoveredHostInfo, DiscoveredInstanceInfo, TxtEntry};
use shared::Result;

use self::advertise::Advertiser;
use self::browser::BrowserHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Idle,
    Ready,
}

/// Asynchronous output of a publisher, delivered on the agent's channel.
#[derive(Debug)]
pub enum PublisherEvent {
    StateChanged(PublisherState),
    ServicePublished {
        name: String,
        service_type: String,
        result: Result<()>,
    },
    HostPublished {
        name: String,
        result: Result<()>,
    },
    ServiceDiscovered {
        service_type: String,
        instance: DiscoveredInstanceInfo,
    },
    HostDiscovered {
        host_name: String,
        host: DiscoveredHostInfo,
    },
}

/// Local service discovery, as used by the SRP and DNS-SD proxies.
///
/// Publishing returns synchronously whether the request was accepted. An
/// accepted publish later reports its outcome as a `ServicePublished` or
/// `HostPublished` event; unpublishing has no completion event.
pub trait Publisher {
    fn publish_service(
        &mut self,
        host_name: &str,
        name: &str,
        service_type: &str,
        sub_types: &[String],
        port: u16,
        txt: &[TxtEntry],
    ) -> Result<()>;

    fn unpublish_service(&mut self, name: &str, service_type: &str) -> Result<()>;

    fn publish_host(&mut self, name: &str, addresses: &[Ipv6Addr]) -> Result<()>;

    fn unpublish_host(&mut self, name: &str) -> Result<()>;

    /// An empty `instance_name` browses the whole service type.
    fn subscribe_service(&mut self, service_type: &str, instance_name: &str);

    fn unsubscribe_service(&mut self, service_type: &str, instance_name: &str);

    fn subscribe_host(&mut self, host_name: &str);

    fn unsubscribe_host(&mut self, host_name: &str);
}

/// Publisher backed by the mdns-sd daemon.
pub struct MdnsPublisher {
    advertiser: Advertiser,
    browser: BrowserHandle,
}

impl MdnsPublisher {
    /// Start the browser task and announce the publisher as ready.
    pub fn start(
        daemon: ServiceDaemon,
        events: mpsc::UnboundedSender<PublisherEvent>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (browser, browser_task) = browser::spawn(daemon.clone(), events.clone(), cancel);
        let advertiser = Advertiser::new(daemon, events.clone());

        if events
            .send(PublisherEvent::StateChanged(PublisherState::Ready))
            .is_err()
        {
            tracing::warn!("Publisher event receiver dropped before start");
        }

        (Self { advertiser, browser }, browser_task)
    }

    /// Withdraw everything this publisher registered.
    pub fn shutdown(&mut self) {
        self.advertiser.unregister_all();
    }
}

impl Publisher for MdnsPublisher {
    fn publish_service(
        &mut self,
        host_name: &str,
        name: &str,
        service_type: &str,
        sub_types: &[String],
        port: u16,
        txt: &[TxtEntry],
    ) -> Result<()> {
        self.advertiser
            .publish_service(host_name, name, service_type, sub_types, port, txt)
    }

    fn unpublish_service(&mut self, name: &str, service_type: &str) -> Result<()> {
        self.advertiser.unpublish_service(name, service_type)
    }

    fn publish_host(&mut self, name: &str, addresses: &[Ipv6Addr]) -> Result<()> {
        self.advertiser.publish_host(name, addresses)
    }

    fn unpublish_host(&mut self, name: &str) -> Result<()> {
        self.advertiser.unpublish_host(name)
    }

    fn subscribe_service(&mut self, service_type: &str, instance_name: &str) {
        self.browser.subscribe_service(service_type, instance_name);
    }

    fn unsubscribe_service(&mut self, service_type: &str, instance_name: &str) {
        self.browser.unsubscribe_service(service_type, instance_name);
    }

    fn subscribe_host(&mut self, host_name: &str) {
        self.browser.subscribe_host(host_name);
    }

    fn unsubscribe_host(&mut self, host_name: &str) {
        self.browser.unsubscribe_host(host_name);
    }
}

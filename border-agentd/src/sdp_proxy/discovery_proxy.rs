//! Discovery proxy: answers the coprocessor's DNS-SD queries from mDNS.

use std::net::Ipv6Addr;

use shared::dns::{split_full_dns_name, split_full_host_name, DnsNameInfo, DnsNameType};
use shared::ip6::is_link_local;
use shared::protocol::{LOCAL_DOMAIN, SERVICE_TTL_CAP_LIMIT};
use shared::types::{DiscoveredHostInfo, DiscoveredInstanceInfo, HostInfo, ServiceInstanceInfo};
use shared::Error;

use crate::mdns::Publisher;
use crate::ncp::DnssdQuery;

#[derive(Debug, Clone, PartialEq, Eq)]
struct MdnsSubscription {
    instance_name: String,
    service_name: String,
    host_name: String,
    domain: String,
    count: usize,
}

impl MdnsSubscription {
    fn new(info: DnsNameInfo) -> Self {
        Self {
            instance_name: info.instance_name,
            service_name: info.service_name,
            host_name: info.host_name,
            domain: info.domain,
            count: 1,
        }
    }

    fn matches(&self, info: &DnsNameInfo) -> bool {
        self.same_target(info) && self.domain == info.domain
    }

    /// Same mDNS query, whatever domain it was asked in.
    fn same_target(&self, info: &DnsNameInfo) -> bool {
        self.instance_name == info.instance_name
            && self.service_name == info.service_name
            && self.host_name == info.host_name
    }

    fn matches_service(&self, service_type: &str, instance_name: &str) -> bool {
        self.service_name.eq_ignore_ascii_case(service_type)
            && (self.instance_name.is_empty() || self.instance_name.eq_ignore_ascii_case(instance_name))
    }

    fn matches_host(&self, host_name: &str) -> bool {
        !self.host_name.is_empty() && self.host_name.eq_ignore_ascii_case(host_name)
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryProxy {
    enabled: bool,
    subscriptions: Vec<MdnsSubscription>,
}

impl DiscoveryProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn start(&mut self) {
        if !self.enabled {
            self.enabled = true;
            tracing::info!("Discovery proxy started");
        }
    }

    /// Drop every subscription, releasing the matching mDNS queries.
    pub fn stop(&mut self, publisher: &mut dyn Publisher) {
        if !self.enabled {
            return;
        }
        self.enabled = false;

        let mut released: Vec<DnsNameInfo> = Vec::new();
        for sub in self.subscriptions.drain(..) {
            let info = DnsNameInfo {
                instance_name: sub.instance_name,
                service_name: sub.service_name,
                host_name: sub.host_name,
                domain: sub.domain,
            };
            if !released.iter().any(|r| {
                r.instance_name == info.instance_name
                    && r.service_name == info.service_name
                    && r.host_name == info.host_name
            }) {
                unsubscribe_publisher(&info, publisher);
                released.push(info);
            }
        }
        tracing::info!("Discovery proxy stopped");
    }

    pub fn subscribe(&mut self, full_name: &str, publisher: &mut dyn Publisher) {
        if !self.enabled {
            return;
        }

        let info = split_full_dns_name(full_name);
        if info.name_type() == DnsNameType::Unknown {
            tracing::warn!("Failed to subscribe {}: {}", full_name, Error::NotImplemented);
            return;
        }

        match self.subscriptions.iter_mut().find(|sub| sub.matches(&info)) {
            Some(sub) => {
                sub.count += 1;
                tracing::debug!("Subscription {} now has {} subscribers", full_name, sub.count);
            }
            None => self.subscriptions.push(MdnsSubscription::new(info.clone())),
        }

        if self.target_count(&info) == 1 {
            tracing::info!("Subscribing mDNS for {}", full_name);
            subscribe_publisher(&info, publisher);
        }
    }

    pub fn unsubscribe(&mut self, full_name: &str, publisher: &mut dyn Publisher) {
        if !self.enabled {
            return;
        }

        let info = split_full_dns_name(full_name);
        let Some(pos) = self.subscriptions.iter().position(|sub| sub.matches(&info)) else {
            tracing::warn!("Failed to unsubscribe {}: {}", full_name, Error::NotFound);
            return;
        };

        let sub = &mut self.subscriptions[pos];
        debug_assert!(sub.count > 0);
        sub.count -= 1;
        if sub.count == 0 {
            self.subscriptions.remove(pos);
        }

        if self.target_count(&info) == 0 {
            tracing::info!("Unsubscribing mDNS for {}", full_name);
            unsubscribe_publisher(&info, publisher);
        }
    }

    /// Forward a discovered instance once per matching subscription, in
    /// that subscription's domain.
    pub fn handle_service_discovered(
        &self,
        service_type: &str,
        instance: &DiscoveredInstanceInfo,
        dnssd: &mut dyn DnssdQuery,
    ) {
        debug_assert!(service_type.matches('.').count() == 1 && !service_type.ends_with('.'));
        debug_assert!(instance.host_name.is_empty() || instance.host_name.ends_with('.'));
        if !self.enabled {
            return;
        }

        for sub in self
            .subscriptions
            .iter()
            .filter(|sub| sub.matches_service(service_type, &instance.name))
        {
            let service_full_name = format!("{}.{}", service_type, sub.domain);
            let info = ServiceInstanceInfo {
                full_name: format!("{}.{}", instance.name, service_full_name),
                host_name: translate_domain(&instance.host_name, &sub.domain),
                addresses: routable(&instance.addresses),
                port: instance.port,
                priority: instance.priority,
                weight: instance.weight,
                txt_data: instance.txt_data.clone(),
                ttl: capped_ttl(instance.ttl),
            };

            tracing::debug!(
                "Discovered instance {} of {} on host {}",
                info.full_name,
                service_full_name,
                info.host_name
            );
            dnssd.handle_discovered_service_instance(&service_full_name, &info);
        }
    }

    pub fn handle_host_discovered(&self, host_name: &str, host: &DiscoveredHostInfo, dnssd: &mut dyn DnssdQuery) {
        debug_assert!(!host_name.ends_with('.'));
        debug_assert!(host.host_name.is_empty() || host.host_name.ends_with('.'));
        if !self.enabled {
            return;
        }

        let addresses = routable(&host.addresses);
        if addresses.is_empty() {
            tracing::debug!("Host {} has no routable addresses", host_name);
            return;
        }

        let source_name = if host.host_name.is_empty() {
            format!("{}.{}", host_name, LOCAL_DOMAIN)
        } else {
            host.host_name.clone()
        };
        let info = HostInfo {
            addresses,
            ttl: capped_ttl(host.ttl),
        };

        for sub in self.subscriptions.iter().filter(|sub| sub.matches_host(host_name)) {
            let host_full_name = translate_domain(&source_name, &sub.domain);
            tracing::debug!("Discovered host {} with {} addresses", host_full_name, info.addresses.len());
            dnssd.handle_discovered_host(&host_full_name, &info);
        }
    }

    fn target_count(&self, info: &DnsNameInfo) -> usize {
        self.subscriptions
            .iter()
            .filter(|sub| sub.same_target(info))
            .map(|sub| sub.count)
            .sum()
    }
}

fn subscribe_publisher(info: &DnsNameInfo, publisher: &mut dyn Publisher) {
    match info.name_type() {
        DnsNameType::Instance | DnsNameType::Service => {
            publisher.subscribe_service(&info.service_name, &info.instance_name)
        }
        DnsNameType::Host => publisher.subscribe_host(&info.host_name),
        DnsNameType::Unknown => {}
    }
}

fn unsubscribe_publisher(info: &DnsNameInfo, publisher: &mut dyn Publisher) {
    match info.name_type() {
        DnsNameType::Instance | DnsNameType::Service => {
            publisher.unsubscribe_service(&info.service_name, &info.instance_name)
        }
        DnsNameType::Host => publisher.unsubscribe_host(&info.host_name),
        DnsNameType::Unknown => {}
    }
}

/// Rewrite a name in the mDNS `local.` domain into `target_domain`. Names
/// in any other domain pass through unchanged.
pub fn translate_domain(name: &str, target_domain: &str) -> String {
    match split_full_host_name(name) {
        Ok((host, domain)) if domain.eq_ignore_ascii_case(LOCAL_DOMAIN) => {
            format!("{}.{}", host, target_domain)
        }
        _ => name.to_string(),
    }
}

fn capped_ttl(ttl: u32) -> u32 {
    ttl.min(SERVICE_TTL_CAP_LIMIT)
}

fn routable(addresses: &[Ipv6Addr]) -> Vec<Ipv6Addr> {
    addresses.iter().filter(|addr| !is_link_local(addr)).copied().collect()
}

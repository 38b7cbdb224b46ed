use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shared::protocol::LOCAL_DOMAIN;
use shared::txt::encode_txt_data;
use shared::types::{DiscoveredHostInfo, DiscoveredInstanceInfo, TxtEntry};

use super::PublisherEvent;

/// mdns-sd does not expose record TTLs; these are the RFC 6762 defaults.
const SERVICE_TTL: u32 = 4500;
const HOST_TTL: u32 = 120;

enum BrowseCommand {
    StartService(String),
    StopService(String),
    StartHost(String),
    StopHost(String),
}

/// Reference-counted front end of the browser task.
///
/// The daemon browses a whole service type, so instance subscriptions share
/// the browse of their type and every instance found is reported.
pub struct BrowserHandle {
    commands: mpsc::UnboundedSender<BrowseCommand>,
    service_refs: HashMap<String, usize>,
    host_refs: HashMap<String, usize>,
}

impl BrowserHandle {
    fn new(commands: mpsc::UnboundedSender<BrowseCommand>) -> Self {
        Self {
            commands,
            service_refs: HashMap::new(),
            host_refs: HashMap::new(),
        }
    }

    pub fn subscribe_service(&mut self, service_type: &str, instance_name: &str) {
        tracing::debug!("Subscribe service {} instance '{}'", service_type, instance_name);
        if acquire(&mut self.service_refs, service_type) {
            self.send(BrowseCommand::StartService(service_type.to_string()));
        }
    }

    pub fn unsubscribe_service(&mut self, service_type: &str, instance_name: &str) {
        tracing::debug!("Unsubscribe service {} instance '{}'", service_type, instance_name);
        if release(&mut self.service_refs, service_type) {
            self.send(BrowseCommand::StopService(service_type.to_string()));
        }
    }

    pub fn subscribe_host(&mut self, host_name: &str) {
        if acquire(&mut self.host_refs, host_name) {
            self.send(BrowseCommand::StartHost(host_name.to_string()));
        }
    }

    pub fn unsubscribe_host(&mut self, host_name: &str) {
        if release(&mut self.host_refs, host_name) {
            self.send(BrowseCommand::StopHost(host_name.to_string()));
        }
    }

    fn send(&self, command: BrowseCommand) {
        if self.commands.send(command).is_err() {
            tracing::error!("mDNS browser task is not running");
        }
    }
}

/// Returns true on the first reference.
fn acquire(refs: &mut HashMap<String, usize>, name: &str) -> bool {
    let count = refs.entry(name.to_ascii_lowercase()).or_insert(0);
    *count += 1;
    *count == 1
}

/// Returns true when the last reference goes away.
fn release(refs: &mut HashMap<String, usize>, name: &str) -> bool {
    let key = name.to_ascii_lowercase();
    match refs.get_mut(&key) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            refs.remove(&key);
            true
        }
        None => {
            tracing::warn!("Unbalanced unsubscribe for {}", name);
            false
        }
    }
}

pub fn spawn(
    daemon: ServiceDaemon,
    events: mpsc::UnboundedSender<PublisherEvent>,
    cancel: CancellationToken,
) -> (BrowserHandle, JoinHandle<()>) {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_browser(daemon, command_rx, events, cancel));
    (BrowserHandle::new(commands), task)
}

enum Query {
    Service {
        service_type: String,
        rx: flume::Receiver<ServiceEvent>,
    },
    Host {
        host_name: String,
        rx: flume::Receiver<HostnameResolutionEvent>,
    },
}

impl Query {
    fn key(&self) -> String {
        match self {
            Query::Service { service_type, .. } => service_key(service_type),
            Query::Host { host_name, .. } => host_key(host_name),
        }
    }
}

enum QueryEvent {
    Service(ServiceEvent),
    Host(HostnameResolutionEvent),
}

type RecvResult = (u64, Query, std::result::Result<QueryEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns its query, receiver included, and hands it back with
/// the event so the loop can re-arm it.
fn make_recv_future(id: u64, query: Query) -> RecvFuture {
    Box::pin(async move {
        let event = match &query {
            Query::Service { rx, .. } => rx.recv_async().await.map(QueryEvent::Service),
            Query::Host { rx, .. } => rx.recv_async().await.map(QueryEvent::Host),
        };
        (id, query, event)
    })
}

fn service_key(service_type: &str) -> String {
    format!("service:{}", service_type.to_ascii_lowercase())
}

fn host_key(host_name: &str) -> String {
    format!("host:{}", host_name.to_ascii_lowercase())
}

fn service_type_domain(service_type: &str) -> String {
    format!("{}.{}", service_type.trim_end_matches('.'), LOCAL_DOMAIN)
}

fn host_domain(host_name: &str) -> String {
    format!("{}.{}", host_name.trim_end_matches('.'), LOCAL_DOMAIN)
}

async fn run_browser(
    daemon: ServiceDaemon,
    mut commands: mpsc::UnboundedReceiver<BrowseCommand>,
    events: mpsc::UnboundedSender<PublisherEvent>,
    cancel: CancellationToken,
) {
    tracing::info!("Starting mDNS browser");

    // query key -> id of its live future; futures with another id are stale
    let mut active: HashMap<String, u64> = HashMap::new();
    let mut next_id = 0u64;
    let mut queries: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                let query = match command {
                    BrowseCommand::StartService(service_type) => {
                        match daemon.browse(&service_type_domain(&service_type)) {
                            Ok(rx) => Query::Service { service_type, rx },
                            Err(e) => {
                                tracing::error!("Failed to browse {}: {}", service_type, e);
                                continue;
                            }
                        }
                    }
                    BrowseCommand::StartHost(host_name) => {
                        match daemon.resolve_hostname(&host_domain(&host_name), None) {
                            Ok(rx) => Query::Host { host_name, rx },
                            Err(e) => {
                                tracing::error!("Failed to resolve host {}: {}", host_name, e);
                                continue;
                            }
                        }
                    }
                    BrowseCommand::StopService(service_type) => {
                        active.remove(&service_key(&service_type));
                        if let Err(e) = daemon.stop_browse(&service_type_domain(&service_type)) {
                            tracing::warn!("Failed to stop browsing {}: {}", service_type, e);
                        }
                        continue;
                    }
                    BrowseCommand::StopHost(host_name) => {
                        active.remove(&host_key(&host_name));
                        if let Err(e) = daemon.stop_resolve_hostname(&host_domain(&host_name)) {
                            tracing::warn!("Failed to stop resolving {}: {}", host_name, e);
                        }
                        continue;
                    }
                };

                let id = next_id;
                next_id += 1;
                active.insert(query.key(), id);
                queries.push(make_recv_future(id, query));
            }

            Some((id, query, result)) = queries.next() => {
                if active.get(&query.key()) != Some(&id) {
                    continue;
                }
                match result {
                    Ok(event) => {
                        handle_query_event(&query, event, &events);
                        queries.push(make_recv_future(id, query));
                    }
                    Err(e) => {
                        tracing::warn!("Query {} disconnected: {}", query.key(), e);
                        active.remove(&query.key());
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }
}

fn handle_query_event(
    query: &Query,
    event: QueryEvent,
    events: &mpsc::UnboundedSender<PublisherEvent>,
) {
    let output = match (query, event) {
        (Query::Service { service_type, .. }, QueryEvent::Service(ServiceEvent::ServiceResolved(info))) => {
            match convert_service_info(&info) {
                Some(instance) => {
                    tracing::debug!("Resolved service instance {} of {}", instance.name, service_type);
                    PublisherEvent::ServiceDiscovered {
                        service_type: service_type.clone(),
                        instance,
                    }
                }
                None => return,
            }
        }
        (Query::Service { .. }, QueryEvent::Service(ServiceEvent::ServiceRemoved(_, fullname))) => {
            tracing::debug!("Service removed: {}", fullname);
            return;
        }
        (Query::Host { host_name, .. }, QueryEvent::Host(HostnameResolutionEvent::AddressesFound(full_name, addresses))) => {
            let host = DiscoveredHostInfo {
                host_name: full_name,
                addresses: ipv6_only(addresses.iter()),
                ttl: HOST_TTL,
            };
            tracing::debug!("Resolved host {} to {} addresses", host_name, host.addresses.len());
            PublisherEvent::HostDiscovered {
                host_name: host_name.clone(),
                host,
            }
        }
        _ => return,
    };

    if let Err(e) = events.send(output) {
        tracing::error!("Failed to send discovery event: {}", e);
    }
}

fn ipv6_only<'a>(addresses: impl Iterator<Item = &'a IpAddr>) -> Vec<Ipv6Addr> {
    addresses
        .filter_map(|addr| match addr {
            IpAddr::V6(ipv6) => Some(*ipv6),
            _ => None,
        })
        .collect()
}

/// Convert an mdns-sd ServiceInfo to a discovered instance
fn convert_service_info(info: &ServiceInfo) -> Option<DiscoveredInstanceInfo> {
    let name = info
        .get_fullname()
        .strip_suffix(info.get_type())
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|name| !name.is_empty());
    let Some(name) = name else {
        tracing::debug!("Skipping service {} - unexpected name", info.get_fullname());
        return None;
    };

    let entries: Vec<TxtEntry> = info
        .get_properties()
        .iter()
        .map(|prop| match prop.val() {
            Some(value) => TxtEntry::new(prop.key(), value),
            None => TxtEntry::boolean(prop.key()),
        })
        .collect();
    let txt_data = encode_txt_data(&entries).unwrap_or_else(|e| {
        tracing::warn!("Dropping TXT data of {}: {}", info.get_fullname(), e);
        Vec::new()
    });

    let mut addresses = ipv6_only(info.get_addresses().iter());
    addresses.sort();

    Some(DiscoveredInstanceInfo {
        name: name.to_string(),
        host_name: info.get_hostname().to_string(),
        addresses,
        port: info.get_port(),
        priority: info.get_priority(),
        weight: info.get_weight(),
        txt_data,
        ttl: SERVICE_TTL,
    })
}

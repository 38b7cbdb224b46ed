use std::collections::HashMap;
use std::net::Ipv6Addr;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::mpsc;

use shared::protocol::LOCAL_DOMAIN;
use shared::types::TxtEntry;
use shared::{Error, Result};

use super::PublisherEvent;

/// A service handed to us for publishing.
struct ServiceRecord {
    host_name: String,
    sub_types: Vec<String>,
    port: u16,
    txt: HashMap<String, String>,
    /// Full name registered with the daemon; `None` while the host has no addresses
    registered: Option<String>,
}

/// Publishes hosts and services through the mdns-sd daemon.
///
/// The daemon has no standalone host records, so a host is kept as its
/// address list and every service of that host is registered with those
/// addresses. Services arriving before their host are held back and
/// registered once the host shows up.
pub struct Advertiser {
    daemon: ServiceDaemon,
    events: mpsc::UnboundedSender<PublisherEvent>,
    hosts: HashMap<String, Vec<Ipv6Addr>>,
    services: HashMap<(String, String), ServiceRecord>,
}

impl Advertiser {
    pub fn new(daemon: ServiceDaemon, events: mpsc::UnboundedSender<PublisherEvent>) -> Self {
        Self {
            daemon,
            events,
            hosts: HashMap::new(),
            services: HashMap::new(),
        }
    }

    pub fn publish_service(
        &mut self,
        host_name: &str,
        name: &str,
        service_type: &str,
        sub_types: &[String],
        port: u16,
        txt: &[TxtEntry],
    ) -> Result<()> {
        let key = (name.to_string(), service_type.to_string());
        let mut record = ServiceRecord {
            host_name: host_name.to_string(),
            sub_types: sub_types.to_vec(),
            port,
            txt: txt_properties(txt),
            registered: None,
        };

        // A failed registration leaves any previous one in place
        match self.hosts.get(host_name) {
            Some(addresses) if !addresses.is_empty() => {
                register(&self.daemon, addresses, name, service_type, &mut record)?;
            }
            _ => tracing::debug!("Deferring {}.{} until host {} has addresses", name, service_type, host_name),
        }

        let registered = record.registered.clone();
        if let Some(old) = self.services.insert(key, record) {
            // same fullname means the daemon already replaced it
            if let Some(fullname) = old.registered.filter(|f| Some(f) != registered.as_ref()) {
                unregister(&self.daemon, &fullname);
            }
        }
        self.notify(PublisherEvent::ServicePublished {
            name: name.to_string(),
            service_type: service_type.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    pub fn unpublish_service(&mut self, name: &str, service_type: &str) -> Result<()> {
        let record = self
            .services
            .remove(&(name.to_string(), service_type.to_string()))
            .ok_or(Error::NotFound)?;

        if let Some(fullname) = record.registered {
            unregister(&self.daemon, &fullname);
        }
        Ok(())
    }

    pub fn publish_host(&mut self, name: &str, addresses: &[Ipv6Addr]) -> Result<()> {
        self.hosts.insert(name.to_string(), addresses.to_vec());

        for ((service_name, service_type), record) in self
            .services
            .iter_mut()
            .filter(|(_, record)| record.host_name == name)
        {
            if let Some(fullname) = record.registered.take() {
                unregister(&self.daemon, &fullname);
            }
            if addresses.is_empty() {
                continue;
            }
            if let Err(e) = register(&self.daemon, addresses, service_name, service_type, record) {
                tracing::warn!("Failed to re-register {}.{}: {}", service_name, service_type, e);
            }
        }

        tracing::info!("Published host {} with {} addresses", name, addresses.len());
        self.notify(PublisherEvent::HostPublished {
            name: name.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    pub fn unpublish_host(&mut self, name: &str) -> Result<()> {
        self.hosts.remove(name).ok_or(Error::NotFound)?;

        for record in self
            .services
            .values_mut()
            .filter(|record| record.host_name == name)
        {
            if let Some(fullname) = record.registered.take() {
                unregister(&self.daemon, &fullname);
            }
        }

        tracing::info!("Unpublished host {}", name);
        Ok(())
    }

    pub fn unregister_all(&mut self) {
        for record in self.services.values_mut() {
            if let Some(fullname) = record.registered.take() {
                unregister(&self.daemon, &fullname);
            }
        }
    }

    fn notify(&self, event: PublisherEvent) {
        if let Err(e) = self.events.send(event) {
            tracing::error!("Failed to send publish result: {}", e);
        }
    }
}

/// mdns-sd type string, "<sub>._sub.<type>.local." when sub-typed.
///
/// The daemon carries a single sub-type per registration, so only the first
/// label is advertised.
fn service_type_domain(service_type: &str, sub_types: &[String]) -> String {
    if sub_types.len() > 1 {
        tracing::debug!("Only subtype {} of {} is registered", sub_types[0], service_type);
    }
    match sub_types.first() {
        Some(sub) => format!("{}._sub.{}.{}", sub, service_type, LOCAL_DOMAIN),
        None => format!("{}.{}", service_type, LOCAL_DOMAIN),
    }
}

fn txt_properties(entries: &[TxtEntry]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|entry| {
            let value = if entry.is_boolean {
                String::new()
            } else {
                String::from_utf8_lossy(&entry.value).to_string()
            };
            (entry.key.clone(), value)
        })
        .collect()
}

fn register(
    daemon: &ServiceDaemon,
    addresses: &[Ipv6Addr],
    name: &str,
    service_type: &str,
    record: &mut ServiceRecord,
) -> Result<()> {
    let ty_domain = service_type_domain(service_type, &record.sub_types);
    let host_name = format!("{}.{}", record.host_name, LOCAL_DOMAIN);
    let ip = addresses
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let service_info = ServiceInfo::new(
        &ty_domain,
        name,
        &host_name,
        ip.as_str(),
        record.port,
        record.txt.clone(),
    )
    .map_err(|e| Error::Failed(format!("invalid service info: {}", e)))?;

    let fullname = service_info.get_fullname().to_string();
    daemon
        .register(service_info)
        .map_err(|e| Error::Failed(format!("mDNS register failed: {}", e)))?;

    tracing::info!("Registered {} on {} port {}", fullname, host_name, record.port);
    record.registered = Some(fullname);
    Ok(())
}

fn unregister(daemon: &ServiceDaemon, fullname: &str) {
    match daemon.unregister(fullname) {
        Ok(_) => tracing::info!("Unregistered {}", fullname),
        Err(e) => tracing::warn!("Failed to unregister {}: {}", fullname, e),
    }
}

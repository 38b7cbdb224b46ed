//! Advertising proxy: publishes hosts and services registered with the
//! coprocessor's SRP server on the infrastructure link.

use std::net::Ipv6Addr;
use std::time::Duration;

use shared::dns::{is_service_type_equal, split_full_host_name, split_full_service_instance_name};
use shared::ip6::is_link_local;
use shared::txt::decode_txt_data;
use shared::types::{MeshLocalPrefix, SrpHost};
use shared::{Error, Result};

use crate::mdns::{Publisher, PublisherState};
use crate::ncp::SrpServer;

/// One service update waiting for its publish completions.
#[derive(Debug)]
struct OutstandingUpdate {
    id: u32,
    host_name: String,
    host_name_published: bool,
    service_names: Vec<(String, String)>,
    callback_count: usize,
}

#[derive(Debug, Default)]
pub struct AdvertisingProxy {
    enabled: bool,
    updates: Vec<OutstandingUpdate>,
}

impl AdvertisingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Updates still in flight when the proxy is disabled are dropped
    /// without a result; the SRP server times them out on its own.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            if !self.updates.is_empty() {
                tracing::info!("Dropping {} outstanding SRP updates", self.updates.len());
            }
            self.updates.clear();
        }
        tracing::info!("Advertising proxy {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Publish or withdraw one SRP update.
    ///
    /// The result for `id` reaches `srp` exactly once: right away when
    /// nothing is left to confirm or a publish call fails, otherwise when
    /// the last publish completion arrives.
    pub fn handle_service_update(
        &mut self,
        id: u32,
        host: &SrpHost,
        timeout: Duration,
        srp: &mut dyn SrpServer,
        publisher: &mut dyn Publisher,
    ) {
        if !self.enabled {
            tracing::debug!("Advertising proxy disabled, accepting update {} unpublished", id);
            srp.handle_service_update_result(id, Ok(()));
            return;
        }

        tracing::info!(
            "SRP update {} for host {} ({} services, timeout {:?})",
            id,
            host.full_name,
            host.services.len(),
            timeout
        );

        let mesh_local_prefix = srp.mesh_local_prefix();
        match publish_host_and_services(id, host, mesh_local_prefix.as_ref(), publisher) {
            Ok(update) if update.callback_count > 0 => {
                if let Some(pos) = self.updates.iter().position(|u| u.id == id) {
                    tracing::warn!("SRP update {} reissued, replacing the stale entry", id);
                    self.updates.remove(pos);
                }
                self.updates.push(update);
            }
            Ok(_) => srp.handle_service_update_result(id, Ok(())),
            Err(e) => {
                tracing::warn!("Failed to publish SRP update {} for {}: {}", id, host.full_name, e);
                srp.handle_service_update_result(id, Err(e));
            }
        }
    }

    pub fn handle_service_published(
        &mut self,
        name: &str,
        service_type: &str,
        result: Result<()>,
        srp: &mut dyn SrpServer,
    ) {
        if !self.enabled {
            return;
        }

        let matched = self.updates.iter_mut().enumerate().find_map(|(index, update)| {
            update
                .service_names
                .iter()
                .position(|(n, t)| n.eq_ignore_ascii_case(name) && is_service_type_equal(t, service_type))
                .map(|pos| (index, update, pos))
        });
        let Some((index, update, pos)) = matched else {
            tracing::debug!("No outstanding update for service {}.{}", name, service_type);
            return;
        };

        update.service_names.remove(pos);
        self.complete(index, result, srp);
    }

    pub fn handle_host_published(&mut self, name: &str, result: Result<()>, srp: &mut dyn SrpServer) {
        if !self.enabled {
            return;
        }

        let matched = self
            .updates
            .iter_mut()
            .enumerate()
            .find(|(_, update)| !update.host_name_published && update.host_name.eq_ignore_ascii_case(name));
        let Some((index, update)) = matched else {
            tracing::debug!("No outstanding update for host {}", name);
            return;
        };

        update.host_name_published = true;
        self.complete(index, result, srp);
    }

    pub fn handle_publisher_state(
        &mut self,
        state: PublisherState,
        srp: &mut dyn SrpServer,
        publisher: &mut dyn Publisher,
    ) {
        if self.enabled && state == PublisherState::Ready {
            self.publish_all_hosts_and_services(srp, publisher);
        }
    }

    /// Re-publish every host the SRP server knows about. Completions of
    /// these publishes are not tied to any update.
    pub fn publish_all_hosts_and_services(&mut self, srp: &mut dyn SrpServer, publisher: &mut dyn Publisher) {
        if !self.enabled {
            return;
        }

        let mesh_local_prefix = srp.mesh_local_prefix();
        let hosts = srp.hosts();
        tracing::info!("Publishing all {} SRP hosts", hosts.len());

        for host in &hosts {
            if let Err(e) = publish_host_and_services(0, host, mesh_local_prefix.as_ref(), publisher) {
                tracing::warn!("Failed to publish host {}: {}", host.full_name, e);
            }
        }
    }

    /// Account one completion of the update at `index`. Erases the update
    /// before reporting, so a new update issued from the report sees a
    /// consistent list.
    fn complete(&mut self, index: usize, result: Result<()>, srp: &mut dyn SrpServer) {
        let update = &mut self.updates[index];
        if result.is_ok() && update.callback_count > 1 {
            update.callback_count -= 1;
            return;
        }

        let update = self.updates.remove(index);
        match &result {
            Ok(()) => tracing::info!("SRP update {} published", update.id),
            Err(e) => tracing::warn!("SRP update {} failed: {}", update.id, e),
        }
        srp.handle_service_update_result(update.id, result);
    }
}

/// Addresses worth advertising off-mesh.
fn eligible_addresses(addresses: &[Ipv6Addr], mesh_local_prefix: Option<&MeshLocalPrefix>) -> Vec<Ipv6Addr> {
    addresses
        .iter()
        .filter(|addr| !is_link_local(addr))
        .filter(|addr| !mesh_local_prefix.is_some_and(|prefix| prefix.contains(addr)))
        .copied()
        .collect()
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NotFound) => Ok(()),
        other => other,
    }
}

fn publish_host_and_services(
    id: u32,
    host: &SrpHost,
    mesh_local_prefix: Option<&MeshLocalPrefix>,
    publisher: &mut dyn Publisher,
) -> Result<OutstandingUpdate> {
    let (host_name, _) = split_full_host_name(&host.full_name)?;
    let mut update = OutstandingUpdate {
        id,
        host_name,
        host_name_published: false,
        service_names: Vec::new(),
        callback_count: 0,
    };

    if !host.deleted {
        let addresses = eligible_addresses(&host.addresses, mesh_local_prefix);
        publisher.publish_host(&update.host_name, &addresses)?;
        update.callback_count += 1;
    }

    for service in &host.services {
        let (instance_name, service_type, _) = split_full_service_instance_name(&service.instance_full_name)?;

        if host.deleted || service.deleted {
            ignore_not_found(publisher.unpublish_service(&instance_name, &service_type))?;
            continue;
        }

        let txt = decode_txt_data(&service.txt_data)?;
        publisher.publish_service(
            &update.host_name,
            &instance_name,
            &service_type,
            &service.sub_type_labels,
            service.port,
            &txt,
        )?;
        update.service_names.push((instance_name, service_type));
        update.callback_count += 1;
    }

    if host.deleted {
        ignore_not_found(publisher.unpublish_host(&update.host_name))?;
    }

    Ok(update)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ncp::NetworkProperties;
    use shared::error::{result_to_ot_code, OT_ERROR_FAILED, OT_ERROR_NONE};
    use shared::types::{DeviceRole, SrpService, TxtEntry};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        PublishService { host: String, name: String, service_type: String, sub_types: Vec<String>, port: u16 },
        UnpublishService(String, String),
        PublishHost(String, Vec<Ipv6Addr>),
        UnpublishHost(String),
        SubscribeService(String, String),
        UnsubscribeService(String, String),
        SubscribeHost(String),
        UnsubscribeHost(String),
    }

    #[derive(Default)]
    pub(crate) struct FakePublisher {
        pub calls: Vec<Call>,
        pub fail_publish_service: bool,
        pub last_txt: Vec<TxtEntry>,
    }

    impl Publisher for FakePublisher {
        fn publish_service(
            &mut self,
            host_name: &str,
            name: &str,
            service_type: &str,
            sub_types: &[String],
            port: u16,
            txt: &[TxtEntry],
        ) -> Result<()> {
            if self.fail_publish_service {
                return Err(Error::InvalidArgs);
            }
            self.last_txt = txt.to_vec();
            self.calls.push(Call::PublishService {
                host: host_name.to_string(),
                name: name.to_string(),
                service_type: service_type.to_string(),
                sub_types: sub_types.to_vec(),
                port,
            });
            Ok(())
        }

        fn unpublish_service(&mut self, name: &str, service_type: &str) -> Result<()> {
            self.calls.push(Call::UnpublishService(name.to_string(), service_type.to_string()));
            Err(Error::NotFound)
        }

        fn publish_host(&mut self, name: &str, addresses: &[Ipv6Addr]) -> Result<()> {
            self.calls.push(Call::PublishHost(name.to_string(), addresses.to_vec()));
            Ok(())
        }

        fn unpublish_host(&mut self, name: &str) -> Result<()> {
            self.calls.push(Call::UnpublishHost(name.to_string()));
            Ok(())
        }

        fn subscribe_service(&mut self, service_type: &str, instance_name: &str) {
            self.calls.push(Call::SubscribeService(service_type.to_string(), instance_name.to_string()));
        }

        fn unsubscribe_service(&mut self, service_type: &str, instance_name: &str) {
            self.calls.push(Call::UnsubscribeService(service_type.to_string(), instance_name.to_string()));
        }

        fn subscribe_host(&mut self, host_name: &str) {
            self.calls.push(Call::SubscribeHost(host_name.to_string()));
        }

        fn unsubscribe_host(&mut self, host_name: &str) {
            self.calls.push(Call::UnsubscribeHost(host_name.to_string()));
        }
    }

    #[derive(Default)]
    struct FakeSrp {
        results: Vec<(u32, u8)>,
        hosts: Vec<SrpHost>,
        prefix: Option<MeshLocalPrefix>,
    }

    impl NetworkProperties for FakeSrp {
        fn device_role(&self) -> DeviceRole {
            DeviceRole::Leader
        }

        fn active_dataset_tlvs(&self) -> &[u8] {
            &[]
        }

        fn mesh_local_prefix(&self) -> Option<MeshLocalPrefix> {
            self.prefix
        }
    }

    impl SrpServer for FakeSrp {
        fn handle_service_update_result(&mut self, id: u32, result: Result<()>) {
            self.results.push((id, result_to_ot_code(&result)));
        }

        fn hosts(&self) -> Vec<SrpHost> {
            self.hosts.clone()
        }
    }

    fn service(name: &str, deleted: bool) -> SrpService {
        SrpService {
            instance_full_name: name.to_string(),
            port: 5683,
            priority: 0,
            weight: 0,
            txt_data: b"\x05rt=ok".to_vec(),
            sub_type_labels: Vec::new(),
            deleted,
        }
    }

    fn host(deleted: bool, services: Vec<SrpService>) -> SrpHost {
        SrpHost {
            full_name: "a.b.example.com.".to_string(),
            addresses: vec!["fd00:db8::1".parse().unwrap()],
            deleted,
            services,
        }
    }

    fn enabled_proxy() -> AdvertisingProxy {
        let mut proxy = AdvertisingProxy::new();
        proxy.set_enabled(true);
        proxy
    }

    #[test]
    fn test_host_and_service_publish_reports_once() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        // The type is the two labels after the instance, so "_sub" here is
        // not treated as a sub-type marker.
        let host = host(false, vec![service("svc._sub._udp.example.com.", false)]);
        proxy.handle_service_update(7, &host, Duration::from_secs(5), &mut srp, &mut publisher);

        assert_eq!(
            publisher.calls,
            vec![
                Call::PublishHost("a".to_string(), vec!["fd00:db8::1".parse().unwrap()]),
                Call::PublishService {
                    host: "a".to_string(),
                    name: "svc".to_string(),
                    service_type: "_sub._udp".to_string(),
                    sub_types: Vec::new(),
                    port: 5683,
                },
            ]
        );
        assert_eq!(publisher.last_txt, vec![TxtEntry::new("rt", "ok")]);
        assert!(srp.results.is_empty());

        proxy.handle_host_published("a", Ok(()), &mut srp);
        assert!(srp.results.is_empty());
        proxy.handle_service_published("svc", "_sub._udp", Ok(()), &mut srp);
        assert_eq!(srp.results, vec![(7, OT_ERROR_NONE)]);

        // late duplicates do not report again
        proxy.handle_host_published("a", Ok(()), &mut srp);
        proxy.handle_service_published("svc", "_sub._udp", Ok(()), &mut srp);
        assert_eq!(srp.results.len(), 1);
    }

    #[test]
    fn test_completion_order_does_not_matter() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        let host = host(
            false,
            vec![service("one._ipp._tcp.example.com.", false), service("two._ipp._tcp.example.com.", false)],
        );
        proxy.handle_service_update(1, &host, Duration::from_secs(5), &mut srp, &mut publisher);

        proxy.handle_service_published("TWO", "_ipp._tcp.", Ok(()), &mut srp);
        proxy.handle_service_published("one", "_ipp._tcp", Ok(()), &mut srp);
        assert!(srp.results.is_empty());
        proxy.handle_host_published("a", Ok(()), &mut srp);
        assert_eq!(srp.results, vec![(1, OT_ERROR_NONE)]);
    }

    #[test]
    fn test_deleted_host_is_unpublished_and_reported_immediately() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        let host = host(true, vec![service("svc._sub._udp.example.com.", false)]);
        proxy.handle_service_update(3, &host, Duration::from_secs(5), &mut srp, &mut publisher);

        assert!(!publisher
            .calls
            .iter()
            .any(|c| matches!(c, Call::PublishHost(..) | Call::PublishService { .. })));
        assert_eq!(
            publisher.calls.iter().filter(|c| matches!(c, Call::UnpublishHost(h) if h == "a")).count(),
            1
        );
        assert_eq!(srp.results, vec![(3, OT_ERROR_NONE)]);
        assert!(proxy.updates.is_empty());
    }

    #[test]
    fn test_error_completion_finalizes_update() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        let host = host(false, vec![service("svc._ipp._tcp.example.com.", false)]);
        proxy.handle_service_update(4, &host, Duration::from_secs(5), &mut srp, &mut publisher);

        proxy.handle_host_published("a", Err(Error::Failed("conflict".to_string())), &mut srp);
        assert_eq!(srp.results, vec![(4, OT_ERROR_FAILED)]);

        proxy.handle_service_published("svc", "_ipp._tcp", Ok(()), &mut srp);
        assert_eq!(srp.results.len(), 1);
    }

    #[test]
    fn test_synchronous_failure_reports_immediately() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher {
            fail_publish_service: true,
            ..Default::default()
        };

        let host = host(false, vec![service("svc._ipp._tcp.example.com.", false)]);
        proxy.handle_service_update(5, &host, Duration::from_secs(5), &mut srp, &mut publisher);

        assert_eq!(srp.results, vec![(5, Error::InvalidArgs.ot_code())]);
        assert!(proxy.updates.is_empty());

        // the host completion of the abandoned update is ignored
        proxy.handle_host_published("a", Ok(()), &mut srp);
        assert_eq!(srp.results.len(), 1);
    }

    #[test]
    fn test_malformed_host_name_is_rejected() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        let mut host = host(false, Vec::new());
        host.full_name = "_ipp._tcp.local.".to_string();
        proxy.handle_service_update(6, &host, Duration::from_secs(5), &mut srp, &mut publisher);

        assert_eq!(srp.results, vec![(6, Error::InvalidArgs.ot_code())]);
        assert!(publisher.calls.is_empty());
    }

    #[test]
    fn test_reused_id_replaces_stale_update() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        let host = host(false, Vec::new());
        proxy.handle_service_update(9, &host, Duration::from_secs(5), &mut srp, &mut publisher);
        proxy.handle_service_update(9, &host, Duration::from_secs(5), &mut srp, &mut publisher);
        assert_eq!(proxy.updates.len(), 1);

        proxy.handle_host_published("a", Ok(()), &mut srp);
        proxy.handle_host_published("a", Ok(()), &mut srp);
        assert_eq!(srp.results, vec![(9, OT_ERROR_NONE)]);
    }

    #[test]
    fn test_ineligible_addresses_are_filtered() {
        let prefix = MeshLocalPrefix([0xfd, 0xde, 0xad, 0x00, 0xbe, 0xef, 0x00, 0x00]);
        let addresses: Vec<Ipv6Addr> = vec![
            "fe80::1".parse().unwrap(),
            "fdde:ad00:beef:0:0:ff:fe00:fc00".parse().unwrap(),
            "fd11:22::1".parse().unwrap(),
        ];
        assert_eq!(
            eligible_addresses(&addresses, Some(&prefix)),
            vec!["fd11:22::1".parse::<Ipv6Addr>().unwrap()]
        );
        assert_eq!(eligible_addresses(&addresses, None).len(), 2);
    }

    #[test]
    fn test_disabled_proxy_accepts_without_publishing() {
        let mut proxy = AdvertisingProxy::new();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        proxy.handle_service_update(2, &host(false, Vec::new()), Duration::from_secs(5), &mut srp, &mut publisher);
        assert!(publisher.calls.is_empty());
        assert_eq!(srp.results, vec![(2, OT_ERROR_NONE)]);
    }

    #[test]
    fn test_publisher_ready_republishes_all_hosts() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp {
            hosts: vec![host(false, vec![service("svc._ipp._tcp.example.com.", false)])],
            ..Default::default()
        };
        let mut publisher = FakePublisher::default();

        proxy.handle_publisher_state(PublisherState::Idle, &mut srp, &mut publisher);
        assert!(publisher.calls.is_empty());

        proxy.handle_publisher_state(PublisherState::Ready, &mut srp, &mut publisher);
        assert_eq!(publisher.calls.len(), 2);
        assert!(proxy.updates.is_empty());
        assert!(srp.results.is_empty());
    }

    #[test]
    fn test_disable_drops_outstanding_updates() {
        let mut proxy = enabled_proxy();
        let mut srp = FakeSrp::default();
        let mut publisher = FakePublisher::default();

        proxy.handle_service_update(8, &host(false, Vec::new()), Duration::from_secs(5), &mut srp, &mut publisher);
        proxy.set_enabled(false);
        proxy.set_enabled(true);
        proxy.handle_host_published("a", Ok(()), &mut srp);
        assert!(srp.results.is_empty());
    }
}

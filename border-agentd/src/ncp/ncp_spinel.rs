//! Command multiplexer for the spinel link to the coprocessor.
//!
//! Outbound commands take a transaction id from a small pool and remember
//! which (command, property) they wait for. Inbound frames with tid 0 are
//! notifications and are dispatched by property; anything else is matched
//! against the waiting table and resolves the operation that sent it.
//!
//! State-changing operations own one task slot each. While a slot is busy
//! a second request of the same kind fails right away with `Busy` and the
//! original request carries on untouched.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv6Addr;
use std::time::Duration;

use shared::protocol::{MAX_DATASET_TLVS_LEN, MESH_LOCAL_PREFIX_LEN};
use shared::types::{
    BackboneRouterState, DeviceRole, HostInfo, Ip6AddressInfo, MeshLocalPrefix,
    MulticastListenerEvent, ServiceInstanceInfo, SrpHost, SrpService,
};
use shared::{error, Error, Result};

use super::spinel::{self, *};
use super::{DnssdQuery, NcpEvent, NetworkProperties, SpinelInterface, SrpServer};
use crate::async_task::AsyncTask;

/// Size of the transaction id space; tid 0 is reserved for notifications.
pub const MAX_TIDS: usize = 16;

pub type NcpTask = AsyncTask<NcpSpinel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskSlot {
    DatasetSetActive,
    DatasetMgmtSetPending,
    Ip6SetEnabled,
    ThreadSetEnabled,
    ThreadDetachGracefully,
    ThreadErasePersistentInfo,
}

impl TaskSlot {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }

    /// The slot an outstanding (cmd, key) pair belongs to, if any.
    fn for_waiting(cmd: u32, key: u32) -> Option<Self> {
        match (cmd, key) {
            (CMD_PROP_VALUE_SET, PROP_THREAD_ACTIVE_DATASET_TLVS) => Some(Self::DatasetSetActive),
            (CMD_PROP_VALUE_SET, PROP_THREAD_MGMT_SET_PENDING_DATASET_TLVS) => {
                Some(Self::DatasetMgmtSetPending)
            }
            (CMD_PROP_VALUE_SET, PROP_NET_IF_UP) => Some(Self::Ip6SetEnabled),
            (CMD_PROP_VALUE_SET, PROP_NET_STACK_UP) => Some(Self::ThreadSetEnabled),
            (CMD_PROP_VALUE_SET, PROP_NET_LEAVE_GRACEFULLY) => Some(Self::ThreadDetachGracefully),
            (CMD_NET_CLEAR, _) => Some(Self::ThreadErasePersistentInfo),
            _ => None,
        }
    }
}

impl fmt::Display for TaskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskSlot::DatasetSetActive => "set active dataset",
            TaskSlot::DatasetMgmtSetPending => "set pending dataset",
            TaskSlot::Ip6SetEnabled => "enable the network interface",
            TaskSlot::ThreadSetEnabled => "enable the Thread network",
            TaskSlot::ThreadDetachGracefully => "detach gracefully",
            TaskSlot::ThreadErasePersistentInfo => "erase persistent info",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiting {
    cmd: u32,
    key: u32,
}

const NOT_WAITING: Waiting = Waiting {
    cmd: CMD_NOOP,
    key: PROP_LAST_STATUS,
};

pub struct NcpSpinel {
    iid: u8,
    interface: Box<dyn SpinelInterface>,
    tids_in_use: u16,
    next_tid: u8,
    waiting: [Waiting; MAX_TIDS],
    tasks: [Option<NcpTask>; TaskSlot::COUNT],
    device_role: DeviceRole,
    active_dataset_tlvs: Vec<u8>,
    mesh_local_prefix: Option<MeshLocalPrefix>,
    srp_hosts: Vec<SrpHost>,
    /// Service update results (id, code) waiting for a free tid.
    pending_results: VecDeque<(u32, u8)>,
}

impl NcpSpinel {
    pub fn new(iid: u8, interface: Box<dyn SpinelInterface>) -> Self {
        Self {
            iid,
            interface,
            tids_in_use: 0,
            next_tid: 1,
            waiting: [NOT_WAITING; MAX_TIDS],
            tasks: Default::default(),
            device_role: DeviceRole::default(),
            active_dataset_tlvs: Vec::new(),
            mesh_local_prefix: None,
            srp_hosts: Vec::new(),
            pending_results: VecDeque::new(),
        }
    }

    /// Ask the coprocessor for the properties we cache.
    pub fn refresh_properties(&mut self) {
        for key in [
            PROP_NET_ROLE,
            PROP_IPV6_ML_PREFIX,
            PROP_THREAD_ACTIVE_DATASET_TLVS,
        ] {
            if let Err(e) = self.send_command(CMD_PROP_VALUE_GET, key, |_| {}) {
                tracing::warn!("Failed to query property {:#x}: {}", key, e);
            }
        }
    }

    pub fn dataset_set_active_tlvs(&mut self, tlvs: &[u8], task: NcpTask) {
        if tlvs.len() > MAX_DATASET_TLVS_LEN {
            task.set_result(self, Err(Error::InvalidArgs));
            return;
        }
        self.start_operation(
            TaskSlot::DatasetSetActive,
            CMD_PROP_VALUE_SET,
            PROP_THREAD_ACTIVE_DATASET_TLVS,
            |enc| {
                enc.write_data(tlvs);
            },
            task,
        );
    }

    pub fn dataset_mgmt_set_pending(&mut self, tlvs: &[u8], task: NcpTask) {
        if tlvs.len() > MAX_DATASET_TLVS_LEN {
            task.set_result(self, Err(Error::InvalidArgs));
            return;
        }
        self.start_operation(
            TaskSlot::DatasetMgmtSetPending,
            CMD_PROP_VALUE_SET,
            PROP_THREAD_MGMT_SET_PENDING_DATASET_TLVS,
            |enc| {
                enc.write_data(tlvs);
            },
            task,
        );
    }

    pub fn ip6_set_enabled(&mut self, enable: bool, task: NcpTask) {
        self.start_operation(
            TaskSlot::Ip6SetEnabled,
            CMD_PROP_VALUE_SET,
            PROP_NET_IF_UP,
            |enc| {
                enc.write_bool(enable);
            },
            task,
        );
    }

    pub fn thread_set_enabled(&mut self, enable: bool, task: NcpTask) {
        self.start_operation(
            TaskSlot::ThreadSetEnabled,
            CMD_PROP_VALUE_SET,
            PROP_NET_STACK_UP,
            |enc| {
                enc.write_bool(enable);
            },
            task,
        );
    }

    pub fn thread_detach_gracefully(&mut self, task: NcpTask) {
        self.start_operation(
            TaskSlot::ThreadDetachGracefully,
            CMD_PROP_VALUE_SET,
            PROP_NET_LEAVE_GRACEFULLY,
            |_| {},
            task,
        );
    }

    pub fn thread_erase_persistent_info(&mut self, task: NcpTask) {
        self.start_operation(
            TaskSlot::ThreadErasePersistentInfo,
            CMD_NET_CLEAR,
            PROP_LAST_STATUS,
            |_| {},
            task,
        );
    }

    /// Add or remove a group on the Thread interface's multicast table.
    pub fn ip6_update_multicast_subscription(&mut self, address: &Ipv6Addr, added: bool) -> Result<()> {
        let cmd = if added {
            CMD_PROP_VALUE_INSERT
        } else {
            CMD_PROP_VALUE_REMOVE
        };
        self.send_command(cmd, PROP_IPV6_MULTICAST_ADDRESS_TABLE, |enc| {
            enc.write_ip6(address);
        })
    }

    /// Attach to the network described by `active_dataset_tlvs`.
    pub fn join(&mut self, active_dataset_tlvs: Vec<u8>, receiver: impl FnOnce(Result<()>) + 'static) {
        tracing::info!("Joining network ({} dataset bytes)", active_dataset_tlvs.len());
        NcpTask::new(receiver)
            .first(move |ncp, task| ncp.dataset_set_active_tlvs(&active_dataset_tlvs, task))
            .then(|ncp, task| ncp.ip6_set_enabled(true, task))
            .then(|ncp, task| ncp.thread_set_enabled(true, task))
            .run(self);
    }

    /// Detach and forget the network.
    pub fn leave(&mut self, receiver: impl FnOnce(Result<()>) + 'static) {
        tracing::info!("Leaving network");
        NcpTask::new(receiver)
            .first(|ncp, task| ncp.thread_detach_gracefully(task))
            .then(|ncp, task| ncp.thread_erase_persistent_info(task))
            .run(self);
    }

    /// Push a pending dataset to the leader. Needs an attached device.
    pub fn schedule_migration(
        &mut self,
        pending_dataset_tlvs: Vec<u8>,
        receiver: impl FnOnce(Result<()>) + 'static,
    ) {
        if !self.device_role.is_attached() {
            tracing::warn!("Cannot schedule migration while {}", self.device_role);
            receiver(Err(Error::InvalidState));
            return;
        }
        NcpTask::new(receiver)
            .first(move |ncp, task| ncp.dataset_mgmt_set_pending(&pending_dataset_tlvs, task))
            .run(self);
    }

    /// Process one received spinel frame.
    pub fn handle_frame(&mut self, data: &[u8]) -> Option<NcpEvent> {
        let event = self.dispatch_frame(data);
        // a response may have freed a tid
        if !self.pending_results.is_empty() {
            self.flush_service_update_results();
        }
        event
    }

    fn dispatch_frame(&mut self, data: &[u8]) -> Option<NcpEvent> {
        let frame = match Frame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed spinel frame ({} bytes): {}", data.len(), e);
                return None;
            }
        };

        if header_iid(frame.header) != self.iid {
            tracing::debug!("Ignoring frame for iid {}", header_iid(frame.header));
            return None;
        }

        let tid = frame.tid();
        if tid == 0 {
            if frame.cmd != CMD_PROP_VALUE_IS {
                tracing::debug!("Ignoring notification with cmd {}", frame.cmd);
                return None;
            }
            return self.handle_value_is(frame.key, frame.payload);
        }

        self.handle_response(tid, &frame)
    }

    fn handle_response(&mut self, tid: u8, frame: &Frame<'_>) -> Option<NcpEvent> {
        if self.tids_in_use & (1 << tid) == 0 {
            tracing::warn!("Received response for idle tid {}", tid);
            return None;
        }

        let waiting = self.waiting[tid as usize];
        self.free_tid(tid);

        let result = match waiting.cmd {
            CMD_PROP_VALUE_SET => self.handle_set_response(waiting.key, frame),
            CMD_PROP_VALUE_GET => self.handle_get_response(waiting.key, frame),
            CMD_PROP_VALUE_INSERT => {
                self.handle_table_response(waiting.key, frame, CMD_PROP_VALUE_INSERTED)
            }
            CMD_PROP_VALUE_REMOVE => {
                self.handle_table_response(waiting.key, frame, CMD_PROP_VALUE_REMOVED)
            }
            CMD_NET_CLEAR => self.handle_net_clear_response(frame),
            _ => Ok(None),
        };

        match result {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    "Unexpected response (cmd:{}, key:{:#x}) waiting (cmd:{}, key:{:#x}) for tid {}: {}",
                    frame.cmd,
                    frame.key,
                    waiting.cmd,
                    waiting.key,
                    tid,
                    e
                );
                if let Some(slot) = TaskSlot::for_waiting(waiting.cmd, waiting.key) {
                    self.resolve(slot, Err(Error::Parse));
                }
                None
            }
        }
    }

    fn handle_set_response(&mut self, waiting_key: u32, frame: &Frame<'_>) -> Result<Option<NcpEvent>> {
        if frame.cmd != CMD_PROP_VALUE_IS {
            return Err(Error::InvalidState);
        }

        if frame.key == PROP_LAST_STATUS && waiting_key != PROP_LAST_STATUS {
            let status = SpinelDecoder::new(frame.payload).read_uint_packed()?;
            let result = status_to_result(status);
            match TaskSlot::for_waiting(CMD_PROP_VALUE_SET, waiting_key) {
                Some(slot) => self.resolve(slot, result),
                None => {
                    if let Err(e) = result {
                        tracing::warn!("Setting property {:#x} failed: {}", waiting_key, e);
                    }
                }
            }
            return Ok(None);
        }

        if frame.key != waiting_key {
            return Err(Error::InvalidState);
        }

        let mut decoder = SpinelDecoder::new(frame.payload);
        match waiting_key {
            PROP_THREAD_ACTIVE_DATASET_TLVS => {
                self.resolve(TaskSlot::DatasetSetActive, Ok(()));
                self.set_active_dataset(decoder.read_data()?)?;
                Ok(None)
            }
            PROP_NET_IF_UP => {
                self.resolve(TaskSlot::Ip6SetEnabled, Ok(()));
                Ok(Some(NcpEvent::NetifStateChanged(decoder.read_bool()?)))
            }
            PROP_NET_STACK_UP => {
                self.resolve(TaskSlot::ThreadSetEnabled, Ok(()));
                Ok(None)
            }
            // resolved by the follow-up notification
            _ => Ok(None),
        }
    }

    fn handle_get_response(&mut self, waiting_key: u32, frame: &Frame<'_>) -> Result<Option<NcpEvent>> {
        if frame.cmd != CMD_PROP_VALUE_IS {
            return Err(Error::InvalidState);
        }
        if frame.key == waiting_key {
            return Ok(self.handle_value_is(frame.key, frame.payload));
        }
        if frame.key == PROP_LAST_STATUS {
            let status = SpinelDecoder::new(frame.payload).read_uint_packed()?;
            if let Err(e) = status_to_result(status) {
                tracing::warn!("Reading property {:#x} failed: {}", waiting_key, e);
            }
            return Ok(None);
        }
        Err(Error::InvalidState)
    }

    fn handle_table_response(
        &mut self,
        waiting_key: u32,
        frame: &Frame<'_>,
        expected_cmd: u32,
    ) -> Result<Option<NcpEvent>> {
        if frame.cmd == CMD_PROP_VALUE_IS {
            if frame.key != PROP_LAST_STATUS {
                return Err(Error::InvalidState);
            }
            let status = SpinelDecoder::new(frame.payload).read_uint_packed()?;
            if let Err(e) = status_to_result(status) {
                tracing::info!("Failed to update table {:#x} on NCP: {}", waiting_key, e);
            }
            Ok(None)
        } else if frame.cmd == expected_cmd && frame.key == waiting_key {
            Ok(None)
        } else {
            Err(Error::InvalidState)
        }
    }

    fn handle_net_clear_response(&mut self, frame: &Frame<'_>) -> Result<Option<NcpEvent>> {
        if frame.key != PROP_LAST_STATUS {
            return Err(Error::InvalidState);
        }
        let status = SpinelDecoder::new(frame.payload).read_uint_packed()?;
        self.resolve(TaskSlot::ThreadErasePersistentInfo, status_to_result(status));
        Ok(None)
    }

    fn handle_value_is(&mut self, key: u32, payload: &[u8]) -> Option<NcpEvent> {
        match self.decode_value_is(key, payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Failed to handle property {:#x}: {}", key, e);
                None
            }
        }
    }

    fn decode_value_is(&mut self, key: u32, payload: &[u8]) -> Result<Option<NcpEvent>> {
        let mut decoder = SpinelDecoder::new(payload);

        let event = match key {
            PROP_LAST_STATUS => {
                let status = decoder.read_uint_packed()?;
                tracing::info!("NCP last status: {}", status);
                None
            }
            PROP_NET_ROLE => {
                let role = spinel::role_from_spinel(decoder.read_u8()?);
                self.device_role = role;
                tracing::info!("Device role changed to {}", role);
                Some(NcpEvent::RoleChanged(role))
            }
            PROP_NET_LEAVE_GRACEFULLY => {
                self.resolve(TaskSlot::ThreadDetachGracefully, Ok(()));
                None
            }
            PROP_THREAD_MGMT_SET_PENDING_DATASET_TLVS => {
                let status = decoder.read_uint_packed()?;
                self.resolve(TaskSlot::DatasetMgmtSetPending, status_to_result(status));
                None
            }
            PROP_THREAD_ACTIVE_DATASET_TLVS => {
                self.set_active_dataset(decoder.read_data()?)?;
                None
            }
            PROP_IPV6_ML_PREFIX => {
                let prefix = decoder.read_ip6()?;
                let mut bytes = [0u8; MESH_LOCAL_PREFIX_LEN];
                bytes.copy_from_slice(&prefix.octets()[..MESH_LOCAL_PREFIX_LEN]);
                let prefix = MeshLocalPrefix(bytes);
                tracing::info!("Mesh-local prefix is {}", prefix);
                self.mesh_local_prefix = Some(prefix);
                None
            }
            PROP_IPV6_ADDRESS_TABLE => Some(NcpEvent::Ip6AddressTable(decode_address_table(
                &mut decoder,
            )?)),
            PROP_IPV6_MULTICAST_ADDRESS_TABLE => Some(NcpEvent::Ip6MulticastAddressTable(
                decode_multicast_table(&mut decoder)?,
            )),
            PROP_NET_IF_UP => Some(NcpEvent::NetifStateChanged(decoder.read_bool()?)),
            PROP_STREAM_NET => Some(NcpEvent::Ip6Receive(
                decoder.read_data_with_len()?.to_vec(),
            )),
            PROP_SRP_SERVICE_UPDATE => {
                let (id, host, timeout) = decode_srp_service_update(&mut decoder)?;
                self.cache_srp_host(&host);
                Some(NcpEvent::SrpServiceUpdate { id, host, timeout })
            }
            PROP_DNSSD_QUERY_SUBSCRIBE => Some(NcpEvent::DnssdSubscribe(decoder.read_utf8()?)),
            PROP_DNSSD_QUERY_UNSUBSCRIBE => {
                Some(NcpEvent::DnssdUnsubscribe(decoder.read_utf8()?))
            }
            PROP_BACKBONE_ROUTER_STATE => {
                let state = match decoder.read_u8()? {
                    0 => BackboneRouterState::Disabled,
                    1 => BackboneRouterState::Secondary,
                    2 => BackboneRouterState::Primary,
                    _ => return Err(Error::Parse),
                };
                Some(NcpEvent::BackboneRouterState(state))
            }
            PROP_BACKBONE_ROUTER_MULTICAST_LISTENER => {
                let event = match decoder.read_u8()? {
                    0 => MulticastListenerEvent::Added,
                    1 => MulticastListenerEvent::Removed,
                    _ => return Err(Error::Parse),
                };
                Some(NcpEvent::MulticastListener(event, decoder.read_ip6()?))
            }
            _ => {
                tracing::warn!("Received unrecognized key: {:#x}", key);
                None
            }
        };

        Ok(event)
    }

    fn set_active_dataset(&mut self, tlvs: &[u8]) -> Result<()> {
        if tlvs.len() > MAX_DATASET_TLVS_LEN {
            return Err(Error::Parse);
        }
        self.active_dataset_tlvs = tlvs.to_vec();
        Ok(())
    }

    fn cache_srp_host(&mut self, host: &SrpHost) {
        self.srp_hosts
            .retain(|h| !h.full_name.eq_ignore_ascii_case(&host.full_name));
        if !host.deleted {
            let mut host = host.clone();
            host.services.retain(|s| !s.deleted);
            self.srp_hosts.push(host);
        }
    }

    fn start_operation(
        &mut self,
        slot: TaskSlot,
        cmd: u32,
        key: u32,
        encode: impl FnOnce(&mut SpinelEncoder),
        task: NcpTask,
    ) {
        if self.tasks[slot.index()].is_some() {
            tracing::warn!("Failed to {}: previous request still in flight", slot);
            task.set_result(self, Err(Error::Busy));
            return;
        }

        match self.send_command(cmd, key, encode) {
            Ok(()) => self.tasks[slot.index()] = Some(task),
            Err(e) => {
                tracing::warn!("Failed to {}: {}", slot, e);
                task.set_result(self, Err(e));
            }
        }
    }

    fn resolve(&mut self, slot: TaskSlot, result: Result<()>) {
        if let Some(task) = self.tasks[slot.index()].take() {
            if let Err(e) = &result {
                tracing::warn!("Failed to {}: {}", slot, e);
            }
            task.set_result(self, result);
        }
    }

    fn send_command(&mut self, cmd: u32, key: u32, encode: impl FnOnce(&mut SpinelEncoder)) -> Result<()> {
        let tid = self.get_next_tid();
        if tid == 0 {
            return Err(Error::NoBufs);
        }

        let mut encoder = SpinelEncoder::begin_frame(spinel::header(self.iid, tid), cmd, key);
        encode(&mut encoder);

        let sent = encoder
            .end_frame()
            .and_then(|frame| self.interface.send_frame(&frame));

        match sent {
            Ok(()) => {
                self.waiting[tid as usize] = Waiting { cmd, key };
                Ok(())
            }
            Err(e) => {
                self.free_tid(tid);
                Err(e)
            }
        }
    }

    fn get_next_tid(&mut self) -> u8 {
        let mut tid = self.next_tid;

        while self.tids_in_use & (1 << tid) != 0 {
            tid = spinel::next_tid(tid);
            if tid == self.next_tid {
                return 0;
            }
        }

        self.tids_in_use |= 1 << tid;
        self.next_tid = spinel::next_tid(tid);
        tid
    }

    fn free_tid(&mut self, tid: u8) {
        self.tids_in_use &= !(1 << tid);
        self.waiting[tid as usize] = NOT_WAITING;
    }

    /// Send queued service update results in order, stopping at the first
    /// one that finds no free tid or queue space.
    fn flush_service_update_results(&mut self) {
        while let Some(&(id, code)) = self.pending_results.front() {
            let sent = self.send_command(CMD_PROP_VALUE_SET, PROP_SRP_SERVICE_UPDATE_RESULT, |enc| {
                enc.write_u32(id).write_u8(code);
            });
            match sent {
                Ok(()) => {}
                Err(Error::NoBufs) => return,
                Err(e) => tracing::error!("Failed to report result of service update {}: {}", id, e),
            }
            self.pending_results.pop_front();
        }
    }
}

impl NetworkProperties for NcpSpinel {
    fn device_role(&self) -> DeviceRole {
        self.device_role
    }

    fn active_dataset_tlvs(&self) -> &[u8] {
        &self.active_dataset_tlvs
    }

    fn mesh_local_prefix(&self) -> Option<MeshLocalPrefix> {
        self.mesh_local_prefix
    }
}

impl SrpServer for NcpSpinel {
    fn handle_service_update_result(&mut self, id: u32, result: Result<()>) {
        self.pending_results
            .push_back((id, error::result_to_ot_code(&result)));
        self.flush_service_update_results();
        if !self.pending_results.is_empty() {
            tracing::warn!(
                "No free transaction id, {} service update results deferred",
                self.pending_results.len()
            );
        }
    }

    fn hosts(&self) -> Vec<SrpHost> {
        self.srp_hosts.clone()
    }
}

impl DnssdQuery for NcpSpinel {
    fn handle_discovered_service_instance(&mut self, service_full_name: &str, info: &ServiceInstanceInfo) {
        let sent = self.send_command(
            CMD_PROP_VALUE_SET,
            PROP_DNSSD_DISCOVERED_SERVICE_INSTANCE,
            |enc| {
                enc.write_utf8(service_full_name)
                    .write_utf8(&info.full_name)
                    .write_utf8(&info.host_name)
                    .write_data_with_len(&encode_address_list(&info.addresses))
                    .write_u16(info.port)
                    .write_u16(info.priority)
                    .write_u16(info.weight)
                    .write_data_with_len(&info.txt_data)
                    .write_u32(info.ttl);
            },
        );
        if let Err(e) = sent {
            tracing::error!("Failed to deliver instance {}: {}", info.full_name, e);
        }
    }

    fn handle_discovered_host(&mut self, host_full_name: &str, info: &HostInfo) {
        let sent = self.send_command(CMD_PROP_VALUE_SET, PROP_DNSSD_DISCOVERED_HOST, |enc| {
            enc.write_utf8(host_full_name)
                .write_data_with_len(&encode_address_list(&info.addresses))
                .write_u32(info.ttl);
        });
        if let Err(e) = sent {
            tracing::error!("Failed to deliver host {}: {}", host_full_name, e);
        }
    }
}

fn encode_address_list(addresses: &[Ipv6Addr]) -> Vec<u8> {
    addresses.iter().flat_map(|a| a.octets()).collect()
}

fn decode_address_list(data: &[u8]) -> Result<Vec<Ipv6Addr>> {
    if data.len() % 16 != 0 {
        return Err(Error::Parse);
    }
    Ok(data
        .chunks_exact(16)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(chunk);
            Ipv6Addr::from(octets)
        })
        .collect())
}

fn decode_address_table(decoder: &mut SpinelDecoder<'_>) -> Result<Vec<Ip6AddressInfo>> {
    let mut table = Vec::new();
    while !decoder.is_all_read() {
        decoder.open_struct()?;
        let address = decoder.read_ip6()?;
        let prefix_length = decoder.read_u8()?;
        let preferred_lifetime = decoder.read_u32()?;
        let _valid_lifetime = decoder.read_u32()?;
        decoder.close_struct()?;

        table.push(Ip6AddressInfo {
            address,
            prefix_length,
            preferred: preferred_lifetime != 0,
        });
    }
    Ok(table)
}

fn decode_multicast_table(decoder: &mut SpinelDecoder<'_>) -> Result<Vec<Ipv6Addr>> {
    let mut table = Vec::new();
    while !decoder.is_all_read() {
        decoder.open_struct()?;
        table.push(decoder.read_ip6()?);
        decoder.close_struct()?;
    }
    Ok(table)
}

fn decode_srp_service_update(decoder: &mut SpinelDecoder<'_>) -> Result<(u32, SrpHost, Duration)> {
    let id = decoder.read_u32()?;
    let timeout = Duration::from_millis(u64::from(decoder.read_u32()?));
    let full_name = decoder.read_utf8()?;
    let deleted = decoder.read_bool()?;
    let addresses = decode_address_list(decoder.read_data_with_len()?)?;

    let mut services = Vec::new();
    while !decoder.is_all_read() {
        decoder.open_struct()?;
        let instance_full_name = decoder.read_utf8()?;
        let port = decoder.read_u16()?;
        let priority = decoder.read_u16()?;
        let weight = decoder.read_u16()?;
        let service_deleted = decoder.read_bool()?;
        let txt_data = decoder.read_data_with_len()?.to_vec();
        let mut sub_type_labels = Vec::new();
        while !decoder.is_all_read_in_struct() {
            sub_type_labels.push(decoder.read_utf8()?);
        }
        decoder.close_struct()?;

        services.push(SrpService {
            instance_full_name,
            port,
            priority,
            weight,
            txt_data,
            sub_type_labels,
            deleted: service_deleted,
        });
    }

    let host = SrpHost {
        full_name,
        addresses,
        deleted,
        services,
    };
    Ok((id, host, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct FakeInterface {
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        fail: Rc<Cell<bool>>,
    }

    impl SpinelInterface for FakeInterface {
        fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            if self.fail.get() {
                return Err(Error::Failed("link down".to_string()));
            }
            self.sent.borrow_mut().push(frame.to_vec());
            Ok(())
        }
    }

    type Outcome = Rc<RefCell<Vec<Result<()>>>>;

    fn receiver() -> (Outcome, impl FnOnce(Result<()>) + 'static) {
        let outcome: Outcome = Rc::default();
        let sink = outcome.clone();
        (outcome, move |r| sink.borrow_mut().push(r))
    }

    fn setup() -> (NcpSpinel, FakeInterface) {
        let iface = FakeInterface::default();
        (NcpSpinel::new(0, Box::new(iface.clone())), iface)
    }

    /// (tid, cmd, key) of the n-th frame sent.
    fn sent(iface: &FakeInterface, n: usize) -> (u8, u32, u32) {
        let frames = iface.sent.borrow();
        let frame = Frame::parse(&frames[n]).unwrap();
        (frame.tid(), frame.cmd, frame.key)
    }

    fn frame(tid: u8, cmd: u32, key: u32, build: impl FnOnce(&mut SpinelEncoder)) -> Vec<u8> {
        let mut enc = SpinelEncoder::begin_frame(spinel::header(0, tid), cmd, key);
        build(&mut enc);
        enc.end_frame().unwrap()
    }

    fn value_is(tid: u8, key: u32, build: impl FnOnce(&mut SpinelEncoder)) -> Vec<u8> {
        frame(tid, CMD_PROP_VALUE_IS, key, build)
    }

    #[test]
    fn test_second_dataset_set_is_busy_and_first_completes() {
        let (mut ncp, iface) = setup();
        let (first, first_rx) = receiver();
        let (second, second_rx) = receiver();

        ncp.dataset_set_active_tlvs(&[0x0e, 0x08], NcpTask::new(first_rx));
        ncp.dataset_set_active_tlvs(&[0x0e, 0x08], NcpTask::new(second_rx));

        assert_eq!(iface.sent.borrow().len(), 1);
        assert!(first.borrow().is_empty());
        assert!(matches!(second.borrow()[0], Err(Error::Busy)));

        let (tid, cmd, key) = sent(&iface, 0);
        assert_eq!((cmd, key), (CMD_PROP_VALUE_SET, PROP_THREAD_ACTIVE_DATASET_TLVS));

        ncp.handle_frame(&value_is(tid, PROP_THREAD_ACTIVE_DATASET_TLVS, |e| {
            e.write_data(&[0x0e, 0x08]);
        }));

        assert_eq!(first.borrow().len(), 1);
        assert!(first.borrow()[0].is_ok());
        assert_eq!(second.borrow().len(), 1);
        assert_eq!(ncp.active_dataset_tlvs(), &[0x0e, 0x08]);
    }

    #[test]
    fn test_join_runs_steps_in_order() {
        let (mut ncp, iface) = setup();
        let (outcome, rx) = receiver();

        ncp.join(vec![0x01, 0x02], rx);

        let (tid, _, key) = sent(&iface, 0);
        assert_eq!(key, PROP_THREAD_ACTIVE_DATASET_TLVS);
        ncp.handle_frame(&value_is(tid, key, |e| {
            e.write_data(&[0x01, 0x02]);
        }));

        let (tid, _, key) = sent(&iface, 1);
        assert_eq!(key, PROP_NET_IF_UP);
        let event = ncp.handle_frame(&value_is(tid, key, |e| {
            e.write_bool(true);
        }));
        assert_eq!(event, Some(NcpEvent::NetifStateChanged(true)));

        let (tid, _, key) = sent(&iface, 2);
        assert_eq!(key, PROP_NET_STACK_UP);
        assert!(outcome.borrow().is_empty());
        ncp.handle_frame(&value_is(tid, key, |e| {
            e.write_bool(true);
        }));

        assert_eq!(outcome.borrow().len(), 1);
        assert!(outcome.borrow()[0].is_ok());
    }

    #[test]
    fn test_last_status_resolves_slot_with_mapped_error() {
        let (mut ncp, iface) = setup();
        let (outcome, rx) = receiver();

        ncp.ip6_set_enabled(true, NcpTask::new(rx));
        let (tid, _, _) = sent(&iface, 0);
        ncp.handle_frame(&value_is(tid, PROP_LAST_STATUS, |e| {
            e.write_uint_packed(STATUS_INVALID_STATE);
        }));

        assert!(matches!(outcome.borrow()[0], Err(Error::InvalidState)));
    }

    #[test]
    fn test_mismatched_response_fails_task_and_frees_tid() {
        let (mut ncp, iface) = setup();
        let (outcome, rx) = receiver();

        ncp.thread_set_enabled(true, NcpTask::new(rx));
        let (tid, _, _) = sent(&iface, 0);
        ncp.handle_frame(&value_is(tid, PROP_NET_ROLE, |e| {
            e.write_u8(NET_ROLE_LEADER);
        }));

        assert!(matches!(outcome.borrow()[0], Err(Error::Parse)));
        assert_eq!(ncp.tids_in_use, 0);
        // role in a mismatched response is not applied
        assert_eq!(ncp.device_role(), DeviceRole::Disabled);
    }

    #[test]
    fn test_tid_pool_exhaustion() {
        let (mut ncp, _iface) = setup();

        let group: Ipv6Addr = "ff05::1".parse().unwrap();
        for _ in 1..MAX_TIDS {
            ncp.ip6_update_multicast_subscription(&group, true).unwrap();
        }
        assert!(matches!(
            ncp.ip6_update_multicast_subscription(&group, true),
            Err(Error::NoBufs)
        ));

        let (outcome, rx) = receiver();
        ncp.ip6_set_enabled(true, NcpTask::new(rx));
        assert!(matches!(outcome.borrow()[0], Err(Error::NoBufs)));
    }

    #[test]
    fn test_multicast_subscription_updates_address_table() {
        let (mut ncp, iface) = setup();
        let group: Ipv6Addr = "ff05::1234".parse().unwrap();

        ncp.ip6_update_multicast_subscription(&group, true).unwrap();
        ncp.ip6_update_multicast_subscription(&group, false).unwrap();

        let frames = iface.sent.borrow();
        let added = Frame::parse(&frames[0]).unwrap();
        assert_eq!(added.cmd, CMD_PROP_VALUE_INSERT);
        assert_eq!(added.key, PROP_IPV6_MULTICAST_ADDRESS_TABLE);
        assert_eq!(added.payload, &group.octets()[..]);

        let removed = Frame::parse(&frames[1]).unwrap();
        assert_eq!(removed.cmd, CMD_PROP_VALUE_REMOVE);
        assert_eq!(removed.key, PROP_IPV6_MULTICAST_ADDRESS_TABLE);
        assert_eq!(removed.payload, &group.octets()[..]);
    }

    #[test]
    fn test_service_update_result_waits_for_free_tid() {
        let (mut ncp, iface) = setup();
        let group: Ipv6Addr = "ff05::1".parse().unwrap();
        for _ in 1..MAX_TIDS {
            ncp.ip6_update_multicast_subscription(&group, true).unwrap();
        }

        ncp.handle_service_update_result(7, Ok(()));
        ncp.handle_service_update_result(8, Err(Error::Duplicated));
        assert_eq!(iface.sent.borrow().len(), MAX_TIDS - 1);

        // one table response frees exactly one tid
        let (tid, _, _) = sent(&iface, 0);
        ncp.handle_frame(&frame(tid, CMD_PROP_VALUE_INSERTED, PROP_IPV6_MULTICAST_ADDRESS_TABLE, |e| {
            e.write_ip6(&group);
        }));
        assert_eq!(iface.sent.borrow().len(), MAX_TIDS);
        {
            let frames = iface.sent.borrow();
            let result = Frame::parse(&frames[MAX_TIDS - 1]).unwrap();
            assert_eq!(result.key, PROP_SRP_SERVICE_UPDATE_RESULT);
            assert_eq!(result.payload, &[7, 0, 0, 0, error::OT_ERROR_NONE][..]);
        }

        let (tid, _, _) = sent(&iface, 1);
        ncp.handle_frame(&frame(tid, CMD_PROP_VALUE_INSERTED, PROP_IPV6_MULTICAST_ADDRESS_TABLE, |e| {
            e.write_ip6(&group);
        }));
        let frames = iface.sent.borrow();
        let result = Frame::parse(&frames[MAX_TIDS]).unwrap();
        assert_eq!(result.payload, &[8, 0, 0, 0, Error::Duplicated.ot_code()][..]);
        assert!(ncp.pending_results.is_empty());
    }

    #[test]
    fn test_send_failure_frees_tid_and_fails_task() {
        let (mut ncp, iface) = setup();
        let (outcome, rx) = receiver();

        iface.fail.set(true);
        ncp.thread_detach_gracefully(NcpTask::new(rx));

        assert!(matches!(outcome.borrow()[0], Err(Error::Failed(_))));
        assert_eq!(ncp.tids_in_use, 0);
        assert!(ncp.tasks.iter().all(Option::is_none));
    }

    #[test]
    fn test_leave_completes_on_notification_and_net_clear() {
        let (mut ncp, iface) = setup();
        let (outcome, rx) = receiver();

        ncp.leave(rx);
        let (tid, _, key) = sent(&iface, 0);
        assert_eq!(key, PROP_NET_LEAVE_GRACEFULLY);

        // the SET response itself does not finish the detach
        ncp.handle_frame(&value_is(tid, key, |_| {}));
        assert_eq!(iface.sent.borrow().len(), 1);

        ncp.handle_frame(&value_is(0, PROP_NET_LEAVE_GRACEFULLY, |_| {}));
        let (tid, cmd, _) = sent(&iface, 1);
        assert_eq!(cmd, CMD_NET_CLEAR);

        ncp.handle_frame(&value_is(tid, PROP_LAST_STATUS, |e| {
            e.write_uint_packed(STATUS_OK);
        }));
        assert_eq!(outcome.borrow().len(), 1);
        assert!(outcome.borrow()[0].is_ok());
    }

    #[test]
    fn test_schedule_migration_requires_attached_role() {
        let (mut ncp, iface) = setup();
        let (outcome, rx) = receiver();

        ncp.schedule_migration(vec![0x33], rx);
        assert!(matches!(outcome.borrow()[0], Err(Error::InvalidState)));
        assert!(iface.sent.borrow().is_empty());

        ncp.handle_frame(&value_is(0, PROP_NET_ROLE, |e| {
            e.write_u8(NET_ROLE_ROUTER);
        }));
        let (outcome, rx) = receiver();
        ncp.schedule_migration(vec![0x33], rx);
        let (tid, _, key) = sent(&iface, 0);
        assert_eq!(key, PROP_THREAD_MGMT_SET_PENDING_DATASET_TLVS);

        ncp.handle_frame(&value_is(tid, key, |e| {
            e.write_data(&[0x33]);
        }));
        assert!(outcome.borrow().is_empty());

        ncp.handle_frame(&value_is(0, key, |e| {
            e.write_uint_packed(STATUS_OK);
        }));
        assert!(outcome.borrow()[0].is_ok());
    }

    #[test]
    fn test_role_notification_updates_cached_role() {
        let (mut ncp, _iface) = setup();

        let event = ncp.handle_frame(&value_is(0, PROP_NET_ROLE, |e| {
            e.write_u8(NET_ROLE_LEADER);
        }));

        assert_eq!(event, Some(NcpEvent::RoleChanged(DeviceRole::Leader)));
        assert_eq!(ncp.device_role(), DeviceRole::Leader);
    }

    #[test]
    fn test_mesh_local_prefix_notification() {
        let (mut ncp, _iface) = setup();
        let prefix: Ipv6Addr = "fd11:2233:4455:6677::".parse().unwrap();

        ncp.handle_frame(&value_is(0, PROP_IPV6_ML_PREFIX, |e| {
            e.write_ip6(&prefix).write_u8(64);
        }));

        let mlp = ncp.mesh_local_prefix().unwrap();
        assert!(mlp.contains(&"fd11:2233:4455:6677::1".parse().unwrap()));
    }

    #[test]
    fn test_srp_service_update_notification() {
        let (mut ncp, _iface) = setup();
        let addr: Ipv6Addr = "fd00::10".parse().unwrap();

        let event = ncp.handle_frame(&value_is(0, PROP_SRP_SERVICE_UPDATE, |e| {
            e.write_u32(7)
                .write_u32(5000)
                .write_utf8("a.b.example.com.")
                .write_bool(false)
                .write_data_with_len(&addr.octets())
                .open_struct()
                .write_utf8("svc._sub._udp.example.com.")
                .write_u16(1234)
                .write_u16(0)
                .write_u16(0)
                .write_bool(false)
                .write_data_with_len(b"\x03k=v")
                .write_utf8("_color")
                .close_struct();
        }));

        let (id, host, timeout) = match event {
            Some(NcpEvent::SrpServiceUpdate { id, host, timeout }) => (id, host, timeout),
            other => panic!("expected a service update, got {:?}", other),
        };
        assert_eq!(id, 7);
        assert_eq!(timeout, Duration::from_secs(5));
        assert_eq!(host.full_name, "a.b.example.com.");
        assert_eq!(host.addresses, vec![addr]);
        assert_eq!(host.services.len(), 1);
        assert_eq!(host.services[0].port, 1234);
        assert_eq!(host.services[0].sub_type_labels, vec!["_color".to_string()]);
        assert_eq!(ncp.hosts().len(), 1);
    }

    #[test]
    fn test_deleted_host_leaves_host_cache() {
        let (mut ncp, _iface) = setup();
        let update = |deleted: bool| {
            value_is(0, PROP_SRP_SERVICE_UPDATE, move |e| {
                e.write_u32(1)
                    .write_u32(0)
                    .write_utf8("h.example.com.")
                    .write_bool(deleted)
                    .write_data_with_len(&[]);
            })
        };

        ncp.handle_frame(&update(false));
        assert_eq!(ncp.hosts().len(), 1);
        ncp.handle_frame(&update(true));
        assert!(ncp.hosts().is_empty());
    }

    #[test]
    fn test_service_update_result_encoding() {
        let (mut ncp, iface) = setup();

        ncp.handle_service_update_result(9, Err(Error::Duplicated));

        let frames = iface.sent.borrow();
        let frame = Frame::parse(&frames[0]).unwrap();
        assert_eq!(frame.key, PROP_SRP_SERVICE_UPDATE_RESULT);
        assert_eq!(frame.payload, &[9, 0, 0, 0, error::OT_ERROR_DUPLICATED]);
    }

    #[test]
    fn test_malformed_and_idle_frames_are_dropped() {
        let (mut ncp, _iface) = setup();

        assert_eq!(ncp.handle_frame(&[0x00, 0x01]), None);
        assert_eq!(ncp.handle_frame(&value_is(0, PROP_NET_ROLE, |_| {})), None);
        assert_eq!(ncp.handle_frame(&value_is(4, PROP_NET_ROLE, |e| {
            e.write_u8(0);
        })), None);
        assert_eq!(ncp.device_role(), DeviceRole::Disabled);
    }

    #[test]
    fn test_dropping_transport_fails_in_flight_tasks() {
        let (mut ncp, _iface) = setup();
        let (outcome, rx) = receiver();

        ncp.thread_set_enabled(true, NcpTask::new(rx));
        drop(ncp);

        assert!(matches!(outcome.borrow()[0], Err(Error::Failed(_))));
    }
}

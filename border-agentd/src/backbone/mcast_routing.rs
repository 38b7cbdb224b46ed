//! Multicast forwarding between the Thread and backbone interfaces while
//! this node is the primary backbone router.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use shared::ip6::{is_link_local, multicast_scope, SCOPE_REALM_LOCAL};
use shared::types::{BackboneRouterState, MeshLocalPrefix, MulticastListenerEvent};
use shared::Error;

use crate::config::MulticastConfig;

/// Kernel multicast interface slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MifIndex {
    Thread,
    Backbone,
    None,
}

impl MifIndex {
    pub const fn raw(self) -> u16 {
        match self {
            MifIndex::Thread => 0,
            MifIndex::Backbone => 1,
            MifIndex::None => 0xff,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(MifIndex::Thread),
            1 => Some(MifIndex::Backbone),
            0xff => Some(MifIndex::None),
            _ => None,
        }
    }
}

impl fmt::Display for MifIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MifIndex::Thread => "Thread",
            MifIndex::Backbone => "Backbone",
            MifIndex::None => "None",
        };
        f.write_str(s)
    }
}

/// Kernel "no cache entry" upcall type.
pub const MRT6MSG_NOCACHE: u8 = 1;

/// A kernel upcall read from the multicast router socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upcall {
    pub mbz: u8,
    pub msg_type: u8,
    pub mif: u16,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

/// Per-route packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgCount {
    pub packets: u64,
    pub bytes: u64,
    pub wrong_if: u64,
}

/// Kernel multicast routing operations.
pub trait MulticastRouterSocket {
    /// Install a route; `oif` of `MifIndex::None` installs a blocking route.
    fn add_mfc(&mut self, src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex, oif: MifIndex) -> io::Result<()>;

    fn del_mfc(&mut self, src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex) -> io::Result<()>;

    fn sg_count(&self, src: &Ipv6Addr, group: &Ipv6Addr) -> io::Result<SgCount>;

    /// Join or leave `group` on the backbone interface.
    fn update_mld_report(&mut self, group: &Ipv6Addr, join: bool) -> io::Result<()>;
}

/// An open multicast router socket and the upcalls read from it.
pub struct RouterSocket {
    pub socket: Box<dyn MulticastRouterSocket>,
    pub upcalls: mpsc::UnboundedReceiver<Upcall>,
}

/// Opens the router socket given the Thread and backbone interface indices.
pub type SocketOpener = Box<dyn FnMut(u32, u32) -> io::Result<RouterSocket>>;

#[derive(Debug, Clone)]
struct MfcEntry {
    src: Ipv6Addr,
    group: Ipv6Addr,
    iif: MifIndex,
    oif: MifIndex,
    valid_packets: u64,
    last_use: Instant,
}

impl MfcEntry {
    fn new(src: Ipv6Addr, group: Ipv6Addr, iif: MifIndex, oif: MifIndex, now: Instant) -> Self {
        Self {
            src,
            group,
            iif,
            oif,
            valid_packets: 0,
            last_use: now,
        }
    }

    fn set_route(&mut self, iif: MifIndex, oif: MifIndex, now: Instant) {
        self.iif = iif;
        self.oif = oif;
        self.valid_packets = 0;
        self.last_use = now;
    }
}

pub struct MulticastRoutingManager {
    thread_ifindex: u32,
    backbone_ifindex: u32,
    expire_timeout: Duration,
    expire_interval: Duration,
    opener: SocketOpener,
    socket: Option<RouterSocket>,
    listeners: HashSet<Ipv6Addr>,
    table: Vec<Option<MfcEntry>>,
    last_expire: Option<Instant>,
}

impl MulticastRoutingManager {
    pub fn new(config: &MulticastConfig, thread_ifindex: u32, backbone_ifindex: u32, opener: SocketOpener) -> Self {
        Self {
            thread_ifindex,
            backbone_ifindex,
            expire_timeout: config.expire_timeout(),
            expire_interval: config.expire_interval(),
            opener,
            socket: None,
            listeners: HashSet::new(),
            table: vec![None; config.table_size()],
            last_expire: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Failing to set up the router socket is fatal to the caller.
    pub fn handle_state_change(&mut self, state: BackboneRouterState) -> Result<()> {
        tracing::info!("Backbone router state changed to {:?}", state);
        match state {
            BackboneRouterState::Primary => self.enable(),
            BackboneRouterState::Disabled | BackboneRouterState::Secondary => {
                self.disable();
                Ok(())
            }
        }
    }

    pub fn handle_listener_event(&mut self, event: MulticastListenerEvent, group: Ipv6Addr, now: Instant) {
        match event {
            MulticastListenerEvent::Added => {
                self.listeners.insert(group);
                if self.is_enabled() {
                    self.unblock_inbound(&group, now);
                    self.update_mld_report(&group, true);
                    tracing::info!("Added multicast listener {}", group);
                }
            }
            MulticastListenerEvent::Removed => {
                self.listeners.remove(&group);
                if self.is_enabled() {
                    self.remove_inbound(&group);
                    self.update_mld_report(&group, false);
                    tracing::info!("Removed multicast listener {}", group);
                }
            }
        }
    }

    /// Wait for the next kernel upcall. Never resolves while disabled.
    pub async fn next_upcall(&mut self) -> Upcall {
        loop {
            match self.socket.as_mut() {
                Some(socket) => match socket.upcalls.recv().await {
                    Some(upcall) => return upcall,
                    None => {
                        tracing::error!("Multicast router socket reader stopped");
                        self.disable();
                    }
                },
                None => std::future::pending::<()>().await,
            }
        }
    }

    pub fn process_upcall(&mut self, upcall: Upcall, mesh_local_prefix: Option<&MeshLocalPrefix>, now: Instant) {
        if !self.is_enabled() {
            return;
        }

        self.expire(now);

        if upcall.mbz != 0 || upcall.msg_type != MRT6MSG_NOCACHE {
            tracing::debug!("Ignoring multicast router message type {}", upcall.msg_type);
            return;
        }

        if let Err(e) = self.add_mfc(&upcall.src, &upcall.dst, upcall.mif, mesh_local_prefix, now) {
            tracing::warn!(
                "Failed to add route {} => {} from mif {}: {}",
                upcall.src,
                upcall.dst,
                upcall.mif,
                e
            );
        }
    }

    /// Periodic hook; the sweep itself is rate limited.
    pub fn handle_tick(&mut self, now: Instant) {
        if self.is_enabled() {
            self.expire(now);
        }
    }

    fn enable(&mut self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        if self.backbone_ifindex == 0 {
            tracing::info!("No backbone interface, multicast routing stays disabled");
            return Ok(());
        }

        let socket = (self.opener)(self.thread_ifindex, self.backbone_ifindex)
            .context("Failed to initialize multicast router socket")?;
        self.socket = Some(socket);
        tracing::info!("Multicast routing enabled");
        Ok(())
    }

    fn disable(&mut self) {
        if self.socket.take().is_some() {
            self.table.iter_mut().for_each(|slot| *slot = None);
            self.last_expire = None;
            tracing::info!("Multicast routing disabled");
        }
    }

    fn add_mfc(
        &mut self,
        src: &Ipv6Addr,
        group: &Ipv6Addr,
        iif: u16,
        mesh_local_prefix: Option<&MeshLocalPrefix>,
        now: Instant,
    ) -> shared::Result<()> {
        let iif = match MifIndex::from_raw(iif) {
            Some(mif @ (MifIndex::Thread | MifIndex::Backbone)) => mif,
            _ => return Err(Error::InvalidArgs),
        };

        self.expire(now);

        let oif = match iif {
            MifIndex::Backbone if self.listeners.contains(group) => MifIndex::Thread,
            MifIndex::Backbone => MifIndex::None,
            _ => {
                if is_link_local(src) || mesh_local_prefix.is_some_and(|prefix| prefix.contains(src)) {
                    return Ok(());
                }
                // TODO: make the outbound scope threshold configurable
                match multicast_scope(group) {
                    Some(scope) if scope > SCOPE_REALM_LOCAL => MifIndex::Backbone,
                    _ => MifIndex::None,
                }
            }
        };

        // A blocking route keeps the kernel from repeating the upcall; it is
        // turned into a forwarding route when a listener shows up.
        let socket = self.socket_mut()?;
        socket.add_mfc(src, group, iif, oif)?;
        tracing::info!("Added dynamic route {} {} => {} {}", iif, src, group, oif);

        self.save(*src, *group, iif, oif, now);
        Ok(())
    }

    fn save(&mut self, src: Ipv6Addr, group: Ipv6Addr, iif: MifIndex, oif: MifIndex, now: Instant) {
        let mut free = None;
        let mut oldest: Option<(usize, Instant)> = None;

        for (index, slot) in self.table.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.src == src && entry.group == group => {
                    entry.set_route(iif, oif, now);
                    return;
                }
                Some(entry) => {
                    if oldest.map_or(true, |(_, last_use)| entry.last_use < last_use) {
                        oldest = Some((index, entry.last_use));
                    }
                }
                None if free.is_none() => free = Some(index),
                None => {}
            }
        }

        let index = match (free, oldest) {
            (Some(index), _) => index,
            (None, Some((index, _))) => {
                self.remove_at(index);
                index
            }
            // zero sized table
            (None, None) => return,
        };
        self.table[index] = Some(MfcEntry::new(src, group, iif, oif, now));
    }

    fn unblock_inbound(&mut self, group: &Ipv6Addr, now: Instant) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        for entry in self.table.iter_mut().flatten() {
            if entry.iif != MifIndex::Backbone || entry.oif == MifIndex::Thread || entry.group != *group {
                continue;
            }

            match socket.socket.add_mfc(&entry.src, &entry.group, MifIndex::Backbone, MifIndex::Thread) {
                Ok(()) => tracing::info!("Unblocked route Backbone {} => {} Thread", entry.src, entry.group),
                Err(e) => tracing::warn!("Failed to unblock route {} => {}: {}", entry.src, entry.group, e),
            }
            entry.set_route(MifIndex::Backbone, MifIndex::Thread, now);
        }
    }

    fn remove_inbound(&mut self, group: &Ipv6Addr) {
        let indices: Vec<usize> = self
            .table
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Some(entry) if entry.iif == MifIndex::Backbone && entry.group == *group => Some(index),
                _ => None,
            })
            .collect();

        for index in indices {
            self.remove_at(index);
        }
    }

    fn update_mld_report(&mut self, group: &Ipv6Addr, join: bool) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let action = if join { "join" } else { "leave" };
        match socket.socket.update_mld_report(group, join) {
            Ok(()) => tracing::debug!("MLD {} {}", action, group),
            Err(e) => tracing::warn!("Failed to {} multicast group {}: {}", action, group, e),
        }
    }

    fn expire(&mut self, now: Instant) {
        if let Some(last) = self.last_expire {
            if now < last + self.expire_interval {
                return;
            }
        }
        self.last_expire = Some(now);

        for index in 0..self.table.len() {
            let expired = matches!(&self.table[index], Some(entry) if entry.last_use + self.expire_timeout < now);
            if expired && !self.refresh_counters(index, now) {
                self.remove_at(index);
            }
        }

        self.dump();
    }

    /// Returns true if the route carried traffic since the last check.
    fn refresh_counters(&mut self, index: usize, now: Instant) -> bool {
        let (Some(socket), Some(entry)) = (self.socket.as_ref(), self.table[index].as_mut()) else {
            return false;
        };

        match socket.socket.sg_count(&entry.src, &entry.group) {
            Ok(count) => {
                tracing::debug!(
                    "Route {} => {}: bytes={} packets={} wrong_if={}",
                    entry.src,
                    entry.group,
                    count.bytes,
                    count.packets,
                    count.wrong_if
                );
                let valid_packets = count.packets.saturating_sub(count.wrong_if);
                if valid_packets != entry.valid_packets {
                    entry.valid_packets = valid_packets;
                    entry.last_use = now;
                    return true;
                }
                false
            }
            Err(e) => {
                tracing::debug!("Failed to read counters of {} => {}: {}", entry.src, entry.group, e);
                false
            }
        }
    }

    fn remove_at(&mut self, index: usize) {
        let Some(entry) = self.table[index].take() else {
            return;
        };
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        match socket.socket.del_mfc(&entry.src, &entry.group, entry.iif) {
            Ok(()) => tracing::info!("Removed route {} {} => {} {}", entry.iif, entry.src, entry.group, entry.oif),
            Err(e) => tracing::warn!("Failed to remove route {} => {}: {}", entry.src, entry.group, e),
        }
    }

    fn socket_mut(&mut self) -> shared::Result<&mut dyn MulticastRouterSocket> {
        match self.socket.as_mut() {
            Some(socket) => Ok(socket.socket.as_mut()),
            None => Err(Error::InvalidState),
        }
    }

    fn dump(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        tracing::debug!("==================== MFC ENTRIES ====================");
        for entry in self.table.iter().flatten() {
            tracing::debug!("{} {} => {} {}", entry.iif, entry.src, entry.group, entry.oif);
        }
        tracing::debug!("=====================================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Add(Ipv6Addr, Ipv6Addr, MifIndex, MifIndex),
        Del(Ipv6Addr, Ipv6Addr, MifIndex),
        Count(Ipv6Addr, Ipv6Addr),
        Mld(Ipv6Addr, bool),
    }

    #[derive(Default)]
    struct Kernel {
        ops: Vec<Op>,
        counts: HashMap<(Ipv6Addr, Ipv6Addr), SgCount>,
    }

    struct FakeSocket(Rc<RefCell<Kernel>>);

    impl MulticastRouterSocket for FakeSocket {
        fn add_mfc(&mut self, src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex, oif: MifIndex) -> io::Result<()> {
            self.0.borrow_mut().ops.push(Op::Add(*src, *group, iif, oif));
            Ok(())
        }

        fn del_mfc(&mut self, src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex) -> io::Result<()> {
            self.0.borrow_mut().ops.push(Op::Del(*src, *group, iif));
            Ok(())
        }

        fn sg_count(&self, src: &Ipv6Addr, group: &Ipv6Addr) -> io::Result<SgCount> {
            let mut kernel = self.0.borrow_mut();
            kernel.ops.push(Op::Count(*src, *group));
            Ok(kernel.counts.get(&(*src, *group)).copied().unwrap_or_default())
        }

        fn update_mld_report(&mut self, group: &Ipv6Addr, join: bool) -> io::Result<()> {
            self.0.borrow_mut().ops.push(Op::Mld(*group, join));
            Ok(())
        }
    }

    fn config(max_listeners: usize) -> MulticastConfig {
        MulticastConfig {
            max_listeners,
            ..Default::default()
        }
    }

    fn manager(config: &MulticastConfig, backbone_ifindex: u32) -> (MulticastRoutingManager, Rc<RefCell<Kernel>>) {
        let kernel = Rc::new(RefCell::new(Kernel::default()));
        let shared_kernel = kernel.clone();
        let opener: SocketOpener = Box::new(move |thread, backbone| {
            assert_eq!((thread, backbone), (5, backbone_ifindex));
            let (_tx, upcalls) = mpsc::unbounded_channel();
            Ok(RouterSocket {
                socket: Box::new(FakeSocket(shared_kernel.clone())),
                upcalls,
            })
        });
        (MulticastRoutingManager::new(config, 5, backbone_ifindex, opener), kernel)
    }

    fn enabled(config: &MulticastConfig) -> (MulticastRoutingManager, Rc<RefCell<Kernel>>) {
        let (mut mrm, kernel) = manager(config, 7);
        mrm.handle_state_change(BackboneRouterState::Primary).unwrap();
        assert!(mrm.is_enabled());
        (mrm, kernel)
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn upcall(src: &str, dst: &str, mif: MifIndex) -> Upcall {
        Upcall {
            mbz: 0,
            msg_type: MRT6MSG_NOCACHE,
            mif: mif.raw(),
            src: addr(src),
            dst: addr(dst),
        }
    }

    fn adds(kernel: &Rc<RefCell<Kernel>>) -> Vec<Op> {
        kernel
            .borrow()
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Add(..)))
            .cloned()
            .collect()
    }

    #[test]
    fn test_enable_requires_backbone_interface() {
        let config = config(1);
        let (mut mrm, _) = manager(&config, 0);
        mrm.handle_state_change(BackboneRouterState::Primary).unwrap();
        assert!(!mrm.is_enabled());
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let opener: SocketOpener =
            Box::new(|_, _| Err(io::Error::new(io::ErrorKind::PermissionDenied, "no CAP_NET_ADMIN")));
        let mut mrm = MulticastRoutingManager::new(&config(1), 5, 7, opener);
        assert!(mrm.handle_state_change(BackboneRouterState::Primary).is_err());
        assert!(!mrm.is_enabled());
    }

    #[test]
    fn test_inbound_route_follows_listeners() {
        let config = config(1);
        let (mut mrm, kernel) = enabled(&config);
        let now = Instant::now();

        mrm.process_upcall(upcall("2001:db8::1", "ff05::abcd", MifIndex::Backbone), None, now);
        mrm.handle_listener_event(MulticastListenerEvent::Added, addr("ff05::abcd"), now);
        mrm.process_upcall(upcall("2001:db8::2", "ff05::abcd", MifIndex::Backbone), None, now);

        assert_eq!(
            adds(&kernel),
            vec![
                Op::Add(addr("2001:db8::1"), addr("ff05::abcd"), MifIndex::Backbone, MifIndex::None),
                Op::Add(addr("2001:db8::1"), addr("ff05::abcd"), MifIndex::Backbone, MifIndex::Thread),
                Op::Add(addr("2001:db8::2"), addr("ff05::abcd"), MifIndex::Backbone, MifIndex::Thread),
            ]
        );
        assert!(kernel.borrow().ops.contains(&Op::Mld(addr("ff05::abcd"), true)));

        mrm.handle_listener_event(MulticastListenerEvent::Removed, addr("ff05::abcd"), now);
        let ops = kernel.borrow().ops.clone();
        assert!(ops.contains(&Op::Del(addr("2001:db8::1"), addr("ff05::abcd"), MifIndex::Backbone)));
        assert!(ops.contains(&Op::Del(addr("2001:db8::2"), addr("ff05::abcd"), MifIndex::Backbone)));
        assert_eq!(ops.last(), Some(&Op::Mld(addr("ff05::abcd"), false)));
    }

    #[test]
    fn test_outbound_route_rules() {
        let config = config(1);
        let (mut mrm, kernel) = enabled(&config);
        let prefix = MeshLocalPrefix([0xfd, 0xde, 0xad, 0x00, 0xbe, 0xef, 0x00, 0x00]);
        let now = Instant::now();

        // link-local and mesh-local sources are left alone
        mrm.process_upcall(upcall("fe80::1", "ff05::1", MifIndex::Thread), Some(&prefix), now);
        mrm.process_upcall(upcall("fdde:ad00:beef::1", "ff05::1", MifIndex::Thread), Some(&prefix), now);
        assert!(adds(&kernel).is_empty());

        mrm.process_upcall(upcall("fd11::1", "ff05::1", MifIndex::Thread), Some(&prefix), now);
        mrm.process_upcall(upcall("fd11::1", "ff03::1", MifIndex::Thread), Some(&prefix), now);
        assert_eq!(
            adds(&kernel),
            vec![
                Op::Add(addr("fd11::1"), addr("ff05::1"), MifIndex::Thread, MifIndex::Backbone),
                Op::Add(addr("fd11::1"), addr("ff03::1"), MifIndex::Thread, MifIndex::None),
            ]
        );
    }

    #[test]
    fn test_unexpected_upcalls_are_ignored() {
        let config = config(1);
        let (mut mrm, kernel) = enabled(&config);
        let now = Instant::now();

        let mut wrong_type = upcall("2001:db8::1", "ff05::1", MifIndex::Backbone);
        wrong_type.msg_type = 2;
        mrm.process_upcall(wrong_type, None, now);

        let mut bad_mif = upcall("2001:db8::1", "ff05::1", MifIndex::Backbone);
        bad_mif.mif = 3;
        mrm.process_upcall(bad_mif, None, now);

        assert!(adds(&kernel).is_empty());
    }

    #[test]
    fn test_full_table_evicts_least_recently_used() {
        // one listener gives a ten entry table
        let config = config(1);
        let (mut mrm, kernel) = enabled(&config);
        let start = Instant::now();

        for i in 0..10u16 {
            let src = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i + 1);
            let now = start + Duration::from_secs(u64::from(i));
            mrm.process_upcall(
                Upcall {
                    mbz: 0,
                    msg_type: MRT6MSG_NOCACHE,
                    mif: MifIndex::Backbone.raw(),
                    src,
                    dst: addr("ff05::1"),
                },
                None,
                now,
            );
        }
        assert!(!kernel.borrow().ops.iter().any(|op| matches!(op, Op::Del(..))));

        mrm.process_upcall(
            upcall("2001:db8::ff", "ff05::1", MifIndex::Backbone),
            None,
            start + Duration::from_secs(20),
        );

        let ops = kernel.borrow().ops.clone();
        let del = ops.iter().position(|op| *op == Op::Del(addr("2001:db8::1"), addr("ff05::1"), MifIndex::Backbone));
        let add = ops.iter().position(|op| *op == Op::Add(addr("2001:db8::ff"), addr("ff05::1"), MifIndex::Backbone, MifIndex::None));
        assert!(del.is_some());
        assert!(add.is_some());
        assert_eq!(ops.iter().filter(|op| matches!(op, Op::Del(..))).count(), 1);
        assert_eq!(mrm.table.iter().flatten().count(), 10);
        assert!(!mrm.table.iter().flatten().any(|e| e.src == addr("2001:db8::1")));
    }

    #[test]
    fn test_expiry_sweep_is_rate_limited() {
        let config = config(1);
        let (mut mrm, kernel) = enabled(&config);
        let start = Instant::now();

        mrm.process_upcall(upcall("2001:db8::1", "ff05::1", MifIndex::Backbone), None, start);
        mrm.process_upcall(upcall("2001:db8::2", "ff05::2", MifIndex::Backbone), None, start);
        kernel.borrow_mut().counts.insert(
            (addr("2001:db8::2"), addr("ff05::2")),
            SgCount {
                packets: 12,
                bytes: 1200,
                wrong_if: 2,
            },
        );

        let later = start + Duration::from_secs(301);
        mrm.handle_tick(later);
        let ops_after_first = kernel.borrow().ops.len();
        {
            let kernel = kernel.borrow();
            assert_eq!(kernel.ops.iter().filter(|op| matches!(op, Op::Count(..))).count(), 2);
            assert!(kernel.ops.contains(&Op::Del(addr("2001:db8::1"), addr("ff05::1"), MifIndex::Backbone)));
        }
        assert_eq!(mrm.table.iter().flatten().count(), 1);

        // within the interval nothing is queried or removed
        mrm.handle_tick(later + Duration::from_secs(1));
        assert_eq!(kernel.borrow().ops.len(), ops_after_first);

        // the route with traffic was refreshed and is not due yet
        mrm.handle_tick(later + Duration::from_secs(60));
        assert_eq!(kernel.borrow().ops.len(), ops_after_first);
        let entry = mrm.table.iter().flatten().next().unwrap();
        assert_eq!(entry.valid_packets, 10);
    }

    #[test]
    fn test_disable_drops_routes() {
        let config = config(1);
        let (mut mrm, _) = enabled(&config);
        let now = Instant::now();

        mrm.process_upcall(upcall("2001:db8::1", "ff05::1", MifIndex::Backbone), None, now);
        mrm.handle_state_change(BackboneRouterState::Secondary).unwrap();
        assert!(!mrm.is_enabled());
        assert_eq!(mrm.table.iter().flatten().count(), 0);

        // listeners are still tracked while disabled
        mrm.handle_listener_event(MulticastListenerEvent::Added, addr("ff05::1"), now);
        assert!(mrm.listeners.contains(&addr("ff05::1")));
    }
}

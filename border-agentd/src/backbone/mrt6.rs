//! Linux IPv6 multicast routing socket (MRT6).

use std::io::{self, Read};
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, sockaddr_in6, socklen_t};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::mcast_routing::{MifIndex, MulticastRouterSocket, RouterSocket, SgCount, Upcall};

// linux/mroute6.h
const MRT6_INIT: c_int = 200;
const MRT6_ADD_MIF: c_int = 202;
const MRT6_ADD_MFC: c_int = 204;
const MRT6_DEL_MFC: c_int = 205;
const SIOCGETSGCNT_IN6: c_ulong = 0x89e1;
// netinet/icmp6.h
const ICMP6_FILTER: c_int = 1;

const IF_SET_WORDS: usize = 256 / 32;

#[repr(C)]
struct Mif6Ctl {
    mifi: u16,
    flags: u8,
    threshold: u8,
    pifi: u16,
    rate_limit: c_uint,
}

#[repr(C)]
struct Mf6cCtl {
    origin: sockaddr_in6,
    mcastgrp: sockaddr_in6,
    parent: u16,
    ifset: [u32; IF_SET_WORDS],
}

#[repr(C)]
struct SiocSgReq6 {
    src: sockaddr_in6,
    grp: sockaddr_in6,
    pktcnt: c_ulong,
    bytecnt: c_ulong,
    wrong_if: c_ulong,
}

/// Size of `struct mrt6msg`: mbz, msgtype, mif, pad, src, dst.
const MRT6MSG_LEN: usize = 8 + 16 + 16;

/// Parse a kernel `struct mrt6msg`.
pub fn parse_upcall(buf: &[u8]) -> Option<Upcall> {
    if buf.len() < MRT6MSG_LEN {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&buf[8..24]);
    dst.copy_from_slice(&buf[24..40]);

    Some(Upcall {
        mbz: buf[0],
        msg_type: buf[1],
        mif: u16::from_ne_bytes([buf[2], buf[3]]),
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
    })
}

fn sockaddr(addr: &Ipv6Addr) -> sockaddr_in6 {
    // SAFETY: sockaddr_in6 is plain old data; all-zero is a valid value.
    let mut sa: sockaddr_in6 = unsafe { mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_addr.s6_addr = addr.octets();
    sa
}

fn set_option<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    // SAFETY:
    // - fd is an open socket owned by the caller
    // - value points to a live, properly aligned T for the duration of the call
    // - size_of::<T>() is the exact option length
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn mfc_control(src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex, oif: MifIndex) -> Mf6cCtl {
    let mut ctl = Mf6cCtl {
        origin: sockaddr(src),
        mcastgrp: sockaddr(group),
        parent: iif.raw(),
        ifset: [0; IF_SET_WORDS],
    };
    if oif != MifIndex::None {
        let mif = usize::from(oif.raw());
        ctl.ifset[mif / 32] |= 1 << (mif % 32);
    }
    ctl
}

/// The kernel multicast router socket, plus a task forwarding its upcalls.
pub struct Mrt6Socket {
    socket: Arc<AsyncFd<Socket>>,
    backbone_ifindex: u32,
    reader: JoinHandle<()>,
}

impl Mrt6Socket {
    /// Create the socket, enable kernel multicast forwarding and register
    /// the Thread and backbone interfaces as MIF 0 and 1.
    ///
    /// Must be called inside the tokio runtime.
    pub fn open(thread_ifindex: u32, backbone_ifindex: u32) -> io::Result<RouterSocket> {
        let thread_pifi = u16::try_from(thread_ifindex)
            .ok()
            .filter(|&i| i > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Thread interface index is invalid"))?;
        let backbone_pifi = u16::try_from(backbone_ifindex)
            .ok()
            .filter(|&i| i > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Backbone interface index is invalid"))?;

        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        let fd = socket.as_raw_fd();

        let one: c_int = 1;
        set_option(fd, libc::IPPROTO_IPV6, MRT6_INIT, &one)?;

        // The socket only carries routing control; block every ICMPv6 type.
        let block_all = [0xffu8; 32];
        set_option(fd, libc::IPPROTO_ICMPV6, ICMP6_FILTER, &block_all)?;

        for (mif, pifi) in [(MifIndex::Thread, thread_pifi), (MifIndex::Backbone, backbone_pifi)] {
            let ctl = Mif6Ctl {
                mifi: mif.raw(),
                flags: 0,
                threshold: 1,
                pifi,
                rate_limit: 0,
            };
            set_option(fd, libc::IPPROTO_IPV6, MRT6_ADD_MIF, &ctl)?;
        }

        socket.set_nonblocking(true)?;
        let socket = Arc::new(AsyncFd::new(socket)?);
        let (tx, upcalls) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_upcalls(socket.clone(), tx));

        tracing::info!(
            "Multicast router socket ready (Thread ifindex {}, backbone ifindex {})",
            thread_ifindex,
            backbone_ifindex
        );

        Ok(RouterSocket {
            socket: Box::new(Mrt6Socket {
                socket,
                backbone_ifindex,
                reader,
            }),
            upcalls,
        })
    }

    fn fd(&self) -> RawFd {
        self.socket.get_ref().as_raw_fd()
    }
}

impl Drop for Mrt6Socket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl MulticastRouterSocket for Mrt6Socket {
    fn add_mfc(&mut self, src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex, oif: MifIndex) -> io::Result<()> {
        let ctl = mfc_control(src, group, iif, oif);
        set_option(self.fd(), libc::IPPROTO_IPV6, MRT6_ADD_MFC, &ctl)
    }

    fn del_mfc(&mut self, src: &Ipv6Addr, group: &Ipv6Addr, iif: MifIndex) -> io::Result<()> {
        let ctl = mfc_control(src, group, iif, MifIndex::None);
        set_option(self.fd(), libc::IPPROTO_IPV6, MRT6_DEL_MFC, &ctl)
    }

    fn sg_count(&self, src: &Ipv6Addr, group: &Ipv6Addr) -> io::Result<SgCount> {
        let mut req = SiocSgReq6 {
            src: sockaddr(src),
            grp: sockaddr(group),
            pktcnt: 0,
            bytecnt: 0,
            wrong_if: 0,
        };
        // SAFETY: req is a live sioc_sg_req6 the kernel fills in; fd is our open socket.
        let result = unsafe { libc::ioctl(self.fd(), SIOCGETSGCNT_IN6 as _, &mut req as *mut SiocSgReq6) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(SgCount {
            packets: u64::from(req.pktcnt),
            bytes: u64::from(req.bytecnt),
            wrong_if: u64::from(req.wrong_if),
        })
    }

    fn update_mld_report(&mut self, group: &Ipv6Addr, join: bool) -> io::Result<()> {
        let socket = self.socket.get_ref();
        if join {
            socket.join_multicast_v6(group, self.backbone_ifindex)
        } else {
            socket.leave_multicast_v6(group, self.backbone_ifindex)
        }
    }
}

async fn read_upcalls(socket: Arc<AsyncFd<Socket>>, tx: mpsc::UnboundedSender<Upcall>) {
    let mut buf = [0u8; MRT6MSG_LEN];

    loop {
        let mut guard = match socket.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("Multicast router socket poll failed: {}", e);
                return;
            }
        };

        let read = guard.try_io(|inner| {
            let mut socket: &Socket = inner.get_ref();
            socket.read(&mut buf)
        });
        match read {
            Ok(Ok(n)) => match parse_upcall(&buf[..n]) {
                Some(upcall) => {
                    if tx.send(upcall).is_err() {
                        return;
                    }
                }
                None => tracing::debug!("Short multicast router message ({} bytes)", n),
            },
            Ok(Err(e)) => tracing::warn!("Failed to read multicast router message: {}", e),
            Err(_would_block) => continue,
        }
    }
}

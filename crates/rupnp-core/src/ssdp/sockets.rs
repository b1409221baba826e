//! SSDP socket set: multicast listeners plus unicast request sockets.
//!
//! Listeners bind port 1900 once and join the discovery groups on every
//! selected interface; request sockets carry outgoing M-SEARCH traffic and
//! set the multicast egress interface and TTL (4 for IPv4, hop limit 1 for
//! IPv6). Per-socket failures are logged and the other family keeps
//! working; only a set with no listener at all is a hard error.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::{HOST_TEMPLATE, RECV_BUFSIZE, SSDP_IP, SSDP_IPV6_LINKLOCAL, SSDP_IPV6_SITELOCAL, SSDP_PORT};
use crate::config::RuntimeConfig;
use crate::netif::{IfFlags, Interface};

/// Raw datagram plus peer, handed to the dispatch layer.
pub(crate) type PacketHandler = Arc<dyn Fn(String, SocketAddr) + Send + Sync>;

const READ_TICK: Duration = Duration::from_millis(250);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const MCAST_TTL_V4: u32 = 4;
const MCAST_HOPS_V6: u32 = 1;

pub(crate) struct SsdpSockets {
    pub listen_v4: Option<Arc<UdpSocket>>,
    pub listen_v6: Option<Arc<UdpSocket>>,
    pub req_v4: Option<Arc<UdpSocket>>,
    pub req_v6: Option<Arc<UdpSocket>>,
    stop: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl SsdpSockets {
    /// Create and bind the whole socket set for the selected interfaces.
    /// `first_v4` / `first_v6_index` pick the multicast egress.
    pub fn open(
        cfg: &RuntimeConfig,
        selected: &[Interface],
        first_v4: Option<Ipv4Addr>,
        first_v6_index: Option<u32>,
    ) -> io::Result<Self> {
        let has_v4 = first_v4.is_some();
        let has_v6 = cfg.enable_ipv6 && first_v6_index.is_some();

        let listen_v4 = if has_v4 {
            match open_listener_v4(selected) {
                Ok(s) => Some(Arc::new(s)),
                Err(e) => {
                    log::error!("ssdp: ipv4 listener failed: {e}");
                    None
                }
            }
        } else {
            None
        };
        let listen_v6 = if has_v6 {
            match open_listener_v6(selected, cfg.enable_ula_gua) {
                Ok(s) => Some(Arc::new(s)),
                Err(e) => {
                    log::error!("ssdp: ipv6 listener failed: {e}");
                    None
                }
            }
        } else {
            None
        };
        if listen_v4.is_none() && listen_v6.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no SSDP listener could be created",
            ));
        }

        let req_v4 = match first_v4 {
            Some(addr) => match open_request_v4(addr) {
                Ok(s) => Some(Arc::new(s)),
                Err(e) => {
                    log::error!("ssdp: ipv4 request socket failed: {e}");
                    None
                }
            },
            None => None,
        };
        let req_v6 = if has_v6 {
            match open_request_v6(first_v6_index.expect("checked")) {
                Ok(s) => Some(Arc::new(s)),
                Err(e) => {
                    log::error!("ssdp: ipv6 request socket failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            listen_v4,
            listen_v6,
            req_v4,
            req_v6,
            stop: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn one reader thread per listener. Each datagram (truncated to
    /// the receive ceiling) goes through `handler` on the reader thread;
    /// the handler is expected to queue real work elsewhere.
    pub fn start_readers(&self, handler: PacketHandler) {
        let mut readers = self.readers.lock();
        // The request sockets receive the unicast M-SEARCH responses, so
        // they are read exactly like the multicast listeners.
        for (sock, name) in [
            (&self.listen_v4, "ssdp-recv-v4"),
            (&self.listen_v6, "ssdp-recv-v6"),
            (&self.req_v4, "ssdp-recv-req-v4"),
            (&self.req_v6, "ssdp-recv-req-v6"),
        ] {
            let Some(sock) = sock else { continue };
            let sock = Arc::clone(sock);
            let stop = Arc::clone(&self.stop);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || reader_loop(sock, stop, handler))
                .expect("spawn ssdp reader");
            readers.push(handle);
        }
    }

    /// Stop the reader threads and wait for them.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.readers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn reader_loop(sock: Arc<UdpSocket>, stop: Arc<AtomicBool>, handler: PacketHandler) {
    // One spare byte keeps the historical ceiling: a full read means the
    // datagram was truncated at RECV_BUFSIZE - 1 bytes.
    let mut buf = [0u8; RECV_BUFSIZE];
    while !stop.load(Ordering::Relaxed) {
        match sock.recv_from(&mut buf[..RECV_BUFSIZE - 1]) {
            Ok((n, peer)) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                log::debug!("ssdp: {n} bytes from {peer}");
                handler(text, peer);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("ssdp: recv error: {e}");
                thread::sleep(READ_TICK);
            }
        }
    }
}

fn open_listener_v4(selected: &[Interface]) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "macos"
    ))]
    sock.set_reuse_port(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), SSDP_PORT);
    sock.bind(&bind_addr.into())?;
    for itf in selected {
        let Some(addr) = itf.first_ipv4() else { continue };
        if let Err(e) = sock.join_multicast_v4(&SSDP_IP, &addr) {
            log::warn!("ssdp: join {SSDP_IP} on {} ({addr}) failed: {e}", itf.name);
        }
    }
    sock.set_read_timeout(Some(READ_TICK))?;
    Ok(sock.into())
}

fn open_listener_v6(selected: &[Interface], ula_gua: bool) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_only_v6(true)?;
    sock.set_reuse_address(true)?;
    #[cfg(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "macos"
    ))]
    sock.set_reuse_port(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), SSDP_PORT);
    sock.bind(&bind_addr.into())?;
    for itf in selected {
        if !itf.has_flag(IfFlags::HAS_IPV6) {
            continue;
        }
        if let Err(e) = sock.join_multicast_v6(&SSDP_IPV6_LINKLOCAL, itf.index) {
            log::warn!(
                "ssdp: join {SSDP_IPV6_LINKLOCAL} on {} failed: {e}",
                itf.name
            );
        }
        if ula_gua {
            if let Err(e) = sock.join_multicast_v6(&SSDP_IPV6_SITELOCAL, itf.index) {
                log::warn!(
                    "ssdp: join {SSDP_IPV6_SITELOCAL} on {} failed: {e}",
                    itf.name
                );
            }
        }
    }
    sock.set_read_timeout(Some(READ_TICK))?;
    Ok(sock.into())
}

fn open_request_v4(egress: Ipv4Addr) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_multicast_if_v4(&egress)?;
    sock.set_multicast_ttl_v4(MCAST_TTL_V4)?;
    sock.set_write_timeout(Some(SEND_TIMEOUT))?;
    sock.set_read_timeout(Some(READ_TICK))?;
    Ok(sock.into())
}

fn open_request_v6(egress_index: u32) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_only_v6(true)?;
    sock.set_multicast_if_v6(egress_index)?;
    sock.set_multicast_hops_v6(MCAST_HOPS_V6)?;
    sock.set_write_timeout(Some(SEND_TIMEOUT))?;
    sock.set_read_timeout(Some(READ_TICK))?;
    Ok(sock.into())
}

/// Send a batch of advertisement/reply packets to `dest` through a fresh
/// socket, rewriting the host placeholder to `src_addr` on the way out.
/// Stops at the first send failure; the socket closes on every path.
pub(crate) fn send_packets(
    dest: SocketAddr,
    packets: &[String],
    v4_egress: Option<Ipv4Addr>,
    v6_egress_index: Option<u32>,
    src_addr: &str,
) -> io::Result<()> {
    let sock = match dest {
        SocketAddr::V4(_) => {
            let s = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            if let Some(egress) = v4_egress {
                s.set_multicast_if_v4(&egress)?;
            }
            s.set_multicast_ttl_v4(MCAST_TTL_V4)?;
            s
        }
        SocketAddr::V6(_) => {
            let s = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
            s.set_only_v6(true)?;
            if let Some(index) = v6_egress_index {
                s.set_multicast_if_v6(index)?;
            }
            s.set_multicast_hops_v6(MCAST_HOPS_V6)?;
            s
        }
    };
    sock.set_write_timeout(Some(SEND_TIMEOUT))?;
    let sock: UdpSocket = sock.into();
    for packet in packets {
        let wire = packet.replace(HOST_TEMPLATE, src_addr);
        log::debug!("ssdp: send to {dest}:\n{wire}");
        sock.send_to(wire.as_bytes(), dest)?;
    }
    Ok(())
}

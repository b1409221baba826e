//! SSDP engine: discovery over multicast UDP.
//!
//! `parser` turns raw datagrams into typed packets, `target` decomposes
//! USN/NT/ST strings, `sockets` owns the listener and request sockets,
//! `ctrlpt` handles the control-point side (search egress, response and
//! advertisement ingress) and `device` the device side (search replies,
//! advertise/byebye).

pub(crate) mod ctrlpt;
pub(crate) mod device;
pub mod parser;
pub(crate) mod sockets;
pub mod target;

pub use parser::SsdpPacket;
pub use target::{SearchType, SsdpEntity};

use std::net::{Ipv4Addr, Ipv6Addr};

pub const SSDP_PORT: u16 = 1900;
pub const SSDP_IP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_IPV6_LINKLOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
pub const SSDP_IPV6_SITELOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

/// Datagram receive ceiling; longer packets are truncated. Real-world
/// packets occasionally get close to it.
pub const RECV_BUFSIZE: usize = 2500;

/// Placeholder host devices may embed in their description URL; rewritten
/// to the egress interface address when packets are sent.
pub const HOST_TEMPLATE: &str = "@HOSTADDR@";

/// What a validated packet turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpMethod {
    Notify,
    MSearch,
    /// An M-SEARCH response (status line instead of request line).
    Response,
}

/// Quick validation of a parsed packet. Requests must be NOTIFY or
/// M-SEARCH on `*` with one of the three well-known HOST literals;
/// responses pass through (their fields are checked by the control-point
/// handler). `None` means drop.
pub fn validate_packet(packet: &SsdpPacket) -> Option<SsdpMethod> {
    if packet.is_response {
        return Some(SsdpMethod::Response);
    }
    let method = match packet.method {
        Some("NOTIFY") => SsdpMethod::Notify,
        Some("M-SEARCH") => SsdpMethod::MSearch,
        other => {
            log::debug!("ssdp: invalid method {other:?}");
            return None;
        }
    };
    if packet.url != Some("*") {
        log::debug!("ssdp: invalid URI {:?}", packet.url);
        return None;
    }
    let host_ok = matches!(packet.host, Some(h) if h == "239.255.255.250:1900"
        || h.eq_ignore_ascii_case("[FF02::C]:1900")
        || h.eq_ignore_ascii_case("[FF05::C]:1900"));
    if !host_ok {
        log::debug!("ssdp: invalid HOST header {:?}", packet.host);
        return None;
    }
    Some(method)
}

/// Datagram entry point, run on a pool worker: parse, validate, dispatch
/// to the control-point or device side.
pub(crate) fn dispatch_datagram(rt: &crate::runtime::RuntimeInner, text: &str, from: std::net::SocketAddr) {
    let Some(packet) = SsdpPacket::parse(text) else {
        log::debug!("ssdp: parse error on datagram from {from}");
        return;
    };
    match validate_packet(&packet) {
        Some(SsdpMethod::Notify) | Some(SsdpMethod::Response) => {
            ctrlpt::handle_ctrlpt_msg(rt, &packet, from);
        }
        Some(SsdpMethod::MSearch) => {
            device::handle_device_request(rt, &packet, from);
        }
        None => {}
    }
}

//! Device-side SSDP: search replies, advertisements and byebyes.
//!
//! An inbound M-SEARCH schedules one reply job per local device handle at a
//! random sub-MX delay; the job walks the device tree and emits the reply
//! set matching the search type. Advertisements and shutdown byebyes walk
//! the same tree and differ only in NTS and destination (multicast group
//! instead of the searcher's address).

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Weak;
use std::time::Duration;

use rand::Rng;

use super::sockets::send_packets;
use super::target::{same_type_ignoring_version, type_version, SearchType, SsdpEntity};
use super::{SsdpPacket, SSDP_IP, SSDP_IPV6_LINKLOCAL, SSDP_IPV6_SITELOCAL, SSDP_PORT};
use crate::handles::{AddressFamily, DeviceDescription, DeviceState, HandleId};
use crate::netif::{v6_scope, V6Scope};
use crate::runtime::RuntimeInner;
use crate::threadutil::{JobPriority, TimerDuration, When};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgType {
    Shutdown,
    Advertisement,
    Reply,
}

/// RFC 1123 date for the reply DATE header.
fn date_string() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// SERVER header value: OS token, UPnP version, product/version.
pub(crate) fn server_string(product_version: &str) -> String {
    let product = if product_version.is_empty() {
        concat!("rupnp/", env!("CARGO_PKG_VERSION"))
    } else {
        product_version
    };
    format!("{} UPnP/1.0 {}", std::env::consts::OS, product)
}

/// True if the URL's bracketed IPv6 literal is ULA/GUA (not link-local).
fn is_url_v6_ula_gua(url: &str) -> bool {
    let Some(open) = url.find('[') else { return false };
    let Some(close) = url[open..].find(']').map(|p| p + open) else {
        return false;
    };
    match url[open + 1..close].parse::<std::net::Ipv6Addr>() {
        Ok(addr) => v6_scope(&addr) != V6Scope::Link,
        Err(_) => false,
    }
}

/// Build one advertisement, byebye or search-reply packet.
#[allow(clippy::too_many_arguments)]
fn create_service_packet(
    msg_type: MsgType,
    nt: &str,
    usn: &str,
    location: &str,
    duration: u32,
    family: AddressFamily,
    product_version: &str,
    power: (i32, i32, i32),
) -> String {
    let mut out = String::with_capacity(512);
    match msg_type {
        MsgType::Reply => {
            out.push_str("HTTP/1.1 200 OK\r\n");
            out.push_str(&format!("CACHE-CONTROL: max-age={duration}\r\n"));
            out.push_str(&format!("DATE: {}\r\n", date_string()));
            out.push_str("EXT:\r\n");
            out.push_str(&format!("LOCATION: {location}\r\n"));
            out.push_str(&format!("SERVER: {}\r\n", server_string(product_version)));
            out.push_str(&format!("ST: {nt}\r\n"));
            out.push_str(&format!("USN: {usn}\r\n"));
        }
        MsgType::Advertisement | MsgType::Shutdown => {
            let nts = if msg_type == MsgType::Advertisement {
                "ssdp:alive"
            } else {
                "ssdp:byebye"
            };
            let host = match family {
                AddressFamily::V4 => format!("{SSDP_IP}:{SSDP_PORT}"),
                AddressFamily::V6 => {
                    let group = if is_url_v6_ula_gua(location) {
                        SSDP_IPV6_SITELOCAL
                    } else {
                        SSDP_IPV6_LINKLOCAL
                    };
                    format!("[{group}]:{SSDP_PORT}")
                }
            };
            out.push_str("NOTIFY * HTTP/1.1\r\n");
            out.push_str(&format!("HOST: {host}\r\n"));
            // CACHE-CONTROL and LOCATION stay in byebyes too, an old interop
            // concession that nothing on the receiving side minds.
            out.push_str(&format!("CACHE-CONTROL: max-age={duration}\r\n"));
            out.push_str(&format!("LOCATION: {location}\r\n"));
            out.push_str(&format!("SERVER: {}\r\n", server_string(product_version)));
            out.push_str(&format!("NT: {nt}\r\n"));
            out.push_str(&format!("NTS: {nts}\r\n"));
            out.push_str(&format!("USN: {usn}\r\n"));
        }
    }
    let (power_state, sleep_period, registration_state) = power;
    if power_state > 0 {
        out.push_str(&format!("Powerstate: {power_state}\r\n"));
        out.push_str(&format!("SleepPeriod: {sleep_period}\r\n"));
        out.push_str(&format!("RegistrationState: {registration_state}\r\n"));
    }
    out.push_str("\r\n");
    out
}

/// Walk the device tree and build the full advertisement (or byebye) set:
/// three messages for the root, two per embedded device, one per service.
pub(crate) fn advert_messages(dev: &DeviceState, msg_type: MsgType) -> Vec<String> {
    let mut msgs = Vec::new();
    let mut walk: Vec<(&DeviceDescription, bool)> = vec![(&dev.description, true)];
    walk.extend(dev.description.embedded.iter().map(|d| (d, false)));

    let power = (dev.power_state, dev.sleep_period, dev.registration_state);
    let mk = |nt: &str, usn: &str| {
        create_service_packet(
            msg_type,
            nt,
            usn,
            &dev.desc_url,
            dev.max_age,
            dev.address_family,
            &dev.product_version,
            power,
        )
    };

    for (dd, is_root) in walk {
        if is_root {
            msgs.push(mk("upnp:rootdevice", &format!("{}::upnp:rootdevice", dd.udn)));
        }
        msgs.push(mk(&dd.udn, &dd.udn));
        msgs.push(mk(
            &dd.device_type,
            &format!("{}::{}", dd.udn, dd.device_type),
        ));
        for service in &dd.services {
            msgs.push(mk(service, &format!("{}::{}", dd.udn, service)));
        }
    }
    msgs
}

/// Build the reply set for one search against the device tree, honoring the
/// search-type filter and the lower-description-URL version rule: a search
/// for a lower version is answered with the requested type and the lower
/// URL, an equal version with the local type and the normal URL, a higher
/// version not at all.
pub(crate) fn reply_messages(dev: &DeviceState, search: &SsdpEntity) -> Vec<String> {
    let mut msgs = Vec::new();
    let mut walk: Vec<(&DeviceDescription, bool)> = vec![(&dev.description, true)];
    walk.extend(dev.description.embedded.iter().map(|d| (d, false)));

    let power = (dev.power_state, dev.sleep_period, dev.registration_state);
    let mk = |nt: &str, usn: &str, location: &str| {
        create_service_packet(
            MsgType::Reply,
            nt,
            usn,
            location,
            dev.max_age,
            dev.address_family,
            &dev.product_version,
            power,
        )
    };

    for (dd, is_root) in walk {
        match search.request_type {
            SearchType::All => {
                if is_root {
                    msgs.push(mk(
                        "upnp:rootdevice",
                        &format!("{}::upnp:rootdevice", dd.udn),
                        &dev.desc_url,
                    ));
                }
                msgs.push(mk(&dd.udn, &dd.udn, &dev.desc_url));
                msgs.push(mk(
                    &dd.device_type,
                    &format!("{}::{}", dd.udn, dd.device_type),
                    &dev.desc_url,
                ));
            }
            SearchType::RootDevice => {
                if is_root {
                    msgs.push(mk(
                        "upnp:rootdevice",
                        &format!("{}::upnp:rootdevice", dd.udn),
                        &dev.desc_url,
                    ));
                }
            }
            SearchType::DeviceUdn => {
                if !search.udn.is_empty() && search.udn.eq_ignore_ascii_case(&dd.udn) {
                    msgs.push(mk(&dd.udn, &dd.udn, &dev.desc_url));
                }
            }
            SearchType::DeviceType => {
                if same_type_ignoring_version(&search.device_type, &dd.device_type) {
                    match (
                        type_version(&search.device_type),
                        type_version(&dd.device_type),
                    ) {
                        (Some(req_v), Some(loc_v)) if req_v < loc_v => {
                            msgs.push(mk(
                                &search.device_type,
                                &format!("{}::{}", dd.udn, search.device_type),
                                &dev.lower_desc_url,
                            ));
                        }
                        (Some(req_v), Some(loc_v)) if req_v == loc_v => {
                            msgs.push(mk(
                                &dd.device_type,
                                &format!("{}::{}", dd.udn, dd.device_type),
                                &dev.desc_url,
                            ));
                        }
                        _ => {}
                    }
                }
            }
            SearchType::Service => {}
        }

        for service in &dd.services {
            match search.request_type {
                SearchType::All => {
                    msgs.push(mk(service, &format!("{}::{}", dd.udn, service), &dev.desc_url));
                }
                SearchType::Service => {
                    if !same_type_ignoring_version(&search.service_type, service) {
                        continue;
                    }
                    match (type_version(&search.service_type), type_version(service)) {
                        (Some(req_v), Some(loc_v)) if req_v < loc_v => {
                            msgs.push(mk(
                                &search.service_type,
                                &format!("{}::{}", dd.udn, search.service_type),
                                &dev.lower_desc_url,
                            ));
                        }
                        (Some(req_v), Some(loc_v)) if req_v == loc_v => {
                            msgs.push(mk(
                                service,
                                &format!("{}::{}", dd.udn, service),
                                &dev.desc_url,
                            ));
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }
    msgs
}

/// Multicast destination for advertisements of this device.
fn advert_dest(rt: &RuntimeInner, dev: &DeviceState) -> Option<SocketAddr> {
    match dev.address_family {
        AddressFamily::V4 => Some(SocketAddr::V4(SocketAddrV4::new(SSDP_IP, SSDP_PORT))),
        AddressFamily::V6 => {
            let index = rt.net.first_v6_index?;
            let group = if is_url_v6_ula_gua(&dev.desc_url) {
                SSDP_IPV6_SITELOCAL
            } else {
                SSDP_IPV6_LINKLOCAL
            };
            Some(SocketAddr::V6(SocketAddrV6::new(group, SSDP_PORT, 0, index)))
        }
    }
}

/// Host string substituted for the URL placeholder on egress.
fn egress_src_addr(rt: &RuntimeInner, family: AddressFamily) -> String {
    match family {
        AddressFamily::V4 => rt
            .net
            .first_v4
            .map(|a| a.to_string())
            .unwrap_or_default(),
        AddressFamily::V6 => rt
            .net
            .first_v6
            .map(|a| format!("[{a}]"))
            .unwrap_or_default(),
    }
}

/// Send the advertisement or byebye set for a device handle. Advertisements
/// are repeated `num_ssdp_copy` times with `ssdp_pause` spacing.
pub(crate) fn advertise_device(rt: &RuntimeInner, handle: HandleId, msg_type: MsgType) {
    let dev = {
        let handles = rt.handles.lock();
        match handles.device(handle) {
            Ok(d) => d.clone(),
            Err(_) => return,
        }
    };
    let Some(dest) = advert_dest(rt, &dev) else {
        log::warn!("ssdp: no egress for advertisement of handle {handle}");
        return;
    };
    let msgs = advert_messages(&dev, msg_type);
    let src = egress_src_addr(rt, dev.address_family);
    for copy in 0..rt.config.num_ssdp_copy.max(1) {
        if copy != 0 {
            std::thread::sleep(Duration::from_millis(rt.config.ssdp_pause_ms));
        }
        if let Err(e) = send_packets(dest, &msgs, rt.net.first_v4, rt.net.first_v6_index, &src) {
            log::warn!("ssdp: advertisement send failed: {e}");
            return;
        }
    }
}

/// Reply job body: runs on a pool worker after the random sub-MX delay.
fn send_search_reply(rt: &RuntimeInner, handle: HandleId, search: &SsdpEntity, dest: SocketAddr) {
    let dev = {
        let handles = rt.handles.lock();
        match handles.device(handle) {
            Ok(d) => d.clone(),
            Err(_) => return, // unregistered while the reply was pending
        }
    };
    let msgs = reply_messages(&dev, search);
    if msgs.is_empty() {
        return;
    }
    let src = egress_src_addr(rt, dev.address_family);
    if let Err(e) = send_packets(dest, &msgs, rt.net.first_v4, rt.net.first_v6_index, &src) {
        log::warn!("ssdp: search reply to {dest} failed: {e}");
    }
}

/// Inbound M-SEARCH dispatch: validate, then schedule one delayed reply job
/// per local device handle (insertion order). Rejections drop the packet
/// silently.
pub(crate) fn handle_device_request(rt: &RuntimeInner, packet: &SsdpPacket, from: SocketAddr) {
    let Some(man) = packet.man else {
        log::debug!("ssdp: M-SEARCH without MAN header");
        return;
    };
    if man != "\"ssdp:discover\"" {
        log::debug!("ssdp: bad MAN header [{man}]");
        return;
    }
    let mx: i64 = match packet.mx.and_then(|v| v.parse().ok()) {
        Some(v) if v > 0 => v,
        _ => {
            log::debug!("ssdp: no/bad MX header");
            return;
        }
    };
    let Some(search) = packet.st.and_then(super::target::parse_entity) else {
        log::debug!("ssdp: no/bad ST header");
        return;
    };

    let family = match from {
        SocketAddr::V4(_) => AddressFamily::V4,
        SocketAddr::V6(_) => AddressFamily::V6,
    };
    let mx = mx.max(1);
    // Keep a margin under the searcher's deadline for network and
    // processing delays.
    let span = (mx * 1000 - 100).max(1) as u64;

    let mut start: Option<HandleId> = None;
    loop {
        let handle = {
            let handles = rt.handles.lock();
            match handles.next_device_after(start, family) {
                Some((h, _)) => h,
                None => return,
            }
        };
        let delay_ms = rand::rng().random_range(0..span);
        log::debug!("ssdp: scheduling search reply for handle {handle} in {delay_ms} ms");
        let weak: Weak<RuntimeInner> = rt.weak();
        let search = search.clone();
        let scheduled = rt.timer.schedule(
            TimerDuration::ShortTerm,
            When::RelativeMillis(delay_ms),
            JobPriority::Med,
            move || {
                if let Some(rt) = weak.upgrade() {
                    send_search_reply(&rt, handle, &search, from);
                }
            },
        );
        if let Err(e) = scheduled {
            log::warn!("ssdp: could not schedule search reply: {e}");
            return;
        }
        start = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssdp::target::parse_entity;

    fn device() -> DeviceState {
        DeviceState {
            desc_url: "http://192.168.0.9:49152/desc.xml".into(),
            lower_desc_url: "http://192.168.0.9:49152/desc-v1.xml".into(),
            product_version: "acme/2.1".into(),
            max_age: 1800,
            power_state: 0,
            sleep_period: 0,
            registration_state: 0,
            description: DeviceDescription {
                udn: "uuid:root-1".into(),
                device_type: "urn:schemas-upnp-org:device:MediaServer:2".into(),
                services: vec!["urn:schemas-upnp-org:service:ContentDirectory:2".into()],
                embedded: vec![DeviceDescription {
                    udn: "uuid:emb-1".into(),
                    device_type: "urn:schemas-upnp-org:device:Printer:1".into(),
                    services: vec![],
                    embedded: vec![],
                }],
            },
            address_family: AddressFamily::V4,
        }
    }

    #[test]
    fn advertisement_set_covers_tree_and_services() {
        let msgs = advert_messages(&device(), MsgType::Advertisement);
        // Root: rootdevice + udn + type + 1 service; embedded: udn + type.
        assert_eq!(msgs.len(), 6);
        assert!(msgs[0].starts_with("NOTIFY * HTTP/1.1\r\n"));
        assert!(msgs[0].contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(msgs[0].contains("NT: upnp:rootdevice\r\n"));
        assert!(msgs[0].contains("USN: uuid:root-1::upnp:rootdevice\r\n"));
        assert!(msgs[0].contains("NTS: ssdp:alive\r\n"));
        assert!(msgs
            .iter()
            .any(|m| m.contains("NT: urn:schemas-upnp-org:service:ContentDirectory:2\r\n")));
        assert!(msgs.iter().any(|m| m.contains("NT: uuid:emb-1\r\n")));
    }

    #[test]
    fn byebye_set_flips_nts() {
        let msgs = advert_messages(&device(), MsgType::Shutdown);
        assert!(msgs.iter().all(|m| m.contains("NTS: ssdp:byebye\r\n")));
    }

    #[test]
    fn power_headers_appended_when_power_state_positive() {
        let mut dev = device();
        dev.power_state = 1;
        dev.sleep_period = 30;
        dev.registration_state = 2;
        let msgs = advert_messages(&dev, MsgType::Advertisement);
        assert!(msgs[0].contains("Powerstate: 1\r\n"));
        assert!(msgs[0].contains("SleepPeriod: 30\r\n"));
        assert!(msgs[0].contains("RegistrationState: 2\r\n"));
        // Replies carry them too.
        let search = parse_entity("ssdp:all").unwrap();
        let replies = reply_messages(&dev, &search);
        assert!(replies[0].contains("Powerstate: 1\r\n"));
    }

    #[test]
    fn ssdp_all_gets_full_reply_set() {
        let search = parse_entity("ssdp:all").unwrap();
        let msgs = reply_messages(&device(), &search);
        assert_eq!(msgs.len(), 6);
        assert!(msgs.iter().all(|m| m.starts_with("HTTP/1.1 200 OK\r\n")));
        assert!(msgs.iter().all(|m| m.contains("EXT:\r\n")));
        assert!(msgs.iter().all(|m| m.contains("CACHE-CONTROL: max-age=1800\r\n")));
        assert!(msgs.iter().all(|m| m.contains("DATE: ")));
    }

    #[test]
    fn rootdevice_search_gets_single_reply() {
        let search = parse_entity("upnp:rootdevice").unwrap();
        let msgs = reply_messages(&device(), &search);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("ST: upnp:rootdevice\r\n"));
        assert!(msgs[0].contains("USN: uuid:root-1::upnp:rootdevice\r\n"));
    }

    #[test]
    fn udn_search_matches_embedded_device() {
        let search = parse_entity("uuid:emb-1").unwrap();
        let msgs = reply_messages(&device(), &search);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("ST: uuid:emb-1\r\n"));
        assert!(msgs[0].contains("USN: uuid:emb-1\r\n"));
    }

    #[test]
    fn version_mismatch_serves_lower_description_url() {
        // Lower version searched: requested type, lower URL.
        let search = parse_entity("urn:schemas-upnp-org:device:MediaServer:1").unwrap();
        let msgs = reply_messages(&device(), &search);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("ST: urn:schemas-upnp-org:device:MediaServer:1\r\n"));
        assert!(msgs[0].contains("LOCATION: http://192.168.0.9:49152/desc-v1.xml\r\n"));

        // Equal version: local type, normal URL.
        let search = parse_entity("urn:schemas-upnp-org:device:MediaServer:2").unwrap();
        let msgs = reply_messages(&device(), &search);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("LOCATION: http://192.168.0.9:49152/desc.xml\r\n"));

        // Higher version: no reply.
        let search = parse_entity("urn:schemas-upnp-org:device:MediaServer:3").unwrap();
        assert!(reply_messages(&device(), &search).is_empty());
    }

    #[test]
    fn service_search_matches_by_version() {
        let search = parse_entity("urn:schemas-upnp-org:service:ContentDirectory:1").unwrap();
        let msgs = reply_messages(&device(), &search);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("LOCATION: http://192.168.0.9:49152/desc-v1.xml\r\n"));
        assert!(
            msgs[0].contains("ST: urn:schemas-upnp-org:service:ContentDirectory:1\r\n")
        );
    }

    #[test]
    fn v6_advert_host_uses_sitelocal_for_ula_gua_location() {
        let mut dev = device();
        dev.address_family = AddressFamily::V6;
        dev.desc_url = "http://[2001:db8::5]:49152/desc.xml".into();
        let msgs = advert_messages(&dev, MsgType::Advertisement);
        assert!(msgs[0].contains("HOST: [ff05::c]:1900\r\n"));
        dev.desc_url = "http://[fe80::5]:49152/desc.xml".into();
        let msgs = advert_messages(&dev, MsgType::Advertisement);
        assert!(msgs[0].contains("HOST: [ff02::c]:1900\r\n"));
    }
}

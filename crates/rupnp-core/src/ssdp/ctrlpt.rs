//! Control-point SSDP: search egress and discovery ingress.
//!
//! Ingress handles M-SEARCH responses and advertisements addressed to the
//! single registered client handle; each match against an active search
//! becomes a pool job invoking the host callback. Egress builds the
//! M-SEARCH texts, arms the search-timeout timer and emits the configured
//! number of datagram copies per family.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use super::target::{decompose_usn, parse_entity, SearchType};
use super::{SsdpPacket, SSDP_IP, SSDP_IPV6_LINKLOCAL, SSDP_PORT};
use crate::error::{Result, UpnpError};
use crate::events::{Cookie, Discovery, UpnpEvent};
use crate::handles::SsdpSearch;
use crate::netif::scope_url_addr;
use crate::runtime::RuntimeInner;
use crate::threadutil::{JobPriority, TimerDuration, TimerId, When};

/// Parse a CACHE-CONTROL value of the form `max-age=N` (spaces allowed
/// around the `=`). Anything else, including trailing junk, is a reject.
fn parse_max_age(value: &str) -> Option<i32> {
    let lower = value.to_ascii_lowercase();
    let rest = lower.trim_start().strip_prefix("max-age")?;
    let rest = rest.trim_start().strip_prefix('=')?;
    rest.trim().parse().ok()
}

/// IPv6 zone index of the peer, 0 for IPv4.
fn peer_scope_id(from: SocketAddr) -> u32 {
    match from {
        SocketAddr::V4(_) => 0,
        SocketAddr::V6(a) => a.scope_id(),
    }
}

/// Handle an inbound advertisement or M-SEARCH response. Every reject path
/// drops the packet silently, per UDP contract.
pub(crate) fn handle_ctrlpt_msg(rt: &RuntimeInner, packet: &SsdpPacket, from: SocketAddr) {
    // Single registered client; without one there is nobody to tell.
    let callback = {
        let handles = rt.handles.lock();
        match handles.the_client() {
            Some((_, client)) => Arc::clone(&client.callback),
            None => return,
        }
    };

    let mut discovery = Discovery {
        expires: -1,
        dest_addr: Some(from),
        ..Discovery::default()
    };
    if let Some(cc) = packet.cache_control {
        match parse_max_age(cc) {
            Some(age) => discovery.expires = age,
            None => {
                log::debug!("ssdp: bad CACHE-CONTROL value [{cc}]");
                return;
            }
        }
    }
    if let Some(date) = packet.date {
        discovery.date = date.to_string();
    }
    // A LOCATION with an unscoped link-local IPv6 literal is useless later
    // on; qualify it with the peer's zone index or drop the packet.
    if let Some(location) = packet.location {
        match scope_url_addr(location, peer_scope_id(from)) {
            Some(scoped) => discovery.location = scoped,
            None => return,
        }
    }
    if let Some(os) = packet.server.or(packet.user_agent) {
        discovery.os = os.to_string();
    }

    let nt_entity = packet.nt.and_then(parse_entity);
    let usn_parts = packet.usn.and_then(decompose_usn);
    if let Some(e) = &nt_entity {
        discovery.device_id = e.udn.clone();
        discovery.device_type = e.device_type.clone();
        discovery.service_type = e.service_type.clone();
    }
    if let Some(p) = &usn_parts {
        // USN wins where both carry a component.
        if !p.udn.is_empty() {
            discovery.device_id = p.udn.clone();
        }
        if !p.device_type.is_empty() {
            discovery.device_type = p.device_type.clone();
        }
        if !p.service_type.is_empty() {
            discovery.service_type = p.service_type.clone();
        }
    }

    if !packet.is_response {
        let Some(nts) = packet.nts else {
            log::debug!("ssdp: advertisement without NTS header");
            return;
        };
        let event = match nts {
            "ssdp:alive" => {
                if nt_entity.is_none()
                    || usn_parts.is_none()
                    || discovery.location.is_empty()
                    || discovery.expires <= 0
                {
                    return;
                }
                UpnpEvent::AdvertisementAlive(discovery)
            }
            "ssdp:byebye" => {
                if nt_entity.is_none() || usn_parts.is_none() {
                    return;
                }
                UpnpEvent::AdvertisementByebye(discovery)
            }
            _ => {
                log::debug!("ssdp: bad NTS header [{nts}]");
                return;
            }
        };
        callback(&event);
        return;
    }

    // M-SEARCH response: match against the active searches.
    let Some(st) = packet.st else { return };
    let Some(st_entity) = parse_entity(st) else {
        return;
    };
    if packet.status != Some("200")
        || discovery.expires <= 0
        || discovery.location.is_empty()
        || usn_parts.is_none()
    {
        return;
    }

    let matches: Vec<Cookie> = {
        let handles = rt.handles.lock();
        let Some((_, client)) = handles.the_client() else {
            return;
        };
        client
            .searches
            .iter()
            .filter(|search| search_matches(search, st, st_entity.request_type))
            .map(|search| search.cookie)
            .collect()
    };
    for cookie in matches {
        let callback = Arc::clone(&callback);
        let discovery = discovery.clone();
        let queued = rt.pool.add_job(JobPriority::Med, move || {
            callback(&UpnpEvent::SearchResult { discovery, cookie });
        });
        if let Err(e) = queued {
            log::warn!("ssdp: dropping search-result callback: {e}");
        }
    }
}

/// One active search against one response ST, by request type.
fn search_matches(search: &SsdpSearch, st: &str, st_type: SearchType) -> bool {
    match search.request_type {
        SearchType::All => true,
        SearchType::RootDevice => st_type == SearchType::RootDevice,
        // Exact prefix of the search target, length of the ST.
        SearchType::DeviceUdn => search.target.as_bytes().starts_with(st.as_bytes()),
        SearchType::DeviceType | SearchType::Service => {
            let m = st.len().min(search.target.len());
            search.target.as_bytes()[..m] == st.as_bytes()[..m]
        }
    }
}

fn request_text(mx: u32, target: &str, v6: bool) -> String {
    let host = if v6 {
        format!("[{SSDP_IPV6_LINKLOCAL}]:{SSDP_PORT}")
    } else {
        format!("{SSDP_IP}:{SSDP_PORT}")
    };
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {host}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\
         ST: {target}\r\n\
         \r\n"
    )
}

/// Fires when a search's collection window closes: drop the search record
/// and tell the host.
pub(crate) fn search_expired(rt: &RuntimeInner, timer_id: TimerId) {
    let found = {
        let mut handles = rt.handles.lock();
        let Some((_, client)) = handles.the_client_mut() else {
            return;
        };
        client
            .searches
            .iter()
            .position(|s| s.timeout_timer == timer_id)
            .map(|at| {
                let search = client.searches.remove(at);
                (Arc::clone(&client.callback), search.cookie)
            })
    };
    if let Some((callback, cookie)) = found {
        callback(&UpnpEvent::SearchTimeout { cookie });
    }
}

/// Issue an M-SEARCH for `target`. Registers the search for response
/// matching, arms its expiry timer, then emits `num_ssdp_copy` datagrams
/// per enabled family with `ssdp_pause` spacing.
pub(crate) fn search_by_target(
    rt: &RuntimeInner,
    mx: u32,
    target: &str,
    cookie: Cookie,
) -> Result<()> {
    let Some(request_type) = super::target::classify(target) else {
        return Err(UpnpError::InvalidArgument("unrecognized search target"));
    };
    let wait = mx
        .clamp(rt.config.min_search_time, rt.config.max_search_time);

    let sockets = rt.sockets()?;
    if sockets.req_v4.is_none() && sockets.req_v6.is_none() {
        log::error!("ssdp: neither ipv4 nor ipv6 request socket is active");
        return Err(UpnpError::Socket(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no request socket",
        )));
    }

    {
        let mut handles = rt.handles.lock();
        if handles.the_client().is_none() {
            return Err(UpnpError::InvalidHandle);
        }
        // The expiry job resolves its own search record by timer id; the
        // record is published before the lock is released, and the job
        // itself needs this lock, so it can never fire too early.
        let weak = rt.weak();
        let slot = Arc::new(std::sync::OnceLock::new());
        let slot_for_job = Arc::clone(&slot);
        let timer_id = rt
            .timer
            .schedule(
                TimerDuration::ShortTerm,
                When::RelativeSecs(u64::from(wait)),
                JobPriority::Med,
                move || {
                    if let (Some(rt), Some(id)) = (weak.upgrade(), slot_for_job.get()) {
                        search_expired(&rt, *id);
                    }
                },
            )
            .map_err(UpnpError::from)?;
        slot.set(timer_id).expect("fresh slot");
        let (_, client) = handles.the_client_mut().expect("checked above");
        client.searches.push(SsdpSearch {
            target: target.to_string(),
            request_type,
            cookie,
            timeout_timer: timer_id,
        });
    }

    let pause = Duration::from_millis(rt.config.ssdp_pause_ms);
    if let Some(sock) = &sockets.req_v6 {
        if let Some(index) = rt.net.first_v6_index {
            let dest = SocketAddrV6::new(SSDP_IPV6_LINKLOCAL, SSDP_PORT, 0, index);
            let text = request_text(wait, target, true);
            for _ in 0..rt.config.num_ssdp_copy {
                log::debug!("ssdp: send M-SEARCH >>>\n{text}");
                if let Err(e) = sock.send_to(text.as_bytes(), dest) {
                    log::warn!("ssdp: v6 M-SEARCH send failed: {e}");
                }
                std::thread::sleep(pause);
            }
        }
    }
    if let Some(sock) = &sockets.req_v4 {
        let dest = SocketAddrV4::new(SSDP_IP, SSDP_PORT);
        let text = request_text(wait, target, false);
        for _ in 0..rt.config.num_ssdp_copy {
            log::debug!("ssdp: send M-SEARCH >>>\n{text}");
            if let Err(e) = sock.send_to(text.as_bytes(), dest) {
                log::warn!("ssdp: v4 M-SEARCH send failed: {e}");
            }
            std::thread::sleep(pause);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(target: &str, request_type: SearchType) -> SsdpSearch {
        SsdpSearch {
            target: target.to_string(),
            request_type,
            cookie: 7,
            timeout_timer: 0,
        }
    }

    #[test]
    fn max_age_parse_accepts_spacing_variants() {
        assert_eq!(parse_max_age("max-age=1800"), Some(1800));
        assert_eq!(parse_max_age("max-age = 120"), Some(120));
        assert_eq!(parse_max_age("MAX-AGE=5"), Some(5));
        assert_eq!(parse_max_age("no-cache"), None);
        assert_eq!(parse_max_age("max-age=abc"), None);
    }

    #[test]
    fn all_matches_anything() {
        let s = search("ssdp:all", SearchType::All);
        assert!(search_matches(&s, "upnp:rootdevice", SearchType::RootDevice));
        assert!(search_matches(&s, "uuid:whatever", SearchType::DeviceUdn));
    }

    #[test]
    fn rootdevice_matches_only_rootdevice_responses() {
        let s = search("upnp:rootdevice", SearchType::RootDevice);
        assert!(search_matches(&s, "upnp:rootdevice", SearchType::RootDevice));
        assert!(!search_matches(&s, "uuid:abc", SearchType::DeviceUdn));
    }

    #[test]
    fn udn_matches_by_st_prefix() {
        let s = search("uuid:abc-123", SearchType::DeviceUdn);
        assert!(search_matches(&s, "uuid:abc-123", SearchType::DeviceUdn));
        assert!(search_matches(&s, "uuid:abc", SearchType::DeviceUdn));
        assert!(!search_matches(&s, "uuid:abd", SearchType::DeviceUdn));
        // ST longer than the target never matches.
        assert!(!search_matches(&s, "uuid:abc-123-456", SearchType::DeviceUdn));
    }

    #[test]
    fn typed_searches_share_prefix_up_to_shorter() {
        let s = search(
            "urn:schemas-upnp-org:device:MediaServer:1",
            SearchType::DeviceType,
        );
        assert!(search_matches(
            &s,
            "urn:schemas-upnp-org:device:MediaServer:1",
            SearchType::DeviceType
        ));
        // Version digit differs within the compared span.
        assert!(!search_matches(
            &s,
            "urn:schemas-upnp-org:device:MediaServer:2",
            SearchType::DeviceType
        ));
        assert!(!search_matches(
            &s,
            "urn:schemas-upnp-org:device:MediaRenderer:1",
            SearchType::DeviceType
        ));
    }

    #[test]
    fn request_text_shape() {
        let text = request_text(3, "upnp:rootdevice", false);
        assert_eq!(
            text,
            "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\nMX: 3\r\nST: upnp:rootdevice\r\n\r\n"
        );
        let text6 = request_text(3, "ssdp:all", true);
        assert!(text6.contains("HOST: [ff02::c]:1900\r\n"));
    }
}

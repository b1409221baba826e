//! System-independent view of the host's network interfaces.
//!
//! Backed by `pnet_datalink` for the system query; everything downstream
//! (socket binding, HOST headers, URL scoping) works from this snapshot so
//! the engines never talk to the OS interface API directly. The snapshot is
//! refreshable; nothing here caches between `refresh` calls.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IfFlags: u32 {
        const UP = 1;
        const LOOPBACK = 1 << 1;
        const MULTICAST = 1 << 2;
        const HAS_IPV4 = 1 << 3;
        const HAS_IPV6 = 1 << 4;
        const HAS_HWADDR = 1 << 5;
    }
}

/// IPv6 address scope class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V6Scope {
    Link,
    Site,
    Global,
}

/// Scope class of an IPv6 address. Unique-local and global addresses are
/// treated alike; only link-local addresses need a zone index to be usable.
pub fn v6_scope(addr: &Ipv6Addr) -> V6Scope {
    let head = addr.segments()[0];
    if head & 0xffc0 == 0xfe80 {
        V6Scope::Link
    } else if head & 0xffc0 == 0xfec0 {
        V6Scope::Site
    } else {
        V6Scope::Global
    }
}

/// Render a link-local address with its zone index, `fe80::1%3` or
/// `fe80::1%253` for URL contexts (the `%` percent-encoded).
pub fn format_scoped_v6(addr: &Ipv6Addr, scope_id: u32, for_url: bool) -> String {
    if scope_id == 0 || v6_scope(addr) != V6Scope::Link {
        return addr.to_string();
    }
    let sep = if for_url { "%25" } else { "%" };
    format!("{addr}{sep}{scope_id}")
}

/// Inject the peer's zone index into a URL containing an unscoped link-local
/// IPv6 literal: `http://[fe80::1]:80/x` becomes `http://[fe80::1%253]:80/x`
/// for scope id 3. URLs without a bracketed v6 host pass through unchanged;
/// an unparseable bracketed host is an error (`None`), since the URL would
/// be unusable later.
pub fn scope_url_addr(url: &str, scope_id: u32) -> Option<String> {
    let open = match url.find('[') {
        Some(p) => p,
        None => return Some(url.to_string()),
    };
    let close = url[open..].find(']').map(|p| p + open)?;
    let literal = &url[open + 1..close];
    if literal.contains('%') {
        // Already scoped.
        return Some(url.to_string());
    }
    let addr: Ipv6Addr = literal.parse().ok()?;
    if v6_scope(&addr) != V6Scope::Link || scope_id == 0 {
        return Some(url.to_string());
    }
    let mut out = String::with_capacity(url.len() + 6);
    out.push_str(&url[..close]);
    out.push_str("%25");
    out.push_str(&scope_id.to_string());
    out.push_str(&url[close..]);
    Some(out)
}

/// One system interface: identity, flags, hardware address and the list of
/// (address, netmask) pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub friendly_name: String,
    /// Kernel interface index; doubles as the IPv6 link-local scope id.
    pub index: u32,
    pub flags: IfFlags,
    /// Raw hardware address bytes; empty when the interface has none.
    pub hwaddr: Vec<u8>,
    /// Parallel (address, netmask) pairs.
    pub addrs: Vec<(IpAddr, IpAddr)>,
}

impl Interface {
    pub fn has_flag(&self, f: IfFlags) -> bool {
        self.flags.contains(f)
    }

    /// Hardware address as colon-separated hex, empty string if none.
    pub fn hex_hwaddr(&self) -> String {
        self.hwaddr
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|(a, _)| match a {
            IpAddr::V4(v4) => Some(*v4),
            _ => None,
        })
    }

    /// First IPv6 address, optionally restricted to a scope class.
    pub fn first_ipv6(&self, scope: Option<V6Scope>) -> Option<Ipv6Addr> {
        self.addrs.iter().find_map(|(a, _)| match a {
            IpAddr::V6(v6) if scope.is_none() || scope == Some(v6_scope(v6)) => Some(*v6),
            _ => None,
        })
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: <{:?}> index {} hwaddr {}",
            self.name,
            self.flags,
            self.index,
            if self.hwaddr.is_empty() {
                "none".to_string()
            } else {
                self.hex_hwaddr()
            }
        )?;
        for (addr, mask) in &self.addrs {
            writeln!(f, "    {addr} mask {mask}")?;
        }
        Ok(())
    }
}

/// Flag criteria for [`Interfaces::select`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Filter {
    pub needs: IfFlags,
    pub rejects: IfFlags,
}

/// Snapshot of all system interfaces.
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    list: Vec<Interface>,
}

impl Interfaces {
    /// Query the system.
    pub fn from_system() -> Self {
        let mut out = Self::default();
        out.refresh();
        out
    }

    /// Build from a fixed list (tests, simulations).
    pub fn from_list(list: Vec<Interface>) -> Self {
        Self { list }
    }

    /// Re-query the system, replacing the snapshot.
    pub fn refresh(&mut self) {
        self.list.clear();
        for ni in pnet_datalink::interfaces() {
            let mut flags = IfFlags::empty();
            if ni.is_up() {
                flags |= IfFlags::UP;
            }
            if ni.is_loopback() {
                flags |= IfFlags::LOOPBACK;
            }
            if ni.is_multicast() {
                flags |= IfFlags::MULTICAST;
            }
            let hwaddr: Vec<u8> = ni.mac.map(|m| m.octets().to_vec()).unwrap_or_default();
            // An all-zero MAC is as good as no MAC.
            if hwaddr.iter().any(|b| *b != 0) {
                flags |= IfFlags::HAS_HWADDR;
            }
            let mut addrs = Vec::with_capacity(ni.ips.len());
            for net in &ni.ips {
                match net.ip() {
                    IpAddr::V4(_) => flags |= IfFlags::HAS_IPV4,
                    IpAddr::V6(_) => flags |= IfFlags::HAS_IPV6,
                }
                addrs.push((net.ip(), net.mask()));
            }
            let friendly_name = if ni.description.is_empty() {
                ni.name.clone()
            } else {
                ni.description.clone()
            };
            self.list.push(Interface {
                name: ni.name,
                friendly_name,
                index: ni.index,
                flags,
                hwaddr,
                addrs,
            });
        }
    }

    pub fn list(&self) -> &[Interface] {
        &self.list
    }

    /// Look up by kernel name or friendly name.
    pub fn find_by_name(&self, name: &str) -> Option<&Interface> {
        self.list
            .iter()
            .find(|i| i.name == name || i.friendly_name == name)
    }

    /// Interfaces whose flags contain all of `needs` and none of `rejects`.
    pub fn select(&self, filter: &Filter) -> Vec<Interface> {
        self.list
            .iter()
            .filter(|i| {
                i.flags.contains(filter.needs) && (i.flags & filter.rejects).is_empty()
            })
            .cloned()
            .collect()
    }

    /// Find the interface a peer address belongs to, and the local address
    /// facing it.
    ///
    /// IPv4: subnet match on (addr & mask); a single interface with a /32
    /// mask matches anything (jailed hosts report such configs). IPv6:
    /// v4-mapped addresses take the IPv4 path; otherwise the peer's scope id
    /// selects by interface index, defaulting to the first IPv6-capable
    /// interface, and the facing address is the interface's first link-local
    /// address (first IPv6 address if it has no link-local one).
    pub fn interface_for_address(
        &self,
        peer: IpAddr,
        peer_scope: u32,
    ) -> Option<(&Interface, IpAddr)> {
        match peer {
            IpAddr::V4(p) => self.interface_for_v4(p),
            IpAddr::V6(p) => {
                if let Some(mapped) = p.to_ipv4_mapped() {
                    return self.interface_for_v4(mapped);
                }
                let mut found: Option<&Interface> = None;
                for itf in &self.list {
                    if !itf.has_flag(IfFlags::HAS_IPV6) {
                        continue;
                    }
                    if found.is_none() {
                        found = Some(itf);
                    }
                    if peer_scope > 0 && itf.index == peer_scope {
                        found = Some(itf);
                        break;
                    }
                }
                let itf = found?;
                let local = itf
                    .first_ipv6(Some(V6Scope::Link))
                    .or_else(|| itf.first_ipv6(None))?;
                Some((itf, IpAddr::V6(local)))
            }
        }
    }

    fn interface_for_v4(&self, peer: Ipv4Addr) -> Option<(&Interface, IpAddr)> {
        let single = self.list.len() == 1;
        let p = u32::from(peer);
        for itf in &self.list {
            for (addr, mask) in &itf.addrs {
                if let (IpAddr::V4(a), IpAddr::V4(m)) = (addr, mask) {
                    let (a, m) = (u32::from(*a), u32::from(*m));
                    if (single && m == u32::MAX) || (p & m) == (a & m) {
                        return Some((itf, IpAddr::V4(Ipv4Addr::from(a))));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(
        name: &str,
        index: u32,
        flags: IfFlags,
        hwaddr: &[u8],
        addrs: &[(&str, &str)],
    ) -> Interface {
        Interface {
            name: name.to_string(),
            friendly_name: name.to_string(),
            index,
            flags,
            hwaddr: hwaddr.to_vec(),
            addrs: addrs
                .iter()
                .map(|(a, m)| (a.parse().unwrap(), m.parse().unwrap()))
                .collect(),
        }
    }

    fn lan_flags() -> IfFlags {
        IfFlags::UP | IfFlags::MULTICAST | IfFlags::HAS_IPV4 | IfFlags::HAS_HWADDR
    }

    #[test]
    fn subnet_match_picks_owning_interface() {
        let ifs = Interfaces::from_list(vec![
            iface(
                "eth0",
                2,
                lan_flags(),
                &[0xaa, 0xbb, 0xcc, 0, 0, 1],
                &[("192.168.4.10", "255.255.255.0")],
            ),
            iface(
                "eth1",
                3,
                lan_flags(),
                &[0xaa, 0xbb, 0xcc, 0, 0, 2],
                &[("10.0.0.4", "255.0.0.0")],
            ),
        ]);
        let (itf, local) = ifs
            .interface_for_address("10.1.2.3".parse().unwrap(), 0)
            .expect("match");
        assert_eq!(itf.name, "eth1");
        assert_eq!(local, "10.0.0.4".parse::<IpAddr>().unwrap());
        assert!(ifs
            .interface_for_address("172.16.0.1".parse().unwrap(), 0)
            .is_none());
    }

    #[test]
    fn single_interface_with_host_mask_matches_anything() {
        let ifs = Interfaces::from_list(vec![iface(
            "jail0",
            2,
            lan_flags(),
            &[],
            &[("203.0.113.7", "255.255.255.255")],
        )]);
        let (itf, _) = ifs
            .interface_for_address("8.8.8.8".parse().unwrap(), 0)
            .expect("jailed match");
        assert_eq!(itf.name, "jail0");
    }

    #[test]
    fn v6_scope_id_selects_interface() {
        let v6 = IfFlags::UP | IfFlags::MULTICAST | IfFlags::HAS_IPV6;
        let ifs = Interfaces::from_list(vec![
            iface("eth0", 2, v6, &[], &[("fe80::10", "ffff:ffff:ffff:ffff::")]),
            iface("eth1", 3, v6, &[], &[("fe80::20", "ffff:ffff:ffff:ffff::")]),
        ]);
        let (itf, local) = ifs
            .interface_for_address("fe80::1".parse().unwrap(), 3)
            .expect("scope match");
        assert_eq!(itf.name, "eth1");
        assert_eq!(local, "fe80::20".parse::<IpAddr>().unwrap());
        // Scope 0 falls back to the first IPv6-capable interface.
        let (itf, _) = ifs
            .interface_for_address("fe80::1".parse().unwrap(), 0)
            .expect("default match");
        assert_eq!(itf.name, "eth0");
    }

    #[test]
    fn v4_mapped_peer_takes_v4_path() {
        let ifs = Interfaces::from_list(vec![iface(
            "eth0",
            2,
            lan_flags(),
            &[],
            &[("192.168.1.2", "255.255.255.0")],
        )]);
        let peer: IpAddr = "::ffff:192.168.1.77".parse().unwrap();
        let (itf, _) = ifs.interface_for_address(peer, 0).expect("mapped match");
        assert_eq!(itf.name, "eth0");
    }

    #[test]
    fn select_honors_needs_and_rejects() {
        let ifs = Interfaces::from_list(vec![
            iface("lo", 1, IfFlags::UP | IfFlags::LOOPBACK | IfFlags::HAS_IPV4, &[], &[]),
            iface("eth0", 2, lan_flags(), &[1, 2, 3, 4, 5, 6], &[]),
        ]);
        let picked = ifs.select(&Filter {
            needs: IfFlags::HAS_IPV4,
            rejects: IfFlags::LOOPBACK,
        });
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "eth0");
    }

    #[test]
    fn hex_hwaddr_renders_colon_separated() {
        let itf = iface("eth0", 2, lan_flags(), &[0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e], &[]);
        assert_eq!(itf.hex_hwaddr(), "00:1a:2b:3c:4d:5e");
    }

    #[test]
    fn url_scoping_injects_zone_index() {
        assert_eq!(
            scope_url_addr("http://[fe80::1]:80/d.xml", 3).as_deref(),
            Some("http://[fe80::1%253]:80/d.xml")
        );
        // Non-link-local and v4 URLs pass through.
        assert_eq!(
            scope_url_addr("http://[2001:db8::1]:80/d.xml", 3).as_deref(),
            Some("http://[2001:db8::1]:80/d.xml")
        );
        assert_eq!(
            scope_url_addr("http://10.0.0.2:80/d.xml", 3).as_deref(),
            Some("http://10.0.0.2:80/d.xml")
        );
        // Garbage inside the brackets is a hard failure.
        assert_eq!(scope_url_addr("http://[not-an-addr]/", 3), None);
    }

    #[test]
    fn scoped_rendering_for_urls_percent_encodes() {
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        assert_eq!(format_scoped_v6(&addr, 3, false), "fe80::1%3");
        assert_eq!(format_scoped_v6(&addr, 3, true), "fe80::1%253");
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(format_scoped_v6(&global, 3, true), "2001:db8::1");
    }
}

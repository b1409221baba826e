//! Subscription id generation.
//!
//! Time-based pseudo-random uuids with a slight effort to avoid cross-host
//! collisions: the digest input mixes the clock, the pid, a process-wide
//! counter and an interface hardware address (a seeded random number when
//! the host has no usable interface). One mutex serializes the counter and
//! the lazy hwaddr lookup.

use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;

use crate::netif::{Filter, IfFlags, Interfaces};

struct UuidState {
    counter: u64,
    hwaddr: String,
}

static UUID_STATE: Lazy<Mutex<UuidState>> = Lazy::new(|| {
    Mutex::new(UuidState {
        counter: 0,
        hwaddr: String::new(),
    })
});

fn pick_hwaddr() -> String {
    let ifs = Interfaces::from_system();
    let filter = Filter {
        needs: IfFlags::HAS_HWADDR | IfFlags::HAS_IPV4,
        rejects: IfFlags::LOOPBACK,
    };
    for itf in ifs.select(&filter) {
        let hex = itf.hex_hwaddr();
        if !hex.is_empty() {
            return hex;
        }
    }
    // No usable interface; a random number is as unique as we can get.
    rand::rng().random::<u64>().to_string()
}

/// Generate one uuid, `8-4-4-4-12` lowercase hex (no `uuid:` prefix).
pub fn gena_sid_uuid() -> String {
    let mut state = UUID_STATE.lock();

    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    state.counter += 1;
    if state.hwaddr.is_empty() {
        state.hwaddr = pick_hwaddr();
    }

    let seed = format!(
        "{}{}{}{}",
        now_ns,
        std::process::id(),
        state.counter,
        state.hwaddr
    );
    let hash = md5::compute(seed.as_bytes());

    let mut out = String::with_capacity(36);
    for (i, byte) in hash.0.iter().enumerate() {
        out.push_str(&format!("{byte:02x}"));
        if i == 3 || i == 5 || i == 7 || i == 9 {
            out.push('-');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_shape_and_uniqueness() {
        let a = gena_sid_uuid();
        let b = gena_sid_uuid();
        assert_ne!(a, b);
        for id in [&a, &b] {
            assert_eq!(id.len(), 36);
            let groups: Vec<&str> = id.split('-').collect();
            assert_eq!(
                groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
                vec![8, 4, 4, 4, 12]
            );
            assert!(id
                .chars()
                .all(|c| c == '-' || c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}

//! Process-wide registry mapping opaque handles to client/device state.
//!
//! One table per runtime, guarded by a single mutex at the `Runtime` level.
//! Handle ids are dense small integers; a handle registered as a client can
//! never be looked up as a device and vice versa.

use std::collections::BTreeMap;

use crate::error::{Result, UpnpError};
use crate::events::{Cookie, EventCallback};
use crate::ssdp::SearchType;
use crate::threadutil::TimerId;

pub type HandleId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Client,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// One active subscription held by the client against a remote publisher.
#[derive(Debug, Clone)]
pub struct ClientSubscription {
    /// Locally generated `uuid:...` identity handed to the host.
    pub sid: String,
    /// SID assigned by the publisher; NOTIFY dispatch matches on this.
    pub actual_sid: String,
    pub event_url: String,
    /// Live renew timer, if autorenewal is armed. Cancelling the
    /// subscription must cancel this exactly once.
    pub renew_timer: Option<TimerId>,
}

/// One active M-SEARCH the client is collecting responses for.
#[derive(Debug, Clone)]
pub struct SsdpSearch {
    pub target: String,
    pub request_type: SearchType,
    pub cookie: Cookie,
    pub timeout_timer: TimerId,
}

pub struct ClientState {
    pub callback: EventCallback,
    pub subscriptions: Vec<ClientSubscription>,
    pub searches: Vec<SsdpSearch>,
}

/// Device description tree: the root device with its services and embedded
/// devices. Parsed description documents arrive from the host in this form;
/// XML handling stays outside the core.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescription {
    pub udn: String,
    /// `urn:<domain>:device:<type>:<v>`.
    pub device_type: String,
    /// `urn:<domain>:service:<type>:<v>` per service.
    pub services: Vec<String>,
    pub embedded: Vec<DeviceDescription>,
}

/// Everything the SSDP device side needs to advertise and answer searches.
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Description URL; may contain the host placeholder that gets rewritten
    /// per outbound interface.
    pub desc_url: String,
    /// URL served to control points searching for an older version.
    pub lower_desc_url: String,
    /// Prefix for the SERVER header, product/version form.
    pub product_version: String,
    pub max_age: u32,
    pub power_state: i32,
    pub sleep_period: i32,
    pub registration_state: i32,
    pub description: DeviceDescription,
    pub address_family: AddressFamily,
}

pub enum HandleEntry {
    Client(ClientState),
    Device(DeviceState),
}

#[derive(Default)]
pub struct HandleTable {
    entries: BTreeMap<HandleId, HandleEntry>,
    next_id: HandleId,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn insert_client(&mut self, state: ClientState) -> HandleId {
        self.insert(HandleEntry::Client(state))
    }

    pub fn insert_device(&mut self, state: DeviceState) -> HandleId {
        self.insert(HandleEntry::Device(state))
    }

    fn insert(&mut self, entry: HandleEntry) -> HandleId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, entry);
        id
    }

    pub fn remove(&mut self, id: HandleId) -> Option<HandleEntry> {
        self.entries.remove(&id)
    }

    pub fn kind(&self, id: HandleId) -> Option<HandleKind> {
        self.entries.get(&id).map(|e| match e {
            HandleEntry::Client(_) => HandleKind::Client,
            HandleEntry::Device(_) => HandleKind::Device,
        })
    }

    pub fn client(&self, id: HandleId) -> Result<&ClientState> {
        match self.entries.get(&id) {
            Some(HandleEntry::Client(c)) => Ok(c),
            _ => Err(UpnpError::InvalidHandle),
        }
    }

    pub fn client_mut(&mut self, id: HandleId) -> Result<&mut ClientState> {
        match self.entries.get_mut(&id) {
            Some(HandleEntry::Client(c)) => Ok(c),
            _ => Err(UpnpError::InvalidHandle),
        }
    }

    pub fn device(&self, id: HandleId) -> Result<&DeviceState> {
        match self.entries.get(&id) {
            Some(HandleEntry::Device(d)) => Ok(d),
            _ => Err(UpnpError::InvalidHandle),
        }
    }

    /// The single registered client, if any. The runtime supports one
    /// client handle at a time; ingress dispatch resolves it through here.
    pub fn the_client(&self) -> Option<(HandleId, &ClientState)> {
        self.entries.iter().find_map(|(id, e)| match e {
            HandleEntry::Client(c) => Some((*id, c)),
            _ => None,
        })
    }

    pub fn the_client_mut(&mut self) -> Option<(HandleId, &mut ClientState)> {
        self.entries.iter_mut().find_map(|(id, e)| match e {
            HandleEntry::Client(c) => Some((*id, c)),
            _ => None,
        })
    }

    /// Next device handle after `after` (insertion order = id order) whose
    /// registration matches the address family. Drives the per-device
    /// M-SEARCH reply walk.
    pub fn next_device_after(
        &self,
        after: Option<HandleId>,
        family: AddressFamily,
    ) -> Option<(HandleId, &DeviceState)> {
        let start = after.map(|id| id + 1).unwrap_or(0);
        self.entries.range(start..).find_map(|(id, e)| match e {
            HandleEntry::Device(d) if d.address_family == family => Some((*id, d)),
            _ => None,
        })
    }

    pub fn device_ids(&self) -> Vec<HandleId> {
        self.entries
            .iter()
            .filter_map(|(id, e)| match e {
                HandleEntry::Device(_) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn client() -> ClientState {
        ClientState {
            callback: Arc::new(|_| {}),
            subscriptions: Vec::new(),
            searches: Vec::new(),
        }
    }

    fn device(family: AddressFamily) -> DeviceState {
        DeviceState {
            desc_url: "http://192.168.0.2:49152/desc.xml".into(),
            lower_desc_url: "http://192.168.0.2:49152/desc.xml".into(),
            product_version: "test/1.0".into(),
            max_age: 1800,
            power_state: 0,
            sleep_period: 0,
            registration_state: 0,
            description: DeviceDescription::default(),
            address_family: family,
        }
    }

    #[test]
    fn kinds_do_not_cross() {
        let mut table = HandleTable::new();
        let c = table.insert_client(client());
        let d = table.insert_device(device(AddressFamily::V4));
        assert_eq!(table.kind(c), Some(HandleKind::Client));
        assert_eq!(table.kind(d), Some(HandleKind::Device));
        assert!(table.client(c).is_ok());
        assert!(matches!(table.client(d), Err(UpnpError::InvalidHandle)));
        assert!(matches!(table.device(c), Err(UpnpError::InvalidHandle)));
        assert!(table.device(d).is_ok());
        assert!(matches!(table.client(999), Err(UpnpError::InvalidHandle)));
    }

    #[test]
    fn device_walk_follows_insertion_order_and_family() {
        let mut table = HandleTable::new();
        let d1 = table.insert_device(device(AddressFamily::V4));
        let _c = table.insert_client(client());
        let d2 = table.insert_device(device(AddressFamily::V4));
        let _d6 = table.insert_device(device(AddressFamily::V6));

        let (first, _) = table.next_device_after(None, AddressFamily::V4).unwrap();
        assert_eq!(first, d1);
        let (second, _) = table.next_device_after(Some(first), AddressFamily::V4).unwrap();
        assert_eq!(second, d2);
        assert!(table.next_device_after(Some(second), AddressFamily::V4).is_none());
    }

    #[test]
    fn removal_frees_the_id_for_lookup_only() {
        let mut table = HandleTable::new();
        let c = table.insert_client(client());
        assert!(table.remove(c).is_some());
        assert!(table.kind(c).is_none());
        assert!(table.remove(c).is_none());
    }
}

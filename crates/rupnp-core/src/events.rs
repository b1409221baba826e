//! Callback surface towards the host application.
//!
//! The host supplies one [`EventCallback`] when it registers a client
//! handle; every asynchronous outcome (discoveries, search timeouts,
//! property events, renewal trouble) arrives through it, always from a pool
//! worker thread, never from the thread that triggered the operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::UpnpError;

/// Opaque token the host attaches to a search; returned verbatim in
/// [`UpnpEvent::SearchResult`] and [`UpnpEvent::SearchTimeout`].
pub type Cookie = u64;

pub type EventCallback = Arc<dyn Fn(&UpnpEvent) + Send + Sync + 'static>;

/// One discovered device or service, from an M-SEARCH response or an
/// advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// UDN, e.g. `uuid:...`.
    pub device_id: String,
    pub device_type: String,
    /// NT or ST value; carries the version suffix.
    pub service_type: String,
    /// Description URL, scoped with the zone index for link-local IPv6.
    pub location: String,
    /// SERVER or USER-AGENT header, whichever was present.
    pub os: String,
    pub date: String,
    /// Advertisement lifetime in seconds (CACHE-CONTROL max-age).
    pub expires: i32,
    pub dest_addr: Option<SocketAddr>,
}

/// A parsed GENA property set delivered by NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEvent {
    /// Our SID (the locally generated one handed back at subscribe time).
    pub sid: String,
    /// SEQ header; 0 on the initial event.
    pub event_key: u32,
    pub changed: HashMap<String, String>,
}

#[derive(Debug)]
pub enum UpnpEvent {
    SearchResult { discovery: Discovery, cookie: Cookie },
    SearchTimeout { cookie: Cookie },
    AdvertisementAlive(Discovery),
    AdvertisementByebye(Discovery),
    EventReceived(PropertyEvent),
    /// Autorenewal is disabled and the subscription's lifetime ran out; the
    /// record has been deleted.
    SubscriptionExpired { sid: String, event_url: String },
    /// A renew attempt failed for a reason other than a stale SID/handle.
    AutoRenewalFailed {
        sid: String,
        event_url: String,
        error: UpnpError,
    },
}

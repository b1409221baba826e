//! GENA engine: client-side subscription lifecycle and NOTIFY ingestion.
//!
//! `ctrlpt` drives SUBSCRIBE / RENEW / UNSUBSCRIBE over the [`HttpClient`]
//! seam and keeps the auto-renew timers armed; `notify` validates and
//! dispatches property-set events arriving through the host's web server;
//! `sids` generates the local subscription identities.

pub(crate) mod ctrlpt;
pub mod http;
pub mod notify;
pub mod sids;

pub use http::{HttpClient, HttpResponse};
pub use notify::NotifyTransaction;

/// Floor for the TIMEOUT we request from publishers, in seconds.
pub const CP_MINIMUM_SUBSCRIPTION_TIME: i32 = 5;

/// TIMEOUT value meaning "never expires".
pub const TIMEOUT_INFINITE: i32 = -1;

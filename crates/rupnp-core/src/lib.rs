//! Core of a UPnP control-point / device runtime: SSDP discovery over
//! multicast UDP, client-side GENA eventing, and the worker-pool/timer
//! machinery driving both.
//!
//! The host application supplies the outer surfaces this crate stays away
//! from: an HTTP server that feeds NOTIFY transactions into
//! [`Runtime::notify`], an HTTP client if the default one is not wanted
//! (see [`HttpClient`]), and pre-parsed device descriptions.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rupnp_core::{Runtime, RuntimeConfig, UpnpEvent};
//!
//! let rt = Runtime::new(RuntimeConfig::default())?;
//! let client = rt.register_client(Arc::new(|event| {
//!     if let UpnpEvent::SearchResult { discovery, .. } = event {
//!         println!("found {} at {}", discovery.device_id, discovery.location);
//!     }
//! }))?;
//! rt.search(5, "ssdp:all", 0)?;
//! # let _ = client;
//! # Ok::<(), rupnp_core::UpnpError>(())
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod gena;
pub mod handles;
pub mod netif;
pub mod ssdp;
pub mod threadutil;

mod runtime;

pub use config::{RuntimeConfig, SchedPolicy};
pub use error::{Result, UpnpError};
pub use events::{Cookie, Discovery, EventCallback, PropertyEvent, UpnpEvent};
pub use gena::{HttpClient, HttpResponse, NotifyTransaction};
pub use handles::{AddressFamily, DeviceDescription, DeviceState, HandleId, HandleKind};
pub use runtime::Runtime;

//! Runtime assembly: one value owning the pool, timer, sockets, interface
//! view and handle table.
//!
//! Everything the engines share lives in [`RuntimeInner`]; the public
//! [`Runtime`] is a thin owner whose `shutdown` (also run on drop) stops
//! ingress first, then the timer, then the pool, so no callback can fire
//! after it returns.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{Result, UpnpError};
use crate::events::{Cookie, EventCallback};
use crate::gena;
use crate::gena::http::HttpClient;
use crate::gena::notify::NotifyTransaction;
use crate::handles::{ClientState, DeviceState, HandleId, HandleTable};
use crate::netif::{Filter, IfFlags, Interface, Interfaces, V6Scope};
use crate::ssdp;
use crate::ssdp::device::MsgType;
use crate::ssdp::sockets::SsdpSockets;
use crate::threadutil::{JobPriority, ThreadPool, ThreadPoolStats, TimerThread};

/// Selected interfaces and the derived egress facts, frozen at init.
pub(crate) struct NetView {
    pub selected: Vec<Interface>,
    pub first_v4: Option<Ipv4Addr>,
    pub first_v6: Option<Ipv6Addr>,
    pub first_v6_index: Option<u32>,
}

impl NetView {
    fn build(config: &RuntimeConfig) -> NetView {
        let interfaces = Interfaces::from_system();
        let selected: Vec<Interface> = if config.use_all_interfaces {
            interfaces.select(&Filter {
                needs: IfFlags::UP | IfFlags::MULTICAST,
                rejects: IfFlags::LOOPBACK,
            })
        } else {
            config
                .selected_interfaces
                .iter()
                .filter_map(|name| interfaces.find_by_name(name).cloned())
                .collect()
        };
        let first_v4 = selected.iter().find_map(|i| i.first_ipv4());
        let (first_v6, first_v6_index) = if config.enable_ipv6 {
            selected
                .iter()
                .filter(|i| i.has_flag(IfFlags::HAS_IPV6))
                .find_map(|i| {
                    i.first_ipv6(Some(V6Scope::Link))
                        .or_else(|| i.first_ipv6(None))
                        .map(|a| (Some(a), Some(i.index)))
                })
                .unwrap_or((None, None))
        } else {
            (None, None)
        };
        NetView {
            selected,
            first_v4,
            first_v6,
            first_v6_index,
        }
    }
}

pub(crate) struct RuntimeInner {
    pub config: RuntimeConfig,
    pub pool: ThreadPool,
    pub timer: TimerThread,
    pub handles: Mutex<HandleTable>,
    /// Serializes SUBSCRIBE/RENEW against NOTIFY's SEQ-0 race.
    pub subscribe_lock: Mutex<()>,
    pub net: NetView,
    pub http: Arc<dyn HttpClient>,
    sockets: OnceCell<SsdpSockets>,
    /// (v4, v6) ports of the host's web server, for CALLBACK URLs.
    local_ports: Mutex<(u16, u16)>,
    finalized: AtomicBool,
    self_weak: Weak<RuntimeInner>,
}

impl RuntimeInner {
    pub fn weak(&self) -> Weak<RuntimeInner> {
        self.self_weak.clone()
    }

    pub fn sockets(&self) -> Result<&SsdpSockets> {
        if self.finalized.load(Ordering::Relaxed) {
            return Err(UpnpError::Finalized);
        }
        self.sockets.get().ok_or(UpnpError::Finalized)
    }

    pub fn local_ports(&self) -> (u16, u16) {
        *self.local_ports.lock()
    }

    fn check_live(&self) -> Result<()> {
        if self.finalized.load(Ordering::Relaxed) {
            Err(UpnpError::Finalized)
        } else {
            Ok(())
        }
    }
}

/// The assembled discovery/eventing runtime. Construct with
/// [`Runtime::new`], tear down with [`Runtime::shutdown`] (or drop).
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Build and start everything: worker pool, timer, interface snapshot,
    /// SSDP sockets and their reader threads.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        #[cfg(feature = "ureq-client")]
        let http: Arc<dyn HttpClient> = Arc::new(crate::gena::http::UreqClient::new());
        #[cfg(not(feature = "ureq-client"))]
        let http: Arc<dyn HttpClient> = {
            struct NoClient;
            impl HttpClient for NoClient {
                fn request(
                    &self,
                    _: &str,
                    _: &str,
                    _: &[(String, String)],
                ) -> Result<crate::gena::http::HttpResponse> {
                    Err(UpnpError::Transport("no HTTP client configured".into()))
                }
            }
            Arc::new(NoClient)
        };
        Self::with_http_client(config, http)
    }

    /// Like [`Runtime::new`] with a custom [`HttpClient`] behind the GENA
    /// exchanges.
    pub fn with_http_client(mut config: RuntimeConfig, http: Arc<dyn HttpClient>) -> Result<Self> {
        config.normalize()?;
        let net = NetView::build(&config);
        log::info!(
            "runtime: {} interfaces selected, first v4 {:?}, first v6 {:?}",
            net.selected.len(),
            net.first_v4,
            net.first_v6
        );

        let pool = ThreadPool::start(config.pool_attr())?;
        let timer = TimerThread::start(&pool)?;
        let sockets = SsdpSockets::open(&config, &net.selected, net.first_v4, net.first_v6_index)?;

        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| RuntimeInner {
            config,
            pool,
            timer,
            handles: Mutex::new(HandleTable::new()),
            subscribe_lock: Mutex::new(()),
            net,
            http,
            sockets: OnceCell::new(),
            local_ports: Mutex::new((0, 0)),
            finalized: AtomicBool::new(false),
            self_weak: weak.clone(),
        });

        // Reader threads queue one pool job per datagram; the weak handle
        // keeps socket threads from pinning the runtime alive.
        let weak = inner.weak();
        let handler: crate::ssdp::sockets::PacketHandler = Arc::new(move |text, from| {
            let Some(rt) = weak.upgrade() else { return };
            let weak_job = rt.weak();
            let queued = rt.pool.add_job(JobPriority::Med, move || {
                if let Some(rt) = weak_job.upgrade() {
                    ssdp::dispatch_datagram(&rt, &text, from);
                }
            });
            if let Err(e) = queued {
                log::warn!("ssdp: datagram dropped, pool refused job: {e}");
            }
        });
        sockets.start_readers(handler);
        inner
            .sockets
            .set(sockets)
            .unwrap_or_else(|_| unreachable!("sockets set once at init"));

        Ok(Self { inner })
    }

    /// Tell the runtime where the host's web server listens; used to build
    /// the CALLBACK URL in SUBSCRIBE requests.
    pub fn set_local_ports(&self, v4_port: u16, v6_port: u16) {
        *self.inner.local_ports.lock() = (v4_port, v6_port);
    }

    /// Register the control-point side. One client handle per runtime.
    pub fn register_client(&self, callback: EventCallback) -> Result<HandleId> {
        self.inner.check_live()?;
        let mut handles = self.inner.handles.lock();
        if handles.the_client().is_some() {
            return Err(UpnpError::InvalidArgument("client already registered"));
        }
        Ok(handles.insert_client(ClientState {
            callback,
            subscriptions: Vec::new(),
            searches: Vec::new(),
        }))
    }

    /// Register a local device tree for advertisement and search replies.
    pub fn register_device(&self, mut device: DeviceState) -> Result<HandleId> {
        self.inner.check_live()?;
        if device.description.udn.is_empty() {
            return Err(UpnpError::InvalidArgument("device UDN is empty"));
        }
        if device.max_age == 0 {
            device.max_age = self.inner.config.max_age;
        }
        if device.lower_desc_url.is_empty() {
            device.lower_desc_url = device.desc_url.clone();
        }
        Ok(self.inner.handles.lock().insert_device(device))
    }

    /// Unregister any handle. Devices send their byebye set first; clients
    /// drop all subscriptions (best-effort UNSUBSCRIBE) and searches.
    pub fn unregister(&self, handle: HandleId) -> Result<()> {
        self.inner.check_live()?;
        let kind = {
            let handles = self.inner.handles.lock();
            handles.kind(handle).ok_or(UpnpError::InvalidHandle)?
        };
        match kind {
            crate::handles::HandleKind::Device => {
                ssdp::device::advertise_device(&self.inner, handle, MsgType::Shutdown);
            }
            crate::handles::HandleKind::Client => {
                gena::ctrlpt::unsubscribe_all(&self.inner, handle);
                let searches = {
                    let mut handles = self.inner.handles.lock();
                    match handles.client_mut(handle) {
                        Ok(c) => std::mem::take(&mut c.searches),
                        Err(_) => Vec::new(),
                    }
                };
                for search in searches {
                    self.inner.timer.remove(search.timeout_timer);
                }
            }
        }
        self.inner.handles.lock().remove(handle);
        Ok(())
    }

    /// Send the `ssdp:alive` set for a device handle, `num_ssdp_copy`
    /// times. Blocking; run it from a pool job if that matters.
    pub fn advertise(&self, handle: HandleId) -> Result<()> {
        self.inner.check_live()?;
        {
            let handles = self.inner.handles.lock();
            handles.device(handle)?;
        }
        ssdp::device::advertise_device(&self.inner, handle, MsgType::Advertisement);
        Ok(())
    }

    /// Issue an M-SEARCH; matching responses and the final timeout arrive
    /// through the client callback with `cookie`. `mx` 0 takes the
    /// configured default.
    pub fn search(&self, mx: u32, target: &str, cookie: Cookie) -> Result<()> {
        self.inner.check_live()?;
        let mx = if mx == 0 { self.inner.config.mx } else { mx };
        ssdp::ctrlpt::search_by_target(&self.inner, mx, target, cookie)
    }

    /// Subscribe to a publisher's event URL. See [`gena::ctrlpt::subscribe`]
    /// semantics: `timeout` in/out, returned SID identifies the
    /// subscription from now on.
    pub fn subscribe(
        &self,
        handle: HandleId,
        publisher_url: &str,
        timeout: &mut i32,
    ) -> Result<String> {
        self.inner.check_live()?;
        gena::ctrlpt::subscribe(&self.inner, handle, publisher_url, timeout)
    }

    pub fn renew(&self, handle: HandleId, sid: &str, timeout: &mut i32) -> Result<()> {
        self.inner.check_live()?;
        gena::ctrlpt::renew(&self.inner, handle, sid, timeout)
    }

    pub fn unsubscribe(&self, handle: HandleId, sid: &str) -> Result<()> {
        self.inner.check_live()?;
        gena::ctrlpt::unsubscribe(&self.inner, handle, sid)
    }

    /// Feed an inbound NOTIFY from the host's web server. Returns the HTTP
    /// status to answer with; the callback, if any, is queued on the pool.
    pub fn notify(&self, transaction: &NotifyTransaction) -> u16 {
        if self.inner.check_live().is_err() {
            return 412;
        }
        gena::notify::process_notify(&self.inner, transaction)
    }

    /// Selected interfaces as seen at init.
    pub fn interfaces(&self) -> &[Interface] {
        &self.inner.net.selected
    }

    /// The active configuration (normalized).
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn pool_stats(&self) -> ThreadPoolStats {
        self.inner.pool.stats()
    }

    /// Stop ingress, the timer and the pool, in that order. Devices still
    /// registered get their byebye out first. Idempotent; after return no
    /// further callbacks fire and all sockets are closed.
    pub fn shutdown(&self) {
        if self.inner.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let device_ids = self.inner.handles.lock().device_ids();
        for id in device_ids {
            ssdp::device::advertise_device(&self.inner, id, MsgType::Shutdown);
        }
        if let Some(sockets) = self.inner.sockets.get() {
            sockets.shutdown();
        }
        self.inner.timer.shutdown();
        self.inner.pool.shutdown();
        // Drop handle state (callbacks, cookies) after the workers exit.
        let mut handles = self.inner.handles.lock();
        *handles = HandleTable::new();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
impl Runtime {
    /// Test-only assembly without sockets or reader threads; ingress is
    /// driven by calling the dispatchers directly.
    pub(crate) fn without_sockets(
        mut config: RuntimeConfig,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        config.normalize()?;
        let net = NetView::build(&config);
        let pool = ThreadPool::start(config.pool_attr())?;
        let timer = TimerThread::start(&pool)?;
        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| RuntimeInner {
            config,
            pool,
            timer,
            handles: Mutex::new(HandleTable::new()),
            subscribe_lock: Mutex::new(()),
            net,
            http,
            sockets: OnceCell::new(),
            local_ports: Mutex::new((0, 0)),
            finalized: AtomicBool::new(false),
            self_weak: weak.clone(),
        });
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }
}

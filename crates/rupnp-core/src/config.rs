//! Runtime configuration.
//!
//! Every tunable the engines consult lives here. A config can be built in
//! code (struct update syntax over `Default`) or loaded from a TOML file.
//! Unknown keys are rejected so a typo in a deployment file fails loudly
//! instead of silently running with defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, UpnpError};
use crate::threadutil::ThreadPoolAttr;

/// Hard ceiling for `soap_content_length`; larger values are clamped.
pub const MAX_SOAP_CONTENT_LENGTH: usize = 32_000;

/// Requested scheduling class for pool workers. Applied best-effort: on
/// platforms without the POSIX realtime classes this is recorded but has no
/// effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    #[default]
    Other,
    Fifo,
    RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    // Worker pool.
    pub min_threads: usize,
    pub max_threads: usize,
    pub max_idle_time_ms: u64,
    pub jobs_per_thread: usize,
    pub max_jobs_total: usize,
    pub starvation_time_ms: u64,
    pub sched_policy: SchedPolicy,
    /// 0 keeps the platform default stack size.
    pub stack_size: usize,

    // Discovery.
    /// Default MX seconds put in outgoing M-SEARCH requests.
    pub mx: u32,
    /// Default advertisement max-age seconds.
    pub max_age: u32,
    pub num_ssdp_copy: u32,
    pub ssdp_pause_ms: u64,
    pub min_search_time: u32,
    pub max_search_time: u32,

    // Eventing.
    /// Seconds subtracted from the granted TIMEOUT when arming the renew
    /// timer. 0 disables autorenewal: subscriptions expire and the host is
    /// notified instead.
    pub auto_renew_guard: u32,
    /// Accepted SOAP body ceiling, kept for the outer layers that size
    /// buffers from it. Clamped to [`MAX_SOAP_CONTENT_LENGTH`].
    pub soap_content_length: usize,

    // Address families and interface selection.
    pub enable_ipv6: bool,
    /// Also join/announce on the site-local FF05::C group (ULA/GUA hosts).
    pub enable_ula_gua: bool,
    /// When false, only `selected_interfaces` are used.
    pub use_all_interfaces: bool,
    /// Interface names (kernel or friendly) to restrict to.
    pub selected_interfaces: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 10,
            max_idle_time_ms: 10_000,
            jobs_per_thread: 10,
            max_jobs_total: 500,
            starvation_time_ms: 500,
            sched_policy: SchedPolicy::Other,
            stack_size: 0,
            mx: 5,
            max_age: 1800,
            num_ssdp_copy: 2,
            ssdp_pause_ms: 100,
            min_search_time: 2,
            max_search_time: 80,
            auto_renew_guard: 30,
            soap_content_length: 16_000,
            enable_ipv6: true,
            enable_ula_gua: false,
            use_all_interfaces: true,
            selected_interfaces: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut cfg: RuntimeConfig =
            toml::from_str(text).map_err(|e| UpnpError::Config(e.to_string()))?;
        cfg.normalize()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| UpnpError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Clamp and sanity-check. Called by the loaders; call it yourself after
    /// building a config by hand.
    pub fn normalize(&mut self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(UpnpError::Config("max_threads must be >= 1".into()));
        }
        if self.min_threads > self.max_threads {
            return Err(UpnpError::Config("min_threads exceeds max_threads".into()));
        }
        if self.min_search_time > self.max_search_time {
            return Err(UpnpError::Config(
                "min_search_time exceeds max_search_time".into(),
            ));
        }
        self.soap_content_length = self.soap_content_length.min(MAX_SOAP_CONTENT_LENGTH);
        Ok(())
    }

    pub fn pool_attr(&self) -> ThreadPoolAttr {
        ThreadPoolAttr {
            min_threads: self.min_threads,
            max_threads: self.max_threads,
            stack_size: self.stack_size,
            max_idle_time: Duration::from_millis(self.max_idle_time_ms),
            jobs_per_thread: self.jobs_per_thread,
            max_jobs_total: self.max_jobs_total,
            starvation_time: Duration::from_millis(self.starvation_time_ms),
            sched_policy: self.sched_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.mx, 5);
        assert_eq!(cfg.max_age, 1800);
        assert_eq!(cfg.soap_content_length, 16_000);
        assert!(cfg.enable_ipv6);
        assert!(cfg.use_all_interfaces);
    }

    #[test]
    fn toml_roundtrip_and_clamp() {
        let cfg = RuntimeConfig::from_toml_str(
            r#"
            max_threads = 4
            mx = 3
            soap_content_length = 99999
            auto_renew_guard = 0
            selected_interfaces = ["eth0", "wlan0"]
            use_all_interfaces = false
            "#,
        )
        .expect("parse config");
        assert_eq!(cfg.max_threads, 4);
        assert_eq!(cfg.mx, 3);
        // Ceiling applies.
        assert_eq!(cfg.soap_content_length, MAX_SOAP_CONTENT_LENGTH);
        assert_eq!(cfg.auto_renew_guard, 0);
        assert_eq!(cfg.selected_interfaces, vec!["eth0", "wlan0"]);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(RuntimeConfig::from_toml_str("maxthreads = 4").is_err());
    }

    #[test]
    fn inconsistent_bounds_rejected() {
        let err = RuntimeConfig::from_toml_str("min_threads = 8\nmax_threads = 2");
        assert!(err.is_err());
    }
}

//! Error type for the runtime's fallible public operations.
//!
//! Datagram-path failures (unparseable packets, bad peers) never surface
//! here: they are logged and dropped where they happen. Only argument,
//! handle, configuration and peer-protocol errors reach the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpnpError {
    /// Caller passed something unusable (bad search target, bad URL, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Handle id unknown, or registered with the other kind.
    #[error("invalid handle")]
    InvalidHandle,

    /// No subscription with that SID on this handle.
    #[error("invalid subscription id")]
    InvalidSid,

    /// Peer answered SUBSCRIBE/RENEW with 200 but without usable SID/TIMEOUT.
    #[error("bad response from event publisher")]
    BadResponse,

    /// Peer refused a SUBSCRIBE or RENEW.
    #[error("subscribe not accepted (HTTP {0})")]
    SubscribeUnaccepted(u16),

    /// Peer refused an UNSUBSCRIBE.
    #[error("unsubscribe not accepted (HTTP {0})")]
    UnsubscribeUnaccepted(u16),

    /// The HTTP exchange itself failed (connect, timeout, transport).
    #[error("http transport: {0}")]
    Transport(String),

    /// Socket setup failed badly enough that the engine cannot run at all.
    #[error("socket: {0}")]
    Socket(#[from] std::io::Error),

    /// Worker pool queue ceiling reached; the job was dropped.
    #[error("thread pool job queue is full")]
    PoolSaturated,

    /// No worker slot could be found or created for a persistent job.
    #[error("thread pool cannot host another persistent job")]
    MaxThreads,

    /// Configuration file or value rejected.
    #[error("config: {0}")]
    Config(String),

    /// Runtime already shut down.
    #[error("runtime is finalized")]
    Finalized,
}

impl From<crate::threadutil::PoolError> for UpnpError {
    fn from(e: crate::threadutil::PoolError) -> Self {
        use crate::threadutil::PoolError;
        match e {
            PoolError::QueueFull => UpnpError::PoolSaturated,
            PoolError::MaxThreads => UpnpError::MaxThreads,
            PoolError::Shutdown => UpnpError::Finalized,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpnpError>;

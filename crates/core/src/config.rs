//! Session configuration.
//!
//! Only the values the protocol core needs: where to bind, how long a
//! blocking receive may wait, and the cooperative cancellation flag. Loading
//! these from files or CLI arguments is the embedding process's job.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Default bind address for the reply endpoint.
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
/// Default port the simulation engine connects to.
pub const DEFAULT_PORT: u16 = 27746;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Address the reply endpoint binds on.
    pub address: IpAddr,

    /// Port the reply endpoint binds on; `0` picks an ephemeral port, which
    /// the controller reports through `local_endpoint()` once bound.
    pub port: u16,

    /// Upper bound on any single blocking receive. `None` waits forever, as
    /// the base protocol does; a stalled peer then blocks the session
    /// indefinitely.
    #[serde(default)]
    pub recv_timeout: Option<Duration>,

    /// Cooperative cancellation flag. Setting it from another thread aborts
    /// a blocked receive with `ConnectionError::Cancelled`. Clones of the
    /// config share the same flag.
    #[serde(skip, default = "new_cancel_flag")]
    pub cancel: Arc<AtomicBool>,
}

fn new_cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            recv_timeout: None,
            cancel: new_cancel_flag(),
        }
    }
}

impl SessionConfig {
    /// The ZeroMQ endpoint string for this configuration. Port `0` is
    /// rendered as the `*` wildcard so libzmq assigns an ephemeral port.
    pub fn endpoint(&self) -> String {
        if self.port == 0 {
            format!("tcp://{}:*", self.address)
        } else {
            format!("tcp://{}:{}", self.address, self.port)
        }
    }

    /// Handle for aborting a hung session from outside the owning thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_matches_engine_defaults() {
        assert_eq!(SessionConfig::default().endpoint(), "tcp://0.0.0.0:27746");
    }

    #[test]
    fn zero_port_renders_wildcard() {
        let config = SessionConfig {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.endpoint(), "tcp://127.0.0.1:*");
    }

    #[test]
    fn clones_share_the_cancel_flag() {
        let config = SessionConfig::default();
        let clone = config.clone();
        clone
            .cancel
            .store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(config.cancel.load(std::sync::atomic::Ordering::Relaxed));
    }
}

//! Server configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Settings chosen before the server starts
///
/// `threaded` only sets the initial dispatch mode; it can be changed on a
/// running server through [`ServerHandle::set_threaded`](crate::ServerHandle::set_threaded).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Name used in the greeting and HELO/EHLO replies
    pub hostname: String,
    /// Address the listener binds to
    pub bind_address: IpAddr,
    /// Serve each connection on its own thread
    pub threaded: bool,
    /// How often idle connections check whether the server is stopping
    pub poll_interval: Duration,
}

impl ServerConfig {
    pub const DEFAULT_HOSTNAME: &'static str = "localhost";
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: Self::DEFAULT_HOSTNAME.to_owned(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            threaded: false,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

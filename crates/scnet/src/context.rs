//! NetContext - addresses, timeouts and the shared send socket
//!
//! Owned by the application and handed to every network object, so tests
//! can run several servers and clients side by side on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use contracts::{NetConfig, ScError, ScResult};
use tracing::debug;

/// Hard upper bound on windows served by one `SourceNet`
pub const MAX_WINDOWS: usize = 12;

/// Application id carried in heartbeats
pub const DEFAULT_APP_ID: u16 = 0x5c01;

#[derive(Debug)]
pub struct NetContext {
    /// TCP command endpoint of the server
    pub server: SocketAddr,
    /// Client UDP port for patches, 0 picks an ephemeral port
    pub display_port: u16,
    pub heartbeat_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub ack_timeout: Duration,
    pub max_retransmits: u8,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Upper bound on one command loop iteration
    pub loop_timeout: Duration,
    pub max_windows: usize,
    pub app_id: u16,
    shared: Mutex<Option<Arc<UdpSocket>>>,
}

impl NetContext {
    pub fn from_config(config: &NetConfig) -> ScResult<Self> {
        let server = SocketAddr::new(parse_ip("server_host", &config.server_host)?, config.command_port);
        let heartbeat_addr = SocketAddr::new(
            parse_ip("heartbeat_group", &config.heartbeat_group)?,
            config.heartbeat_port,
        );
        if config.max_windows == 0 || config.max_windows > MAX_WINDOWS {
            return Err(ScError::invalid(
                "max_windows",
                format!("{} outside 1..={MAX_WINDOWS}", config.max_windows),
            ));
        }
        Ok(Self {
            server,
            display_port: config.display_port,
            heartbeat_addr,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            max_retransmits: config.max_retransmits,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            loop_timeout: Duration::from_millis(config.loop_timeout_ms),
            max_windows: config.max_windows,
            app_id: DEFAULT_APP_ID,
            shared: Mutex::new(None),
        })
    }

    /// Loopback context with ephemeral ports everywhere
    pub fn loopback() -> Self {
        let defaults = NetConfig::default();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            server: SocketAddr::new(localhost, 0),
            display_port: 0,
            // discard port; tests that watch heartbeats override it
            heartbeat_addr: SocketAddr::new(localhost, 9),
            heartbeat_interval: Duration::from_millis(defaults.heartbeat_interval_ms),
            ack_timeout: Duration::from_millis(50),
            max_retransmits: defaults.max_retransmits,
            connect_timeout: Duration::from_millis(defaults.connect_timeout_ms),
            command_timeout: Duration::from_millis(defaults.command_timeout_ms),
            loop_timeout: Duration::from_millis(20),
            max_windows: MAX_WINDOWS,
            app_id: DEFAULT_APP_ID,
            shared: Mutex::new(None),
        }
    }

    pub fn with_server(mut self, server: SocketAddr) -> Self {
        self.server = server;
        self
    }

    pub fn with_heartbeat_addr(mut self, addr: SocketAddr) -> Self {
        self.heartbeat_addr = addr;
        self
    }

    /// Socket used for heartbeats and other fire-and-forget datagrams,
    /// bound on first use
    pub fn shared_socket(&self) -> ScResult<Arc<UdpSocket>> {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = shared.as_ref() {
            return Ok(Arc::clone(socket));
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(1)?;
        debug!(local = ?socket.local_addr().ok(), "shared UDP socket bound");
        let socket = Arc::new(socket);
        *shared = Some(Arc::clone(&socket));
        Ok(socket)
    }
}

fn parse_ip(field: &str, value: &str) -> ScResult<IpAddr> {
    value
        .parse()
        .map_err(|_| ScError::invalid(field, format!("'{value}' is not an IP address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_default_config() {
        let ctx = NetContext::from_config(&NetConfig::default()).unwrap();
        assert_eq!(ctx.server.port(), 4377);
        assert!(ctx.heartbeat_addr.ip().is_multicast());
        assert_eq!(ctx.ack_timeout, Duration::from_millis(200));
    }

    #[test]
    fn rejects_hostnames_and_window_counts() {
        let config = NetConfig {
            server_host: "radar.local".into(),
            ..NetConfig::default()
        };
        assert!(NetContext::from_config(&config).is_err());
        let config = NetConfig {
            max_windows: 13,
            ..NetConfig::default()
        };
        assert!(NetContext::from_config(&config).is_err());
    }

    #[test]
    fn shared_socket_is_reused() {
        let ctx = NetContext::loopback();
        let a = ctx.shared_socket().unwrap();
        let b = ctx.shared_socket().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

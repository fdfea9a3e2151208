//! Heartbeat sending and monitoring
//!
//! Heartbeats are advisory: a bad or missing heartbeat is logged and
//! reported, never fatal.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use contracts::{ScError, ScResult};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{Heartbeat, HEARTBEAT_LEN};

/// Sends a heartbeat every `interval` when polled
#[derive(Debug)]
pub struct HeartbeatSender {
    socket: Arc<StdUdpSocket>,
    target: SocketAddr,
    interval: Duration,
    last: Option<Instant>,
    sent: u64,
    pub template: Heartbeat,
}

impl HeartbeatSender {
    pub fn new(socket: Arc<StdUdpSocket>, target: SocketAddr, interval: Duration, template: Heartbeat) -> Self {
        Self {
            socket,
            target,
            interval,
            last: None,
            sent: 0,
            template,
        }
    }

    /// Send when the interval has elapsed; true when a heartbeat went out
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return false;
        }
        self.last = Some(now);
        match self.socket.send_to(&self.template.encode(), self.target) {
            Ok(_) => {
                self.sent += 1;
                observability::record_heartbeat("tx", self.template.app_id);
                true
            }
            Err(e) => {
                warn!(target_addr = %self.target, error = %e, "heartbeat send failed");
                false
            }
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// Last heartbeat seen from one sender
#[derive(Debug, Clone, Copy)]
pub struct PeerStatus {
    pub from: SocketAddr,
    pub heartbeat: Heartbeat,
    pub last_seen: Instant,
    pub count: u64,
}

type PeerTable = Arc<Mutex<HashMap<SocketAddr, PeerStatus>>>;

/// Listens for heartbeats and keeps the latest one per sender
pub struct HeartbeatMonitor {
    socket: Option<UdpSocket>,
    local: SocketAddr,
    peers: PeerTable,
    malformed: Arc<AtomicU64>,
}

impl HeartbeatMonitor {
    /// Bind to `addr`; a multicast address binds its port on all
    /// interfaces and joins the group
    pub async fn bind(addr: SocketAddr) -> ScResult<Self> {
        let socket = match addr {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, v4.port())).await?;
                socket
                    .join_multicast_v4(*v4.ip(), Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| ScError::network(addr.to_string(), format!("join failed: {e}")))?;
                socket
            }
            _ => UdpSocket::bind(addr).await?,
        };
        let local = socket.local_addr()?;
        info!(%local, group = %addr, "heartbeat monitor bound");
        Ok(Self {
            socket: Some(socket),
            local,
            peers: Arc::new(Mutex::new(HashMap::new())),
            malformed: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Start the receive task; later calls return None
    pub fn start(&mut self) -> Option<JoinHandle<()>> {
        let socket = self.socket.take()?;
        let peers = Arc::clone(&self.peers);
        let malformed = Arc::clone(&self.malformed);
        Some(tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => record(&peers, &malformed, &buf[..len], from),
                    Err(e) => {
                        warn!(error = %e, "heartbeat receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }))
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect()
    }

    /// True when `app_id` was heard within `max_age`
    pub fn is_alive(&self, app_id: u16, max_age: Duration) -> bool {
        let now = Instant::now();
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|p| p.heartbeat.app_id == app_id && now.saturating_duration_since(p.last_seen) <= max_age)
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

fn record(peers: &PeerTable, malformed: &AtomicU64, data: &[u8], from: SocketAddr) {
    let heartbeat = match Heartbeat::parse(data) {
        Ok(hb) => hb,
        Err(e) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            observability::record_malformed("heartbeat");
            warn!(%from, len = data.len(), expected = HEARTBEAT_LEN, error = %e, "heartbeat dropped");
            return;
        }
    };
    observability::record_heartbeat("rx", heartbeat.app_id);
    let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = peers.entry(from).or_insert(PeerStatus {
        from,
        heartbeat,
        last_seen: Instant::now(),
        count: 0,
    });
    if entry.count == 0 {
        debug!(%from, app_id = heartbeat.app_id, "new heartbeat peer");
    }
    entry.heartbeat = heartbeat;
    entry.last_seen = Instant::now();
    entry.count += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_sees_sender_and_drops_junk() {
        let mut monitor = HeartbeatMonitor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let task = monitor.start().unwrap();
        assert!(monitor.start().is_none());

        let socket = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let mut sender = HeartbeatSender::new(
            Arc::clone(&socket),
            monitor.local_addr(),
            Duration::from_secs(60),
            Heartbeat::new(0x1234, 4377),
        );
        let now = Instant::now();
        assert!(sender.poll(now));
        assert!(!sender.poll(now + Duration::from_millis(10)));
        socket.send_to(b"not a heartbeat", monitor.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while (monitor.peers().is_empty() || monitor.malformed_count() == 0) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(monitor.is_alive(0x1234, Duration::from_secs(5)));
        assert!(!monitor.is_alive(0x9999, Duration::from_secs(5)));
        assert_eq!(monitor.malformed_count(), 1);
        assert_eq!(sender.sent(), 1);
        task.abort();
    }
}

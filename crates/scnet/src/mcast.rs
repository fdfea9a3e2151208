//! Multicast distribution of one converter's output
//!
//! `DestMcast` is a destination: it mirrors every control call into a
//! config message with change flags and sends patch sets as they come.
//! `SourceMcast` listens, filters by window id and replays both onto a
//! local destination.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use contracts::{
    check, DestRef, FadeType, McastConfig, Patch, PatchFormat, PatchSet, Rgb, ScControl, ScDest, ScError,
    ScResult, ScState, SweepLine, View, WinGeom, MAX_DESTINATIONS, MAX_PATCH_WORDS,
};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use crate::codec::{change, McastMessage, McastState, MAX_DATAGRAM};

/// Window id that accepts every sender
pub const ANY_WINDOW: u16 = 0;

struct McastShared {
    state: McastState,
    last_config: Option<Instant>,
}

pub struct DestMcast {
    name: String,
    socket: Arc<StdUdpSocket>,
    target: SocketAddr,
    window_id: u16,
    max_size: (u16, u16),
    config_interval: Duration,
    shared: Mutex<McastShared>,
    seq: AtomicU32,
    sent: AtomicU64,
}

impl DestMcast {
    pub fn new(
        socket: Arc<StdUdpSocket>,
        target: SocketAddr,
        window_id: u16,
        max_size: (u16, u16),
        config_interval: Duration,
    ) -> Self {
        Self {
            name: format!("mcast-{window_id}@{target}"),
            socket,
            target,
            window_id,
            max_size,
            config_interval,
            shared: Mutex::new(McastShared {
                state: McastState::new(WinGeom::new(0, 0, max_size.0, max_size.1)),
                last_config: None,
            }),
            seq: AtomicU32::new(0),
            sent: AtomicU64::new(0),
        }
    }

    /// Sender bound on the configured interface
    pub fn from_config(config: &McastConfig, max_size: (u16, u16)) -> ScResult<Self> {
        let group: Ipv4Addr = config
            .group
            .parse()
            .map_err(|_| ScError::invalid("mcast.group", format!("'{}' is not IPv4", config.group)))?;
        let interface: Ipv4Addr = config.interface.parse().map_err(|_| {
            ScError::invalid("mcast.interface", format!("'{}' is not IPv4", config.interface))
        })?;
        let socket = StdUdpSocket::bind((interface, 0))?;
        socket.set_multicast_ttl_v4(1)?;
        Ok(Self::new(
            Arc::new(socket),
            SocketAddr::new(group.into(), config.port),
            config.window_id,
            max_size,
            Duration::from_millis(config.config_interval_ms),
        ))
    }

    pub fn window_id(&self) -> u16 {
        self.window_id
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> McastState {
        self.shared().state.clone()
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, McastShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `edit` and send a config message carrying `flags`
    fn update(&self, flags: u32, edit: impl FnOnce(&mut McastState)) -> ScResult<()> {
        let mut shared = self.shared();
        edit(&mut shared.state);
        shared.last_config = Some(Instant::now());
        let message = McastMessage::Config {
            window_id: self.window_id,
            changes: flags,
            state: shared.state.clone(),
        };
        drop(shared);
        self.send(&message)
    }

    /// Periodic full config for late joiners
    pub fn refresh_if_due(&self) -> ScResult<bool> {
        let mut shared = self.shared();
        let due = shared
            .last_config
            .is_none_or(|last| last.elapsed() >= self.config_interval);
        if !due {
            return Ok(false);
        }
        shared.last_config = Some(Instant::now());
        let message = McastMessage::Config {
            window_id: self.window_id,
            changes: 0,
            state: shared.state.clone(),
        };
        drop(shared);
        self.send(&message)?;
        Ok(true)
    }

    fn send(&self, message: &McastMessage) -> ScResult<()> {
        let datagram = message.encode()?;
        if datagram.len() > MAX_DATAGRAM - 64 {
            return Err(ScError::invalid("mcast", "message exceeds one datagram"));
        }
        self.socket
            .send_to(&datagram, self.target)
            .map_err(|e| ScError::network(self.target.to_string(), e.to_string()))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rid_index(rid: u8) -> ScResult<usize> {
        check::rid(rid)?;
        Ok(rid as usize)
    }
}

impl ScControl for DestMcast {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        self.update(change::POS, |s| {
            s.win.x = x;
            s.win.y = y;
        })
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        geom.validate(self.max_size.0, self.max_size.1)?;
        self.update(change::POS | change::DIM, |s| s.win = geom)
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()> {
        let idx = Self::rid_index(rid)?;
        self.update(change::FADE, |s| s.fades[idx] = (fade_type, rate))
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()?;
        self.update(change::VIEW, |s| s.view = view)
    }

    fn pan_view(&self, x: f32, y: f32, _clear_trails: bool) -> ScResult<()> {
        self.update(change::VIEW, |s| {
            s.view.x = x;
            s.view.y = y;
        })
    }

    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()> {
        let idx = Self::rid_index(rid)?;
        self.update(change::COL, |s| s.colours[idx] = colour)
    }

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()> {
        let idx = Self::rid_index(rid)?;
        self.update(change::COL, |s| s.brights[idx] = bright)
    }

    fn set_radar_lut(&self, _rid: u8, _lut: &[u8; 256]) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_lut", self.name.clone()))
    }

    fn show_radar(&self, rid: u8, state: ScState) -> ScResult<()> {
        let idx = Self::rid_index(rid)?;
        self.update(change::STATE, |s| s.states[idx] = state)
    }

    #[instrument(name = "mcast_patch_set", level = "trace", skip_all, fields(window = self.window_id))]
    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        if let Err(e) = self.refresh_if_due() {
            warn!(error = %e, "config refresh failed");
        }
        for piece in patches.split_to_fit(MAX_PATCH_WORDS) {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            self.send(&McastMessage::Patches {
                window_id: self.window_id,
                seq,
                set: piece,
            })?;
        }
        Ok(())
    }

    fn set_source(&self, source_id: u32, arg1: u32, arg2: u32) -> ScResult<()> {
        self.update(change::SOURCE, |s| s.source = (source_id, arg1, arg2))
    }

    fn set_radar_position(&self, x: f32, y: f32, _clear_trails: bool) -> ScResult<()> {
        self.update(change::RADAR, |s| s.radar = (x, y))
    }

    fn set_sweep_line(&self, sweep: SweepLine) -> ScResult<()> {
        self.update(change::SWEEPLINE, |s| s.sweep = sweep)
    }
}

impl ScDest for DestMcast {
    fn max_size(&self) -> (u16, u16) {
        self.max_size
    }

    fn clear(&self, value: u8) -> ScResult<()> {
        let win = self.shared().state.win;
        let mut set = PatchSet::new(PatchFormat::Rle8);
        set.push(Patch::filled(0, 0, win.w, win.h, value)?);
        self.patch_set(&set)
    }
}

pub type ChangeCallback = Box<dyn FnMut(u16, u32) + Send>;

/// Counters kept by a listener
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct McastStats {
    pub configs: u64,
    pub patch_sets: u64,
    pub filtered: u64,
    pub malformed: u64,
    pub lost: u64,
}

pub struct SourceMcast {
    socket: UdpSocket,
    window_id: u16,
    target: DestRef,
    callback: Option<ChangeCallback>,
    synced: bool,
    /// Next expected patch sequence per (sender, window)
    next_seq: HashMap<(SocketAddr, u16), u32>,
    stats: McastStats,
    buf: Vec<u8>,
}

impl SourceMcast {
    /// Bind `addr`; a multicast group is joined on `interface`
    pub async fn bind(addr: SocketAddr, interface: Ipv4Addr, window_id: u16, target: DestRef) -> ScResult<Self> {
        let socket = match addr {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, v4.port())).await?;
                socket
                    .join_multicast_v4(*v4.ip(), interface)
                    .map_err(|e| ScError::network(addr.to_string(), format!("join failed: {e}")))?;
                socket
            }
            _ => UdpSocket::bind(addr).await?,
        };
        info!(local = ?socket.local_addr().ok(), window = window_id, "multicast listener bound");
        Ok(Self {
            socket,
            window_id,
            target,
            callback: None,
            synced: false,
            next_seq: HashMap::new(),
            stats: McastStats::default(),
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    pub async fn from_config(config: &McastConfig, target: DestRef) -> ScResult<Self> {
        let group: Ipv4Addr = config
            .group
            .parse()
            .map_err(|_| ScError::invalid("mcast.group", format!("'{}' is not IPv4", config.group)))?;
        let interface: Ipv4Addr = config.interface.parse().map_err(|_| {
            ScError::invalid("mcast.interface", format!("'{}' is not IPv4", config.interface))
        })?;
        Self::bind(SocketAddr::new(group.into(), config.port), interface, config.window_id, target).await
    }

    pub fn local_addr(&self) -> ScResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Called with `(window_id, change flags)` after each applied config
    pub fn set_change_callback(&mut self, callback: impl FnMut(u16, u32) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    pub fn stats(&self) -> McastStats {
        self.stats
    }

    /// Receive and apply one datagram
    pub async fn recv_once(&mut self) -> ScResult<()> {
        let (len, from) = self.socket.recv_from(&mut self.buf).await?;
        let message = match McastMessage::parse(&self.buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed += 1;
                observability::record_malformed("mcast");
                warn!(%from, len, error = %e, "malformed multicast message dropped");
                return Ok(());
            }
        };
        self.apply(message, from);
        Ok(())
    }

    /// Receive until `stop` resolves
    pub async fn run(&mut self, stop: impl std::future::Future<Output = ()>) {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                result = self.recv_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "multicast receive failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    fn apply(&mut self, message: McastMessage, from: SocketAddr) {
        let window_id = message.window_id();
        if self.window_id != ANY_WINDOW && window_id != self.window_id {
            self.stats.filtered += 1;
            return;
        }
        match message {
            McastMessage::Config { changes, state, .. } => {
                let flags = if self.synced { changes } else { change::ALL };
                if flags == 0 {
                    return;
                }
                self.apply_config(flags, &state);
                self.synced = true;
                self.stats.configs += 1;
                if let Some(callback) = self.callback.as_mut() {
                    callback(window_id, flags);
                }
            }
            McastMessage::Patches { seq, set, .. } => {
                let next = self.next_seq.entry((from, window_id)).or_insert(seq);
                if seq > *next {
                    self.stats.lost += (seq - *next) as u64;
                    debug!(%from, expected = *next, seq, "multicast patches lost");
                }
                *next = seq.wrapping_add(1);
                self.stats.patch_sets += 1;
                if let Err(e) = self.target.patch_set(&set) {
                    warn!(error = %e, "local destination rejected patches");
                }
            }
        }
    }

    fn apply_config(&self, flags: u32, state: &McastState) {
        let target = &self.target;
        let mut results: Vec<(&str, ScResult<()>)> = Vec::new();
        if flags & change::DIM != 0 {
            results.push(("geom", target.set_win_geom(state.win)));
        } else if flags & change::POS != 0 {
            results.push(("pos", target.set_win_pos(state.win.x, state.win.y)));
        }
        if flags & change::VIEW != 0 {
            results.push(("view", target.set_view(state.view)));
        }
        if flags & change::RADAR != 0 {
            results.push(("radar", target.set_radar_position(state.radar.0, state.radar.1, false)));
        }
        for rid in 0..MAX_DESTINATIONS as u8 {
            let idx = rid as usize;
            if flags & change::STATE != 0 {
                results.push(("state", target.show_radar(rid, state.states[idx])));
            }
            if flags & change::FADE != 0 {
                let (fade_type, rate) = state.fades[idx];
                results.push(("fade", target.set_fade(rid, fade_type, rate)));
            }
            if flags & change::COL != 0 {
                results.push(("colour", target.set_radar_colour(rid, state.colours[idx])));
                results.push(("bright", target.set_radar_bright(rid, state.brights[idx])));
            }
        }
        if flags & change::SOURCE != 0 {
            let (id, a1, a2) = state.source;
            results.push(("source", target.set_source(id, a1, a2)));
        }
        if flags & change::SWEEPLINE != 0 {
            results.push(("sweep", target.set_sweep_line(state.sweep)));
        }
        for (what, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_supported() => debug!(what, "not supported locally"),
                Err(e) => warn!(what, error = %e, "config delta rejected"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{BitmapType, SweepColourMode};
    use destinations::BitmapDest;
    use std::sync::Mutex as StdMutex;

    async fn pair(listen_window: u16, send_window: u16) -> (DestMcast, SourceMcast, Arc<BitmapDest>) {
        let bitmap = Arc::new(BitmapDest::create("mirror", 32, 32, BitmapType::Index8, None, 0).unwrap());
        let target: DestRef = bitmap.clone();
        let source = SourceMcast::bind("127.0.0.1:0".parse().unwrap(), Ipv4Addr::LOCALHOST, listen_window, target)
            .await
            .unwrap();
        let socket = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let dest = DestMcast::new(
            socket,
            source.local_addr().unwrap(),
            send_window,
            (32, 32),
            Duration::from_secs(60),
        );
        (dest, source, bitmap)
    }

    async fn recv(source: &mut SourceMcast) {
        tokio::time::timeout(Duration::from_secs(2), source.recv_once())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn patches_and_config_reach_the_listener() {
        let (dest, mut source, bitmap) = pair(ANY_WINDOW, 4).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let flags = Arc::clone(&seen);
        source.set_change_callback(move |wid, f| flags.lock().unwrap().push((wid, f)));

        dest.set_fade(0, FadeType::Replace, 1).unwrap();
        recv(&mut source).await;
        dest.set_win_geom(WinGeom::new(0, 0, 16, 16)).unwrap();
        recv(&mut source).await;

        let mut set = PatchSet::new(PatchFormat::Raw8);
        set.push(Patch::filled(2, 3, 4, 4, 200).unwrap());
        // config went out recently, so no refresh precedes the patches
        dest.patch_set(&set).unwrap();
        recv(&mut source).await;

        assert_eq!(bitmap.value_at(3, 4), 200);
        assert_eq!(bitmap.win_geom(), WinGeom::new(0, 0, 16, 16));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (4, change::ALL));
        assert_eq!(seen[1], (4, change::POS | change::DIM));
        assert_eq!(source.stats().patch_sets, 1);
    }

    #[tokio::test]
    async fn other_windows_are_filtered() {
        let (dest, mut source, bitmap) = pair(2, 5).await;
        let mut set = PatchSet::new(PatchFormat::Raw8);
        set.push(Patch::filled(0, 0, 2, 2, 99).unwrap());
        // refresh config, then patches
        dest.patch_set(&set).unwrap();
        recv(&mut source).await;
        recv(&mut source).await;
        assert_eq!(bitmap.value_at(0, 0), 0);
        assert_eq!(source.stats().filtered, 2);
    }

    #[tokio::test]
    async fn interleaved_senders_keep_their_own_sequence() {
        let (first, mut source, bitmap) = pair(ANY_WINDOW, 3).await;
        let socket = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let second = DestMcast::new(socket, source.local_addr().unwrap(), 3, (32, 32), Duration::from_secs(60));
        let mut set = PatchSet::new(PatchFormat::Raw8);
        set.push(Patch::filled(0, 0, 2, 2, 40).unwrap());

        // config refresh then patches 0..=2 from the first sender
        first.patch_set(&set).unwrap();
        recv(&mut source).await;
        recv(&mut source).await;
        for _ in 0..2 {
            first.patch_set(&set).unwrap();
            recv(&mut source).await;
        }
        second.patch_set(&set).unwrap();
        recv(&mut source).await;
        recv(&mut source).await;
        first.patch_set(&set).unwrap();
        recv(&mut source).await;

        let stats = source.stats();
        assert_eq!(stats.patch_sets, 5);
        assert_eq!(stats.lost, 0);
        assert_eq!(bitmap.value_at(1, 1), 40);
    }

    #[tokio::test]
    async fn junk_is_counted_not_fatal() {
        let (dest, mut source, _bitmap) = pair(ANY_WINDOW, 1).await;
        let junk = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        junk.send_to(b"\x00\x01\x02\x03garbage", source.local_addr().unwrap()).unwrap();
        recv(&mut source).await;
        assert_eq!(source.stats().malformed, 1);
        dest.set_sweep_line(SweepLine::auto(SweepColourMode::Highest, 0x00ff00)).unwrap();
        recv(&mut source).await;
        assert_eq!(source.stats().configs, 1);
    }
}

//! DestNet - client side proxy of a remote scan converter
//!
//! Control calls become command lines on a TCP connection. Patches come
//! back over UDP, are acked, put back in order and applied to a local
//! destination (usually a bitmap).

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use contracts::{
    check, DestRef, FadeType, MpRefMode, PatchSet, Rgb, ScControl, ScError, ScResult, ScState, SweepLine,
    View, WinGeom,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{PatchAck, PatchPacket, MAX_DATAGRAM};
use crate::command::{Command, Reply};
use crate::context::NetContext;

/// Out of order packets held before a gap is declared lost
const MAX_HELD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Patch channel counters
#[derive(Debug, Default)]
pub struct ClientStats {
    pub packets: AtomicU64,
    pub sets_applied: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub gaps_skipped: AtomicU64,
    /// Posted commands the server answered with an error
    pub rejected: AtomicU64,
}

type ReplyTx = oneshot::Sender<ScResult<Option<String>>>;

struct Outgoing {
    line: String,
    reply: Option<ReplyTx>,
}

struct Link {
    cmd_tx: mpsc::UnboundedSender<Outgoing>,
    command_task: JoinHandle<()>,
    patch_task: JoinHandle<()>,
    udp_port: u16,
}

pub struct DestNet {
    name: String,
    ctx: Arc<NetContext>,
    window_id: u16,
    display: DestRef,
    state: Arc<AtomicU8>,
    link: Mutex<Option<Link>>,
    stats: Arc<ClientStats>,
}

impl DestNet {
    pub fn new(ctx: Arc<NetContext>, window_id: u16, display: DestRef) -> Self {
        Self {
            name: format!("net-{window_id}"),
            ctx,
            window_id,
            display,
            state: Arc::new(AtomicU8::new(ConnState::Disconnected as u8)),
            link: Mutex::new(None),
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn window_id(&self) -> u16 {
        self.window_id
    }

    pub fn display(&self) -> &DestRef {
        &self.display
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Local UDP port patches arrive on, while connected
    pub fn udp_port(&self) -> Option<u16> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.udp_port)
    }

    /// Connect and register the window; a no-op when already connected
    #[instrument(name = "dest_net_connect", skip(self), fields(window = self.window_id, server = %self.ctx.server))]
    pub async fn connect(&self, timeout: Duration) -> ScResult<()> {
        let current = self.state.compare_exchange(
            ConnState::Disconnected as u8,
            ConnState::Connecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(state) = current {
            return match ConnState::from_u8(state) {
                ConnState::Connected => Ok(()),
                _ => Err(ScError::not_ready("connect already in progress")),
            };
        }
        match tokio::time::timeout(timeout, self.establish()).await {
            Ok(Ok(link)) => {
                info!(udp_port = link.udp_port, "connected");
                *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
                self.state.store(ConnState::Connected as u8, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.store(ConnState::Disconnected as u8, Ordering::Release);
                warn!(error = %e, "connect failed");
                Err(e)
            }
            Err(_) => {
                self.state.store(ConnState::Disconnected as u8, Ordering::Release);
                Err(ScError::timeout(timeout.as_millis() as u64, format!("connect to {}", self.ctx.server)))
            }
        }
    }

    async fn establish(&self) -> ScResult<Link> {
        let server = self.ctx.server;
        let stream = TcpStream::connect(server)
            .await
            .map_err(|e| ScError::network(server.to_string(), e.to_string()))?;
        stream.set_nodelay(true)?;
        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.ctx.display_port)).await?;
        let udp_port = udp.local_addr()?.port();

        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let (max_w, max_h) = self.display.max_size();
        let hello = Command::Hello {
            window_id: self.window_id,
            udp_port,
            max_w,
            max_h,
        };
        writer.write_all(hello.to_line().as_bytes()).await?;
        let reply = lines
            .next_line()
            .await?
            .ok_or_else(|| ScError::network(server.to_string(), "closed during hello"))?;
        Reply::parse(&reply)?.into_result()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let command_task = tokio::spawn(command_task(
            lines,
            writer,
            cmd_rx,
            Arc::clone(&self.state),
            Arc::clone(&self.stats),
            self.name.clone(),
        ));
        let patch_task = tokio::spawn(patch_task(
            udp,
            self.window_id,
            Arc::clone(&self.display),
            Arc::clone(&self.stats),
            self.ctx.ack_timeout * (self.ctx.max_retransmits as u32 + 1),
        ));
        Ok(Link {
            cmd_tx,
            command_task,
            patch_task,
            udp_port,
        })
    }

    /// Close the connection; safe to call when not connected
    #[instrument(name = "dest_net_disconnect", skip(self), fields(window = self.window_id))]
    pub async fn disconnect(&self) {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(link) = link else {
            self.state.store(ConnState::Disconnected as u8, Ordering::Release);
            return;
        };
        drop(link.cmd_tx);
        let command_task = link.command_task;
        if tokio::time::timeout(self.ctx.command_timeout, command_task).await.is_err() {
            warn!("command task did not finish in time");
        }
        link.patch_task.abort();
        self.state.store(ConnState::Disconnected as u8, Ordering::Release);
        debug!("disconnected");
    }

    /// Send a command and wait for its reply
    pub async fn send_command(&self, command: Command) -> ScResult<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.queue(command, Some(tx))?;
        let waited = self.ctx.command_timeout;
        match tokio::time::timeout(waited, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScError::not_ready("connection closed before reply")),
            Err(_) => Err(ScError::timeout(waited.as_millis() as u64, "command reply")),
        }
    }

    pub async fn set_parameter(&self, name: &str, value: &str) -> ScResult<()> {
        self.send_command(Command::SetParam {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn get_parameter(&self, name: &str) -> ScResult<String> {
        self.send_command(Command::GetParam {
            name: name.to_string(),
        })
        .await?
        .ok_or_else(|| ScError::protocol(format!("no value for parameter '{name}'")))
    }

    fn queue(&self, command: Command, reply: Option<ReplyTx>) -> ScResult<()> {
        if self.state() != ConnState::Connected {
            return Err(ScError::not_ready(format!("{} not connected", self.name)));
        }
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = link.as_ref() else {
            return Err(ScError::not_ready(format!("{} not connected", self.name)));
        };
        link.cmd_tx
            .send(Outgoing {
                line: command.to_line(),
                reply,
            })
            .map_err(|_| ScError::not_ready(format!("{} connection closed", self.name)))
    }

    /// Fire and forget once the local checks pass; error replies from the
    /// server are logged and counted in `ClientStats::rejected`
    fn post(&self, command: Command) -> ScResult<()> {
        self.queue(command, None)
    }
}

#[instrument(name = "dest_net_commands", skip_all, fields(client = %name))]
async fn command_task(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    state: Arc<AtomicU8>,
    stats: Arc<ClientStats>,
    name: String,
) {
    let mut waiting: VecDeque<(String, Option<ReplyTx>)> = VecDeque::new();
    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(outgoing) = outgoing else {
                    let _ = writer.write_all(Command::Bye.to_line().as_bytes()).await;
                    break;
                };
                if let Err(e) = writer.write_all(outgoing.line.as_bytes()).await {
                    error!(error = %e, "command write failed");
                    if let Some(tx) = outgoing.reply {
                        let _ = tx.send(Err(ScError::network(name.clone(), e.to_string())));
                    }
                    break;
                }
                waiting.push_back((outgoing.line, outgoing.reply));
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("server closed the command connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "command read failed");
                        break;
                    }
                };
                let result = match Reply::parse(&line) {
                    Ok(reply) => reply.into_result(),
                    Err(e) => {
                        observability::record_malformed("reply");
                        warn!(line = %line, "malformed reply");
                        Err(e)
                    }
                };
                match waiting.pop_front() {
                    Some((_, Some(tx))) => {
                        let _ = tx.send(result);
                    }
                    Some((sent, None)) => {
                        if let Err(e) = result {
                            stats.rejected.fetch_add(1, Ordering::Relaxed);
                            if !e.is_not_supported() {
                                warn!(command = %sent.trim_end(), error = %e, "command rejected");
                            }
                        }
                    }
                    None => warn!(line = %line, "unsolicited reply"),
                }
            }
        }
    }
    state.store(ConnState::Disconnected as u8, Ordering::Release);
    for (_, tx) in waiting {
        if let Some(tx) = tx {
            let _ = tx.send(Err(ScError::not_ready("connection closed")));
        }
    }
}

/// Puts patch packets back in send order
#[derive(Debug, Default)]
struct InOrder {
    expected: u32,
    /// seq -> (arrival, set)
    held: BTreeMap<u32, (Instant, PatchSet)>,
}

impl InOrder {
    /// Sets ready to apply, in order; `None` for a duplicate
    fn accept(&mut self, seq: u32, set: PatchSet, now: Instant) -> Option<Vec<PatchSet>> {
        if seq < self.expected || self.held.contains_key(&seq) {
            return None;
        }
        self.held.insert(seq, (now, set));
        let mut ready = self.release();
        while self.held.len() > MAX_HELD {
            // the sender has given up on the gap
            self.skip_gap();
            ready.extend(self.release());
        }
        Some(ready)
    }

    /// Skip gaps whose held packets have waited at least `patience`
    fn skip_stale(&mut self, now: Instant, patience: Duration) -> Vec<PatchSet> {
        let mut ready = Vec::new();
        while self.oldest().is_some_and(|arrived| now.duration_since(arrived) >= patience) {
            self.skip_gap();
            ready.extend(self.release());
        }
        ready
    }

    fn oldest(&self) -> Option<Instant> {
        self.held.values().map(|(arrived, _)| *arrived).min()
    }

    fn skip_gap(&mut self) {
        if let Some(&first) = self.held.keys().next() {
            self.expected = first;
        }
    }

    fn release(&mut self) -> Vec<PatchSet> {
        let mut ready = Vec::new();
        while let Some((_, set)) = self.held.remove(&self.expected) {
            ready.push(set);
            self.expected += 1;
        }
        ready
    }
}

/// Apply released sets, counting sequence numbers skipped since `from`
fn deliver(display: &DestRef, stats: &ClientStats, from: u32, to: u32, ready: Vec<PatchSet>) {
    let applied = ready.len() as u64;
    let advanced = to.wrapping_sub(from) as u64;
    if advanced > applied {
        stats.gaps_skipped.fetch_add(advanced - applied, Ordering::Relaxed);
    }
    for set in ready {
        if let Err(e) = display.patch_set(&set) {
            warn!(error = %e, "local display rejected patches");
        }
    }
    stats.sets_applied.fetch_add(applied, Ordering::Relaxed);
}

async fn stale_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

#[instrument(name = "dest_net_patches", skip_all, fields(window = window_id))]
async fn patch_task(
    udp: UdpSocket,
    window_id: u16,
    display: DestRef,
    stats: Arc<ClientStats>,
    patience: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut order = InOrder::default();
    loop {
        let deadline = order.oldest().map(|arrived| arrived + patience);
        let received = tokio::select! {
            received = udp.recv_from(&mut buf) => received,
            _ = stale_deadline(deadline) => {
                let from = order.expected;
                let ready = order.skip_stale(Instant::now(), patience);
                debug!(from, to = order.expected, "gave up on a stale gap");
                deliver(&display, &stats, from, order.expected, ready);
                continue;
            }
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "patch receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let packet = match PatchPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                observability::record_malformed("patch");
                warn!(%from, len, error = %e, "malformed patch packet dropped");
                continue;
            }
        };
        if packet.window_id != window_id {
            debug!(got = packet.window_id, "patch for another window ignored");
            continue;
        }
        stats.packets.fetch_add(1, Ordering::Relaxed);
        let ack = PatchAck {
            seq: packet.seq,
            window_id,
        };
        if let Err(e) = udp.send_to(&ack.encode(), from).await {
            warn!(%from, error = %e, "ack send failed");
        }
        let set = match packet.to_set() {
            Ok(set) => set,
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                observability::record_malformed("patch");
                warn!(seq = packet.seq, error = %e, "undecodable patch data dropped");
                continue;
            }
        };
        let expected = order.expected;
        let Some(ready) = order.accept(packet.seq, set, Instant::now()) else {
            stats.duplicates.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        deliver(&display, &stats, expected, order.expected, ready);
    }
}

impl Drop for DestNet {
    fn drop(&mut self) {
        if let Some(link) = self.link.lock().unwrap_or_else(PoisonError::into_inner).take() {
            link.command_task.abort();
            link.patch_task.abort();
        }
    }
}

impl ScControl for DestNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        self.display.set_win_pos(x, y)?;
        self.post(Command::SetWinPos { x, y })
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        let (max_w, max_h) = self.display.max_size();
        geom.validate(max_w, max_h)?;
        self.display.set_win_geom(geom)?;
        self.post(Command::SetWinGeom(geom))
    }

    fn set_win_param(&self, param: u16, arg1: u32, arg2: u32) -> ScResult<()> {
        self.post(Command::SetWinParam { param, arg1, arg2 })
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()> {
        check::rid(rid)?;
        fade_type.check_rate(rate)?;
        self.display.set_fade(rid, fade_type, rate)?;
        self.post(Command::SetFade {
            rid,
            fade_type,
            rate,
        })
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()?;
        self.post(Command::SetView(view))
    }

    fn pan_view(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        check::finite("view", &[x as f64, y as f64])?;
        self.post(Command::PanView { x, y, clear_trails })
    }

    // colour lives with the local display
    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()> {
        self.display.set_radar_colour(rid, colour)
    }

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()> {
        self.display.set_radar_bright(rid, bright)
    }

    fn set_radar_lut(&self, rid: u8, lut: &[u8; 256]) -> ScResult<()> {
        self.display.set_radar_lut(rid, lut)
    }

    fn show_radar(&self, rid: u8, state: ScState) -> ScResult<()> {
        check::rid(rid)?;
        self.post(Command::ShowRadar { rid, state })
    }

    fn patch_set(&self, _patches: &PatchSet) -> ScResult<()> {
        Err(ScError::not_supported("patch_set", self.name.clone()))
    }

    fn set_source(&self, source_id: u32, arg1: u32, arg2: u32) -> ScResult<()> {
        self.post(Command::SetSource {
            source_id,
            arg1,
            arg2,
        })
    }

    fn set_radar_position(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        check::finite("radar_position", &[x as f64, y as f64])?;
        self.post(Command::SetRadarPosition { x, y, clear_trails })
    }

    fn set_rotation_degs(&self, degs: f64) -> ScResult<()> {
        check::finite("rotation", &[degs])?;
        self.post(Command::SetRotation(degs))
    }

    fn set_scale_factor(&self, factor: u8) -> ScResult<()> {
        check::scale_factor(factor)?;
        self.post(Command::SetScaleFactor(factor))
    }

    fn set_moving_platform_ref_mode(&self, mode: MpRefMode) -> ScResult<()> {
        self.post(Command::SetMpRefMode(mode))
    }

    fn set_sweep_line(&self, sweep: SweepLine) -> ScResult<()> {
        self.post(Command::SetSweepLine(sweep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{BitmapType, Patch, PatchFormat};
    use destinations::BitmapDest;

    fn bitmap() -> DestRef {
        Arc::new(BitmapDest::create("local", 32, 32, BitmapType::Index8, None, 0).unwrap())
    }

    fn set(value: u8) -> PatchSet {
        let mut set = PatchSet::new(PatchFormat::Raw8);
        set.push(Patch::filled(0, 0, 1, 1, value).unwrap());
        set
    }

    fn values(ready: &[PatchSet]) -> Vec<u8> {
        ready.iter().map(|s| s.patches[0].pixels[0]).collect()
    }

    #[test]
    fn in_order_holds_until_gap_fills() {
        let now = Instant::now();
        let mut order = InOrder::default();
        assert_eq!(order.accept(1, set(1), now).unwrap().len(), 0);
        assert_eq!(order.accept(2, set(2), now).unwrap().len(), 0);
        let ready = order.accept(0, set(0), now).unwrap();
        assert_eq!(values(&ready), vec![0, 1, 2]);
        assert!(order.accept(1, set(1), now).is_none());
    }

    #[test]
    fn in_order_skips_a_lost_packet() {
        let now = Instant::now();
        let mut order = InOrder::default();
        let mut applied = 0;
        for seq in 1..=(MAX_HELD as u32 + 1) {
            applied += order.accept(seq, set(seq as u8), now).unwrap().len();
        }
        assert_eq!(applied, MAX_HELD + 1);
        assert_eq!(order.expected, MAX_HELD as u32 + 2);
    }

    #[test]
    fn in_order_gives_up_on_a_stale_gap() {
        let start = Instant::now();
        let patience = Duration::from_millis(300);
        let mut order = InOrder::default();
        assert_eq!(order.accept(0, set(0), start).unwrap().len(), 1);
        for seq in 2..=4 {
            assert!(order.accept(seq, set(seq as u8), start).unwrap().is_empty());
        }
        assert!(order.skip_stale(start + Duration::from_millis(100), patience).is_empty());
        let ready = order.skip_stale(start + patience, patience);
        assert_eq!(values(&ready), vec![2, 3, 4]);
        assert_eq!(order.expected, 5);
        assert!(order.oldest().is_none());
        assert!(order.accept(1, set(1), start + patience).is_none());
    }

    #[tokio::test]
    async fn patch_task_releases_held_sets_after_a_lost_packet() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let display = bitmap();
        let stats = Arc::new(ClientStats::default());
        let task = tokio::spawn(patch_task(
            udp,
            1,
            Arc::clone(&display),
            Arc::clone(&stats),
            Duration::from_millis(100),
        ));

        // seq 0 never arrives
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for seq in 1..=3u32 {
            let packet = PatchPacket::from_set(seq, 1, &set(seq as u8 * 10)).unwrap();
            sender.send_to(&packet.encode(), addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        task.abort();

        assert_eq!(stats.packets.load(Ordering::Relaxed), 3);
        assert_eq!(stats.sets_applied.load(Ordering::Relaxed), 3);
        assert_eq!(stats.gaps_skipped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn commands_need_a_connection() {
        let ctx = Arc::new(NetContext::loopback());
        let client = DestNet::new(ctx, 1, bitmap());
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(matches!(client.set_view(View::default()), Err(ScError::NotReady { .. })));
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn connect_to_nothing_fails_cleanly() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ctx = Arc::new(NetContext::loopback().with_server(addr));
        let client = DestNet::new(ctx, 1, bitmap());
        assert!(client.connect(Duration::from_millis(500)).await.is_err());
        assert_eq!(client.state(), ConnState::Disconnected);
    }
}

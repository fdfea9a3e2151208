//! SourceNet - server side of the command channel
//!
//! One TCP listener for command connections and one UDP socket that sends
//! patches and receives acks. `command_loop` multiplexes both with user
//! events and a timeout; between iterations it retransmits, services the
//! display targets, sends heartbeats and runs the background closure.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{ScControl, ScDest, ScError, ScResult};
use slab::Slab;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{Heartbeat, PatchAck};
use crate::command::{Command, Reply};
use crate::context::{NetContext, MAX_WINDOWS};
use crate::heartbeat::HeartbeatSender;
use crate::remote_display::RemoteDisplay;

/// Longest command line accepted, newline included
pub const MAX_LINE: usize = 4096;

/// What a remote client's commands drive
pub trait DisplayTarget: ScControl {
    fn set_parameter(&self, name: &str, _value: &str) -> ScResult<()> {
        Err(ScError::not_supported("set_parameter", format!("{} ({name})", self.name())))
    }

    fn get_parameter(&self, name: &str) -> ScResult<String> {
        Err(ScError::not_supported("get_parameter", format!("{} ({name})", self.name())))
    }

    fn clear_display(&self) -> ScResult<()> {
        Err(ScError::not_supported("clear", self.name()))
    }

    /// Periodic work, called once per command loop iteration
    fn service(&self) {}
}

impl DisplayTarget for RemoteDisplay {
    fn clear_display(&self) -> ScResult<()> {
        self.clear(0)
    }
}

/// Builds the target for a newly registered window
pub type DisplayFactory =
    Box<dyn FnMut(u16, Arc<RemoteDisplay>) -> ScResult<Arc<dyn DisplayTarget>> + Send>;

pub type EventHandler = Box<dyn FnMut(&NetEvent) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
    DisplayAdded(u16),
    DisplayRemoved(u16),
    /// Posted through `event_sender`
    User(u32),
}

/// Stops a running command loop from another task
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

struct ClientConn {
    id: u64,
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    window_id: Option<u16>,
    reader: JoinHandle<()>,
}

struct Display {
    remote: Arc<RemoteDisplay>,
    target: Arc<dyn DisplayTarget>,
    client: Option<usize>,
}

/// (slab key, connection id, line or None on close)
type LineMsg = (usize, u64, Option<String>);

pub struct SourceNet {
    ctx: Arc<NetContext>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    udp_rx: Option<UdpSocket>,
    udp_tx: Option<Arc<StdUdpSocket>>,
    clients: Slab<ClientConn>,
    displays: HashMap<u16, Display>,
    line_tx: mpsc::UnboundedSender<LineMsg>,
    line_rx: Option<mpsc::UnboundedReceiver<LineMsg>>,
    event_tx: mpsc::UnboundedSender<NetEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<NetEvent>>,
    event_handler: Option<EventHandler>,
    background: Option<Box<dyn FnMut() + Send>>,
    factory: Option<DisplayFactory>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
    heartbeat: Option<HeartbeatSender>,
    commands_handled: u64,
    next_conn_id: u64,
}

impl SourceNet {
    /// Open the command listener and patch socket.
    ///
    /// Bind failures are logged; check `sockets_ok` before looping.
    #[instrument(name = "source_net_bind", skip(ctx), fields(server = %ctx.server))]
    pub async fn bind(ctx: Arc<NetContext>) -> Self {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut source = Self {
            timeout: ctx.loop_timeout,
            ctx,
            listener: None,
            local_addr: None,
            udp_rx: None,
            udp_tx: None,
            clients: Slab::new(),
            displays: HashMap::new(),
            line_tx,
            line_rx: Some(line_rx),
            event_tx,
            event_rx: Some(event_rx),
            event_handler: None,
            background: None,
            factory: None,
            stop: Arc::new(AtomicBool::new(false)),
            heartbeat: None,
            commands_handled: 0,
            next_conn_id: 0,
        };
        match TcpListener::bind(source.ctx.server).await {
            Ok(listener) => {
                source.local_addr = listener.local_addr().ok();
                source.listener = Some(listener);
            }
            Err(e) => error!(error = %e, "command listener bind failed"),
        }
        match open_patch_socket() {
            Ok((rx, tx)) => {
                source.udp_rx = Some(rx);
                source.udp_tx = Some(tx);
            }
            Err(e) => error!(error = %e, "patch socket bind failed"),
        }
        match source.ctx.shared_socket() {
            Ok(socket) => {
                let port = source.local_addr.map(|a| a.port()).unwrap_or(0);
                source.heartbeat = Some(HeartbeatSender::new(
                    socket,
                    source.ctx.heartbeat_addr,
                    source.ctx.heartbeat_interval,
                    Heartbeat::new(source.ctx.app_id, port),
                ));
            }
            Err(e) => warn!(error = %e, "heartbeats disabled"),
        }
        if let Some(addr) = source.local_addr {
            info!(%addr, "command listener ready");
        }
        source
    }

    pub fn sockets_ok(&self) -> bool {
        self.listener.is_some() && self.udp_rx.is_some() && self.udp_tx.is_some()
    }

    /// TCP address clients connect to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout.max(Duration::from_millis(1));
    }

    pub fn set_event_handler(&mut self, handler: impl FnMut(&NetEvent) + Send + 'static) {
        self.event_handler = Some(Box::new(handler));
    }

    /// Channel for posting `NetEvent::User` (or any event) into the loop
    pub fn event_sender(&self) -> mpsc::UnboundedSender<NetEvent> {
        self.event_tx.clone()
    }

    pub fn set_background(&mut self, work: impl FnMut() + Send + 'static) {
        self.background = Some(Box::new(work));
    }

    pub fn set_display_factory(
        &mut self,
        factory: impl FnMut(u16, Arc<RemoteDisplay>) -> ScResult<Arc<dyn DisplayTarget>> + Send + 'static,
    ) {
        self.factory = Some(Box::new(factory));
    }

    pub fn stop_command_loop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn is_wid_ok(&self, window_id: u16) -> bool {
        window_id >= 1 && window_id as usize <= self.ctx.max_windows.min(MAX_WINDOWS)
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn window_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.displays.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn remote(&self, window_id: u16) -> Option<Arc<RemoteDisplay>> {
        self.displays.get(&window_id).map(|d| Arc::clone(&d.remote))
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands_handled
    }

    /// Register a display not tied to a client connection
    pub fn add_display(
        &mut self,
        window_id: u16,
        remote: Arc<RemoteDisplay>,
        target: Arc<dyn DisplayTarget>,
    ) -> ScResult<()> {
        self.insert_display(window_id, remote, target, None)
    }

    fn insert_display(
        &mut self,
        window_id: u16,
        remote: Arc<RemoteDisplay>,
        target: Arc<dyn DisplayTarget>,
        client: Option<usize>,
    ) -> ScResult<()> {
        if !self.is_wid_ok(window_id) {
            return Err(ScError::invalid(
                "window_id",
                format!("{window_id} outside 1..={}", self.ctx.max_windows.min(MAX_WINDOWS)),
            ));
        }
        if self.displays.contains_key(&window_id) {
            return Err(ScError::not_ready(format!("window {window_id} in use")));
        }
        self.displays.insert(
            window_id,
            Display {
                remote,
                target,
                client,
            },
        );
        info!(window = window_id, "display added");
        self.emit(NetEvent::DisplayAdded(window_id));
        Ok(())
    }

    pub fn remove_display(&mut self, window_id: u16) -> bool {
        let Some(display) = self.displays.remove(&window_id) else {
            return false;
        };
        display.remote.close();
        if let Some(client) = display.client.and_then(|key| self.clients.get_mut(key)) {
            client.window_id = None;
        }
        info!(window = window_id, "display removed");
        self.emit(NetEvent::DisplayRemoved(window_id));
        true
    }

    /// Accept one pending connection without waiting
    pub async fn try_accept(&mut self) -> ScResult<Option<SocketAddr>> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(ScError::not_ready("command listener not open"));
        };
        match tokio::time::timeout(Duration::ZERO, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                self.add_client(stream, addr);
                Ok(Some(addr))
            }
            Ok(Err(e)) => Err(ScError::network("accept", e.to_string())),
            Err(_) => Ok(None),
        }
    }

    /// Serve until `stop_command_loop`; the flag is reset on exit
    #[instrument(name = "source_net_loop", skip(self), fields(addr = ?self.local_addr))]
    pub async fn command_loop(&mut self) -> ScResult<()> {
        if !self.sockets_ok() {
            return Err(ScError::not_ready("sockets not open"));
        }
        let (Some(listener), Some(udp), Some(mut line_rx), Some(mut event_rx)) = (
            self.listener.take(),
            self.udp_rx.take(),
            self.line_rx.take(),
            self.event_rx.take(),
        ) else {
            return Err(ScError::not_ready("command loop already running"));
        };
        info!("command loop started");
        let mut buf = [0u8; 64];
        while !self.stop.load(Ordering::Acquire) {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.add_client(stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some((key, id, line)) = line_rx.recv() => {
                    if self.clients.get(key).is_some_and(|c| c.id == id) {
                        self.handle_line(key, line).await;
                    }
                }
                received = udp.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_ack(&buf[..len], from),
                    Err(e) => debug!(error = %e, "patch socket receive error"),
                },
                Some(event) = event_rx.recv() => self.emit(event),
                _ = tokio::time::sleep(self.timeout) => {}
            }
            self.service();
        }
        self.listener = Some(listener);
        self.udp_rx = Some(udp);
        self.line_rx = Some(line_rx);
        self.event_rx = Some(event_rx);
        self.stop.store(false, Ordering::Release);
        info!("command loop stopped");
        Ok(())
    }

    /// Drop every client and display
    pub fn shutdown(&mut self) {
        let keys: Vec<usize> = self.clients.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.remove_client(key);
        }
        let ids = self.window_ids();
        for id in ids {
            self.remove_display(id);
        }
    }

    fn service(&mut self) {
        for display in self.displays.values() {
            display
                .remote
                .retransmit_due(self.ctx.ack_timeout, self.ctx.max_retransmits);
            display.target.service();
        }
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.template.state = 1;
            heartbeat.template.num_channels = self.displays.len() as u16;
            heartbeat.template.client_addr = self
                .clients
                .iter()
                .find_map(|(_, c)| match c.addr.ip() {
                    std::net::IpAddr::V4(ip) => Some(ip),
                    std::net::IpAddr::V6(_) => None,
                })
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            heartbeat.poll(Instant::now());
        }
        if let Some(background) = self.background.as_mut() {
            background();
        }
    }

    fn emit(&mut self, event: NetEvent) {
        debug!(?event, "net event");
        if let Some(handler) = self.event_handler.as_mut() {
            handler(&event);
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "nodelay not set");
        }
        let (read_half, writer) = stream.into_split();
        self.next_conn_id += 1;
        let id = self.next_conn_id;
        let entry = self.clients.vacant_entry();
        let key = entry.key();
        let reader = tokio::spawn(read_lines(key, id, read_half, self.line_tx.clone()));
        entry.insert(ClientConn {
            id,
            addr,
            writer,
            window_id: None,
            reader,
        });
        info!(%addr, client = key, "client connected");
        self.emit(NetEvent::ClientConnected(addr));
    }

    fn remove_client(&mut self, key: usize) {
        let Some(client) = self.clients.try_remove(key) else {
            return;
        };
        client.reader.abort();
        if let Some(window_id) = client.window_id {
            self.remove_display(window_id);
        }
        info!(addr = %client.addr, client = key, "client disconnected");
        self.emit(NetEvent::ClientDisconnected(client.addr));
    }

    async fn handle_line(&mut self, key: usize, line: Option<String>) {
        let Some(line) = line else {
            self.remove_client(key);
            return;
        };
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                observability::record_malformed("command");
                warn!(client = key, line = %line, error = %e, "malformed command");
                self.reply(key, Reply::from_result(Err(e))).await;
                return;
            }
        };
        self.commands_handled += 1;
        debug!(client = key, verb = command.verb(), "command");
        let result = match command {
            Command::Hello {
                window_id,
                udp_port,
                max_w,
                max_h,
            } => self.hello(key, window_id, udp_port, (max_w, max_h)),
            Command::Bye => {
                self.reply(key, Reply::Ok(None)).await;
                self.remove_client(key);
                return;
            }
            Command::Ping => Ok(None),
            command => match self.target_of(key) {
                Some(target) => execute(target.as_ref(), command),
                None => Err(ScError::not_ready("send Hello first")),
            },
        };
        self.reply(key, Reply::from_result(result)).await;
    }

    fn target_of(&self, key: usize) -> Option<Arc<dyn DisplayTarget>> {
        let window_id = self.clients.get(key)?.window_id?;
        self.displays.get(&window_id).map(|d| Arc::clone(&d.target))
    }

    fn hello(
        &mut self,
        key: usize,
        window_id: u16,
        udp_port: u16,
        max_size: (u16, u16),
    ) -> ScResult<Option<String>> {
        let Some(client) = self.clients.get(key) else {
            return Err(ScError::not_ready("client gone"));
        };
        if client.window_id.is_some() {
            return Err(ScError::invalid("window_id", "client already registered a window"));
        }
        if max_size.0 == 0 || max_size.1 == 0 {
            return Err(ScError::invalid("max_size", "display size must be > 0"));
        }
        if !self.is_wid_ok(window_id) {
            return Err(ScError::invalid("window_id", format!("{window_id} not allowed")));
        }
        if self.displays.contains_key(&window_id) {
            return Err(ScError::not_ready(format!("window {window_id} in use")));
        }
        let Some(udp_tx) = self.udp_tx.as_ref() else {
            return Err(ScError::not_ready("patch socket not open"));
        };
        let peer = SocketAddr::new(client.addr.ip(), udp_port);
        let remote = Arc::new(RemoteDisplay::new(window_id, peer, Arc::clone(udp_tx), max_size));
        let target: Arc<dyn DisplayTarget> = match self.factory.as_mut() {
            Some(factory) => factory(window_id, Arc::clone(&remote))?,
            None => Arc::clone(&remote) as Arc<dyn DisplayTarget>,
        };
        self.insert_display(window_id, remote, target, Some(key))?;
        if let Some(client) = self.clients.get_mut(key) {
            client.window_id = Some(window_id);
        }
        Ok(None)
    }

    fn handle_ack(&mut self, data: &[u8], from: SocketAddr) {
        let ack = match PatchAck::parse(data) {
            Ok(ack) => ack,
            Err(e) => {
                observability::record_malformed("ack");
                warn!(%from, len = data.len(), error = %e, "malformed ack dropped");
                return;
            }
        };
        match self.displays.get(&ack.window_id) {
            Some(entry) if entry.remote.peer() != from => {
                observability::record_malformed("ack");
                debug!(%from, peer = %entry.remote.peer(), "ack from foreign address ignored");
            }
            Some(display) => {
                if !display.remote.ack(ack.seq) {
                    debug!(window = ack.window_id, seq = ack.seq, "late or duplicate ack");
                }
            }
            None => debug!(window = ack.window_id, "ack for unknown window"),
        }
    }

    async fn reply(&mut self, key: usize, reply: Reply) {
        let Some(client) = self.clients.get_mut(key) else {
            return;
        };
        if let Err(e) = client.writer.write_all(reply.to_line().as_bytes()).await {
            warn!(client = key, error = %e, "reply write failed");
        }
    }
}

/// Run one command against a display target
pub fn execute(target: &dyn DisplayTarget, command: Command) -> ScResult<Option<String>> {
    let done = |result: ScResult<()>| result.map(|()| None);
    match command {
        Command::Hello { .. } | Command::Bye => Err(ScError::invalid("command", "connection level command")),
        Command::Ping => Ok(None),
        Command::SetWinPos { x, y } => done(target.set_win_pos(x, y)),
        Command::SetWinGeom(geom) => done(target.set_win_geom(geom)),
        Command::SetWinParam { param, arg1, arg2 } => done(target.set_win_param(param, arg1, arg2)),
        Command::SetFade {
            rid,
            fade_type,
            rate,
        } => done(target.set_fade(rid, fade_type, rate)),
        Command::SetView(view) => done(target.set_view(view)),
        Command::PanView { x, y, clear_trails } => done(target.pan_view(x, y, clear_trails)),
        Command::SetRadarColour { rid, colour } => done(target.set_radar_colour(rid, colour)),
        Command::SetRadarBright { rid, bright } => done(target.set_radar_bright(rid, bright)),
        Command::SetRadarLut { rid, lut } => done(target.set_radar_lut(rid, &lut)),
        Command::ShowRadar { rid, state } => done(target.show_radar(rid, state)),
        Command::SetSource {
            source_id,
            arg1,
            arg2,
        } => done(target.set_source(source_id, arg1, arg2)),
        Command::SetRadarPosition { x, y, clear_trails } => {
            done(target.set_radar_position(x, y, clear_trails))
        }
        Command::SetRotation(degs) => done(target.set_rotation_degs(degs)),
        Command::SetScaleFactor(factor) => done(target.set_scale_factor(factor)),
        Command::SetMpRefMode(mode) => done(target.set_moving_platform_ref_mode(mode)),
        Command::SetSweepLine(sweep) => done(target.set_sweep_line(sweep)),
        Command::Clear => done(target.clear_display()),
        Command::SetParam { name, value } => done(target.set_parameter(&name, &value)),
        Command::GetParam { name } => target.get_parameter(&name).map(Some),
    }
}

fn open_patch_socket() -> ScResult<(UdpSocket, Arc<StdUdpSocket>)> {
    let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_nonblocking(true)?;
    let rx = UdpSocket::from_std(socket.try_clone()?)?;
    Ok((rx, Arc::new(socket)))
}

async fn read_lines(key: usize, id: u64, read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<LineMsg>) {
    let mut reader = BufReader::new(read_half);
    let mut raw = Vec::with_capacity(256);
    loop {
        raw.clear();
        match (&mut reader).take(MAX_LINE as u64).read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) if raw.last() != Some(&b'\n') && raw.len() >= MAX_LINE => {
                observability::record_malformed("command");
                warn!(client = key, limit = MAX_LINE, "command line too long, closing");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(client = key, error = %e, "command read ended");
                break;
            }
        }
        let line = match std::str::from_utf8(&raw) {
            Ok(text) => text.trim_end_matches(['\n', '\r']).to_string(),
            Err(e) => {
                observability::record_malformed("command");
                warn!(client = key, error = %e, "command line is not utf-8, closing");
                break;
            }
        };
        if tx.send((key, id, Some(line))).is_err() {
            return;
        }
    }
    let _ = tx.send((key, id, None));
}

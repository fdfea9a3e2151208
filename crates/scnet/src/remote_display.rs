//! RemoteDisplay - server side destination streaming patches to a client
//!
//! Attached to a converter like any other `ScDest`. Patch sets are split
//! to fit one datagram, numbered per window and kept until acked.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use contracts::{
    FadeType, Patch, PatchFormat, PatchSet, Rgb, ScControl, ScDest, ScError, ScResult, ScState,
    View, WinGeom, MAX_PATCH_WORDS,
};
use tracing::{debug, instrument, warn};

use crate::codec::PatchPacket;
use crate::inflight::InFlight;

/// Unacked packets kept per window
pub const INFLIGHT_CAPACITY: usize = 256;

pub struct RemoteDisplay {
    name: String,
    window_id: u16,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    max_size: (u16, u16),
    win: Mutex<WinGeom>,
    next_seq: AtomicU32,
    inflight: Mutex<InFlight>,
    closed: AtomicBool,
    packets_sent: AtomicU64,
    send_failures: AtomicU64,
    retransmits: AtomicU64,
    expired: AtomicU64,
}

impl std::fmt::Debug for RemoteDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDisplay")
            .field("window_id", &self.window_id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl RemoteDisplay {
    pub fn new(window_id: u16, peer: SocketAddr, socket: Arc<UdpSocket>, max_size: (u16, u16)) -> Self {
        Self {
            name: format!("remote-{window_id}@{peer}"),
            window_id,
            peer,
            socket,
            max_size,
            win: Mutex::new(WinGeom::new(0, 0, max_size.0, max_size.1)),
            next_seq: AtomicU32::new(0),
            inflight: Mutex::new(InFlight::new(INFLIGHT_CAPACITY)),
            closed: AtomicBool::new(false),
            packets_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn window_id(&self) -> u16 {
        self.window_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Stop sending; later patch sets are rejected
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn retransmits(&self) -> u64 {
        self.retransmits.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Handle an ack from the client
    pub fn ack(&self, seq: u32) -> bool {
        let rtt = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ack(seq, Instant::now());
        match rtt {
            Some(rtt) => {
                observability::record_ack_rtt_ms(self.window_id, rtt.as_secs_f64() * 1000.0);
                true
            }
            None => false,
        }
    }

    /// Resend packets unacked for `timeout`; gives up after `max_retries`
    pub fn retransmit_due(&self, timeout: Duration, max_retries: u8) -> usize {
        let plan = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .due(Instant::now(), timeout, max_retries);
        for seq in &plan.expired {
            self.expired.fetch_add(1, Ordering::Relaxed);
            warn!(window = self.window_id, seq, "patch packet unacked, giving up");
        }
        for (seq, datagram) in &plan.resend {
            debug!(window = self.window_id, seq, "retransmitting patch packet");
            observability::record_retransmit(self.window_id);
            self.retransmits.fetch_add(1, Ordering::Relaxed);
            self.transmit(datagram);
        }
        plan.resend.len()
    }

    fn transmit(&self, datagram: &[u8]) -> bool {
        match self.socket.send_to(datagram, self.peer) {
            Ok(_) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // stays in flight and goes out again on the next scan
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %self.peer, error = %e, "patch packet send failed");
                false
            }
        }
    }

    #[instrument(name = "remote_send", level = "trace", skip(self, set), fields(window = self.window_id))]
    fn send_set(&self, set: &PatchSet) -> ScResult<()> {
        if self.is_closed() {
            return Err(ScError::not_ready(format!("{} closed", self.name)));
        }
        for piece in set.split_to_fit(MAX_PATCH_WORDS) {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let datagram = PatchPacket::from_set(seq, self.window_id, &piece)?.encode();
            self.inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(seq, datagram.clone(), Instant::now());
            self.transmit(&datagram);
        }
        Ok(())
    }
}

impl ScControl for RemoteDisplay {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        let mut win = self.win.lock().unwrap_or_else(PoisonError::into_inner);
        win.x = x;
        win.y = y;
        Ok(())
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        geom.validate(self.max_size.0, self.max_size.1)?;
        *self.win.lock().unwrap_or_else(PoisonError::into_inner) = geom;
        Ok(())
    }

    fn set_fade(&self, _rid: u8, _fade_type: FadeType, _rate: u16) -> ScResult<()> {
        Ok(())
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()
    }

    fn pan_view(&self, _x: f32, _y: f32, _clear_trails: bool) -> ScResult<()> {
        Ok(())
    }

    // colouring happens on the client
    fn set_radar_colour(&self, _rid: u8, _colour: Rgb) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_colour", self.name.clone()))
    }

    fn set_radar_bright(&self, _rid: u8, _bright: u8) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_bright", self.name.clone()))
    }

    fn set_radar_lut(&self, _rid: u8, _lut: &[u8; 256]) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_lut", self.name.clone()))
    }

    fn show_radar(&self, _rid: u8, _state: ScState) -> ScResult<()> {
        Ok(())
    }

    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        self.send_set(patches)
    }

    fn set_source(&self, _source_id: u32, _arg1: u32, _arg2: u32) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_position(&self, _x: f32, _y: f32, _clear_trails: bool) -> ScResult<()> {
        Ok(())
    }
}

impl ScDest for RemoteDisplay {
    fn max_size(&self) -> (u16, u16) {
        self.max_size
    }

    fn clear(&self, value: u8) -> ScResult<()> {
        let win = *self.win.lock().unwrap_or_else(PoisonError::into_inner);
        let mut set = PatchSet::new(PatchFormat::Rle8);
        set.push(Patch::filled(0, 0, win.w, win.h, value)?);
        self.send_set(&set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PatchAck, MAX_DATAGRAM};

    fn pair() -> (RemoteDisplay, UdpSocket) {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let display = RemoteDisplay::new(5, client.local_addr().unwrap(), server, (128, 128));
        (display, client)
    }

    fn recv_packet(client: &UdpSocket) -> PatchPacket {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        PatchPacket::parse(&buf[..len]).unwrap()
    }

    #[test]
    fn large_sets_are_split_and_numbered() {
        let (display, client) = pair();
        let pixels: Vec<u8> = (0..128 * 64).map(|i| (i * 7 % 251) as u8).collect();
        let mut set = PatchSet::new(PatchFormat::Raw8);
        set.push(Patch::new(0, 0, 128, 64, pixels).unwrap());
        display.patch_set(&set).unwrap();

        let sent = display.packets_sent() as usize;
        assert!(sent > 1);
        let mut seqs = Vec::new();
        let mut covered = 0usize;
        for _ in 0..sent {
            let packet = recv_packet(&client);
            assert_eq!(packet.window_id, 5);
            assert!(packet.words.len() <= MAX_PATCH_WORDS);
            covered += packet.to_set().unwrap().pixel_count();
            seqs.push(packet.seq);
        }
        assert_eq!(seqs, (0..sent as u32).collect::<Vec<_>>());
        assert_eq!(covered, 128 * 64);
        assert_eq!(display.pending(), sent);
    }

    #[test]
    fn unacked_packets_are_retransmitted_then_dropped() {
        let (display, client) = pair();
        display.clear(3).unwrap();
        let first = recv_packet(&client);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(display.retransmit_due(Duration::from_millis(10), 1), 1);
        let again = recv_packet(&client);
        assert_eq!(again.seq, first.seq);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(display.retransmit_due(Duration::from_millis(10), 1), 0);
        assert_eq!(display.expired(), 1);
        assert_eq!(display.pending(), 0);
    }

    #[test]
    fn ack_stops_retransmission() {
        let (display, client) = pair();
        display.clear(9).unwrap();
        let packet = recv_packet(&client);
        let ack = PatchAck {
            seq: packet.seq,
            window_id: 5,
        };
        assert_eq!(PatchAck::parse(&ack.encode()).unwrap().seq, packet.seq);
        assert!(display.ack(packet.seq));
        assert!(!display.ack(packet.seq));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(display.retransmit_due(Duration::from_millis(10), 3), 0);
        assert_eq!(display.retransmits(), 0);
    }

    #[test]
    fn closed_display_rejects_patches() {
        let (display, _client) = pair();
        display.close();
        assert!(display.clear(0).is_err());
        assert!(display.set_radar_colour(0, Rgb::default()).unwrap_err().is_not_supported());
    }
}

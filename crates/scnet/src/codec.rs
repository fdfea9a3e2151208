//! Datagram layouts: patch packets, acks, heartbeats, multicast messages
//!
//! All fixed headers are big-endian. Multicast bodies are bincode behind a
//! magic word.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use contracts::{
    FadeType, PatchFormat, PatchSet, Rgb, ScError, ScResult, ScState, SweepLine, View, WinGeom,
    MAX_DESTINATIONS,
};
use serde::{Deserialize, Serialize};

pub const PATCH_MAGIC: u32 = 0xC0DE_3174;
pub const ACK_MAGIC: u32 = 0xC0DE_3175;
pub const MCAST_MAGIC: u32 = 0xC0DE_3176;
pub const HEARTBEAT_MAGIC: u32 = 0xC0DE_7241;

/// Layout version carried in every patch packet
pub const PATCH_VERSION: u8 = 1;

pub const PATCH_HEADER_LEN: usize = 16;
pub const ACK_LEN: usize = 12;
pub const HEARTBEAT_LEN: usize = 20;

/// Largest datagram any receiver needs to accept
pub const MAX_DATAGRAM: usize = 65_536;

/// One patch set on the wire
///
/// `magic u32, version u8, format u8, window_id u16, seq u32,
/// num_patches u16, patch_len u16, words[patch_len]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPacket {
    pub seq: u32,
    pub window_id: u16,
    pub format: PatchFormat,
    pub num_patches: u16,
    pub words: Vec<u16>,
}

impl PatchPacket {
    pub fn from_set(seq: u32, window_id: u16, set: &PatchSet) -> ScResult<Self> {
        let (num_patches, words) = set.encode();
        if words.len() > u16::MAX as usize || set.len() > u16::MAX as usize {
            return Err(ScError::invalid("patches", "patch set too large for one packet"));
        }
        Ok(Self {
            seq,
            window_id,
            format: set.format,
            num_patches,
            words,
        })
    }

    pub fn to_set(&self) -> ScResult<PatchSet> {
        PatchSet::decode(self.format.as_u8(), self.num_patches, &self.words)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PATCH_HEADER_LEN + self.words.len() * 2);
        buf.put_u32(PATCH_MAGIC);
        buf.put_u8(PATCH_VERSION);
        buf.put_u8(self.format.as_u8());
        buf.put_u16(self.window_id);
        buf.put_u32(self.seq);
        buf.put_u16(self.num_patches);
        buf.put_u16(self.words.len() as u16);
        for word in &self.words {
            buf.put_u16(*word);
        }
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> ScResult<Self> {
        if data.len() < PATCH_HEADER_LEN {
            return Err(ScError::protocol(format!(
                "patch packet of {} bytes shorter than header",
                data.len()
            )));
        }
        let mut buf = data;
        let magic = buf.get_u32();
        if magic != PATCH_MAGIC {
            return Err(ScError::protocol(format!("bad patch magic {magic:#010x}")));
        }
        let version = buf.get_u8();
        if version != PATCH_VERSION {
            return Err(ScError::protocol(format!("unsupported patch version {version}")));
        }
        let format = PatchFormat::from_u8(buf.get_u8())?;
        let window_id = buf.get_u16();
        let seq = buf.get_u32();
        let num_patches = buf.get_u16();
        let patch_len = buf.get_u16() as usize;
        if buf.remaining() != patch_len * 2 {
            return Err(ScError::protocol(format!(
                "patch_len {patch_len} does not match {} payload bytes",
                buf.remaining()
            )));
        }
        let words = (0..patch_len).map(|_| buf.get_u16()).collect();
        Ok(Self {
            seq,
            window_id,
            format,
            num_patches,
            words,
        })
    }
}

/// Receipt for one patch packet: `magic u32, window_id u16, reserved u16, seq u32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchAck {
    pub seq: u32,
    pub window_id: u16,
}

impl PatchAck {
    pub fn encode(&self) -> [u8; ACK_LEN] {
        let mut out = [0u8; ACK_LEN];
        let mut buf = &mut out[..];
        buf.put_u32(ACK_MAGIC);
        buf.put_u16(self.window_id);
        buf.put_u16(0);
        buf.put_u32(self.seq);
        out
    }

    pub fn parse(data: &[u8]) -> ScResult<Self> {
        if data.len() != ACK_LEN {
            return Err(ScError::protocol(format!("ack of {} bytes", data.len())));
        }
        let mut buf = data;
        let magic = buf.get_u32();
        if magic != ACK_MAGIC {
            return Err(ScError::protocol(format!("bad ack magic {magic:#010x}")));
        }
        let window_id = buf.get_u16();
        let _reserved = buf.get_u16();
        let seq = buf.get_u32();
        Ok(Self { seq, window_id })
    }
}

/// Periodic liveness announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub app_id: u16,
    /// 0 ok, higher is worse
    pub health: u8,
    /// 1 while the command loop runs
    pub state: u8,
    /// First connected client, unspecified when none
    pub client_addr: Ipv4Addr,
    pub listening_port: u16,
    pub source_status: u8,
    pub source_type: u8,
    /// Windows currently served
    pub num_channels: u16,
    /// Low 16 bits of the sender's process id
    pub process_id: u16,
}

impl Heartbeat {
    pub fn new(app_id: u16, listening_port: u16) -> Self {
        Self {
            app_id,
            health: 0,
            state: 0,
            client_addr: Ipv4Addr::UNSPECIFIED,
            listening_port,
            source_status: 0,
            source_type: 0,
            num_channels: 0,
            process_id: (std::process::id() & 0xffff) as u16,
        }
    }

    pub fn encode(&self) -> [u8; HEARTBEAT_LEN] {
        let mut out = [0u8; HEARTBEAT_LEN];
        let mut buf = &mut out[..];
        buf.put_u32(HEARTBEAT_MAGIC);
        buf.put_u16(self.app_id);
        buf.put_u8(self.health);
        buf.put_u8(self.state);
        buf.put_u32(u32::from(self.client_addr));
        buf.put_u16(self.listening_port);
        buf.put_u8(self.source_status);
        buf.put_u8(self.source_type);
        buf.put_u16(self.num_channels);
        buf.put_u16(self.process_id);
        out
    }

    /// Rejects short input and foreign magic; trailing bytes are ignored
    pub fn parse(data: &[u8]) -> ScResult<Self> {
        if data.len() < HEARTBEAT_LEN {
            return Err(ScError::protocol(format!(
                "heartbeat of {} bytes, need {HEARTBEAT_LEN}",
                data.len()
            )));
        }
        let mut buf = data;
        let magic = buf.get_u32();
        if magic != HEARTBEAT_MAGIC {
            return Err(ScError::protocol(format!("bad heartbeat magic {magic:#010x}")));
        }
        Ok(Self {
            app_id: buf.get_u16(),
            health: buf.get_u8(),
            state: buf.get_u8(),
            client_addr: Ipv4Addr::from(buf.get_u32()),
            listening_port: buf.get_u16(),
            source_status: buf.get_u8(),
            source_type: buf.get_u8(),
            num_channels: buf.get_u16(),
            process_id: buf.get_u16(),
        })
    }
}

/// Change flags of a multicast config message
pub mod change {
    pub const POS: u32 = 0x001;
    pub const DIM: u32 = 0x002;
    pub const VIEW: u32 = 0x004;
    pub const RADAR: u32 = 0x008;
    pub const STATE: u32 = 0x010;
    pub const FADE: u32 = 0x020;
    pub const COL: u32 = 0x040;
    pub const SOURCE: u32 = 0x080;
    pub const SWEEPLINE: u32 = 0x100;
    pub const ALL: u32 = 0x1ff;
}

/// Full display configuration mirrored to multicast listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McastState {
    pub win: WinGeom,
    pub view: View,
    pub radar: (f32, f32),
    pub states: [ScState; MAX_DESTINATIONS],
    pub fades: [(FadeType, u16); MAX_DESTINATIONS],
    pub colours: [Rgb; MAX_DESTINATIONS],
    pub brights: [u8; MAX_DESTINATIONS],
    pub source: (u32, u32, u32),
    pub sweep: SweepLine,
}

impl McastState {
    pub fn new(win: WinGeom) -> Self {
        Self {
            win,
            view: View::default(),
            radar: (0.0, 0.0),
            states: [ScState::Run; MAX_DESTINATIONS],
            fades: [(FadeType::RealTime, 4); MAX_DESTINATIONS],
            colours: [Rgb::from_u32(0x00ff00); MAX_DESTINATIONS],
            brights: [100; MAX_DESTINATIONS],
            source: (0, 0, 0),
            sweep: SweepLine::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McastMessage {
    /// `changes == 0` marks a periodic refresh
    Config {
        window_id: u16,
        changes: u32,
        state: McastState,
    },
    Patches {
        window_id: u16,
        seq: u32,
        set: PatchSet,
    },
}

impl McastMessage {
    pub fn window_id(&self) -> u16 {
        match self {
            Self::Config { window_id, .. } | Self::Patches { window_id, .. } => *window_id,
        }
    }

    pub fn encode(&self) -> ScResult<Bytes> {
        let body = bincode::serialize(self)
            .map_err(|e| ScError::protocol(format!("mcast encode: {e}")))?;
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(MCAST_MAGIC);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn parse(data: &[u8]) -> ScResult<Self> {
        if data.len() < 4 {
            return Err(ScError::protocol("mcast message shorter than magic"));
        }
        let mut buf = data;
        let magic = buf.get_u32();
        if magic != MCAST_MAGIC {
            return Err(ScError::protocol(format!("bad mcast magic {magic:#010x}")));
        }
        bincode::deserialize(buf).map_err(|e| ScError::protocol(format!("mcast decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::Patch;

    fn sample_set() -> PatchSet {
        let mut set = PatchSet::new(PatchFormat::Rle8);
        set.push(Patch::filled(3, 4, 5, 2, 0x7f).unwrap());
        set.push(Patch::new(0, 0, 3, 1, vec![1, 2, 3]).unwrap());
        set
    }

    #[test]
    fn patch_packet_carries_the_set() {
        let packet = PatchPacket::from_set(7, 2, &sample_set()).unwrap();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), PATCH_HEADER_LEN + packet.words.len() * 2);
        let parsed = PatchPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.to_set().unwrap(), sample_set());
    }

    #[test]
    fn patch_packet_counts_banded_patches() {
        let mut set = PatchSet::new(PatchFormat::Rle8);
        set.push(Patch::filled(0, 0, 300, 300, 9).unwrap());
        let packet = PatchPacket::from_set(3, 1, &set).unwrap();
        assert_eq!(packet.num_patches, 2);
        let parsed = PatchPacket::parse(&packet.encode()).unwrap();
        let back = parsed.to_set().unwrap();
        assert_eq!(back.pixel_count(), 300 * 300);
        assert!(back.patches.iter().all(|p| p.pixels.iter().all(|&v| v == 9)));
    }

    #[test]
    fn patch_packet_rejects_damage() {
        let bytes = PatchPacket::from_set(1, 1, &sample_set()).unwrap().encode();
        assert!(PatchPacket::parse(&bytes[..10]).is_err());
        assert!(PatchPacket::parse(&bytes[..bytes.len() - 2]).is_err());
        let mut bad_magic = bytes.to_vec();
        bad_magic[0] ^= 0xff;
        assert!(PatchPacket::parse(&bad_magic).is_err());
        let mut bad_version = bytes.to_vec();
        bad_version[4] = 9;
        assert!(PatchPacket::parse(&bad_version).is_err());
    }

    #[test]
    fn ack_layout() {
        let ack = PatchAck { seq: 0x01020304, window_id: 3 };
        let bytes = ack.encode();
        assert_eq!(&bytes[..4], &ACK_MAGIC.to_be_bytes());
        assert_eq!(PatchAck::parse(&bytes).unwrap(), ack);
        assert!(PatchAck::parse(&bytes[..8]).is_err());
    }

    #[test]
    fn heartbeat_parse_rejects_short_or_foreign() {
        let mut hb = Heartbeat::new(0x5c01, 4377);
        hb.client_addr = Ipv4Addr::new(10, 0, 0, 7);
        hb.num_channels = 3;
        let bytes = hb.encode();
        assert_eq!(Heartbeat::parse(&bytes).unwrap(), hb);
        assert!(Heartbeat::parse(&bytes[..HEARTBEAT_LEN - 1]).is_err());
        let mut foreign = bytes;
        foreign[3] = 0;
        assert!(Heartbeat::parse(&foreign).is_err());
    }

    #[test]
    fn mcast_message_behind_magic() {
        let msg = McastMessage::Config {
            window_id: 4,
            changes: change::VIEW | change::COL,
            state: McastState::new(WinGeom::new(0, 0, 64, 64)),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(McastMessage::parse(&bytes).unwrap(), msg);
        assert!(McastMessage::parse(&bytes[..3]).is_err());
        assert!(McastMessage::parse(&bytes[..bytes.len() / 2]).is_err());
    }
}

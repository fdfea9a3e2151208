//! # ScNet
//!
//! 扫描转换的网络分发。
//!
//! - `ScServer` / `SourceNet`: TCP 命令通道 + UDP 补丁发送、确认与重传
//! - `DestNet`: 客户端，把控制调用转发到服务器，把补丁按序应用到本地目的地
//! - `DestMcast` / `SourceMcast`: 单向组播配置与补丁
//! - `HeartbeatSender` / `HeartbeatMonitor`: 心跳

pub mod client;
pub mod codec;
pub mod command;
pub mod context;
pub mod heartbeat;
pub mod inflight;
pub mod mcast;
pub mod remote_display;
pub mod server;
pub mod source;

pub use client::{ClientStats, ConnState, DestNet};
pub use codec::{change, Heartbeat, McastMessage, McastState, PatchAck, PatchPacket};
pub use command::{Command, Reply};
pub use context::{NetContext, DEFAULT_APP_ID, MAX_WINDOWS};
pub use heartbeat::{HeartbeatMonitor, HeartbeatSender, PeerStatus};
pub use inflight::InFlight;
pub use mcast::{DestMcast, McastStats, SourceMcast, ANY_WINDOW};
pub use remote_display::RemoteDisplay;
pub use server::ScServer;
pub use source::{execute, DisplayTarget, NetEvent, SourceNet, StopHandle, MAX_LINE};

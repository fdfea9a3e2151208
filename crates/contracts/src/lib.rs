//! # Contracts
//!
//! Frozen interface contracts shared by the scan converter, destinations and
//! the network transport. All business crates depend on this crate only;
//! reverse dependencies are prohibited.
//!
//! ## Coordinate model
//! - Azimuth is 16-bit, 0..=65535 over one revolution, clockwise from north
//! - World coordinates are metres, x east and y north
//! - Screen coordinates are pixels, origin top-left

mod blueprint;
mod control;
mod dirty;
mod error;
mod feed;
mod patch;
mod radar_return;
mod report;
mod sc;

pub use blueprint::*;
pub use control::*;
pub use dirty::{DirtyBox, DirtyRegion};
pub use error::*;
pub use feed::{LocalPatchSink, PatchSink, ReturnCallback, ReturnSource};
pub use patch::*;
pub use radar_return::{Return, Samples};
pub use report::OutputReport;
pub use sc::*;

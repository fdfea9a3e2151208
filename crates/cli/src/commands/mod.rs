//! Command implementations.

mod display;
mod heartbeats;
mod info;
mod serve;
mod simulate;
mod validate;

pub use display::run_display;
pub use heartbeats::run_heartbeats;
pub use info::run_info;
pub use serve::run_serve;
pub use simulate::run_simulate;
pub use validate::run_validate;

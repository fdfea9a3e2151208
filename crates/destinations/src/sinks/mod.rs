//! Patch sinks driven by `DestHandle` workers

mod file;
mod log;

pub use self::file::{read_recording, PatchRecorder, RecordedPatchSet};
pub use self::log::LogSink;

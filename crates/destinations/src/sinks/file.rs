//! PatchRecorder - appends patch sets to a recording file
//!
//! Record layout: `u32` little-endian length, then the bincode encoding of
//! a `RecordedPatchSet`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use contracts::{PatchSet, PatchSink, ScError, ScResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

/// One patch set with its capture time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedPatchSet {
    pub seq: u64,
    /// Microseconds since the Unix epoch
    pub timestamp_us: i64,
    pub set: PatchSet,
}

pub struct PatchRecorder {
    name: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    seq: u64,
}

impl PatchRecorder {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            name: name.into(),
            path,
            writer: Some(BufWriter::new(file)),
            seq: 0,
        })
    }

    /// `path` param, default `./recordings/<name>.screc`
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> std::io::Result<Self> {
        let name = name.into();
        let path = params
            .get("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("./recordings/{name}.screc")));
        Self::new(name, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, patches: &PatchSet) -> std::io::Result<()> {
        let record = RecordedPatchSet {
            seq: self.seq,
            timestamp_us: chrono::Utc::now().timestamp_micros(),
            set: patches.clone(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("recorder closed"))?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
        self.seq += 1;
        Ok(())
    }
}

impl PatchSink for PatchRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "recorder_write", skip(self, patches), fields(sink = %self.name, seq = self.seq))]
    async fn write(&mut self, patches: &PatchSet) -> ScResult<()> {
        self.append(patches).map_err(|e| {
            error!(sink = %self.name, error = %e, "record append failed");
            ScError::Io(e)
        })
    }

    async fn flush(&mut self) -> ScResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    #[instrument(name = "recorder_close", skip(self))]
    async fn close(&mut self) -> ScResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        debug!(sink = %self.name, records = self.seq, path = %self.path.display(), "recording closed");
        Ok(())
    }
}

/// Read every record of a recording file
pub fn read_recording(path: impl AsRef<Path>) -> ScResult<Vec<RecordedPatchSet>> {
    let mut bytes = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut bytes)?;
    let mut records = Vec::new();
    let mut at = 0usize;
    while at < bytes.len() {
        let Some(header) = bytes.get(at..at + 4) else {
            return Err(ScError::protocol("truncated record header"));
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        at += 4;
        let Some(body) = bytes.get(at..at + len) else {
            return Err(ScError::protocol(format!("record {} truncated", records.len())));
        };
        let record: RecordedPatchSet = bincode::deserialize(body)
            .map_err(|e| ScError::protocol(format!("bad record: {e}")))?;
        records.push(record);
        at += len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{Patch, PatchFormat};
    use tempfile::tempdir;

    #[tokio::test]
    async fn recording_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("a.screc");
        let mut sink = PatchRecorder::new("rec", &path).unwrap();
        let set = PatchSet {
            format: PatchFormat::Raw8,
            patches: vec![Patch::new(0, 0, 2, 1, vec![3, 4]).unwrap()],
        };
        sink.write(&set).await.unwrap();
        sink.write(&set).await.unwrap();
        sink.close().await.unwrap();

        let records = read_recording(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq, 1);
        assert_eq!(records[0].set, set);
        assert!(records[0].timestamp_us > 0);
    }

    #[test]
    fn truncated_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.screc");
        fs::write(&path, [10, 0, 0, 0, 1, 2]).unwrap();
        assert!(read_recording(&path).is_err());
    }
}

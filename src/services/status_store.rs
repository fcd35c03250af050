use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::models::{StatusSnapshot, TunnelInfo};

/// Best-effort on-disk cache of the last status snapshot.
///
/// Only the tunnel tags are ever read back; liveness is always re-derived at runtime.
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    /// Sequence number of the snapshot currently on disk
    written: Mutex<u64>,
}

#[derive(Deserialize)]
struct PersistedStatus {
    #[serde(default)]
    tunnel_info: TunnelInfo,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot through a temporary file so readers never see half a document.
    pub fn save(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(snapshot).context("serialize status snapshot")?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} to {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// Saves snapshot number `seq` unless a later one already reached the disk.
    ///
    /// Writers may finish out of order; the sequence keeps the file monotonic.
    pub fn save_newer(&self, seq: u64, snapshot: &StatusSnapshot) -> anyhow::Result<bool> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if seq <= *written {
            return Ok(false);
        }

        self.save(snapshot)?;
        *written = seq;
        Ok(true)
    }

    /// Last known tunnel tags, if a readable cache exists.
    pub fn load_tunnel_info(&self) -> anyhow::Result<Option<TunnelInfo>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path).with_context(|| format!("read {}", self.path.display()))?;
        let persisted: PersistedStatus = serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;

        let info = persisted.tunnel_info;
        if info.tunnel_type.is_empty() && info.domain.is_empty() {
            return Ok(None);
        }
        Ok(Some(info))
    }
}

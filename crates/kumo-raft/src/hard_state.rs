//! Durable vote state: `{current_term, voted_for}`.
//!
//! Rewritten whenever either field changes, and the rewrite must complete
//! before the RPC reply that depends on it leaves the node. Written via
//! tmp file + rename + fsync so a crash leaves either the old or the new
//! record, never a torn one.

use crate::error::Result;
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "consensus-state";

/// The two fields Raft must never lose.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// On-disk home of [`HardState`].
pub struct HardStateFile {
    path: PathBuf,
}

impl HardStateFile {
    /// Load the persisted state from `dir`, defaulting to term 0 / no vote
    /// on a fresh start.
    pub fn load(dir: impl AsRef<Path>) -> Result<(Self, HardState)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);

        let state = match std::fs::read(&path) {
            Ok(raw) => bincode::deserialize(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok((Self { path }, state))
    }

    /// Durably replace the record.
    pub fn save(&self, state: &HardState) -> Result<()> {
        let body = bincode::serialize(state)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        // Make the rename itself durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_data();
            }
        }
        Ok(())
    }
}

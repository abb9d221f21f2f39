//! Ownership records for managed blocks.
//!
//! A block found in the mount table is "managed" iff a record with its id
//! exists here. Only the privileged helper writes records; the app reads
//! them to mark registry entries.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::BlockId;
use crate::error::Result;

pub const DEFAULT_LEDGER_DIR: &str = "/var/lib/lindy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub id: String,
    pub block: String,
    pub targets: Vec<String>,
    pub installed_at: u64,
    #[serde(default)]
    pub adopted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipLedger {
    dir: PathBuf,
}

impl OwnershipLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &BlockId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn record(&self, id: &BlockId, block: &str, targets: &[String], adopted: bool) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let record = OwnershipRecord {
            id: id.to_string(),
            block: block.to_string(),
            targets: targets.to_vec(),
            installed_at: now_secs(),
            adopted,
        };
        fs::write(self.record_path(id), serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.record_path(id).is_file()
    }

    /// Removing a record that does not exist is not an error.
    pub fn forget(&self, id: &BlockId) -> Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All readable records. A missing directory means no records.
    pub fn records(&self) -> Vec<OwnershipRecord> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .flatten()
            .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|entry| fs::read_to_string(entry.path()).ok())
            .filter_map(|text| serde_json::from_str::<OwnershipRecord>(&text).ok())
            .collect()
    }

    pub fn managed_ids(&self) -> HashSet<String> {
        self.records().into_iter().map(|record| record.id).collect()
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

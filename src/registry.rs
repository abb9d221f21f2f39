//! The app's view of the marked blocks in the mount table.
//!
//! The registry is replaced wholesale on every refresh and never edited in
//! place; protocols only ask for a refresh after a terminal outcome.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::cancel::{RefreshToken, Supersession};
use crate::fstab::ledger::OwnershipLedger;
use crate::fstab::plan::blocks_with_ownership;
use crate::fstab::{find_block, find_block_for_target, parse_bind, FstabBlock};

/// Where blocks are read from. Reading never needs elevation.
#[derive(Debug, Clone)]
pub struct RegistrySource {
    pub fstab_path: PathBuf,
    pub ledger: OwnershipLedger,
}

impl RegistrySource {
    pub fn new(fstab_path: impl Into<PathBuf>, ledger_dir: impl Into<PathBuf>) -> Self {
        Self {
            fstab_path: fstab_path.into(),
            ledger: OwnershipLedger::new(ledger_dir),
        }
    }

    /// Scans the table and marks owned blocks. When the table can't be
    /// read, the ledger's own copies stand in for managed blocks.
    pub fn load(&self) -> Vec<FstabBlock> {
        let managed = self.ledger.managed_ids();
        match fs::read_to_string(&self.fstab_path) {
            Ok(table) => blocks_with_ownership(&table, &managed),
            Err(err) => {
                log::warn!(
                    "cannot read {}: {err}; listing recorded blocks only",
                    self.fstab_path.display()
                );
                self.recorded_blocks()
            }
        }
    }

    fn recorded_blocks(&self) -> Vec<FstabBlock> {
        self.ledger
            .records()
            .into_iter()
            .map(|record| FstabBlock {
                binds: record.block.lines().filter_map(parse_bind).collect(),
                id: record.id,
                text: record.block,
                targets: record.targets,
                managed: true,
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: Mutex<Vec<FstabBlock>>,
    refreshes: Supersession,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FstabBlock> {
        self.blocks
            .lock()
            .map(|blocks| blocks.clone())
            .unwrap_or_default()
    }

    /// Starts a refresh; any earlier one in flight becomes stale.
    pub fn begin_refresh(&self) -> RefreshToken {
        self.refreshes.begin()
    }

    pub fn commit(&self, token: &RefreshToken, blocks: Vec<FstabBlock>) -> bool {
        token.commit(&self.blocks, blocks)
    }

    /// Loads and commits in one step. Returns whether the result was kept.
    pub fn refresh(&self, source: &RegistrySource) -> bool {
        let token = self.begin_refresh();
        let blocks = source.load();
        let count = blocks.len();
        let committed = self.commit(&token, blocks);
        if committed {
            log::debug!("registry refreshed with {count} block(s)");
        }
        committed
    }

    pub fn tear_down(&self) {
        self.refreshes.tear_down();
    }

    pub fn block_for_target(&self, target: &str) -> Option<FstabBlock> {
        let blocks = self.snapshot();
        find_block_for_target(&blocks, target).cloned()
    }

    pub fn block(&self, id: &str) -> Option<FstabBlock> {
        let blocks = self.snapshot();
        find_block(&blocks, id).cloned()
    }
}

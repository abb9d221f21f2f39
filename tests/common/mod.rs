//! Stand-in for the privileged helper.
//!
//! Runs the real privileged executor against a mount table and ledger in a
//! temporary directory, with `mount`/`umount`/`fuser` simulated. Only the
//! auto-map reply is scripted.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lindy_lib::fstab::ledger::OwnershipLedger;
use lindy_lib::fstab::{decode_mount_path, scan_blocks, BlockId};
use lindy_lib::helper::{HelperReply, HelperRequest, PrivilegedHelper};
use lindy_lib::partitions::Partition;
use lindy_lib::privileged::{CommandOutput, Executor, SystemOps};
use lindy_lib::{Error, Result};

pub const BASE_TABLE: &str = "\
UUID=53337bda-2dc1-4a14-a8d9-c1702ddd33d6 / ext4 defaults 0 1
";

/// Everything in the table counts as mounted. Unmounting a busy point fails
/// unless lazy, and `mount -a` fails while the table lists a busy point. A
/// lazy unmount releases the point.
struct FakeOps {
    fstab: PathBuf,
    busy: Mutex<HashSet<String>>,
}

impl FakeOps {
    fn is_busy(&self, point: &str) -> bool {
        self.busy.lock().unwrap().contains(point)
    }
}

impl SystemOps for FakeOps {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        match (program, args) {
            ("umount", [point]) if self.is_busy(point) => CommandOutput {
                ok: false,
                stdout: String::new(),
                stderr: format!("umount: {point}: target is busy."),
            },
            ("umount", ["-l", point]) => {
                self.busy.lock().unwrap().remove(*point);
                CommandOutput {
                    ok: true,
                    ..CommandOutput::default()
                }
            }
            ("mount", ["-a"]) => match self.mount_points().into_iter().find(|point| self.is_busy(point)) {
                Some(point) => CommandOutput {
                    ok: false,
                    stdout: String::new(),
                    stderr: format!("mount: {point}: target is busy."),
                },
                None => CommandOutput {
                    ok: true,
                    ..CommandOutput::default()
                },
            },
            ("fuser", [_, point]) => CommandOutput {
                ok: self.is_busy(point),
                ..CommandOutput::default()
            },
            _ => CommandOutput {
                ok: true,
                ..CommandOutput::default()
            },
        }
    }

    fn mount_points(&self) -> HashSet<String> {
        let table = fs::read_to_string(&self.fstab).unwrap_or_default();
        scan_blocks(&table)
            .iter()
            .flat_map(|block| block.targets.iter().cloned().chain(block.device_mountpoints()))
            .map(|point| decode_mount_path(&point))
            .collect()
    }

    fn create_dir(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn list_partitions(&self) -> Result<Vec<Partition>> {
        Ok(Vec::new())
    }

    fn log(&self, _source: &str, _line: &str) {}
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<HelperRequest>,
    spawn_fails: bool,
    auto_map_reply: Option<Value>,
}

pub struct FakeHelper {
    dir: tempfile::TempDir,
    ops: FakeOps,
    script: Mutex<Script>,
}

impl FakeHelper {
    pub fn new(table: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        fs::write(&fstab, table).unwrap();
        Self {
            ops: FakeOps {
                fstab,
                busy: Mutex::new(HashSet::new()),
            },
            dir,
            script: Mutex::new(Script::default()),
        }
    }

    /// Every invocation fails as if pkexec could not be started.
    pub fn without_pkexec() -> Self {
        let helper = Self::new(BASE_TABLE);
        helper.script.lock().unwrap().spawn_fails = true;
        helper
    }

    fn ledger_dir(&self) -> PathBuf {
        self.dir.path().join("ledger")
    }

    fn ledger(&self) -> OwnershipLedger {
        OwnershipLedger::new(self.ledger_dir())
    }

    /// Unmounting `target` reports busy unless the call is forced.
    pub fn mark_busy(&self, target: &str) {
        self.ops.busy.lock().unwrap().insert(target.to_string());
    }

    /// Records ownership of a block already in the table.
    pub fn set_managed(&self, id: &str) {
        let block = scan_blocks(&self.table())
            .into_iter()
            .find(|block| block.id == id)
            .unwrap();
        self.ledger()
            .record(&BlockId::parse(id).unwrap(), &block.text, &block.targets, false)
            .unwrap();
    }

    pub fn reply_to_auto_map(&self, reply: Value) {
        self.script.lock().unwrap().auto_map_reply = Some(reply);
    }

    pub fn table(&self) -> String {
        fs::read_to_string(&self.ops.fstab).unwrap()
    }

    pub fn is_managed(&self, id: &str) -> bool {
        self.ledger().contains(&BlockId::parse(id).unwrap())
    }

    pub fn calls(&self) -> Vec<HelperRequest> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn block_count(&self) -> usize {
        scan_blocks(&self.table()).len()
    }
}

impl PrivilegedHelper for FakeHelper {
    fn invoke(&self, request: &HelperRequest) -> Result<HelperReply> {
        let auto_map_reply = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(request.clone());
            if script.spawn_fails {
                return Err(Error::Spawn(io::Error::new(io::ErrorKind::NotFound, "pkexec: not found")));
            }
            script.auto_map_reply.clone()
        };
        let response = if request.action == lindy_lib::automap::ACTION {
            auto_map_reply.unwrap_or_else(|| {
                json!({ "status": "error", "code": "no_windows_partitions", "message": "none" })
            })
        } else {
            Executor::new(&self.ops.fstab, self.ledger_dir(), &self.ops).handle(request)
        };
        Ok(HelperReply {
            response,
            stderr: String::new(),
            stdout: String::new(),
        })
    }
}

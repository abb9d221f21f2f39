//! Privileged side of every mount-table operation.
//!
//! The `lindy_helper` binary is a thin shell around [`Executor`]: it reads
//! one request, checks it runs as root, and hands the request over together
//! with a [`SystemOps`] that really runs `mount`, `umount` and `fuser`.
//! Tests drive the same executor against temporary files and scripted
//! system commands.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::automap::{self, folders, AutoMapResponse, WindowsPartition};
use crate::error::Result;
use crate::fstab::ledger::{OwnershipLedger, DEFAULT_LEDGER_DIR};
use crate::fstab::plan::{
    blocks_with_ownership, ensure_device_line, plan_apply, plan_remove, ApplyPlan, RemovePlanError,
    RemoveSelector,
};
use crate::fstab::write::{backup_table, replace_table};
use crate::fstab::{decode_mount_path, find_block, scan_blocks, BlockId, DEFAULT_FSTAB_PATH};
use crate::helper::{HelperRequest, FSTAB_PATH_KEY, LEDGER_DIR_KEY};
use crate::partitions::{first_windows_partition, Partition};
use crate::protocol::{adopt, apply, remove, OperationResult, ResultCode, Status};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Everything the executor needs from the running system.
pub trait SystemOps {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput;

    /// Current mount points, decoded.
    fn mount_points(&self) -> HashSet<String>;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn list_partitions(&self) -> Result<Vec<Partition>>;

    /// Progress line for the app's log.
    fn log(&self, source: &str, line: &str);
}

type Reply = std::result::Result<OperationResult, OperationResult>;

pub struct Executor<'a> {
    fstab: PathBuf,
    ledger: OwnershipLedger,
    ops: &'a dyn SystemOps,
}

impl<'a> Executor<'a> {
    pub fn new(fstab: impl Into<PathBuf>, ledger_dir: impl Into<PathBuf>, ops: &'a dyn SystemOps) -> Self {
        Self {
            fstab: fstab.into(),
            ledger: OwnershipLedger::new(ledger_dir),
            ops,
        }
    }

    /// Uses the table and ledger locations the request names, or the
    /// system defaults. Relative paths are ignored.
    pub fn for_request(payload: &Value, ops: &'a dyn SystemOps) -> Self {
        let fstab = absolute_path(payload, FSTAB_PATH_KEY).unwrap_or_else(|| PathBuf::from(DEFAULT_FSTAB_PATH));
        let ledger = absolute_path(payload, LEDGER_DIR_KEY).unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_DIR));
        Self::new(fstab, ledger, ops)
    }

    pub fn handle(&self, request: &HelperRequest) -> Value {
        let payload = &request.payload;
        match request.action.as_str() {
            apply::ACTION => to_value(self.apply(payload)),
            adopt::ACTION => to_value(self.adopt(payload)),
            remove::ACTION_BY_TARGET => to_value(self.remove(payload, true)),
            remove::ACTION_BY_ID => to_value(self.remove(payload, false)),
            automap::ACTION => {
                serde_json::to_value(self.auto_map(payload)).unwrap_or_else(|err| invalid(err.to_string()))
            }
            other => invalid(format!("Unknown action: {other}")),
        }
    }

    fn read_table(&self) -> std::result::Result<String, OperationResult> {
        fs::read_to_string(&self.fstab).map_err(|err| {
            fail(
                ResultCode::PkexecFailed,
                format!("failed reading {}", self.fstab.display()),
            )
            .with_output(err.to_string(), "")
        })
    }

    /// Backup, then atomic replace.
    fn write_table(&self, contents: &str) -> std::result::Result<(), OperationResult> {
        let written = backup_table(&self.fstab).and_then(|backup| {
            self.ops
                .log("fstab", &format!("backup written to {}", backup.display()));
            replace_table(&self.fstab, contents)
        });
        written.map_err(|err| {
            fail(
                ResultCode::PkexecFailed,
                format!("failed writing {}", self.fstab.display()),
            )
            .with_output(err.to_string(), "")
        })
    }

    /// Puts `original` back after a later step failed. Returns what went
    /// wrong while restoring, if anything.
    fn restore_table(&self, original: &str) -> Option<String> {
        match replace_table(&self.fstab, original) {
            Ok(()) => {
                self.ops.log("fstab", "previous table restored");
                None
            }
            Err(err) => {
                self.ops.log("fstab", &format!("restoring the previous table failed: {err}"));
                Some(format!("restoring {} failed: {err}", self.fstab.display()))
            }
        }
    }

    fn apply(&self, payload: &Value) -> Reply {
        let id = read_block_id(payload)?;
        let block = read_string(payload, "block")?;
        let targets = read_targets(payload)?;
        let partition_uuid = read_optional_string(payload, "partitionUuid");
        let base_mount = read_optional_string(payload, "baseMount");
        let add_partition_line = read_bool(payload, "addPartitionLine");
        let force = read_bool(payload, "force");

        let block = ensure_device_line(
            &block,
            &id,
            partition_uuid.as_deref(),
            base_mount.as_deref(),
            add_partition_line,
        );
        let table = self.read_table()?;
        let managed = self.ledger.managed_ids();

        let (new_table, block) = match plan_apply(&table, &managed, &id, &block, &targets) {
            ApplyPlan::Append { new_table, block } => (new_table, block),
            // a forced retry of a block this helper already wrote only
            // repeats the activation
            ApplyPlan::Adoptable(existing) if force && existing.managed && existing.id == id.as_str() => {
                self.ops.log("fstab", &format!("block {id} already written, retrying activation"));
                let mounted = self.activate(&id, &existing.targets, true)?;
                return Ok(applied(&id, existing.text, existing.targets, mounted));
            }
            ApplyPlan::Adoptable(existing) => {
                self.ops
                    .log("fstab", &format!("block {} already covers a requested target", existing.id));
                let message = if existing.managed {
                    "a managed block already covers this target"
                } else {
                    "an existing block covers this target and can be adopted"
                };
                return Ok(OperationResult {
                    status: Status::Adoptable,
                    ..fail(ResultCode::AdoptableExistingBlock, message)
                }
                .with_id(existing.id)
                .with_block(existing.text, existing.targets));
            }
            ApplyPlan::Conflict { target, entry } => {
                return Err(fail(
                    ResultCode::TargetConflict,
                    format!("{target} is already mounted by an entry outside lindy: {entry}"),
                ));
            }
            ApplyPlan::Rejected(reason) => return Err(fail(ResultCode::InvalidRequest, reason)),
        };

        if let Some(base) = base_mount.as_deref().filter(|_| block.contains("UUID=")) {
            if let Err(err) = self.ops.create_dir(Path::new(base)) {
                self.ops.log("fstab", &format!("could not create {base}: {err}"));
            }
        }

        self.write_table(&new_table)?;
        if let Err(err) = self.ledger.record(&id, &block, &targets, false) {
            self.ops.log("ledger", &format!("could not record {id}: {err}"));
            let mut stderr = err.to_string();
            if let Some(restore) = self.restore_table(&table) {
                stderr = format!("{stderr}\n{restore}");
            }
            return Err(fail(
                ResultCode::PkexecFailed,
                format!("failed to record ownership of {id}; the block was not kept"),
            )
            .with_id(id.to_string())
            .with_output(stderr, ""));
        }

        let mounted = self.activate(&id, &targets, force)?;
        Ok(applied(&id, block, targets, mounted))
    }

    /// Runs `mount -a`. A forced activation lazily unmounts the targets
    /// and tries once more; otherwise a failure reports who holds them.
    fn activate(
        &self,
        id: &BlockId,
        targets: &[String],
        force: bool,
    ) -> std::result::Result<CommandOutput, OperationResult> {
        let mounted = self.ops.run("mount", &["-a"]);
        if mounted.ok {
            return Ok(mounted);
        }

        if force {
            self.ops
                .log("mount", "mount -a failed, lazily unmounting targets and retrying");
            for target in targets {
                let target = decode_mount_path(target);
                self.ops.run("umount", &["-l", target.as_str()]);
            }
            let retried = self.ops.run("mount", &["-a"]);
            if retried.ok {
                return Ok(retried);
            }
            return Err(fail(
                ResultCode::MountFailedAfterLazy,
                "mount -a failed again after lazy unmount",
            )
            .with_id(id.to_string())
            .with_output(join_output(&mounted.stderr, &retried.stderr), retried.stdout));
        }

        let (held, listing) = self.holders(targets);
        let busy = held || mounted.stderr.to_lowercase().contains("busy");
        let (code, message) = if busy {
            (ResultCode::Busy, "block appended but mount -a failed due to busy targets")
        } else {
            (ResultCode::MountFailed, "block appended but mount -a failed")
        };
        Err(fail(code, message)
            .with_id(id.to_string())
            .with_output(mounted.stderr, join_output(&mounted.stdout, &listing)))
    }

    /// `fuser -mv` for every target. `fuser` succeeds only when something
    /// holds the mount.
    fn holders(&self, targets: &[String]) -> (bool, String) {
        let mut held = false;
        let mut listing = String::new();
        for target in targets {
            let target = decode_mount_path(target);
            let out = self.ops.run("fuser", &["-mv", target.as_str()]);
            held |= out.ok;
            listing.push_str(&format!("FUSER {target}:\n"));
            listing.push_str(&out.stderr);
            listing.push_str(&out.stdout);
            if !listing.ends_with('\n') {
                listing.push('\n');
            }
        }
        (held, listing)
    }

    fn adopt(&self, payload: &Value) -> Reply {
        let id = read_block_id(payload)?;
        let table = self.read_table()?;
        let blocks = blocks_with_ownership(&table, &self.ledger.managed_ids());
        let block = find_block(&blocks, id.as_str())
            .ok_or_else(|| fail(ResultCode::NotFound, format!("no block with id {id} in fstab")))?;

        self.ledger
            .record(&id, &block.text, &block.targets, true)
            .map_err(|err| {
                fail(ResultCode::PkexecFailed, format!("failed to record ownership of {id}"))
                    .with_output(err.to_string(), "")
            })?;
        self.ops.log("ledger", &format!("adopted block {id}"));

        Ok(OperationResult::ok(ResultCode::Adopted, "block adopted")
            .with_id(id.to_string())
            .with_block(block.text.clone(), block.targets.clone()))
    }

    fn remove(&self, payload: &Value, by_target: bool) -> Reply {
        let force = read_bool(payload, "force");
        let table = self.read_table()?;
        let managed = self.ledger.managed_ids();

        let plan = if by_target {
            let target = read_string(payload, "target")?;
            plan_remove(&table, &managed, RemoveSelector::Target(&target))
        } else {
            let id = read_block_id(payload)?;
            plan_remove(&table, &managed, RemoveSelector::Id(&id))
        };
        let plan = plan.map_err(|err| {
            let code = match err {
                RemovePlanError::NotFound(_) => ResultCode::NotFound,
                RemovePlanError::NotManaged(_) => ResultCode::NotManaged,
                RemovePlanError::InvalidTarget(_) => ResultCode::InvalidRequest,
            };
            fail(code, err.to_string())
        })?;
        let id = BlockId::parse(&plan.block.id)
            .map_err(|err| fail(ResultCode::InvalidRequest, err.to_string()))?;

        let mounted = self.ops.mount_points();
        let still_used = sources_in_use(&plan.new_table);

        let mut stdout = String::new();
        let mut stderr = String::new();
        for raw in &plan.unmount {
            let point = decode_mount_path(raw);
            if !mounted.contains(&point) {
                continue;
            }
            if !plan.block.covers(raw) && still_used.iter().any(|src| Path::new(src).starts_with(&point)) {
                self.ops
                    .log("umount", &format!("keeping {point}, other blocks bind from it"));
                continue;
            }
            let mut out = self.ops.run("umount", &[point.as_str()]);
            if !out.ok && force {
                self.ops
                    .log("umount", &format!("umount {point} failed, trying lazy unmount"));
                out = self.ops.run("umount", &["-l", point.as_str()]);
            }
            stdout.push_str(&out.stdout);
            stderr.push_str(&out.stderr);
            if !out.ok {
                // the table is left untouched so the user can retry
                return Err(fail(ResultCode::PkexecFailed, format!("umount {point} failed"))
                    .with_id(id.to_string())
                    .with_output(stderr, stdout));
            }
        }

        self.write_table(&plan.new_table)?;
        if let Err(err) = self.ledger.forget(&id) {
            self.ops
                .log("ledger", &format!("could not delete record for {id}: {err}"));
            stderr = join_output(&stderr, &err.to_string());
            if let Some(restore) = self.restore_table(&table) {
                stderr = join_output(&stderr, &restore);
            }
            let remount = self.ops.run("mount", &["-a"]);
            return Err(fail(
                ResultCode::PkexecFailed,
                format!("failed to delete the ownership record of {id}; the block was kept"),
            )
            .with_id(id.to_string())
            .with_output(join_output(&stderr, &remount.stderr), join_output(&stdout, &remount.stdout)));
        }
        let remount = self.ops.run("mount", &["-a"]);
        stdout.push_str(&remount.stdout);
        stderr.push_str(&remount.stderr);

        Ok(OperationResult::ok(ResultCode::Removed, "fstab block removed and mount -a executed")
            .with_id(id.to_string())
            .with_block(plan.block.text, plan.block.targets)
            .with_output(stderr, stdout))
    }

    fn auto_map(&self, payload: &Value) -> AutoMapResponse {
        let error = |code: ResultCode, message: &str, username: Option<String>, mount_point: Option<String>| {
            AutoMapResponse::Error {
                code,
                message: message.to_string(),
                stderr: None,
                stdout: None,
                username,
                mount_point,
            }
        };

        let partitions = match self.ops.list_partitions() {
            Ok(parts) => parts,
            Err(err) => {
                self.ops.log("lsblk", &err.to_string());
                return error(ResultCode::NoWindowsPartitions, "could not list partitions", None, None);
            }
        };
        let Some(windows) = first_windows_partition(&partitions) else {
            return error(ResultCode::NoWindowsPartitions, "no NTFS or exFAT partition found", None, None);
        };
        self.ops
            .log("lsblk", &format!("using /dev/{} ({:?})", windows.name, windows.fstype));

        let mount_point = match windows.mountpoint.as_deref().filter(|mp| !mp.is_empty()) {
            Some(existing) => existing.to_string(),
            None => {
                let base = read_optional_string(payload, "preferredMountBase")
                    .unwrap_or_else(|| automap::DEFAULT_WINDOWS_BASE.to_string());
                if let Err(err) = self.ops.create_dir(Path::new(&base)) {
                    self.ops.log("mount", &format!("could not create {base}: {err}"));
                }
                let device = format!("/dev/{}", windows.name);
                let mounted = self
                    .ops
                    .run("mount", &["-o", "rw", device.as_str(), base.as_str()]);
                if !mounted.ok {
                    return AutoMapResponse::Error {
                        code: ResultCode::MountFailed,
                        message: format!("mounting {device} at {base} failed"),
                        stderr: Some(mounted.stderr),
                        stdout: Some(mounted.stdout),
                        username: None,
                        mount_point: Some(base),
                    };
                }
                base
            }
        };

        let base = PathBuf::from(&mount_point);
        let username = read_optional_string(payload, "username");
        let Some(user) = folders::resolve_windows_user(&base, username.as_deref()) else {
            return error(
                ResultCode::NoUsersDetected,
                "no Windows user profiles found",
                None,
                Some(mount_point),
            );
        };

        let home = read_optional_string(payload, "home").unwrap_or_else(|| "/root".to_string());
        let mappings = folders::suggest_folder_mappings(&base, Some(user.as_str()), Path::new(&home));
        if mappings.is_empty() {
            return error(
                ResultCode::NoMappingsFound,
                "no matching folders found",
                Some(user),
                Some(mount_point),
            );
        }

        AutoMapResponse::Ok {
            mount_point,
            windows_partition: WindowsPartition {
                uuid: windows.uuid.clone().unwrap_or_default(),
                label: windows.label.clone(),
            },
            username: user,
            mappings,
        }
    }
}

fn applied(id: &BlockId, block: String, targets: Vec<String>, mounted: CommandOutput) -> OperationResult {
    OperationResult::ok(ResultCode::Applied, "fstab block appended and mount -a executed")
        .with_id(id.to_string())
        .with_block(block, targets)
        .with_output(mounted.stderr, mounted.stdout)
}

/// Bind sources of every block that stays in the table, decoded.
fn sources_in_use(table: &str) -> HashSet<String> {
    scan_blocks(table)
        .into_iter()
        .flat_map(|block| block.binds.into_iter().map(|bind| decode_mount_path(&bind.src)))
        .collect()
}

fn join_output(first: &str, second: &str) -> String {
    match (first.trim_end().is_empty(), second.trim_end().is_empty()) {
        (_, true) => first.to_string(),
        (true, false) => second.to_string(),
        (false, false) => format!("{}\n{second}", first.trim_end()),
    }
}

fn to_value(reply: Reply) -> Value {
    let result = reply.unwrap_or_else(|err| err);
    serde_json::to_value(&result).unwrap_or_else(|err| invalid(err.to_string()))
}

pub fn invalid(message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "code": ResultCode::InvalidRequest.as_str(),
        "message": message.into(),
    })
}

fn fail(code: ResultCode, message: impl Into<String>) -> OperationResult {
    OperationResult::error(code, message)
}

fn absolute_path(payload: &Value, key: &str) -> Option<PathBuf> {
    read_optional_string(payload, key)
        .map(PathBuf::from)
        .filter(|path| path.is_absolute())
}

fn read_string(payload: &Value, key: &str) -> std::result::Result<String, OperationResult> {
    payload
        .get(key)
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .ok_or_else(|| fail(ResultCode::InvalidRequest, format!("Missing field: {key}")))
}

fn read_optional_string(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn read_bool(payload: &Value, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn read_block_id(payload: &Value) -> std::result::Result<BlockId, OperationResult> {
    let raw = read_string(payload, "id")?;
    BlockId::parse(&raw).map_err(|err| fail(ResultCode::InvalidRequest, err.to_string()))
}

fn read_targets(payload: &Value) -> std::result::Result<Vec<String>, OperationResult> {
    let targets: Vec<String> = payload
        .get("targets")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|t| t.trim().to_string())
                .collect()
        })
        .unwrap_or_default();
    if targets.is_empty() {
        return Err(fail(ResultCode::InvalidRequest, "Missing field: targets"));
    }
    if let Some(bad) = targets.iter().find(|t| !t.starts_with('/')) {
        return Err(fail(ResultCode::InvalidRequest, format!("invalid target path: {bad}")));
    }
    Ok(targets)
}

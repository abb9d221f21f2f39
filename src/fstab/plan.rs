//! Pure edit plans for the privileged helper. The helper reads the mount
//! table, asks for a plan, then executes it; keeping the decisions here
//! lets them run against an in-memory table in tests.

use std::collections::HashSet;
use thiserror::Error;

use super::{
    append_block, begin_marker, device_line, find_block, find_block_for_target,
    foreign_entry_for_target, scan_blocks, strip_block, validate_partition_id, BlockId, FstabBlock,
};

/// Scans `table` and marks blocks whose ids are in `managed`.
pub fn blocks_with_ownership(table: &str, managed: &HashSet<String>) -> Vec<FstabBlock> {
    let mut blocks = scan_blocks(table);
    for block in &mut blocks {
        block.managed = managed.contains(&block.id);
    }
    blocks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyPlan {
    Append { new_table: String, block: String },
    /// An existing block already covers a requested target (or reuses the id).
    Adoptable(FstabBlock),
    /// An unmarked entry already mounts onto a requested target.
    Conflict { target: String, entry: String },
    Rejected(String),
}

pub fn plan_apply(
    table: &str,
    managed: &HashSet<String>,
    id: &BlockId,
    block: &str,
    targets: &[String],
) -> ApplyPlan {
    let blocks = blocks_with_ownership(table, managed);

    if let Some(existing) = find_block(&blocks, id.as_str()) {
        return ApplyPlan::Adoptable(existing.clone());
    }
    for target in targets {
        if let Some(existing) = find_block_for_target(&blocks, target) {
            return ApplyPlan::Adoptable(existing.clone());
        }
    }
    for target in targets {
        if let Some(entry) = foreign_entry_for_target(table, target) {
            return ApplyPlan::Conflict {
                target: target.clone(),
                entry,
            };
        }
    }

    let submitted = scan_blocks(block);
    match submitted.as_slice() {
        [only] if only.id == id.as_str() => {}
        _ => return ApplyPlan::Rejected(format!("block text does not carry markers for {id}")),
    }

    ApplyPlan::Append {
        new_table: append_block(table, block),
        block: block.to_string(),
    }
}

/// Inserts the partition line right after the BEGIN marker when asked to
/// and the block does not already carry one.
pub fn ensure_device_line(
    block: &str,
    id: &BlockId,
    partition_uuid: Option<&str>,
    base_mount: Option<&str>,
    add_partition_line: bool,
) -> String {
    if !add_partition_line {
        return block.to_string();
    }
    let Some(uuid) = partition_uuid.map(str::trim).filter(|u| validate_partition_id(u)) else {
        return block.to_string();
    };
    let Some(base) = base_mount.map(str::trim).filter(|b| !b.is_empty()) else {
        return block.to_string();
    };
    if block.lines().any(|line| line.trim_start().starts_with("UUID=")) {
        return block.to_string();
    }

    let begin = begin_marker(id.as_str());
    let mut out = Vec::new();
    let mut inserted = false;
    for line in block.lines() {
        out.push(line.to_string());
        if !inserted && line.trim() == begin {
            out.push(device_line(uuid, base));
            inserted = true;
        }
    }
    if !inserted {
        out.insert(0, device_line(uuid, base));
    }
    out.join("\n") + "\n"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveSelector<'a> {
    Target(&'a str),
    Id(&'a BlockId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePlan {
    pub block: FstabBlock,
    pub new_table: String,
    /// Bind targets in reverse order, then the partition mount point.
    pub unmount: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemovePlanError {
    #[error("no managed block found for {0}")]
    NotFound(String),
    #[error("block {0} was not created by lindy; adopt it before removing")]
    NotManaged(String),
    #[error("invalid target path in block: {0}")]
    InvalidTarget(String),
}

pub fn plan_remove(
    table: &str,
    managed: &HashSet<String>,
    selector: RemoveSelector<'_>,
) -> Result<RemovePlan, RemovePlanError> {
    let blocks = blocks_with_ownership(table, managed);
    let block = match selector {
        RemoveSelector::Target(target) => find_block_for_target(&blocks, target.trim())
            .ok_or_else(|| RemovePlanError::NotFound(target.to_string()))?,
        RemoveSelector::Id(id) => find_block(&blocks, id.as_str())
            .ok_or_else(|| RemovePlanError::NotFound(id.to_string()))?,
    };
    if !block.managed {
        return Err(RemovePlanError::NotManaged(block.id.clone()));
    }
    if let Some(bad) = block.targets.iter().find(|t| !t.starts_with('/')) {
        return Err(RemovePlanError::InvalidTarget(bad.clone()));
    }

    let new_table = strip_block(table, &block.id)
        .ok_or_else(|| RemovePlanError::NotFound(block.id.clone()))?;
    let mut unmount: Vec<String> = block.targets.iter().rev().cloned().collect();
    unmount.extend(block.device_mountpoints());

    Ok(RemovePlan {
        block: block.clone(),
        new_table,
        unmount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
UUID=root / ext4 defaults 0 1
# lindy BEGIN: owned1
UUID=1234-ABCD /mnt/windows auto defaults 0 2
/mnt/windows/Users/Bob/Documents /home/bob/Documents none bind 0 0
/mnt/windows/Users/Bob/Music /home/bob/Music none bind 0 0
# lindy END: owned1
# lindy BEGIN: handmade
/data/Pictures /home/bob/Pictures none bind 0 0
# lindy END: handmade
/srv/videos /home/bob/Videos none bind 0 0
";

    fn managed() -> HashSet<String> {
        HashSet::from(["owned1".to_string()])
    }

    fn block_for(id: &BlockId, lines: &[&str]) -> String {
        let mut text = vec![format!("# lindy BEGIN: {id}")];
        text.extend(lines.iter().map(|l| l.to_string()));
        text.push(format!("# lindy END: {id}"));
        text.join("\n") + "\n"
    }

    #[test]
    fn overlapping_target_is_adoptable_whether_managed_or_not() {
        let id = BlockId::parse("fresh").unwrap();
        let block = block_for(&id, &["/x /home/bob/Pictures none bind 0 0"]);
        match plan_apply(TABLE, &managed(), &id, &block, &["/home/bob/Pictures".into()]) {
            ApplyPlan::Adoptable(existing) => {
                assert_eq!(existing.id, "handmade");
                assert!(!existing.managed);
            }
            other => panic!("unexpected plan {other:?}"),
        }
        match plan_apply(TABLE, &managed(), &id, &block, &["/home/bob/Music".into()]) {
            ApplyPlan::Adoptable(existing) => assert!(existing.managed),
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn reused_id_is_treated_as_existing_block() {
        let id = BlockId::parse("owned1").unwrap();
        let block = block_for(&id, &["/x /home/bob/New none bind 0 0"]);
        assert!(matches!(
            plan_apply(TABLE, &managed(), &id, &block, &["/home/bob/New".into()]),
            ApplyPlan::Adoptable(_)
        ));
    }

    #[test]
    fn unmarked_entry_is_a_conflict() {
        let id = BlockId::parse("fresh").unwrap();
        let block = block_for(&id, &["/x /home/bob/Videos none bind 0 0"]);
        match plan_apply(TABLE, &managed(), &id, &block, &["/home/bob/Videos".into()]) {
            ApplyPlan::Conflict { target, entry } => {
                assert_eq!(target, "/home/bob/Videos");
                assert!(entry.starts_with("/srv/videos"));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn new_targets_are_appended() {
        let id = BlockId::parse("fresh").unwrap();
        let block = block_for(&id, &["/x /home/bob/Desktop none bind 0 0"]);
        match plan_apply(TABLE, &managed(), &id, &block, &["/home/bob/Desktop".into()]) {
            ApplyPlan::Append { new_table, .. } => {
                assert!(new_table.starts_with(TABLE));
                assert!(new_table.ends_with(&block));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn block_without_matching_markers_is_rejected() {
        let id = BlockId::parse("fresh").unwrap();
        let other = BlockId::parse("other").unwrap();
        let block = block_for(&other, &["/x /home/bob/Desktop none bind 0 0"]);
        assert!(matches!(
            plan_apply(TABLE, &managed(), &id, &block, &["/home/bob/Desktop".into()]),
            ApplyPlan::Rejected(_)
        ));
    }

    #[test]
    fn device_line_is_inserted_once_after_begin() {
        let id = BlockId::parse("dev").unwrap();
        let block = block_for(&id, &["/a /b none bind 0 0"]);
        let with_device = ensure_device_line(&block, &id, Some("1234-abcd"), Some("/mnt/w"), true);
        let lines: Vec<&str> = with_device.lines().collect();
        assert_eq!(lines[1], device_line("1234-abcd", "/mnt/w"));
        assert_eq!(
            ensure_device_line(&with_device, &id, Some("1234-abcd"), Some("/mnt/w"), true),
            with_device
        );
        assert_eq!(ensure_device_line(&block, &id, Some("bogus"), Some("/mnt/w"), true), block);
        assert_eq!(ensure_device_line(&block, &id, Some("1234-abcd"), Some("/mnt/w"), false), block);
    }

    #[test]
    fn remove_by_target_unmounts_in_reverse_then_device() {
        let plan = plan_remove(TABLE, &managed(), RemoveSelector::Target("/home/bob/Music")).unwrap();
        assert_eq!(plan.block.id, "owned1");
        assert_eq!(
            plan.unmount,
            vec!["/home/bob/Music", "/home/bob/Documents", "/mnt/windows"]
        );
        assert!(!plan.new_table.contains("owned1"));
        assert!(plan.new_table.contains("handmade"));
    }

    #[test]
    fn foreign_blocks_are_read_only() {
        let err = plan_remove(TABLE, &managed(), RemoveSelector::Target("/home/bob/Pictures")).unwrap_err();
        assert_eq!(err, RemovePlanError::NotManaged("handmade".into()));
    }

    #[test]
    fn unknown_target_or_id_is_not_found() {
        let id = BlockId::parse("nope").unwrap();
        assert!(matches!(
            plan_remove(TABLE, &managed(), RemoveSelector::Id(&id)),
            Err(RemovePlanError::NotFound(_))
        ));
        assert!(matches!(
            plan_remove(TABLE, &managed(), RemoveSelector::Target("/nowhere")),
            Err(RemovePlanError::NotFound(_))
        ));
    }
}

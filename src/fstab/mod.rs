//! Mount-table text handling: the BEGIN/END marker scheme, block scanning
//! and block rendering.
//!
//! Everything in here works on plain strings so the same code runs in the
//! desktop app (read-only scans) and in the privileged helper (edits).

pub mod ident;
pub mod ledger;
pub mod plan;
pub mod preview;
pub mod write;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::mapping::Mapping;
pub use ident::{generate_block_id, validate_partition_id, BlockId, MappingId};

pub const APP_MARKER: &str = "lindy";
pub const DEFAULT_FSTAB_PATH: &str = "/etc/fstab";
pub const DEVICE_MOUNT_OPTIONS: &str =
    "defaults,noatime,nofail,x-systemd.automount,x-systemd.device-timeout=10";

pub fn begin_marker(id: &str) -> String {
    format!("# {APP_MARKER} BEGIN: {id}")
}

pub fn end_marker(id: &str) -> String {
    format!("# {APP_MARKER} END: {id}")
}

fn marker_id<'a>(line: &'a str, kind: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix(APP_MARKER)?.trim_start();
    let rest = rest.strip_prefix(kind)?.strip_prefix(':')?;
    let id = rest.trim();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

pub fn device_line(uuid: &str, base_mount: &str) -> String {
    format!("UUID={uuid} {base_mount} auto {DEVICE_MOUNT_OPTIONS} 0 2")
}

pub fn bind_line(src: &str, target: &str) -> String {
    format!("{src} {target} none bind 0 0")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub src: String,
    pub target: String,
}

/// Parses `<src> <target> <fstype> <options> ...` when the options carry
/// `bind` or `rbind`.
pub fn parse_bind(line: &str) -> Option<Bind> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let is_bind = parts[3]
        .split(',')
        .any(|option| option == "bind" || option == "rbind");
    if !is_bind {
        return None;
    }
    Some(Bind {
        src: parts[0].to_string(),
        target: parts[1].to_string(),
    })
}

/// Mount point of a non-bind entry, if the line is an fstab entry at all.
fn entry_mountpoint(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() < 2 {
        return None;
    }
    Some(parts[1])
}

/// A marked region of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabBlock {
    pub id: String,
    pub text: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub binds: Vec<Bind>,
    pub managed: bool,
}

impl FstabBlock {
    pub fn covers(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }

    /// Mount points of the non-bind entries (the partition line).
    pub fn device_mountpoints(&self) -> Vec<String> {
        self.text
            .lines()
            .filter(|line| parse_bind(line).is_none())
            .filter_map(entry_mountpoint)
            .filter(|mp| mp.starts_with('/'))
            .map(|mp| mp.to_string())
            .collect()
    }
}

struct Span {
    id: String,
    start: usize,
    end: usize,
}

fn block_spans(lines: &[&str]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let Some(id) = marker_id(lines[idx], "BEGIN") else {
            idx += 1;
            continue;
        };
        let end = lines[idx + 1..]
            .iter()
            .position(|line| marker_id(line, "END") == Some(id))
            .map(|offset| idx + 1 + offset);
        match end {
            Some(end) => {
                spans.push(Span {
                    id: id.to_string(),
                    start: idx,
                    end,
                });
                idx = end + 1;
            }
            // an unterminated BEGIN is foreign text
            None => idx += 1,
        }
    }
    spans
}

/// Finds every BEGIN/END pair with identical ids. Blocks come back with
/// `managed = false`; ownership is decided by the ledger.
pub fn scan_blocks(fstab: &str) -> Vec<FstabBlock> {
    let lines: Vec<&str> = fstab.lines().collect();
    block_spans(&lines)
        .into_iter()
        .map(|span| {
            let body = &lines[span.start..=span.end];
            let binds: Vec<Bind> = body[1..body.len() - 1]
                .iter()
                .filter_map(|line| parse_bind(line))
                .collect();
            FstabBlock {
                id: span.id,
                text: body.join("\n") + "\n",
                targets: binds.iter().map(|b| b.target.clone()).collect(),
                binds,
                managed: false,
            }
        })
        .collect()
}

pub fn find_block<'a>(blocks: &'a [FstabBlock], id: &str) -> Option<&'a FstabBlock> {
    blocks.iter().find(|block| block.id == id)
}

pub fn find_block_for_target<'a>(blocks: &'a [FstabBlock], target: &str) -> Option<&'a FstabBlock> {
    blocks.iter().find(|block| block.covers(target))
}

/// First unmarked entry that mounts onto `target`.
pub fn foreign_entry_for_target(fstab: &str, target: &str) -> Option<String> {
    let lines: Vec<&str> = fstab.lines().collect();
    let spans = block_spans(&lines);
    lines
        .iter()
        .enumerate()
        .filter(|(idx, _)| !spans.iter().any(|s| *idx >= s.start && *idx <= s.end))
        .find(|(_, line)| entry_mountpoint(line) == Some(target))
        .map(|(_, line)| line.to_string())
}

/// Removes the first block with `id`. `None` when the block does not exist.
pub fn strip_block(fstab: &str, id: &str) -> Option<String> {
    let lines: Vec<&str> = fstab.lines().collect();
    let span = block_spans(&lines).into_iter().find(|s| s.id == id)?;
    let kept: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx < span.start || *idx > span.end)
        .map(|(_, line)| *line)
        .collect();
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Some(out)
}

/// Appends a block, keeping exactly one newline between the existing table
/// and the block.
pub fn append_block(fstab: &str, block: &str) -> String {
    let mut out = fstab.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(block);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Mount points listed in `/proc/mounts` text, with `\040`-style octal
/// escapes decoded.
pub fn mount_points(proc_mounts: &str) -> HashSet<String> {
    proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(decode_mount_path)
        .collect()
}

/// Decodes the `\040`-style octal escapes that both `/proc/mounts` and
/// fstab use for blanks in paths.
pub fn decode_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let escape = bytes.get(idx + 1..idx + 4).filter(|digits| {
            bytes[idx] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        });
        match escape {
            Some(digits) => {
                let code = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(u8::try_from(code).unwrap_or(b'?'));
                idx += 4;
            }
            None => {
                out.push(bytes[idx]);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Which partition to mount at `base_mount` ahead of the binds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionChoice {
    pub uuid: Option<String>,
    #[serde(default)]
    pub skip: bool,
}

impl PartitionChoice {
    /// The trimmed id, when the device line should be emitted.
    pub fn device_uuid(&self) -> Option<&str> {
        if self.skip {
            return None;
        }
        self.uuid
            .as_deref()
            .map(str::trim)
            .filter(|uuid| validate_partition_id(uuid))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBlock {
    pub id: BlockId,
    pub text: String,
    pub targets: Vec<String>,
    pub includes_device_line: bool,
}

/// Builds the block for one apply: at most one device line, one bind line
/// per complete mapping, incomplete mappings ignored.
pub fn render_block(
    id: &BlockId,
    mappings: &[Mapping],
    partition: &PartitionChoice,
    base_mount: &str,
) -> RenderedBlock {
    let mut lines = vec![begin_marker(id.as_str())];
    let device_uuid = partition
        .device_uuid()
        .filter(|_| !base_mount.trim().is_empty());
    if let Some(uuid) = device_uuid {
        lines.push(device_line(uuid, base_mount.trim()));
    }
    let mut targets = Vec::new();
    for (src, target) in mappings.iter().filter_map(Mapping::complete_pair) {
        lines.push(bind_line(src, target));
        targets.push(target.to_string());
    }
    lines.push(end_marker(id.as_str()));

    RenderedBlock {
        id: id.clone(),
        text: lines.join("\n") + "\n",
        targets,
        includes_device_line: device_uuid.is_some(),
    }
}

//! Block devices as reported by `lsblk`, flattened.

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Mutex;

use crate::cancel::Supersession;
use crate::error::{Error, Result};

pub const LSBLK_COLUMNS: &str = "NAME,FSTYPE,UUID,LABEL,MOUNTPOINT,SIZE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub mountpoint: Option<String>,
    pub size: Option<String>,
}

impl Partition {
    /// NTFS or exFAT, the filesystems a Windows install lives on.
    pub fn is_windows_filesystem(&self) -> bool {
        matches!(
            self.fstype.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("ntfs") | Some("ntfs3") | Some("exfat")
        )
    }
}

/// Trims, drops surrounding `{}`/`()` and lower-cases. Blank ids become
/// `None`.
pub fn normalize_uuid(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches(['{', '('])
        .trim_end_matches([')', '}'])
        .trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkNode>,
}

#[derive(Deserialize)]
struct LsblkNode {
    name: Option<String>,
    fstype: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    size: Option<serde_json::Value>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

fn collect(out: &mut Vec<Partition>, node: LsblkNode) {
    if let Some(name) = node.name {
        let size = node.size.and_then(|value| match value {
            serde_json::Value::String(text) => Some(text),
            serde_json::Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        out.push(Partition {
            name,
            fstype: node.fstype,
            uuid: node.uuid.as_deref().and_then(normalize_uuid),
            label: node.label,
            mountpoint: node.mountpoint,
            size,
        });
    }
    for child in node.children {
        collect(out, child);
    }
}

/// Parses `lsblk -J` output, parents before their children.
pub fn parse_lsblk(json: &[u8]) -> Result<Vec<Partition>> {
    let output: LsblkOutput = serde_json::from_slice(json)?;
    let mut flat = Vec::new();
    for device in output.blockdevices {
        collect(&mut flat, device);
    }
    Ok(flat)
}

pub fn list_partitions() -> Result<Vec<Partition>> {
    let output = Command::new("lsblk")
        .args(["-J", "-o", LSBLK_COLUMNS])
        .output()?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            program: "lsblk".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    parse_lsblk(&output.stdout)
}

/// First partition that looks like a Windows install.
pub fn first_windows_partition(partitions: &[Partition]) -> Option<&Partition> {
    partitions.iter().find(|p| p.is_windows_filesystem())
}

/// Last committed listing. Replaced wholesale; a slower, older listing never
/// overwrites a newer one.
#[derive(Debug, Default)]
pub struct PartitionDirectory {
    partitions: Mutex<Vec<Partition>>,
    refreshes: Supersession,
}

impl PartitionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Partition> {
        self.partitions
            .lock()
            .map(|parts| parts.clone())
            .unwrap_or_default()
    }

    /// Runs `load` and commits its result if no newer refresh started in
    /// the meantime. The loaded listing is returned either way.
    pub fn refresh_with(&self, load: impl FnOnce() -> Result<Vec<Partition>>) -> Result<Vec<Partition>> {
        let token = self.refreshes.begin();
        let parts = load()?;
        if !token.commit(&self.partitions, parts.clone()) {
            log::debug!("partition listing #{} superseded", token.generation());
        }
        Ok(parts)
    }

    pub fn refresh(&self) -> Result<Vec<Partition>> {
        self.refresh_with(list_partitions)
    }

    pub fn tear_down(&self) {
        self.refreshes.tear_down();
    }
}

//! Human-readable preview of what an apply would write. Pure and re-entrant;
//! partial or invalid input yields an empty preview instead of an error.

use super::{bind_line, device_line, validate_partition_id, PartitionChoice};
use crate::mapping::Mapping;

/// Lines for a single mapping, device line first when one applies.
pub fn generate_line(
    partition_uuid: &str,
    base_mount: &str,
    src: &str,
    target: &str,
    skip_partition_mount: bool,
) -> String {
    let bind = bind_line(src, target);
    if skip_partition_mount || partition_uuid.trim().is_empty() {
        return bind;
    }
    format!("{}\n{}", device_line(partition_uuid.trim(), base_mount), bind)
}

/// The deduplicated preview: one device line at most, then every bind line.
pub fn preview_lines(mappings: &[Mapping], partition: &PartitionChoice, base_mount: &str) -> Vec<String> {
    let base = base_mount.trim();
    if base.is_empty() || !mappings.iter().any(Mapping::is_complete) {
        return Vec::new();
    }
    let uuid = partition.uuid.as_deref().map(str::trim).unwrap_or("");
    if !partition.skip && !uuid.is_empty() && !validate_partition_id(uuid) {
        return Vec::new();
    }

    let mut device = Vec::new();
    let mut binds = Vec::new();
    for (src, target) in mappings.iter().filter_map(Mapping::complete_pair) {
        for line in generate_line(uuid, base, src, target, partition.skip).lines() {
            if line.starts_with("UUID=") {
                if !device.iter().any(|existing: &String| existing == line) {
                    device.push(line.to_string());
                }
            } else {
                binds.push(line.to_string());
            }
        }
    }
    device.extend(binds);
    device
}

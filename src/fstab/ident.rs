use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{Error, Result};

const BLOCK_ID_LEN: usize = 10;

static PARTITION_ID_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn partition_id_patterns() -> &'static [Regex] {
    PARTITION_ID_PATTERNS.get_or_init(|| {
        [
            // RFC 4122: version nibble 1-5, variant nibble 8/9/a/b
            r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
            // FAT volume serial
            r"(?i)^[0-9a-f]{4}-[0-9a-f]{4}$",
            // NTFS serial
            r"(?i)^[0-9a-f]{16}$",
            r"(?i)^[0-9a-f]{32}$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Accepts the partition id shapes reported by blkid/lsblk.
///
/// Advisory only: it gates preview generation, the helper stays the final
/// authority on whether a device line can be mounted.
pub fn validate_partition_id(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    partition_id_patterns()
        .iter()
        .any(|pattern| pattern.is_match(trimmed))
}

/// Token carried by the BEGIN/END markers of a managed block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(String);

impl BlockId {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let ok = !trimmed.is_empty()
            && trimmed.len() <= 64
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if ok {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(Error::InvalidBlockId(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlockId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

/// Short, typable id. Collisions are tolerated: the marker scan treats a
/// reused id as an existing block.
pub fn generate_block_id() -> BlockId {
    let simple = Uuid::new_v4().simple().to_string();
    BlockId(simple[..BLOCK_ID_LEN].to_string())
}

/// UI-only identity of a mapping row. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingId {
    millis: u64,
    tiebreak: u32,
}

impl MappingId {
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            millis,
            tiebreak: Uuid::new_v4().as_u128() as u32,
        }
    }
}

impl Default for MappingId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_UUID: &str = "53337bda-2dc1-4a14-a8d9-c1702ddd33d6";

    #[test]
    fn accepts_the_four_shapes() {
        assert!(validate_partition_id(VALID_UUID));
        assert!(validate_partition_id(&VALID_UUID.to_uppercase()));
        assert!(validate_partition_id("1234-ABCD"));
        assert!(validate_partition_id("01D5A3F2B7C8E9F0"));
        assert!(validate_partition_id("53337bda2dc14a14a8d9c1702ddd33d6"));
        assert!(validate_partition_id("  1234-abcd  "));
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(!validate_partition_id(""));
        assert!(!validate_partition_id("   "));
        assert!(!validate_partition_id("1234-ABC"));
        assert!(!validate_partition_id("01D5A3F2B7C8E9F"));
        assert!(!validate_partition_id("53337bda-2dc1-4a14-a8d9-c1702ddd33d"));
        assert!(!validate_partition_id("zzzzzzzz-2dc1-4a14-a8d9-c1702ddd33d6"));
    }

    #[test]
    fn rejects_bad_version_or_variant_nibble() {
        // version nibble sits at index 14, variant nibble at index 19
        for bad in ['0', '6', '9', 'f'] {
            let mut chars: Vec<char> = VALID_UUID.chars().collect();
            chars[14] = bad;
            let candidate: String = chars.into_iter().collect();
            assert!(!validate_partition_id(&candidate), "{candidate}");
        }
        for bad in ['0', '7', 'c', 'f'] {
            let mut chars: Vec<char> = VALID_UUID.chars().collect();
            chars[19] = bad;
            let candidate: String = chars.into_iter().collect();
            assert!(!validate_partition_id(&candidate), "{candidate}");
        }
    }

    #[test]
    fn generated_block_ids_are_short_and_parseable() {
        let id = generate_block_id();
        assert_eq!(id.as_str().len(), BLOCK_ID_LEN);
        assert_eq!(BlockId::parse(id.as_str()).unwrap(), id);
        assert_ne!(generate_block_id(), generate_block_id());
    }

    #[test]
    fn block_id_rejects_shell_metacharacters() {
        assert!(BlockId::parse("abc$(rm)").is_err());
        assert!(BlockId::parse("a b").is_err());
        assert!(BlockId::parse("").is_err());
        assert!(BlockId::parse("ok_id-1").is_ok());
    }
}

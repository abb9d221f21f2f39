use serde::{Deserialize, Serialize};

use crate::fstab::MappingId;

/// One source/target row. Incomplete rows are inert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub id: MappingId,
    pub src: Option<String>,
    pub target: Option<String>,
}

impl Mapping {
    pub fn with_paths(src: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: MappingId::new(),
            src: Some(src.into()),
            target: Some(target.into()),
        }
    }

    /// Both ends, trimmed, when the mapping is complete.
    pub fn complete_pair(&self) -> Option<(&str, &str)> {
        let src = self.src.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let target = self
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())?;
        Some((src, target))
    }

    pub fn is_complete(&self) -> bool {
        self.complete_pair().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_requires_both_ends() {
        assert!(Mapping::with_paths("/a", "/b").is_complete());
        assert!(!Mapping::default().is_complete());
        let half = Mapping {
            src: Some("/a".into()),
            target: Some("  ".into()),
            ..Mapping::default()
        };
        assert!(!half.is_complete());
    }
}

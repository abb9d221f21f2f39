//! Turns raw helper output into something a user can act on.
//!
//! Signatures overlap (an NTFS consistency failure usually also mentions
//! an I/O error and sometimes "busy"), so the table is ordered and the
//! first match wins.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub title: String,
    pub message: String,
    pub solution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ImproperShutdown,
    NeedsElevation,
    ResourceBusy,
    TargetVanished,
    UnsupportedDiskLayout,
    GenericMountFailure,
}

struct Rule {
    category: ErrorCategory,
    signatures: &'static [&'static str],
    title: &'static str,
    message: &'static str,
    solution: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::ImproperShutdown,
        signatures: &["$mftmirr does not match $mft", "inconsistent", "input/output error"],
        title: "Windows wasn't shut down properly",
        message: "The Windows partition has errors because Windows was not shut down cleanly last time.",
        solution: "This happens when:\n\
                   - Windows was forced to shut down\n\
                   - Power went out while Windows was running\n\
                   - Fast Startup or an update left the disk hibernated\n\n\
                   Boot into Windows, let it start normally, then shut down fully and try again.",
    },
    Rule {
        category: ErrorCategory::NeedsElevation,
        signatures: &["permission denied", "operation not permitted"],
        title: "Administrator access needed",
        message: "Administrator access is required to change mounts.",
        solution: "Click \"Allow\" when the permission dialog appears.\n\n\
                   If no dialog shows up, restart the app and try again.",
    },
    Rule {
        category: ErrorCategory::ResourceBusy,
        signatures: &["device is busy", "target is busy"],
        title: "Partition is busy",
        message: "Something else is using the partition or one of the target folders.",
        solution: "- Close file managers and terminals open in those folders\n\
                   - Run `sudo fuser -mv <target>` to see what holds it\n\
                   - Retry with force (lazy unmount)",
    },
    Rule {
        category: ErrorCategory::TargetVanished,
        signatures: &["no such file or directory", "no such device"],
        title: "Can't find the partition",
        message: "The partition or a target folder disappeared or can't be accessed right now.",
        solution: "- Refresh the partition list\n\
                   - Check that the drive is connected\n\
                   - Make sure the source folders still exist",
    },
    Rule {
        category: ErrorCategory::UnsupportedDiskLayout,
        signatures: &["softraid", "fakeraid", "dmraid"],
        title: "Special disk setup detected",
        message: "Windows is on a RAID configuration that can't be mounted automatically.",
        solution: "Mount the Windows partition manually first, then use guided mapping \
                   with that mount point as the base path.",
    },
];

const FALLBACK: Rule = Rule {
    category: ErrorCategory::GenericMountFailure,
    signatures: &[],
    title: "Couldn't mount",
    message: "Something went wrong while mounting.",
    solution: "- Try guided mapping instead\n\
               - Restart your computer\n\
               - Copy the technical details when asking for help",
};

/// The category that `classify` would pick.
pub fn categorize(stderr: &str, stdout: &str) -> ErrorCategory {
    matching_rule(&haystack(stderr, stdout)).category
}

/// Total: always returns populated details and keeps `stderr` verbatim.
pub fn classify(stderr: &str, stdout: &str) -> ErrorDetails {
    let rule = matching_rule(&haystack(stderr, stdout));
    ErrorDetails {
        title: rule.title.to_string(),
        message: rule.message.to_string(),
        solution: rule.solution.to_string(),
        technical: Some(stderr.to_string()),
    }
}

fn haystack(stderr: &str, stdout: &str) -> String {
    format!("{stderr} {stdout}").to_lowercase()
}

fn matching_rule(haystack: &str) -> &'static Rule {
    RULES
        .iter()
        .find(|rule| rule.signatures.iter().any(|sig| haystack.contains(sig)))
        .unwrap_or(&FALLBACK)
}

//! The privileged-call protocols: apply, adopt and remove.
//!
//! Each protocol turns a helper response into an explicit outcome. The
//! shared vocabulary (result codes, the wire result, failures with a next
//! action) lives here.

pub mod adopt;
pub mod apply;
pub mod remove;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::classify::{classify, ErrorDetails};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Adoptable,
    Error,
}

/// Operation-level codes. Unknown codes survive as `Other` so the raw value
/// can still be shown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultCode {
    Applied,
    Adopted,
    Removed,
    AdoptableExistingBlock,
    SpawnPkexecFailed,
    PkexecFailed,
    NoWindowsPartitions,
    NoUsersDetected,
    NoMappingsFound,
    MountFailed,
    Busy,
    MountFailedAfterLazy,
    TargetConflict,
    NotFound,
    NotManaged,
    InFlight,
    InvalidRequest,
    Other(String),
}

impl ResultCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Applied => "applied",
            Self::Adopted => "adopted",
            Self::Removed => "removed",
            Self::AdoptableExistingBlock => "adoptable_existing_block",
            Self::SpawnPkexecFailed => "spawn_pkexec_failed",
            Self::PkexecFailed => "pkexec_failed",
            Self::NoWindowsPartitions => "no_windows_partitions",
            Self::NoUsersDetected => "no_users_detected",
            Self::NoMappingsFound => "no_mappings_found",
            Self::MountFailed => "mount_failed",
            Self::Busy => "busy",
            Self::MountFailedAfterLazy => "mount_failed_after_lazy",
            Self::TargetConflict => "target_conflict",
            Self::NotFound => "not_found",
            Self::NotManaged => "not_managed",
            Self::InFlight => "in_flight",
            Self::InvalidRequest => "invalid_request",
            Self::Other(code) => code,
        }
    }
}

impl From<String> for ResultCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "applied" => Self::Applied,
            "adopted" => Self::Adopted,
            "removed" => Self::Removed,
            "adoptable_existing_block" => Self::AdoptableExistingBlock,
            "spawn_pkexec_failed" => Self::SpawnPkexecFailed,
            "pkexec_failed" => Self::PkexecFailed,
            "no_windows_partitions" => Self::NoWindowsPartitions,
            "no_users_detected" => Self::NoUsersDetected,
            "no_mappings_found" => Self::NoMappingsFound,
            "mount_failed" => Self::MountFailed,
            "busy" => Self::Busy,
            "mount_failed_after_lazy" => Self::MountFailedAfterLazy,
            "target_conflict" => Self::TargetConflict,
            "not_found" => Self::NotFound,
            "not_managed" => Self::NotManaged,
            "in_flight" => Self::InFlight,
            "invalid_request" => Self::InvalidRequest,
            _ => Self::Other(value),
        }
    }
}

impl From<ResultCode> for String {
    fn from(code: ResultCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured result of one privileged call. `stderr`/`stdout` are kept
/// verbatim for diagnostics even on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: String,
}

impl OperationResult {
    pub fn ok(code: ResultCode, message: impl Into<String>) -> Self {
        Self::new(Status::Ok, code, message)
    }

    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        Self::new(Status::Error, code, message)
    }

    fn new(status: Status, code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code),
            message: Some(message.into()),
            id: None,
            block: None,
            targets: None,
            stderr: String::new(),
            stdout: String::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_block(mut self, block: impl Into<String>, targets: Vec<String>) -> Self {
        self.block = Some(block.into());
        self.targets = Some(targets);
        self
    }

    pub fn with_output(mut self, stderr: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self.stdout = stdout.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn has_code(&self, code: &ResultCode) -> bool {
        self.code.as_ref() == Some(code)
    }

    pub fn message_or(&self, fallback: &str) -> String {
        self.message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Raw payload for display when nothing better is known.
    pub fn raw(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// What the user can do about a failure. Every failure carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextAction {
    RetryWithForce,
    RunManualCommand { command: String },
    SwitchToGuided,
    Retry,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub code: Option<ResultCode>,
    pub details: ErrorDetails,
    pub next_action: NextAction,
    pub result: OperationResult,
}

impl Failure {
    /// Text-signature classification of the raw streams.
    pub fn classified(result: OperationResult, next_action: NextAction) -> Self {
        let details = classify(&result.stderr, &result.stdout);
        Self {
            code: result.code.clone(),
            details,
            next_action,
            result,
        }
    }

    /// For codes nothing can be classified from; the raw payload is kept as
    /// the technical text.
    pub fn unrecognized(result: OperationResult, next_action: NextAction) -> Self {
        let details = ErrorDetails {
            title: "Unexpected response".to_string(),
            message: result.message_or("The helper returned a response that wasn't recognized."),
            solution: "Copy the technical details when asking for help.".to_string(),
            technical: Some(result.raw()),
        };
        Self {
            code: result.code.clone(),
            details,
            next_action,
            result,
        }
    }

    pub fn with_details(result: OperationResult, details: ErrorDetails, next_action: NextAction) -> Self {
        Self {
            code: result.code.clone(),
            details,
            next_action,
            result,
        }
    }
}

/// Details for a failure of the elevation mechanism itself.
pub fn mechanism_unavailable(result: &OperationResult, solution: &str) -> ErrorDetails {
    ErrorDetails {
        title: "Permission helper not available".to_string(),
        message: "The system permission helper isn't working right now.".to_string(),
        solution: solution.to_string(),
        technical: Some(result.message_or("pkexec could not be started")),
    }
}

/// Escapes text for use inside a double-quoted `sh` word.
pub fn escape_double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// A path as one word of a manual `sudo sh -c "..."` command: bare when it
/// only has plain characters, single-quoted otherwise.
pub fn manual_command_path(path: &str) -> String {
    let plain = !path.is_empty()
        && path
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | '+'));
    if plain {
        path.to_string()
    } else {
        escape_double_quoted(&format!("'{}'", path.replace('\'', r"'\''")))
    }
}

/// Targets with a privileged call outstanding. A submission that overlaps
/// one of them is refused before any elevation prompt.
#[derive(Debug, Clone, Default)]
pub struct InFlightTargets {
    inner: Arc<Mutex<HashSet<String>>>,
}

/// Releases its targets on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: InFlightTargets,
    targets: Vec<String>,
}

impl InFlightTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims every target or none. On overlap the refusal result names the
    /// busy target.
    pub fn claim(&self, targets: &[String]) -> Result<InFlightGuard, OperationResult> {
        let mut set = self
            .inner
            .lock()
            .map_err(|_| OperationResult::error(ResultCode::InFlight, "in-flight registry unavailable"))?;
        if let Some(busy) = targets.iter().find(|t| set.contains(t.as_str())) {
            return Err(OperationResult::error(
                ResultCode::InFlight,
                format!("an operation for {busy} is already running"),
            ));
        }
        for target in targets {
            set.insert(target.clone());
        }
        Ok(InFlightGuard {
            owner: self.clone(),
            targets: targets.to_vec(),
        })
    }

    pub fn is_in_flight(&self, target: &str) -> bool {
        self.inner
            .lock()
            .map(|set| set.contains(target))
            .unwrap_or(false)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.owner.inner.lock() {
            for target in &self.targets {
                set.remove(target);
            }
        }
    }
}

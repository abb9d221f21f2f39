//! Auto-map: turning a Windows user profile into a batch of mappings.
//!
//! Guided mode suggests folder pairs for a base path the user picked and
//! applies the confirmed batch as one block. Automatic mode hands partition
//! discovery, mounting and matching to the helper in a single call.

pub mod folders;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

use crate::classify::{classify, ErrorDetails};
use crate::fstab::PartitionChoice;
use crate::helper::{self, HelperRequest, PrivilegedHelper};
use crate::mapping::Mapping;
use crate::protocol::apply::{self, refused_failure, ApplyOutcome, ApplyRequest};
use crate::protocol::{Failure, InFlightTargets, NextAction, OperationResult, ResultCode};
pub use folders::{FolderMapping, UserFolder};

pub const ACTION: &str = "auto_mount_and_map";
pub const DEFAULT_WINDOWS_BASE: &str = "/mnt/windows";

pub fn guided_candidates(windows_base: &Path, username: Option<&str>, home: &Path) -> Vec<FolderMapping> {
    folders::suggest_folder_mappings(windows_base, username, home)
}

/// Confirmed suggestions become mapping rows: Windows side is the source.
pub fn to_mappings(candidates: &[FolderMapping]) -> Vec<Mapping> {
    candidates
        .iter()
        .map(|candidate| Mapping::with_paths(candidate.windows_path.as_str(), candidate.linux_path.as_str()))
        .collect()
}

/// One multi-target request for every confirmed candidate. An empty
/// selection comes back as the failure to show.
pub fn guided_request(
    candidates: &[FolderMapping],
    partition: &PartitionChoice,
    base_mount: &str,
) -> Result<ApplyRequest, ApplyOutcome> {
    ApplyRequest::build(&to_mappings(candidates), partition, base_mount).map_err(|refused| {
        let details = ErrorDetails {
            title: "Nothing to apply".to_string(),
            message: "None of the suggested folders were selected.".to_string(),
            solution: "Pick at least one folder, or add a mapping by hand.".to_string(),
            technical: None,
        };
        ApplyOutcome::Failed(Failure::with_details(refused, details, NextAction::None))
    })
}

/// Applies every confirmed candidate as a single multi-target block.
pub fn apply_guided(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    candidates: &[FolderMapping],
    partition: &PartitionChoice,
    base_mount: &str,
    fstab_path: &str,
) -> ApplyOutcome {
    match guided_request(candidates, partition, base_mount) {
        Ok(request) => apply::apply(helper, in_flight, &request, fstab_path),
        Err(refused) => refused,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsPartition {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Wire shape of the helper's automatic reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AutoMapResponse {
    Ok {
        mount_point: String,
        windows_partition: WindowsPartition,
        username: String,
        mappings: Vec<FolderMapping>,
    },
    Error {
        code: ResultCode,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount_point: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoMapOutcome {
    /// Base mount and partition to adopt into the current state, plus the
    /// rows to queue.
    Ready {
        base_mount: String,
        partition: WindowsPartition,
        username: String,
        mappings: Vec<Mapping>,
    },
    Failed(Failure),
}

pub fn auto_map_request(preferred_base: Option<&str>, username: Option<&str>, home: &Path) -> HelperRequest {
    HelperRequest::new(
        ACTION,
        json!({
            "preferredMountBase": preferred_base,
            "username": username,
            "home": home.to_string_lossy(),
        }),
    )
}

/// The one-shot detect, mount and match call.
pub fn auto_map(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    preferred_base: Option<&str>,
    username: Option<&str>,
    home: &Path,
) -> AutoMapOutcome {
    let base = preferred_base
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_WINDOWS_BASE);
    let _guard = match in_flight.claim(&[base.to_string()]) {
        Ok(guard) => guard,
        Err(refused) => return AutoMapOutcome::Failed(refused_failure(refused)),
    };

    let request = auto_map_request(preferred_base, username, home);
    let response = match helper::call_value(helper, &request) {
        Ok(reply) => match serde_json::from_value::<AutoMapResponse>(reply.response.clone()) {
            Ok(response) => response,
            Err(err) => {
                log::warn!("unrecognized auto-map reply: {err}");
                AutoMapResponse::Error {
                    code: ResultCode::Other("unrecognized_response".to_string()),
                    message: reply.response.to_string(),
                    stderr: Some(reply.stderr),
                    stdout: Some(reply.stdout),
                    username: None,
                    mount_point: None,
                }
            }
        },
        Err(result) => transport_response(result),
    };
    interpret(response)
}

fn transport_response(result: OperationResult) -> AutoMapResponse {
    AutoMapResponse::Error {
        code: result.code.clone().unwrap_or(ResultCode::Other("unknown".to_string())),
        message: result.message_or("helper call failed"),
        stderr: Some(result.stderr),
        stdout: Some(result.stdout),
        username: None,
        mount_point: None,
    }
}

pub fn interpret(response: AutoMapResponse) -> AutoMapOutcome {
    match response {
        AutoMapResponse::Ok {
            mount_point,
            windows_partition,
            username,
            mappings,
        } => {
            log::info!(
                "auto-map mounted {} at {mount_point}, found {} mapping(s) for {username}",
                windows_partition.label.as_deref().unwrap_or("Windows partition"),
                mappings.len()
            );
            AutoMapOutcome::Ready {
                base_mount: mount_point,
                partition: windows_partition,
                username,
                mappings: to_mappings(&mappings),
            }
        }
        error @ AutoMapResponse::Error { .. } => {
            let (details, next_action) = remediation(&error);
            let result = error_result(error);
            log::warn!(
                "auto-map failed: {} - {}",
                result.code.as_ref().map(ResultCode::as_str).unwrap_or("unknown"),
                result.message_or("")
            );
            AutoMapOutcome::Failed(Failure::with_details(result, details, next_action))
        }
    }
}

fn error_result(response: AutoMapResponse) -> OperationResult {
    match response {
        AutoMapResponse::Error {
            code,
            message,
            stderr,
            stdout,
            ..
        } => OperationResult::error(code, message).with_output(stderr.unwrap_or_default(), stdout.unwrap_or_default()),
        AutoMapResponse::Ok { .. } => OperationResult::ok(ResultCode::Applied, ""),
    }
}

/// One fixed message per error code; mount failures go through the
/// classifier and anything else shows the raw payload.
pub fn remediation(response: &AutoMapResponse) -> (ErrorDetails, NextAction) {
    let AutoMapResponse::Error {
        code,
        message,
        stderr,
        stdout,
        username,
        mount_point,
    } = response
    else {
        let details = ErrorDetails {
            title: "Nothing went wrong".to_string(),
            message: "Auto-map finished.".to_string(),
            solution: "No action needed.".to_string(),
            technical: None,
        };
        return (details, NextAction::None);
    };

    let details = |title: &str, message: String, solution: &str, technical: String| ErrorDetails {
        title: title.to_string(),
        message,
        solution: solution.to_string(),
        technical: Some(technical),
    };
    let mount_point = mount_point.as_deref().unwrap_or(DEFAULT_WINDOWS_BASE);
    let username = username.as_deref().unwrap_or("unknown");

    match code {
        ResultCode::SpawnPkexecFailed => (
            details(
                "Permission helper not available",
                "The system permission helper isn't working right now.".to_string(),
                "- Restart the app\n- Try guided mapping instead\n- Restart your computer if the problem continues",
                message.clone(),
            ),
            NextAction::SwitchToGuided,
        ),
        ResultCode::MountFailed => (
            classify(stderr.as_deref().unwrap_or_default(), stdout.as_deref().unwrap_or_default()),
            NextAction::Retry,
        ),
        ResultCode::NoWindowsPartitions => (
            details(
                "No Windows found",
                "Auto-map couldn't find Windows on this computer.".to_string(),
                "This might be because:\n\
                 - Windows isn't installed (dual-boot needed)\n\
                 - Windows is on an external drive that's unplugged\n\
                 - Windows is already mounted somewhere else\n\n\
                 Use guided mapping if you know where Windows is mounted.",
                "No NTFS or exFAT partitions detected via lsblk".to_string(),
            ),
            NextAction::SwitchToGuided,
        ),
        ResultCode::NoUsersDetected => (
            details(
                "No Windows users found",
                "Found Windows, but couldn't find any user folders.".to_string(),
                "This might be because:\n\
                 - This isn't the main Windows partition\n\
                 - The user folders are in a different location\n\
                 - The Windows installation is incomplete\n\n\
                 Use guided mapping and enter your Windows username.",
                format!("Mounted at: {mount_point}, but no Users folder found"),
            ),
            NextAction::SwitchToGuided,
        ),
        ResultCode::NoMappingsFound => (
            details(
                "No folders to map",
                format!("Found Windows user '{username}', but no folders to map."),
                "This might be because:\n\
                 - The Windows user has no Desktop, Documents or similar folders yet\n\
                 - The folders have different names\n\n\
                 Log into Windows once so the standard folders exist, then try again.",
                format!("User: {username}, Mount: {mount_point}"),
            ),
            NextAction::SwitchToGuided,
        ),
        _ => (
            details(
                "Something went wrong",
                "Auto-map ran into an unexpected problem.".to_string(),
                "- Try guided mapping instead\n- Restart the app\n- Restart your computer",
                serde_json::to_string_pretty(response).unwrap_or_else(|_| format!("{response:?}")),
            ),
            NextAction::SwitchToGuided,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(code: &str, stderr: Option<&str>) -> AutoMapResponse {
        serde_json::from_value(json!({
            "status": "error",
            "code": code,
            "message": "boom",
            "stderr": stderr,
            "username": "Bob",
            "mount_point": "/mnt/windows",
        }))
        .unwrap()
    }

    #[test]
    fn ok_reply_becomes_queued_rows() {
        let response: AutoMapResponse = serde_json::from_value(json!({
            "status": "ok",
            "mount_point": "/mnt/windows",
            "windows_partition": { "uuid": "01d5a3f2b7c8e9f0", "label": "Windows" },
            "username": "Bob",
            "mappings": [
                { "linux_path": "/home/bob/Music", "windows_path": "/mnt/windows/Users/Bob/Music", "folder_type": "music" }
            ]
        }))
        .unwrap();
        match interpret(response) {
            AutoMapOutcome::Ready { base_mount, partition, mappings, .. } => {
                assert_eq!(base_mount, "/mnt/windows");
                assert_eq!(partition.uuid, "01d5a3f2b7c8e9f0");
                assert_eq!(mappings[0].src.as_deref(), Some("/mnt/windows/Users/Bob/Music"));
                assert_eq!(mappings[0].target.as_deref(), Some("/home/bob/Music"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn mount_failure_goes_through_the_classifier() {
        let (details, action) = remediation(&error("mount_failed", Some("$MFTMirr does not match $MFT")));
        assert_eq!(details.title, "Windows wasn't shut down properly");
        assert_eq!(details.technical.as_deref(), Some("$MFTMirr does not match $MFT"));
        assert_eq!(action, NextAction::Retry);
    }

    #[test]
    fn each_code_gets_a_fixed_message() {
        let titles: Vec<String> = [
            "spawn_pkexec_failed",
            "no_windows_partitions",
            "no_users_detected",
            "no_mappings_found",
            "something_new",
        ]
        .iter()
        .map(|code| remediation(&error(code, None)).0.title)
        .collect();
        assert_eq!(
            titles,
            vec![
                "Permission helper not available",
                "No Windows found",
                "No Windows users found",
                "No folders to map",
                "Something went wrong",
            ]
        );
        let (details, _) = remediation(&error("no_mappings_found", None));
        assert!(details.message.contains("'Bob'"));
        let (details, _) = remediation(&error("something_new", None));
        assert!(details.technical.unwrap().contains("something_new"));
    }
}

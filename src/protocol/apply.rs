use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    escape_double_quoted, manual_command_path, mechanism_unavailable, Failure, InFlightTargets, NextAction,
    OperationResult, ResultCode, Status,
};
use crate::classify::ErrorDetails;
use crate::fstab::{generate_block_id, render_block, BlockId, PartitionChoice};
use crate::helper::{self, HelperRequest, PrivilegedHelper};
use crate::mapping::Mapping;

pub const ACTION: &str = "apply_block";

/// Everything the helper needs for one atomic apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub block: String,
    pub id: BlockId,
    pub targets: Vec<String>,
    pub partition_uuid: Option<String>,
    pub base_mount: Option<String>,
    pub add_partition_line: bool,
    #[serde(default)]
    pub force: bool,
}

impl ApplyRequest {
    /// Renders a fresh block for the complete mappings. Refused locally when
    /// there is nothing to apply.
    pub fn build(
        mappings: &[Mapping],
        partition: &PartitionChoice,
        base_mount: &str,
    ) -> Result<Self, OperationResult> {
        Self::build_with_id(generate_block_id(), mappings, partition, base_mount)
    }

    pub fn build_with_id(
        id: BlockId,
        mappings: &[Mapping],
        partition: &PartitionChoice,
        base_mount: &str,
    ) -> Result<Self, OperationResult> {
        let rendered = render_block(&id, mappings, partition, base_mount);
        if rendered.targets.is_empty() {
            return Err(OperationResult::error(
                ResultCode::InvalidRequest,
                "no complete mappings to apply",
            ));
        }
        let base = base_mount.trim();
        Ok(Self {
            block: rendered.text,
            id,
            targets: rendered.targets,
            partition_uuid: partition.device_uuid().map(str::to_string),
            base_mount: (!base.is_empty()).then(|| base.to_string()),
            add_partition_line: rendered.includes_device_line,
            force: false,
        })
    }

    /// The same block, activated with lazy unmounts of busy targets.
    pub fn forced(&self) -> Self {
        Self {
            force: true,
            ..self.clone()
        }
    }

    pub fn to_helper_request(&self) -> HelperRequest {
        HelperRequest::new(
            ACTION,
            json!({
                "block": self.block,
                "id": self.id,
                "targets": self.targets,
                "partitionUuid": self.partition_uuid,
                "baseMount": self.base_mount,
                "addPartitionLine": self.add_partition_line,
                "force": self.force,
            }),
        )
    }
}

/// An existing block that already covers one of the requested targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptCandidate {
    pub id: String,
    pub block: Option<String>,
    pub targets: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { id: String, result: OperationResult },
    Adoptable(AdoptCandidate),
    Failed(Failure),
}

impl ApplyOutcome {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Submits one apply and interprets the answer. Never retries.
pub fn apply(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    request: &ApplyRequest,
    fstab_path: &str,
) -> ApplyOutcome {
    let _guard = match in_flight.claim(&request.targets) {
        Ok(guard) => guard,
        Err(refused) => return ApplyOutcome::Failed(refused_failure(refused)),
    };
    log::info!("applying block {} for {} target(s)", request.id, request.targets.len());
    let result = helper::call(helper, &request.to_helper_request());
    interpret(request, result, fstab_path)
}

/// Re-submits an apply whose activation hit busy targets. The block is
/// already written, so the helper only retries `mount -a` after lazily
/// unmounting the targets.
pub fn retry_with_force(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    request: &ApplyRequest,
    fstab_path: &str,
) -> ApplyOutcome {
    apply(helper, in_flight, &request.forced(), fstab_path)
}

pub fn interpret(request: &ApplyRequest, result: OperationResult, fstab_path: &str) -> ApplyOutcome {
    let adoptable = result.status == Status::Adoptable || result.has_code(&ResultCode::AdoptableExistingBlock);
    if adoptable {
        if let Some(id) = result.id.clone() {
            log::info!("apply of {} found existing block {id}", request.id);
            return ApplyOutcome::Adoptable(AdoptCandidate {
                id,
                block: result.block.clone(),
                targets: result.targets.clone().unwrap_or_default(),
                message: result.message.clone(),
            });
        }
        return ApplyOutcome::Failed(Failure::unrecognized(result, NextAction::Retry));
    }

    if result.status == Status::Ok {
        log::info!("applied block {}", request.id);
        return ApplyOutcome::Applied {
            id: result.id.clone().unwrap_or_else(|| request.id.to_string()),
            result,
        };
    }

    log::warn!(
        "apply of {} failed: {}",
        request.id,
        result.code.as_ref().map(ResultCode::as_str).unwrap_or("no code")
    );
    let manual = NextAction::RunManualCommand {
        command: manual_apply_command(&request.block, fstab_path),
    };
    let failure = match result.code.clone() {
        Some(ResultCode::SpawnPkexecFailed) => {
            let details = mechanism_unavailable(
                &result,
                "Run the command below in a terminal to append the block yourself.",
            );
            Failure::with_details(result, details, manual)
        }
        Some(ResultCode::PkexecFailed) => Failure::classified(result, manual),
        Some(ResultCode::Busy) if !request.force => {
            let details = busy_details(request, &result);
            Failure::with_details(result, details, NextAction::RetryWithForce)
        }
        // the block is already in the table; only activation failed
        Some(ResultCode::MountFailed) | Some(ResultCode::Busy) | Some(ResultCode::MountFailedAfterLazy) => {
            Failure::classified(result, NextAction::Retry)
        }
        Some(ResultCode::TargetConflict) => {
            let details = ErrorDetails {
                title: "Target already in use".to_string(),
                message: result.message_or("A mount table entry outside lindy already uses this folder."),
                solution: "Remove or edit that entry by hand, or pick a different target folder.".to_string(),
                technical: Some(result.raw()),
            };
            Failure::with_details(result, details, NextAction::None)
        }
        Some(ResultCode::InFlight) => refused_failure(result),
        _ => Failure::unrecognized(result, NextAction::Retry),
    };
    ApplyOutcome::Failed(failure)
}

pub(crate) fn refused_failure(result: OperationResult) -> Failure {
    let details = ErrorDetails {
        title: "Already working on it".to_string(),
        message: result.message_or("Another operation for the same folder is still running."),
        solution: "Wait for it to finish, then try again.".to_string(),
        technical: None,
    };
    Failure::with_details(result, details, NextAction::Retry)
}

/// `mount -a` failed on targets something still holds. The helper's
/// `fuser` listing travels in stdout.
fn busy_details(request: &ApplyRequest, result: &OperationResult) -> ErrorDetails {
    let holders = request
        .targets
        .iter()
        .map(|target| format!("sudo fuser -mv {}", manual_command_path(target)))
        .collect::<Vec<_>>()
        .join("; ");
    let technical = [result.stderr.trim(), result.stdout.trim()]
        .into_iter()
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    ErrorDetails {
        title: "Target is busy".to_string(),
        message: format!(
            "Block {} was written, but mounting failed because a target folder is in use.",
            request.id
        ),
        solution: format!(
            "Close the programs listed below (`{holders}`), or retry with force (lazy unmount)."
        ),
        technical: Some(technical),
    }
}

/// Break-glass command that appends the block and activates it. The block
/// sits in a quoted heredoc inside `sh -c "..."`, so only the outer double
/// quotes need escaping.
pub fn manual_apply_command(block: &str, fstab_path: &str) -> String {
    let escaped = escape_double_quoted(block.trim_end_matches('\n'));
    let table = manual_command_path(fstab_path);
    format!(
        "sudo sh -c \"cat > /tmp/new_block <<'EOF'\n{escaped}\nEOF\ncat /tmp/new_block >> {table} && mount -a\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstab::DEFAULT_FSTAB_PATH;

    fn request() -> ApplyRequest {
        let mappings = vec![
            Mapping::with_paths("/mnt/windows/Users/Bob/Music", "/home/bob/Music"),
            Mapping::default(),
        ];
        let partition = PartitionChoice {
            uuid: Some("1234-ABCD".into()),
            skip: false,
        };
        ApplyRequest::build_with_id(BlockId::parse("req1").unwrap(), &mappings, &partition, "/mnt/windows")
            .unwrap()
    }

    #[test]
    fn build_collects_targets_and_device_flag() {
        let req = request();
        assert_eq!(req.targets, vec!["/home/bob/Music"]);
        assert!(req.add_partition_line);
        assert_eq!(req.partition_uuid.as_deref(), Some("1234-ABCD"));
        assert_eq!(req.base_mount.as_deref(), Some("/mnt/windows"));

        let payload = req.to_helper_request().payload;
        assert_eq!(payload["addPartitionLine"], true);
        assert_eq!(payload["id"], "req1");
    }

    #[test]
    fn empty_mapping_set_is_refused_before_elevation() {
        let refused = ApplyRequest::build(&[Mapping::default()], &PartitionChoice::default(), "/mnt").unwrap_err();
        assert!(refused.has_code(&ResultCode::InvalidRequest));
    }

    #[test]
    fn adoptable_is_not_a_failure() {
        let result = OperationResult {
            status: Status::Adoptable,
            ..OperationResult::error(ResultCode::AdoptableExistingBlock, "exists")
        }
        .with_id("old1")
        .with_block("# lindy BEGIN: old1\n# lindy END: old1\n", vec!["/home/bob/Music".into()]);
        match interpret(&request(), result, DEFAULT_FSTAB_PATH) {
            ApplyOutcome::Adoptable(candidate) => {
                assert_eq!(candidate.id, "old1");
                assert_eq!(candidate.targets, vec!["/home/bob/Music"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn spawn_failure_offers_manual_append() {
        let outcome = interpret(
            &request(),
            OperationResult::error(ResultCode::SpawnPkexecFailed, "failed to spawn pkexec"),
            DEFAULT_FSTAB_PATH,
        );
        let ApplyOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        match failure.next_action {
            NextAction::RunManualCommand { command } => {
                assert!(command.starts_with("sudo sh -c \"cat > /tmp/new_block <<'EOF'\n# lindy BEGIN: req1\n"));
                assert!(command.ends_with("EOF\ncat /tmp/new_block >> /etc/fstab && mount -a\""));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn mount_failure_is_classified() {
        let result = OperationResult::error(ResultCode::PkexecFailed, "mount -a failed")
            .with_output("$MFTMirr does not match $MFT", "");
        let ApplyOutcome::Failed(failure) = interpret(&request(), result, DEFAULT_FSTAB_PATH) else {
            panic!("expected failure");
        };
        assert_eq!(failure.details.title, "Windows wasn't shut down properly");
    }

    #[test]
    fn manual_command_escapes_dollar_signs() {
        let command = manual_apply_command("/a$b /c none bind 0 0\n", "/etc/fstab");
        assert!(command.contains("/a\\$b /c"));
    }

    /// Strips `sudo sh -c "` and the closing quote, then lets a real shell
    /// expand the double-quoted script with `printf`.
    fn script_as_shell_reads_it(command: &str) -> String {
        let inner = command
            .strip_prefix("sudo sh -c \"")
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap();
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("printf '%s' \"{inner}\""))
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap()
    }

    #[test]
    fn manual_command_keeps_shell_metacharacters_literal() {
        let block = "# lindy BEGIN: esc1\n/mnt/w/`id`\"x\\y$HOME /home/bob/W none bind 0 0\n# lindy END: esc1\n";
        let command = manual_apply_command(block, "/etc/fstab");

        let script = script_as_shell_reads_it(&command);
        assert!(script.starts_with("cat > /tmp/new_block <<'EOF'\n"));
        assert!(script.contains("\n/mnt/w/`id`\"x\\y$HOME /home/bob/W none bind 0 0\n"));
        assert!(script.ends_with("EOF\ncat /tmp/new_block >> /etc/fstab && mount -a"));
    }

    #[test]
    fn busy_activation_offers_forced_retry_with_holders() {
        let result = OperationResult::error(ResultCode::Busy, "mount failed due to busy targets")
            .with_output("mount: /home/bob/Music: target is busy.", "FUSER /home/bob/Music:\nbob 4242 ..c.. rhythmbox");
        let ApplyOutcome::Failed(failure) = interpret(&request(), result.clone(), DEFAULT_FSTAB_PATH) else {
            panic!("expected failure");
        };
        assert_eq!(failure.next_action, NextAction::RetryWithForce);
        assert!(failure.details.solution.contains("sudo fuser -mv /home/bob/Music"));
        let technical = failure.details.technical.unwrap();
        assert!(technical.contains("target is busy"));
        assert!(technical.contains("rhythmbox"));

        // a forced attempt never offers force again
        let forced = request().forced();
        assert!(forced.to_helper_request().payload["force"].as_bool().unwrap());
        let ApplyOutcome::Failed(failure) = interpret(&forced, result, DEFAULT_FSTAB_PATH) else {
            panic!("expected failure");
        };
        assert_eq!(failure.next_action, NextAction::Retry);
    }
}

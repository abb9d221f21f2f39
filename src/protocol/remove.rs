//! Removal of a managed block, with the busy-target escalation.
//!
//! One attempt moves `Idle -> Submitted -> {Done, BusyRetryOffered, Failed}`.
//! The only way back to `Submitted` is a user-confirmed forced retry from
//! `BusyRetryOffered`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::apply::refused_failure;
use super::{
    manual_command_path, mechanism_unavailable, Failure, InFlightTargets, NextAction, OperationResult, ResultCode,
    Status,
};
use crate::classify::ErrorDetails;
use crate::fstab::{find_block_for_target, scan_blocks, BlockId};
use crate::helper::{self, HelperRequest, PrivilegedHelper};

pub const ACTION_BY_TARGET: &str = "remove_by_target";
pub const ACTION_BY_ID: &str = "remove_by_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum RemovalSelector {
    Target(String),
    Id(BlockId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRequest {
    pub selector: RemovalSelector,
    /// Block id when known, for the manual fallback.
    pub block_id: Option<BlockId>,
    /// Bind targets of the block, when the registry knows them.
    #[serde(default)]
    pub known_targets: Vec<String>,
    pub force: bool,
}

impl RemovalRequest {
    /// Prefers the target so the helper resolves and removes in one call.
    pub fn new(target: Option<&str>, block_id: Option<BlockId>) -> Option<Self> {
        let selector = match (target.map(str::trim).filter(|t| !t.is_empty()), &block_id) {
            (Some(target), _) => RemovalSelector::Target(target.to_string()),
            (None, Some(id)) => RemovalSelector::Id(id.clone()),
            (None, None) => return None,
        };
        Some(Self {
            selector,
            block_id,
            known_targets: Vec::new(),
            force: false,
        })
    }

    pub fn with_known_targets(mut self, targets: Vec<String>) -> Self {
        self.known_targets = targets;
        self
    }

    fn label(&self) -> String {
        match (&self.block_id, &self.selector) {
            (Some(id), _) => id.to_string(),
            (None, RemovalSelector::Target(target)) => target.clone(),
            (None, RemovalSelector::Id(id)) => id.to_string(),
        }
    }

    /// What an attempt claims against overlapping submissions: every bind
    /// target of the block that is known, else a placeholder for the id.
    fn targets(&self) -> Vec<String> {
        let mut targets = match &self.selector {
            RemovalSelector::Target(target) => vec![target.clone()],
            RemovalSelector::Id(_) => Vec::new(),
        };
        for known in &self.known_targets {
            if !targets.contains(known) {
                targets.push(known.clone());
            }
        }
        if targets.is_empty() {
            if let RemovalSelector::Id(id) = &self.selector {
                targets.push(format!("block:{id}"));
            }
        }
        targets
    }

    /// The block id, looked up in the mount table by target when the caller
    /// didn't know it.
    fn resolve_block_id(&self, fstab_path: &str) -> Option<BlockId> {
        if let Some(id) = &self.block_id {
            return Some(id.clone());
        }
        let target = match &self.selector {
            RemovalSelector::Id(id) => return Some(id.clone()),
            RemovalSelector::Target(target) => target,
        };
        let table = std::fs::read_to_string(fstab_path).ok()?;
        let blocks = scan_blocks(&table);
        find_block_for_target(&blocks, target).and_then(|block| BlockId::parse(&block.id).ok())
    }

    pub fn to_helper_request(&self) -> HelperRequest {
        match &self.selector {
            RemovalSelector::Target(target) => HelperRequest::new(
                ACTION_BY_TARGET,
                json!({ "target": target, "force": self.force }),
            ),
            RemovalSelector::Id(id) => {
                HelperRequest::new(ACTION_BY_ID, json!({ "id": id, "force": self.force }))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemovalState {
    #[default]
    Idle,
    Submitted {
        request: RemovalRequest,
    },
    Done {
        result: OperationResult,
    },
    BusyRetryOffered {
        request: RemovalRequest,
        failure: Failure,
    },
    Failed {
        failure: Failure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {event} while {state}")]
pub struct InvalidTransition {
    pub state: &'static str,
    pub event: &'static str,
}

impl RemovalState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Submitted { .. } => "submitted",
            Self::Done { .. } => "done",
            Self::BusyRetryOffered { .. } => "busy_retry_offered",
            Self::Failed { .. } => "failed",
        }
    }

    fn invalid(&self, event: &'static str) -> InvalidTransition {
        InvalidTransition {
            state: self.name(),
            event,
        }
    }

    pub fn submit(&mut self, request: RemovalRequest) -> Result<(), InvalidTransition> {
        if !matches!(self, Self::Idle) {
            return Err(self.invalid("submit"));
        }
        *self = Self::Submitted { request };
        Ok(())
    }

    /// The user accepted the lazy-unmount retry.
    pub fn confirm_force(&mut self) -> Result<(), InvalidTransition> {
        match std::mem::take(self) {
            Self::BusyRetryOffered { mut request, .. } => {
                request.force = true;
                *self = Self::Submitted { request };
                Ok(())
            }
            other => {
                let err = other.invalid("retry with force");
                *self = other;
                Err(err)
            }
        }
    }

    pub fn resolve(&mut self, result: OperationResult, fstab_path: &str) -> Result<(), InvalidTransition> {
        let request = match std::mem::take(self) {
            Self::Submitted { request } => request,
            other => {
                let err = other.invalid("resolve");
                *self = other;
                return Err(err);
            }
        };
        *self = next_state(request, result, fstab_path);
        Ok(())
    }

    pub fn submitted(&self) -> Option<&RemovalRequest> {
        match self {
            Self::Submitted { request } => Some(request),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }
}

fn next_state(request: RemovalRequest, result: OperationResult, fstab_path: &str) -> RemovalState {
    if result.status == Status::Ok {
        log::info!("removed {}", request.label());
        return RemovalState::Done { result };
    }

    match result.code.clone() {
        Some(ResultCode::SpawnPkexecFailed) => {
            let (solution, action) = match request.resolve_block_id(fstab_path) {
                Some(id) => (
                    "Run the command below as root to strip the block by hand.",
                    NextAction::RunManualCommand {
                        command: manual_remove_command(&id, fstab_path),
                    },
                ),
                None => ("Restart the app and try again.", NextAction::Retry),
            };
            let details = mechanism_unavailable(&result, solution);
            RemovalState::Failed {
                failure: Failure::with_details(result, details, action),
            }
        }
        Some(ResultCode::PkexecFailed) if is_busy(&result) && !request.force => {
            log::warn!("{} is busy, offering a forced retry", request.label());
            let details = busy_details(&request, &result);
            RemovalState::BusyRetryOffered {
                failure: Failure::with_details(result, details, NextAction::RetryWithForce),
                request,
            }
        }
        Some(ResultCode::PkexecFailed) => RemovalState::Failed {
            failure: Failure::classified(result, NextAction::Retry),
        },
        Some(ResultCode::NotFound) | Some(ResultCode::NotManaged) => {
            let details = ErrorDetails {
                title: "Nothing to remove".to_string(),
                message: result.message_or("No managed block matches this mapping."),
                solution: "Refresh the list. Blocks not created by lindy must be adopted before they can be removed."
                    .to_string(),
                technical: Some(result.raw()),
            };
            RemovalState::Failed {
                failure: Failure::with_details(result, details, NextAction::None),
            }
        }
        Some(ResultCode::InFlight) => RemovalState::Failed {
            failure: refused_failure(result),
        },
        _ => RemovalState::Failed {
            failure: Failure::unrecognized(result, NextAction::Retry),
        },
    }
}

/// Case-insensitive "busy" anywhere in the streams or the message.
pub fn is_busy(result: &OperationResult) -> bool {
    let combined = format!(
        "{} {} {}",
        result.stderr,
        result.stdout,
        result.message.as_deref().unwrap_or_default()
    );
    combined.to_lowercase().contains("busy")
}

fn busy_details(request: &RemovalRequest, result: &OperationResult) -> ErrorDetails {
    let target = match (&request.selector, request.known_targets.first()) {
        (RemovalSelector::Target(target), _) => manual_command_path(target),
        (RemovalSelector::Id(_), Some(known)) => manual_command_path(known),
        (RemovalSelector::Id(_), None) => "<target>".to_string(),
    };
    ErrorDetails {
        title: "Target is busy".to_string(),
        message: format!("Unmount reported device busy for {}.", request.label()),
        solution: format!(
            "Use `sudo fuser -mv {target}` to list processes holding the mount, or retry with force (lazy unmount)."
        ),
        technical: Some(if result.stderr.is_empty() {
            result.stdout.clone()
        } else {
            result.stderr.clone()
        }),
    }
}

/// Break-glass command that backs up the table and strips the block by id.
pub fn manual_remove_command(id: &BlockId, fstab_path: &str) -> String {
    let fstab_path = manual_command_path(fstab_path);
    format!(
        "sudo sh -c \"cp {fstab_path} {fstab_path}.lindy.manual.bak.$(date +%s) && sed -e '/^# lindy BEGIN: {id}/,/^# lindy END: {id}/d' {fstab_path} > /tmp/fstab.clean.$$ && cp /tmp/fstab.clean.$$ {fstab_path} && sync && mount -a\""
    )
}

/// Runs one submission of `state` against the helper. `state` must be
/// `Submitted`.
pub fn drive(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    state: &mut RemovalState,
    fstab_path: &str,
) -> Result<(), InvalidTransition> {
    let request = state
        .submitted()
        .cloned()
        .ok_or_else(|| state.invalid("call the helper"))?;
    let result = match in_flight.claim(&request.targets()) {
        Ok(_guard) => {
            log::info!("removing {} (force: {})", request.label(), request.force);
            helper::call(helper, &request.to_helper_request())
        }
        Err(refused) => refused,
    };
    state.resolve(result, fstab_path)
}

/// Idle -> Submitted -> resolved, in one go.
pub fn remove(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    request: RemovalRequest,
    fstab_path: &str,
) -> RemovalState {
    let mut state = RemovalState::Idle;
    if let Err(err) = state.submit(request) {
        log::error!("{err}");
        return state;
    }
    if let Err(err) = drive(helper, in_flight, &mut state, fstab_path) {
        log::error!("{err}");
    }
    state
}

/// BusyRetryOffered -> Submitted(force) -> resolved.
pub fn retry_with_force(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    mut state: RemovalState,
    fstab_path: &str,
) -> Result<RemovalState, InvalidTransition> {
    state.confirm_force()?;
    drive(helper, in_flight, &mut state, fstab_path)?;
    Ok(state)
}

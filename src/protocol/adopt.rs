use serde::{Deserialize, Serialize};
use serde_json::json;

use super::apply::refused_failure;
use super::{mechanism_unavailable, Failure, InFlightTargets, NextAction, OperationResult, ResultCode};
use crate::classify::ErrorDetails;
use crate::fstab::BlockId;
use crate::helper::{self, HelperRequest, PrivilegedHelper};

pub const ACTION: &str = "adopt_block";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdoptOutcome {
    Adopted { id: String, result: OperationResult },
    Failed(Failure),
}

pub fn adopt_request(id: &BlockId) -> HelperRequest {
    HelperRequest::new(ACTION, json!({ "id": id }))
}

/// Marks an existing block as managed. Mount state is untouched, and a
/// failed adoption is only reported: re-creating the block here could mount
/// the same target twice.
pub fn adopt(
    helper: &dyn PrivilegedHelper,
    in_flight: &InFlightTargets,
    id: &BlockId,
    targets: &[String],
) -> AdoptOutcome {
    let _guard = match in_flight.claim(targets) {
        Ok(guard) => guard,
        Err(refused) => return AdoptOutcome::Failed(refused_failure(refused)),
    };
    log::info!("adopting block {id}");
    interpret(id, helper::call(helper, &adopt_request(id)))
}

pub fn interpret(id: &BlockId, result: OperationResult) -> AdoptOutcome {
    if result.is_ok() {
        log::info!("adopted block {id}");
        return AdoptOutcome::Adopted {
            id: id.to_string(),
            result,
        };
    }
    log::warn!("adoption of {id} failed: {}", result.message_or("no message"));
    let failure = match result.code.clone() {
        Some(ResultCode::SpawnPkexecFailed) => {
            let details = mechanism_unavailable(&result, "Restart the app and try adopting again.");
            Failure::with_details(result, details, NextAction::Retry)
        }
        Some(ResultCode::PkexecFailed) => Failure::classified(result, NextAction::Retry),
        Some(ResultCode::NotFound) => {
            let details = ErrorDetails {
                title: "Block is gone".to_string(),
                message: format!("No block with id {id} is in the mount table any more."),
                solution: "Refresh the list and apply the mapping again.".to_string(),
                technical: Some(result.raw()),
            };
            Failure::with_details(result, details, NextAction::None)
        }
        Some(ResultCode::InFlight) => refused_failure(result),
        _ => Failure::unrecognized(result, NextAction::Retry),
    };
    AdoptOutcome::Failed(failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_failures_map_to_outcomes() {
        let id = BlockId::parse("old1").unwrap();
        assert!(matches!(
            interpret(&id, OperationResult::ok(ResultCode::Adopted, "adopted")),
            AdoptOutcome::Adopted { .. }
        ));

        let AdoptOutcome::Failed(failure) =
            interpret(&id, OperationResult::error(ResultCode::NotFound, "missing"))
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.next_action, NextAction::None);

        let AdoptOutcome::Failed(failure) = interpret(
            &id,
            OperationResult::error(ResultCode::PkexecFailed, "x").with_output("Permission denied", ""),
        ) else {
            panic!("expected failure");
        };
        assert_eq!(failure.details.title, "Administrator access needed");
        assert_eq!(failure.next_action, NextAction::Retry);
    }
}

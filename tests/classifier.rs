use serde_json::{json, Value};

use lindy_lib::classify::{categorize, classify, ErrorCategory};
use lindy_lib::fstab::{PartitionChoice, DEFAULT_FSTAB_PATH};
use lindy_lib::helper::{HelperReply, HelperRequest, PrivilegedHelper};
use lindy_lib::mapping::Mapping;
use lindy_lib::protocol::apply::{self, ApplyOutcome, ApplyRequest};
use lindy_lib::protocol::{InFlightTargets, NextAction};

/// Answers every request with the same reply.
struct Scripted(Value);

impl PrivilegedHelper for Scripted {
    fn invoke(&self, _request: &HelperRequest) -> lindy_lib::Result<HelperReply> {
        Ok(HelperReply {
            response: self.0.clone(),
            stderr: String::new(),
            stdout: String::new(),
        })
    }
}

fn apply_with(reply: Value) -> ApplyOutcome {
    let mappings = vec![Mapping::with_paths("/windows/Users/Bob/Documents", "/home/bob/Documents")];
    let partition = PartitionChoice {
        uuid: Some("53337bda-2dc1-4a14-a8d9-c1702ddd33d6".into()),
        skip: false,
    };
    let request = ApplyRequest::build(&mappings, &partition, "/mnt/windows").unwrap();
    apply::apply(&Scripted(reply), &InFlightTargets::new(), &request, DEFAULT_FSTAB_PATH)
}

#[test]
fn ntfs_consistency_failure_is_improper_shutdown() {
    let outcome = apply_with(json!({
        "status": "error",
        "code": "mount_failed",
        "stderr": "$MFTMirr does not match $MFT",
    }));
    let ApplyOutcome::Failed(failure) = outcome else {
        panic!("expected failure");
    };
    assert_eq!(failure.details.title, "Windows wasn't shut down properly");
    assert_eq!(failure.details.technical.as_deref(), Some("$MFTMirr does not match $MFT"));
    assert_eq!(
        categorize("$MFTMirr does not match $MFT", ""),
        ErrorCategory::ImproperShutdown
    );
}

#[test]
fn elevated_failure_is_classified_and_keeps_the_manual_command() {
    let outcome = apply_with(json!({
        "status": "error",
        "code": "pkexec_failed",
        "stderr": "cp: cannot create regular file '/etc/fstab': Permission denied",
    }));
    let ApplyOutcome::Failed(failure) = outcome else {
        panic!("expected failure");
    };
    assert_eq!(failure.details.title, "Administrator access needed");
    assert!(matches!(failure.next_action, NextAction::RunManualCommand { .. }));
}

#[test]
fn ntfs_signature_wins_over_busy_and_io_signatures() {
    let stderr = "mount: /mnt/windows: target is busy. $MFTMirr does not match $MFT";
    assert_eq!(categorize(stderr, ""), ErrorCategory::ImproperShutdown);
    assert_eq!(categorize("umount: /home/bob/Music: target is busy.", ""), ErrorCategory::ResourceBusy);
}

#[test]
fn classification_is_total() {
    let inputs = ["", " ", "\u{0}", "ünïcödé", "mount: unknown filesystem type 'ntfs'"];
    for stderr in inputs {
        for stdout in inputs {
            let details = classify(stderr, stdout);
            assert!(!details.title.is_empty());
            assert!(!details.message.is_empty());
            assert!(!details.solution.is_empty());
            assert_eq!(details.technical.as_deref(), Some(stderr));
        }
    }
}

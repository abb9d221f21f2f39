mod common;

use common::{FakeHelper, BASE_TABLE};
use lindy_lib::fstab::{BlockId, PartitionChoice, DEFAULT_FSTAB_PATH};
use lindy_lib::mapping::Mapping;
use lindy_lib::protocol::adopt::{self, AdoptOutcome};
use lindy_lib::protocol::apply::{self, ApplyOutcome, ApplyRequest};
use lindy_lib::protocol::{InFlightTargets, NextAction, ResultCode};

fn documents() -> Vec<Mapping> {
    vec![Mapping::with_paths(
        "/mnt/windows/Users/Bob/Documents",
        "/home/bob/Documents",
    )]
}

fn partition() -> PartitionChoice {
    PartitionChoice {
        uuid: Some("01D5A3F2B7C8E9F0".into()),
        skip: false,
    }
}

fn request(mappings: &[Mapping]) -> ApplyRequest {
    ApplyRequest::build(mappings, &partition(), "/mnt/windows").unwrap()
}

#[test]
fn applying_the_same_mappings_twice_resolves_adoptable() {
    let helper = FakeHelper::new(BASE_TABLE);
    let in_flight = InFlightTargets::new();

    let first = apply::apply(&helper, &in_flight, &request(&documents()), DEFAULT_FSTAB_PATH);
    let ApplyOutcome::Applied { id, .. } = first else {
        panic!("first apply should succeed, got {first:?}");
    };

    let second = apply::apply(&helper, &in_flight, &request(&documents()), DEFAULT_FSTAB_PATH);
    match second {
        ApplyOutcome::Adoptable(candidate) => {
            assert_eq!(candidate.id, id);
            assert_eq!(candidate.targets, vec!["/home/bob/Documents"]);
        }
        other => panic!("second apply should be adoptable, got {other:?}"),
    }
    assert_eq!(helper.block_count(), 1);
    assert_eq!(helper.table().matches("/home/bob/Documents none bind").count(), 1);
}

#[test]
fn adopting_a_handmade_block_makes_it_managed() {
    let table = format!(
        "{BASE_TABLE}# lindy BEGIN: handmade\n/data/Music /home/bob/Music none bind 0 0\n# lindy END: handmade\n"
    );
    let helper = FakeHelper::new(&table);
    let in_flight = InFlightTargets::new();
    let music = vec![Mapping::with_paths("/mnt/windows/Users/Bob/Music", "/home/bob/Music")];

    let outcome = apply::apply(&helper, &in_flight, &request(&music), DEFAULT_FSTAB_PATH);
    let ApplyOutcome::Adoptable(candidate) = outcome else {
        panic!("expected adoptable, got {outcome:?}");
    };
    assert!(!helper.is_managed("handmade"));

    let id = BlockId::parse(&candidate.id).unwrap();
    let adopted = adopt::adopt(&helper, &in_flight, &id, &candidate.targets);
    assert!(matches!(adopted, AdoptOutcome::Adopted { .. }));
    assert!(helper.is_managed("handmade"));
    // adoption leaves the table alone
    assert_eq!(helper.table(), table);
}

#[test]
fn unmarked_entry_on_a_target_is_a_conflict() {
    let table = format!("{BASE_TABLE}/srv/docs /home/bob/Documents none bind 0 0\n");
    let helper = FakeHelper::new(&table);

    let outcome = apply::apply(&helper, &InFlightTargets::new(), &request(&documents()), DEFAULT_FSTAB_PATH);
    let ApplyOutcome::Failed(failure) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(failure.code, Some(ResultCode::TargetConflict));
    assert_eq!(failure.next_action, NextAction::None);
    assert_eq!(helper.table(), table);
}

#[test]
fn overlapping_submission_is_refused_without_calling_the_helper() {
    let helper = FakeHelper::new(BASE_TABLE);
    let in_flight = InFlightTargets::new();
    let _outstanding = in_flight.claim(&["/home/bob/Documents".to_string()]).unwrap();

    let outcome = apply::apply(&helper, &in_flight, &request(&documents()), DEFAULT_FSTAB_PATH);
    let ApplyOutcome::Failed(failure) = outcome else {
        panic!("expected refusal, got {outcome:?}");
    };
    assert_eq!(failure.code, Some(ResultCode::InFlight));
    assert!(helper.calls().is_empty());
}

#[test]
fn missing_elevation_offers_the_manual_append() {
    let helper = FakeHelper::without_pkexec();
    let outcome = apply::apply(&helper, &InFlightTargets::new(), &request(&documents()), DEFAULT_FSTAB_PATH);
    let ApplyOutcome::Failed(failure) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(failure.code, Some(ResultCode::SpawnPkexecFailed));
    assert_eq!(failure.details.title, "Permission helper not available");
    match failure.next_action {
        NextAction::RunManualCommand { command } => {
            assert!(command.contains("/mnt/windows/Users/Bob/Documents /home/bob/Documents none bind 0 0"));
            assert!(command.contains(">> /etc/fstab && mount -a"));
        }
        other => panic!("unexpected next action {other:?}"),
    }
}

#[test]
fn multiple_mappings_share_one_device_line() {
    let helper = FakeHelper::new(BASE_TABLE);
    let mappings = vec![
        Mapping::with_paths("/mnt/windows/Users/Bob/Music", "/home/bob/Music"),
        Mapping::with_paths("/mnt/windows/Users/Bob/Videos", "/home/bob/Videos"),
    ];
    let outcome = apply::apply(&helper, &InFlightTargets::new(), &request(&mappings), DEFAULT_FSTAB_PATH);
    assert!(outcome.is_terminal_success());
    assert_eq!(helper.table().matches("UUID=01D5A3F2B7C8E9F0 /mnt/windows").count(), 1);
    assert_eq!(helper.table().matches(" none bind 0 0").count(), 2);
}

#[test]
fn busy_activation_offers_a_forced_retry_that_does_not_append_again() {
    let helper = FakeHelper::new(BASE_TABLE);
    helper.mark_busy("/home/bob/Documents");
    let in_flight = InFlightTargets::new();
    let request = request(&documents());

    let outcome = apply::apply(&helper, &in_flight, &request, DEFAULT_FSTAB_PATH);
    let ApplyOutcome::Failed(failure) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(failure.code, Some(ResultCode::Busy));
    assert_eq!(failure.next_action, NextAction::RetryWithForce);
    assert!(failure.details.technical.unwrap().contains("FUSER /home/bob/Documents:"));
    // the block is written and owned even though activation failed
    assert_eq!(helper.block_count(), 1);
    assert!(helper.is_managed(request.id.as_str()));

    let retried = apply::retry_with_force(&helper, &in_flight, &request, DEFAULT_FSTAB_PATH);
    assert!(retried.is_terminal_success(), "got {retried:?}");
    assert_eq!(helper.block_count(), 1);

    let calls = helper.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].payload["force"], true);
}

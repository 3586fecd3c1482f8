// [libs/domain/models/src/tests_serialization.rs]
//! Wire parity checks for the contracts both binaries must agree on.

use uuid::Uuid;

use crate::job::{AttackMode, IncrementMode};
use crate::messages::{
    Envelope, MessageType, OutfileDeleteApprovedPayload, StateSyncResponsePayload,
    TaskAssignmentPayload,
};

#[test]
fn task_assignment_wire_shape() {
    let assignment = TaskAssignmentPayload {
        task_id: Uuid::new_v4(),
        job_execution_id: Uuid::new_v4(),
        hashlist_id: Uuid::new_v4(),
        hashlist_path: "hashlists/7b.hash".into(),
        attack_mode: AttackMode::BruteForce.as_u8(),
        hash_type: 1000,
        keyspace_start: 0,
        keyspace_end: 676,
        wordlist_paths: vec![],
        rule_paths: vec![],
        mask: Some("?l?l".into()),
        binary_path: "binaries/4/hashcat".into(),
        chunk_duration: 1200,
        report_interval: 5,
        output_format: "3".into(),
        extra_parameters: String::new(),
        enabled_devices: Some(vec![1, 2]),
        is_keyspace_split: false,
        increment_mode: None,
        increment_min: None,
        increment_max: None,
    };

    let envelope = Envelope::new(MessageType::TaskAssignment, &assignment).unwrap();
    let wire = envelope.encode().unwrap();

    // Field names are part of the protocol; a rename breaks deployed agents.
    assert!(wire.contains("\"type\":\"task_assignment\""));
    assert!(wire.contains("\"keyspace_start\":0"));
    assert!(wire.contains("\"output_format\":\"3\""));

    let back: TaskAssignmentPayload = Envelope::decode(&wire).unwrap().payload_as().unwrap();
    assert_eq!(back.task_id, assignment.task_id);
    assert_eq!(back.mask.as_deref(), Some("?l?l"));
    assert_eq!(back.enabled_devices, Some(vec![1, 2]));
}

#[test]
fn increment_mode_serializes_snake_case() {
    let json = serde_json::to_string(&IncrementMode::IncrementInverse).unwrap();
    assert_eq!(json, "\"increment_inverse\"");
}

#[test]
fn state_sync_response_carries_pending_completions() {
    let completion_id = Uuid::new_v4();
    let response = StateSyncResponsePayload {
        request_id: Uuid::new_v4(),
        has_running_task: false,
        task_id: None,
        job_id: None,
        status: "idle".into(),
        pending_completions: vec![completion_id],
    };
    let envelope = Envelope::new(MessageType::StateSyncResponse, &response).unwrap();
    let back: StateSyncResponsePayload =
        Envelope::decode(&envelope.encode().unwrap()).unwrap().payload_as().unwrap();
    assert_eq!(back.pending_completions, vec![completion_id]);
    assert_eq!(back.status, "idle");
}

#[test]
fn delete_approval_is_explicit_about_orphans() {
    let approval = OutfileDeleteApprovedPayload {
        task_id: Uuid::new_v4(),
        expected_line_count: 3,
        task_exists: false,
    };
    let wire = Envelope::new(MessageType::OutfileDeleteApproved, &approval)
        .unwrap()
        .encode()
        .unwrap();
    assert!(wire.contains("\"task_exists\":false"));
    assert!(wire.contains("\"expected_line_count\":3"));
}

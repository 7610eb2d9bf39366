use hearth_types::{OperationId, ProfileId, RecordId, UserId};
use std::collections::HashSet;
use std::str::FromStr;

// ── RecordId ─────────────────────────────────────────────────────

#[test]
fn record_id_new_is_unique() {
    assert_ne!(RecordId::new(), RecordId::new());
}

#[test]
fn record_id_from_uuid_roundtrip() {
    let uuid = uuid::Uuid::now_v7();
    assert_eq!(RecordId::from_uuid(uuid).as_uuid(), uuid);
}

#[test]
fn record_id_display_and_parse() {
    let id = RecordId::new();
    assert_eq!(RecordId::parse(&id.to_string()).unwrap(), id);
    assert_eq!(RecordId::from_str(&id.to_string()).unwrap(), id);
}

#[test]
fn record_id_parse_invalid() {
    assert!(RecordId::parse("not-a-uuid").is_err());
}

#[test]
fn record_id_serializes_as_plain_string() {
    let id = RecordId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}

// ── OperationId ──────────────────────────────────────────────────

#[test]
fn operation_ids_sort_in_creation_order() {
    let ids: Vec<OperationId> = (0..64).map(|_| OperationId::new()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[test]
fn operation_id_hash_and_eq() {
    let id = OperationId::new();
    let mut set = HashSet::new();
    set.insert(id);
    set.insert(id);
    assert_eq!(set.len(), 1);
}

// ── ProfileId ────────────────────────────────────────────────────

#[test]
fn profile_id_debug_names_type() {
    let debug = format!("{:?}", ProfileId::new());
    assert!(debug.contains("ProfileId"));
}

// ── UserId ───────────────────────────────────────────────────────

#[test]
fn user_id_rejects_empty() {
    assert!(UserId::new("").is_err());
    assert!(UserId::new("   ").is_err());
    assert!("".parse::<UserId>().is_err());
}

#[test]
fn user_id_display_matches_input() {
    let bob = UserId::new("bob").unwrap();
    assert_eq!(bob.to_string(), "bob");
    assert_eq!(bob.as_str(), "bob");
}

#[test]
fn user_id_serialization_roundtrip() {
    let alice = UserId::new("alice").unwrap();
    let json = serde_json::to_string(&alice).unwrap();
    assert_eq!(json, "\"alice\"");
    let parsed: UserId = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, alice);
}

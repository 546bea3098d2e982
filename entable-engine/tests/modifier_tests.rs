mod common;

use std::sync::Arc;

use common::{
    Behavior, Harness, Recording, User, entries, harness, indexed_users, journal, make_user,
    user_registration,
};
use entable_engine::{
    CreateOutcome, DeleteOutcome, EngineError, EntityRegistry, Modifier, Table, UpdateOutcome,
    UpsertOutcome,
};
use entable_storage::{StoreOp, TableStore};
use entable_types::KeyPair;
use pretty_assertions::assert_eq;

fn user_table(modifiers: Vec<Arc<dyn Modifier>>) -> (Harness, Table<User>) {
    let registry = EntityRegistry::builder()
        .register(user_registration(modifiers))
        .build()
        .unwrap();
    let h = harness(registry);
    let table = h.tables.table::<User>().unwrap();
    (h, table)
}

fn user_keys(id: &str) -> KeyPair {
    KeyPair::new(id, "users")
}

// ── Saga ordering ───────────────────────────────────────────────

#[tokio::test]
async fn modifiers_run_in_declaration_order() {
    let j = journal();
    let (_h, users) = user_table(vec![
        Recording::new("m1", &j).arc(),
        Recording::new("m2", &j).arc(),
        Recording::new("m3", &j).arc(),
    ]);
    users.create(&make_user("u1", "a@x.io")).await.unwrap();
    assert_eq!(entries(&j), vec!["create:m1", "create:m2", "create:m3"]);
}

#[tokio::test]
async fn failing_modifier_rolls_back_predecessors_in_reverse_then_removes_row() {
    let j = journal();
    let (h, users) = user_table(vec![
        Recording::new("m1", &j).arc(),
        Recording::new("m2", &j).arc(),
        Recording::new("m3", &j).behaving(Behavior::Violate).arc(),
        Recording::new("m4", &j).arc(),
    ]);

    let outcome = users.create(&make_user("u1", "a@x.io")).await.unwrap();
    assert!(matches!(outcome, CreateOutcome::ConstraintViolation(ref r) if r.contains("m3")));
    assert_eq!(
        entries(&j),
        vec!["create:m1", "create:m2", "create:m3", "undo:m2", "undo:m1"]
    );
    assert_eq!(h.store.row_count("users"), 0);
}

#[tokio::test]
async fn non_constraint_failure_is_an_error_after_clean_rollback() {
    let j = journal();
    let (h, users) = user_table(vec![
        Recording::new("m1", &j).arc(),
        Recording::new("m2", &j).behaving(Behavior::Fail).arc(),
    ]);

    let err = users.create(&make_user("u1", "a@x.io")).await.unwrap_err();
    assert!(matches!(err, EngineError::Modifier { ref modifier, .. } if modifier == "m2"));
    assert_eq!(entries(&j), vec!["create:m1", "create:m2", "undo:m1"]);
    assert_eq!(h.store.row_count("users"), 0);
}

#[tokio::test]
async fn rollback_failure_is_reported_as_compensation_error() {
    let j = journal();
    let (_h, users) = user_table(vec![
        Recording::new("m1", &j).arc(),
        Recording::new("m2", &j).behaving(Behavior::FailingRollback).arc(),
        Recording::new("m3", &j).behaving(Behavior::Violate).arc(),
    ]);

    let err = users.create(&make_user("u1", "a@x.io")).await.unwrap_err();
    let EngineError::Compensation { cause, failures } = err else {
        panic!("expected Compensation, got {err:?}");
    };
    assert!(cause.contains("m3"));
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("m2"));
    // Every rollback still ran exactly once, newest first.
    assert_eq!(
        entries(&j),
        vec!["create:m1", "create:m2", "create:m3", "undo:m2", "undo:m1"]
    );
}

#[tokio::test]
async fn failed_base_row_removal_is_a_compensation_failure() {
    let j = journal();
    let (h, users) = user_table(vec![Recording::new("m1", &j).behaving(Behavior::Violate).arc()]);
    h.store.fail_next(StoreOp::Delete, 1);

    let err = users.create(&make_user("u1", "a@x.io")).await.unwrap_err();
    assert!(matches!(err, EngineError::Compensation { ref failures, .. } if failures[0].contains("base row")));
    // The orphan is still there for an operator to find.
    assert_eq!(h.store.row_count("users"), 1);
}

#[tokio::test]
async fn update_modifier_failure_restores_previous_row() {
    let j = journal();
    let (h, users) = user_table(vec![
        Recording::new("m1", &j).arc(),
        Recording::new("m2", &j).arc(),
    ]);
    let created = users
        .create(&make_user("u1", "a@x.io"))
        .await
        .unwrap()
        .created()
        .unwrap();

    let j2 = journal();
    let (_h2, failing) = users_sharing(&h, vec![
        Recording::new("m1", &j2).arc(),
        Recording::new("m2", &j2).behaving(Behavior::Violate).arc(),
    ]);
    let mut changed = created.entity.clone();
    changed.age = 99;
    let outcome = failing.update(&changed, &created.etag).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::ConstraintViolation(_)));
    assert_eq!(entries(&j2), vec!["update:m1", "update:m2", "undo:m1"]);

    let stored = users.get(&user_keys("u1")).await.unwrap().unwrap();
    assert_eq!(stored.entity.age, 30);
}

/// A second handle over the same store with a different modifier set.
fn users_sharing(h: &Harness, modifiers: Vec<Arc<dyn Modifier>>) -> (Harness, Table<User>) {
    let registry = EntityRegistry::builder()
        .register(user_registration(modifiers))
        .build()
        .unwrap();
    let tables = entable_engine::Tables::new(Arc::clone(&h.store) as Arc<dyn TableStore>, registry);
    let table = tables.table::<User>().unwrap();
    (
        Harness {
            store: Arc::clone(&h.store),
            tables,
        },
        table,
    )
}

#[tokio::test]
async fn delete_modifier_failure_restores_row() {
    let j = journal();
    let (h, users) = user_table(vec![
        Recording::new("m1", &j).arc(),
        Recording::new("m2", &j).behaving(Behavior::Violate).arc(),
    ]);
    let created = users.create(&make_user("u1", "a@x.io")).await.unwrap();
    assert!(matches!(created, CreateOutcome::ConstraintViolation(_)));

    let j2 = journal();
    let (_plain_h, plain) = users_sharing(&h, vec![Recording::new("m1", &j2).arc()]);
    let stored = plain
        .create(&make_user("u1", "a@x.io"))
        .await
        .unwrap()
        .created()
        .unwrap();

    let outcome = users.delete(&stored.keys, &stored.etag).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::ConstraintViolation(_)));
    assert!(users.get(&stored.keys).await.unwrap().is_some());
}

// ── Unique index ────────────────────────────────────────────────

#[tokio::test]
async fn unique_index_rejects_duplicate_value() {
    let (h, users, _index) = indexed_users();
    users.create(&make_user("u1", "alice@x.io")).await.unwrap();

    let dup = users.create(&make_user("u2", "ALICE@x.io")).await.unwrap();
    assert!(matches!(dup, CreateOutcome::ConstraintViolation(_)));
    assert!(users.get(&user_keys("u2")).await.unwrap().is_none());
    assert_eq!(h.store.row_count("user_index"), 1);
}

#[tokio::test]
async fn get_by_index_follows_pointer() {
    let (_h, users, index) = indexed_users();
    users.create(&make_user("u1", "alice@x.io")).await.unwrap();

    let found = users.get_by_index(&index, "Alice@X.io").await.unwrap().unwrap();
    assert_eq!(found.entity.id, "u1");
    assert!(users.get_by_index(&index, "bob@x.io").await.unwrap().is_none());
}

#[tokio::test]
async fn unique_index_moves_on_update_and_clears_on_delete() {
    let (h, users, index) = indexed_users();
    let created = users
        .create(&make_user("u1", "alice@x.io"))
        .await
        .unwrap()
        .created()
        .unwrap();

    let mut renamed = created.entity.clone();
    renamed.email = "alicia@x.io".into();
    let updated = users
        .update(&renamed, &created.etag)
        .await
        .unwrap()
        .updated()
        .unwrap();

    assert!(users.get_by_index(&index, "alice@x.io").await.unwrap().is_none());
    assert!(users.get_by_index(&index, "alicia@x.io").await.unwrap().is_some());
    assert_eq!(h.store.row_count("user_index"), 1);

    // The old value is free again.
    users.create(&make_user("u2", "alice@x.io")).await.unwrap().created().unwrap();

    let outcome = users.delete(&updated.keys, &updated.etag).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Deleted));
    assert!(users.get_by_index(&index, "alicia@x.io").await.unwrap().is_none());
    assert_eq!(h.store.row_count("user_index"), 1);
}

#[tokio::test]
async fn update_to_taken_value_is_rolled_back() {
    let (_h, users, index) = indexed_users();
    users.create(&make_user("u1", "alice@x.io")).await.unwrap();
    let bob = users
        .create(&make_user("u2", "bob@x.io"))
        .await
        .unwrap()
        .created()
        .unwrap();

    let mut stealing = bob.entity.clone();
    stealing.email = "alice@x.io".into();
    let outcome = users.update(&stealing, &bob.etag).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::ConstraintViolation(_)));

    let stored = users.get(&user_keys("u2")).await.unwrap().unwrap();
    assert_eq!(stored.entity.email, "bob@x.io");
    let owner = users.get_by_index(&index, "bob@x.io").await.unwrap().unwrap();
    assert_eq!(owner.entity.id, "u2");
}

#[tokio::test]
async fn unchanged_indexed_value_keeps_pointer() {
    let (h, users, index) = indexed_users();
    let created = users
        .create(&make_user("u1", "alice@x.io"))
        .await
        .unwrap()
        .created()
        .unwrap();
    let mut older = created.entity.clone();
    older.age = 31;
    users.update(&older, &created.etag).await.unwrap().updated().unwrap();

    assert_eq!(h.store.row_count("user_index"), 1);
    assert!(users.get_by_index(&index, "alice@x.io").await.unwrap().is_some());
}

#[tokio::test]
async fn upsert_moves_index_pointer_of_existing_row() {
    let (h, users, index) = indexed_users();
    users.create(&make_user("u1", "old@x.io")).await.unwrap().created().unwrap();

    users
        .upsert(&make_user("u1", "new@x.io"))
        .await
        .unwrap()
        .upserted()
        .unwrap();

    assert!(users.get_by_index(&index, "old@x.io").await.unwrap().is_none());
    let owner = users.get_by_index(&index, "new@x.io").await.unwrap().unwrap();
    assert_eq!(owner.entity.id, "u1");
    assert_eq!(h.store.row_count("user_index"), 1);

    let taken = users.create(&make_user("u2", "new@x.io")).await.unwrap();
    assert!(matches!(taken, CreateOutcome::ConstraintViolation(_)));
}

#[tokio::test]
async fn upsert_of_new_row_claims_index_value() {
    let (_h, users, index) = indexed_users();
    users
        .upsert(&make_user("u1", "alice@x.io"))
        .await
        .unwrap()
        .upserted()
        .unwrap();

    let owner = users.get_by_index(&index, "alice@x.io").await.unwrap().unwrap();
    assert_eq!(owner.entity.id, "u1");
}

#[tokio::test]
async fn upsert_to_taken_value_is_rolled_back() {
    let (h, users, index) = indexed_users();
    users.create(&make_user("u1", "alice@x.io")).await.unwrap();
    users.create(&make_user("u2", "bob@x.io")).await.unwrap();

    let replaced = users.upsert(&make_user("u2", "ALICE@x.io")).await.unwrap();
    assert!(matches!(replaced, UpsertOutcome::ConstraintViolation(_)));
    let inserted = users.upsert(&make_user("u3", "alice@x.io")).await.unwrap();
    assert!(matches!(inserted, UpsertOutcome::ConstraintViolation(_)));

    let kept = users.get(&user_keys("u2")).await.unwrap().unwrap();
    assert_eq!(kept.entity.email, "bob@x.io");
    assert!(users.get(&user_keys("u3")).await.unwrap().is_none());
    let owner = users.get_by_index(&index, "bob@x.io").await.unwrap().unwrap();
    assert_eq!(owner.entity.id, "u2");
    assert_eq!(h.store.row_count("user_index"), 2);
}

#[tokio::test]
async fn upsert_runs_create_then_update_modifiers() {
    let j = journal();
    let (_h, users) = user_table(vec![Recording::new("m1", &j).arc()]);
    users.upsert(&make_user("u1", "a@x.io")).await.unwrap().upserted().unwrap();
    users.upsert(&make_user("u1", "b@x.io")).await.unwrap().upserted().unwrap();
    assert_eq!(entries(&j), vec!["create:m1", "update:m1"]);
}

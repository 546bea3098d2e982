//! Shared test helpers for engine tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use entable_engine::{
    EntityRegistry, Modifier, ModifierContext, ModifierError, Rollback, Table, TableRegistration,
    Tables, UniqueIndex, rollback,
};
use entable_model::{EntityMapper, FieldKey, FieldPartition, FixedPartition, Member};
use entable_storage::{MemoryTableStore, TableStore};
use serde::{Deserialize, Serialize};

/// Installs a test subscriber honouring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Entities ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub part: String,
    pub x: i64,
}

pub fn make_item(id: &str, part: &str, x: i64) -> Item {
    Item {
        id: id.to_string(),
        part: part.to_string(),
        x,
    }
}

pub fn item_registration() -> TableRegistration<Item> {
    TableRegistration::builder("items")
        .mapper(
            EntityMapper::builder()
                .member(Member::scalar("id").stored_as("Id"))
                .member(Member::scalar("part").stored_as("Part"))
                .member(Member::scalar("x").stored_as("X"))
                .build()
                .unwrap(),
        )
        .row_key(FieldKey::new("Id"))
        .partition_key(FieldPartition::new("Part"))
        .build()
        .unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub age: i64,
}

pub fn make_user(id: &str, email: &str) -> User {
    User {
        id: id.to_string(),
        email: email.to_string(),
        age: 30,
    }
}

pub fn user_mapper() -> EntityMapper<User> {
    EntityMapper::builder()
        .member(Member::scalar("id").stored_as("Id"))
        .member(Member::scalar("email").stored_as("Email"))
        .member(Member::scalar("age").stored_as("Age"))
        .build()
        .unwrap()
}

pub fn user_registration(modifiers: Vec<Arc<dyn Modifier>>) -> TableRegistration<User> {
    modifiers
        .into_iter()
        .fold(
            TableRegistration::builder("users")
                .mapper(user_mapper())
                .row_key(FieldKey::new("Id"))
                .partition_key(FixedPartition::new("users")),
            |builder, m| builder.modifier(m),
        )
        .build()
        .unwrap()
}

// ── Harness ─────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryTableStore>,
    pub tables: Tables,
}

pub fn harness(registry: EntityRegistry) -> Harness {
    harness_with_store(MemoryTableStore::new(), registry)
}

pub fn harness_with_store(store: MemoryTableStore, registry: EntityRegistry) -> Harness {
    let store = Arc::new(store);
    let tables = Tables::new(Arc::clone(&store) as Arc<dyn TableStore>, registry);
    Harness { store, tables }
}

pub fn item_table() -> (Harness, Table<Item>) {
    let registry = EntityRegistry::builder()
        .register(item_registration())
        .build()
        .unwrap();
    let h = harness(registry);
    let table = h.tables.table::<Item>().unwrap();
    (h, table)
}

/// Users with a case-insensitive unique index on `email`.
pub fn indexed_users() -> (Harness, Table<User>, Arc<UniqueIndex>) {
    let store = Arc::new(MemoryTableStore::new());
    let index = Arc::new(
        UniqueIndex::new(Arc::clone(&store) as Arc<dyn TableStore>, "user_index", "email")
            .case_insensitive(),
    );
    let registry = EntityRegistry::builder()
        .register(user_registration(vec![index.clone() as Arc<dyn Modifier>]))
        .build()
        .unwrap();
    let tables = Tables::new(Arc::clone(&store) as Arc<dyn TableStore>, registry);
    let table = tables.table::<User>().unwrap();
    (Harness { store, tables }, table, index)
}

// ── Recording modifier ──────────────────────────────────────────

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Violate,
    Fail,
    FailingRollback,
}

/// Modifier that logs every step and rollback to a shared journal.
pub struct Recording {
    name: String,
    member: String,
    journal: Journal,
    behavior: Behavior,
}

impl Recording {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            member: "email".to_string(),
            journal: Arc::clone(journal),
            behavior: Behavior::Succeed,
        }
    }

    pub fn behaving(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn on_member(mut self, member: &str) -> Self {
        self.member = member.to_string();
        self
    }

    pub fn arc(self) -> Arc<dyn Modifier> {
        Arc::new(self)
    }

    fn step(&self, phase: &str) -> Result<Rollback, ModifierError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{phase}:{}", self.name));
        let journal = Arc::clone(&self.journal);
        let name = self.name.clone();
        match self.behavior {
            Behavior::Succeed => Ok(rollback(move || async move {
                journal.lock().unwrap().push(format!("undo:{name}"));
                Ok(())
            })),
            Behavior::FailingRollback => Ok(rollback(move || async move {
                journal.lock().unwrap().push(format!("undo:{name}"));
                Err(ModifierError::Failed("rollback exploded".into()))
            })),
            Behavior::Violate => Err(ModifierError::ConstraintViolation(format!(
                "{} says no",
                self.name
            ))),
            Behavior::Fail => Err(ModifierError::Failed(format!("{} broke", self.name))),
        }
    }
}

#[async_trait]
impl Modifier for Recording {
    fn name(&self) -> &str {
        &self.name
    }

    fn member(&self) -> &str {
        &self.member
    }

    async fn on_create(&self, _ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        self.step("create")
    }

    async fn on_update(&self, _ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        self.step("update")
    }

    async fn on_delete(&self, _ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        self.step("delete")
    }
}

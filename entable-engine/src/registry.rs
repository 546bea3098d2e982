//! Per-entity-type registrations, validated once at startup.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use entable_model::{EntityMapper, KeySpec, PartitionKeyProducer, RowKeyProducer};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{EngineError, EngineResult};
use crate::modifier::{BoundModifier, Modifier};

/// Types the engine can persist.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Entity for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Everything the engine needs to persist `E`: table, key producers,
/// property converter and modifiers.
pub struct TableRegistration<E> {
    table: String,
    mapper: EntityMapper<E>,
    keys: KeySpec,
    modifiers: Vec<BoundModifier>,
}

impl<E: Entity> TableRegistration<E> {
    pub fn builder(table: impl Into<String>) -> RegistrationBuilder<E> {
        RegistrationBuilder {
            table: table.into(),
            mapper: Vec::new(),
            row: Vec::new(),
            partition: Vec::new(),
            modifiers: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn mapper(&self) -> &EntityMapper<E> {
        &self.mapper
    }

    pub fn key_spec(&self) -> &KeySpec {
        &self.keys
    }

    /// Modifier names in execution order.
    pub fn modifier_names(&self) -> Vec<&str> {
        self.modifiers.iter().map(|b| b.modifier.name()).collect()
    }

    pub(crate) fn modifiers(&self) -> &[BoundModifier] {
        &self.modifiers
    }
}

impl<E> fmt::Debug for TableRegistration<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRegistration")
            .field("table", &self.table)
            .field("keys", &self.keys)
            .field("modifiers", &self.modifiers.len())
            .finish()
    }
}

/// Collects the pieces of a [`TableRegistration`].
///
/// Declaring a second producer of the same kind is not "last wins": `build`
/// rejects it as ambiguous.
pub struct RegistrationBuilder<E> {
    table: String,
    mapper: Vec<EntityMapper<E>>,
    row: Vec<Arc<dyn RowKeyProducer>>,
    partition: Vec<Arc<dyn PartitionKeyProducer>>,
    modifiers: Vec<Arc<dyn Modifier>>,
}

impl<E: Entity> RegistrationBuilder<E> {
    #[must_use]
    pub fn mapper(mut self, mapper: EntityMapper<E>) -> Self {
        self.mapper.push(mapper);
        self
    }

    #[must_use]
    pub fn row_key(mut self, producer: impl RowKeyProducer + 'static) -> Self {
        self.row.push(Arc::new(producer));
        self
    }

    #[must_use]
    pub fn partition_key(mut self, producer: impl PartitionKeyProducer + 'static) -> Self {
        self.partition.push(Arc::new(producer));
        self
    }

    /// Appends a modifier; modifiers run in the order they are added.
    #[must_use]
    pub fn modifier(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn build(self) -> EngineResult<TableRegistration<E>> {
        let entity = type_name::<E>();
        if self.table.is_empty() {
            return Err(EngineError::Configuration(format!(
                "{entity}: table name must be non-empty"
            )));
        }
        let mapper = single(self.mapper, entity, "property mapper")?;
        let row = single(self.row, entity, "row key producer")?;
        let partition = single(self.partition, entity, "partition key producer")?;

        let mut modifiers = Vec::with_capacity(self.modifiers.len());
        for modifier in self.modifiers {
            if modifiers
                .iter()
                .any(|b: &BoundModifier| b.modifier.name() == modifier.name())
            {
                return Err(EngineError::Configuration(format!(
                    "{entity}: modifier `{}` registered twice",
                    modifier.name()
                )));
            }
            let property = mapper.store_name(modifier.member()).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "{entity}: modifier `{}` is attached to `{}`, which is not a scalar member",
                    modifier.name(),
                    modifier.member()
                ))
            })?;
            modifiers.push(BoundModifier {
                property: property.to_string(),
                modifier,
            });
        }

        Ok(TableRegistration {
            table: self.table,
            mapper,
            keys: KeySpec::from_arcs(row, partition),
            modifiers,
        })
    }
}

fn single<T>(mut items: Vec<T>, entity: &str, what: &str) -> EngineResult<T> {
    match items.len() {
        0 => Err(EngineError::Configuration(format!("{entity}: no {what} registered"))),
        1 => items
            .pop()
            .ok_or_else(|| EngineError::Configuration(format!("{entity}: no {what} registered"))),
        n => Err(EngineError::Configuration(format!(
            "{entity}: ambiguous mapping, {n} {what}s registered"
        ))),
    }
}

/// Entity type → registration map.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    names: HashMap<TypeId, &'static str>,
}

impl EntityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            registry: EntityRegistry::default(),
            duplicates: Vec::new(),
        }
    }

    /// Looks up the registration for `E`.
    pub fn registration<E: Entity>(&self) -> EngineResult<Arc<TableRegistration<E>>> {
        let entry = self.entries.get(&TypeId::of::<E>()).ok_or_else(|| {
            EngineError::Configuration(format!("{} is not registered", type_name::<E>()))
        })?;
        Arc::clone(entry)
            .downcast::<TableRegistration<E>>()
            .map_err(|_| {
                EngineError::Configuration(format!(
                    "registration for {} has the wrong type",
                    type_name::<E>()
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names.values()).finish()
    }
}

pub struct RegistryBuilder {
    registry: EntityRegistry,
    duplicates: Vec<&'static str>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn register<E: Entity>(mut self, registration: TableRegistration<E>) -> Self {
        let id = TypeId::of::<E>();
        if self.registry.entries.contains_key(&id) {
            self.duplicates.push(type_name::<E>());
        }
        self.registry.entries.insert(id, Arc::new(registration));
        self.registry.names.insert(id, type_name::<E>());
        self
    }

    pub fn build(self) -> EngineResult<EntityRegistry> {
        if let Some(entity) = self.duplicates.first() {
            return Err(EngineError::Configuration(format!(
                "{entity} registered more than once"
            )));
        }
        Ok(self.registry)
    }
}

//! Entity ↔ property bag mapping.
//!
//! Entities are plain serde types. An [`EntityMapper`] is built from an
//! explicit list of [`Member`]s; each member says which entity field it
//! reads, which property name it is stored under and which [`ValueCodec`]
//! converts its value.
//!
//! Two member shapes exist:
//! - **scalar**: one field, one property (`email` → `Email`)
//! - **expanded**: a map-shaped field whose entries become one property each,
//!   named `prefix + key` (`logins["google"]` → `Login_google`)
//!
//! Reading is tolerant: properties no member claims are ignored, and entries
//! that fail to decode are skipped so older or newer rows stay readable.

use chrono::{DateTime, SecondsFormat, Utc};
use entable_types::{PropertyBag, PropertyValue, ValueKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ModelError, ModelResult};
use crate::query::Predicate;

/// Converts one JSON member value to and from a stored property value.
pub trait ValueCodec: Send + Sync {
    /// `Ok(None)` means "store nothing" (e.g. a null optional).
    fn encode(&self, member: &str, value: &Value) -> ModelResult<Option<PropertyValue>>;

    fn decode(&self, member: &str, value: &PropertyValue) -> ModelResult<Value>;
}

/// Default codec: maps JSON scalars to native property kinds.
///
/// Without a kind hint, strings stay strings and numbers become `Int` or
/// `Double`. With a hint, strings can be parsed into `DateTime` or `Guid`
/// and byte arrays into `Binary`. Arrays and objects are rejected; declare
/// those members with [`JsonTextCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InferredCodec {
    kind: Option<ValueKind>,
}

impl InferredCodec {
    pub fn with_kind(kind: ValueKind) -> Self {
        Self { kind: Some(kind) }
    }
}

fn unsupported(member: &str, reason: impl Into<String>) -> ModelError {
    ModelError::UnsupportedValue {
        member: member.to_string(),
        reason: reason.into(),
    }
}

fn infer(member: &str, value: &Value) -> ModelResult<Option<PropertyValue>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(PropertyValue::Bool(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(PropertyValue::Int(i)))
            } else if n.is_u64() {
                Err(unsupported(
                    member,
                    "unsigned value above i64::MAX has no exact stored kind; use a text codec",
                ))
            } else {
                n.as_f64()
                    .map(|f| Some(PropertyValue::Double(f)))
                    .ok_or_else(|| unsupported(member, "number out of range"))
            }
        }
        Value::String(s) => Ok(Some(PropertyValue::String(s.clone()))),
        Value::Array(_) | Value::Object(_) => Err(unsupported(
            member,
            "structured value needs a JSON text codec",
        )),
    }
}

fn encode_as(member: &str, value: &Value, kind: ValueKind) -> ModelResult<Option<PropertyValue>> {
    if value.is_null() {
        return Ok(None);
    }
    let encoded = match kind {
        ValueKind::String => value.as_str().map(|s| PropertyValue::String(s.to_string())),
        ValueKind::Int => value.as_i64().map(PropertyValue::Int),
        ValueKind::Double => value.as_f64().map(PropertyValue::Double),
        ValueKind::Bool => value.as_bool().map(PropertyValue::Bool),
        ValueKind::DateTime => value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| PropertyValue::DateTime(t.with_timezone(&Utc))),
        ValueKind::Guid => value
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(PropertyValue::Guid),
        ValueKind::Binary => value.as_array().and_then(|items| {
            items
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(PropertyValue::Binary)
        }),
    };
    encoded
        .map(Some)
        .ok_or_else(|| unsupported(member, format!("value is not a valid {kind}")))
}

fn decode_native(member: &str, value: &PropertyValue) -> ModelResult<Value> {
    Ok(match value {
        PropertyValue::String(s) => Value::String(s.clone()),
        PropertyValue::Int(i) => Value::Number((*i).into()),
        PropertyValue::Double(d) => Number::from_f64(*d)
            .map(Value::Number)
            .ok_or_else(|| unsupported(member, "non-finite double"))?,
        PropertyValue::Bool(b) => Value::Bool(*b),
        PropertyValue::DateTime(t) => {
            Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        PropertyValue::Binary(bytes) => {
            Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect())
        }
        PropertyValue::Guid(g) => Value::String(g.hyphenated().to_string()),
    })
}

impl ValueCodec for InferredCodec {
    fn encode(&self, member: &str, value: &Value) -> ModelResult<Option<PropertyValue>> {
        match self.kind {
            Some(kind) => encode_as(member, value, kind),
            None => infer(member, value),
        }
    }

    fn decode(&self, member: &str, value: &PropertyValue) -> ModelResult<Value> {
        if let Some(kind) = self.kind {
            value.expect_kind(member, kind)?;
        }
        decode_native(member, value)
    }
}

/// Stores any JSON value as its text form in a `String` property.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTextCodec;

impl ValueCodec for JsonTextCodec {
    fn encode(&self, _member: &str, value: &Value) -> ModelResult<Option<PropertyValue>> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(PropertyValue::String(serde_json::to_string(value)?)))
    }

    fn decode(&self, member: &str, value: &PropertyValue) -> ModelResult<Value> {
        let text = value.expect_kind(member, ValueKind::String)?;
        Ok(serde_json::from_str(text.as_str().unwrap_or_default())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Scalar,
    Expanded { prefix: String },
}

/// Conversion contract for one entity member.
#[derive(Clone)]
pub struct Member {
    name: String,
    store_name: String,
    shape: Shape,
    codec: Arc<dyn ValueCodec>,
}

impl Member {
    /// One field stored under its own name with the inferred codec.
    pub fn scalar(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            store_name: name.clone(),
            name,
            shape: Shape::Scalar,
            codec: Arc::new(InferredCodec::default()),
        }
    }

    /// A structured field stored as JSON text.
    pub fn json(name: impl Into<String>) -> Self {
        Self::scalar(name).codec(JsonTextCodec)
    }

    /// A map-shaped field expanded into one property per entry, named
    /// `prefix + entry key`. Entries are stored as JSON text unless another
    /// codec is set.
    pub fn expanded(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            store_name: name.clone(),
            name,
            shape: Shape::Expanded {
                prefix: prefix.into(),
            },
            codec: Arc::new(JsonTextCodec),
        }
    }

    /// Overrides the stored property name (scalar members).
    #[must_use]
    pub fn stored_as(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }

    /// Pins the stored value kind.
    #[must_use]
    pub fn kind(self, kind: ValueKind) -> Self {
        self.codec(InferredCodec::with_kind(kind))
    }

    /// Uses a custom serializer for this member.
    #[must_use]
    pub fn codec(mut self, codec: impl ValueCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored property name; for expanded members, the entry prefix.
    pub fn store_name(&self) -> &str {
        match &self.shape {
            Shape::Scalar => &self.store_name,
            Shape::Expanded { prefix } => prefix,
        }
    }

    pub fn is_expanded(&self) -> bool {
        matches!(self.shape, Shape::Expanded { .. })
    }

    fn write(&self, value: &Value, bag: &mut PropertyBag) -> ModelResult<()> {
        match &self.shape {
            Shape::Scalar => {
                if let Some(encoded) = self.codec.encode(&self.name, value)? {
                    bag.insert(self.store_name.clone(), encoded);
                }
            }
            Shape::Expanded { prefix } => match value {
                Value::Null => {}
                Value::Object(entries) => {
                    for (key, entry) in entries {
                        if let Some(encoded) = self.codec.encode(&self.name, entry)? {
                            bag.insert(format!("{prefix}{key}"), encoded);
                        }
                    }
                }
                _ => return Err(unsupported(&self.name, "expanded member must be a map")),
            },
        }
        Ok(())
    }

    /// Returns `false` for an expanded member with no entries, which is
    /// left out of `out`.
    fn read(&self, bag: &PropertyBag, out: &mut Map<String, Value>) -> bool {
        match &self.shape {
            Shape::Scalar => {
                if let Some(decoded) = bag
                    .get(&self.store_name)
                    .and_then(|v| self.codec.decode(&self.name, v).ok())
                {
                    out.insert(self.name.clone(), decoded);
                }
                true
            }
            Shape::Expanded { prefix } => {
                let entries: Map<String, Value> = bag
                    .prefixed(prefix)
                    .filter(|(key, _)| !key.is_empty())
                    .filter_map(|(key, v)| {
                        self.codec
                            .decode(&self.name, v)
                            .ok()
                            .map(|decoded| (key.to_string(), decoded))
                    })
                    .collect();
                if entries.is_empty() {
                    return false;
                }
                out.insert(self.name.clone(), Value::Object(entries));
                true
            }
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("store_name", &self.store_name())
            .field("expanded", &self.is_expanded())
            .finish()
    }
}

/// Bidirectional converter between `E` and [`PropertyBag`].
pub struct EntityMapper<E> {
    members: Vec<Member>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityMapper<E> {
    fn clone(&self) -> Self {
        Self {
            members: self.members.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for EntityMapper<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMapper")
            .field("members", &self.members)
            .finish()
    }
}

impl<E: Serialize + DeserializeOwned> EntityMapper<E> {
    pub fn builder() -> EntityMapperBuilder<E> {
        EntityMapperBuilder {
            members: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Stored property name for a declared scalar member.
    pub fn store_name(&self, member: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.name == member && !m.is_expanded())
            .map(Member::store_name)
    }

    /// Serializes every declared member into a bag.
    pub fn to_bag(&self, entity: &E) -> ModelResult<PropertyBag> {
        let json = serde_json::to_value(entity)?;
        let Value::Object(fields) = json else {
            return Err(ModelError::NotAnObject(json.to_string()));
        };
        let mut bag = PropertyBag::new();
        for member in &self.members {
            member.write(fields.get(&member.name).unwrap_or(&Value::Null), &mut bag)?;
        }
        Ok(bag)
    }

    /// Rebuilds an entity from a bag, ignoring unclaimed properties.
    ///
    /// An expanded member without entries first reads as absent, so an
    /// optional map comes back as `None`. If the entity then fails to
    /// deserialize, those members are retried as empty maps.
    pub fn from_bag(&self, bag: &PropertyBag) -> ModelResult<E> {
        let mut fields = Map::new();
        let empty: Vec<&str> = self
            .members
            .iter()
            .filter(|member| !member.read(bag, &mut fields))
            .map(|member| member.name.as_str())
            .collect();
        if empty.is_empty() {
            return Ok(serde_json::from_value(Value::Object(fields))?);
        }
        match serde_json::from_value(Value::Object(fields.clone())) {
            Ok(entity) => Ok(entity),
            Err(absent) => {
                for name in empty {
                    fields.insert(name.to_string(), Value::Object(Map::new()));
                }
                serde_json::from_value(Value::Object(fields)).map_err(|_| ModelError::from(absent))
            }
        }
    }

    /// Rewrites member names in a predicate to stored property names.
    /// Unknown members pass through unchanged.
    pub fn translate(&self, predicate: &Predicate) -> Predicate {
        predicate.rename(&|member| {
            self.store_name(member)
                .map_or_else(|| member.to_string(), str::to_string)
        })
    }
}

/// Builder validating member declarations up front.
pub struct EntityMapperBuilder<E> {
    members: Vec<Member>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Serialize + DeserializeOwned> EntityMapperBuilder<E> {
    #[must_use]
    pub fn member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    /// Validates the declarations.
    ///
    /// Fails on duplicate member names, duplicate stored names, and stored
    /// names captured by an expanded member's prefix.
    pub fn build(self) -> ModelResult<EntityMapper<E>> {
        if self.members.is_empty() {
            return Err(ModelError::Configuration("mapper declares no members".into()));
        }
        let mut names = HashSet::new();
        let mut stored = HashSet::new();
        for member in &self.members {
            if !names.insert(member.name.as_str()) {
                return Err(ModelError::Configuration(format!(
                    "member `{}` declared twice",
                    member.name
                )));
            }
            if member.store_name().is_empty() || !stored.insert(member.store_name()) {
                return Err(ModelError::Configuration(format!(
                    "stored name `{}` is empty or already used",
                    member.store_name()
                )));
            }
        }
        for expanded in self.members.iter().filter(|m| m.is_expanded()) {
            let prefix = expanded.store_name();
            if let Some(clash) = self
                .members
                .iter()
                .filter(|m| m.name != expanded.name)
                .find(|m| m.store_name().starts_with(prefix))
            {
                return Err(ModelError::Configuration(format!(
                    "stored name `{}` overlaps expanded prefix `{prefix}`",
                    clash.store_name()
                )));
            }
        }
        Ok(EntityMapper {
            members: self.members,
            _entity: PhantomData,
        })
    }
}

//! Predicate builder and translator.
//!
//! Callers describe lookups with a small composable [`Predicate`] instead of
//! arbitrary expressions. The translator walks it for two purposes:
//! - [`Predicate::assignments`] extracts `member == value` pairs reachable
//!   through conjunctions, which is what key derivation needs
//! - [`Predicate::to_filter`] renders the whole predicate as a store filter
//!
//! Shapes that cannot contribute an assignment (ranges, disjunctions,
//! negations) are skipped rather than rejected; other conjuncts may still
//! address the row.

use entable_types::{PropertyBag, PropertyValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator of a single constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn keyword(self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
            Comparison::Lt => "lt",
            Comparison::Le => "le",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
        }
    }
}

/// A restricted boolean expression over entity members.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        member: String,
        op: Comparison,
        value: PropertyValue,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(member: impl Into<String>, op: Comparison, value: impl Into<PropertyValue>) -> Self {
        Predicate::Compare {
            member: member.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(member: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::compare(member, Comparison::Eq, value)
    }

    pub fn ne(member: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::compare(member, Comparison::Ne, value)
    }

    pub fn gt(member: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::compare(member, Comparison::Gt, value)
    }

    pub fn ge(member: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::compare(member, Comparison::Ge, value)
    }

    pub fn lt(member: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::compare(member, Comparison::Lt, value)
    }

    pub fn le(member: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::compare(member, Comparison::Le, value)
    }

    /// Conjunction; nested `And`s are flattened.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Predicate::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Predicate::And(parts)
    }

    /// Disjunction; nested `Or`s are flattened.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::Or(parts) => parts,
            single => vec![single],
        };
        match other {
            Predicate::Or(more) => parts.extend(more),
            single => parts.push(single),
        }
        Predicate::Or(parts)
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Equality assignments reachable through conjunctions only.
    ///
    /// If a member is assigned twice the first assignment is kept.
    pub fn assignments(&self) -> PropertyBag {
        let mut out = PropertyBag::new();
        self.collect_assignments(&mut out);
        out
    }

    fn collect_assignments(&self, out: &mut PropertyBag) {
        match self {
            Predicate::Compare {
                member,
                op: Comparison::Eq,
                value,
            } => {
                if !out.contains(member) {
                    out.insert(member.clone(), value.clone());
                }
            }
            Predicate::And(parts) => {
                for part in parts {
                    part.collect_assignments(out);
                }
            }
            Predicate::Compare { .. } | Predicate::Or(_) | Predicate::Not(_) => {}
        }
    }

    /// Evaluates the predicate against stored properties.
    ///
    /// A comparison on a missing property, or between incomparable kinds,
    /// is false.
    pub fn matches(&self, bag: &PropertyBag) -> bool {
        match self {
            Predicate::Compare { member, op, value } => bag
                .get(member)
                .and_then(|stored| compare_values(stored, value))
                .is_some_and(|ordering| op.holds(ordering)),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(bag)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(bag)),
            Predicate::Not(inner) => !inner.matches(bag),
        }
    }

    /// Renders an OData-style filter string.
    pub fn to_filter(&self) -> String {
        match self {
            Predicate::Compare { member, op, value } => {
                format!("{member} {} {}", op.keyword(), literal(value))
            }
            Predicate::And(parts) => join(parts, " and "),
            Predicate::Or(parts) => join(parts, " or "),
            Predicate::Not(inner) => format!("not ({})", inner.to_filter()),
        }
    }

    /// Returns a copy with every member name passed through `rename`.
    pub fn rename(&self, rename: &dyn Fn(&str) -> String) -> Predicate {
        match self {
            Predicate::Compare { member, op, value } => Predicate::Compare {
                member: rename(member),
                op: *op,
                value: value.clone(),
            },
            Predicate::And(parts) => Predicate::And(parts.iter().map(|p| p.rename(rename)).collect()),
            Predicate::Or(parts) => Predicate::Or(parts.iter().map(|p| p.rename(rename)).collect()),
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.rename(rename))),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_filter())
    }
}

fn join(parts: &[Predicate], sep: &str) -> String {
    match parts {
        [] => "true".to_string(),
        [single] => single.to_filter(),
        _ => parts
            .iter()
            .map(|p| format!("({})", p.to_filter()))
            .collect::<Vec<_>>()
            .join(sep),
    }
}

fn literal(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        PropertyValue::Int(i) => format!("{i}L"),
        PropertyValue::Double(d) => format!("{d:?}"),
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::DateTime(_) => format!("datetime'{}'", value.to_key_string()),
        PropertyValue::Binary(_) => format!("X'{}'", value.to_key_string()),
        PropertyValue::Guid(g) => format!("guid'{g}'"),
    }
}

fn compare_values(stored: &PropertyValue, wanted: &PropertyValue) -> Option<Ordering> {
    use PropertyValue as V;
    match (stored, wanted) {
        (V::String(a), V::String(b)) => Some(a.cmp(b)),
        (V::Int(a), V::Int(b)) => Some(a.cmp(b)),
        (V::Int(_) | V::Double(_), V::Int(_) | V::Double(_)) => {
            stored.as_f64()?.partial_cmp(&wanted.as_f64()?)
        }
        (V::Bool(a), V::Bool(b)) => Some(a.cmp(b)),
        (V::DateTime(a), V::DateTime(b)) => Some(a.cmp(b)),
        (V::Binary(a), V::Binary(b)) => Some(a.cmp(b)),
        (V::Guid(a), V::Guid(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

//! Core data types: facts, identifiers and comparison operators.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub use reticle_types::FactValue;

/// Unique identifier for facts in working memory
pub type FactId = u64;
/// Index of a node in the network arena
pub type NodeId = usize;
/// Declaration order of a rule in its network
pub type RuleId = usize;
/// Dense partition index, `0..used_partitions`
pub type PartitionId = usize;

/// Object type of the implicit fact every session inserts at construction.
pub const INITIAL_FACT_KIND: &str = "InitialFact";

/// The field payload of a fact
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FactData {
    pub fields: HashMap<String, FactValue>,
}

/// A typed record inserted into working memory.
///
/// `kind` plays the role of the object type: object-type nodes route facts by it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub kind: String,
    pub data: FactData,
}

impl Fact {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), data: FactData::default() }
    }

    /// Builder-style field setter
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FactValue>) -> Self {
        self.data.fields.insert(name.into(), value.into());
        self
    }

    /// Get a field value from this fact
    pub fn get_field(&self, field: &str) -> Option<&FactValue> {
        self.data.fields.get(field)
    }

    pub fn set_field(&mut self, field: impl Into<String>, value: impl Into<FactValue>) {
        self.data.fields.insert(field.into(), value.into());
    }

    /// Build a fact from a JSON object; every member becomes a field.
    pub fn from_json(kind: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("Fact payload must be a JSON object, got {value}"))?;
        let mut fact = Self::new(kind);
        for (name, member) in object {
            fact.data.fields.insert(name.clone(), FactValue::try_from(member)?);
        }
        Ok(fact)
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.data.fields.keys().collect();
        names.sort();
        write!(f, "{}(", self.kind)?;
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={}", self.data.fields[*name])?;
        }
        write!(f, ")")
    }
}

/// Operators for field and join conditions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::LessThan => "<",
            Operator::GreaterThanOrEqual => ">=",
            Operator::LessThanOrEqual => "<=",
            Operator::Contains => "contains",
        };
        write!(f, "{symbol}")
    }
}

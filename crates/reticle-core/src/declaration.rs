//! Declaration tables and the match view handed to constraints and actions.
//!
//! A declaration names either a whole fact or one field of a fact at a given
//! tuple level. Level 0 is the fact that entered through the left input
//! adapter, and every beta node below it adds one level.

use crate::handle::FactHandle;
use crate::types::{Fact, FactId, FactValue};
use std::sync::Arc;

/// One named variable: the fact at `position`, or its `field` when set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub position: usize,
    pub field: Option<String>,
}

/// Ordered declaration table for a rule prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declarations {
    entries: Vec<Declaration>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration; fails when the name is taken
    pub fn declare(
        &mut self,
        name: &str,
        position: usize,
        field: Option<&str>,
    ) -> Result<(), String> {
        if self.get(name).is_some() {
            return Err(format!("Declaration '{name}' is bound twice"));
        }
        self.entries.push(Declaration {
            name: name.to_string(),
            position,
            field: field.map(str::to_string),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.entries.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The facts of one partial or complete match, addressed by declaration name
#[derive(Debug, Clone)]
pub struct Match {
    facts: Vec<Option<FactHandle>>,
    declarations: Arc<Declarations>,
}

impl Match {
    /// `facts[i]` is the handle contributed at tuple level `i`; `None` for
    /// levels produced by `not`/`exists`.
    pub fn new(facts: Vec<Option<FactHandle>>, declarations: Arc<Declarations>) -> Self {
        Self { facts, declarations }
    }

    pub fn handle(&self, name: &str) -> Option<&FactHandle> {
        let declaration = self.declarations.get(name)?;
        self.facts.get(declaration.position)?.as_ref()
    }

    pub fn fact(&self, name: &str) -> Option<&Fact> {
        self.handle(name).map(FactHandle::fact)
    }

    /// Value of a field declaration. Whole-fact declarations have no value.
    pub fn value(&self, name: &str) -> Option<&FactValue> {
        let declaration = self.declarations.get(name)?;
        let field = declaration.field.as_deref()?;
        self.facts.get(declaration.position)?.as_ref()?.fact().get_field(field)
    }

    /// Field of the fact bound to `name`
    pub fn get(&self, name: &str, field: &str) -> Option<&FactValue> {
        self.fact(name)?.get_field(field)
    }

    /// Handle at a tuple level, regardless of declarations
    pub fn at(&self, level: usize) -> Option<&FactHandle> {
        self.facts.get(level)?.as_ref()
    }

    pub fn handles(&self) -> impl Iterator<Item = &FactHandle> {
        self.facts.iter().flatten()
    }

    /// Ids of the application facts in the match; engine-owned facts such
    /// as accumulate results are left out
    pub fn fact_ids(&self) -> Vec<FactId> {
        self.handles().filter(|h| !h.is_engine_owned()).map(FactHandle::id).collect()
    }

    pub fn declarations(&self) -> &Declarations {
        &self.declarations
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

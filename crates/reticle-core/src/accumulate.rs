//! Accumulate functions
//!
//! An accumulate node keeps, per left tuple, the set of right facts matching
//! it and recomputes the aggregate whenever that set changes. The function is
//! pluggable through [`Accumulator`]; [`Aggregate`] covers the usual
//! reductions over one numeric field.

use crate::types::{Fact, FactValue};
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Reduces the facts matched for one left tuple to a single value
pub trait Accumulator: Send + Sync {
    /// `facts` arrive in right-memory insertion order
    fn accumulate(&self, facts: &[&Fact]) -> Result<FactValue>;

    fn share_key(&self) -> Option<String> {
        None
    }
}

/// Built-in aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationType {
    Count,
    Sum,
    Average,
    Min,
    Max,
    StandardDeviation,
    /// All field values, as a list, in match order
    Collect,
}

/// A built-in aggregation over `field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub aggregation: AggregationType,
    pub field: Option<String>,
}

impl Aggregate {
    pub fn count() -> Self {
        Self { aggregation: AggregationType::Count, field: None }
    }

    pub fn sum(field: impl Into<String>) -> Self {
        Self::over(AggregationType::Sum, field)
    }

    pub fn average(field: impl Into<String>) -> Self {
        Self::over(AggregationType::Average, field)
    }

    pub fn min(field: impl Into<String>) -> Self {
        Self::over(AggregationType::Min, field)
    }

    pub fn max(field: impl Into<String>) -> Self {
        Self::over(AggregationType::Max, field)
    }

    pub fn collect(field: impl Into<String>) -> Self {
        Self::over(AggregationType::Collect, field)
    }

    pub fn over(aggregation: AggregationType, field: impl Into<String>) -> Self {
        Self { aggregation, field: Some(field.into()) }
    }

    fn values<'a>(&self, facts: &[&'a Fact]) -> Result<Vec<&'a FactValue>> {
        let field = self
            .field
            .as_deref()
            .ok_or_else(|| anyhow!("{:?} needs a source field", self.aggregation))?;
        facts
            .iter()
            .map(|fact| {
                fact.get_field(field)
                    .ok_or_else(|| anyhow!("{} has no field '{field}' to aggregate", fact.kind))
            })
            .collect()
    }

    fn numbers(&self, facts: &[&Fact]) -> Result<Vec<f64>> {
        self.values(facts)?
            .into_iter()
            .map(|value| {
                value.as_f64().ok_or_else(|| {
                    anyhow!("Cannot aggregate {} value '{value}' numerically", value.type_name())
                })
            })
            .collect()
    }
}

impl Accumulator for Aggregate {
    fn accumulate(&self, facts: &[&Fact]) -> Result<FactValue> {
        #[allow(clippy::cast_precision_loss)]
        let result = match self.aggregation {
            AggregationType::Count => FactValue::Integer(i64::try_from(facts.len())?),
            AggregationType::Sum => {
                let values = self.values(facts)?;
                if values.iter().all(|v| matches!(v, FactValue::Integer(_))) {
                    let mut total: i64 = 0;
                    for value in values {
                        if let FactValue::Integer(i) = value {
                            total = total
                                .checked_add(*i)
                                .ok_or_else(|| anyhow!("Integer overflow in sum"))?;
                        }
                    }
                    FactValue::Integer(total)
                } else {
                    FactValue::Float(self.numbers(facts)?.iter().sum())
                }
            }
            AggregationType::Average => {
                let numbers = self.numbers(facts)?;
                if numbers.is_empty() {
                    FactValue::Null
                } else {
                    FactValue::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            AggregationType::Min | AggregationType::Max => {
                let wanted = if self.aggregation == AggregationType::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let mut best: Option<&FactValue> = None;
                for value in self.values(facts)? {
                    best = match best {
                        None => Some(value),
                        Some(current) => match value.partial_cmp(current) {
                            Some(ordering) if ordering == wanted => Some(value),
                            Some(_) => Some(current),
                            None => bail!(
                                "Cannot compare {} with {}",
                                value.type_name(),
                                current.type_name()
                            ),
                        },
                    };
                }
                best.cloned().unwrap_or(FactValue::Null)
            }
            AggregationType::StandardDeviation => {
                let numbers = self.numbers(facts)?;
                if numbers.is_empty() {
                    FactValue::Null
                } else {
                    let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                    let variance = numbers.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                        / numbers.len() as f64;
                    FactValue::Float(variance.sqrt())
                }
            }
            AggregationType::Collect => {
                FactValue::List(self.values(facts)?.into_iter().cloned().collect())
            }
        };
        Ok(result)
    }

    fn share_key(&self) -> Option<String> {
        Some(format!("{:?}({})", self.aggregation, self.field.as_deref().unwrap_or("")))
    }
}

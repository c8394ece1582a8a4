//! Structured error handling for the Reticle engine
//!
//! Collaborator callbacks (constraints, actions, accumulators and async
//! computations) report failures as `anyhow::Error`. The engine converts them
//! at the node boundary into [`ReticleError`] values carrying the rule, node
//! and fact identities involved, so a fire-loop caller can tell exactly which
//! match failed.

use crate::types::{FactId, NodeId, PartitionId};
use std::fmt;
use thiserror::Error;

/// Error type for every fallible engine operation
#[derive(Error, Debug, Clone)]
pub enum ReticleError {
    /// Malformed rule wiring detected while attaching a rule to the network
    #[error("Build error: {message}")]
    Build { message: String, rule_name: Option<String>, node_id: Option<NodeId> },

    /// A constraint, action or accumulator failed while evaluating a match
    #[error("Evaluation error: {message}")]
    Evaluation {
        message: String,
        rule_name: Option<String>,
        node_id: Option<NodeId>,
        fact_ids: Vec<FactId>,
    },

    /// A partition was touched from a thread that does not own it
    #[error("Concurrency violation: {message}")]
    ConcurrencyViolation { message: String, partition: Option<PartitionId>, thread: Option<String> },

    /// An offloaded async computation failed
    #[error("Async delivery error: {message}")]
    AsyncDelivery { message: String, message_id: Option<String>, rule_name: Option<String> },

    /// Misuse of the session control surface (unknown fact, disposed session)
    #[error("Session error: {message}")]
    Session { message: String, operation: Option<String>, fact_id: Option<FactId> },

    /// Configuration and initialization errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        setting: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String, component: Option<String> },
}

impl ReticleError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ReticleError::Build { .. } => "build",
            ReticleError::Evaluation { .. } => "evaluation",
            ReticleError::ConcurrencyViolation { .. } => "concurrency",
            ReticleError::AsyncDelivery { .. } => "async_delivery",
            ReticleError::Session { .. } => "session",
            ReticleError::Configuration { .. } => "configuration",
            ReticleError::Internal { .. } => "internal",
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ReticleError::Build { .. } => ErrorSeverity::Medium,
            ReticleError::Evaluation { .. } => ErrorSeverity::High,
            ReticleError::ConcurrencyViolation { .. } => ErrorSeverity::Critical,
            ReticleError::AsyncDelivery { .. } => ErrorSeverity::Medium,
            ReticleError::Session { .. } => ErrorSeverity::Low,
            ReticleError::Configuration { .. } => ErrorSeverity::Critical,
            ReticleError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// Get structured context information for debugging
    pub fn context(&self) -> ErrorContext {
        match self {
            ReticleError::Build { rule_name, node_id, .. } => ErrorContext {
                rule_name: rule_name.clone(),
                node_id: *node_id,
                ..Default::default()
            },
            ReticleError::Evaluation { rule_name, node_id, fact_ids, .. } => ErrorContext {
                rule_name: rule_name.clone(),
                node_id: *node_id,
                fact_ids: fact_ids.clone(),
                ..Default::default()
            },
            ReticleError::ConcurrencyViolation { partition, .. } => {
                ErrorContext { partition: *partition, ..Default::default() }
            }
            ReticleError::AsyncDelivery { message_id, rule_name, .. } => ErrorContext {
                rule_name: rule_name.clone(),
                message_id: message_id.clone(),
                ..Default::default()
            },
            ReticleError::Session { operation, fact_id, .. } => ErrorContext {
                operation: operation.clone(),
                fact_ids: fact_id.iter().copied().collect(),
                ..Default::default()
            },
            ReticleError::Configuration { setting, .. } => {
                ErrorContext { setting: setting.clone(), ..Default::default() }
            }
            ReticleError::Internal { .. } => ErrorContext::default(),
        }
    }

    /// Check if the session can keep being used after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReticleError::Build { .. } => true,
            ReticleError::Evaluation { .. } => true,
            ReticleError::ConcurrencyViolation { .. } => true,
            ReticleError::AsyncDelivery { .. } => true,
            ReticleError::Session { .. } => true,
            ReticleError::Configuration { .. } => false,
            ReticleError::Internal { .. } => false,
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Structured error context for debugging and telemetry
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ErrorContext {
    pub rule_name: Option<String>,
    pub node_id: Option<NodeId>,
    pub fact_ids: Vec<FactId>,
    pub partition: Option<PartitionId>,
    pub message_id: Option<String>,
    pub operation: Option<String>,
    pub setting: Option<String>,
}

/// Result type alias for engine operations
pub type ReticleResult<T> = Result<T, ReticleError>;

/// Convenience constructors for common error scenarios
impl ReticleError {
    /// Create a build error for a named rule
    pub fn build(rule_name: &str, message: impl Into<String>) -> Self {
        Self::Build { message: message.into(), rule_name: Some(rule_name.to_string()), node_id: None }
    }

    /// Build error raised before the owning rule is known; callers add it
    /// with [`ResultExt::with_rule_context`]
    pub fn rule_build(message: impl Into<String>) -> Self {
        Self::Build { message: message.into(), rule_name: None, node_id: None }
    }

    /// Create an evaluation error from a failed collaborator callback
    pub fn evaluation(
        rule_name: Option<&str>,
        node_id: NodeId,
        fact_ids: Vec<FactId>,
        source: &anyhow::Error,
    ) -> Self {
        Self::Evaluation {
            message: format!("{source:#}"),
            rule_name: rule_name.map(str::to_string),
            node_id: Some(node_id),
            fact_ids,
        }
    }

    /// Create a concurrency violation for a partition
    pub fn concurrency(partition: PartitionId, message: impl Into<String>) -> Self {
        Self::ConcurrencyViolation {
            message: message.into(),
            partition: Some(partition),
            thread: std::thread::current().name().map(str::to_string),
        }
    }

    /// Create a concurrency violation that is not tied to one partition
    pub fn concurrent_firing(message: impl Into<String>) -> Self {
        Self::ConcurrencyViolation {
            message: message.into(),
            partition: None,
            thread: std::thread::current().name().map(str::to_string),
        }
    }

    /// Create an async delivery error
    pub fn async_delivery(message_id: &str, rule_name: &str, message: impl Into<String>) -> Self {
        Self::AsyncDelivery {
            message: message.into(),
            message_id: Some(message_id.to_string()),
            rule_name: Some(rule_name.to_string()),
        }
    }

    /// Create a session error
    pub fn session(operation: &str, message: impl Into<String>) -> Self {
        Self::Session { message: message.into(), operation: Some(operation.to_string()), fact_id: None }
    }

    /// Create a session error for a specific fact
    pub fn unknown_fact(operation: &str, fact_id: FactId) -> Self {
        Self::Session {
            message: format!("Fact {fact_id} is not in working memory"),
            operation: Some(operation.to_string()),
            fact_id: Some(fact_id),
        }
    }

    /// Create a configuration error
    pub fn configuration(
        setting: &str,
        expected: &str,
        actual: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            setting: Some(setting.to_string()),
            expected: Some(expected.to_string()),
            actual: Some(actual.to_string()),
        }
    }

    /// Create an internal error with component context
    pub fn internal_component(component: &str, message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), component: Some(component.to_string()) }
    }

    /// Create a generic internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), component: None }
    }
}

/// Convert from anyhow::Error to ReticleError
impl From<anyhow::Error> for ReticleError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(reticle_err) = err.downcast_ref::<ReticleError>() {
            return reticle_err.clone();
        }
        ReticleError::internal(format!("Unhandled error: {err:#}"))
    }
}

impl From<serde_yaml::Error> for ReticleError {
    fn from(err: serde_yaml::Error) -> Self {
        ReticleError::Configuration {
            message: format!("YAML error: {err}"),
            setting: None,
            expected: Some("valid engine configuration".to_string()),
            actual: err.location().map(|loc| format!("line {}, column {}", loc.line(), loc.column())),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add rule context to an error
    fn with_rule_context(self, rule_name: &str) -> ReticleResult<T>;
}

impl<T> ResultExt<T> for ReticleResult<T> {
    fn with_rule_context(self, rule_name: &str) -> ReticleResult<T> {
        self.map_err(|mut err| {
            match &mut err {
                ReticleError::Build { rule_name: name, .. }
                | ReticleError::Evaluation { rule_name: name, .. }
                | ReticleError::AsyncDelivery { rule_name: name, .. } => {
                    *name = Some(rule_name.to_string());
                }
                _ => {}
            }
            err
        })
    }
}

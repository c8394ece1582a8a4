#![deny(warnings)]
#![allow(missing_docs)]
//! Core of the Reticle incremental rule engine.
//!
//! Rules are compiled into a shared match network of object-type, alpha and
//! beta nodes. A [`Session`] keeps working memory over that network and
//! evaluates it lazily: nodes are grouped into segments whose link bits
//! record which inputs hold data, and a rule is only evaluated once every
//! segment on its path is linked. Rules can be spread over partitions that
//! evaluate on their own threads, and rules can hand work to an async
//! worker pool whose results re-enter the network as messages.

use tracing::{debug, instrument};

/// Accumulate functions
pub mod accumulate;
/// Rule consequences and their session handle
pub mod action;
/// Conflict resolution and the pending activation queue
pub mod agenda;
/// Engine configuration
pub mod config;
/// Alpha and beta constraint interfaces
pub mod constraint;
/// Declarations and matches
pub mod declaration;
/// Error types
pub mod error;
/// Async send/receive message exchange
pub mod exchange;
/// Fact handles
pub mod handle;
/// Node memories
pub mod memory;
/// Network construction and layout
pub mod network;
/// Per-partition evaluation
pub mod partition;
/// Propagation queues and quiescence tracking
pub mod propagation;
/// Rule definitions
pub mod rule;
/// Segment and path link state
pub mod segment;
/// Sessions and working memory
pub mod session;
/// Left tuples
pub mod tuple;
/// Facts, identifiers and operators
pub mod types;

pub use accumulate::{Accumulator, Aggregate, AggregationType};
pub use action::{Action, ActionContext, ActionFn};
pub use config::EngineConfig;
pub use constraint::{AlphaConstraint, AlphaFn, BetaConstraint, BetaFn, FieldConstraint, JoinCondition};
pub use declaration::Match;
pub use error::{ReticleError, ReticleResult};
pub use exchange::{AsyncComputation, MessageCoordinator, SendFilter};
pub use handle::FactHandle;
pub use network::{Network, NetworkBuilder};
pub use partition::{ActivationInfo, PartitionStats};
pub use rule::{AccumulateSpec, Pattern, ReceiveSpec, RuleDefinition, SendSpec};
pub use session::{Globals, Session, SessionStats};
pub use types::{Fact, FactData, FactId, FactValue, Operator};

/// Initialize the engine components
#[instrument]
pub fn init() -> anyhow::Result<()> {
    debug!("Initializing Reticle core engine");
    Ok(())
}

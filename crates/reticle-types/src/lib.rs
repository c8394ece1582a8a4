//! Reticle Types
//!
//! Value types shared by the Reticle crates. Facts carry named fields whose
//! values are [`FactValue`]s; join indexes key on them, so the type provides
//! total hashing and equality on top of the usual conversions.

#![deny(warnings)]
#![deny(clippy::all)]
#![warn(missing_docs)]

mod value;
pub use value::FactValue;

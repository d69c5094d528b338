//! `capabilities` crate — the `StepCapability` trait and built-in implementations.
//!
//! Every step type must be backed by a [`StepCapability`]. The engine crate
//! looks one up by type tag and dispatches execution through the trait object;
//! it never interprets what a step computes.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod traits;

pub use builtin::CopyCollection;
pub use error::StepError;
pub use traits::{ExecutionContext, StepCapability};

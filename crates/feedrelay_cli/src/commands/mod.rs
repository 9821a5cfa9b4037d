//! CLI command implementations.

pub mod checkpoint;
pub mod run;
pub mod validate;

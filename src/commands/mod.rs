//! CLI command implementations.
//!
//! Each submodule keeps its formatting pure so output can be tested
//! without touching stdout.

pub mod exec;
pub mod info;

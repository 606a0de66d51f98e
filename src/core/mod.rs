//! Core logic — types, parsing, resolution, orchestration, deployment.

pub mod deploy;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod resolver;
pub mod template;
pub mod types;

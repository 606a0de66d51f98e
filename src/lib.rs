//! Stratus — incremental cloud image baking and stack deployment.
//!
//! Phases are content-addressed with BLAKE3; baked images carry their phase
//! prefix identity as tags, so resolution, build resumption, and dedup all
//! work from remote state alone.

pub mod cli;
pub mod cloud;
pub mod core;

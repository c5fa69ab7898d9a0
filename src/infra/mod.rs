//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod git;
pub mod lock;
pub mod renderer;
pub mod telemetry;

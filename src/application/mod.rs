//! Application services: materialization, serialized conversion and the preview boundary.

pub mod convert;
pub mod error;
pub mod materialize;
pub mod preview;

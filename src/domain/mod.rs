//! Domain layer types and invariants.

pub mod error;
pub mod reference;

pub use error::{ConversionError, RenderFailure};
pub use reference::{FileReference, ReferenceError, Revision};
